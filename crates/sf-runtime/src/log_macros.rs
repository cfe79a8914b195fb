//! Logging macros that tag every event with a `domain` field.
//!
//! Domains: `sys` (lifecycle), `pipe` (per-record flow), `res` (resources and
//! metrics), `conf` (configuration), `store` (checkpoints, sinks and the
//! dead-letter store).
//!
//! ```ignore
//! sf_info!(sys, partitions = 4, "pipeline started");
//! sf_warn!(store, error = %e, "checkpoint write failed");
//! ```
//!
//! The domain is a bare identifier, not a string literal.

#[doc(hidden)]
macro_rules! sf_log {
    ($level:ident, $domain:ident, $($field:tt)*) => {
        tracing::$level!(domain = stringify!($domain), $($field)*)
    };
}

macro_rules! sf_error {
    ($domain:ident, $($rest:tt)*) => {
        sf_log!(error, $domain, $($rest)*)
    };
}

macro_rules! sf_warn {
    ($domain:ident, $($rest:tt)*) => {
        sf_log!(warn, $domain, $($rest)*)
    };
}

macro_rules! sf_info {
    ($domain:ident, $($rest:tt)*) => {
        sf_log!(info, $domain, $($rest)*)
    };
}

macro_rules! sf_debug {
    ($domain:ident, $($rest:tt)*) => {
        sf_log!(debug, $domain, $($rest)*)
    };
}

#[allow(unused_macros)]
macro_rules! sf_trace {
    ($domain:ident, $($rest:tt)*) => {
        sf_log!(trace, $domain, $($rest)*)
    };
}
