#[macro_use]
mod log_macros;

mod checkpoint_task;
mod closer_task;
mod context;
mod dead_letter_task;
pub mod error;
pub mod lifecycle;
pub mod metrics;
mod source_task;
pub mod tracing_init;
mod worker_task;
