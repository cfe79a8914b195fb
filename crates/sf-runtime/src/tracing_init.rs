use std::fmt::{self as stdfmt, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{DefaultFields, Writer};
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormattedFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use sf_config::{LogFormat, LoggingConfig};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

// ---------------------------------------------------------------------------
// FileFields — keeps span field caches of the file layer separate
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FileFields(DefaultFields);

impl<'writer> fmt::FormatFields<'writer> for FileFields {
    fn format_fields<R: tracing_subscriber::field::RecordFields>(
        &self,
        writer: Writer<'writer>,
        fields: R,
    ) -> stdfmt::Result {
        self.0.format_fields(writer, fields)
    }
}

// ---------------------------------------------------------------------------
// DomainFormat — `[domain]` prefix for plain output
// ---------------------------------------------------------------------------

/// Plain-text event format that lifts the `domain` field into a prefix:
///
/// ```text
/// 2026-10-16T08:01:02Z  INFO [store] checkpoint written id=12 windows=40
/// ```
///
/// Events from dependencies have no domain and get no prefix.
struct DomainFormat {
    timer: SystemTime,
}

impl DomainFormat {
    fn new() -> Self {
        Self { timer: SystemTime }
    }
}

fn level_colour(level: Level) -> &'static str {
    match level {
        Level::ERROR => "31",
        Level::WARN => "33",
        Level::INFO => "32",
        Level::DEBUG => "34",
        Level::TRACE => "35",
    }
}

/// Write `text` wrapped in an SGR sequence when the writer supports ANSI.
fn styled(writer: &mut Writer<'_>, ansi: bool, sgr: &str, text: impl stdfmt::Display) -> stdfmt::Result {
    if ansi {
        write!(writer, "\x1b[{sgr}m{text}\x1b[0m")
    } else {
        write!(writer, "{text}")
    }
}

impl<S, N> FormatEvent<S, N> for DomainFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> fmt::FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        let ansi = writer.has_ansi_escapes();

        let mut ts = String::new();
        if self.timer.format_time(&mut Writer::new(&mut ts)).is_err() {
            ts.push_str("<unknown time>");
        }
        styled(&mut writer, ansi, "2", ts)?;

        let level = *event.metadata().level();
        writer.write_char(' ')?;
        styled(&mut writer, ansi, level_colour(level), format_args!("{level:>5}"))?;
        writer.write_char(' ')?;

        let mut fields = FieldSplitter::default();
        event.record(&mut fields);

        if let Some(domain) = &fields.domain {
            styled(&mut writer, ansi, "1;36", format_args!("[{domain}]"))?;
            writer.write_char(' ')?;
        }

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                styled(&mut writer, ansi, "1", span.name())?;
                let ext = span.extensions();
                match ext.get::<FormattedFields<N>>() {
                    Some(f) if !f.is_empty() => write!(writer, "{{{f}}}: ")?,
                    _ => write!(writer, ": ")?,
                }
            }
        }

        write!(writer, "{}", fields.message)?;
        if !fields.rest.is_empty() {
            writer.write_char(' ')?;
            styled(&mut writer, ansi, "3", &fields.rest)?;
        }
        writeln!(writer)
    }
}

// ---------------------------------------------------------------------------
// FieldSplitter — pulls `domain` and `message` out of the field list
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FieldSplitter {
    domain: Option<String>,
    message: String,
    rest: String,
}

impl FieldSplitter {
    fn push(&mut self, name: &str, value: impl stdfmt::Display) {
        if !self.rest.is_empty() {
            self.rest.push(' ');
        }
        write!(&mut self.rest, "{name}={value}").ok();
    }
}

impl Visit for FieldSplitter {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "domain" => self.domain = Some(value.to_string()),
            "message" => self.message = value.to_string(),
            name => self.push(name, format_args!("{value:?}")),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn stdfmt::Debug) {
        match field.name() {
            "domain" => {
                self.domain = Some(format!("{value:?}").trim_matches('"').to_string());
            }
            "message" => {
                write!(&mut self.message, "{value:?}").ok();
            }
            name => self.push(name, format_args!("{value:?}")),
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field.name(), value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field.name(), value);
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field.name(), value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field.name(), value);
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// `RUST_LOG` wins over the configured level and per-module overrides.
fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if std::env::var("RUST_LOG").is_ok() {
        return Ok(EnvFilter::from_default_env());
    }
    let mut directives = config.level.clone();
    let mut modules: Vec<_> = config.modules.iter().collect();
    modules.sort();
    for (module, level) in modules {
        write!(&mut directives, ",{module}={level}").ok();
    }
    EnvFilter::try_new(&directives).with_context(|| format!("invalid log filter '{directives}'"))
}

fn resolve_log_file(file: &Path, base_dir: &Path) -> Result<(PathBuf, std::ffi::OsString)> {
    let resolved = if file.is_relative() {
        base_dir.join(file)
    } else {
        file.to_path_buf()
    };
    let name = resolved
        .file_name()
        .context("log file path has no file name")?
        .to_os_string();
    let dir = resolved
        .parent()
        .context("log file path has no parent directory")?
        .to_path_buf();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create log directory {}", dir.display()))?;
    Ok((dir, name))
}

fn stderr_layer(format: LogFormat) -> BoxedLayer {
    match format {
        // JSON keeps `domain` as an ordinary key for log pipelines.
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Plain => fmt::layer()
            .event_format(DomainFormat::new())
            .with_writer(std::io::stderr)
            .boxed(),
    }
}

fn file_layer(format: LogFormat, writer: tracing_appender::non_blocking::NonBlocking) -> BoxedLayer {
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .fmt_fields(FileFields::default())
            .with_target(false)
            .with_ansi(false)
            .with_writer(writer)
            .boxed(),
        LogFormat::Plain => fmt::layer()
            .event_format(DomainFormat::new())
            .fmt_fields(FileFields::default())
            .with_ansi(false)
            .with_writer(writer)
            .boxed(),
    }
}

/// Install the global subscriber described by `config`.
///
/// The returned [`WorkerGuard`] flushes the log file when dropped and must
/// be held until the process exits. `log` records from `sf-core` reach
/// tracing through `tracing-subscriber`'s `tracing-log` bridge.
pub fn init_tracing(config: &LoggingConfig, base_dir: &Path) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config)?;

    let mut layers: Vec<BoxedLayer> = vec![stderr_layer(config.format)];
    let mut guard = None;
    if let Some(file) = &config.file {
        let (dir, name) = resolve_log_file(file, base_dir)?;
        let (writer, file_guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
        layers.push(file_layer(config.format, writer));
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("install tracing subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn module_overrides_are_appended_in_order() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "warn".into(),
            modules: HashMap::from([
                ("sf_runtime".to_string(), "debug".to_string()),
                ("sf_core::checkpoint".to_string(), "trace".to_string()),
            ]),
            file: None,
            format: LogFormat::Plain,
        };
        let filter = build_filter(&config).unwrap().to_string();
        assert!(filter.contains("sf_core::checkpoint=trace"));
        assert!(filter.contains("sf_runtime=debug"));
        assert!(filter.contains("warn"));
    }

    #[test]
    fn bad_level_is_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "info,=[".into(),
            ..LoggingConfig::default()
        };
        assert!(build_filter(&config).is_err());
    }

    #[test]
    fn relative_log_file_resolves_against_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (parent, name) = resolve_log_file(Path::new("logs/engine.log"), dir.path()).unwrap();
        assert_eq!(parent, dir.path().join("logs"));
        assert_eq!(name, "engine.log");
        assert!(parent.is_dir());
    }
}
