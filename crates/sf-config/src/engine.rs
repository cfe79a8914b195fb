use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::logging::LoggingConfig;
use crate::metrics::MetricsConfig;
use crate::pipeline::{AccumulatorConfig, PipelineConfig, QueueConfig};
use crate::storage::{
    CheckpointConfig, DeadLetterConfig, ShutdownConfig, SinkConfig, SourceConfig,
};
use crate::validate;
use crate::window::{WindowConfig, WindowSection};

// ---------------------------------------------------------------------------
// Raw TOML structure (intermediate representation)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EngineConfigRaw {
    window: WindowSection,
    queue: QueueConfig,
    pipeline: PipelineConfig,
    accumulator: AccumulatorConfig,
    checkpoint: CheckpointConfig,
    sink: SinkConfig,
    dead_letter: DeadLetterConfig,
    source: SourceConfig,
    #[serde(default)]
    shutdown: ShutdownConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

// ---------------------------------------------------------------------------
// EngineConfig (resolved, validated)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub window: WindowConfig,
    pub queue: QueueConfig,
    pub pipeline: PipelineConfig,
    pub accumulator: AccumulatorConfig,
    pub checkpoint: CheckpointConfig,
    pub sink: SinkConfig,
    pub dead_letter: DeadLetterConfig,
    pub source: SourceConfig,
    pub shutdown: ShutdownConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl EngineConfig {
    /// Read and parse a `streamfold.toml` file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.as_ref().display()))?;
        content.parse()
    }

    /// Rewrite every relative file path against `base_dir` (normally the
    /// config file's parent directory).
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base_dir.join(&*p);
            }
        };
        rebase(&mut self.checkpoint.dir);
        rebase(&mut self.sink.path);
        if let Some(late) = self.sink.late_path.as_mut() {
            rebase(late);
        }
        rebase(&mut self.dead_letter.path);
        rebase(&mut self.source.path);
    }
}

impl FromStr for EngineConfig {
    type Err = anyhow::Error;

    /// Parse a TOML string into a resolved, validated [`EngineConfig`].
    fn from_str(toml_str: &str) -> anyhow::Result<Self> {
        let raw: EngineConfigRaw = toml::from_str(toml_str)?;

        let config = EngineConfig {
            window: raw.window.resolve()?,
            queue: raw.queue,
            pipeline: raw.pipeline,
            accumulator: raw.accumulator,
            checkpoint: raw.checkpoint,
            sink: raw.sink,
            dead_letter: raw.dead_letter,
            source: raw.source,
            shutdown: raw.shutdown,
            logging: raw.logging,
            metrics: raw.metrics,
        };

        validate::validate(&config)?;

        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
