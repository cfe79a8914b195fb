pub mod engine;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod storage;
pub mod types;
mod validate;
pub mod window;

pub use engine::EngineConfig;
pub use logging::{LogFormat, LoggingConfig};
pub use metrics::MetricsConfig;
pub use pipeline::{AccumulatorConfig, FilterConfig, PipelineConfig, QueueConfig};
pub use storage::{
    CheckpointConfig, DeadLetterConfig, ShutdownConfig, SinkConfig, SourceConfig,
};
pub use types::{BackpressureStrategy, HumanDuration, LateDataPolicy, WindowKind};
pub use window::WindowConfig;
