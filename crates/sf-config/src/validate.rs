use crate::engine::EngineConfig;
use crate::types::LateDataPolicy;

/// Accumulator kinds that read a numeric or string payload field.
const FIELD_ACCUMULATORS: &[&str] = &["sum", "avg", "min", "max", "set"];

/// Internal validation, called automatically during `EngineConfig::from_str` / `load`.
pub(crate) fn validate(config: &EngineConfig) -> anyhow::Result<()> {
    if config.queue.capacity == 0 {
        anyhow::bail!("queue.capacity must be > 0");
    }

    if config.pipeline.parallelism == 0 {
        anyhow::bail!("pipeline.parallelism must be > 0");
    }
    if config.pipeline.poll_batch_size == 0 {
        anyhow::bail!("pipeline.poll_batch_size must be > 0");
    }
    if config.pipeline.retry_base > config.pipeline.retry_max {
        anyhow::bail!(
            "pipeline.retry_base ({}) exceeds pipeline.retry_max ({})",
            config.pipeline.retry_base,
            config.pipeline.retry_max,
        );
    }
    if let Some(filter) = &config.pipeline.filter {
        if filter.field.is_empty() {
            anyhow::bail!("pipeline.filter.field must not be empty");
        }
    }

    if config.accumulator.kind.is_empty() {
        anyhow::bail!("accumulator.kind must not be empty");
    }
    if FIELD_ACCUMULATORS.contains(&config.accumulator.kind.as_str())
        && config.accumulator.field.is_none()
    {
        anyhow::bail!(
            "accumulator.field is required for accumulator.kind = {:?}",
            config.accumulator.kind,
        );
    }

    if config.checkpoint.interval.is_zero() {
        anyhow::bail!("checkpoint.interval must be > 0");
    }
    if config.checkpoint.retain == 0 {
        anyhow::bail!("checkpoint.retain must be >= 1");
    }

    if config.sink.batch_size == 0 {
        anyhow::bail!("sink.batch_size must be > 0");
    }
    if config.sink.fanout == 0 {
        anyhow::bail!("sink.fanout must be > 0");
    }
    if config.window.late_data_policy == LateDataPolicy::Correct && config.sink.late_path.is_none()
    {
        anyhow::bail!("sink.late_path is required when window.late_data_policy = \"correct\"");
    }

    if config.dead_letter.persist_retries == 0 {
        anyhow::bail!("dead_letter.persist_retries must be >= 1");
    }

    if config.source.partitions == 0 {
        anyhow::bail!("source.partitions must be > 0");
    }

    if config.metrics.enabled && config.metrics.report_interval.is_zero() {
        anyhow::bail!("metrics.report_interval must be > 0 when metrics are enabled");
    }

    Ok(())
}
