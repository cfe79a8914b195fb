mod stages;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sf_config::PipelineConfig;

use crate::record::{QueuedRecord, Record};
use crate::retry::RetryPolicy;

pub use stages::{
    EnrichStage, FieldEqualsFilter, FnStage, ParseStage, RequiredFieldsValidator, SchemaValidator,
};

// ---------------------------------------------------------------------------
// StageError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageErrorKind {
    /// Transient failure; the stage may succeed if re-attempted.
    Retryable,
    /// The record itself is bad; re-attempting cannot help.
    Permanent,
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => f.write_str("retryable"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

/// Per-record transform failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == StageErrorKind::Retryable
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One step of the transform pipeline.
///
/// `Ok(Some(r))` passes `r` to the next stage, `Ok(None)` filters the record
/// out, and `Err` fails it.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, record: &Record) -> Result<Option<Record>, StageError>;
}

// ---------------------------------------------------------------------------
// TransformPipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    Emit(Record),
    Filtered {
        stage: String,
    },
    /// The record must go to the dead-letter handler. `record` is the
    /// original input and `retry_count` includes attempts from earlier
    /// resubmissions.
    Failed {
        record: Record,
        stage: String,
        error: StageError,
        retry_count: u32,
    },
}

/// Outcome of one pass plus the in-place retries it took.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformReport {
    pub outcome: TransformOutcome,
    pub retries: u32,
}

/// Ordered stages applied sequentially to each record. The pipeline is
/// shared by all workers; concurrency comes from running it on many records
/// at once.
#[derive(Clone)]
pub struct TransformPipeline {
    stages: Vec<Arc<dyn Stage>>,
    retry: RetryPolicy,
}

impl fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformPipeline")
            .field("stages", &self.stage_names())
            .field("retry", &self.retry)
            .finish()
    }
}

impl TransformPipeline {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            stages: Vec::new(),
            retry,
        }
    }

    /// Build the configured stage chain: parse → filter → enrich.
    pub fn from_config(
        config: &PipelineConfig,
        validator: Option<Arc<dyn SchemaValidator>>,
    ) -> Self {
        let retry = RetryPolicy::new(
            config.max_retries,
            config.retry_base.as_duration(),
            config.retry_max.as_duration(),
        );
        let mut pipeline = Self::new(retry)
            .with_stage(ParseStage::new(config.required_fields.clone(), validator));
        if let Some(filter) = &config.filter {
            pipeline = pipeline.with_stage(FieldEqualsFilter::new(&filter.field, &filter.equals));
        }
        if !config.enrich.is_empty() {
            pipeline = pipeline.with_stage(EnrichStage::new(config.enrich.clone()));
        }
        pipeline
    }

    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Run every stage over `item`, re-attempting retryable failures in
    /// place with exponential backoff. The retry budget counts attempts the
    /// record already used before a resubmission.
    pub async fn process(&self, item: &QueuedRecord) -> TransformReport {
        let mut current = item.record.clone();
        let mut retries = 0u32;

        for stage in &self.stages {
            let mut attempt = 0u32;
            loop {
                match stage.apply(&current).await {
                    Ok(Some(next)) => {
                        current = next;
                        break;
                    }
                    Ok(None) => {
                        log::trace!(
                            "record {} filtered by stage {}",
                            item.record.position,
                            stage.name()
                        );
                        return TransformReport {
                            outcome: TransformOutcome::Filtered {
                                stage: stage.name().to_string(),
                            },
                            retries,
                        };
                    }
                    Err(error)
                        if error.is_retryable() && self.retry.allows(item.retry_count + retries) =>
                    {
                        let delay = self.retry.delay(item.retry_count + retries);
                        log::debug!(
                            "stage {} failed for record {} (attempt {}), retrying in {:?}: {}",
                            stage.name(),
                            item.record.position,
                            attempt + 1,
                            delay,
                            error
                        );
                        attempt += 1;
                        retries += 1;
                        tokio::time::sleep(delay).await;
                    }
                    Err(error) => {
                        return TransformReport {
                            outcome: TransformOutcome::Failed {
                                record: item.record.clone(),
                                stage: stage.name().to_string(),
                                error,
                                retry_count: item.retry_count + retries,
                            },
                            retries,
                        };
                    }
                }
            }
        }

        TransformReport {
            outcome: TransformOutcome::Emit(current),
            retries,
        }
    }
}
