mod file;
mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orion_error::prelude::*;
use sf_config::SinkConfig;

use crate::error::{CoreReason, CoreResult};
use crate::record::WindowResult;
use crate::retry::RetryPolicy;

pub use file::FileSink;
pub use memory::MemorySink;

/// Output destination for finalized window results.
///
/// A batch is written as a unit: `Ok` means every result in it is durable
/// downstream. Implementations may see the same batch more than once.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write(&self, batch: &[WindowResult]) -> anyhow::Result<()>;
}

/// Outcome of a batch that eventually reached the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    pub attempts: u32,
}

/// Writes batches to a [`Sink`], retrying failures with exponential backoff.
#[derive(Clone)]
pub struct SinkWriter {
    sink: Arc<dyn Sink>,
    retry: RetryPolicy,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn Sink>, retry: RetryPolicy) -> Self {
        Self { sink, retry }
    }

    pub fn from_config(config: &SinkConfig, sink: Arc<dyn Sink>) -> Self {
        Self::new(
            sink,
            RetryPolicy::new(
                config.max_retries,
                config.retry_base.as_duration(),
                Duration::from_secs(30),
            ),
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Write `batch`, retrying up to the policy's budget. An exhausted
    /// batch comes back as a [`CoreReason::Sink`] error; the caller owns
    /// dead-lettering it.
    pub async fn write_batch(&self, batch: &[WindowResult]) -> CoreResult<WriteReport> {
        let mut retries = 0u32;
        loop {
            match self.sink.write(batch).await {
                Ok(()) => {
                    return Ok(WriteReport {
                        attempts: retries + 1,
                    });
                }
                Err(e) if self.retry.allows(retries) => {
                    let delay = self.retry.delay(retries);
                    log::warn!(
                        "sink write of {} results failed (attempt {}), retrying in {delay:?}: {e:#}",
                        batch.len(),
                        retries + 1
                    );
                    retries += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return StructError::from(CoreReason::Sink)
                        .with_detail(format!(
                            "batch of {} results failed after {} attempts: {e:#}",
                            batch.len(),
                            retries + 1
                        ))
                        .err();
                }
            }
        }
    }
}
