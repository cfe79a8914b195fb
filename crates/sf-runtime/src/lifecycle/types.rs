use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use orion_error::ErrorOweBase;
use orion_error::prelude::*;
use sf_config::EngineConfig;
use sf_core::accumulator::AccumulatorRegistry;
use sf_core::checkpoint::{CheckpointStore, FileCheckpointStore};
use sf_core::dead_letter::{DeadLetterStore, FileDeadLetterStore};
use sf_core::sink::{FileSink, Sink};
use sf_core::source::{FileSource, Source};
use sf_core::transform::TransformPipeline;

use crate::error::{RuntimeReason, RuntimeResult};

// ---------------------------------------------------------------------------
// TaskGroup — named collection of async tasks for ordered shutdown
// ---------------------------------------------------------------------------

/// A named group of async tasks that are shut down together.
///
/// Groups are assembled in *start order* and joined in *reverse order*
/// (LIFO) during shutdown:
///
///   start:  metrics → checkpoint → dead_letter → closer → workers → source
///   join:   source → workers → closer → dead_letter → checkpoint → metrics
///
/// A group may own a cancel token that is fired just before it is joined,
/// so each stage only stops once everything upstream of it has drained.
pub(crate) struct TaskGroup {
    pub(super) name: &'static str,
    cancel: Option<CancellationToken>,
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl TaskGroup {
    pub(super) fn new(name: &'static str) -> Self {
        Self {
            name,
            cancel: None,
            handles: Vec::new(),
        }
    }

    pub(super) fn with_cancel(name: &'static str, cancel: CancellationToken) -> Self {
        Self {
            name,
            cancel: Some(cancel),
            handles: Vec::new(),
        }
    }

    pub(super) fn push(&mut self, handle: JoinHandle<anyhow::Result<()>>) {
        self.handles.push(handle);
    }

    pub(super) fn cancel(&self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }

    /// Join all tasks in this group, returning the first error.
    pub(super) async fn wait(self) -> RuntimeResult<()> {
        let mut first_err = None;
        for handle in self.handles {
            let joined = handle
                .await
                .map_err(|e| {
                    StructError::from(RuntimeReason::Shutdown)
                        .with_detail(format!("task join error: {e}"))
                })
                .and_then(|r| r.owe(RuntimeReason::Shutdown));
            if let Err(e) = joined {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Like [`wait`](Self::wait) but gives up after `limit`, aborting any
    /// task still running. Returns `false` on timeout.
    pub(super) async fn wait_timeout(self, limit: Duration) -> RuntimeResult<bool> {
        let deadline = tokio::time::Instant::now() + limit;
        let mut handles = self.handles.into_iter();
        let mut first_err = None;
        while let Some(mut handle) = handles.next() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(joined) => {
                    let joined = joined
                        .map_err(|e| {
                            StructError::from(RuntimeReason::Shutdown)
                                .with_detail(format!("task join error: {e}"))
                        })
                        .and_then(|r| r.owe(RuntimeReason::Shutdown));
                    if let Err(e) = joined {
                        first_err.get_or_insert(e);
                    }
                }
                Err(_) => {
                    handle.abort();
                    for rest in handles {
                        rest.abort();
                    }
                    return Ok(false);
                }
            }
        }
        first_err.map_or(Ok(true), Err)
    }
}

// ---------------------------------------------------------------------------
// Collaborators — external systems the pipeline talks to
// ---------------------------------------------------------------------------

/// The external collaborators a [`Pipeline`](super::Pipeline) is wired to.
///
/// [`from_config`](Self::from_config) builds the file-backed set used by the
/// binary; tests swap in the in-memory implementations.
pub struct Collaborators {
    pub source: Arc<dyn Source>,
    pub sink: Arc<dyn Sink>,
    /// Receives correction results; without it they go to `sink`.
    pub late_sink: Option<Arc<dyn Sink>>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub accumulators: AccumulatorRegistry,
    /// Overrides the stage chain built from `[pipeline]`.
    pub transform: Option<TransformPipeline>,
}

impl Collaborators {
    pub fn new(
        source: Arc<dyn Source>,
        sink: Arc<dyn Sink>,
        checkpoints: Arc<dyn CheckpointStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Self {
        Self {
            source,
            sink,
            late_sink: None,
            checkpoints,
            dead_letters,
            accumulators: AccumulatorRegistry::with_builtins(),
            transform: None,
        }
    }

    /// File-backed source, sinks and stores at the configured paths.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut parts = Self::new(
            Arc::new(FileSource::new(config.source.path.clone(), config.source.partitions)),
            Arc::new(FileSink::new(config.sink.path.clone())),
            Arc::new(FileCheckpointStore::new(
                config.checkpoint.dir.clone(),
                config.checkpoint.retain,
            )),
            Arc::new(FileDeadLetterStore::new(config.dead_letter.path.clone())),
        );
        if let Some(late_path) = &config.sink.late_path {
            parts = parts.with_late_sink(Arc::new(FileSink::new(late_path.clone())));
        }
        parts
    }

    pub fn with_late_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.late_sink = Some(sink);
        self
    }

    pub fn with_accumulators(mut self, registry: AccumulatorRegistry) -> Self {
        self.accumulators = registry;
        self
    }

    pub fn with_transform(mut self, transform: TransformPipeline) -> Self {
        self.transform = Some(transform);
        self
    }
}

// ---------------------------------------------------------------------------
// BootstrapData — wired components from the bootstrap phase
// ---------------------------------------------------------------------------

/// Everything built and recovered during bootstrap, ready for task spawning.
pub(super) struct BootstrapData {
    pub ctx: crate::context::PipelineContext,
    pub source: Arc<dyn Source>,
    pub coordinator: Arc<sf_core::checkpoint::CheckpointCoordinator>,
    pub transform: Arc<TransformPipeline>,
    pub targets: crate::closer_task::SinkTargets,
    pub trigger: Arc<crate::worker_task::CheckpointTrigger>,
    pub dead_letter_rx:
        tokio::sync::mpsc::UnboundedReceiver<sf_core::dead_letter::DeadLetterEntry>,
    pub recovery: Option<sf_core::checkpoint::RecoveryReport>,
}
