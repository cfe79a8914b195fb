use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::DeadLetterEntry;

/// Durable holding area for entries that will not be retried.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn append(&self, entry: &DeadLetterEntry) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// FileDeadLetterStore
// ---------------------------------------------------------------------------

/// Appends one JSON line per entry.
pub struct FileDeadLetterStore {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl FileDeadLetterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeadLetterStore for FileDeadLetterStore {
    async fn append(&self, entry: &DeadLetterEntry) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .with_context(|| format!("open dead-letter store {}", self.path.display()))?;
            *guard = Some(file);
        }
        let Some(file) = guard.as_mut() else {
            anyhow::bail!("dead-letter store {} is not open", self.path.display());
        };
        let written = async {
            file.write_all(&line).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            // Reopen on the next attempt.
            *guard = None;
            return Err(e).with_context(|| format!("append to {}", self.path.display()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryDeadLetterStore
// ---------------------------------------------------------------------------

/// In-process store; `fail_next(n)` makes the next `n` appends fail.
#[derive(Debug, Default)]
pub struct MemoryDeadLetterStore {
    entries: Mutex<Vec<DeadLetterEntry>>,
    failures: AtomicU32,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DeadLetterEntry>> {
        self.entries.lock().expect("dead-letter store lock poisoned")
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn append(&self, entry: &DeadLetterEntry) -> anyhow::Result<()> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("dead-letter store unavailable");
        }
        self.lock().push(entry.clone());
        Ok(())
    }
}
