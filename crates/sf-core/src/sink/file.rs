use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::Sink;
use crate::record::WindowResult;

/// Appends window results as JSON lines; one flush per batch.
pub struct FileSink {
    path: PathBuf,
    writer: tokio::sync::Mutex<Option<tokio::io::BufWriter<tokio::fs::File>>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> anyhow::Result<tokio::io::BufWriter<tokio::fs::File>> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open sink {}", self.path.display()))?;
        Ok(tokio::io::BufWriter::new(file))
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn write(&self, batch: &[WindowResult]) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        for result in batch {
            serde_json::to_writer(&mut buf, result)?;
            buf.push(b'\n');
        }

        let mut guard = self.writer.lock().await;
        let mut writer = match guard.take() {
            Some(w) => w,
            None => self.open().await?,
        };
        writer.write_all(&buf).await?;
        writer.flush().await?;
        // A writer that failed mid-batch is dropped and reopened next time.
        *guard = Some(writer);
        Ok(())
    }
}
