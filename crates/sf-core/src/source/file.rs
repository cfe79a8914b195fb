use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::partitioned::PartitionedLog;
use super::{Source, SourceLine};
use crate::record::Record;

/// JSON-lines file replayed as a partitioned, seekable log.
///
/// Each line is a [`SourceLine`]; records go to `hash(key) % partitions`.
/// Lines appended while the engine runs are picked up on the next poll.
/// Only complete (newline-terminated) lines are consumed.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    log: Mutex<PartitionedLog>,
    /// Byte offset of the first unread line.
    read_pos: tokio::sync::Mutex<u64>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, partitions: u32) -> Self {
        Self {
            path: path.into(),
            log: Mutex::new(PartitionedLog::new(partitions)),
            read_pos: tokio::sync::Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn committed(&self) -> BTreeMap<u32, u64> {
        self.lock().committed()
    }

    /// Load lines appended since the last refresh.
    async fn refresh(&self) -> anyhow::Result<()> {
        let mut read_pos = self.read_pos.lock().await;
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("open source {}", self.path.display()));
            }
        };
        file.seek(SeekFrom::Start(*read_pos)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(());
        };
        let complete = &buf[..=last_newline];
        let mut parts = self.lock();
        for (lineno, line) in complete.split(|&b| b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<SourceLine>(line) {
                Ok(l) => {
                    parts.append(l.key, l.event_time, l.payload);
                }
                Err(e) => log::warn!(
                    "skipping malformed line {} (+{} bytes) in {}: {e}",
                    lineno + 1,
                    *read_pos,
                    self.path.display()
                ),
            }
        }
        *read_pos += complete.len() as u64;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PartitionedLog> {
        self.log.lock().expect("file source lock poisoned")
    }
}

#[async_trait]
impl Source for FileSource {
    async fn poll(&self, max: usize) -> anyhow::Result<Vec<Record>> {
        if self.lock().remaining() == 0 {
            self.refresh().await?;
        }
        Ok(self.lock().poll(max))
    }

    async fn commit(&self, partition: u32, offset: u64) -> anyhow::Result<()> {
        self.lock().commit(partition, offset);
        log::debug!(
            "committed {}@{} for {}",
            partition,
            offset,
            self.path.display()
        );
        Ok(())
    }

    async fn seek(&self, committed: &BTreeMap<u32, u64>) -> anyhow::Result<()> {
        self.refresh().await?;
        self.lock().seek(committed);
        Ok(())
    }
}
