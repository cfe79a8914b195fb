use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Checkpoint, CheckpointStore};

const PREFIX: &str = "checkpoint-";
const SUFFIX: &str = ".json";

/// On-disk wrapper: the serialized checkpoint plus its SHA-256.
#[derive(Serialize, Deserialize)]
struct Envelope {
    id: u64,
    checksum: String,
    body: String,
}

/// Checkpoints as JSON files in a directory, one file per checkpoint.
///
/// Writes go to a temp file that is renamed into place, so readers never see
/// a partial checkpoint. Only the newest `retain` files are kept.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    retain: usize,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, retain: usize) -> Self {
        Self {
            dir: dir.into(),
            retain: retain.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{id:020}{SUFFIX}"))
    }

    /// Checkpoint files present on disk, newest first.
    async fn list(&self) -> anyhow::Result<Vec<(u64, PathBuf)>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("read checkpoint dir {}", self.dir.display()));
            }
        };
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix(PREFIX))
                .and_then(|n| n.strip_suffix(SUFFIX))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            found.push((id, entry.path()));
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found)
    }

    async fn load(path: &Path) -> anyhow::Result<Checkpoint> {
        let raw = tokio::fs::read(path).await?;
        let envelope: Envelope = serde_json::from_slice(&raw).context("malformed envelope")?;
        let actual = checksum(envelope.body.as_bytes());
        if actual != envelope.checksum {
            bail!(
                "checksum mismatch: expected {}, got {actual}",
                envelope.checksum
            );
        }
        let checkpoint: Checkpoint =
            serde_json::from_str(&envelope.body).context("malformed checkpoint body")?;
        if checkpoint.id != envelope.id {
            bail!(
                "envelope id {} does not match checkpoint id {}",
                envelope.id,
                checkpoint.id
            );
        }
        Ok(checkpoint)
    }

    /// Delete checkpoints beyond the newest `retain`. Failures are logged:
    /// the checkpoint just written is already durable. Returns the number of
    /// files removed.
    async fn prune(&self) -> usize {
        let found = match self.list().await {
            Ok(found) => found,
            Err(e) => {
                log::warn!("skipping checkpoint pruning: {e:#}");
                return 0;
            }
        };
        let mut removed = 0;
        for (id, path) in found.into_iter().skip(self.retain) {
            log::debug!("removing superseded checkpoint {id}");
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("failed to remove checkpoint {}: {e}", path.display()),
            }
        }
        removed
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn put(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create checkpoint dir {}", self.dir.display()))?;

        let body = serde_json::to_string(checkpoint)?;
        let envelope = Envelope {
            id: checkpoint.id,
            checksum: checksum(body.as_bytes()),
            body,
        };
        let bytes = serde_json::to_vec(&envelope)?;

        let target = self.path_for(checkpoint.id);
        let tmp = self.dir.join(format!(".{PREFIX}{}.tmp", checkpoint.id));
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        let file = tokio::fs::File::open(&tmp).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, &target)
            .await
            .with_context(|| format!("rename {} -> {}", tmp.display(), target.display()))?;

        self.prune().await;
        Ok(())
    }

    async fn get_latest(&self) -> anyhow::Result<Option<Checkpoint>> {
        for (id, path) in self.list().await? {
            match Self::load(&path).await {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(e) => log::warn!(
                    "skipping unreadable checkpoint {id} at {}: {e:#}",
                    path.display()
                ),
            }
        }
        Ok(None)
    }
}

fn checksum(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::StateSnapshot;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn checkpoint(id: u64, offset: u64) -> Checkpoint {
        Checkpoint {
            id,
            taken_at: Utc::now(),
            offsets: BTreeMap::from([(0, offset)]),
            state: StateSnapshot {
                closed_through: Some(60_000),
                ..StateSnapshot::default()
            },
        }
    }

    #[tokio::test]
    async fn put_then_get_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("ckpt"), 2);
        assert!(store.get_latest().await.unwrap().is_none());

        store.put(&checkpoint(1, 10)).await.unwrap();
        store.put(&checkpoint(2, 20)).await.unwrap();
        let latest = store.get_latest().await.unwrap().unwrap();
        assert_eq!(latest.id, 2);
        assert_eq!(latest.offsets.get(&0), Some(&20));
        assert_eq!(latest.state.closed_through, Some(60_000));
    }

    #[tokio::test]
    async fn retains_only_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), 2);
        for id in 1..=4 {
            store.put(&checkpoint(id, id * 10)).await.unwrap();
        }
        let ids: Vec<u64> = store.list().await.unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![4, 3]);
        // No temp files left behind.
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
    }

    #[tokio::test]
    async fn corrupt_latest_falls_back_to_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), 3);
        store.put(&checkpoint(1, 10)).await.unwrap();
        store.put(&checkpoint(2, 20)).await.unwrap();

        // Flip the recorded offset without updating the checksum.
        let path = store.path_for(2);
        let raw = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, raw.replace("20", "99")).unwrap();

        let latest = store.get_latest().await.unwrap().unwrap();
        assert_eq!(latest.id, 1);
    }

    #[tokio::test]
    async fn truncated_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), 3);
        store.put(&checkpoint(1, 10)).await.unwrap();
        std::fs::write(store.path_for(2), b"{\"id\":2,\"chec").unwrap();
        assert_eq!(store.get_latest().await.unwrap().unwrap().id, 1);
    }

    #[tokio::test]
    async fn prune_failure_is_not_a_put_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), 1);
        store.put(&checkpoint(1, 10)).await.unwrap();
        store.put(&checkpoint(2, 20)).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);

        // A plain file where the directory should be makes listing fail.
        let not_a_dir = dir.path().join("plain-file");
        std::fs::write(&not_a_dir, b"x").unwrap();
        let broken = FileCheckpointStore::new(&not_a_dir, 1);
        assert!(broken.list().await.is_err());
        assert_eq!(broken.prune().await, 0);
    }
}
