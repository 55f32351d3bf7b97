//! File-backed durable store.
//!
//! Keeps the tables in memory and rewrites one JSON snapshot per commit:
//! write to `<path>.tmp`, fsync, rename over `<path>`. A crash leaves either
//! the old or the new snapshot, never a torn one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::memory_store::Tables;
use crate::ports::{CommitBatch, DurableStore, StoreError, StoreSnapshot};

pub struct FileStore {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl FileStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let tables = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)?;
                Tables::from_snapshot(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "file store opened");
        Ok(Self {
            path,
            tables: Mutex::new(tables),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_snapshot(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn load(&self) -> Result<StoreSnapshot, StoreError> {
        Ok(self.tables.lock().await.snapshot())
    }

    async fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let mut next = tables.clone();
        next.apply(batch);
        self.write_snapshot(&next.snapshot()).await?;
        *tables = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InvocationId, InvocationRecord, InvocationTarget};
    use chrono::Utc;
    use serde_json::json;
    use ulid::Ulid;

    #[tokio::test]
    async fn commits_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spool.json");

        let record = InvocationRecord::new(
            InvocationId::from_ulid(Ulid::new()),
            InvocationTarget::service("txn", "transfer"),
            json!({"from": "A", "to": "B", "cents": 5_000}),
            Utc::now(),
        );

        let store = FileStore::open(&path).await.unwrap();
        store
            .commit(&CommitBatch::invocation(record.clone()))
            .await
            .unwrap();
        drop(store);

        let reopened = FileStore::open(&path).await.unwrap();
        let snapshot = reopened.load().await.unwrap();
        assert_eq!(snapshot.invocations, vec![record]);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("absent.json")).await.unwrap();
        assert_eq!(store.load().await.unwrap(), StoreSnapshot::default());
    }
}
