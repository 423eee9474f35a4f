//! Piece Store Adapter - contract for local content-addressed piece storage
//!
//! Two adapters ship with the crate:
//! - `MemoryPieceStore`: process-local, used by tests and ephemeral nodes
//! - `SledPieceStore`: persistent, keyed `<task>/<index>`

use crate::error::Result;
use crate::task::TaskId;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::debug;

/// BLAKE3 hex digest of piece bytes
pub fn piece_digest(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Store piece bytes and return their digest
    async fn put_piece(&self, task_id: &TaskId, index: u32, data: Bytes) -> Result<String>;

    async fn get_piece(&self, task_id: &TaskId, index: u32) -> Result<Option<Bytes>>;

    async fn has_piece(&self, task_id: &TaskId, index: u32) -> Result<bool> {
        Ok(self.get_piece(task_id, index).await?.is_some())
    }

    /// Drop every piece belonging to `task_id`, returning how many went
    async fn reclaim(&self, task_id: &TaskId) -> Result<usize>;
}

/// In-memory store
#[derive(Default)]
pub struct MemoryPieceStore {
    pieces: RwLock<HashMap<TaskId, HashMap<u32, Bytes>>>,
}

impl MemoryPieceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PieceStore for MemoryPieceStore {
    async fn put_piece(&self, task_id: &TaskId, index: u32, data: Bytes) -> Result<String> {
        let digest = piece_digest(&data);
        self.pieces
            .write()
            .await
            .entry(task_id.clone())
            .or_default()
            .insert(index, data);
        Ok(digest)
    }

    async fn get_piece(&self, task_id: &TaskId, index: u32) -> Result<Option<Bytes>> {
        Ok(self
            .pieces
            .read()
            .await
            .get(task_id)
            .and_then(|p| p.get(&index))
            .cloned())
    }

    async fn reclaim(&self, task_id: &TaskId) -> Result<usize> {
        let removed = self
            .pieces
            .write()
            .await
            .remove(task_id)
            .map(|p| p.len())
            .unwrap_or(0);
        debug!(task_id = %task_id, removed, "reclaimed pieces");
        Ok(removed)
    }
}

/// sled-backed store
pub struct SledPieceStore {
    db: sled::Db,
}

impl SledPieceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let db = sled::open(path.join("pieces.db"))?;
        Ok(Self { db })
    }

    /// Throwaway store that vanishes on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn key(task_id: &TaskId, index: u32) -> String {
        format!("{}/{:010}", task_id, index)
    }

    fn prefix(task_id: &TaskId) -> String {
        format!("{}/", task_id)
    }
}

#[async_trait]
impl PieceStore for SledPieceStore {
    async fn put_piece(&self, task_id: &TaskId, index: u32, data: Bytes) -> Result<String> {
        let digest = piece_digest(&data);
        self.db
            .insert(Self::key(task_id, index).as_bytes(), data.as_ref())?;
        Ok(digest)
    }

    async fn get_piece(&self, task_id: &TaskId, index: u32) -> Result<Option<Bytes>> {
        Ok(self
            .db
            .get(Self::key(task_id, index).as_bytes())?
            .map(|v| Bytes::copy_from_slice(&v)))
    }

    async fn has_piece(&self, task_id: &TaskId, index: u32) -> Result<bool> {
        Ok(self.db.contains_key(Self::key(task_id, index).as_bytes())?)
    }

    async fn reclaim(&self, task_id: &TaskId) -> Result<usize> {
        let mut batch = sled::Batch::default();
        let mut removed = 0;
        for item in self.db.scan_prefix(Self::prefix(task_id).as_bytes()) {
            let (key, _) = item?;
            batch.remove(key);
            removed += 1;
        }
        self.db.apply_batch(batch)?;
        self.db.flush_async().await?;
        debug!(task_id = %task_id, removed, "reclaimed pieces");
        Ok(removed)
    }
}
