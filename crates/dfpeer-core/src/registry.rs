//! Task Registry - in-memory table of tasks known to this node
//!
//! The table is split into shards so lookups on different tasks never
//! contend on one lock. Shard locks guard only the map itself and are never
//! held across an await; each task's state sits behind its own async lock.

use crate::error::{Error, Result};
use crate::task::{Task, TaskId, TaskSnapshot, TaskState};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

const SHARDS: usize = 16;

/// One registry slot: the task plus its outstanding leases
#[derive(Debug)]
pub struct TaskEntry {
    task: tokio::sync::RwLock<Task>,
    sessions: AtomicUsize,
    uploads: AtomicUsize,
}

impl TaskEntry {
    fn new(task: Task) -> Self {
        Self {
            task: tokio::sync::RwLock::new(task),
            sessions: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
        }
    }

    /// Shared access; lifecycle transitions wait until the guard drops
    pub async fn read(&self) -> RwLockReadGuard<'_, Task> {
        self.task.read().await
    }

    /// Exclusive access; the single mutator for this task
    pub async fn write(&self) -> RwLockWriteGuard<'_, Task> {
        self.task.write().await
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn active_uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Snapshot with `Uploading` reported while uploads are in flight
    pub async fn snapshot(&self) -> TaskSnapshot {
        let mut snapshot = self.read().await.clone();
        if snapshot.state == TaskState::Available && self.active_uploads() > 0 {
            snapshot.state = TaskState::Uploading;
        }
        snapshot
    }

    /// Take a session lease; fails once the task is deleted
    pub async fn lease_session(self: &Arc<Self>) -> Result<SessionLease> {
        let task = self.read().await;
        if task.state == TaskState::Deleted {
            return Err(Error::not_found(&task.id));
        }
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(SessionLease {
            entry: Arc::clone(self),
        })
    }

    /// Take an upload lease; the task must be servable
    pub async fn lease_upload(self: &Arc<Self>) -> Result<UploadLease> {
        let task = self.read().await;
        if !task.state.is_servable() {
            return Err(Error::NotFound(format!(
                "task {} is {:?}, not available",
                task.id, task.state
            )));
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(UploadLease {
            entry: Arc::clone(self),
        })
    }
}

/// Held for the lifetime of a sync session on a task
#[derive(Debug)]
pub struct SessionLease {
    entry: Arc<TaskEntry>,
}

impl SessionLease {
    pub fn entry(&self) -> &Arc<TaskEntry> {
        &self.entry
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.entry.sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Held while an upload streams a task out
#[derive(Debug)]
pub struct UploadLease {
    entry: Arc<TaskEntry>,
}

impl Drop for UploadLease {
    fn drop(&mut self) {
        self.entry.uploads.fetch_sub(1, Ordering::SeqCst);
    }
}

type Shard = RwLock<HashMap<TaskId, Arc<TaskEntry>>>;

/// Sharded task table
pub struct TaskRegistry {
    shards: Vec<Shard>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, id: &TaskId) -> &Shard {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    pub fn get(&self, id: &TaskId) -> Option<Arc<TaskEntry>> {
        self.shard(id)
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Get or fetch an entry, failing with NotFound
    pub fn require(&self, id: &TaskId) -> Result<Arc<TaskEntry>> {
        self.get(id).ok_or_else(|| Error::not_found(id))
    }

    /// Return the existing entry or insert one built by `make`.
    /// The boolean is true when a new entry was inserted.
    pub fn get_or_insert_with(
        &self,
        id: &TaskId,
        make: impl FnOnce() -> Task,
    ) -> (Arc<TaskEntry>, bool) {
        let mut shard = self.shard(id).write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = shard.get(id) {
            return (Arc::clone(entry), false);
        }
        let entry = Arc::new(TaskEntry::new(make()));
        shard.insert(id.clone(), Arc::clone(&entry));
        debug!(task_id = %id, "registered task");
        (entry, true)
    }

    /// Remove `entry` if it is still the one registered under `id`
    pub fn remove(&self, id: &TaskId, entry: &Arc<TaskEntry>) -> bool {
        let mut shard = self.shard(id).write().unwrap_or_else(|e| e.into_inner());
        match shard.get(id) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                shard.remove(id);
                debug!(task_id = %id, "unregistered task");
                true
            }
            _ => false,
        }
    }

    fn entries(&self) -> Vec<Arc<TaskEntry>> {
        self.shards
            .iter()
            .flat_map(|s| {
                s.read()
                    .unwrap_or_else(|e| e.into_inner())
                    .values()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Snapshots of every registered task
    pub async fn list(&self) -> Vec<TaskSnapshot> {
        let mut out = Vec::new();
        for entry in self.entries() {
            out.push(entry.snapshot().await);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Sum of session leases across all tasks
    pub fn active_sessions(&self) -> usize {
        self.entries().iter().map(|e| e.active_sessions()).sum()
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
