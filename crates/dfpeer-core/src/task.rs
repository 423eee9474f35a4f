//! Task and Piece data model
//!
//! A task is a downloadable/uploadable unit of content split into
//! fixed-range pieces. The state machine lives here; callers reach it
//! through the registry's per-task lock.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Task identifier (content digest or URL-derived key)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a stable id from a source URL
    pub fn from_url(url: &str) -> Self {
        Self(blake3::hash(url.as_bytes()).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Downloading,
    Available,
    /// Reported only in snapshots while uploads run; never stored
    Uploading,
    Failed,
    Deleted,
}

impl TaskState {
    pub fn is_servable(self) -> bool {
        matches!(self, TaskState::Available | TaskState::Uploading)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PieceStatus {
    /// Not fetched yet
    Pending,
    Available,
    /// Last peer asked did not have it
    Absent,
}

/// Piece descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    pub index: u32,
    pub offset: u64,
    pub length: u64,
    pub digest: Option<String>,
    pub status: PieceStatus,
}

impl Piece {
    pub fn is_available(&self) -> bool {
        self.status == PieceStatus::Available
    }
}

/// Compute piece descriptors for a content length split at `piece_length`
pub fn layout(content_length: u64, piece_length: u64) -> Vec<Piece> {
    if content_length == 0 || piece_length == 0 {
        return Vec::new();
    }

    let count = content_length.div_ceil(piece_length);
    (0..count)
        .map(|i| {
            let offset = i * piece_length;
            Piece {
                index: i as u32,
                offset,
                length: piece_length.min(content_length - offset),
                digest: None,
                status: PieceStatus::Pending,
            }
        })
        .collect()
}

/// A task known to this node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub source: Option<String>,
    pub state: TaskState,
    pub content_length: u64,
    pub piece_length: u64,
    pub pieces: BTreeMap<u32, Piece>,
    pub failure: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Read model returned by StatTask
pub type TaskSnapshot = Task;

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Task {
    /// Create a Pending task with its piece layout
    pub fn new(
        id: TaskId,
        source: Option<String>,
        content_length: u64,
        piece_length: u64,
    ) -> Self {
        let now = now_secs();
        Self {
            id,
            source,
            state: TaskState::Pending,
            content_length,
            piece_length,
            pieces: layout(content_length, piece_length)
                .into_iter()
                .map(|p| (p.index, p))
                .collect(),
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn available_count(&self) -> usize {
        self.pieces.values().filter(|p| p.is_available()).count()
    }

    /// Indices still needed (Pending or Absent), ascending
    pub fn missing_pieces(&self) -> Vec<u32> {
        self.pieces
            .values()
            .filter(|p| !p.is_available())
            .map(|p| p.index)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.values().all(|p| p.is_available())
    }

    fn touch(&mut self) {
        self.updated_at = now_secs();
    }

    fn piece_mut(&mut self, index: u32) -> Result<&mut Piece> {
        let id = self.id.clone();
        self.pieces
            .get_mut(&index)
            .ok_or_else(|| Error::NotFound(format!("piece {} of task {}", index, id)))
    }

    /// Pending → Downloading
    pub fn start_download(&mut self) -> Result<()> {
        match self.state {
            TaskState::Pending => {
                self.state = TaskState::Downloading;
                self.touch();
                Ok(())
            }
            other => Err(Error::Conflict(format!(
                "task {} cannot start downloading from {:?}",
                self.id, other
            ))),
        }
    }

    /// Failed → Pending, forgetting absent markers and the failure reason
    pub fn restart(&mut self) -> Result<()> {
        if self.state != TaskState::Failed {
            return Err(Error::Conflict(format!(
                "task {} cannot restart from {:?}",
                self.id, self.state
            )));
        }
        for piece in self.pieces.values_mut() {
            if piece.status == PieceStatus::Absent {
                piece.status = PieceStatus::Pending;
            }
        }
        self.failure = None;
        self.state = TaskState::Pending;
        self.touch();
        Ok(())
    }

    /// Record a piece as locally available. Idempotent for identical digests.
    pub fn mark_piece_available(&mut self, index: u32, digest: String) -> Result<()> {
        if self.state != TaskState::Downloading {
            return Err(Error::Conflict(format!(
                "task {} is {:?}, not accepting pieces",
                self.id, self.state
            )));
        }
        let piece = self.piece_mut(index)?;
        if piece.is_available() {
            if piece.digest.as_deref() != Some(digest.as_str()) {
                return Err(Error::Conflict(format!(
                    "piece {} already available with a different digest",
                    index
                )));
            }
            return Ok(());
        }
        piece.digest = Some(digest);
        piece.status = PieceStatus::Available;
        self.touch();
        Ok(())
    }

    /// Record that a peer lacked this piece. Available pieces are untouched.
    pub fn mark_piece_absent(&mut self, index: u32) -> Result<()> {
        let piece = self.piece_mut(index)?;
        if !piece.is_available() {
            piece.status = PieceStatus::Absent;
        }
        self.touch();
        Ok(())
    }

    /// Downloading → Available once every piece is present
    pub fn complete(&mut self) -> Result<()> {
        if self.state != TaskState::Downloading {
            return Err(Error::Conflict(format!(
                "task {} cannot complete from {:?}",
                self.id, self.state
            )));
        }
        if !self.is_complete() {
            return Err(Error::Conflict(format!(
                "task {} still misses {} pieces",
                self.id,
                self.piece_count() - self.available_count()
            )));
        }
        self.state = TaskState::Available;
        self.touch();
        Ok(())
    }

    /// Pending or Downloading → Failed
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        if !matches!(self.state, TaskState::Pending | TaskState::Downloading) {
            return Err(Error::Conflict(format!(
                "task {} cannot fail from {:?}",
                self.id, self.state
            )));
        }
        self.failure = Some(reason.into());
        self.state = TaskState::Failed;
        self.touch();
        Ok(())
    }

    /// Any state → Deleted (terminal)
    pub fn delete(&mut self) {
        self.state = TaskState::Deleted;
        self.touch();
    }
}
