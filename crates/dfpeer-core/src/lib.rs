//! dfpeer Core - Peer daemon data plane primitives
//!
//! Features:
//! - Task/Piece data model with the task state machine
//! - Sharded Task Registry with per-task serialization
//! - Piece Store Adapter contract (memory and sled backends)
//! - Shared error vocabulary with transport status codes
//! - Daemon configuration and backoff policy

pub mod backoff;
pub mod config;
pub mod error;
pub mod registry;
pub mod store;
pub mod task;

pub use backoff::Backoff;
pub use config::DaemonConfig;
pub use error::{Code, Error, Result};
pub use registry::{SessionLease, TaskEntry, TaskRegistry, UploadLease};
pub use store::{piece_digest, MemoryPieceStore, PieceStore, SledPieceStore};
pub use task::{Piece, PieceStatus, Task, TaskId, TaskSnapshot, TaskState};
