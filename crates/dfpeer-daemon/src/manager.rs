//! Manager RPC surface as seen from a peer
//!
//! The CRUD operations carry opaque JSON payloads and default to
//! `Unimplemented`. Only KeepAlive is exercised by the daemon itself.

use async_trait::async_trait;
use dfpeer_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role this node announces to the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Scheduler,
    Peer,
    SeedPeer,
}

/// Load figures attached to every heartbeat
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub tasks: usize,
    pub active_sessions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub source_type: SourceType,
    pub node_id: String,
    pub hostname: String,
    pub ip: String,
    pub cluster_id: u64,
    pub load: LoadSummary,
}

/// Configuration pushed down the keepalive stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate(pub Value);

/// Client half of an open KeepAlive stream.
/// `recv` must be cancel-safe.
#[async_trait]
pub trait KeepAliveStream: Send {
    async fn send(&mut self, request: KeepAliveRequest) -> Result<()>;

    /// `Ok(None)` once the manager ends the stream
    async fn recv(&mut self) -> Result<Option<ConfigUpdate>>;

    /// Half-close and wait for the manager to acknowledge
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait ManagerClient: Send + Sync {
    async fn get_seed_peer(&self, _request: Value) -> Result<Value> {
        Err(Error::Unimplemented("GetSeedPeer"))
    }

    async fn update_seed_peer(&self, _request: Value) -> Result<Value> {
        Err(Error::Unimplemented("UpdateSeedPeer"))
    }

    async fn delete_seed_peer(&self, _request: Value) -> Result<Value> {
        Err(Error::Unimplemented("DeleteSeedPeer"))
    }

    async fn get_scheduler(&self, _request: Value) -> Result<Value> {
        Err(Error::Unimplemented("GetScheduler"))
    }

    async fn update_scheduler(&self, _request: Value) -> Result<Value> {
        Err(Error::Unimplemented("UpdateScheduler"))
    }

    async fn list_schedulers(&self, _request: Value) -> Result<Value> {
        Err(Error::Unimplemented("ListSchedulers"))
    }

    async fn get_object_storage(&self, _request: Value) -> Result<Value> {
        Err(Error::Unimplemented("GetObjectStorage"))
    }

    async fn list_buckets(&self, _request: Value) -> Result<Value> {
        Err(Error::Unimplemented("ListBuckets"))
    }

    async fn list_applications(&self, _request: Value) -> Result<Value> {
        Err(Error::Unimplemented("ListApplications"))
    }

    async fn create_model(&self, _request: Value) -> Result<Value> {
        Err(Error::Unimplemented("CreateModel"))
    }

    async fn keep_alive(&self) -> Result<Box<dyn KeepAliveStream>> {
        Err(Error::Unimplemented("KeepAlive"))
    }
}

/// Manager that implements nothing
pub struct UnimplementedManager;

impl ManagerClient for UnimplementedManager {}
