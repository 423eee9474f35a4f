//! Sync transport - message vocabulary and channels for SyncPieces
//!
//! A session is carried by two independent unbounded channels, one per
//! direction. Wire encoding is left to whatever RPC layer hosts the daemon;
//! `LocalNetwork` connects daemons living in the same process.

use async_trait::async_trait;
use bytes::Bytes;
use dfpeer_core::{Error, Result, TaskId};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use crate::service::Dfdaemon;

/// Peer identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub id: String,
    pub hostname: String,
    pub addr: SocketAddr,
}

impl PeerInfo {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            addr,
        }
    }

    /// Loopback identity, mostly for in-process peers
    pub fn local(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            hostname: id.clone(),
            id,
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        }
    }
}

/// One frame on a SyncPieces stream
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// Ask the remote for a piece
    Request { index: u32 },
    /// Withdraw an earlier request
    Cancel { index: u32 },
    Piece { index: u32, digest: String, data: Bytes },
    /// Remote lacks the piece; fall back to another source
    NotFound { index: u32 },
    Close,
}

/// One end of a bidirectional piece-exchange stream
#[derive(Debug)]
pub struct SyncChannel {
    pub tx: mpsc::UnboundedSender<SyncMessage>,
    pub rx: mpsc::UnboundedReceiver<SyncMessage>,
}

impl SyncChannel {
    /// Two connected ends: what one sends the other receives
    pub fn pair() -> (SyncChannel, SyncChannel) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            SyncChannel { tx: a_tx, rx: a_rx },
            SyncChannel { tx: b_tx, rx: b_rx },
        )
    }
}

/// Dials a remote peer's SyncPieces endpoint
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        local: &PeerInfo,
        remote: &PeerInfo,
        task_id: &TaskId,
    ) -> Result<SyncChannel>;
}

/// In-process connector routing dials to registered daemons
#[derive(Default)]
pub struct LocalNetwork {
    peers: RwLock<HashMap<String, Weak<dyn Dfdaemon>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<D: Dfdaemon + 'static>(&self, peer_id: impl Into<String>, daemon: &Arc<D>) {
        let daemon: Arc<dyn Dfdaemon> = daemon.clone();
        let peer_id = peer_id.into();
        debug!(peer = %peer_id, "peer joined local network");
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer_id, Arc::downgrade(&daemon));
    }

    pub fn unregister(&self, peer_id: &str) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id);
    }

    fn lookup(&self, peer_id: &str) -> Option<Arc<dyn Dfdaemon>> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .and_then(Weak::upgrade)
    }
}

#[async_trait]
impl PeerConnector for LocalNetwork {
    async fn connect(
        &self,
        local: &PeerInfo,
        remote: &PeerInfo,
        task_id: &TaskId,
    ) -> Result<SyncChannel> {
        let daemon = self
            .lookup(&remote.id)
            .ok_or_else(|| Error::Unavailable(format!("peer {} unreachable", remote.id)))?;

        let (ours, theirs) = SyncChannel::pair();
        daemon
            .sync_pieces(local.clone(), task_id.clone(), theirs)
            .await?;
        Ok(ours)
    }
}
