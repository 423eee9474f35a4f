//! Daemon composition root
//!
//! Wires the registry, piece store, sync engine, task service and
//! membership client from a `DaemonConfig`.

use anyhow::{bail, Context, Result};
use dfpeer_core::{DaemonConfig, MemoryPieceStore, PieceStore, SledPieceStore, TaskRegistry};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::manager::{ManagerClient, SourceType};
use crate::membership::{
    ConfigReloader, LoggingReloader, MembershipClient, MembershipHandle, MembershipLease,
    MembershipStats, NodeIdentity,
};
use crate::service::TaskService;
use crate::session::SyncEngine;
use crate::transport::{PeerConnector, PeerInfo};

pub struct Daemon {
    config: DaemonConfig,
    peer: PeerInfo,
    service: Arc<TaskService>,
    manager: Arc<dyn ManagerClient>,
    reloader: Arc<dyn ConfigReloader>,
    membership: Mutex<Option<MembershipHandle>>,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        manager: Arc<dyn ManagerClient>,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Self> {
        config.validate()?;

        let ip: IpAddr = config
            .node
            .ip
            .parse()
            .with_context(|| format!("invalid node ip {:?}", config.node.ip))?;
        let peer = PeerInfo::new(
            config.node.resolve_id(),
            config.node.hostname.clone(),
            SocketAddr::new(ip, config.node.port),
        );

        let store: Arc<dyn PieceStore> = match &config.storage.dir {
            Some(dir) => Arc::new(
                SledPieceStore::open(dir)
                    .with_context(|| format!("failed to open piece store at {:?}", dir))?,
            ),
            None => Arc::new(MemoryPieceStore::new()),
        };

        let registry = Arc::new(TaskRegistry::new());
        let engine = Arc::new(SyncEngine::new(
            peer.clone(),
            Arc::clone(&registry),
            Arc::clone(&store),
            connector,
            config.sync.clone(),
        ));
        let service = Arc::new(
            TaskService::new(registry, store, engine).with_piece_length(config.storage.piece_length),
        );

        Ok(Self {
            config,
            peer,
            service,
            manager,
            reloader: Arc::new(LoggingReloader),
            membership: Mutex::new(None),
        })
    }

    pub fn with_reloader(mut self, reloader: Arc<dyn ConfigReloader>) -> Self {
        self.reloader = reloader;
        self
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn service(&self) -> &Arc<TaskService> {
        &self.service
    }

    /// Start the membership loop
    pub fn start(&self) -> Result<()> {
        let mut membership = self.membership.lock().unwrap_or_else(|e| e.into_inner());
        if membership.is_some() {
            bail!("daemon {} already started", self.peer.id);
        }

        let identity = NodeIdentity {
            source_type: SourceType::Peer,
            node_id: self.peer.id.clone(),
            hostname: self.peer.hostname.clone(),
            ip: self.peer.addr.ip().to_string(),
            cluster_id: self.config.node.cluster_id,
        };
        let client = MembershipClient::new(
            identity,
            Arc::clone(&self.manager),
            self.service.clone(),
            Arc::clone(&self.reloader),
            self.config.membership.heartbeat_interval(),
            self.config.membership.backoff.backoff(),
        );
        *membership = Some(client.start());

        info!(node_id = %self.peer.id, addr = %self.peer.addr, "daemon started");
        Ok(())
    }

    pub fn membership(&self) -> Option<MembershipLease> {
        self.membership
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|m| m.lease())
    }

    pub fn membership_stats(&self) -> Option<MembershipStats> {
        self.membership
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|m| m.stats())
    }

    /// Leave the cluster, then drain every sync session
    pub async fn shutdown(&self) {
        let membership = self
            .membership
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(membership) = membership {
            membership.shutdown().await;
        }
        self.service.engine().close_all().await;
        info!(node_id = %self.peer.id, "daemon stopped");
    }
}
