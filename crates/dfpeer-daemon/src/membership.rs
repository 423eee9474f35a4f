//! Cluster Membership Client - keepalive with the manager
//!
//! Features:
//! - Holds a KeepAlive stream open and heartbeats on a fixed interval
//! - Reconnects with exponential backoff and jitter; never gives up
//! - Backoff resets once a stream has stayed up for a heartbeat interval
//! - Forwards pushed configuration to a `ConfigReloader` off the heartbeat path
//! - Graceful shutdown half-closes the stream so the manager evicts at once

use async_trait::async_trait;
use dfpeer_core::{Backoff, Error};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::{
    ConfigUpdate, KeepAliveRequest, KeepAliveStream, LoadSummary, ManagerClient, SourceType,
};

const RECENT_DELAYS: usize = 64;

/// Proof of live registration with the manager. Invalid once the
/// stream breaks; a fresh one carries a higher generation.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipLease {
    pub node_id: String,
    pub generation: u64,
    pub opened_at: SystemTime,
    pub last_heartbeat: Option<SystemTime>,
    /// Number of config updates received on this stream
    pub config_version: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MembershipStats {
    pub connects: u64,
    pub failures: u64,
    pub heartbeats: u64,
    /// Most recent reconnect delays, oldest first
    pub backoff_delays: Vec<Duration>,
}

/// Receives configuration pushed by the manager
#[async_trait]
pub trait ConfigReloader: Send + Sync {
    async fn reload(&self, update: ConfigUpdate);
}

/// Reloader that only logs what arrived
pub struct LoggingReloader;

#[async_trait]
impl ConfigReloader for LoggingReloader {
    async fn reload(&self, update: ConfigUpdate) {
        debug!(update = %update.0, "config update ignored");
    }
}

/// Source of the load figures carried on heartbeats
pub trait LoadReporter: Send + Sync {
    fn load(&self) -> LoadSummary;
}

impl LoadReporter for crate::service::TaskService {
    fn load(&self) -> LoadSummary {
        crate::service::TaskService::load(self)
    }
}

/// What this node announces about itself
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub source_type: SourceType,
    pub node_id: String,
    pub hostname: String,
    pub ip: String,
    pub cluster_id: u64,
}

#[derive(Default)]
struct Shared {
    lease: RwLock<Option<MembershipLease>>,
    stats: Mutex<MembershipStats>,
}

impl Shared {
    fn open(&self, node_id: &str) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.connects += 1;
        *self.lease.write().unwrap_or_else(|e| e.into_inner()) = Some(MembershipLease {
            node_id: node_id.to_string(),
            generation: stats.connects,
            opened_at: SystemTime::now(),
            last_heartbeat: None,
            config_version: 0,
        });
    }

    fn invalidate(&self) {
        *self.lease.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn heartbeat(&self) {
        if let Some(lease) = self.lease.write().unwrap_or_else(|e| e.into_inner()).as_mut() {
            lease.last_heartbeat = Some(SystemTime::now());
        }
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).heartbeats += 1;
    }

    fn config_received(&self) {
        if let Some(lease) = self.lease.write().unwrap_or_else(|e| e.into_inner()).as_mut() {
            lease.config_version += 1;
        }
    }

    fn failed(&self, delay: Duration) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.failures += 1;
        stats.backoff_delays.push(delay);
        if stats.backoff_delays.len() > RECENT_DELAYS {
            stats.backoff_delays.remove(0);
        }
    }
}

enum StreamEnd {
    Shutdown,
    Broken(Error),
}

pub struct MembershipClient {
    identity: NodeIdentity,
    manager: Arc<dyn ManagerClient>,
    load: Arc<dyn LoadReporter>,
    reloader: Arc<dyn ConfigReloader>,
    heartbeat_interval: Duration,
    backoff: Backoff,
}

impl MembershipClient {
    pub fn new(
        identity: NodeIdentity,
        manager: Arc<dyn ManagerClient>,
        load: Arc<dyn LoadReporter>,
        reloader: Arc<dyn ConfigReloader>,
        heartbeat_interval: Duration,
        backoff: Backoff,
    ) -> Self {
        Self {
            identity,
            manager,
            load,
            reloader,
            heartbeat_interval,
            backoff,
        }
    }

    /// Spawn the keepalive loop
    pub fn start(self) -> MembershipHandle {
        let shared = Arc::new(Shared::default());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.run(Arc::clone(&shared), shutdown.clone()));
        MembershipHandle {
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    fn heartbeat(&self) -> KeepAliveRequest {
        KeepAliveRequest {
            source_type: self.identity.source_type,
            node_id: self.identity.node_id.clone(),
            hostname: self.identity.hostname.clone(),
            ip: self.identity.ip.clone(),
            cluster_id: self.identity.cluster_id,
            load: self.load.load(),
        }
    }

    async fn run(self, shared: Arc<Shared>, shutdown: CancellationToken) {
        // Updates apply in arrival order on their own task
        let (reloads, mut pending) = mpsc::unbounded_channel::<ConfigUpdate>();
        let reloader = Arc::clone(&self.reloader);
        tokio::spawn(async move {
            while let Some(update) = pending.recv().await {
                reloader.reload(update).await;
            }
        });

        let mut attempt: u32 = 0;
        loop {
            let opened = tokio::select! {
                opened = self.manager.keep_alive() => opened,
                _ = shutdown.cancelled() => break,
            };

            let error = match opened {
                Ok(stream) => {
                    let opened_at = Instant::now();
                    shared.open(&self.identity.node_id);
                    info!(node_id = %self.identity.node_id, "registered with manager");
                    match self.keep_alive(stream, &shared, &reloads, &shutdown).await {
                        StreamEnd::Shutdown => {
                            shared.invalidate();
                            break;
                        }
                        StreamEnd::Broken(e) => {
                            shared.invalidate();
                            // Streams that die young keep escalating the backoff
                            if opened_at.elapsed() >= self.heartbeat_interval {
                                attempt = 0;
                            }
                            e
                        }
                    }
                }
                Err(e) => e,
            };

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            shared.failed(delay);
            warn!(error = %error, retry_in = ?delay, "manager keepalive unavailable");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        info!(node_id = %self.identity.node_id, "membership client stopped");
    }

    async fn keep_alive(
        &self,
        mut stream: Box<dyn KeepAliveStream>,
        shared: &Shared,
        reloads: &mpsc::UnboundedSender<ConfigUpdate>,
        shutdown: &CancellationToken,
    ) -> StreamEnd {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    match tokio::time::timeout(self.heartbeat_interval, stream.close()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, "keepalive close was not acknowledged"),
                        Err(_) => warn!(
                            waited = ?self.heartbeat_interval,
                            "manager did not acknowledge keepalive close in time"
                        ),
                    }
                    return StreamEnd::Shutdown;
                }
                _ = ticker.tick() => {
                    if let Err(e) = stream.send(self.heartbeat()).await {
                        return StreamEnd::Broken(e);
                    }
                    shared.heartbeat();
                }
                update = stream.recv() => match update {
                    Ok(Some(update)) => {
                        shared.config_received();
                        if reloads.send(update).is_err() {
                            warn!("config reloader stopped, update dropped");
                        }
                    }
                    Ok(None) => {
                        return StreamEnd::Broken(Error::Unavailable("manager ended keepalive stream".into()));
                    }
                    Err(e) => return StreamEnd::Broken(e),
                },
            }
        }
    }
}

/// Control handle for a running membership client
pub struct MembershipHandle {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MembershipHandle {
    /// Current lease, `None` while disconnected
    pub fn lease(&self) -> Option<MembershipLease> {
        self.shared
            .lease
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn stats(&self) -> MembershipStats {
        self.shared
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Close the stream and wait for the loop to exit
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "membership task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfpeer_core::Result;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// What the fake manager saw on one stream
    #[derive(Debug, PartialEq)]
    enum Seen {
        Heartbeat(KeepAliveRequest),
        Closed,
    }

    struct FakeStream {
        seen: mpsc::UnboundedSender<Seen>,
        updates: mpsc::UnboundedReceiver<ConfigUpdate>,
    }

    #[async_trait]
    impl KeepAliveStream for FakeStream {
        async fn send(&mut self, request: KeepAliveRequest) -> Result<()> {
            self.seen
                .send(Seen::Heartbeat(request))
                .map_err(|_| Error::Unavailable("manager gone".into()))
        }

        async fn recv(&mut self) -> Result<Option<ConfigUpdate>> {
            Ok(self.updates.recv().await)
        }

        async fn close(&mut self) -> Result<()> {
            let _ = self.seen.send(Seen::Closed);
            Ok(())
        }
    }

    /// Fails the first `failures` dials, then hands out streams
    struct FlakyManager {
        failures: usize,
        dials: AtomicUsize,
        seen: mpsc::UnboundedSender<Seen>,
        updates: Mutex<Option<mpsc::UnboundedReceiver<ConfigUpdate>>>,
    }

    #[async_trait]
    impl ManagerClient for FlakyManager {
        async fn keep_alive(&self) -> Result<Box<dyn KeepAliveStream>> {
            let dial = self.dials.fetch_add(1, Ordering::SeqCst);
            if dial < self.failures {
                return Err(Error::Unavailable(format!("dial {} refused", dial)));
            }
            let updates = self
                .updates
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| mpsc::unbounded_channel().1);
            Ok(Box::new(FakeStream {
                seen: self.seen.clone(),
                updates,
            }))
        }
    }

    /// Hands out streams whose close is never acknowledged
    struct SilentManager;

    struct SilentStream;

    #[async_trait]
    impl KeepAliveStream for SilentStream {
        async fn send(&mut self, _request: KeepAliveRequest) -> Result<()> {
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<ConfigUpdate>> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<()> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl ManagerClient for SilentManager {
        async fn keep_alive(&self) -> Result<Box<dyn KeepAliveStream>> {
            Ok(Box::new(SilentStream))
        }
    }

    struct FixedLoad;

    impl LoadReporter for FixedLoad {
        fn load(&self) -> LoadSummary {
            LoadSummary {
                tasks: 3,
                active_sessions: 1,
            }
        }
    }

    struct RecordingReloader(mpsc::UnboundedSender<ConfigUpdate>);

    #[async_trait]
    impl ConfigReloader for RecordingReloader {
        async fn reload(&self, update: ConfigUpdate) {
            let _ = self.0.send(update);
        }
    }

    /// Records the update, then never finishes applying it
    struct StuckReloader(mpsc::UnboundedSender<ConfigUpdate>);

    #[async_trait]
    impl ConfigReloader for StuckReloader {
        async fn reload(&self, update: ConfigUpdate) {
            let _ = self.0.send(update);
            std::future::pending::<()>().await;
        }
    }

    fn identity() -> NodeIdentity {
        NodeIdentity {
            source_type: SourceType::Peer,
            node_id: "node-a".into(),
            hostname: "host-a".into(),
            ip: "10.0.0.1".into(),
            cluster_id: 1,
        }
    }

    fn backoff() -> Backoff {
        Backoff {
            initial: Duration::from_millis(5),
            max: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    struct Harness {
        handle: MembershipHandle,
        seen: mpsc::UnboundedReceiver<Seen>,
        updates: mpsc::UnboundedSender<ConfigUpdate>,
        reloaded: mpsc::UnboundedReceiver<ConfigUpdate>,
    }

    fn start(failures: usize) -> Harness {
        let (seen_tx, seen) = mpsc::unbounded_channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let (reload_tx, reloaded) = mpsc::unbounded_channel();
        let manager = Arc::new(FlakyManager {
            failures,
            dials: AtomicUsize::new(0),
            seen: seen_tx,
            updates: Mutex::new(Some(updates_rx)),
        });
        let handle = MembershipClient::new(
            identity(),
            manager,
            Arc::new(FixedLoad),
            Arc::new(RecordingReloader(reload_tx)),
            Duration::from_millis(20),
            backoff(),
        )
        .start();
        Harness {
            handle,
            seen,
            updates,
            reloaded,
        }
    }

    #[tokio::test]
    async fn test_retries_with_increasing_backoff_then_registers() {
        let mut h = start(4);

        match h.seen.recv().await {
            Some(Seen::Heartbeat(request)) => {
                assert_eq!(request.node_id, "node-a");
                assert_eq!(request.load.tasks, 3);
            }
            other => panic!("unexpected {:?}", other),
        }

        let stats = h.handle.stats();
        assert_eq!(stats.failures, 4);
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.backoff_delays.len(), 4);
        assert!(
            stats.backoff_delays.windows(2).all(|w| w[0] < w[1]),
            "{:?}",
            stats.backoff_delays
        );

        let lease = h.handle.lease().unwrap();
        assert_eq!(lease.node_id, "node-a");
        assert_eq!(lease.generation, 1);

        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeats_repeat() {
        let mut h = start(0);
        for _ in 0..3 {
            assert!(matches!(h.seen.recv().await, Some(Seen::Heartbeat(_))));
        }
        assert!(h.handle.stats().heartbeats >= 3);
        assert!(h.handle.lease().unwrap().last_heartbeat.is_some());
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_config_updates_reach_reloader() {
        let mut h = start(0);
        h.updates.send(ConfigUpdate(json!({"window": 8}))).unwrap();

        let update = tokio::time::timeout(Duration::from_secs(1), h.reloaded.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.0["window"], 8);
        assert_eq!(h.handle.lease().unwrap().config_version, 1);
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_stream_and_drops_lease() {
        let mut h = start(0);
        assert!(matches!(h.seen.recv().await, Some(Seen::Heartbeat(_))));

        h.handle.shutdown().await;
        assert!(h.handle.lease().is_none());

        let mut closed = false;
        while let Ok(seen) = h.seen.try_recv() {
            closed |= seen == Seen::Closed;
        }
        assert!(closed, "stream was not closed on shutdown");
    }

    #[tokio::test]
    async fn test_broken_stream_reconnects_with_new_generation() {
        let mut h = start(0);
        assert!(matches!(h.seen.recv().await, Some(Seen::Heartbeat(_))));
        assert_eq!(h.handle.lease().unwrap().generation, 1);

        // Ending the update stream breaks the first keepalive
        drop(h.updates);
        for _ in 0..100 {
            if h.handle.stats().connects >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = h.handle.stats();
        assert!(stats.connects >= 2);
        assert!(stats.failures >= 1);
        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_reload_does_not_stall_heartbeats() {
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let (reload_tx, mut reloaded) = mpsc::unbounded_channel();
        let manager = Arc::new(FlakyManager {
            failures: 0,
            dials: AtomicUsize::new(0),
            seen: seen_tx,
            updates: Mutex::new(Some(updates_rx)),
        });
        let handle = MembershipClient::new(
            identity(),
            manager,
            Arc::new(FixedLoad),
            Arc::new(StuckReloader(reload_tx)),
            Duration::from_millis(20),
            backoff(),
        )
        .start();

        assert!(matches!(seen.recv().await, Some(Seen::Heartbeat(_))));
        updates.send(ConfigUpdate(json!({"window": 2}))).unwrap();
        tokio::time::timeout(Duration::from_secs(1), reloaded.recv())
            .await
            .unwrap()
            .unwrap();

        for _ in 0..3 {
            let next = tokio::time::timeout(Duration::from_secs(1), seen.recv())
                .await
                .expect("heartbeats stalled behind the reloader");
            assert!(matches!(next, Some(Seen::Heartbeat(_))));
        }
        assert_eq!(handle.lease().unwrap().config_version, 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_bounded_when_close_unacknowledged() {
        let handle = MembershipClient::new(
            identity(),
            Arc::new(SilentManager),
            Arc::new(FixedLoad),
            Arc::new(LoggingReloader),
            Duration::from_millis(20),
            backoff(),
        )
        .start();

        for _ in 0..100 {
            if handle.lease().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(handle.lease().is_some());

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("shutdown hung on close");
        assert!(handle.lease().is_none());
    }

    #[tokio::test]
    async fn test_flapping_stream_keeps_escalating_backoff() {
        let (seen_tx, _seen) = mpsc::unbounded_channel();
        // No update receiver: every stream ends as soon as it is polled
        let manager = Arc::new(FlakyManager {
            failures: 0,
            dials: AtomicUsize::new(0),
            seen: seen_tx,
            updates: Mutex::new(None),
        });
        let handle = MembershipClient::new(
            identity(),
            manager,
            Arc::new(FixedLoad),
            Arc::new(LoggingReloader),
            Duration::from_millis(200),
            backoff(),
        )
        .start();

        for _ in 0..200 {
            if handle.stats().failures >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = handle.stats();
        assert!(stats.connects >= 5, "{:?}", stats);
        let delays = &stats.backoff_delays[..5];
        assert!(delays.windows(2).all(|w| w[0] < w[1]), "{:?}", delays);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unimplemented_manager_keeps_retrying() {
        let handle = MembershipClient::new(
            identity(),
            Arc::new(crate::manager::UnimplementedManager),
            Arc::new(FixedLoad),
            Arc::new(LoggingReloader),
            Duration::from_millis(20),
            backoff(),
        )
        .start();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(handle.stats().failures >= 2);
        assert!(handle.lease().is_none());
        handle.shutdown().await;
    }
}
