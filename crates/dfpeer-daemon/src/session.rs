//! Piece Sync Engine - per-peer piece exchange sessions
//!
//! Features:
//! - Full duplex: both ends request and serve pieces on one stream
//! - Bounded in-flight window per direction, overflow queues locally
//! - Per-request timeout and caller-driven cancellation
//! - Idle sessions close on their own without touching task state
//! - Each session leases its task until the driver exits

use bytes::Bytes;
use dfpeer_core::config::SyncConfig;
use dfpeer_core::{
    piece_digest, Error, PieceStore, Result, SessionLease, TaskId, TaskRegistry,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::transport::{PeerConnector, PeerInfo, SyncChannel, SyncMessage};

/// Piece received from a peer, digest already checked
#[derive(Debug, Clone, PartialEq)]
pub struct PieceData {
    pub index: u32,
    pub digest: String,
    pub data: Bytes,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this node
    Local,
    /// Peer sent Close or dropped the stream
    Remote,
    /// No traffic within the idle timeout
    Idle,
}

type Reply = oneshot::Sender<Result<PieceData>>;
type SessionTable = Arc<Mutex<HashMap<Uuid, SessionHandle>>>;

enum Command {
    Request { ticket: u64, index: u32, reply: Reply },
    Abandon { ticket: u64, index: u32 },
}

/// Look up a piece for a remote requester
pub async fn serve_piece(store: &dyn PieceStore, task_id: &TaskId, index: u32) -> SyncMessage {
    match store.get_piece(task_id, index).await {
        Ok(Some(data)) => SyncMessage::Piece {
            index,
            digest: piece_digest(&data),
            data,
        },
        Ok(None) => SyncMessage::NotFound { index },
        Err(e) => {
            warn!(task_id = %task_id, index, error = %e, "piece lookup failed");
            SyncMessage::NotFound { index }
        }
    }
}

/// Caller side of a running session
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    peer: PeerInfo,
    task_id: TaskId,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    done: CancellationToken,
    reason: Arc<OnceLock<CloseReason>>,
    request_timeout: Duration,
    tickets: Arc<AtomicU64>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Request one piece from the peer
    pub async fn request_piece(&self, index: u32) -> Result<PieceData> {
        self.request_piece_with_cancel(index, &CancellationToken::new())
            .await
    }

    /// Request one piece; firing `cancel` withdraws the request
    pub async fn request_piece_with_cancel(
        &self,
        index: u32,
        cancel: &CancellationToken,
    ) -> Result<PieceData> {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Request {
                ticket,
                index,
                reply,
            })
            .map_err(|_| Error::Closed)?;

        let mut pending = PendingRequest {
            commands: &self.commands,
            ticket,
            index,
            answered: false,
        };
        tokio::select! {
            result = response => {
                pending.answered = true;
                result.unwrap_or(Err(Error::Closed))
            }
            _ = tokio::time::sleep(self.request_timeout) => Err(Error::Timeout(self.request_timeout)),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Close the session and wait until its lease is released
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.done.cancelled().await;
    }

    /// Resolves once the session has ended for any reason
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }
}

/// Withdraws a request from the driver unless it was answered. Covers
/// timeouts, cancellation and callers that drop the request future.
struct PendingRequest<'a> {
    commands: &'a mpsc::UnboundedSender<Command>,
    ticket: u64,
    index: u32,
    answered: bool,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if !self.answered {
            // A closed driver has nothing to free
            let _ = self.commands.send(Command::Abandon {
                ticket: self.ticket,
                index: self.index,
            });
        }
    }
}

struct Driver {
    id: Uuid,
    peer: PeerInfo,
    task_id: TaskId,
    store: Arc<dyn PieceStore>,
    window: usize,
    idle_timeout: Duration,

    outbound: mpsc::UnboundedSender<SyncMessage>,
    inbound: mpsc::UnboundedReceiver<SyncMessage>,
    commands: mpsc::UnboundedReceiver<Command>,

    // Requesting direction: an index with waiters is either queued or in flight
    queued: VecDeque<u32>,
    in_flight: HashSet<u32>,
    waiters: HashMap<u32, Vec<(u64, Reply)>>,

    // Serving direction
    serve_queue: VecDeque<u32>,
    serving: JoinSet<SyncMessage>,

    shutdown: CancellationToken,
    done: CancellationToken,
    reason: Arc<OnceLock<CloseReason>>,
    sessions: SessionTable,
    _lease: SessionLease,
}

impl Driver {
    async fn run(mut self) {
        info!(
            session = %self.id,
            peer = %self.peer.id,
            task_id = %self.task_id,
            "sync session opened"
        );

        let mut last_activity = Instant::now();
        let reason = loop {
            let idle_deadline = last_activity + self.idle_timeout;
            tokio::select! {
                _ = self.shutdown.cancelled() => break CloseReason::Local,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break CloseReason::Local,
                },
                message = self.inbound.recv() => match message {
                    Some(SyncMessage::Close) | None => break CloseReason::Remote,
                    Some(message) => self.on_message(message),
                },
                Some(served) = self.serving.join_next(), if !self.serving.is_empty() => {
                    match served {
                        Ok(message) => {
                            if self.outbound.send(message).is_err() {
                                break CloseReason::Remote;
                            }
                        }
                        Err(e) => warn!(session = %self.id, error = %e, "serve task failed"),
                    }
                    self.pump_serves();
                }
                _ = tokio::time::sleep_until(idle_deadline) => break CloseReason::Idle,
            }
            last_activity = Instant::now();
        };

        self.finish(reason);
    }

    fn send(&self, message: SyncMessage) {
        if self.outbound.send(message).is_err() {
            debug!(session = %self.id, "peer stream already gone");
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Request {
                ticket,
                index,
                reply,
            } => {
                let waiters = self.waiters.entry(index).or_default();
                let fresh = waiters.is_empty();
                waiters.push((ticket, reply));
                if fresh {
                    self.queued.push_back(index);
                }
                self.pump_requests();
            }
            Command::Abandon { ticket, index } => {
                let Some(waiters) = self.waiters.get_mut(&index) else {
                    return;
                };
                waiters.retain(|(t, _)| *t != ticket);
                if !waiters.is_empty() {
                    return;
                }
                self.waiters.remove(&index);

                if self.in_flight.remove(&index) {
                    debug!(session = %self.id, index, "withdrawing piece request");
                    self.send(SyncMessage::Cancel { index });
                } else {
                    self.queued.retain(|&i| i != index);
                }
                self.pump_requests();
            }
        }
    }

    fn on_message(&mut self, message: SyncMessage) {
        match message {
            SyncMessage::Request { index } => {
                self.serve_queue.push_back(index);
                self.pump_serves();
            }
            SyncMessage::Cancel { index } => {
                let queued = self.serve_queue.len();
                self.serve_queue.retain(|&i| i != index);
                if self.serve_queue.len() != queued {
                    debug!(session = %self.id, index, "dropped cancelled serve");
                }
            }
            SyncMessage::Piece {
                index,
                digest,
                data,
            } => {
                let outcome = if piece_digest(&data) == digest {
                    Ok(PieceData {
                        index,
                        digest,
                        data,
                    })
                } else {
                    warn!(session = %self.id, peer = %self.peer.id, index, "piece failed digest check");
                    Err(Error::NotFound(format!(
                        "piece {} from peer {} failed digest check",
                        index, self.peer.id
                    )))
                };
                self.resolve(index, outcome);
            }
            SyncMessage::NotFound { index } => {
                let err = Error::NotFound(format!(
                    "peer {} has no piece {} of task {}",
                    self.peer.id, index, self.task_id
                ));
                self.resolve(index, Err(err));
            }
            SyncMessage::Close => {}
        }
    }

    fn resolve(&mut self, index: u32, outcome: Result<PieceData>) {
        if !self.in_flight.remove(&index) {
            debug!(session = %self.id, index, "ignoring unsolicited response");
            return;
        }
        for (_, reply) in self.waiters.remove(&index).unwrap_or_default() {
            let _ = reply.send(outcome.clone());
        }
        self.pump_requests();
    }

    fn pump_requests(&mut self) {
        while self.in_flight.len() < self.window {
            let Some(index) = self.queued.pop_front() else {
                break;
            };
            self.in_flight.insert(index);
            self.send(SyncMessage::Request { index });
        }
    }

    fn pump_serves(&mut self) {
        while self.serving.len() < self.window {
            let Some(index) = self.serve_queue.pop_front() else {
                break;
            };
            let store = Arc::clone(&self.store);
            let task_id = self.task_id.clone();
            self.serving
                .spawn(async move { serve_piece(store.as_ref(), &task_id, index).await });
        }
    }

    fn finish(mut self, reason: CloseReason) {
        if reason != CloseReason::Remote {
            self.send(SyncMessage::Close);
        }
        for (_, waiters) in self.waiters.drain() {
            for (_, reply) in waiters {
                let _ = reply.send(Err(Error::Closed));
            }
        }
        self.serving.abort_all();
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        let _ = self.reason.set(reason);

        info!(
            session = %self.id,
            peer = %self.peer.id,
            task_id = %self.task_id,
            reason = ?reason,
            "sync session closed"
        );

        let done = self.done.clone();
        drop(self);
        done.cancel();
    }
}

/// Opens, accepts and tracks sync sessions for this node
pub struct SyncEngine {
    local: PeerInfo,
    registry: Arc<TaskRegistry>,
    store: Arc<dyn PieceStore>,
    connector: Arc<dyn PeerConnector>,
    config: SyncConfig,
    sessions: SessionTable,
}

impl SyncEngine {
    pub fn new(
        local: PeerInfo,
        registry: Arc<TaskRegistry>,
        store: Arc<dyn PieceStore>,
        connector: Arc<dyn PeerConnector>,
        config: SyncConfig,
    ) -> Self {
        Self {
            local,
            registry,
            store,
            connector,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn local(&self) -> &PeerInfo {
        &self.local
    }

    /// Dial `peer` for `task_id`; the task must be known locally
    pub async fn open_session(&self, peer: &PeerInfo, task_id: &TaskId) -> Result<SessionHandle> {
        let entry = self.registry.require(task_id)?;
        let lease = entry.lease_session().await?;
        let channel = self.connector.connect(&self.local, peer, task_id).await?;
        Ok(self.spawn_session(peer.clone(), task_id.clone(), channel, lease))
    }

    /// Adopt a stream dialed by `peer`
    pub async fn accept_session(
        &self,
        peer: PeerInfo,
        task_id: TaskId,
        channel: SyncChannel,
    ) -> Result<SessionHandle> {
        let entry = self.registry.require(&task_id)?;
        let lease = entry.lease_session().await?;
        Ok(self.spawn_session(peer, task_id, channel, lease))
    }

    fn spawn_session(
        &self,
        peer: PeerInfo,
        task_id: TaskId,
        channel: SyncChannel,
        lease: SessionLease,
    ) -> SessionHandle {
        let id = Uuid::new_v4();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            id,
            peer: peer.clone(),
            task_id: task_id.clone(),
            commands: commands_tx,
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
            request_timeout: self.config.request_timeout(),
            tickets: Arc::new(AtomicU64::new(0)),
        };

        let driver = Driver {
            id,
            peer,
            task_id,
            store: Arc::clone(&self.store),
            window: self.config.window.max(1),
            idle_timeout: self.config.idle_timeout(),
            outbound: channel.tx,
            inbound: channel.rx,
            commands: commands_rx,
            queued: VecDeque::new(),
            in_flight: HashSet::new(),
            waiters: HashMap::new(),
            serve_queue: VecDeque::new(),
            serving: JoinSet::new(),
            shutdown: handle.shutdown.clone(),
            done: handle.done.clone(),
            reason: Arc::clone(&handle.reason),
            sessions: Arc::clone(&self.sessions),
            _lease: lease,
        };

        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, handle.clone());
        tokio::spawn(driver.run());
        handle
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn sessions_for(&self, task_id: &TaskId) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.task_id() == task_id)
            .count()
    }

    /// Close every live session and wait for them to drain
    pub async fn close_all(&self) {
        let handles: Vec<SessionHandle> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        futures::future::join_all(handles.iter().map(|h| h.close())).await;
    }
}
