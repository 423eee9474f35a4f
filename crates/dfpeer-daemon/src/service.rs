//! Task Lifecycle Service - the Dfdaemon RPC surface
//!
//! Features:
//! - DownloadTask registers a task and fetches pieces from peers in the background
//! - UploadTask streams an Available task to a file or HTTP destination
//! - StatTask / DeleteTask / SyncPieces
//! - Every mutation of a task goes through its registry entry lock

use async_trait::async_trait;
use dfpeer_core::config::StorageConfig;
use dfpeer_core::{
    Error, PieceStore, Result, Task, TaskEntry, TaskId, TaskRegistry, TaskSnapshot, TaskState,
};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::manager::LoadSummary;
use crate::session::SyncEngine;
use crate::transport::{PeerInfo, SyncChannel};
use crate::upload::UploadDestination;

/// What DownloadTask needs to know about the content
#[derive(Debug, Clone)]
pub struct DownloadSource {
    pub url: Option<String>,
    pub content_length: u64,
    /// `None` uses the node's configured piece length
    pub piece_length: Option<u64>,
    /// Tried in order until the task completes
    pub peers: Vec<PeerInfo>,
}

/// Outcome of one fetch pass against a single peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub fetched: Vec<u32>,
    pub absent: Vec<u32>,
    pub failed: Vec<u32>,
    pub completed: bool,
}

/// Peer daemon RPC surface. Unimplemented methods say so.
#[async_trait]
pub trait Dfdaemon: Send + Sync {
    async fn download_task(&self, _task_id: TaskId, _source: DownloadSource) -> Result<()> {
        Err(Error::Unimplemented("DownloadTask"))
    }

    async fn upload_task(&self, _task_id: TaskId, _destination: UploadDestination) -> Result<()> {
        Err(Error::Unimplemented("UploadTask"))
    }

    async fn stat_task(&self, _task_id: TaskId) -> Result<TaskSnapshot> {
        Err(Error::Unimplemented("StatTask"))
    }

    async fn delete_task(&self, _task_id: TaskId) -> Result<()> {
        Err(Error::Unimplemented("DeleteTask"))
    }

    /// Accept a piece-exchange stream opened by `peer`
    async fn sync_pieces(&self, _peer: PeerInfo, _task_id: TaskId, _channel: SyncChannel) -> Result<()> {
        Err(Error::Unimplemented("SyncPieces"))
    }
}

/// Daemon that implements nothing
pub struct UnimplementedDfdaemon;

impl Dfdaemon for UnimplementedDfdaemon {}

#[derive(Clone)]
pub struct TaskService {
    registry: Arc<TaskRegistry>,
    store: Arc<dyn PieceStore>,
    engine: Arc<SyncEngine>,
    piece_length: u64,
}

impl TaskService {
    pub fn new(
        registry: Arc<TaskRegistry>,
        store: Arc<dyn PieceStore>,
        engine: Arc<SyncEngine>,
    ) -> Self {
        Self {
            registry,
            store,
            engine,
            piece_length: StorageConfig::default().piece_length,
        }
    }

    /// Piece length for sources that do not carry one
    pub fn with_piece_length(mut self, piece_length: u64) -> Self {
        self.piece_length = piece_length;
        self
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub async fn list_tasks(&self) -> Vec<TaskSnapshot> {
        self.registry.list().await
    }

    pub fn load(&self) -> LoadSummary {
        LoadSummary {
            tasks: self.registry.len(),
            active_sessions: self.engine.active_sessions(),
        }
    }

    /// Register the task (or pick up the existing entry) and move it to
    /// Downloading. Returns true when a download was started.
    async fn begin_download(&self, task_id: &TaskId, source: &DownloadSource) -> Result<bool> {
        let piece_length = source.piece_length.unwrap_or(self.piece_length);
        if piece_length == 0 {
            return Err(Error::Internal(format!("task {} has zero piece length", task_id)));
        }
        loop {
            let (entry, inserted) = self.registry.get_or_insert_with(task_id, || {
                Task::new(
                    task_id.clone(),
                    source.url.clone(),
                    source.content_length,
                    piece_length,
                )
            });

            let mut task = entry.write().await;
            let state = task.state;
            match state {
                TaskState::Available | TaskState::Uploading => {
                    return Err(Error::AlreadyExists(format!("task {} is available", task_id)));
                }
                TaskState::Pending if inserted => {}
                TaskState::Pending | TaskState::Downloading => {
                    debug!(task_id = %task_id, ?state, "download already in progress");
                    return Ok(false);
                }
                TaskState::Failed => {
                    info!(task_id = %task_id, "restarting failed task");
                    task.restart()?;
                }
                TaskState::Deleted => {
                    // Lost a race with DeleteTask; register a fresh entry
                    drop(task);
                    self.registry.remove(task_id, &entry);
                    continue;
                }
            }

            task.start_download()?;
            if task.is_complete() {
                task.complete()?;
                info!(task_id = %task_id, "empty task available immediately");
                return Ok(false);
            }
            return Ok(true);
        }
    }

    async fn drive_download(self, task_id: TaskId, peers: Vec<PeerInfo>) {
        let attempted = peers.len();
        for peer in peers {
            match self.fetch_from_peer(&peer, &task_id).await {
                Ok(report) if report.completed => return,
                Ok(report) => debug!(
                    task_id = %task_id,
                    peer = %peer.id,
                    fetched = report.fetched.len(),
                    absent = report.absent.len(),
                    failed = report.failed.len(),
                    "peer exhausted, trying next"
                ),
                Err(Error::NotFound(_)) if self.registry.get(&task_id).is_none() => {
                    debug!(task_id = %task_id, "task removed during download");
                    return;
                }
                Err(e) => warn!(task_id = %task_id, peer = %peer.id, error = %e, "fetch from peer failed"),
            }
        }

        let Some(entry) = self.registry.get(&task_id) else {
            return;
        };
        let mut task = entry.write().await;
        if task.state == TaskState::Downloading && !task.is_complete() {
            let reason = format!(
                "{} piece(s) missing after trying {} peer(s)",
                task.piece_count() - task.available_count(),
                attempted
            );
            warn!(task_id = %task_id, %reason, "download failed");
            let _ = task.fail(reason);
        }
    }

    /// Pull every missing piece of `task_id` from `peer`, recording what
    /// arrives and what the peer lacks.
    pub async fn fetch_from_peer(&self, peer: &PeerInfo, task_id: &TaskId) -> Result<FetchReport> {
        let entry = self.registry.require(task_id)?;
        let missing = {
            let task = entry.read().await;
            if task.state != TaskState::Downloading {
                return Err(Error::Conflict(format!(
                    "task {} is {:?}, not downloading",
                    task_id, task.state
                )));
            }
            task.missing_pieces()
        };

        let session = self.engine.open_session(peer, task_id).await?;
        let mut requests: FuturesUnordered<_> = missing
            .iter()
            .map(|&index| {
                let session = &session;
                async move { (index, session.request_piece(index).await) }
            })
            .collect();

        let mut report = FetchReport::default();
        let mut outcome = Ok(());
        while let Some((index, result)) = requests.next().await {
            let recorded = match result {
                Ok(piece) => self.record_piece(&entry, task_id, index, piece.data).await.map(|_| {
                    report.fetched.push(index);
                }),
                Err(Error::NotFound(_)) => {
                    report.absent.push(index);
                    entry.write().await.mark_piece_absent(index)
                }
                Err(e) => {
                    debug!(task_id = %task_id, index, error = %e, "piece request failed");
                    report.failed.push(index);
                    Ok(())
                }
            };
            if let Err(e) = recorded {
                outcome = Err(e);
                break;
            }
        }
        drop(requests);
        session.close().await;
        outcome?;

        let mut task = entry.write().await;
        if task.state == TaskState::Downloading && task.is_complete() {
            task.complete()?;
            report.completed = true;
            info!(task_id = %task_id, pieces = task.piece_count(), "task available");
        }

        report.fetched.sort_unstable();
        report.absent.sort_unstable();
        report.failed.sort_unstable();
        Ok(report)
    }

    /// Store piece bytes obtained outside a peer session (back-to-source or
    /// seeding). Returns true once the task became Available.
    pub async fn import_piece(&self, task_id: &TaskId, index: u32, data: bytes::Bytes) -> Result<bool> {
        let entry = self.registry.require(task_id)?;
        self.record_piece(&entry, task_id, index, data).await?;

        let mut task = entry.write().await;
        if task.state == TaskState::Downloading && task.is_complete() {
            task.complete()?;
            info!(task_id = %task_id, pieces = task.piece_count(), "task available");
            return Ok(true);
        }
        Ok(false)
    }

    async fn record_piece(
        &self,
        entry: &TaskEntry,
        task_id: &TaskId,
        index: u32,
        data: bytes::Bytes,
    ) -> Result<()> {
        let digest = self.store.put_piece(task_id, index, data).await?;
        entry.write().await.mark_piece_available(index, digest)
    }
}

#[async_trait]
impl Dfdaemon for TaskService {
    async fn download_task(&self, task_id: TaskId, source: DownloadSource) -> Result<()> {
        if !self.begin_download(&task_id, &source).await? {
            return Ok(());
        }
        info!(task_id = %task_id, peers = source.peers.len(), "download started");

        if source.peers.is_empty() {
            // Stays Downloading until a peer offers pieces
            return Ok(());
        }
        tokio::spawn(self.clone().drive_download(task_id, source.peers));
        Ok(())
    }

    async fn upload_task(&self, task_id: TaskId, destination: UploadDestination) -> Result<()> {
        let entry = self.registry.require(&task_id)?;
        let _lease = entry.lease_upload().await?;
        let pieces: Vec<_> = entry.read().await.pieces.values().cloned().collect();

        let mut sink = destination.open().await?;
        for piece in &pieces {
            let data = match self.store.get_piece(&task_id, piece.index).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    return Err(Error::Unavailable(format!(
                        "piece {} of task {} missing from store",
                        piece.index, task_id
                    )));
                }
                Err(e) => {
                    return Err(Error::Unavailable(format!(
                        "piece {} of task {} unreadable: {}",
                        piece.index, task_id, e
                    )));
                }
            };
            sink.write_piece(piece, data).await?;
        }
        sink.finish().await?;

        info!(task_id = %task_id, destination = ?destination, pieces = pieces.len(), "upload finished");
        Ok(())
    }

    async fn stat_task(&self, task_id: TaskId) -> Result<TaskSnapshot> {
        let snapshot = self.registry.require(&task_id)?.snapshot().await;
        if snapshot.state == TaskState::Deleted {
            return Err(Error::not_found(&task_id));
        }
        Ok(snapshot)
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<()> {
        let entry = self.registry.require(&task_id)?;
        let reclaimed = {
            let mut task = entry.write().await;
            if task.state == TaskState::Deleted {
                return Err(Error::not_found(&task_id));
            }
            if entry.active_sessions() > 0 {
                return Err(Error::Conflict(format!(
                    "task {} has {} active session(s)",
                    task_id,
                    entry.active_sessions()
                )));
            }
            if entry.active_uploads() > 0 {
                return Err(Error::Conflict(format!("task {} is uploading", task_id)));
            }
            // Reclaim under the entry lock; a re-download of this id waits for it
            let reclaimed = self.store.reclaim(&task_id).await?;
            task.delete();
            reclaimed
        };

        self.registry.remove(&task_id, &entry);
        info!(task_id = %task_id, reclaimed, "task deleted");
        Ok(())
    }

    async fn sync_pieces(&self, peer: PeerInfo, task_id: TaskId, channel: SyncChannel) -> Result<()> {
        self.engine.accept_session(peer, task_id, channel).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalNetwork;
    use bytes::Bytes;
    use dfpeer_core::config::SyncConfig;
    use dfpeer_core::MemoryPieceStore;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn service(name: &str, network: &Arc<LocalNetwork>) -> Arc<TaskService> {
        service_with_store(name, network, Arc::new(MemoryPieceStore::new()), 4)
    }

    fn service_with_store(
        name: &str,
        network: &Arc<LocalNetwork>,
        store: Arc<dyn PieceStore>,
        piece_length: u64,
    ) -> Arc<TaskService> {
        let registry = Arc::new(TaskRegistry::new());
        let engine = Arc::new(SyncEngine::new(
            PeerInfo::local(name),
            Arc::clone(&registry),
            Arc::clone(&store),
            network.clone(),
            SyncConfig::default(),
        ));
        let service = Arc::new(TaskService::new(registry, store, engine).with_piece_length(piece_length));
        network.register(name, &service);
        service
    }

    fn source(peers: Vec<PeerInfo>) -> DownloadSource {
        DownloadSource {
            url: Some("https://example.com/blob".into()),
            content_length: 8,
            piece_length: Some(4),
            peers,
        }
    }

    /// Seed `service` with an Available two-piece task
    async fn seed(service: &TaskService, id: &TaskId) {
        service.download_task(id.clone(), source(vec![])).await.unwrap();
        assert!(!service.import_piece(id, 0, Bytes::from_static(b"abcd")).await.unwrap());
        assert!(service.import_piece(id, 1, Bytes::from_static(b"efgh")).await.unwrap());
    }

    /// Memory store whose reclaim waits for a permit
    struct SlowReclaimStore {
        inner: MemoryPieceStore,
        gate: Semaphore,
    }

    #[async_trait]
    impl PieceStore for SlowReclaimStore {
        async fn put_piece(&self, task_id: &TaskId, index: u32, data: Bytes) -> Result<String> {
            self.inner.put_piece(task_id, index, data).await
        }

        async fn get_piece(&self, task_id: &TaskId, index: u32) -> Result<Option<Bytes>> {
            self.inner.get_piece(task_id, index).await
        }

        async fn reclaim(&self, task_id: &TaskId) -> Result<usize> {
            let _permit = self.gate.acquire().await.map_err(|_| Error::Closed)?;
            self.inner.reclaim(task_id).await
        }
    }

    async fn wait_for_state(service: &TaskService, id: &TaskId, state: TaskState) -> TaskSnapshot {
        for _ in 0..200 {
            let snapshot = service.stat_task(id.clone()).await.unwrap();
            if snapshot.state == state {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached {:?}", id, state);
    }

    #[tokio::test]
    async fn test_unimplemented_daemon() {
        let daemon = UnimplementedDfdaemon;
        let err = daemon.stat_task("t1".into()).await.unwrap_err();
        assert_eq!(err, Error::Unimplemented("StatTask"));
    }

    #[tokio::test]
    async fn test_download_from_seeded_peer() {
        let network = Arc::new(LocalNetwork::new());
        let seeder = service("seeder", &network);
        let leecher = service("leecher", &network);
        let id = TaskId::from("t1");
        seed(&seeder, &id).await;

        leecher
            .download_task(id.clone(), source(vec![PeerInfo::local("seeder")]))
            .await
            .unwrap();
        let snapshot = wait_for_state(&leecher, &id, TaskState::Available).await;
        assert_eq!(snapshot.available_count(), 2);
        assert_eq!(
            leecher.store.get_piece(&id, 1).await.unwrap().as_deref(),
            Some(&b"efgh"[..])
        );
    }

    #[tokio::test]
    async fn test_download_reissue_semantics() {
        let network = Arc::new(LocalNetwork::new());
        let node = service("a", &network);
        let id = TaskId::from("t1");

        node.download_task(id.clone(), source(vec![])).await.unwrap();
        node.download_task(id.clone(), source(vec![])).await.unwrap();
        assert_eq!(node.stat_task(id.clone()).await.unwrap().state, TaskState::Downloading);

        node.registry.require(&id).unwrap().write().await.fail("gone").unwrap();
        node.download_task(id.clone(), source(vec![])).await.unwrap();
        assert_eq!(node.stat_task(id.clone()).await.unwrap().state, TaskState::Downloading);

        let other = TaskId::from("t2");
        seed(&node, &other).await;
        let err = node.download_task(other, source(vec![])).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_unreachable_peers_fail_task() {
        let network = Arc::new(LocalNetwork::new());
        let node = service("a", &network);
        let id = TaskId::from("t1");

        node.download_task(id.clone(), source(vec![PeerInfo::local("ghost")]))
            .await
            .unwrap();
        let snapshot = wait_for_state(&node, &id, TaskState::Failed).await;
        assert!(snapshot.failure.unwrap().contains("1 peer"));
    }

    #[tokio::test]
    async fn test_upload_to_file() {
        let network = Arc::new(LocalNetwork::new());
        let node = service("a", &network);
        let id = TaskId::from("t1");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");

        let err = node
            .upload_task("missing".into(), UploadDestination::File(path.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        seed(&node, &id).await;
        node.upload_task(id.clone(), UploadDestination::File(path.clone()))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdefgh");
        assert_eq!(node.stat_task(id).await.unwrap().state, TaskState::Available);
    }

    #[tokio::test]
    async fn test_upload_with_reclaimed_pieces_is_unavailable() {
        let network = Arc::new(LocalNetwork::new());
        let node = service("a", &network);
        let id = TaskId::from("t1");
        seed(&node, &id).await;
        assert_eq!(node.store.reclaim(&id).await.unwrap(), 2);

        let dir = tempfile::tempdir().unwrap();
        let err = node
            .upload_task(id.clone(), UploadDestination::File(dir.path().join("blob")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)), "got {:?}", err);
        assert_eq!(node.stat_task(id).await.unwrap().state, TaskState::Available);
    }

    #[tokio::test]
    async fn test_upload_of_downloading_task_is_not_found() {
        let network = Arc::new(LocalNetwork::new());
        let node = service("a", &network);
        let id = TaskId::from("t1");
        node.download_task(id.clone(), source(vec![])).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let err = node
            .upload_task(id, UploadDestination::File(dir.path().join("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_reclaims_and_forgets() {
        let network = Arc::new(LocalNetwork::new());
        let node = service("a", &network);
        let id = TaskId::from("t1");
        seed(&node, &id).await;

        node.delete_task(id.clone()).await.unwrap();
        assert!(matches!(node.stat_task(id.clone()).await, Err(Error::NotFound(_))));
        assert!(!node.store.has_piece(&id, 0).await.unwrap());
        assert!(matches!(node.delete_task(id.clone()).await, Err(Error::NotFound(_))));

        // A deleted id can be downloaded again from scratch
        node.download_task(id.clone(), source(vec![])).await.unwrap();
        assert_eq!(node.stat_task(id).await.unwrap().available_count(), 0);
    }

    #[tokio::test]
    async fn test_redownload_waits_for_delete_reclaim() {
        let network = Arc::new(LocalNetwork::new());
        let store = Arc::new(SlowReclaimStore {
            inner: MemoryPieceStore::new(),
            gate: Semaphore::new(0),
        });
        let node = service_with_store("a", &network, store.clone(), 4);
        let id = TaskId::from("t1");
        seed(&node, &id).await;

        let delete = tokio::spawn({
            let node = Arc::clone(&node);
            let id = id.clone();
            async move { node.delete_task(id).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let redownload = tokio::spawn({
            let node = Arc::clone(&node);
            let id = id.clone();
            async move { node.download_task(id, source(vec![])).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!redownload.is_finished());

        store.gate.add_permits(1);
        delete.await.unwrap().unwrap();
        redownload.await.unwrap().unwrap();

        assert!(!node.import_piece(&id, 0, Bytes::from_static(b"wxyz")).await.unwrap());
        assert!(node.import_piece(&id, 1, Bytes::from_static(b"1234")).await.unwrap());
        assert_eq!(node.stat_task(id.clone()).await.unwrap().state, TaskState::Available);
        assert_eq!(
            node.store.get_piece(&id, 0).await.unwrap().as_deref(),
            Some(&b"wxyz"[..])
        );
    }

    #[tokio::test]
    async fn test_source_without_piece_length_uses_node_default() {
        let network = Arc::new(LocalNetwork::new());
        let node = service_with_store("a", &network, Arc::new(MemoryPieceStore::new()), 3);
        let id = TaskId::from("t1");
        let mut unsized_source = source(vec![]);
        unsized_source.piece_length = None;

        node.download_task(id.clone(), unsized_source).await.unwrap();
        let snapshot = node.stat_task(id.clone()).await.unwrap();
        assert_eq!(snapshot.pieces.len(), 3);
        assert_eq!(snapshot.pieces[&2].length, 2);

        let other = TaskId::from("t2");
        node.download_task(other.clone(), source(vec![])).await.unwrap();
        assert_eq!(node.stat_task(other).await.unwrap().pieces.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_during_upload_conflicts() {
        let network = Arc::new(LocalNetwork::new());
        let node = service("a", &network);
        let id = TaskId::from("t1");
        seed(&node, &id).await;

        let entry = node.registry.require(&id).unwrap();
        let lease = entry.lease_upload().await.unwrap();
        assert_eq!(node.stat_task(id.clone()).await.unwrap().state, TaskState::Uploading);
        assert!(matches!(node.delete_task(id.clone()).await, Err(Error::Conflict(_))));

        drop(lease);
        node.delete_task(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_and_list() {
        let network = Arc::new(LocalNetwork::new());
        let node = service("a", &network);
        for id in ["b", "a"] {
            node.download_task(id.into(), source(vec![])).await.unwrap();
        }
        assert_eq!(node.load(), LoadSummary { tasks: 2, active_sessions: 0 });
        let ids: Vec<String> = node.list_tasks().await.iter().map(|t| t.id.to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
