//! dfpeer daemon - peer-side piece exchange and cluster membership
//!
//! Features:
//! - Full-duplex SyncPieces sessions with a bounded request window
//! - Task lifecycle RPCs: download, upload, stat, delete
//! - KeepAlive membership with the manager, backoff on failure
//! - In-process peer network for embedding and tests

pub mod daemon;
pub mod logging;
pub mod manager;
pub mod membership;
pub mod service;
pub mod session;
pub mod transport;
pub mod upload;

pub use daemon::Daemon;
pub use manager::{
    ConfigUpdate, KeepAliveRequest, KeepAliveStream, LoadSummary, ManagerClient, SourceType,
    UnimplementedManager,
};
pub use membership::{
    ConfigReloader, LoadReporter, MembershipClient, MembershipHandle, MembershipLease,
    MembershipStats, NodeIdentity,
};
pub use service::{DownloadSource, Dfdaemon, FetchReport, TaskService, UnimplementedDfdaemon};
pub use session::{serve_piece, CloseReason, PieceData, SessionHandle, SyncEngine};
pub use transport::{LocalNetwork, PeerConnector, PeerInfo, SyncChannel, SyncMessage};
pub use upload::{FileSink, HttpSink, UploadDestination, UploadSink};
