//! Pulling test reports from remote racks over SFTP.
//!
//! # Architecture
//!
//! - **session**: one authenticated SSH/SFTP connection and the [`RemoteFs`]
//!   primitives built on it
//! - **registry**: per-process cache of sessions keyed by host
//! - **mover**: pattern-based copy-then-delete of remote files into staging
//! - **sync**: the engine that runs a full synchronization for one target
//!
//! # Flow
//!
//! ```text
//! target id ─▶ SessionRegistry ─▶ move_matching ─▶ ArchiveIngestor ─▶ purge
//!               (connect once)    (remote → staging) (staging → archive)
//! ```
//!
//! [`RemoteFs`]: session::RemoteFs

pub mod mover;
pub mod registry;
pub mod session;
pub mod sync;

pub use mover::{MoveOutcome, MoveReport, RemotePreview, ReportPattern, move_matching};
pub use registry::{SessionRegistry, SharedSession};
pub use session::{ConnectError, RemoteError, RemoteFs, RemoteSession};
pub use sync::{RunStatus, SyncEngine, SyncError, SyncOutcome, SyncProgress, SyncStage, SyncStatus};
