//! Sync engine: one synchronization run per target.
//!
//! A run resolves the target's session through the [`SessionRegistry`],
//! moves matching remote reports into `<media_root>/<target_name>/`, ingests
//! them into the target's archive and purges the staging directory. Coarse
//! progress checkpoints are delivered to a caller-supplied callback, and the
//! outcome of every run is recorded in `<data_dir>/sync_status.json`.
//!
//! # Example
//!
//! ```rust,ignore
//! use racksync::sources::registry::SessionRegistry;
//! use racksync::sources::sync::SyncEngine;
//!
//! let registry = Arc::new(SessionRegistry::ssh(DEFAULT_CONNECT_TIMEOUT));
//! let engine = SyncEngine::new(&media_root, &data_dir, registry);
//!
//! let outcome = engine.synchronize(&storage, target_id, |p| println!("{p}"))?;
//! println!("{}: {} moved", outcome.target_name, outcome.files_moved);
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use super::mover::{self, MoveError, RemotePreview, ReportPattern};
use super::registry::SessionRegistry;
use super::session::{ConnectError, RemoteError, RemoteFs};
use crate::ingest::ArchiveIngestor;
use crate::model::types::{SyncTarget, check_target_name};
use crate::storage::sqlite::SqliteStorage;

/// Errors that end a synchronization run.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("no sync target with id {0}")]
    TargetNotFound(i64),

    #[error("a sync for target '{0}' is already running")]
    AlreadyRunning(String),

    #[error("target name '{name}' {reason}")]
    InvalidTargetName { name: String, reason: &'static str },

    #[error("could not connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: ConnectError,
    },

    #[error(transparent)]
    Move(#[from] MoveError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for SyncError {
    fn from(e: anyhow::Error) -> Self {
        SyncError::Storage(format!("{e:#}"))
    }
}

/// Checkpoint within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum SyncStage {
    Connecting,
    Downloading,
    Archiving,
    Cleanup,
    Complete,
    Failed { error: String },
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStage::Connecting => write!(f, "Connecting"),
            SyncStage::Downloading => write!(f, "Downloading"),
            SyncStage::Archiving => write!(f, "Archiving"),
            SyncStage::Cleanup => write!(f, "Cleanup"),
            SyncStage::Complete => write!(f, "Complete"),
            SyncStage::Failed { error } => write!(f, "Failed: {}", error),
        }
    }
}

/// Progress event delivered to the caller's callback.
#[derive(Debug, Clone, Serialize)]
pub struct SyncProgress {
    /// Opaque identifier shared by all events of one run.
    pub run_id: String,
    pub target: String,
    #[serde(flatten)]
    pub stage: SyncStage,
    pub message: String,
}

impl std::fmt::Display for SyncProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.target, self.stage, self.message)
    }
}

/// Overall result of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Success,
    /// Completed, but some files were skipped or left on the remote.
    PartialFailure,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::PartialFailure => write!(f, "partial_failure"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncOutcome {
    pub run_id: String,
    pub target_name: String,
    pub status: RunStatus,
    /// Files copied from the remote, including those whose delete failed.
    pub files_moved: usize,
    pub files_ingested: usize,
    pub files_skipped: usize,
    /// Remote paths that were copied but could not be deleted.
    pub retained_on_remote: Vec<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl SyncOutcome {
    fn failed(run_id: String, target_name: impl Into<String>, error: &SyncError) -> Self {
        Self {
            run_id,
            target_name: target_name.into(),
            status: RunStatus::Failed,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

/// Marks a target as in flight until dropped.
struct RunGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    target: String,
}

impl<'a> RunGuard<'a> {
    fn acquire(in_flight: &'a Mutex<HashSet<String>>, target: &str) -> Option<Self> {
        if !in_flight.lock().insert(target.to_string()) {
            return None;
        }
        Some(Self {
            in_flight,
            target: target.to_string(),
        })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.target);
    }
}

pub struct SyncEngine {
    media_root: PathBuf,
    data_dir: PathBuf,
    registry: Arc<SessionRegistry>,
    pattern: ReportPattern,
    in_flight: Mutex<HashSet<String>>,
}

impl SyncEngine {
    pub fn new(media_root: &Path, data_dir: &Path, registry: Arc<SessionRegistry>) -> Self {
        Self {
            media_root: media_root.to_path_buf(),
            data_dir: data_dir.to_path_buf(),
            registry,
            pattern: ReportPattern::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_pattern(mut self, pattern: ReportPattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn pattern(&self) -> &ReportPattern {
        &self.pattern
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Staging directory for a target: `<media_root>/<target_name>/`.
    ///
    /// Fails for names that would leave the media root or land on an
    /// `archive_*` directory.
    pub fn staging_dir(&self, target_name: &str) -> Result<PathBuf, SyncError> {
        check_target_name(target_name).map_err(|reason| SyncError::InvalidTargetName {
            name: target_name.to_string(),
            reason,
        })?;
        Ok(self.media_root.join(target_name))
    }

    /// Run one synchronization for the stored target `target_id`.
    ///
    /// Every run, successful or not, is recorded in the sync status file.
    pub fn synchronize<F>(
        &self,
        storage: &SqliteStorage,
        target_id: i64,
        on_progress: F,
    ) -> Result<SyncOutcome, SyncError>
    where
        F: Fn(SyncProgress),
    {
        let target = storage
            .get_target(target_id)?
            .ok_or(SyncError::TargetNotFound(target_id))?;

        let _guard = RunGuard::acquire(&self.in_flight, &target.name)
            .ok_or_else(|| SyncError::AlreadyRunning(target.name.clone()))?;

        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("sync", target = %target.name, run_id = %run_id);
        let _enter = span.enter();

        let start = Instant::now();
        let emit = |stage: SyncStage, message: String| {
            on_progress(SyncProgress {
                run_id: run_id.clone(),
                target: target.name.clone(),
                stage,
                message,
            });
        };

        let result = self.run(storage, &target, &run_id, &emit);
        let outcome = match result {
            Ok(mut outcome) => {
                outcome.duration_ms = start.elapsed().as_millis() as u64;
                emit(
                    SyncStage::Complete,
                    format!(
                        "{} moved, {} archived, {} skipped",
                        outcome.files_moved, outcome.files_ingested, outcome.files_skipped
                    ),
                );
                info!(
                    status = %outcome.status,
                    moved = outcome.files_moved,
                    ingested = outcome.files_ingested,
                    skipped = outcome.files_skipped,
                    duration_ms = outcome.duration_ms,
                    "sync completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(error = %e, "sync failed");
                emit(
                    SyncStage::Failed {
                        error: e.to_string(),
                    },
                    "sync aborted".to_string(),
                );
                Err(e)
            }
        };

        let record = match &outcome {
            Ok(o) => o.clone(),
            Err(e) => {
                let mut failed = SyncOutcome::failed(run_id.clone(), &target.name, e);
                failed.duration_ms = start.elapsed().as_millis() as u64;
                failed
            }
        };
        self.record_status(&record);
        outcome
    }

    fn run(
        &self,
        storage: &SqliteStorage,
        target: &SyncTarget,
        run_id: &str,
        emit: &dyn Fn(SyncStage, String),
    ) -> Result<SyncOutcome, SyncError> {
        let staging = self.staging_dir(&target.name)?;
        let host = &target.endpoint.host;
        emit(SyncStage::Connecting, format!("connecting to {host}"));
        let shared = self
            .registry
            .connected(&target.endpoint)
            .map_err(|source| SyncError::Connect {
                host: host.clone(),
                source,
            })?;

        let remote_dir = target.directory.resolved_path();
        emit(
            SyncStage::Downloading,
            format!("moving files matching '{}' from {remote_dir}", self.pattern),
        );
        let moved = {
            let mut session = shared.lock();
            let moved = mover::move_matching(&**session, &remote_dir, &staging, &self.pattern);
            if let Err(MoveError::List { source, .. }) = &moved {
                drop_on_transport_error(&mut **session, source);
            }
            moved?
        };

        emit(
            SyncStage::Archiving,
            format!("archiving {} file(s)", moved.moved()),
        );
        let ingestor = ArchiveIngestor::new(storage, &self.media_root, &self.pattern);
        let ingest = ingestor.ingest_staged(target, &staging)?;

        emit(SyncStage::Cleanup, format!("purging {}", staging.display()));
        let purge = ingestor.purge_staging(&staging, &ingest);

        let retained: Vec<String> = moved
            .retained_on_remote()
            .map(|o| o.remote_path.clone())
            .collect();
        let clean = retained.is_empty()
            && moved.failed().count() == 0
            && ingest.skipped.is_empty()
            && purge.errors.is_empty();

        Ok(SyncOutcome {
            run_id: run_id.to_string(),
            target_name: target.name.clone(),
            status: if clean {
                RunStatus::Success
            } else {
                RunStatus::PartialFailure
            },
            files_moved: moved.moved(),
            files_ingested: ingest.ingested.len(),
            files_skipped: ingest.skipped.len(),
            retained_on_remote: retained,
            duration_ms: 0,
            error: None,
        })
    }

    /// Synchronize every stored target in turn. Failures become `Failed` outcomes.
    pub fn sync_all<F>(&self, storage: &SqliteStorage, on_progress: F) -> Result<Vec<SyncOutcome>, SyncError>
    where
        F: Fn(SyncProgress),
    {
        let mut outcomes = Vec::new();
        for target in storage.list_targets()? {
            let Some(id) = target.id else { continue };
            match self.synchronize(storage, id, &on_progress) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => outcomes.push(SyncOutcome::failed(String::new(), &target.name, &e)),
            }
        }
        Ok(outcomes)
    }

    /// List the remote reports a run would move, without transferring anything.
    pub fn peek(&self, target: &SyncTarget) -> Result<Vec<RemotePreview>, SyncError> {
        let shared = self
            .registry
            .connected(&target.endpoint)
            .map_err(|source| SyncError::Connect {
                host: target.endpoint.host.clone(),
                source,
            })?;
        let remote_dir = target.directory.resolved_path();
        let mut session = shared.lock();
        mover::preview_matching(&**session, &remote_dir, &self.pattern).map_err(|source| {
            drop_on_transport_error(&mut **session, &source);
            SyncError::Move(MoveError::List {
                dir: remote_dir.clone(),
                source,
            })
        })
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus::load(&self.data_dir).unwrap_or_else(|e| {
            warn!(error = %e, "could not read sync status; starting fresh");
            SyncStatus::default()
        })
    }

    fn record_status(&self, outcome: &SyncOutcome) {
        let mut status = self.status();
        status.update(outcome);
        if let Err(e) = status.save(&self.data_dir) {
            warn!(error = %e, "could not save sync status");
        }
    }
}

/// Close a session whose transport failed so the next run reconnects it.
fn drop_on_transport_error(session: &mut dyn RemoteFs, error: &RemoteError) {
    if error.is_transport() {
        warn!(host = %session.host(), error = %error, "closing remote session after transport failure");
        session.close();
    }
}

// =============================================================================
// Sync Status Persistence
// =============================================================================

/// Last-run information for one target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetSyncInfo {
    /// Milliseconds since the Unix epoch.
    pub last_sync: Option<i64>,
    pub last_result: RunStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub run_id: String,
    pub files_moved: usize,
    pub files_ingested: usize,
    #[serde(default)]
    pub retained_on_remote: usize,
    pub duration_ms: u64,
}

/// Persistent sync status keyed by target name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub targets: HashMap<String, TargetSyncInfo>,
}

impl SyncStatus {
    pub fn load(data_dir: &Path) -> Result<Self, std::io::Error> {
        let path = Self::status_path(data_dir);
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), std::io::Error> {
        let path = Self::status_path(data_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)
    }

    pub fn update(&mut self, outcome: &SyncOutcome) {
        self.targets.insert(
            outcome.target_name.clone(),
            TargetSyncInfo {
                last_sync: Some(Utc::now().timestamp_millis()),
                last_result: outcome.status.clone(),
                last_error: outcome.error.clone(),
                run_id: outcome.run_id.clone(),
                files_moved: outcome.files_moved,
                files_ingested: outcome.files_ingested,
                retained_on_remote: outcome.retained_on_remote.len(),
                duration_ms: outcome.duration_ms,
            },
        );
    }

    pub fn get(&self, target_name: &str) -> Option<&TargetSyncInfo> {
        self.targets.get(target_name)
    }

    fn status_path(data_dir: &Path) -> PathBuf {
        data_dir.join("sync_status.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::{RemoteDirectorySpec, RemoteEndpoint};
    use crate::sources::session::{RemoteFs, RemoteSession};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn run_guard_rejects_second_holder() {
        let in_flight = Mutex::new(HashSet::new());
        let first = RunGuard::acquire(&in_flight, "rack-01");
        assert!(first.is_some());
        assert!(RunGuard::acquire(&in_flight, "rack-01").is_none());
        assert!(RunGuard::acquire(&in_flight, "rack-02").is_some());
        drop(first);
        assert!(RunGuard::acquire(&in_flight, "rack-01").is_some());
    }

    #[test]
    fn status_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let mut status = SyncStatus::default();
        status.update(&SyncOutcome {
            run_id: "abc".into(),
            target_name: "rack-01".into(),
            status: RunStatus::PartialFailure,
            files_moved: 3,
            files_ingested: 2,
            retained_on_remote: vec!["/r/a.html".into()],
            ..Default::default()
        });
        status.save(dir.path()).unwrap();

        let loaded = SyncStatus::load(dir.path()).unwrap();
        let info = loaded.get("rack-01").unwrap();
        assert_eq!(info.last_result, RunStatus::PartialFailure);
        assert_eq!(info.files_moved, 3);
        assert_eq!(info.retained_on_remote, 1);
        assert!(info.last_sync.is_some());
    }

    #[test]
    fn missing_status_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(SyncStatus::load(dir.path()).unwrap().targets.is_empty());
    }

    #[test]
    fn stage_display_and_json_tag() {
        let failed = SyncStage::Failed {
            error: "boom".into(),
        };
        assert_eq!(failed.to_string(), "Failed: boom");
        let json = serde_json::to_value(SyncProgress {
            run_id: "r".into(),
            target: "t".into(),
            stage: SyncStage::Archiving,
            message: "m".into(),
        })
        .unwrap();
        assert_eq!(json["stage"], "archiving");
        assert_eq!(json["run_id"], "r");
    }

    fn unreachable_engine(dir: &Path) -> SyncEngine {
        let registry = SessionRegistry::new(|ep| {
            Box::new(RemoteSession::new(ep.clone()).with_connect_timeout(Duration::from_millis(200)))
                as Box<dyn RemoteFs>
        });
        SyncEngine::new(&dir.join("media"), dir, Arc::new(registry))
    }

    #[test]
    fn unknown_target_is_an_error() {
        let dir = TempDir::new().unwrap();
        let storage = SqliteStorage::open(&dir.path().join("db.sqlite")).unwrap();
        let engine = unreachable_engine(dir.path());
        let err = engine.synchronize(&storage, 42, |_| {}).unwrap_err();
        assert!(matches!(err, SyncError::TargetNotFound(42)));
    }

    #[test]
    fn connect_failure_is_recorded_as_failed() {
        let dir = TempDir::new().unwrap();
        let storage = SqliteStorage::open(&dir.path().join("db.sqlite")).unwrap();
        let target = SyncTarget {
            id: None,
            name: "rack-01".into(),
            // No credentials: fails before any network I/O.
            endpoint: RemoteEndpoint::new("127.0.0.1"),
            directory: RemoteDirectorySpec::new("/reports"),
            archive_id: None,
        };
        let id = storage.upsert_target(&target).unwrap();
        let engine = unreachable_engine(dir.path());

        let stages = std::cell::RefCell::new(Vec::new());
        let err = engine
            .synchronize(&storage, id, |p| stages.borrow_mut().push(p.stage))
            .unwrap_err();
        assert!(matches!(err, SyncError::Connect { .. }));

        let stages = stages.into_inner();
        assert_eq!(stages.first(), Some(&SyncStage::Connecting));
        assert!(matches!(stages.last(), Some(SyncStage::Failed { .. })));

        let info = engine.status().get("rack-01").cloned().unwrap();
        assert_eq!(info.last_result, RunStatus::Failed);
        assert!(info.last_error.is_some());
        // The guard is released after a failed run.
        assert!(matches!(
            engine.synchronize(&storage, id, |_| {}).unwrap_err(),
            SyncError::Connect { .. }
        ));
    }
}
