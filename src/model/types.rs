//! Normalized entity structs.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default SSH port used when an endpoint does not specify one.
pub const DEFAULT_SSH_PORT: u16 = 22;

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Connection details for one remote host. The host address is the identity key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub host: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl RemoteEndpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: None,
            password: None,
            private_key_path: None,
            port: DEFAULT_SSH_PORT,
        }
    }
}

// Passwords never end up in logs.
impl std::fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key_path", &self.private_key_path)
            .field("port", &self.port)
            .finish()
    }
}

/// The remote directory scanned for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDirectorySpec {
    pub remote_path: String,
}

impl RemoteDirectorySpec {
    pub fn new(remote_path: impl Into<String>) -> Self {
        Self {
            remote_path: remote_path.into(),
        }
    }

    /// Path as understood by the SFTP server.
    ///
    /// SFTP resolves relative paths against the login directory, so a leading
    /// `~` is rewritten to a relative path instead of being sent verbatim.
    pub fn resolved_path(&self) -> String {
        let path = self.remote_path.trim();
        if path.is_empty() || path == "~" || path == "~/" {
            return ".".to_string();
        }
        match path.strip_prefix("~/") {
            Some(rest) => rest.trim_end_matches('/').to_string(),
            None if path.len() > 1 => path.trim_end_matches('/').to_string(),
            None => path.to_string(),
        }
    }
}

/// A logical grouping (usually a physical rack) that owns one endpoint and one
/// remote directory, and is linked to one archive after its first sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTarget {
    pub id: Option<i64>,
    pub name: String,
    pub endpoint: RemoteEndpoint,
    pub directory: RemoteDirectorySpec,
    pub archive_id: Option<i64>,
}

/// Outcome recorded for a single test report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    #[default]
    Unset,
    Passed,
    Failed,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Unset => "",
            Verdict::Passed => "PASSED",
            Verdict::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" => Some(Verdict::Unset),
            "PASSED" => Some(Verdict::Passed),
            "FAILED" => Some(Verdict::Failed),
            _ => None,
        }
    }

    /// `Failed` if the name mentions "error" in any casing, else `Passed`.
    pub fn from_filename(name: &str) -> Self {
        if name.to_lowercase().contains("error") {
            Verdict::Failed
        } else {
            Verdict::Passed
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Unset => write!(f, "unset"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub id: Option<i64>,
    pub archive_id: i64,
    /// Original remote filename.
    pub name: String,
    pub verdict: Verdict,
    pub created: DateTime<Utc>,
    /// Stored copy of the report, relative to the media root.
    pub file_path: Option<PathBuf>,
}

/// A named collection of reports. Counts are always derived from `reports`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportArchive {
    pub id: Option<i64>,
    pub name: String,
    pub reports: Vec<Report>,
}

impl ReportArchive {
    pub fn passed(&self) -> usize {
        self.count(Verdict::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(Verdict::Failed)
    }

    fn count(&self, verdict: Verdict) -> usize {
        self.reports.iter().filter(|r| r.verdict == verdict).count()
    }

    /// Most recent report by creation time; ties go to the later-inserted row.
    pub fn latest(&self) -> Option<&Report> {
        self.reports
            .iter()
            .max_by_key(|r| (r.created, r.id.unwrap_or_default()))
    }

    /// Directory (relative to the media root) holding this archive's files.
    pub fn storage_dir_name(&self) -> String {
        archive_dir_name(&self.name)
    }
}

/// Prefix of archive storage directories under the media root.
pub const ARCHIVE_DIR_PREFIX: &str = "archive_";

pub fn archive_dir_name(archive_name: &str) -> String {
    format!("{ARCHIVE_DIR_PREFIX}{archive_name}")
}

/// Check that `name` can be used as a target's staging directory.
///
/// Target names become single directories under the media root, next to the
/// `archive_*` directories, so they must be one normal path component that
/// cannot collide with an archive.
pub fn check_target_name(name: &str) -> Result<(), &'static str> {
    if name.trim().is_empty() {
        return Err("must not be empty");
    }
    if name.contains(['/', '\\']) {
        return Err("must not contain path separators");
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == name => {}
        _ => return Err("must be a plain directory name"),
    }
    if name.starts_with(ARCHIVE_DIR_PREFIX) {
        return Err("must not start with 'archive_'");
    }
    Ok(())
}
