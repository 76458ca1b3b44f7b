//! Configuration: sync targets and engine settings.
//!
//! Loaded from `racks.toml` in the platform config dir (or `--config`):
//!
//! ```toml
//! media_root = "/srv/racksync/media"
//! report_pattern = '.*\.html'
//! connect_timeout_secs = 10
//!
//! [[targets]]
//! name = "rack-01"
//! remote_path = "/home/tester/reports"
//!
//! [targets.endpoint]
//! host = "10.0.0.5"
//! username = "tester"
//! private_key_path = "~/.ssh/id_ed25519"
//! ```
//!
//! Environment variables (`.env` is honoured) override file values:
//! `RACKSYNC_MEDIA_ROOT`, `RACKSYNC_DB`, `RACKSYNC_REPORT_PATTERN`,
//! `RACKSYNC_CONNECT_TIMEOUT_SECS`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::types::{RemoteDirectorySpec, RemoteEndpoint, SyncTarget, check_target_name};
use crate::sources::mover::{DEFAULT_REPORT_PATTERN, ReportPattern};
use crate::sources::session::DEFAULT_CONNECT_TIMEOUT;
use crate::storage::sqlite::SqliteStorage;

pub const CONFIG_FILE_NAME: &str = "racks.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid report pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for ConfigError {
    fn from(e: anyhow::Error) -> Self {
        ConfigError::Storage(format!("{e:#}"))
    }
}

fn default_remote_path() -> String {
    "~/".to_string()
}

/// One `[[targets]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetDefinition {
    pub name: String,
    #[serde(default = "default_remote_path")]
    pub remote_path: String,
    pub endpoint: RemoteEndpoint,
}

impl TargetDefinition {
    pub fn to_target(&self) -> SyncTarget {
        SyncTarget {
            id: None,
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            directory: RemoteDirectorySpec::new(&self.remote_path),
            archive_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RackConfig {
    #[serde(default)]
    pub media_root: Option<PathBuf>,
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub report_pattern: Option<String>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub targets: Vec<TargetDefinition>,
}

impl RackConfig {
    /// `racks.toml` in the platform config directory.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "racksync", "racksync")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Read `path`. A missing file yields the empty default configuration.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file; using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `RACKSYNC_*` overrides read through `lookup`.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("RACKSYNC_MEDIA_ROOT") {
            self.media_root = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("RACKSYNC_DB") {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Some(pattern) = lookup("RACKSYNC_REPORT_PATTERN") {
            self.report_pattern = Some(pattern);
        }
        if let Some(val) = lookup("RACKSYNC_CONNECT_TIMEOUT_SECS")
            && let Ok(secs) = val.parse()
        {
            self.connect_timeout_secs = Some(secs);
        }
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| dotenvy::var(key).ok());
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for target in &self.targets {
            if let Err(reason) = check_target_name(&target.name) {
                return Err(ConfigError::Invalid(format!(
                    "target name '{}' {reason}",
                    target.name
                )));
            }
            if !seen.insert(target.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate target name '{}'",
                    target.name
                )));
            }
            if target.endpoint.host.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "target '{}' has no host",
                    target.name
                )));
            }
            if target.remote_path.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "target '{}' has an empty remote_path",
                    target.name
                )));
            }
        }
        self.pattern()?;
        Ok(())
    }

    pub fn pattern(&self) -> Result<ReportPattern, ConfigError> {
        let pattern = self
            .report_pattern
            .as_deref()
            .unwrap_or(DEFAULT_REPORT_PATTERN);
        ReportPattern::new(pattern).map_err(|source| ConfigError::Pattern {
            pattern: pattern.to_string(),
            source,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    /// Resolve paths against `data_dir` and produce runtime settings.
    pub fn settings(&self, data_dir: &Path) -> Result<Settings, ConfigError> {
        Ok(Settings {
            media_root: self
                .media_root
                .clone()
                .unwrap_or_else(|| data_dir.join("media")),
            db_path: self
                .db_path
                .clone()
                .unwrap_or_else(|| data_dir.join("racksync.db")),
            data_dir: data_dir.to_path_buf(),
            pattern: self.pattern()?,
            connect_timeout: self.connect_timeout(),
        })
    }

    /// Upsert every configured target into `storage`, keyed by name.
    ///
    /// Existing archive links are preserved.
    pub fn import_targets(&self, storage: &SqliteStorage) -> Result<Vec<i64>, ConfigError> {
        let mut ids = Vec::with_capacity(self.targets.len());
        for def in &self.targets {
            let id = storage.upsert_target(&def.to_target())?;
            ids.push(id);
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "imported sync targets from config");
        }
        Ok(ids)
    }
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub media_root: PathBuf,
    pub db_path: PathBuf,
    pub pattern: ReportPattern,
    pub connect_timeout: Duration,
}
