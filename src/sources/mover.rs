//! Bulk relocation of remote files matching a pattern.
//!
//! A move is two explicit phases per file: copy to local storage, then delete
//! the remote original. [`MoveOutcome`] records both so callers can see files
//! that were copied but are still on the remote (and will be picked up again
//! on the next run).

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::session::{EntryKind, RemoteEntry, RemoteError, RemoteFs};
use crate::model::types::Verdict;

/// Pattern used when none is configured.
pub const DEFAULT_REPORT_PATTERN: &str = r".*\.html";

/// Filename pattern anchored at the start of the name.
///
/// A name matches when the pattern matches a prefix of it; the rest of the
/// name is unconstrained (so `.*\.html` also accepts `a.html.bak`).
#[derive(Debug, Clone)]
pub struct ReportPattern {
    source: String,
    regex: Regex,
}

impl ReportPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            source: pattern.to_string(),
            regex: Regex::new(&format!(r"\A(?:{pattern})"))?,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl Default for ReportPattern {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_PATTERN).expect("default report pattern compiles")
    }
}

impl std::fmt::Display for ReportPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Error, Debug)]
pub enum MoveError {
    #[error("could not list remote directory '{dir}': {source}")]
    List {
        dir: String,
        #[source]
        source: RemoteError,
    },

    #[error("could not create local directory {path}: {source}")]
    LocalDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What happened to one matched remote file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MoveOutcome {
    pub name: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub bytes: u64,
    /// Copy to local storage succeeded.
    pub copied: bool,
    /// Remote original was deleted.
    pub deleted: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MoveReport {
    pub remote_dir: String,
    pub local_dir: PathBuf,
    pub outcomes: Vec<MoveOutcome>,
}

impl MoveReport {
    /// Files whose copy succeeded, regardless of the delete outcome.
    pub fn moved(&self) -> usize {
        self.outcomes.iter().filter(|o| o.copied).count()
    }

    /// Copied but still present on the remote.
    pub fn retained_on_remote(&self) -> impl Iterator<Item = &MoveOutcome> {
        self.outcomes.iter().filter(|o| o.copied && !o.deleted)
    }

    pub fn failed(&self) -> impl Iterator<Item = &MoveOutcome> {
        self.outcomes.iter().filter(|o| !o.copied)
    }

    pub fn total_bytes(&self) -> u64 {
        self.outcomes.iter().map(|o| o.bytes).sum()
    }
}

/// A remote report as seen before transfer.
#[derive(Debug, Clone, Serialize)]
pub struct RemotePreview {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub mtime: Option<i64>,
    pub verdict: Verdict,
}

/// Regular files in `remote_dir` whose name matches `pattern`, oldest first.
pub fn list_matching(
    fs: &dyn RemoteFs,
    remote_dir: &str,
    pattern: &ReportPattern,
) -> Result<Vec<RemoteEntry>, RemoteError> {
    let mut matches: Vec<RemoteEntry> = fs
        .list(remote_dir)?
        .into_iter()
        .filter(|e| {
            if !pattern.matches(&e.name) {
                return false;
            }
            if e.stat.kind == EntryKind::Other {
                debug!(
                    host = %fs.host(),
                    path = %e.path,
                    "skipping matching entry: not a regular file or type not reported"
                );
            }
            e.stat.is_file()
        })
        .collect();
    matches.sort_by(|a, b| {
        a.stat
            .mtime
            .cmp(&b.stat.mtime)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(matches)
}

pub fn preview_matching(
    fs: &dyn RemoteFs,
    remote_dir: &str,
    pattern: &ReportPattern,
) -> Result<Vec<RemotePreview>, RemoteError> {
    Ok(list_matching(fs, remote_dir, pattern)?
        .into_iter()
        .map(|e| RemotePreview {
            verdict: Verdict::from_filename(&e.name),
            size: e.stat.size,
            mtime: e.stat.mtime,
            name: e.name,
            path: e.path,
        })
        .collect())
}

/// Copy every matching file into `local_dir`, then delete each remote original.
///
/// Files are processed oldest first. A copy failure skips that file (its remote
/// original is left alone); a delete failure is logged and recorded but the
/// file still counts as moved.
pub fn move_matching(
    fs: &dyn RemoteFs,
    remote_dir: &str,
    local_dir: &Path,
    pattern: &ReportPattern,
) -> Result<MoveReport, MoveError> {
    let matches = list_matching(fs, remote_dir, pattern).map_err(|source| MoveError::List {
        dir: remote_dir.to_string(),
        source,
    })?;

    let mut report = MoveReport {
        remote_dir: remote_dir.to_string(),
        local_dir: local_dir.to_path_buf(),
        outcomes: Vec::with_capacity(matches.len()),
    };

    if matches.is_empty() {
        info!(
            host = %fs.host(),
            remote_dir,
            pattern = %pattern,
            "no file matching pattern"
        );
        return Ok(report);
    }

    std::fs::create_dir_all(local_dir).map_err(|source| MoveError::LocalDir {
        path: local_dir.to_path_buf(),
        source,
    })?;

    for entry in matches {
        let local_path = local_dir.join(&entry.name);
        let mut outcome = MoveOutcome {
            name: entry.name.clone(),
            remote_path: entry.path.clone(),
            local_path: local_path.clone(),
            ..Default::default()
        };

        match fs.get(&entry.path, &local_path) {
            Ok(bytes) => {
                outcome.copied = true;
                outcome.bytes = bytes;
            }
            Err(e) => {
                warn!(
                    host = %fs.host(),
                    remote_path = %entry.path,
                    local_path = %local_path.display(),
                    error = %e,
                    "could not copy remote file; skipping"
                );
                outcome.error = Some(e.to_string());
                report.outcomes.push(outcome);
                continue;
            }
        }

        match fs.remove(&entry.path) {
            Ok(()) => outcome.deleted = true,
            Err(e) => {
                warn!(
                    host = %fs.host(),
                    remote_path = %entry.path,
                    error = %e,
                    "copied file could not be deleted on remote; it will be fetched again"
                );
                outcome.error = Some(e.to_string());
            }
        }

        debug!(
            remote_path = %outcome.remote_path,
            bytes = outcome.bytes,
            deleted = outcome.deleted,
            "moved remote file"
        );
        report.outcomes.push(outcome);
    }

    info!(
        host = %fs.host(),
        remote_dir,
        moved = report.moved(),
        retained = report.retained_on_remote().count(),
        failed = report.failed().count(),
        bytes = report.total_bytes(),
        "move from remote completed"
    );
    Ok(report)
}
