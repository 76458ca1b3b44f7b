//! Archive ingestion: turn staged report files into persisted records.
//!
//! For one target, the ingestor resolves (or creates) its archive, links it
//! to the target on first use, and upserts one [`Report`] per staged file.
//! Each stored report gets a copy of the file under
//! `<media_root>/archive_<archive_name>/<filename>`. A file whose name cannot
//! be parsed is skipped without aborting the batch.
//!
//! [`Report`]: crate::model::types::Report

pub mod report_name;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::model::types::{SyncTarget, Verdict, archive_dir_name};
use crate::sources::mover::ReportPattern;
use crate::storage::sqlite::SqliteStorage;

pub use report_name::{ParsedReportName, ReportNameError, parse_report_name};

#[derive(Debug, Clone, Serialize)]
pub struct IngestedReport {
    pub report_id: i64,
    pub name: String,
    pub verdict: Verdict,
    pub created: DateTime<Utc>,
    /// False when an equivalent record already existed.
    pub newly_created: bool,
    /// Stored copy, relative to the media root.
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeReport {
    pub removed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub archive_id: i64,
    pub archive_name: String,
    /// The target was linked to the archive during this run.
    pub linked: bool,
    pub ingested: Vec<IngestedReport>,
    pub skipped: Vec<SkippedFile>,
}

impl IngestReport {
    pub fn new_records(&self) -> usize {
        self.ingested.iter().filter(|r| r.newly_created).count()
    }
}

pub struct ArchiveIngestor<'a> {
    storage: &'a SqliteStorage,
    media_root: &'a Path,
    pattern: &'a ReportPattern,
}

impl<'a> ArchiveIngestor<'a> {
    pub fn new(storage: &'a SqliteStorage, media_root: &'a Path, pattern: &'a ReportPattern) -> Self {
        Self {
            storage,
            media_root,
            pattern,
        }
    }

    /// Ingest staged files, then purge the ones that were stored.
    pub fn ingest(&self, target: &SyncTarget, staging_dir: &Path) -> Result<(IngestReport, PurgeReport)> {
        let report = self.ingest_staged(target, staging_dir)?;
        let purge = self.purge_staging(staging_dir, &report);
        Ok((report, purge))
    }

    /// Archive for `target`: the linked one if present, otherwise get-or-create by name.
    ///
    /// Returns `(archive_id, archive_name, linked_now)`.
    pub fn resolve_archive(&self, target: &SyncTarget) -> Result<(i64, String, bool)> {
        let target_id = target
            .id
            .ok_or_else(|| anyhow!("target '{}' has not been stored", target.name))?;

        if let Some(archive_id) = target.archive_id
            && let Some(archive) = self.storage.load_archive(archive_id)?
        {
            return Ok((archive_id, archive.name, false));
        }

        let archive = self
            .storage
            .get_or_create_archive(&target.name)
            .with_context(|| format!("resolving archive for target '{}'", target.name))?;
        if archive.created {
            info!(target = %target.name, archive_id = archive.id, "created report archive");
        }
        let linked = self.storage.link_target_archive(target_id, archive.id)?;
        if linked {
            info!(target = %target.name, archive_id = archive.id, "linked target to archive");
        }
        Ok((archive.id, target.name.clone(), linked))
    }

    /// Upsert one report per staged file matching the pattern.
    pub fn ingest_staged(&self, target: &SyncTarget, staging_dir: &Path) -> Result<IngestReport> {
        let (archive_id, archive_name, linked) = self.resolve_archive(target)?;
        let mut report = IngestReport {
            archive_id,
            archive_name: archive_name.clone(),
            linked,
            ingested: Vec::new(),
            skipped: Vec::new(),
        };

        for path in self.staged_files(staging_dir)? {
            let name = file_name(&path);
            match self.ingest_file(archive_id, &archive_name, &path, &name) {
                Ok(ingested) => report.ingested.push(ingested),
                Err(e) => {
                    warn!(
                        target = %target.name,
                        file = %name,
                        error = %format!("{e:#}"),
                        "skipping staged report"
                    );
                    report.skipped.push(SkippedFile {
                        name,
                        reason: format!("{e:#}"),
                    });
                }
            }
        }

        info!(
            target = %target.name,
            archive = %archive_name,
            ingested = report.ingested.len(),
            new = report.new_records(),
            skipped = report.skipped.len(),
            "archived staged reports"
        );
        Ok(report)
    }

    fn ingest_file(
        &self,
        archive_id: i64,
        archive_name: &str,
        path: &Path,
        name: &str,
    ) -> Result<IngestedReport> {
        let parsed = parse_report_name(name)?;

        // Content goes in place before the record, so no row is left without a file.
        let relative = Path::new(&archive_dir_name(archive_name)).join(name);
        let dest = self.media_root.join(&relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }
        let replaced = dest.exists();
        fs::copy(path, &dest)
            .with_context(|| format!("storing {} at {}", path.display(), dest.display()))?;

        let record = match self.storage.store_report(
            archive_id,
            parsed.verdict,
            parsed.created,
            name,
            &relative,
        ) {
            Ok(record) => record,
            Err(e) => {
                if !replaced && let Err(rm) = fs::remove_file(&dest) {
                    warn!(path = %dest.display(), error = %rm, "could not remove unrecorded copy");
                }
                return Err(e);
            }
        };

        debug!(
            report_id = record.id,
            file = %name,
            verdict = %parsed.verdict,
            new = record.created,
            "stored report"
        );
        Ok(IngestedReport {
            report_id: record.id,
            name: name.to_string(),
            verdict: parsed.verdict,
            created: parsed.created,
            newly_created: record.created,
            file_path: relative,
        })
    }

    /// Remove staged files that were stored. Failures are logged, never returned.
    ///
    /// Files that were skipped stay in staging so they can be inspected.
    pub fn purge_staging(&self, staging_dir: &Path, ingest: &IngestReport) -> PurgeReport {
        let mut purge = PurgeReport::default();
        for ingested in &ingest.ingested {
            let path = staging_dir.join(&ingested.name);
            if !self.pattern.matches(&ingested.name) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => purge.removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not purge staged file");
                    purge.errors.push(format!("{}: {e}", path.display()));
                }
            }
        }
        purge
    }

    fn staged_files(&self, staging_dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(staging_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("reading staging directory {}", staging_dir.display())
                });
            }
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if self.pattern.matches(&file_name(&path)) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
