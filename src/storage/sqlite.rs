//! `SQLite` backend: schema, pragmas, and migrations.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::model::types::{
    RemoteDirectorySpec, RemoteEndpoint, Report, ReportArchive, SyncTarget, Verdict,
};

const SCHEMA_VERSION: i64 = 1;

const MIGRATION_V1: &str = r"
CREATE TABLE IF NOT EXISTS endpoints (
    id INTEGER PRIMARY KEY,
    host TEXT NOT NULL UNIQUE,
    username TEXT,
    password TEXT,
    private_key_path TEXT,
    port INTEGER NOT NULL DEFAULT 22
);

CREATE TABLE IF NOT EXISTS archives (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS targets (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    endpoint_id INTEGER NOT NULL REFERENCES endpoints(id),
    remote_path TEXT NOT NULL,
    archive_id INTEGER REFERENCES archives(id)
);

CREATE TABLE IF NOT EXISTS reports (
    id INTEGER PRIMARY KEY,
    archive_id INTEGER NOT NULL REFERENCES archives(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    verdict TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    file_path TEXT,
    UNIQUE(archive_id, verdict, created_at, name)
);

CREATE INDEX IF NOT EXISTS idx_reports_archive_created
    ON reports(archive_id, created_at DESC);
";

pub struct SqliteStorage {
    conn: Connection,
}

/// Result of a get-or-create call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    pub id: i64,
    pub created: bool,
}

const TARGET_COLUMNS: &str = "t.id, t.name, t.remote_path, t.archive_id,
     e.host, e.username, e.password, e.private_key_path, e.port";

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating db directory {}", parent.display()))?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("opening sqlite db at {}", path.display()))?;

        apply_pragmas(&mut conn)?;
        init_meta(&mut conn)?;
        migrate(&mut conn)?;

        Ok(Self { conn })
    }

    pub fn raw(&self) -> &Connection {
        &self.conn
    }

    pub fn schema_version(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT value FROM meta WHERE key='schema_version'",
                [],
                |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
            )
            .optional()?
            .ok_or_else(|| anyhow!("schema_version missing"))
    }

    // -------------------------------------------------------------------------
    // Configuration records
    // -------------------------------------------------------------------------

    pub fn upsert_endpoint(&self, endpoint: &RemoteEndpoint) -> Result<i64> {
        let key_path = endpoint.private_key_path.as_ref().map(path_to_string);
        self.conn.execute(
            "INSERT INTO endpoints(host, username, password, private_key_path, port) VALUES(?,?,?,?,?)
             ON CONFLICT(host) DO UPDATE SET
                username = excluded.username,
                password = excluded.password,
                private_key_path = excluded.private_key_path,
                port = excluded.port",
            params![
                &endpoint.host,
                &endpoint.username,
                &endpoint.password,
                key_path,
                i64::from(endpoint.port)
            ],
        )?;

        self.conn
            .query_row(
                "SELECT id FROM endpoints WHERE host = ?",
                params![&endpoint.host],
                |row| row.get(0),
            )
            .with_context(|| format!("fetching endpoint id for {}", endpoint.host))
    }

    /// Create or update a target by name. An existing archive link is kept.
    pub fn upsert_target(&self, target: &SyncTarget) -> Result<i64> {
        let endpoint_id = self.upsert_endpoint(&target.endpoint)?;
        self.conn.execute(
            "INSERT INTO targets(name, endpoint_id, remote_path) VALUES(?,?,?)
             ON CONFLICT(name) DO UPDATE SET
                endpoint_id = excluded.endpoint_id,
                remote_path = excluded.remote_path",
            params![&target.name, endpoint_id, &target.directory.remote_path],
        )?;

        self.conn
            .query_row(
                "SELECT id FROM targets WHERE name = ?",
                params![&target.name],
                |row| row.get(0),
            )
            .with_context(|| format!("fetching target id for {}", target.name))
    }

    pub fn get_target(&self, id: i64) -> Result<Option<SyncTarget>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {TARGET_COLUMNS} FROM targets t
                     JOIN endpoints e ON e.id = t.endpoint_id WHERE t.id = ?"
                ),
                params![id],
                row_to_target,
            )
            .optional()
            .with_context(|| format!("fetching target with id {id}"))
    }

    pub fn get_target_by_name(&self, name: &str) -> Result<Option<SyncTarget>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {TARGET_COLUMNS} FROM targets t
                     JOIN endpoints e ON e.id = t.endpoint_id WHERE t.name = ?"
                ),
                params![name],
                row_to_target,
            )
            .optional()
            .with_context(|| format!("fetching target '{name}'"))
    }

    pub fn list_targets(&self) -> Result<Vec<SyncTarget>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TARGET_COLUMNS} FROM targets t
             JOIN endpoints e ON e.id = t.endpoint_id ORDER BY t.name"
        ))?;
        let rows = stmt.query_map([], row_to_target)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Archives and reports
    // -------------------------------------------------------------------------

    /// Resolve an archive by its stable name, creating it on first use.
    pub fn get_or_create_archive(&self, name: &str) -> Result<Upserted> {
        let inserted = self.conn.execute(
            "INSERT INTO archives(name) VALUES(?) ON CONFLICT(name) DO NOTHING",
            params![name],
        )?;
        let id = self
            .conn
            .query_row(
                "SELECT id FROM archives WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .with_context(|| format!("fetching archive id for {name}"))?;
        Ok(Upserted {
            id,
            created: inserted > 0,
        })
    }

    /// Link a target to an archive if it has none yet. Returns whether a link was written.
    pub fn link_target_archive(&self, target_id: i64, archive_id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE targets SET archive_id = ? WHERE id = ? AND archive_id IS NULL",
            params![archive_id, target_id],
        )?;
        Ok(rows > 0)
    }

    pub fn get_archive_by_name(&self, name: &str) -> Result<Option<ReportArchive>> {
        let id: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM archives WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => self.load_archive(id),
            None => Ok(None),
        }
    }

    /// Load an archive together with every report it owns.
    pub fn load_archive(&self, archive_id: i64) -> Result<Option<ReportArchive>> {
        let name: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM archives WHERE id = ?",
                params![archive_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("fetching archive with id {archive_id}"))?;

        let Some(name) = name else {
            return Ok(None);
        };

        Ok(Some(ReportArchive {
            id: Some(archive_id),
            name,
            reports: self.list_reports(archive_id)?,
        }))
    }

    /// Upsert keyed by (archive, verdict, created, name).
    pub fn get_or_create_report(
        &self,
        archive_id: i64,
        verdict: Verdict,
        created: DateTime<Utc>,
        name: &str,
    ) -> Result<Upserted> {
        let created_ms = created.timestamp_millis();
        let inserted = self.conn.execute(
            "INSERT INTO reports(archive_id, name, verdict, created_at) VALUES(?,?,?,?)
             ON CONFLICT(archive_id, verdict, created_at, name) DO NOTHING",
            params![archive_id, name, verdict.as_str(), created_ms],
        )?;
        let id = self
            .conn
            .query_row(
                "SELECT id FROM reports
                 WHERE archive_id = ? AND verdict = ? AND created_at = ? AND name = ?",
                params![archive_id, verdict.as_str(), created_ms, name],
                |row| row.get(0),
            )
            .with_context(|| format!("fetching report id for {name}"))?;
        Ok(Upserted {
            id,
            created: inserted > 0,
        })
    }

    /// Upsert a report and point it at its stored copy in one transaction.
    ///
    /// A row is only ever visible together with its `file_path`.
    pub fn store_report(
        &self,
        archive_id: i64,
        verdict: Verdict,
        created: DateTime<Utc>,
        name: &str,
        file_path: &Path,
    ) -> Result<Upserted> {
        let created_ms = created.timestamp_millis();
        let file_path = path_to_string(file_path);
        let tx = self.conn.unchecked_transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM reports
                 WHERE archive_id = ? AND verdict = ? AND created_at = ? AND name = ?",
                params![archive_id, verdict.as_str(), created_ms, name],
                |row| row.get(0),
            )
            .optional()?;

        let stored = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE reports SET file_path = ? WHERE id = ?",
                    params![file_path, id],
                )?;
                Upserted { id, created: false }
            }
            None => {
                tx.execute(
                    "INSERT INTO reports(archive_id, name, verdict, created_at, file_path)
                     VALUES(?,?,?,?,?)",
                    params![archive_id, name, verdict.as_str(), created_ms, file_path],
                )?;
                Upserted {
                    id: tx.last_insert_rowid(),
                    created: true,
                }
            }
        };

        tx.commit()
            .with_context(|| format!("storing report {name}"))?;
        Ok(stored)
    }

    pub fn set_report_file(&self, report_id: i64, file_path: &Path) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE reports SET file_path = ? WHERE id = ?",
            params![path_to_string(file_path), report_id],
        )?;
        if rows == 0 {
            return Err(anyhow!("report {report_id} not found"));
        }
        Ok(())
    }

    pub fn get_report(&self, report_id: i64) -> Result<Option<Report>> {
        self.conn
            .query_row(
                "SELECT id, archive_id, name, verdict, created_at, file_path
                 FROM reports WHERE id = ?",
                params![report_id],
                row_to_report,
            )
            .optional()
            .with_context(|| format!("fetching report with id {report_id}"))
    }

    pub fn list_reports(&self, archive_id: i64) -> Result<Vec<Report>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, archive_id, name, verdict, created_at, file_path
             FROM reports WHERE archive_id = ? ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![archive_id], row_to_report)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

fn row_to_target(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncTarget> {
    let key_path: Option<String> = row.get(7)?;
    let port: i64 = row.get(8)?;
    Ok(SyncTarget {
        id: Some(row.get(0)?),
        name: row.get(1)?,
        directory: RemoteDirectorySpec::new(row.get::<_, String>(2)?),
        archive_id: row.get(3)?,
        endpoint: RemoteEndpoint {
            host: row.get(4)?,
            username: row.get(5)?,
            password: row.get(6)?,
            private_key_path: key_path.map(PathBuf::from),
            port: u16::try_from(port).unwrap_or(crate::model::types::DEFAULT_SSH_PORT),
        },
    })
}

fn row_to_report(row: &rusqlite::Row<'_>) -> rusqlite::Result<Report> {
    let verdict_str: String = row.get(3)?;
    let created_ms: i64 = row.get(4)?;
    let file_path: Option<String> = row.get(5)?;
    Ok(Report {
        id: Some(row.get(0)?),
        archive_id: row.get(1)?,
        name: row.get(2)?,
        verdict: Verdict::parse(&verdict_str).unwrap_or_default(),
        created: DateTime::from_timestamp_millis(created_ms).unwrap_or_default(),
        file_path: file_path.map(PathBuf::from),
    })
}

fn apply_pragmas(conn: &mut Connection) -> Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        r"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        ",
    )?;
    Ok(())
}

fn init_meta(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;

    let existing: Option<i64> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
        )
        .optional()?;

    if existing.is_none() {
        // Start at version 0 so migrate() applies full schema on first open.
        conn.execute(
            "INSERT INTO meta(key, value) VALUES('schema_version', '0')",
            [],
        )?;
    }

    Ok(())
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let current: i64 = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
        )
        .optional()?
        .unwrap_or(0);

    if current == SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;

    match current {
        0 => {
            tx.execute_batch(MIGRATION_V1)?;
        }
        v => return Err(anyhow!("unsupported schema version {v}")),
    }

    tx.execute(
        "UPDATE meta SET value = ? WHERE key = 'schema_version'",
        params![SCHEMA_VERSION.to_string()],
    )?;

    tx.commit()?;
    Ok(())
}

fn path_to_string<P: AsRef<Path>>(p: P) -> String {
    p.as_ref().to_string_lossy().into_owned()
}
