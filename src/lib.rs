pub mod config;
pub mod ingest;
pub mod model;
pub mod sources;
pub mod storage;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use config::{RackConfig, Settings};
use model::types::{Report, SyncTarget};
use sources::mover::RemotePreview;
use sources::registry::SessionRegistry;
use sources::sync::{RunStatus, SyncEngine, SyncOutcome, SyncProgress, TargetSyncInfo};
use storage::sqlite::SqliteStorage;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "racksync",
    version,
    about = "Pull test reports from remote racks over SFTP and archive them"
)]
pub struct Cli {
    /// Path to the config file (defaults to racks.toml in the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override data dir (database, media, sync status)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Path to the SQLite database
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Root for staging and archived report files
    #[arg(long, global = true)]
    pub media_root: Option<PathBuf>,

    /// Also write daily-rotated logs into this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Move new reports from remote racks into their archives
    Sync {
        /// Target names (all configured targets when omitted)
        targets: Vec<String>,

        /// Sync every stored target
        #[arg(long, conflicts_with = "targets")]
        all: bool,

        /// Repeat every SECS seconds until interrupted
        #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
        every: Option<u64>,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List remote reports that the next sync would move
    Peek {
        target: String,

        #[arg(long)]
        json: bool,
    },
    /// Show archive summaries and last sync results
    Status {
        target: Option<String>,

        #[arg(long)]
        json: bool,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "racksync", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            return Ok(());
        }
        _ => {}
    }

    let _log_guard = init_tracing(cli.log_dir.as_deref())?;
    debug!(
        version = env!("CARGO_PKG_VERSION"),
        built = option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("unknown"),
        target = option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown"),
        "racksync starting"
    );

    let config = load_config(&cli)?;
    let settings = resolve_settings(&cli, &config)?;
    let storage = SqliteStorage::open(&settings.db_path)?;
    config.import_targets(&storage)?;

    let registry = Arc::new(SessionRegistry::ssh(settings.connect_timeout));
    let engine = Arc::new(
        SyncEngine::new(&settings.media_root, &settings.data_dir, registry)
            .with_pattern(settings.pattern.clone()),
    );

    match cli.command {
        Commands::Sync {
            targets,
            all,
            every,
            json,
        } => {
            let ids = resolve_targets(&storage, &targets, all)?;
            drop(storage);
            match every {
                Some(secs) => run_sync_loop(engine, settings, ids, secs, json).await,
                None => {
                    let outcomes = run_sync_batch(engine, settings.db_path.clone(), ids, json).await?;
                    print_outcomes(&outcomes, json)?;
                    let failed = outcomes
                        .iter()
                        .filter(|o| o.status == RunStatus::Failed)
                        .count();
                    if failed > 0 {
                        bail!("{failed} of {} target(s) failed to sync", outcomes.len());
                    }
                    Ok(())
                }
            }
        }
        Commands::Peek { target, json } => {
            let target = find_target(&storage, &target)?;
            let previews = engine.peek(&target)?;
            print_previews(&target, &previews, json)
        }
        Commands::Status { target, json } => {
            let targets = match target {
                Some(name) => vec![find_target(&storage, &name)?],
                None => storage.list_targets()?,
            };
            print_status(&storage, &engine, &targets, json)
        }
        Commands::Completions { .. } | Commands::Man => Ok(()),
    }
}

/// Console logging filtered by `RUST_LOG` (default `racksync=info`), plus an optional daily file.
///
/// Console output is coloured only when stderr is a terminal.
pub fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("racksync=info"));
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .try_init()
            .ok();
        return Ok(None);
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, "racksync.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false),
        )
        .try_init()
        .ok();
    Ok(Some(guard))
}

pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "racksync", "racksync")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".racksync"))
}

fn load_config(cli: &Cli) -> Result<RackConfig> {
    let path = cli.config.clone().or_else(RackConfig::default_path);
    let mut config = match &path {
        Some(path) => RackConfig::load_from(path)?,
        None => RackConfig::default(),
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn resolve_settings(cli: &Cli, config: &RackConfig) -> Result<Settings> {
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let mut settings = config.settings(&data_dir)?;
    if let Some(db) = &cli.db {
        settings.db_path = db.clone();
    }
    if let Some(media_root) = &cli.media_root {
        settings.media_root = media_root.clone();
    }
    Ok(settings)
}

fn find_target(storage: &SqliteStorage, name: &str) -> Result<SyncTarget> {
    storage
        .get_target_by_name(name)?
        .with_context(|| format!("unknown target '{name}'"))
}

fn resolve_targets(storage: &SqliteStorage, names: &[String], all: bool) -> Result<Vec<i64>> {
    let targets = if all || names.is_empty() {
        storage.list_targets()?
    } else {
        names
            .iter()
            .map(|name| find_target(storage, name))
            .collect::<Result<Vec<_>>>()?
    };
    if targets.is_empty() {
        warn!("no sync targets configured");
    }
    Ok(targets.into_iter().filter_map(|t| t.id).collect())
}

/// Run one pass over `ids` on a blocking worker.
async fn run_sync_batch(
    engine: Arc<SyncEngine>,
    db_path: PathBuf,
    ids: Vec<i64>,
    json: bool,
) -> Result<Vec<SyncOutcome>> {
    tokio::task::spawn_blocking(move || -> Result<Vec<SyncOutcome>> {
        let storage = SqliteStorage::open(&db_path)?;
        let on_progress = |p: SyncProgress| report_progress(&p, json);
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            match engine.synchronize(&storage, id, &on_progress) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    let name = storage
                        .get_target(id)
                        .ok()
                        .flatten()
                        .map(|t| t.name)
                        .unwrap_or_else(|| id.to_string());
                    outcomes.push(SyncOutcome {
                        target_name: name,
                        status: RunStatus::Failed,
                        error: Some(e.to_string()),
                        ..Default::default()
                    });
                }
            }
        }
        Ok(outcomes)
    })
    .await
    .context("sync worker panicked")?
}

async fn run_sync_loop(
    engine: Arc<SyncEngine>,
    settings: Settings,
    ids: Vec<i64>,
    secs: u64,
    json: bool,
) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(every_secs = secs, targets = ids.len(), "starting periodic sync");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match run_sync_batch(Arc::clone(&engine), settings.db_path.clone(), ids.clone(), json).await {
                    Ok(outcomes) => print_outcomes(&outcomes, json)?,
                    Err(e) => warn!(error = %format!("{e:#}"), "sync pass failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; stopping periodic sync");
                return Ok(());
            }
        }
    }
}

fn report_progress(progress: &SyncProgress, json: bool) {
    if json {
        debug!(run_id = %progress.run_id, target = %progress.target, stage = %progress.stage, "{}", progress.message);
    } else {
        eprintln!("{}", progress.to_string().dimmed());
    }
}

fn status_label(status: &RunStatus) -> colored::ColoredString {
    match status {
        RunStatus::Success => "ok".green().bold(),
        RunStatus::PartialFailure => "partial".yellow().bold(),
        RunStatus::Failed => "failed".red().bold(),
    }
}

fn print_outcomes(outcomes: &[SyncOutcome], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcomes)?);
        return Ok(());
    }
    for o in outcomes {
        println!(
            "{:<8} {}  moved {}  archived {}  skipped {}  ({} ms)",
            status_label(&o.status),
            o.target_name.bold(),
            o.files_moved,
            o.files_ingested,
            o.files_skipped,
            o.duration_ms
        );
        for path in &o.retained_on_remote {
            println!("         {} {path}", "still on remote:".yellow());
        }
        if let Some(err) = &o.error {
            println!("         {}", err.red());
        }
    }
    Ok(())
}

fn print_previews(target: &SyncTarget, previews: &[RemotePreview], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(previews)?);
        return Ok(());
    }
    if previews.is_empty() {
        println!("{}: no matching reports on {}", target.name.bold(), target.endpoint.host);
        return Ok(());
    }
    println!(
        "{}: {} report(s) on {}",
        target.name.bold(),
        previews.len(),
        target.endpoint.host
    );
    for p in previews {
        let verdict = match p.verdict {
            model::types::Verdict::Failed => "FAILED".red(),
            _ => "PASSED".green(),
        };
        let mtime = p
            .mtime
            .and_then(|t| chrono::DateTime::from_timestamp(t, 0))
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".into());
        println!("  {verdict:<7} {mtime}  {:>9}  {}", p.size, p.name);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct TargetStatus {
    name: String,
    host: String,
    remote_path: String,
    archive: Option<String>,
    total: usize,
    passed: usize,
    failed: usize,
    latest: Option<Report>,
    last_sync: Option<TargetSyncInfo>,
}

fn print_status(
    storage: &SqliteStorage,
    engine: &SyncEngine,
    targets: &[SyncTarget],
    json: bool,
) -> Result<()> {
    let sync_status = engine.status();
    let mut rows = Vec::with_capacity(targets.len());
    for target in targets {
        let archive = match target.archive_id {
            Some(id) => storage.load_archive(id)?,
            None => None,
        };
        rows.push(TargetStatus {
            name: target.name.clone(),
            host: target.endpoint.host.clone(),
            remote_path: target.directory.remote_path.clone(),
            total: archive.as_ref().map_or(0, |a| a.reports.len()),
            passed: archive.as_ref().map_or(0, |a| a.passed()),
            failed: archive.as_ref().map_or(0, |a| a.failed()),
            latest: archive.as_ref().and_then(|a| a.latest().cloned()),
            archive: archive.map(|a| a.name),
            last_sync: sync_status.get(&target.name).cloned(),
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("no sync targets configured");
        return Ok(());
    }
    for row in &rows {
        println!("{} ({}:{})", row.name.bold(), row.host, row.remote_path);
        match &row.archive {
            Some(name) => println!(
                "  archive {name}: {} report(s), {} passed, {} failed",
                row.total,
                row.passed.to_string().green(),
                row.failed.to_string().red()
            ),
            None => println!("  {}", "never synced".dimmed()),
        }
        if let Some(latest) = &row.latest {
            println!(
                "  latest  {} {} ({})",
                latest.created.format("%Y-%m-%d %H:%M:%S"),
                latest.name,
                latest.verdict
            );
        }
        if let Some(info) = &row.last_sync {
            let when = info
                .last_sync
                .and_then(chrono::DateTime::from_timestamp_millis)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "-".into());
            println!(
                "  last sync {when}: {} (moved {}, archived {})",
                status_label(&info.last_result),
                info.files_moved,
                info.files_ingested
            );
        }
    }
    Ok(())
}
