// src/main.rs
//
// =============================================================================
// WHIRR: COMMANDER & ENTRY POINT
// =============================================================================
//
// The wiring center: clap subcommands driving the worker loop, the HTTP
// server, direct job submission, and the ablation driver. Shutdown is one
// `tokio::sync::watch<bool>` shared by every long-running subcommand,
// flipped from a ctrl-c handler running in its own background task.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use whirr::ablation;
use whirr::config::{self, WhirrConfig};
use whirr::storage::{NewJob, Storage, StorageBackend};
use whirr::worker::{run_worker, WorkerOptions};

#[derive(Parser)]
#[command(name = "whirr", version = "0.10.0", about = "Local-to-small-cluster experiment orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// PostgreSQL connection URL (networked backend); defaults to the local
    /// SQLite database under `.whirr/whirr.db`.
    #[arg(long, global = true, env = "WHIRR_DATABASE_URL")]
    database_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a `.whirr` project directory in the current working tree.
    Init,

    /// Run a worker: claim jobs, execute them, report results.
    Worker {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        gpu_index: Option<i32>,
    },

    /// Run the HTTP API server plus its background lease monitor.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8000")]
        bind: String,
    },

    /// Submit a single job to the queue.
    Submit {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        workdir: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Cancel a queued or running job.
    Cancel { job_id: i64 },

    /// Retry a failed or cancelled job as a fresh job row.
    Retry { job_id: i64 },

    /// Print queue/worker status.
    Status,

    #[command(subcommand)]
    Ablate(AblateCommands),
}

#[derive(Subcommand)]
enum AblateCommands {
    /// Create a new ablation session.
    Init {
        name: String,
        #[arg(long)]
        metric: String,
    },
    /// Add a delta (parameter change) to a session.
    Add {
        name: String,
        #[arg(long = "name", short = 'n')]
        delta_name: Option<String>,
        #[arg(required = true)]
        deltas: Vec<String>,
    },
    /// Expand and submit all conditions/replicates of a session.
    Run {
        name: String,
        #[arg(long, short = 'r')]
        replicates: Option<u32>,
        #[arg(long, short = 'n')]
        dry_run: bool,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Rank deltas by their effect on the session's target metric.
    Rank {
        name: String,
        #[arg(long, short = 'v')]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => run_init(),
        Commands::Worker { id, gpu_index } => run_worker_cmd(cli.database_url, id, gpu_index).await,
        Commands::Serve { bind } => run_serve_cmd(cli.database_url, bind).await,
        Commands::Submit { name, workdir, tags, command } => {
            run_submit(cli.database_url, name, workdir, tags, command).await
        }
        Commands::Cancel { job_id } => run_cancel(cli.database_url, job_id).await,
        Commands::Retry { job_id } => run_retry(cli.database_url, job_id).await,
        Commands::Status => run_status(cli.database_url).await,
        Commands::Ablate(cmd) => run_ablate(cli.database_url, cmd).await,
    }
}

// -----------------------------------------------------------------------------
// Storage wiring
// -----------------------------------------------------------------------------

async fn open_storage(
    database_url: Option<String>,
    whirr_dir: &std::path::Path,
    heartbeat_timeout: u64,
) -> Result<Arc<dyn Storage>> {
    if let Some(url) = database_url {
        let backend = whirr::storage::postgres::PgStorage::connect(&url)
            .await
            .context("failed to connect to postgres")?;
        return Ok(Arc::new(StorageBackend::Postgres(backend)));
    }
    let backend = whirr::storage::sqlite::SqliteStorage::open(config::db_path(whirr_dir), heartbeat_timeout)
        .context("failed to open sqlite db")?;
    Ok(Arc::new(StorageBackend::Sqlite(backend)))
}

fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    let ctrlc_tx = tx.clone();
    tokio::spawn(async move {
        signal::ctrl_c().await.ok();
        log::warn!("interrupt received, shutting down");
        let _ = ctrlc_tx.send(true);
    });
    (tx, rx)
}

// -----------------------------------------------------------------------------
// init
// -----------------------------------------------------------------------------

fn run_init() -> Result<()> {
    let whirr_dir = std::env::current_dir()?.join(".whirr");
    std::fs::create_dir_all(&whirr_dir)?;
    std::fs::create_dir_all(config::runs_dir(&whirr_dir))?;
    std::fs::create_dir_all(config::ablations_dir(&whirr_dir))?;

    let config_path = whirr_dir.join("config.yaml");
    if !config_path.exists() {
        std::fs::write(&config_path, serde_yaml::to_string(&WhirrConfig::default())?)?;
    }

    // Touch the sqlite db so it exists with the schema applied.
    whirr::storage::sqlite::SqliteStorage::open(config::db_path(&whirr_dir), 120)
        .context("failed to initialize local database")?;

    log::info!("initialized {}", whirr_dir.display());
    Ok(())
}

// -----------------------------------------------------------------------------
// worker
// -----------------------------------------------------------------------------

async fn run_worker_cmd(database_url: Option<String>, id: Option<String>, gpu_index: Option<i32>) -> Result<()> {
    let whirr_dir = config::require_whirr_dir()?;
    let cfg = config::load_config(Some(&whirr_dir))?;
    let storage = open_storage(database_url, &whirr_dir, cfg.heartbeat_timeout).await?;

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let worker_id = id.unwrap_or_else(WorkerOptions::generate_worker_id);

    let (_tx, rx) = shutdown_channel();
    run_worker(
        storage,
        WorkerOptions {
            worker_id,
            runs_dir: config::runs_dir(&whirr_dir),
            hostname,
            gpu_index,
            config: cfg,
        },
        rx,
    )
    .await
}

// -----------------------------------------------------------------------------
// serve
// -----------------------------------------------------------------------------

async fn run_serve_cmd(database_url: Option<String>, bind: String) -> Result<()> {
    let whirr_dir = config::require_whirr_dir()?;
    let cfg = config::load_config(Some(&whirr_dir))?;
    let storage = open_storage(database_url, &whirr_dir, cfg.heartbeat_timeout).await?;

    let addr: std::net::SocketAddr = bind.parse().context("invalid --bind address")?;
    let state = whirr::api::AppState {
        storage,
        data_dir: whirr_dir.clone(),
    };

    let (_tx, rx) = shutdown_channel();
    whirr::api::serve(addr, state, rx).await
}

// -----------------------------------------------------------------------------
// submit / cancel / retry / status
// -----------------------------------------------------------------------------

async fn run_submit(
    database_url: Option<String>,
    name: Option<String>,
    workdir: Option<String>,
    tags: Vec<String>,
    command: Vec<String>,
) -> Result<()> {
    let whirr_dir = config::require_whirr_dir()?;
    let cfg = config::load_config(Some(&whirr_dir))?;
    let storage = open_storage(database_url, &whirr_dir, cfg.heartbeat_timeout).await?;

    let workdir = workdir.unwrap_or_else(|| {
        std::env::current_dir()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| "/".to_string())
    });

    let job_id = storage
        .create_job(NewJob {
            command_argv: command,
            workdir,
            name,
            config: None,
            tags: if tags.is_empty() { None } else { Some(tags) },
            parent_job_id: None,
        })
        .await?;

    println!("job {job_id} submitted (run job-{job_id})");
    Ok(())
}

async fn run_cancel(database_url: Option<String>, job_id: i64) -> Result<()> {
    let whirr_dir = config::require_whirr_dir()?;
    let cfg = config::load_config(Some(&whirr_dir))?;
    let storage = open_storage(database_url, &whirr_dir, cfg.heartbeat_timeout).await?;

    let previous_status = storage.cancel_job(job_id).await?;
    println!("job {job_id} cancelled (was {previous_status})");
    Ok(())
}

async fn run_retry(database_url: Option<String>, job_id: i64) -> Result<()> {
    let whirr_dir = config::require_whirr_dir()?;
    let cfg = config::load_config(Some(&whirr_dir))?;
    let storage = open_storage(database_url, &whirr_dir, cfg.heartbeat_timeout).await?;

    let new_job_id = storage.retry_job(job_id).await?;
    println!("job {job_id} retried as job {new_job_id}");
    Ok(())
}

async fn run_status(database_url: Option<String>) -> Result<()> {
    let whirr_dir = config::require_whirr_dir()?;
    let cfg = config::load_config(Some(&whirr_dir))?;
    let storage = open_storage(database_url, &whirr_dir, cfg.heartbeat_timeout).await?;

    let active = storage.get_active_jobs().await?;
    let workers = storage.get_workers().await?;
    let queued = active.iter().filter(|j| j.status.as_str() == "queued").count();
    let running = active.iter().filter(|j| j.status.as_str() == "running").count();

    println!("queued:  {queued}");
    println!("running: {running}");
    println!("workers: {}", workers.len());
    for w in &workers {
        println!("  {} [{}] job={:?}", w.id, w.status.as_str(), w.current_job_id);
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// ablate
// -----------------------------------------------------------------------------

async fn run_ablate(database_url: Option<String>, cmd: AblateCommands) -> Result<()> {
    let whirr_dir = config::require_whirr_dir()?;

    match cmd {
        AblateCommands::Init { name, metric } => {
            let session = ablation::create_session(&whirr_dir, &name, &metric)?;
            println!("created ablation session '{}' ({})", session.name, session.session_id);
            Ok(())
        }
        AblateCommands::Add { name, delta_name, deltas } => {
            let project_root = whirr_dir.parent().unwrap_or(&whirr_dir).to_path_buf();
            let mut session = ablation::load_session_by_name(&whirr_dir, &name)?;

            let mut changes = IndexMap::new();
            for delta in &deltas {
                let (key, value) = delta
                    .split_once('=')
                    .ok_or_else(|| anyhow!("invalid delta format: '{delta}' (expected key=value)"))?;
                changes.insert(key.to_string(), ablation::parse_value(value, &project_root)?);
            }

            let resolved = ablation::add_delta(&mut session, delta_name, changes)?;
            ablation::save_session(&whirr_dir, &session)?;
            println!("added delta: {resolved}");
            Ok(())
        }
        AblateCommands::Run { name, replicates, dry_run, command } => {
            let cfg = config::load_config(Some(&whirr_dir))?;
            let mut session = ablation::load_session_by_name(&whirr_dir, &name)?;
            let jobs = ablation::expand_session(&whirr_dir, &session, replicates, &command, dry_run)?;

            println!("{} jobs across {} conditions", jobs.len(), session.condition_names().len());
            if dry_run {
                println!("dry run: no jobs submitted");
                return Ok(());
            }

            let storage = open_storage(database_url, &whirr_dir, cfg.heartbeat_timeout).await?;
            let workdir = std::env::current_dir()?.to_string_lossy().to_string();
            let submitted = ablation::submit_local(storage.as_ref(), &workdir, jobs, &mut session).await?;
            ablation::save_session(&whirr_dir, &session)?;

            println!("submitted {} jobs", submitted.len());
            Ok(())
        }
        AblateCommands::Rank { name, verbose } => {
            let cfg = config::load_config(Some(&whirr_dir))?;
            let storage = open_storage(database_url, &whirr_dir, cfg.heartbeat_timeout).await?;
            let mut session = ablation::load_session_by_name(&whirr_dir, &name)?;
            let runs_dir = config::runs_dir(&whirr_dir);

            let by_condition = ablation::collect_metrics(storage.as_ref(), &runs_dir, &mut session).await?;
            ablation::save_session(&whirr_dir, &session)?;

            let effects = ablation::rank_deltas(&session, &by_condition)?;
            println!("ablation results: {}", session.name);
            println!("  metric: {}", session.metric);
            for (rank, effect) in effects.iter().enumerate() {
                println!(
                    "  {}. {} mean={:.4} effect={:+.4} n={}",
                    rank + 1,
                    effect.name,
                    effect.mean,
                    effect.effect,
                    effect.n
                );
                if verbose {
                    println!("     values: {:?}", effect.values);
                }
            }
            Ok(())
        }
    }
}
