// src/worker.rs
//
// =============================================================================
// WHIRR: WORKER LOOP
// =============================================================================
//
// Register, recover orphaned jobs left by a previous crash, then
// claim-run-complete in a loop until told to shut down. One job runs at a
// time per worker.
//
// Shutdown is a `tokio::sync::watch<bool>`; cancellation is observed
// through the heartbeat's return value and surfaced to the run loop via a
// shared `AtomicBool`, since the heartbeat ticks on its own
// `tokio::spawn`ed task independent of the child-exit poll.

use crate::config::WhirrConfig;
use crate::model::Job;
use crate::recorder::RunHandle;
use crate::runner::JobRunner;
use crate::storage::{NewRun, Storage};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

pub struct WorkerOptions {
    pub worker_id: String,
    pub runs_dir: std::path::PathBuf,
    pub hostname: String,
    pub gpu_index: Option<i32>,
    pub config: WhirrConfig,
}

impl WorkerOptions {
    pub fn generate_worker_id() -> String {
        format!("worker-{}", Uuid::new_v4().simple())
    }
}

/// Run the worker loop until `shutdown` reports `true`. Returns once the
/// worker has unregistered itself.
pub async fn run_worker(
    storage: Arc<dyn Storage>,
    opts: WorkerOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let lease_seconds = (opts.config.heartbeat_timeout as i64).clamp(10, 600);
    let pid = std::process::id() as i32;

    storage
        .register_worker(&opts.worker_id, pid, &opts.hostname, opts.gpu_index)
        .await
        .context("failed to register worker")?;

    // Orphan recovery: a previous worker crash can leave `running` rows
    // whose lease/heartbeat has gone stale. Safe to run unconditionally —
    // `requeue_expired` only touches rows that are actually past due.
    match storage.requeue_expired().await {
        Ok(requeued) if !requeued.is_empty() => {
            log::info!("requeued {} orphaned job(s) at startup", requeued.len());
        }
        Ok(_) => {}
        Err(e) => log::warn!("orphan recovery at startup failed: {e}"),
    }

    loop {
        if *shutdown.borrow() {
            break;
        }

        let claimed = storage.claim_job(&opts.worker_id, lease_seconds).await;
        let job = match claimed {
            Ok(Some(job)) => job,
            Ok(None) => {
                if wait_or_shutdown(&mut shutdown, Duration::from_secs(opts.config.poll_interval))
                    .await
                {
                    break;
                }
                continue;
            }
            Err(e) => {
                log::error!("claim_job failed: {e}");
                if wait_or_shutdown(&mut shutdown, Duration::from_secs(opts.config.poll_interval))
                    .await
                {
                    break;
                }
                continue;
            }
        };

        if let Err(e) = storage
            .update_worker_status(&opts.worker_id, "busy", Some(job.id))
            .await
        {
            log::warn!("failed to mark worker busy: {e}");
        }

        if let Err(e) = run_one_job(&storage, &opts, job, lease_seconds, &mut shutdown).await {
            log::error!("job execution failed: {e}");
        }

        if let Err(e) = storage
            .update_worker_status(&opts.worker_id, "idle", None)
            .await
        {
            log::warn!("failed to mark worker idle: {e}");
        }
    }

    let _ = storage
        .update_worker_status(&opts.worker_id, "offline", None)
        .await;
    storage
        .unregister_worker(&opts.worker_id)
        .await
        .context("failed to unregister worker")?;
    Ok(())
}

/// Sleep up to `dur`, waking early on a shutdown signal. Returns `true` if
/// shutdown was observed.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, dur: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => *shutdown.borrow(),
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}

/// Outcome of the part of the job lifecycle that can run a process.
struct JobOutcome {
    exit_code: i32,
    status: &'static str,
    error_message: Option<String>,
    summary: Option<serde_json::Value>,
}

/// Run one claimed job to completion. Any failure here — in the run
/// recorder, the process runner, or a storage call made along the way —
/// still ends with a `complete_job` call reporting failure, so a worker-side
/// bug never leaves a job stuck in `running`; only the storage calls made
/// to report that failure are themselves allowed to propagate.
async fn run_one_job(
    storage: &Arc<dyn Storage>,
    opts: &WorkerOptions,
    job: Job,
    lease_seconds: i64,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let run_id = format!("job-{}", job.id);
    let run_dir = opts.runs_dir.join(&run_id);

    if let Err(e) = storage
        .create_run(NewRun {
            id: run_id.clone(),
            run_dir: run_dir.to_string_lossy().to_string(),
            name: job.name.clone(),
            config: job.config.clone(),
            tags: job.tags.clone(),
            job_id: Some(job.id),
        })
        .await
    {
        log::error!("job {}: failed to create run row: {e}", job.id);
        return storage
            .complete_job(job.id, &opts.worker_id, 1, None, Some(&format!("worker error: {e}")))
            .await;
    }

    let outcome = execute_job(storage, opts, &job, &run_id, &run_dir, lease_seconds, shutdown).await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("job {}: worker error between claim and complete: {e}", job.id);
            JobOutcome {
                exit_code: 1,
                status: "failed",
                error_message: Some(format!("worker error: {e}")),
                summary: None,
            }
        }
    };

    storage
        .complete_job(
            job.id,
            &opts.worker_id,
            outcome.exit_code,
            Some(&run_id),
            outcome.error_message.as_deref(),
        )
        .await?;
    storage.complete_run(&run_id, outcome.status, outcome.summary).await?;
    Ok(())
}

/// The part of the job lifecycle that can fail partway through: opening the
/// run recorder, spawning the process, and watching it to completion.
/// Propagates on any setup failure so `run_one_job` can still report the
/// job as failed instead of leaving it `running`.
async fn execute_job(
    storage: &Arc<dyn Storage>,
    opts: &WorkerOptions,
    job: &Job,
    run_id: &str,
    run_dir: &Path,
    lease_seconds: i64,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<JobOutcome> {
    let recorder = RunHandle::open(
        run_dir,
        run_id,
        job.name.clone(),
        job.tags.clone().unwrap_or_default(),
        job.config.as_ref(),
    )
    .await?;

    let env = vec![
        ("WHIRR_JOB_ID".to_string(), job.id.to_string()),
        ("WHIRR_RUN_DIR".to_string(), run_dir.to_string_lossy().to_string()),
        ("WHIRR_RUN_ID".to_string(), run_id.to_string()),
    ];

    let mut runner = JobRunner::spawn(&job.command_argv, Path::new(&job.workdir), run_dir, &env).await?;

    storage
        .update_job_process_info(job.id, runner.pid(), runner.pgid())
        .await?;

    let cancel_requested = Arc::new(AtomicBool::new(false));
    let heartbeat_handle = tokio::spawn(heartbeat_task(
        storage.clone(),
        job.id,
        opts.worker_id.clone(),
        lease_seconds,
        Duration::from_secs(opts.config.heartbeat_interval),
        cancel_requested.clone(),
    ));

    enum StopReason {
        Exited,
        Shutdown,
        Cancelled,
    }

    let grace_period = Duration::from_secs(opts.config.kill_grace_period);
    let (exit_code, reason) = loop {
        if let Some(code) = runner.poll()? {
            break (code, StopReason::Exited);
        }
        if cancel_requested.load(Ordering::SeqCst) {
            break (runner.kill(grace_period).await?, StopReason::Cancelled);
        }
        if *shutdown.borrow() {
            break (runner.kill(grace_period).await?, StopReason::Shutdown);
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            _ = shutdown.changed() => {}
        }
    };

    heartbeat_handle.abort();

    let (status, error_message) = match reason {
        StopReason::Cancelled => ("failed", Some("cancelled".to_string())),
        StopReason::Shutdown => ("failed", Some("shutdown".to_string())),
        StopReason::Exited if exit_code == 0 => ("completed", None),
        StopReason::Exited => ("failed", Some(format!("process exited with code {exit_code}"))),
    };

    recorder.finish(status)?;

    Ok(JobOutcome {
        exit_code,
        status,
        error_message,
        summary: recorder.summary_snapshot(),
    })
}

async fn heartbeat_task(
    storage: Arc<dyn Storage>,
    job_id: i64,
    worker_id: String,
    lease_seconds: i64,
    interval: Duration,
    cancel_requested: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it
    loop {
        ticker.tick().await;
        match storage.heartbeat(job_id, &worker_id, lease_seconds).await {
            Ok(cancel) => {
                if cancel {
                    cancel_requested.store(true, Ordering::SeqCst);
                }
            }
            Err(e) => log::warn!("heartbeat for job {job_id} failed: {e}"),
        }
    }
}
