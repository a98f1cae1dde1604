// src/storage/mod.rs
//
// =============================================================================
// WHIRR: STORAGE
// =============================================================================
//
// One trait, two backends, identical semantics — this is deliberately *not*
// layered behind a second "scheduler" abstraction: the original source ships
// both a free-function API and a class-based `Database` ABC over the same
// schema and calls the duplication out as redundant (DESIGN NOTES, "two
// dueling legacy/v2 storage APIs"). `Storage` plays the role of `Database`
// directly; `SqliteStorage`/`PgStorage` are `SQLiteDatabase`/`PostgresDatabase`
// ported to Rust.
//
// Dispatch between backends happens once, at start-up (`open`), via a plain
// enum rather than leaking `Sqlite`/`Pg` types into callers — the scheduler
// core only ever sees `dyn Storage`.

pub mod postgres;
pub mod sqlite;

use crate::error::SchedulerError;
use crate::model::{Job, Run, Worker};
use async_trait::async_trait;
use serde_json::Value;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Clone)]
pub struct NewJob {
    pub command_argv: Vec<String>,
    pub workdir: String,
    pub name: Option<String>,
    pub config: Option<Value>,
    pub tags: Option<Vec<String>>,
    pub parent_job_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: String,
    pub run_dir: String,
    pub name: Option<String>,
    pub config: Option<Value>,
    pub tags: Option<Vec<String>>,
    pub job_id: Option<i64>,
}

/// Bounds on lease duration: `10 <= lease_seconds <= 600`.
pub const MIN_LEASE_SECONDS: i64 = 10;
pub const MAX_LEASE_SECONDS: i64 = 600;

#[async_trait]
pub trait Storage: Send + Sync {
    // --- Job operations (§4.1) ---

    async fn create_job(&self, job: NewJob) -> Result<i64>;

    /// Atomically claim the oldest `queued` job, ordered by `(created_at, id)`.
    /// Must not let two concurrent callers observe the same row.
    async fn claim_job(&self, worker_id: &str, lease_seconds: i64) -> Result<Option<Job>>;

    /// Refresh `heartbeat_at` (and, on the networked backend, `lease_expires_at`);
    /// return whether the job's owner has requested cancellation.
    async fn heartbeat(
        &self,
        job_id: i64,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<bool>;

    async fn update_job_process_info(&self, job_id: i64, pid: i32, pgid: i32) -> Result<()>;

    async fn complete_job(
        &self,
        job_id: i64,
        worker_id: &str,
        exit_code: i32,
        run_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Returns the job's previous status.
    async fn cancel_job(&self, job_id: i64) -> Result<String>;

    async fn retry_job(&self, job_id: i64) -> Result<i64>;

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>>;

    async fn get_active_jobs(&self) -> Result<Vec<Job>>;

    async fn get_jobs(&self, status: Option<&str>, limit: i64) -> Result<Vec<Job>>;

    async fn get_job_by_run_id(&self, run_id: &str) -> Result<Option<Job>>;

    async fn cancel_all_queued(&self) -> Result<i64>;

    /// Requeue `running` jobs whose lease/heartbeat has expired, incrementing
    /// `attempt` and clearing owner/pid/pgid/lease. Idempotent.
    async fn requeue_expired(&self) -> Result<Vec<Job>>;

    // --- Run operations ---

    async fn create_run(&self, run: NewRun) -> Result<()>;

    async fn complete_run(&self, run_id: &str, status: &str, summary: Option<Value>) -> Result<()>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    async fn get_runs(&self, status: Option<&str>, tag: Option<&str>, limit: i64) -> Result<Vec<Run>>;

    // --- Worker operations ---

    async fn register_worker(
        &self,
        worker_id: &str,
        pid: i32,
        hostname: &str,
        gpu_index: Option<i32>,
    ) -> Result<()>;

    async fn update_worker_status(
        &self,
        worker_id: &str,
        status: &str,
        current_job_id: Option<i64>,
    ) -> Result<()>;

    async fn unregister_worker(&self, worker_id: &str) -> Result<()>;

    async fn get_workers(&self) -> Result<Vec<Worker>>;
}

/// Picked once at start-up so the rest of the program depends only on
/// `dyn Storage`, never on a concrete backend type.
pub enum StorageBackend {
    Sqlite(sqlite::SqliteStorage),
    Postgres(postgres::PgStorage),
}

#[async_trait]
impl Storage for StorageBackend {
    async fn create_job(&self, job: NewJob) -> Result<i64> {
        match self {
            StorageBackend::Sqlite(s) => s.create_job(job).await,
            StorageBackend::Postgres(s) => s.create_job(job).await,
        }
    }

    async fn claim_job(&self, worker_id: &str, lease_seconds: i64) -> Result<Option<Job>> {
        match self {
            StorageBackend::Sqlite(s) => s.claim_job(worker_id, lease_seconds).await,
            StorageBackend::Postgres(s) => s.claim_job(worker_id, lease_seconds).await,
        }
    }

    async fn heartbeat(&self, job_id: i64, worker_id: &str, lease_seconds: i64) -> Result<bool> {
        match self {
            StorageBackend::Sqlite(s) => s.heartbeat(job_id, worker_id, lease_seconds).await,
            StorageBackend::Postgres(s) => s.heartbeat(job_id, worker_id, lease_seconds).await,
        }
    }

    async fn update_job_process_info(&self, job_id: i64, pid: i32, pgid: i32) -> Result<()> {
        match self {
            StorageBackend::Sqlite(s) => s.update_job_process_info(job_id, pid, pgid).await,
            StorageBackend::Postgres(s) => s.update_job_process_info(job_id, pid, pgid).await,
        }
    }

    async fn complete_job(
        &self,
        job_id: i64,
        worker_id: &str,
        exit_code: i32,
        run_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        match self {
            StorageBackend::Sqlite(s) => {
                s.complete_job(job_id, worker_id, exit_code, run_id, error_message)
                    .await
            }
            StorageBackend::Postgres(s) => {
                s.complete_job(job_id, worker_id, exit_code, run_id, error_message)
                    .await
            }
        }
    }

    async fn cancel_job(&self, job_id: i64) -> Result<String> {
        match self {
            StorageBackend::Sqlite(s) => s.cancel_job(job_id).await,
            StorageBackend::Postgres(s) => s.cancel_job(job_id).await,
        }
    }

    async fn retry_job(&self, job_id: i64) -> Result<i64> {
        match self {
            StorageBackend::Sqlite(s) => s.retry_job(job_id).await,
            StorageBackend::Postgres(s) => s.retry_job(job_id).await,
        }
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>> {
        match self {
            StorageBackend::Sqlite(s) => s.get_job(job_id).await,
            StorageBackend::Postgres(s) => s.get_job(job_id).await,
        }
    }

    async fn get_active_jobs(&self) -> Result<Vec<Job>> {
        match self {
            StorageBackend::Sqlite(s) => s.get_active_jobs().await,
            StorageBackend::Postgres(s) => s.get_active_jobs().await,
        }
    }

    async fn get_jobs(&self, status: Option<&str>, limit: i64) -> Result<Vec<Job>> {
        match self {
            StorageBackend::Sqlite(s) => s.get_jobs(status, limit).await,
            StorageBackend::Postgres(s) => s.get_jobs(status, limit).await,
        }
    }

    async fn get_job_by_run_id(&self, run_id: &str) -> Result<Option<Job>> {
        match self {
            StorageBackend::Sqlite(s) => s.get_job_by_run_id(run_id).await,
            StorageBackend::Postgres(s) => s.get_job_by_run_id(run_id).await,
        }
    }

    async fn cancel_all_queued(&self) -> Result<i64> {
        match self {
            StorageBackend::Sqlite(s) => s.cancel_all_queued().await,
            StorageBackend::Postgres(s) => s.cancel_all_queued().await,
        }
    }

    async fn requeue_expired(&self) -> Result<Vec<Job>> {
        match self {
            StorageBackend::Sqlite(s) => s.requeue_expired().await,
            StorageBackend::Postgres(s) => s.requeue_expired().await,
        }
    }

    async fn create_run(&self, run: NewRun) -> Result<()> {
        match self {
            StorageBackend::Sqlite(s) => s.create_run(run).await,
            StorageBackend::Postgres(s) => s.create_run(run).await,
        }
    }

    async fn complete_run(&self, run_id: &str, status: &str, summary: Option<Value>) -> Result<()> {
        match self {
            StorageBackend::Sqlite(s) => s.complete_run(run_id, status, summary).await,
            StorageBackend::Postgres(s) => s.complete_run(run_id, status, summary).await,
        }
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        match self {
            StorageBackend::Sqlite(s) => s.get_run(run_id).await,
            StorageBackend::Postgres(s) => s.get_run(run_id).await,
        }
    }

    async fn get_runs(&self, status: Option<&str>, tag: Option<&str>, limit: i64) -> Result<Vec<Run>> {
        match self {
            StorageBackend::Sqlite(s) => s.get_runs(status, tag, limit).await,
            StorageBackend::Postgres(s) => s.get_runs(status, tag, limit).await,
        }
    }

    async fn register_worker(
        &self,
        worker_id: &str,
        pid: i32,
        hostname: &str,
        gpu_index: Option<i32>,
    ) -> Result<()> {
        match self {
            StorageBackend::Sqlite(s) => s.register_worker(worker_id, pid, hostname, gpu_index).await,
            StorageBackend::Postgres(s) => s.register_worker(worker_id, pid, hostname, gpu_index).await,
        }
    }

    async fn update_worker_status(
        &self,
        worker_id: &str,
        status: &str,
        current_job_id: Option<i64>,
    ) -> Result<()> {
        match self {
            StorageBackend::Sqlite(s) => s.update_worker_status(worker_id, status, current_job_id).await,
            StorageBackend::Postgres(s) => s.update_worker_status(worker_id, status, current_job_id).await,
        }
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<()> {
        match self {
            StorageBackend::Sqlite(s) => s.unregister_worker(worker_id).await,
            StorageBackend::Postgres(s) => s.unregister_worker(worker_id).await,
        }
    }

    async fn get_workers(&self) -> Result<Vec<Worker>> {
        match self {
            StorageBackend::Sqlite(s) => s.get_workers().await,
            StorageBackend::Postgres(s) => s.get_workers().await,
        }
    }
}

pub fn validate_lease_seconds(lease_seconds: i64) -> Result<()> {
    if !(MIN_LEASE_SECONDS..=MAX_LEASE_SECONDS).contains(&lease_seconds) {
        return Err(SchedulerError::Validation(format!(
            "lease_seconds must be in [{MIN_LEASE_SECONDS}, {MAX_LEASE_SECONDS}], got {lease_seconds}"
        )));
    }
    Ok(())
}

pub fn validate_new_job(job: &NewJob) -> Result<()> {
    if job.command_argv.is_empty() {
        return Err(SchedulerError::Validation("command_argv must not be empty".into()));
    }
    if !job.workdir.starts_with('/') {
        return Err(SchedulerError::Validation("workdir must be an absolute path".into()));
    }
    Ok(())
}
