// src/storage/postgres.rs
//
// =============================================================================
// WHIRR: POSTGRES STORAGE (networked / multi-host mode)
// =============================================================================
//
// Networked backend on `sqlx::PgPool`. The claim query uses a
// `FOR UPDATE SKIP LOCKED` CTE: Postgres, unlike SQLite's single-writer
// `BEGIN IMMEDIATE`, allows genuinely concurrent claimers, so the
// sub-select needs `FOR UPDATE SKIP LOCKED` to avoid two transactions
// blocking on the same candidate row. Uses `lease_expires_at` uniformly
// for orphan detection, unlike the SQLite backend which uses
// `heartbeat_at`.

use super::{NewJob, NewRun, Result};
use crate::error::SchedulerError;
use crate::model::{Job, JobStatus, Run, RunStatus, Worker, WorkerStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id SERIAL PRIMARY KEY,
    name TEXT,
    command_argv TEXT NOT NULL,
    workdir TEXT NOT NULL,
    config TEXT,
    status TEXT DEFAULT 'queued',
    tags TEXT,
    attempt INTEGER DEFAULT 1,
    parent_job_id INTEGER REFERENCES jobs(id),
    created_at TIMESTAMPTZ DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    worker_id TEXT,
    heartbeat_at TIMESTAMPTZ,
    lease_expires_at TIMESTAMPTZ,
    pid INTEGER,
    pgid INTEGER,
    exit_code INTEGER,
    error_message TEXT,
    cancel_requested_at TIMESTAMPTZ,
    run_id TEXT
);

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    job_id INTEGER REFERENCES jobs(id),
    name TEXT,
    config TEXT,
    tags TEXT,
    status TEXT DEFAULT 'running',
    started_at TIMESTAMPTZ DEFAULT NOW(),
    finished_at TIMESTAMPTZ,
    duration_seconds DOUBLE PRECISION,
    summary TEXT,
    git_hash TEXT,
    git_dirty BOOLEAN,
    hostname TEXT,
    run_dir TEXT
);

CREATE TABLE IF NOT EXISTS workers (
    id TEXT PRIMARY KEY,
    pid INTEGER,
    hostname TEXT,
    gpu_index INTEGER,
    status TEXT DEFAULT 'idle',
    current_job_id INTEGER,
    started_at TIMESTAMPTZ DEFAULT NOW(),
    last_heartbeat TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs(lease_expires_at);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
CREATE INDEX IF NOT EXISTS idx_runs_job_id ON runs(job_id);
";

pub struct PgStorage {
    pool: PgPool,
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> sqlx::Result<Job> {
    let argv_json: String = row.try_get("command_argv")?;
    let tags_json: Option<String> = row.try_get("tags")?;
    let config_json: Option<String> = row.try_get("config")?;
    let status: String = row.try_get("status")?;

    Ok(Job {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        command_argv: serde_json::from_str(&argv_json).unwrap_or_default(),
        workdir: row.try_get("workdir")?,
        config: config_json.and_then(|s| serde_json::from_str::<Value>(&s).ok()),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Queued),
        tags: tags_json.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok()),
        attempt: row.try_get::<i32, _>("attempt")? as i64,
        parent_job_id: row.try_get::<Option<i32>, _>("parent_job_id")?.map(|v| v as i64),
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        worker_id: row.try_get("worker_id")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        pid: row.try_get("pid")?,
        pgid: row.try_get("pgid")?,
        exit_code: row.try_get("exit_code")?,
        error_message: row.try_get("error_message")?,
        cancel_requested_at: row.try_get("cancel_requested_at")?,
        run_id: row.try_get("run_id")?,
    })
}

fn row_to_run(row: &sqlx::postgres::PgRow) -> sqlx::Result<Run> {
    let tags_json: Option<String> = row.try_get("tags")?;
    let config_json: Option<String> = row.try_get("config")?;
    let summary_json: Option<String> = row.try_get("summary")?;
    let status: String = row.try_get("status")?;

    Ok(Run {
        id: row.try_get("id")?,
        job_id: row.try_get::<Option<i32>, _>("job_id")?.map(|v| v as i64),
        name: row.try_get("name")?,
        config: config_json.and_then(|s| serde_json::from_str::<Value>(&s).ok()),
        tags: tags_json.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok()),
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Running),
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        summary: summary_json.and_then(|s| serde_json::from_str::<Value>(&s).ok()),
        git_hash: row.try_get("git_hash")?,
        git_dirty: row.try_get("git_dirty")?,
        hostname: row.try_get("hostname")?,
        run_dir: row.try_get("run_dir")?,
    })
}

fn row_to_worker(row: &sqlx::postgres::PgRow) -> sqlx::Result<Worker> {
    let status: String = row.try_get("status")?;
    Ok(Worker {
        id: row.try_get("id")?,
        pid: row.try_get("pid")?,
        hostname: row.try_get("hostname")?,
        gpu_index: row.try_get("gpu_index")?,
        status: WorkerStatus::parse(&status).unwrap_or(WorkerStatus::Offline),
        current_job_id: row.try_get::<Option<i32>, _>("current_job_id")?.map(|v| v as i64),
        started_at: row.try_get("started_at")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
    })
}

impl PgStorage {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl super::Storage for PgStorage {
    async fn create_job(&self, job: NewJob) -> Result<i64> {
        super::validate_new_job(&job)?;
        let attempt: Option<i32> = if job.parent_job_id.is_none() { Some(1) } else { None };
        let row = sqlx::query(
            "INSERT INTO jobs (name, command_argv, workdir, config, tags, parent_job_id, attempt)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
        )
        .bind(job.name)
        .bind(serde_json::to_string(&job.command_argv)?)
        .bind(job.workdir)
        .bind(job.config.map(|v| v.to_string()))
        .bind(job.tags.map(|t| serde_json::to_string(&t)).transpose()?)
        .bind(job.parent_job_id.map(|v| v as i32))
        .bind(attempt)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i32, _>("id")? as i64)
    }

    async fn claim_job(&self, worker_id: &str, lease_seconds: i64) -> Result<Option<Job>> {
        super::validate_lease_seconds(lease_seconds)?;
        let row = sqlx::query(
            "WITH claimable AS (
                 SELECT id FROM jobs
                 WHERE status = 'queued'
                 ORDER BY created_at, id
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
             UPDATE jobs
             SET status = 'running',
                 worker_id = $1,
                 started_at = NOW(),
                 heartbeat_at = NOW(),
                 lease_expires_at = NOW() + make_interval(secs => $2)
             WHERE id IN (SELECT id FROM claimable)
             RETURNING *",
        )
        .bind(worker_id)
        .bind(lease_seconds as f64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| row_to_job(&r)).transpose()?)
    }

    async fn heartbeat(&self, job_id: i64, worker_id: &str, lease_seconds: i64) -> Result<bool> {
        super::validate_lease_seconds(lease_seconds)?;
        let row = sqlx::query(
            "UPDATE jobs
             SET heartbeat_at = NOW(), lease_expires_at = NOW() + make_interval(secs => $1)
             WHERE id = $2 AND worker_id = $3 AND status = 'running'
             RETURNING cancel_requested_at",
        )
        .bind(lease_seconds as f64)
        .bind(job_id as i32)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(SchedulerError::OwnershipViolation {
                job_id,
                worker_id: worker_id.to_string(),
            });
        };
        let cancel_requested_at: Option<DateTime<Utc>> = row.try_get("cancel_requested_at")?;
        Ok(cancel_requested_at.is_some())
    }

    async fn update_job_process_info(&self, job_id: i64, pid: i32, pgid: i32) -> Result<()> {
        sqlx::query("UPDATE jobs SET pid = $1, pgid = $2 WHERE id = $3")
            .bind(pid)
            .bind(pgid)
            .bind(job_id as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_job(
        &self,
        job_id: i64,
        worker_id: &str,
        exit_code: i32,
        run_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let owner: Option<String> = sqlx::query("SELECT worker_id FROM jobs WHERE id = $1")
            .bind(job_id as i32)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| r.try_get("worker_id"))
            .transpose()?
            .flatten();
        let Some(owner) = owner else {
            return Err(SchedulerError::JobNotFound(job_id));
        };
        if owner != worker_id {
            return Err(SchedulerError::OwnershipViolation {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }

        let status = if exit_code == 0 { "completed" } else { "failed" };
        sqlx::query(
            "UPDATE jobs
             SET status = $1, finished_at = NOW(), exit_code = $2, run_id = $3,
                 error_message = $4, pid = NULL, pgid = NULL, lease_expires_at = NULL
             WHERE id = $5",
        )
        .bind(status)
        .bind(exit_code)
        .bind(run_id)
        .bind(error_message)
        .bind(job_id as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_job(&self, job_id: i64) -> Result<String> {
        let old_status: Option<String> = sqlx::query("SELECT status FROM jobs WHERE id = $1")
            .bind(job_id as i32)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| r.try_get("status"))
            .transpose()?;
        let Some(old_status) = old_status else {
            return Err(SchedulerError::JobNotFound(job_id));
        };

        match old_status.as_str() {
            "queued" => {
                sqlx::query("UPDATE jobs SET status = 'cancelled', finished_at = NOW() WHERE id = $1")
                    .bind(job_id as i32)
                    .execute(&self.pool)
                    .await?;
            }
            "running" => {
                sqlx::query("UPDATE jobs SET cancel_requested_at = NOW() WHERE id = $1")
                    .bind(job_id as i32)
                    .execute(&self.pool)
                    .await?;
            }
            _ => {}
        }
        Ok(old_status)
    }

    async fn retry_job(&self, job_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id as i32)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Err(SchedulerError::JobNotFound(job_id));
        };
        let original = row_to_job(&row)?;
        if !matches!(original.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(SchedulerError::NotRetryable(original.status.as_str().to_string()));
        }

        let row = sqlx::query(
            "INSERT INTO jobs (name, command_argv, workdir, config, tags, parent_job_id, attempt)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
        )
        .bind(original.name)
        .bind(serde_json::to_string(&original.command_argv)?)
        .bind(original.workdir)
        .bind(original.config.map(|v| v.to_string()))
        .bind(original.tags.map(|t| serde_json::to_string(&t)).transpose()?)
        .bind(job_id as i32)
        .bind((original.attempt + 1) as i32)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i32, _>("id")? as i64)
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id as i32)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_job(&r)).transpose()?)
    }

    async fn get_active_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status IN ('queued', 'running') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_job).collect::<sqlx::Result<Vec<_>>>()?)
    }

    async fn get_jobs(&self, status: Option<&str>, limit: i64) -> Result<Vec<Job>> {
        let rows = if let Some(status) = status {
            sqlx::query("SELECT * FROM jobs WHERE status = $1 ORDER BY created_at DESC LIMIT $2")
                .bind(status)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC LIMIT $1")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
        };
        Ok(rows.iter().map(row_to_job).collect::<sqlx::Result<Vec<_>>>()?)
    }

    async fn get_job_by_run_id(&self, run_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_job(&r)).transpose()?)
    }

    async fn cancel_all_queued(&self) -> Result<i64> {
        let result = sqlx::query("UPDATE jobs SET status = 'cancelled', finished_at = NOW() WHERE status = 'queued'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as i64)
    }

    async fn requeue_expired(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status = 'running' AND lease_expires_at IS NOT NULL AND lease_expires_at < NOW()",
        )
        .fetch_all(&self.pool)
        .await?;
        let expired = rows.iter().map(row_to_job).collect::<sqlx::Result<Vec<_>>>()?;

        for job in &expired {
            sqlx::query(
                "UPDATE jobs
                 SET status = 'queued', worker_id = NULL, started_at = NULL, heartbeat_at = NULL,
                     lease_expires_at = NULL, cancel_requested_at = NULL, pid = NULL, pgid = NULL,
                     attempt = attempt + 1
                 WHERE id = $1",
            )
            .bind(job.id as i32)
            .execute(&self.pool)
            .await?;
        }
        Ok(expired)
    }

    async fn create_run(&self, run: NewRun) -> Result<()> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        sqlx::query(
            "INSERT INTO runs (id, job_id, name, config, tags, run_dir, hostname)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(run.id)
        .bind(run.job_id.map(|v| v as i32))
        .bind(run.name)
        .bind(run.config.map(|v| v.to_string()))
        .bind(run.tags.map(|t| serde_json::to_string(&t)).transpose()?)
        .bind(run.run_dir)
        .bind(hostname)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_run(&self, run_id: &str, status: &str, summary: Option<Value>) -> Result<()> {
        let started_at: Option<DateTime<Utc>> = sqlx::query("SELECT started_at FROM runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| r.try_get("started_at"))
            .transpose()?;

        let duration = started_at.map(|s| (Utc::now() - s).num_milliseconds() as f64 / 1000.0);

        sqlx::query(
            "UPDATE runs SET status = $1, finished_at = NOW(), duration_seconds = $2, summary = $3 WHERE id = $4",
        )
        .bind(status)
        .bind(duration)
        .bind(summary.map(|v| v.to_string()))
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_run(&r)).transpose()?)
    }

    async fn get_runs(&self, status: Option<&str>, tag: Option<&str>, limit: i64) -> Result<Vec<Run>> {
        let tag_pattern = tag.map(|t| format!("%\"{t}\"%"));
        let rows = match (status, &tag_pattern) {
            (Some(s), Some(t)) => {
                sqlx::query("SELECT * FROM runs WHERE status = $1 AND tags LIKE $2 ORDER BY started_at DESC LIMIT $3")
                    .bind(s)
                    .bind(t)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (Some(s), None) => {
                sqlx::query("SELECT * FROM runs WHERE status = $1 ORDER BY started_at DESC LIMIT $2")
                    .bind(s)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, Some(t)) => {
                sqlx::query("SELECT * FROM runs WHERE tags LIKE $1 ORDER BY started_at DESC LIMIT $2")
                    .bind(t)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, None) => {
                sqlx::query("SELECT * FROM runs ORDER BY started_at DESC LIMIT $1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(row_to_run).collect::<sqlx::Result<Vec<_>>>()?)
    }

    async fn register_worker(
        &self,
        worker_id: &str,
        pid: i32,
        hostname: &str,
        gpu_index: Option<i32>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers (id, pid, hostname, gpu_index, status, started_at, last_heartbeat)
             VALUES ($1, $2, $3, $4, 'idle', NOW(), NOW())
             ON CONFLICT(id) DO UPDATE SET
                pid = excluded.pid, status = 'idle', started_at = excluded.started_at,
                last_heartbeat = excluded.last_heartbeat",
        )
        .bind(worker_id)
        .bind(pid)
        .bind(hostname)
        .bind(gpu_index)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_worker_status(
        &self,
        worker_id: &str,
        status: &str,
        current_job_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE workers SET status = $1, current_job_id = $2, last_heartbeat = NOW() WHERE id = $3",
        )
        .bind(status)
        .bind(current_job_id.map(|v| v as i32))
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<()> {
        sqlx::query("UPDATE workers SET status = 'offline', current_job_id = NULL WHERE id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_workers(&self) -> Result<Vec<Worker>> {
        let rows = sqlx::query("SELECT * FROM workers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_worker).collect::<sqlx::Result<Vec<_>>>()?)
    }
}
