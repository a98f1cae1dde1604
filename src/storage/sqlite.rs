// src/storage/sqlite.rs
//
// =============================================================================
// WHIRR: SQLITE STORAGE (embedded / local mode)
// =============================================================================
//
// Embedded single-file backend: one long-lived connection in WAL mode,
// `BEGIN IMMEDIATE` + single-statement `UPDATE ... RETURNING` for the
// atomic claim, heartbeat-based (not lease-based) orphan detection.
// Pragmas are set once at open, schema created with
// `CREATE TABLE IF NOT EXISTS`. The connection lives behind a
// `tokio::sync::Mutex` rather than being reopened per call, since the
// atomic claim needs a held transaction, not just a single statement.

use super::{NewJob, NewRun, Result};
use crate::error::SchedulerError;
use crate::model::{Job, JobStatus, Run, RunStatus, Worker, WorkerStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use tokio::sync::Mutex;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT,
    command_argv TEXT NOT NULL,
    workdir TEXT NOT NULL,
    config TEXT,
    status TEXT DEFAULT 'queued',
    tags TEXT,
    attempt INTEGER DEFAULT 1,
    parent_job_id INTEGER REFERENCES jobs(id),
    created_at TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    started_at TEXT,
    finished_at TEXT,
    worker_id TEXT,
    heartbeat_at TEXT,
    lease_expires_at TEXT,
    pid INTEGER,
    pgid INTEGER,
    exit_code INTEGER,
    error_message TEXT,
    cancel_requested_at TEXT,
    run_id TEXT
);

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    job_id INTEGER REFERENCES jobs(id),
    name TEXT,
    config TEXT,
    tags TEXT,
    status TEXT DEFAULT 'running',
    started_at TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    finished_at TEXT,
    duration_seconds REAL,
    summary TEXT,
    git_hash TEXT,
    git_dirty INTEGER,
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
    started_at TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    last_heartbeat TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_heartbeat ON jobs(heartbeat_at);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
CREATE INDEX IF NOT EXISTS idx_runs_job_id ON runs(job_id);
";

pub struct SqliteStorage {
    conn: Mutex<Connection>,
    heartbeat_timeout: Duration,
}

fn utcnow_str() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let argv_json: String = row.get("command_argv")?;
    let tags_json: Option<String> = row.get("tags")?;
    let config_json: Option<String> = row.get("config")?;
    let status: String = row.get("status")?;

    Ok(Job {
        id: row.get("id")?,
        name: row.get("name")?,
        command_argv: serde_json::from_str(&argv_json).unwrap_or_default(),
        workdir: row.get("workdir")?,
        config: config_json.and_then(|s| serde_json::from_str::<Value>(&s).ok()),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Queued),
        tags: tags_json.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok()),
        attempt: row.get("attempt")?,
        parent_job_id: row.get("parent_job_id")?,
        created_at: parse_ts(row.get("created_at")?).unwrap_or_else(Utc::now),
        started_at: parse_ts(row.get("started_at")?),
        finished_at: parse_ts(row.get("finished_at")?),
        worker_id: row.get("worker_id")?,
        heartbeat_at: parse_ts(row.get("heartbeat_at")?),
        lease_expires_at: parse_ts(row.get("lease_expires_at")?),
        pid: row.get("pid")?,
        pgid: row.get("pgid")?,
        exit_code: row.get("exit_code")?,
        error_message: row.get("error_message")?,
        cancel_requested_at: parse_ts(row.get("cancel_requested_at")?),
        run_id: row.get("run_id")?,
    })
}

fn row_to_run(row: &Row) -> rusqlite::Result<Run> {
    let tags_json: Option<String> = row.get("tags")?;
    let config_json: Option<String> = row.get("config")?;
    let summary_json: Option<String> = row.get("summary")?;
    let status: String = row.get("status")?;
    let dirty: Option<i64> = row.get("git_dirty")?;

    Ok(Run {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        name: row.get("name")?,
        config: config_json.and_then(|s| serde_json::from_str::<Value>(&s).ok()),
        tags: tags_json.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok()),
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Running),
        started_at: parse_ts(row.get("started_at")?).unwrap_or_else(Utc::now),
        finished_at: parse_ts(row.get("finished_at")?),
        duration_seconds: row.get("duration_seconds")?,
        summary: summary_json.and_then(|s| serde_json::from_str::<Value>(&s).ok()),
        git_hash: row.get("git_hash")?,
        git_dirty: dirty.map(|d| d != 0),
        hostname: row.get("hostname")?,
        run_dir: row.get("run_dir")?,
    })
}

fn row_to_worker(row: &Row) -> rusqlite::Result<Worker> {
    let status: String = row.get("status")?;
    Ok(Worker {
        id: row.get("id")?,
        pid: row.get("pid")?,
        hostname: row.get("hostname")?,
        gpu_index: row.get("gpu_index")?,
        status: WorkerStatus::parse(&status).unwrap_or(WorkerStatus::Offline),
        current_job_id: row.get("current_job_id")?,
        started_at: parse_ts(row.get("started_at")?),
        last_heartbeat: parse_ts(row.get("last_heartbeat")?),
    })
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>, heartbeat_timeout_secs: u64) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| SchedulerError::Storage(format!("failed to open sqlite db: {e}")))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;",
        )?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            heartbeat_timeout: Duration::seconds(heartbeat_timeout_secs as i64),
        })
    }
}

#[async_trait]
impl super::Storage for SqliteStorage {
    async fn create_job(&self, job: NewJob) -> Result<i64> {
        super::validate_new_job(&job)?;
        let conn = self.conn.lock().await;
        let attempt: Option<i64> = if job.parent_job_id.is_none() { Some(1) } else { None };
        conn.execute(
            "INSERT INTO jobs (name, command_argv, workdir, config, tags, parent_job_id, attempt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.name,
                serde_json::to_string(&job.command_argv)?,
                job.workdir,
                job.config.map(|v| v.to_string()),
                job.tags.map(|t| serde_json::to_string(&t)).transpose()?,
                job.parent_job_id,
                attempt,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn claim_job(&self, worker_id: &str, _lease_seconds: i64) -> Result<Option<Job>> {
        let conn = self.conn.lock().await;
        conn.execute_batch("BEGIN IMMEDIATE")?;

        let now = utcnow_str();
        let result = conn.query_row(
            "UPDATE jobs
             SET status = 'running', worker_id = ?1, started_at = ?2, heartbeat_at = ?2
             WHERE id = (
                 SELECT id FROM jobs WHERE status = 'queued' ORDER BY created_at, id LIMIT 1
             )
             RETURNING *",
            params![worker_id, now],
            row_to_job,
        );

        match result {
            Ok(job) => {
                conn.execute_batch("COMMIT")?;
                Ok(Some(job))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                conn.execute_batch("COMMIT")?;
                Ok(None)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e.into())
            }
        }
    }

    async fn heartbeat(&self, job_id: i64, worker_id: &str, _lease_seconds: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let now = utcnow_str();
        let affected = conn.execute(
            "UPDATE jobs SET heartbeat_at = ?1 WHERE id = ?2 AND worker_id = ?3 AND status = 'running'",
            params![now, job_id, worker_id],
        )?;
        if affected == 0 {
            return Err(SchedulerError::OwnershipViolation {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        let cancel_requested: Option<String> = conn
            .query_row(
                "SELECT cancel_requested_at FROM jobs WHERE id = ?1",
                params![job_id],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        Ok(cancel_requested.is_some())
    }

    async fn update_job_process_info(&self, job_id: i64, pid: i32, pgid: i32) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE jobs SET pid = ?1, pgid = ?2 WHERE id = ?3",
            params![pid, pgid, job_id],
        )?;
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
        let conn = self.conn.lock().await;
        let owner: Option<String> = conn
            .query_row("SELECT worker_id FROM jobs WHERE id = ?1", params![job_id], |r| r.get(0))
            .optional()?
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
        let now = utcnow_str();
        conn.execute(
            "UPDATE jobs
             SET status = ?1, finished_at = ?2, exit_code = ?3, run_id = ?4,
                 error_message = ?5, pid = NULL, pgid = NULL
             WHERE id = ?6",
            params![status, now, exit_code, run_id, error_message, job_id],
        )?;
        Ok(())
    }

    async fn cancel_job(&self, job_id: i64) -> Result<String> {
        let conn = self.conn.lock().await;
        let old_status: Option<String> = conn
            .query_row("SELECT status FROM jobs WHERE id = ?1", params![job_id], |r| r.get(0))
            .optional()?;
        let Some(old_status) = old_status else {
            return Err(SchedulerError::JobNotFound(job_id));
        };

        let now = utcnow_str();
        match old_status.as_str() {
            "queued" => {
                conn.execute(
                    "UPDATE jobs SET status = 'cancelled', finished_at = ?1 WHERE id = ?2",
                    params![now, job_id],
                )?;
            }
            "running" => {
                conn.execute(
                    "UPDATE jobs SET cancel_requested_at = ?1 WHERE id = ?2",
                    params![now, job_id],
                )?;
            }
            _ => {}
        }
        Ok(old_status)
    }

    async fn retry_job(&self, job_id: i64) -> Result<i64> {
        let conn = self.conn.lock().await;
        let original = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![job_id], row_to_job)
            .optional()?;
        let Some(original) = original else {
            return Err(SchedulerError::JobNotFound(job_id));
        };
        if !matches!(original.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(SchedulerError::NotRetryable(original.status.as_str().to_string()));
        }

        conn.execute(
            "INSERT INTO jobs (name, command_argv, workdir, config, tags, parent_job_id, attempt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                original.name,
                serde_json::to_string(&original.command_argv)?,
                original.workdir,
                original.config.map(|v| v.to_string()),
                original.tags.map(|t| serde_json::to_string(&t)).transpose()?,
                job_id,
                original.attempt + 1,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![job_id], row_to_job)
            .optional()?)
    }

    async fn get_active_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE status IN ('queued', 'running') ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn get_jobs(&self, status: Option<&str>, limit: i64) -> Result<Vec<Job>> {
        let conn = self.conn.lock().await;
        let jobs = if let Some(status) = status {
            let mut stmt = conn.prepare(
                "SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![status, limit], row_to_job)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ?1")?;
            let rows = stmt.query_map(params![limit], row_to_job)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(jobs)
    }

    async fn get_job_by_run_id(&self, run_id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row("SELECT * FROM jobs WHERE run_id = ?1", params![run_id], row_to_job)
            .optional()?)
    }

    async fn cancel_all_queued(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let now = utcnow_str();
        let affected = conn.execute(
            "UPDATE jobs SET status = 'cancelled', finished_at = ?1 WHERE status = 'queued'",
            params![now],
        )?;
        Ok(affected as i64)
    }

    async fn requeue_expired(&self) -> Result<Vec<Job>> {
        let conn = self.conn.lock().await;
        let cutoff = (Utc::now() - self.heartbeat_timeout)
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE status = 'running' AND heartbeat_at IS NOT NULL AND heartbeat_at < ?1",
        )?;
        let rows = stmt.query_map(params![cutoff], row_to_job)?;
        let expired = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        for job in &expired {
            conn.execute(
                "UPDATE jobs
                 SET status = 'queued', worker_id = NULL, started_at = NULL, heartbeat_at = NULL,
                     cancel_requested_at = NULL, pid = NULL, pgid = NULL, attempt = attempt + 1
                 WHERE id = ?1",
                params![job.id],
            )?;
        }
        Ok(expired)
    }

    async fn create_run(&self, run: NewRun) -> Result<()> {
        let conn = self.conn.lock().await;
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        conn.execute(
            "INSERT INTO runs (id, job_id, name, config, tags, run_dir, hostname)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.id,
                run.job_id,
                run.name,
                run.config.map(|v| v.to_string()),
                run.tags.map(|t| serde_json::to_string(&t)).transpose()?,
                run.run_dir,
                hostname,
            ],
        )?;
        Ok(())
    }

    async fn complete_run(&self, run_id: &str, status: &str, summary: Option<Value>) -> Result<()> {
        let conn = self.conn.lock().await;
        let started_at: Option<String> = conn
            .query_row("SELECT started_at FROM runs WHERE id = ?1", params![run_id], |r| r.get(0))
            .optional()?
            .flatten();

        let now = Utc::now();
        let duration = started_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|started| (now - started.with_timezone(&Utc)).num_milliseconds() as f64 / 1000.0);

        conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, duration_seconds = ?3, summary = ?4 WHERE id = ?5",
            params![
                status,
                now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                duration,
                summary.map(|v| v.to_string()),
                run_id,
            ],
        )?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row("SELECT * FROM runs WHERE id = ?1", params![run_id], row_to_run)
            .optional()?)
    }

    async fn get_runs(&self, status: Option<&str>, tag: Option<&str>, limit: i64) -> Result<Vec<Run>> {
        let conn = self.conn.lock().await;
        let mut query = String::from("SELECT * FROM runs WHERE 1=1");
        if status.is_some() {
            query.push_str(" AND status = ?1");
        }
        if tag.is_some() {
            query.push_str(if status.is_some() { " AND tags LIKE ?2" } else { " AND tags LIKE ?1" });
        }
        query.push_str(" ORDER BY started_at DESC LIMIT ?");
        query = query.replacen("LIMIT ?", &format!("LIMIT {limit}"), 1);

        let mut stmt = conn.prepare(&query)?;
        let tag_pattern = tag.map(|t| format!("%\"{t}\"%"));
        let rows = match (status, &tag_pattern) {
            (Some(s), Some(t)) => stmt.query_map(params![s, t], row_to_run)?.collect::<rusqlite::Result<Vec<_>>>()?,
            (Some(s), None) => stmt.query_map(params![s], row_to_run)?.collect::<rusqlite::Result<Vec<_>>>()?,
            (None, Some(t)) => stmt.query_map(params![t], row_to_run)?.collect::<rusqlite::Result<Vec<_>>>()?,
            (None, None) => stmt.query_map([], row_to_run)?.collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    async fn register_worker(
        &self,
        worker_id: &str,
        pid: i32,
        hostname: &str,
        gpu_index: Option<i32>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = utcnow_str();
        conn.execute(
            "INSERT INTO workers (id, pid, hostname, gpu_index, status, started_at, last_heartbeat)
             VALUES (?1, ?2, ?3, ?4, 'idle', ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
                pid = excluded.pid, status = 'idle', started_at = excluded.started_at,
                last_heartbeat = excluded.last_heartbeat",
            params![worker_id, pid, hostname, gpu_index, now],
        )?;
        Ok(())
    }

    async fn update_worker_status(
        &self,
        worker_id: &str,
        status: &str,
        current_job_id: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = utcnow_str();
        conn.execute(
            "UPDATE workers SET status = ?1, current_job_id = ?2, last_heartbeat = ?3 WHERE id = ?4",
            params![status, current_job_id, now, worker_id],
        )?;
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE workers SET status = 'offline', current_job_id = NULL WHERE id = ?1",
            params![worker_id],
        )?;
        Ok(())
    }

    async fn get_workers(&self) -> Result<Vec<Worker>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM workers ORDER BY id")?;
        let rows = stmt.query_map([], row_to_worker)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn mk_job() -> NewJob {
        NewJob {
            command_argv: vec!["echo".into(), "hello".into()],
            workdir: "/tmp".into(),
            name: Some("demo".into()),
            config: None,
            tags: None,
            parent_job_id: None,
        }
    }

    #[tokio::test]
    async fn claim_is_fifo_and_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStorage::open(dir.path().join("whirr.db"), 120).unwrap();

        let j1 = store.create_job(mk_job()).await.unwrap();
        let j2 = store.create_job(mk_job()).await.unwrap();

        let claimed1 = store.claim_job("w1", 60).await.unwrap().unwrap();
        assert_eq!(claimed1.id, j1);
        let claimed2 = store.claim_job("w1", 60).await.unwrap().unwrap();
        assert_eq!(claimed2.id, j2);
        assert!(store.claim_job("w1", 60).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn heartbeat_reports_cancel_and_rejects_wrong_owner() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStorage::open(dir.path().join("whirr.db"), 120).unwrap();
        let id = store.create_job(mk_job()).await.unwrap();
        store.claim_job("w1", 60).await.unwrap();

        assert!(store.heartbeat(id, "w1", 60).await.unwrap() == false);
        store.cancel_job(id).await.unwrap();
        assert!(store.heartbeat(id, "w1", 60).await.unwrap());

        assert!(store.heartbeat(id, "someone-else", 60).await.is_err());
    }

    #[tokio::test]
    async fn retry_job_creates_new_row_with_incremented_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStorage::open(dir.path().join("whirr.db"), 120).unwrap();
        let id = store.create_job(mk_job()).await.unwrap();
        store.claim_job("w1", 60).await.unwrap();
        store.complete_job(id, "w1", 1, None, None).await.unwrap();

        let retried_id = store.retry_job(id).await.unwrap();
        assert_ne!(retried_id, id);
        let retried = store.get_job(retried_id).await.unwrap().unwrap();
        assert_eq!(retried.parent_job_id, Some(id));
        assert_eq!(retried.attempt, 2);
        assert_eq!(retried.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn requeue_expired_increments_attempt_and_clears_owner() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStorage::open(dir.path().join("whirr.db"), 0).unwrap();
        let id = store.create_job(mk_job()).await.unwrap();
        store.claim_job("w1", 60).await.unwrap();

        let expired = store.requeue_expired().await.unwrap();
        assert_eq!(expired.len(), 1);
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 2);
        assert!(job.worker_id.is_none());
    }
}
