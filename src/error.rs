// src/error.rs
//
// =============================================================================
// WHIRR: SCHEDULER ERROR TYPES
// =============================================================================
//
// Typed failure modes for the scheduler core. Everything above the
// scheduler (worker loop, API handlers, CLI) deals in `anyhow::Result` and
// downcasts to this enum only where it needs to branch on the failure kind
// (e.g. the API layer mapping `NotFound` to 404, `Ownership` to 403).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("run {0} not found")]
    RunNotFound(String),

    #[error("worker {0} not found")]
    WorkerNotFound(String),

    #[error("job {job_id} is not owned by worker {worker_id}")]
    OwnershipViolation { job_id: i64, worker_id: String },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("only failed or cancelled jobs can be retried, got {0}")]
    NotRetryable(String),

    #[error("path escapes run directory")]
    PathTraversal,

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        SchedulerError::Storage(e.to_string())
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(e: sqlx::Error) -> Self {
        SchedulerError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::Storage(e.to_string())
    }
}
