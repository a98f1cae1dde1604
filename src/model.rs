// src/model.rs
//
// =============================================================================
// WHIRR: DOMAIN MODEL
// =============================================================================
//
// Job / Run / Worker — the three primary entities of the scheduler, plus the
// ablation session types owned by the ablation driver. `config` and
// `summary` stay as opaque JSON, validated only by their producers and
// consumers (the ablation driver, user code).

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

/// A queued unit of work. `attempt` is a total-attempts counter: both
/// `retry_job` and `requeue_expired` increment it, so a job requeued after a
/// worker death and then manually retried reflects total attempts, not
/// distinct retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: Option<String>,
    pub command_argv: Vec<String>,
    pub workdir: String,
    pub config: Option<Value>,
    pub status: JobStatus,
    pub tags: Option<Vec<String>>,
    pub attempt: i64,
    pub parent_job_id: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub worker_id: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub pid: Option<i32>,
    pub pgid: Option<i32>,

    pub exit_code: Option<i32>,
    pub error_message: Option<String>,

    pub cancel_requested_at: Option<DateTime<Utc>>,

    pub run_id: Option<String>,
}

impl Job {
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.worker_id.as_deref() == Some(worker_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// The scientific record of one execution. Identity is `job-<id>` for
/// worker-executed jobs, `local-<timestamp>-<6char>` for direct runs opened
/// outside of a worker (see `recorder::Run`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub job_id: Option<i64>,
    pub name: Option<String>,
    pub config: Option<Value>,
    pub tags: Option<Vec<String>>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub summary: Option<Value>,
    pub git_hash: Option<String>,
    pub git_dirty: Option<bool>,
    pub hostname: Option<String>,
    pub run_dir: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(WorkerStatus::Idle),
            "busy" => Some(WorkerStatus::Busy),
            "offline" => Some(WorkerStatus::Offline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub pid: Option<i32>,
    pub hostname: Option<String>,
    pub gpu_index: Option<i32>,
    pub status: WorkerStatus,
    pub current_job_id: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

// -----------------------------------------------------------------------------
// Ablation session
// -----------------------------------------------------------------------------

/// A config value that may be an inlined file's contents rather than a plain
/// JSON scalar: any delta value shaped `{"path": ..., "text": ...}` is
/// treated as a file reference and resolves to `text` when materializing a
/// config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    File(FileValue),
    Scalar(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileValue {
    pub path: String,
    pub text: String,
}

impl ConfigValue {
    pub fn resolve(&self) -> Value {
        match self {
            ConfigValue::File(f) => Value::String(f.text.clone()),
            ConfigValue::Scalar(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AblationRunStatus {
    Queued,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AblationRunResult {
    pub run_id: String,
    pub job_id: i64,
    pub condition: String,
    pub replicate: u32,
    pub seed: i64,
    pub metric_value: Option<f64>,
    pub status: AblationRunStatus,
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AblationSession {
    pub session_id: String,
    pub name: String,
    pub metric: String,
    pub seed_base: i64,
    pub baseline: IndexMap<String, ConfigValue>,
    /// Insertion order matters: delta names default to the first key typed
    /// on the command line, and ranking ties break by insertion order.
    pub deltas: IndexMap<String, IndexMap<String, ConfigValue>>,
    pub replicates: u32,
    pub runs: Vec<AblationRunResult>,
    pub created_at: DateTime<Utc>,
}

impl AblationSession {
    pub fn condition_names(&self) -> Vec<String> {
        let mut names = vec!["baseline".to_string()];
        names.extend(self.deltas.keys().cloned());
        names
    }

    pub fn seed_for(&self, replicate: u32) -> i64 {
        self.seed_base + replicate as i64
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AblationIndex {
    pub entries: BTreeMap<String, String>,
}
