// src/api/handlers.rs
//
// Request/response DTOs and route handlers for the job/run/worker HTTP
// surface. `State` carries the shared storage handle and data directory
// into every handler; `Json<T>`/`Path<T>`/`Query<T>` extract the
// request body, path params, and query params respectively.

use super::AppState;
use crate::error::SchedulerError;
use crate::model::{Job, JobStatus, Run, Worker};
use crate::storage::NewJob;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

// -----------------------------------------------------------------------------
// Error mapping
// -----------------------------------------------------------------------------

pub struct ApiError(SchedulerError);

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SchedulerError::JobNotFound(_)
            | SchedulerError::RunNotFound(_)
            | SchedulerError::WorkerNotFound(_) => StatusCode::NOT_FOUND,
            SchedulerError::OwnershipViolation { .. } => StatusCode::FORBIDDEN,
            SchedulerError::PathTraversal => StatusCode::FORBIDDEN,
            SchedulerError::Validation(_) | SchedulerError::NotRetryable(_) => {
                StatusCode::BAD_REQUEST
            }
            SchedulerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(MessageResponse { message: self.0.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// -----------------------------------------------------------------------------
// Shared DTOs
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: i64,
    pub name: Option<String>,
    pub command_argv: Vec<String>,
    pub workdir: String,
    pub config: Option<Value>,
    pub tags: Option<Vec<String>>,
    pub status: JobStatus,
    pub attempt: i64,
    pub worker_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub exit_code: Option<i32>,
    pub run_id: Option<String>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            name: job.name,
            command_argv: job.command_argv,
            workdir: job.workdir,
            config: job.config,
            tags: job.tags,
            status: job.status,
            attempt: job.attempt,
            worker_id: job.worker_id,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            exit_code: job.exit_code,
            run_id: job.run_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub id: String,
    pub job_id: Option<i64>,
    pub name: Option<String>,
    pub config: Option<Value>,
    pub tags: Option<Vec<String>>,
    pub status: crate::model::RunStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_seconds: Option<f64>,
    pub summary: Option<Value>,
    pub hostname: Option<String>,
    pub run_dir: Option<String>,
}

impl From<Run> for RunResponse {
    fn from(run: Run) -> Self {
        Self {
            id: run.id,
            job_id: run.job_id,
            name: run.name,
            config: run.config,
            tags: run.tags,
            status: run.status,
            started_at: run.started_at,
            finished_at: run.finished_at,
            duration_seconds: run.duration_seconds,
            summary: run.summary,
            hostname: run.hostname,
            run_dir: run.run_dir,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WorkerResponse {
    pub id: String,
    pub hostname: Option<String>,
    pub gpu_index: Option<i32>,
    pub status: crate::model::WorkerStatus,
    pub current_job_id: Option<i64>,
    pub last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<Worker> for WorkerResponse {
    fn from(w: Worker) -> Self {
        Self {
            id: w.id,
            hostname: w.hostname,
            gpu_index: w.gpu_index,
            status: w.status,
            current_job_id: w.current_job_id,
            last_heartbeat: w.last_heartbeat,
        }
    }
}

// -----------------------------------------------------------------------------
// Worker endpoints
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub hostname: String,
    #[serde(default)]
    pub gpu_ids: Vec<i32>,
}

pub async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegistration>,
) -> ApiResult<Json<MessageResponse>> {
    if req.gpu_ids.is_empty() {
        state
            .storage
            .register_worker(&req.worker_id, 0, &req.hostname, None)
            .await?;
    } else {
        for gpu_id in &req.gpu_ids {
            let worker_id = format!("{}-gpu{gpu_id}", req.worker_id);
            state
                .storage
                .register_worker(&worker_id, 0, &req.hostname, Some(*gpu_id))
                .await?;
        }
    }
    Ok(Json(MessageResponse {
        message: format!("Worker {} registered", req.worker_id),
    }))
}

#[derive(Debug, Deserialize)]
pub struct WorkerUnregister {
    pub worker_id: String,
}

pub async fn unregister_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerUnregister>,
) -> ApiResult<Json<MessageResponse>> {
    state.storage.unregister_worker(&req.worker_id).await?;
    Ok(Json(MessageResponse {
        message: format!("Worker {} unregistered", req.worker_id),
    }))
}

#[derive(Debug, Serialize)]
pub struct WorkerListResponse {
    pub workers: Vec<WorkerResponse>,
}

pub async fn list_workers(State(state): State<AppState>) -> ApiResult<Json<WorkerListResponse>> {
    let workers = state.storage.get_workers().await?;
    Ok(Json(WorkerListResponse {
        workers: workers.into_iter().map(Into::into).collect(),
    }))
}

// -----------------------------------------------------------------------------
// Job endpoints
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct JobCreateRequest {
    pub command_argv: Vec<String>,
    pub workdir: String,
    pub name: Option<String>,
    pub config: Option<Value>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct JobCreateResponse {
    pub job_id: i64,
    pub run_id: String,
    pub run_dir: String,
    pub message: String,
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<JobCreateRequest>,
) -> ApiResult<Json<JobCreateResponse>> {
    crate::storage::validate_new_job(&NewJob {
        command_argv: req.command_argv.clone(),
        workdir: req.workdir.clone(),
        name: req.name.clone(),
        config: req.config.clone(),
        tags: req.tags.clone(),
        parent_job_id: None,
    })?;

    let job_id = state
        .storage
        .create_job(NewJob {
            command_argv: req.command_argv,
            workdir: req.workdir,
            name: req.name,
            config: req.config,
            tags: req.tags,
            parent_job_id: None,
        })
        .await?;

    let run_id = format!("job-{job_id}");
    let run_dir = state.data_dir.join("runs").join(&run_id);
    Ok(Json(JobCreateResponse {
        job_id,
        run_id: run_id.clone(),
        run_dir: run_dir.to_string_lossy().to_string(),
        message: format!("Job {job_id} created"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct JobClaimRequest {
    pub worker_id: String,
    pub lease_seconds: i64,
}

#[derive(Debug, Serialize)]
pub struct JobClaimResponse {
    pub job: Option<JobResponse>,
}

pub async fn claim_job(
    State(state): State<AppState>,
    Json(req): Json<JobClaimRequest>,
) -> ApiResult<Json<JobClaimResponse>> {
    crate::storage::validate_lease_seconds(req.lease_seconds)?;
    let job = state.storage.claim_job(&req.worker_id, req.lease_seconds).await?;
    Ok(Json(JobClaimResponse { job: job.map(Into::into) }))
}

pub async fn get_job(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<i64>,
) -> ApiResult<Json<JobResponse>> {
    let job = state
        .storage
        .get_job(job_id)
        .await?
        .ok_or(SchedulerError::JobNotFound(job_id))?;
    Ok(Json(job.into()))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(q): Query<ListJobsQuery>,
) -> ApiResult<Json<JobListResponse>> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500) as usize;
    let mut jobs = state.storage.get_active_jobs().await?;
    if let Some(status) = &q.status {
        jobs.retain(|j| j.status.as_str() == status);
    }
    jobs.truncate(limit);
    Ok(Json(JobListResponse {
        jobs: jobs.into_iter().map(Into::into).collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct JobHeartbeatRequest {
    pub worker_id: String,
    pub lease_seconds: i64,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    pub cancel_requested: bool,
}

pub async fn job_heartbeat(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<i64>,
    Json(req): Json<JobHeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let cancel_requested = state
        .storage
        .heartbeat(job_id, &req.worker_id, req.lease_seconds)
        .await?;
    Ok(Json(HeartbeatResponse {
        success: true,
        cancel_requested,
    }))
}

#[derive(Debug, Deserialize)]
pub struct JobCompleteRequest {
    pub worker_id: String,
    pub exit_code: i32,
    pub run_id: Option<String>,
    pub error_message: Option<String>,
}

pub async fn complete_job(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<i64>,
    Json(req): Json<JobCompleteRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let job = state
        .storage
        .get_job(job_id)
        .await?
        .ok_or(SchedulerError::JobNotFound(job_id))?;
    if job.worker_id.as_deref() != Some(req.worker_id.as_str()) {
        return Err(SchedulerError::OwnershipViolation {
            job_id,
            worker_id: req.worker_id,
        }
        .into());
    }

    state
        .storage
        .complete_job(
            job_id,
            &req.worker_id,
            req.exit_code,
            req.run_id.as_deref(),
            req.error_message.as_deref(),
        )
        .await?;

    let status = if req.exit_code == 0 { "completed" } else { "failed" };
    Ok(Json(MessageResponse {
        message: format!("Job {job_id} marked as {status}"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct JobFailRequest {
    pub worker_id: String,
    pub error_message: Option<String>,
}

pub async fn fail_job(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<i64>,
    Json(req): Json<JobFailRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let job = state
        .storage
        .get_job(job_id)
        .await?
        .ok_or(SchedulerError::JobNotFound(job_id))?;
    if job.worker_id.as_deref() != Some(req.worker_id.as_str()) {
        return Err(SchedulerError::OwnershipViolation {
            job_id,
            worker_id: req.worker_id,
        }
        .into());
    }

    state
        .storage
        .complete_job(job_id, &req.worker_id, 1, None, req.error_message.as_deref())
        .await?;

    Ok(Json(MessageResponse {
        message: format!("Job {job_id} marked as failed"),
    }))
}

#[derive(Debug, Serialize)]
pub struct JobCancelResponse {
    pub message: String,
    pub previous_status: String,
}

pub async fn cancel_job(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<i64>,
) -> ApiResult<Json<JobCancelResponse>> {
    let previous_status = state.storage.cancel_job(job_id).await?;
    Ok(Json(JobCancelResponse {
        message: format!("Job {job_id} cancelled"),
        previous_status,
    }))
}

// -----------------------------------------------------------------------------
// Run endpoints
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub status: Option<String>,
    pub tag: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RunListResponse {
    pub runs: Vec<RunResponse>,
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(q): Query<ListRunsQuery>,
) -> ApiResult<Json<RunListResponse>> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let runs = state
        .storage
        .get_runs(q.status.as_deref(), q.tag.as_deref(), limit)
        .await?;
    Ok(Json(RunListResponse {
        runs: runs.into_iter().map(Into::into).collect(),
    }))
}

pub async fn get_run(
    State(state): State<AppState>,
    AxumPath(run_id): AxumPath<String>,
) -> ApiResult<Json<RunResponse>> {
    let run = state
        .storage
        .get_run(&run_id)
        .await?
        .ok_or_else(|| SchedulerError::RunNotFound(run_id.clone()))?;
    Ok(Json(run.into()))
}

#[derive(Debug, Serialize)]
pub struct RunMetricsResponse {
    pub metrics: Vec<Value>,
    pub count: usize,
}

fn run_directory(state: &AppState, run: &Run, run_id: &str) -> PathBuf {
    run.run_dir
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| state.data_dir.join("runs").join(run_id))
}

pub async fn get_run_metrics(
    State(state): State<AppState>,
    AxumPath(run_id): AxumPath<String>,
) -> ApiResult<Json<RunMetricsResponse>> {
    let run = state
        .storage
        .get_run(&run_id)
        .await?
        .ok_or_else(|| SchedulerError::RunNotFound(run_id.clone()))?;

    let metrics_path = run_directory(&state, &run, &run_id).join("metrics.jsonl");
    if !metrics_path.exists() {
        return Ok(Json(RunMetricsResponse { metrics: vec![], count: 0 }));
    }

    let metrics = crate::recorder::read_metrics(&metrics_path)
        .map_err(|e| SchedulerError::Storage(format!("error reading metrics file: {e}")))?;
    Ok(Json(RunMetricsResponse {
        count: metrics.len(),
        metrics,
    }))
}

#[derive(Debug, Serialize)]
pub struct ArtifactRecord {
    pub path: String,
    pub size: u64,
    pub modified: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct RunArtifactsResponse {
    pub artifacts: Vec<ArtifactRecord>,
    pub count: usize,
}

pub async fn list_run_artifacts(
    State(state): State<AppState>,
    AxumPath(run_id): AxumPath<String>,
) -> ApiResult<Json<RunArtifactsResponse>> {
    let run = state
        .storage
        .get_run(&run_id)
        .await?
        .ok_or_else(|| SchedulerError::RunNotFound(run_id.clone()))?;

    let run_path = run_directory(&state, &run, &run_id);
    if !run_path.exists() {
        return Ok(Json(RunArtifactsResponse { artifacts: vec![], count: 0 }));
    }

    let mut artifacts = Vec::new();
    for entry in walkdir(&run_path) {
        let rel = entry
            .strip_prefix(&run_path)
            .unwrap_or(&entry)
            .to_string_lossy()
            .to_string();
        let meta = std::fs::metadata(&entry)
            .map_err(|e| SchedulerError::Storage(format!("error listing artifacts: {e}")))?;
        let modified: chrono::DateTime<chrono::Utc> = meta
            .modified()
            .map(chrono::DateTime::<chrono::Utc>::from)
            .unwrap_or_else(|_| chrono::Utc::now());
        artifacts.push(ArtifactRecord {
            path: rel,
            size: meta.len(),
            modified,
        });
    }
    artifacts.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(Json(RunArtifactsResponse {
        count: artifacts.len(),
        artifacts,
    }))
}

fn walkdir(root: &std::path::Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}

pub async fn get_run_artifact(
    State(state): State<AppState>,
    AxumPath((run_id, artifact_path)): AxumPath<(String, String)>,
) -> ApiResult<Response> {
    let run = state
        .storage
        .get_run(&run_id)
        .await?
        .ok_or_else(|| SchedulerError::RunNotFound(run_id.clone()))?;

    let run_path = run_directory(&state, &run, &run_id);
    let run_path_canon = run_path
        .canonicalize()
        .map_err(|e| SchedulerError::Storage(format!("run directory missing: {e}")))?;

    let candidate = run_path.join(&artifact_path);
    let file_path = candidate
        .canonicalize()
        .map_err(|_| SchedulerError::PathTraversal)?;
    if !file_path.starts_with(&run_path_canon) {
        return Err(SchedulerError::PathTraversal.into());
    }

    if !file_path.is_file() {
        return Err(SchedulerError::Storage(format!("artifact not found: {artifact_path}")).into());
    }

    let content = std::fs::read(&file_path)
        .map_err(|e| SchedulerError::Storage(format!("error reading artifact: {e}")))?;
    let content_type = mime_guess_simple(&file_path);
    let filename = file_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        content,
    )
        .into_response())
}

fn mime_guess_simple(path: &std::path::Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("jsonl") => "application/x-ndjson",
        Some("txt") | Some("log") => "text/plain",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("csv") => "text/csv",
        _ => "application/octet-stream",
    }
    .to_string()
}

// -----------------------------------------------------------------------------
// Status endpoints
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub workers_online: usize,
    pub workers_total: usize,
}

pub async fn get_status(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let active_jobs = state.storage.get_active_jobs().await?;
    let workers = state.storage.get_workers().await?;

    let queued = active_jobs.iter().filter(|j| j.status == JobStatus::Queued).count();
    let running = active_jobs.iter().filter(|j| j.status == JobStatus::Running).count();

    let recent_runs = state.storage.get_runs(None, None, 100).await?;
    let completed = recent_runs
        .iter()
        .filter(|r| r.status == crate::model::RunStatus::Completed)
        .count();
    let failed = recent_runs
        .iter()
        .filter(|r| r.status == crate::model::RunStatus::Failed)
        .count();

    let workers_online = workers
        .iter()
        .filter(|w| matches!(w.status, crate::model::WorkerStatus::Idle | crate::model::WorkerStatus::Busy))
        .count();

    Ok(Json(StatusResponse {
        queued,
        running,
        completed,
        failed,
        workers_online,
        workers_total: workers.len(),
    }))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}
