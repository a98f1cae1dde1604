// src/recorder.rs
//
// =============================================================================
// WHIRR: RUN RECORDER
// =============================================================================
//
// Owns exactly the filesystem side of a run (`config.json`, `metrics.jsonl`,
// `meta.json`, `output.log`, `artifacts/`, optional `git.json`/
// `requirements.txt`) — registering the run's row in storage is the
// caller's job (the worker loop or a direct-mode library user), keeping
// this usable standalone without a database.
//
// `log`/`summary`/`save_artifact` are forbidden after `finish`; `finish` is
// idempotent. `read_metrics` tolerates a truncated trailing line so a run
// killed mid-write doesn't poison every later read of its metrics.

use crate::environment::{capture_git_info, capture_pip_freeze, GitInfo};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub id: String,
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: String,
    pub summary: Option<Value>,
    pub config_file: String,
    pub metrics_file: String,
    pub artifacts_dir: String,
    pub git: Option<GitInfo>,
    pub git_file: Option<String>,
    pub requirements_file: Option<String>,
    pub pip_packages_count: Option<usize>,
}

/// Generate a direct-mode run id: `local-<UTC-timestamp>-<6char-random>`.
/// Randomness is drawn from a `Uuid::new_v4`'s bytes rather than pulling in
/// a `rand` dependency.
pub fn generate_direct_run_id(now: DateTime<Utc>) -> String {
    let stamp = now.format("%Y%m%dT%H%M%S");
    let uuid = Uuid::new_v4();
    let suffix: String = uuid
        .simple()
        .to_string()
        .chars()
        .take(6)
        .collect();
    format!("local-{stamp}-{suffix}")
}

/// An open run directory: the writer-side handle returned by `open`.
pub struct RunHandle {
    run_dir: PathBuf,
    metrics_file: Mutex<File>,
    idx: AtomicU64,
    finished: AtomicBool,
    meta: Mutex<RunMeta>,
}

impl RunHandle {
    /// Create the run directory layout and write the initial side-car
    /// files. `config`/`tags`/`name` are snapshotted once at open.
    pub async fn open(
        run_dir: &Path,
        run_id: &str,
        name: Option<String>,
        tags: Vec<String>,
        config: Option<&Value>,
    ) -> Result<Self> {
        fs::create_dir_all(run_dir)
            .with_context(|| format!("failed to create run dir {}", run_dir.display()))?;
        fs::create_dir_all(run_dir.join("artifacts"))?;

        if let Some(config) = config {
            fs::write(run_dir.join("config.json"), serde_json::to_vec_pretty(config)?)?;
        }

        let git = capture_git_info().await;
        let git_file = if let Some(git) = &git {
            fs::write(run_dir.join("git.json"), serde_json::to_vec_pretty(git)?)?;
            Some("git.json".to_string())
        } else {
            None
        };

        let (requirements_file, pip_packages_count) = match capture_pip_freeze().await {
            Some(text) => {
                fs::write(run_dir.join("requirements.txt"), &text)?;
                let count = text.lines().filter(|l| !l.trim().is_empty()).count();
                (Some("requirements.txt".to_string()), Some(count))
            }
            None => (None, None),
        };

        let metrics_path = run_dir.join("metrics.jsonl");
        let metrics_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&metrics_path)?;

        let meta = RunMeta {
            id: run_id.to_string(),
            name,
            tags,
            started_at: Utc::now(),
            finished_at: None,
            status: "running".to_string(),
            summary: None,
            config_file: "config.json".to_string(),
            metrics_file: "metrics.jsonl".to_string(),
            artifacts_dir: "artifacts".to_string(),
            git,
            git_file,
            requirements_file,
            pip_packages_count,
        };

        let handle = Self {
            run_dir: run_dir.to_path_buf(),
            metrics_file: Mutex::new(metrics_file),
            idx: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            meta: Mutex::new(meta),
        };
        handle.write_meta()?;
        Ok(handle)
    }

    fn write_meta(&self) -> Result<()> {
        let meta = self.meta.lock().unwrap();
        let tmp = self.run_dir.join("meta.json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&*meta)?)?;
        fs::rename(&tmp, self.run_dir.join("meta.json"))?;
        Ok(())
    }

    /// Append one record to `metrics.jsonl`. `_idx` and `_timestamp` are
    /// reserved and always set by the recorder; any caller-supplied values
    /// for those keys are overwritten. `step`, if given, is merged in before
    /// `fields` so a caller-supplied `step` key in `fields` still wins.
    pub fn log(&self, step: Option<i64>, fields: Map<String, Value>) -> Result<()> {
        if self.finished.load(Ordering::SeqCst) {
            bail!("cannot log metrics on a finished run");
        }

        let mut record = Map::new();
        if let Some(step) = step {
            record.insert("step".to_string(), Value::from(step));
        }
        for (k, v) in fields {
            record.insert(k, v);
        }
        let idx = self.idx.fetch_add(1, Ordering::SeqCst);
        record.insert("_idx".to_string(), Value::from(idx));
        record.insert(
            "_timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        );

        let mut line = serde_json::to_string(&Value::Object(record))?;
        line.push('\n');
        let mut file = self.metrics_file.lock().unwrap();
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Replace the run's summary mapping and rewrite `meta.json`.
    pub fn summary(&self, fields: Map<String, Value>) -> Result<()> {
        if self.finished.load(Ordering::SeqCst) {
            bail!("cannot set summary on a finished run");
        }
        {
            let mut meta = self.meta.lock().unwrap();
            meta.summary = Some(Value::Object(fields));
        }
        self.write_meta()
    }

    /// Copy `source` into `artifacts/`, preserving mtime (`std::fs::copy`
    /// preserves permissions but not timestamps, so `filetime`-equivalent
    /// behavior is reproduced via `set_modified` from the source metadata).
    pub fn save_artifact(&self, source: &Path, dest_name: Option<&str>) -> Result<()> {
        if self.finished.load(Ordering::SeqCst) {
            bail!("cannot save an artifact on a finished run");
        }
        anyhow::ensure!(source.exists(), "artifact source {} does not exist", source.display());

        let name = dest_name
            .map(str::to_string)
            .or_else(|| source.file_name().map(|n| n.to_string_lossy().to_string()))
            .context("could not determine artifact destination name")?;
        let dest = self.run_dir.join("artifacts").join(name);
        fs::copy(source, &dest)?;

        if let Ok(src_meta) = fs::metadata(source) {
            if let Ok(mtime) = src_meta.modified() {
                let _ = File::open(&dest).and_then(|f| f.set_modified(mtime));
            }
        }
        Ok(())
    }

    /// Finalize the run: idempotent. `status` is `"completed"` or `"failed"`.
    pub fn finish(&self, status: &str) -> Result<()> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut meta = self.meta.lock().unwrap();
            meta.finished_at = Some(Utc::now());
            meta.status = status.to_string();
        }
        self.write_meta()
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn summary_snapshot(&self) -> Option<Value> {
        self.meta.lock().unwrap().summary.clone()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.meta.lock().unwrap().started_at
    }
}

/// Read `metrics.jsonl`, tolerating a single truncated trailing line (a
/// worker crash mid-write must not break later analysis).
pub fn read_metrics(path: &Path) -> Result<Vec<Value>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(v) => records.push(v),
            Err(_) => break,
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn log_assigns_monotonic_idx_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("job-1");
        let run = RunHandle::open(&run_dir, "job-1", None, vec![], None).await.unwrap();

        for i in 0..5 {
            let mut fields = Map::new();
            fields.insert("loss".to_string(), json!(1.0 / (i as f64 + 1.0)));
            run.log(None, fields).unwrap();
        }

        let records = read_metrics(&run_dir.join("metrics.jsonl")).unwrap();
        assert_eq!(records.len(), 5);
        for (i, rec) in records.iter().enumerate() {
            assert_eq!(rec["_idx"], json!(i as u64));
            assert!(rec["_timestamp"].is_string());
        }
    }

    #[tokio::test]
    async fn log_is_forbidden_after_finish() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("job-1");
        let run = RunHandle::open(&run_dir, "job-1", None, vec![], None).await.unwrap();
        run.finish("completed").unwrap();
        assert!(run.log(None, Map::new()).is_err());
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("job-1");
        let run = RunHandle::open(&run_dir, "job-1", None, vec![], None).await.unwrap();
        run.finish("completed").unwrap();
        run.finish("failed").unwrap();
        let meta: RunMeta =
            serde_json::from_slice(&fs::read(run_dir.join("meta.json")).unwrap()).unwrap();
        assert_eq!(meta.status, "completed");
    }

    #[test]
    fn read_metrics_skips_truncated_trailing_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        fs::write(&path, "{\"_idx\":0,\"_timestamp\":\"x\",\"a\":1}\n{\"_idx\":1,\"_time").unwrap();
        let records = read_metrics(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["a"], json!(1));
    }
}
