// src/ablation.rs
//
// =============================================================================
// WHIRR: ABLATION DRIVER
// =============================================================================
//
// Session CRUD and index, delta parsing, paired-seed expansion and
// submission, and effect ranking for ablation runs.
// Sessions are small JSON documents under `<whirr_dir>/ablations/`, kept
// deliberately separate from the job/run tables in storage — an ablation
// session is a *plan*, the jobs/runs it spawns are the scheduler's own
// rows, tied back together only by `AblationRunResult::run_id`/`job_id`.

use crate::config;
use crate::model::{
    AblationIndex, AblationRunResult, AblationRunStatus, AblationSession, ConfigValue, FileValue,
};
use crate::recorder::read_metrics;
use crate::storage::{NewJob, Storage};
use anyhow::{anyhow, bail, Context, Result};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------------

fn session_path(whirr_dir: &Path, session_id: &str) -> PathBuf {
    config::ablations_dir(whirr_dir).join(format!("{session_id}.json"))
}

fn index_path(whirr_dir: &Path) -> PathBuf {
    config::ablations_dir(whirr_dir).join("index.json")
}

pub fn load_index(whirr_dir: &Path) -> Result<AblationIndex> {
    let path = index_path(whirr_dir);
    if !path.exists() {
        return Ok(AblationIndex::default());
    }
    let text = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&text)?)
}

fn save_index(whirr_dir: &Path, index: &AblationIndex) -> Result<()> {
    let path = index_path(whirr_dir);
    std::fs::create_dir_all(path.parent().unwrap())?;
    std::fs::write(&path, serde_json::to_vec_pretty(index)?)?;
    Ok(())
}

pub fn session_exists(whirr_dir: &Path, name: &str) -> Result<bool> {
    Ok(load_index(whirr_dir)?.entries.contains_key(name))
}

pub fn load_session_by_name(whirr_dir: &Path, name: &str) -> Result<AblationSession> {
    let index = load_index(whirr_dir)?;
    let session_id = index
        .entries
        .get(name)
        .ok_or_else(|| anyhow!("Ablation session '{name}' not found"))?;
    let text = std::fs::read_to_string(session_path(whirr_dir, session_id))?;
    Ok(serde_json::from_str(&text)?)
}

pub fn save_session(whirr_dir: &Path, session: &AblationSession) -> Result<()> {
    let path = session_path(whirr_dir, &session.session_id);
    std::fs::create_dir_all(path.parent().unwrap())?;
    std::fs::write(&path, serde_json::to_vec_pretty(session)?)?;
    Ok(())
}

fn generate_session_id() -> String {
    Uuid::new_v4().simple().to_string().chars().take(6).collect()
}

/// Create and persist a new ablation session, registering it in the index.
pub fn create_session(whirr_dir: &Path, name: &str, metric: &str) -> Result<AblationSession> {
    if session_exists(whirr_dir, name)? {
        bail!("Session '{name}' already exists");
    }

    let session_id = generate_session_id();
    // A 31-bit seed base, drawn from uuid randomness rather than adding a
    // `rand` dependency.
    let seed_base = (Uuid::new_v4().as_u128() % (1u128 << 31)) as i64;

    let session = AblationSession {
        session_id: session_id.clone(),
        name: name.to_string(),
        metric: metric.to_string(),
        seed_base,
        baseline: IndexMap::new(),
        deltas: IndexMap::new(),
        replicates: 20,
        runs: Vec::new(),
        created_at: chrono::Utc::now(),
    };

    save_session(whirr_dir, &session)?;

    let mut index = load_index(whirr_dir)?;
    index.entries.insert(name.to_string(), session_id);
    save_index(whirr_dir, &index)?;

    Ok(session)
}

// -----------------------------------------------------------------------------
// Delta parsing (`whirr ablate add`)
// -----------------------------------------------------------------------------

/// Parse one `key=value` delta value: `@path` loads and inlines a file's
/// contents (path stored relative to `project_root` when possible), a bare
/// integer/float parses numerically, anything else stays a string.
pub fn parse_value(value: &str, project_root: &Path) -> Result<ConfigValue> {
    if let Some(file_path) = value.strip_prefix('@') {
        let path = Path::new(file_path);
        let full_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            project_root.join(path)
        };
        if !full_path.exists() {
            bail!("File not found: {}", full_path.display());
        }
        let text = std::fs::read_to_string(&full_path)?;
        let rel_path = full_path
            .strip_prefix(project_root)
            .map(|p| p.to_path_buf())
            .unwrap_or(full_path);
        return Ok(ConfigValue::File(FileValue {
            path: rel_path.to_string_lossy().to_string(),
            text,
        }));
    }

    if let Ok(i) = value.parse::<i64>() {
        return Ok(ConfigValue::Scalar(Value::from(i)));
    }
    if let Ok(f) = value.parse::<f64>() {
        if value.contains('.') {
            return Ok(ConfigValue::Scalar(Value::from(f)));
        }
    }
    Ok(ConfigValue::Scalar(Value::String(value.to_string())))
}

/// Add (or overwrite) a delta on `session`, returning the resolved delta
/// name (`delta_name` if given, else the first key the caller typed in
/// `changes`).
pub fn add_delta(
    session: &mut AblationSession,
    delta_name: Option<String>,
    changes: IndexMap<String, ConfigValue>,
) -> Result<String> {
    let resolved_name = match delta_name {
        Some(n) => n,
        None => changes
            .keys()
            .next()
            .cloned()
            .context("at least one key=value delta is required")?,
    };
    session.deltas.insert(resolved_name.clone(), changes);
    Ok(resolved_name)
}

// -----------------------------------------------------------------------------
// Expansion + submission (`whirr ablate run`)
// -----------------------------------------------------------------------------

pub struct ExpandedJob {
    pub command: Vec<String>,
    pub name: String,
    pub tags: Vec<String>,
    pub config: Value,
    pub condition: String,
    pub replicate: u32,
    pub seed: i64,
    pub cfg_path: PathBuf,
}

fn resolve_config_value(value: &ConfigValue) -> Value {
    value.resolve()
}

fn generate_config(
    session_id: &str,
    condition: &str,
    replicate: u32,
    seed: i64,
    baseline: &IndexMap<String, ConfigValue>,
    delta: Option<&IndexMap<String, ConfigValue>>,
) -> Value {
    let mut config = Map::new();
    let mut ablate = Map::new();
    ablate.insert("session_id".to_string(), Value::String(session_id.to_string()));
    ablate.insert("condition".to_string(), Value::String(condition.to_string()));
    ablate.insert("replicate".to_string(), Value::from(replicate));
    ablate.insert("seed".to_string(), Value::from(seed));
    config.insert("__ablate__".to_string(), Value::Object(ablate));

    for (k, v) in baseline {
        config.insert(k.clone(), resolve_config_value(v));
    }
    if let Some(delta) = delta {
        for (k, v) in delta {
            config.insert(k.clone(), resolve_config_value(v));
        }
    }
    Value::Object(config)
}

/// Replace `{{seed}}`/`{{cfg_path}}` placeholders in each argv element.
pub fn substitute_templates(argv: &[String], seed: i64, cfg_path: &str) -> Vec<String> {
    argv.iter()
        .map(|arg| arg.replace("{{seed}}", &seed.to_string()).replace("{{cfg_path}}", cfg_path))
        .collect()
}

/// Expand a session into one job spec per (condition, replicate), writing
/// materialized config files unless `dry_run`.
pub fn expand_session(
    whirr_dir: &Path,
    session: &AblationSession,
    replicates: Option<u32>,
    command_argv: &[String],
    dry_run: bool,
) -> Result<Vec<ExpandedJob>> {
    anyhow::ensure!(!session.deltas.is_empty(), "no deltas added to session '{}'", session.name);
    anyhow::ensure!(!command_argv.is_empty(), "no command provided");

    let num_replicates = replicates.unwrap_or(session.replicates);
    let configs_dir = config::ablations_dir(whirr_dir)
        .join(&session.session_id)
        .join("configs");
    if !dry_run {
        std::fs::create_dir_all(&configs_dir)?;
    }

    let conditions = session.condition_names();
    let mut jobs = Vec::new();

    for replicate in 0..num_replicates {
        let seed = session.seed_for(replicate);

        for condition in &conditions {
            let delta = if condition != "baseline" {
                session.deltas.get(condition)
            } else {
                None
            };

            let config = generate_config(
                &session.session_id,
                condition,
                replicate,
                seed,
                &session.baseline,
                delta,
            );

            let cfg_path = configs_dir.join(format!("{condition}-{replicate}.json"));
            if !dry_run {
                std::fs::write(&cfg_path, serde_json::to_vec_pretty(&config)?)?;
            }

            let command = substitute_templates(command_argv, seed, &cfg_path.to_string_lossy());

            let tags = vec![
                format!("ablate:{}", session.session_id),
                format!("condition:{condition}"),
                format!("replicate:{replicate}"),
            ];

            let mut job_config = Map::new();
            job_config.insert("ablation_session".to_string(), Value::String(session.name.clone()));
            job_config.insert(
                "ablation_session_id".to_string(),
                Value::String(session.session_id.clone()),
            );
            job_config.insert("condition".to_string(), Value::String(condition.clone()));
            job_config.insert("replicate".to_string(), Value::from(replicate));
            job_config.insert("seed".to_string(), Value::from(seed));

            jobs.push(ExpandedJob {
                command,
                name: format!("{}-{condition}-{replicate}", session.name),
                tags,
                config: Value::Object(job_config),
                condition: condition.clone(),
                replicate,
                seed,
                cfg_path,
            });
        }
    }

    Ok(jobs)
}

/// Submit expanded jobs to local storage, recording each as a queued
/// `AblationRunResult` on `session` (caller must `save_session` after).
pub async fn submit_local(
    storage: &dyn Storage,
    workdir: &str,
    jobs: Vec<ExpandedJob>,
    session: &mut AblationSession,
) -> Result<Vec<i64>> {
    let mut submitted = Vec::with_capacity(jobs.len());
    for job in jobs {
        let job_id = storage
            .create_job(NewJob {
                command_argv: job.command,
                workdir: workdir.to_string(),
                name: Some(job.name),
                config: Some(job.config),
                tags: Some(job.tags),
                parent_job_id: None,
            })
            .await?;
        submitted.push(job_id);

        session.runs.push(AblationRunResult {
            run_id: format!("job-{job_id}"),
            job_id,
            condition: job.condition,
            replicate: job.replicate,
            seed: job.seed,
            metric_value: None,
            status: AblationRunStatus::Queued,
            outcome: None,
        });
    }
    Ok(submitted)
}

// -----------------------------------------------------------------------------
// Ranking (`whirr ablate rank`)
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DeltaEffect {
    pub name: String,
    pub mean: f64,
    pub effect: f64,
    pub n: usize,
    pub values: Vec<f64>,
}

fn read_meta_summary(run_dir: &Path) -> Option<Value> {
    let text = std::fs::read_to_string(run_dir.join("meta.json")).ok()?;
    let meta: Value = serde_json::from_str(&text).ok()?;
    meta.get("summary").cloned().filter(|v| !v.is_null())
}

/// Extract a numeric metric from a run: the run's `summary` first, then the
/// last matching occurrence in `metrics.jsonl`.
pub fn extract_metric(run_dir: Option<&Path>, metric_name: &str, summary: Option<&Value>) -> Option<f64> {
    if let Some(summary) = summary {
        if let Some(v) = summary.get(metric_name) {
            if let Some(f) = v.as_f64() {
                return Some(f);
            }
        }
    }

    let run_dir = run_dir?;
    let metrics_path = run_dir.join("metrics.jsonl");
    if !metrics_path.exists() {
        return None;
    }
    let records = read_metrics(&metrics_path).ok()?;
    records
        .iter()
        .rev()
        .find_map(|record| record.get(metric_name).and_then(|v| v.as_f64()))
}

/// Collect current metric values per condition, updating each
/// `AblationRunResult` in `session.runs` in place. Caller persists the
/// session afterward.
pub async fn collect_metrics(
    storage: &dyn Storage,
    runs_dir: &Path,
    session: &mut AblationSession,
) -> Result<BTreeMap<String, Vec<f64>>> {
    let mut by_condition: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    for run_result in session.runs.iter_mut() {
        let db_run = storage.get_run(&run_result.run_id).await?;

        let (run_dir, summary): (Option<PathBuf>, Option<Value>) = match db_run {
            None => {
                let dir = runs_dir.join(format!("job-{}", run_result.job_id));
                if !dir.exists() {
                    continue;
                }
                let summary = read_meta_summary(&dir);
                (Some(dir), summary)
            }
            Some(run) => {
                if run.status.as_str() == "running" {
                    continue;
                }
                if run.status.as_str() == "failed" {
                    run_result.status = AblationRunStatus::Failed;
                    continue;
                }
                run_result.status = AblationRunStatus::Completed;

                let dir = run.run_dir.clone().map(PathBuf::from);
                let summary = run
                    .summary
                    .clone()
                    .or_else(|| dir.as_deref().and_then(read_meta_summary));
                (dir, summary)
            }
        };

        match extract_metric(run_dir.as_deref(), &session.metric, summary.as_ref()) {
            Some(value) => {
                by_condition.entry(run_result.condition.clone()).or_default().push(value);
                run_result.metric_value = Some(value);
                run_result.outcome = None;
            }
            None => {
                run_result.outcome = Some("no_metric".to_string());
            }
        }
    }

    Ok(by_condition)
}

/// Rank deltas by `|mean(delta) - mean(baseline)|`, strongest first.
pub fn rank_deltas(
    session: &AblationSession,
    by_condition: &BTreeMap<String, Vec<f64>>,
) -> Result<Vec<DeltaEffect>> {
    let baseline_values = by_condition
        .get("baseline")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("No baseline results found"))?;
    let baseline_mean = baseline_values.iter().sum::<f64>() / baseline_values.len() as f64;

    let mut effects = Vec::new();
    for delta_name in session.deltas.keys() {
        let Some(values) = by_condition.get(delta_name).filter(|v| !v.is_empty()) else {
            continue;
        };
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        effects.push(DeltaEffect {
            name: delta_name.clone(),
            mean,
            effect: mean - baseline_mean,
            n: values.len(),
            values: values.clone(),
        });
    }

    effects.sort_by(|a, b| b.effect.abs().partial_cmp(&a.effect.abs()).unwrap());
    Ok(effects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_value_distinguishes_numbers_from_strings() {
        let root = Path::new("/tmp");
        assert!(matches!(
            parse_value("42", root).unwrap(),
            ConfigValue::Scalar(Value::Number(_))
        ));
        assert!(matches!(
            parse_value("hello", root).unwrap(),
            ConfigValue::Scalar(Value::String(_))
        ));
    }

    #[test]
    fn add_delta_without_name_uses_first_typed_key() {
        let mut session = AblationSession {
            session_id: "abc123".into(),
            name: "study".into(),
            metric: "accuracy".into(),
            seed_base: 1,
            baseline: IndexMap::new(),
            deltas: IndexMap::new(),
            replicates: 1,
            runs: vec![],
            created_at: chrono::Utc::now(),
        };
        // "lr" is typed first even though "batch_size" sorts first
        // alphabetically — the resolved name must follow typing order.
        let mut changes = IndexMap::new();
        changes.insert("lr".to_string(), ConfigValue::Scalar(json!(0.1)));
        changes.insert("batch_size".to_string(), ConfigValue::Scalar(json!(64)));

        let resolved = add_delta(&mut session, None, changes).unwrap();
        assert_eq!(resolved, "lr");
        assert!(session.deltas.contains_key("lr"));
    }

    #[test]
    fn substitute_templates_replaces_both_placeholders() {
        let argv = vec!["eval.py".to_string(), "--seed".to_string(), "{{seed}}".to_string(), "--cfg".to_string(), "{{cfg_path}}".to_string()];
        let out = substitute_templates(&argv, 7, "/tmp/cfg.json");
        assert_eq!(out[2], "7");
        assert_eq!(out[4], "/tmp/cfg.json");
    }

    #[test]
    fn rank_deltas_orders_by_absolute_effect() {
        let mut session = AblationSession {
            session_id: "abc123".into(),
            name: "study".into(),
            metric: "accuracy".into(),
            seed_base: 1,
            baseline: IndexMap::new(),
            deltas: IndexMap::new(),
            replicates: 1,
            runs: vec![],
            created_at: chrono::Utc::now(),
        };
        session.deltas.insert("big".to_string(), IndexMap::new());
        session.deltas.insert("small".to_string(), IndexMap::new());

        let mut by_condition = BTreeMap::new();
        by_condition.insert("baseline".to_string(), vec![0.5, 0.5]);
        by_condition.insert("big".to_string(), vec![0.9, 0.9]);
        by_condition.insert("small".to_string(), vec![0.55, 0.55]);

        let effects = rank_deltas(&session, &by_condition).unwrap();
        assert_eq!(effects[0].name, "big");
        assert_eq!(effects[1].name, "small");
        let _ = json!({});
    }
}
