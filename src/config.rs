// src/config.rs
//
// =============================================================================
// WHIRR: CONFIGURATION
// =============================================================================
//
// Knobs for the worker loop and lease monitor, loaded from
// `<project>/.whirr/config.yaml` via `serde_yaml`. Same defaults and
// directory-walk discovery as the rest of the CLI expects.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WhirrConfig {
    pub heartbeat_interval: u64,
    pub heartbeat_timeout: u64,
    pub kill_grace_period: u64,
    pub poll_interval: u64,
}

impl Default for WhirrConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: 30,
            heartbeat_timeout: 120,
            kill_grace_period: 10,
            poll_interval: 5,
        }
    }
}

/// Walk up from `start` looking for a `.whirr` directory.
pub fn find_whirr_dir(start: Option<&Path>) -> Option<PathBuf> {
    let mut current = match start {
        Some(p) => p.to_path_buf(),
        None => env::current_dir().ok()?,
    };
    current = current.canonicalize().unwrap_or(current);

    loop {
        let candidate = current.join(".whirr");
        if candidate.is_dir() {
            return Some(candidate);
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return None,
        }
    }
}

pub fn global_config_dir() -> Option<PathBuf> {
    dirs_home().map(|h| h.join(".whirr"))
}

fn dirs_home() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}

/// Load configuration, preferring an explicit `whirr_dir`, then the nearest
/// `.whirr` found by walking up from the cwd, then `~/.whirr/config.yaml`,
/// then defaults. Unknown/malformed fields in the YAML document are ignored
/// rather than rejected.
pub fn load_config(whirr_dir: Option<&Path>) -> Result<WhirrConfig> {
    let config_path = if let Some(dir) = whirr_dir {
        Some(dir.join("config.yaml"))
    } else if let Some(found) = find_whirr_dir(None) {
        Some(found.join("config.yaml"))
    } else {
        global_config_dir()
            .map(|d| d.join("config.yaml"))
            .filter(|p| p.exists())
    };

    let Some(path) = config_path else {
        return Ok(WhirrConfig::default());
    };
    if !path.exists() {
        return Ok(WhirrConfig::default());
    }

    let text = std::fs::read_to_string(&path)?;
    let config: WhirrConfig = serde_yaml::from_str(&text).unwrap_or_default();
    Ok(config)
}

pub fn db_path(whirr_dir: &Path) -> PathBuf {
    whirr_dir.join("whirr.db")
}

pub fn runs_dir(whirr_dir: &Path) -> PathBuf {
    whirr_dir.join("runs")
}

pub fn ablations_dir(whirr_dir: &Path) -> PathBuf {
    whirr_dir.join("ablations")
}

pub fn require_whirr_dir() -> Result<PathBuf> {
    find_whirr_dir(None).ok_or_else(|| anyhow!("No .whirr directory found. Run 'whirr init' first."))
}
