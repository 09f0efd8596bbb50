//! Worker configuration stored as TOML (`worker.toml`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Worker configuration (TOML).
///
/// Missing fields default to values suitable for local runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Parent directory for per-attempt workspaces. System temp dir if unset.
    pub workspace_root: Option<PathBuf>,

    pub engine: EngineConfig,
}

/// Settings for the command-based evaluation engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Command run inside the workspace (e.g. `["python", "run_model.py"]`).
    pub command: Vec<String>,

    /// Length of one scheduler tick while the command runs.
    pub poll_interval_ms: u64,

    /// Wall-clock budget for one evaluation in seconds.
    pub timeout_secs: u64,

    /// Ticks between `lastUpdated` heartbeats on the model record.
    pub heartbeat_period_ticks: u32,

    /// Ticks between reads of the job `cancel` flag.
    pub cancel_check_period_ticks: u32,

    /// Exit code by which the command reports a job-fatal failure.
    pub job_fatal_exit_code: i32,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Results file the command writes, relative to the workspace.
    pub results_file: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: vec!["./evaluate".to_string()],
            poll_interval_ms: 100,
            timeout_secs: 60 * 60,
            heartbeat_period_ticks: 50,
            cancel_check_period_ticks: 10,
            job_fatal_exit_code: 3,
            output_limit_bytes: 100_000,
            results_file: "results.json".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.command.is_empty() || engine.command[0].trim().is_empty() {
            return Err(anyhow!("engine.command must be a non-empty array"));
        }
        if engine.poll_interval_ms == 0 {
            return Err(anyhow!("engine.poll_interval_ms must be > 0"));
        }
        if engine.timeout_secs == 0 {
            return Err(anyhow!("engine.timeout_secs must be > 0"));
        }
        if engine.heartbeat_period_ticks == 0 {
            return Err(anyhow!("engine.heartbeat_period_ticks must be > 0"));
        }
        if engine.cancel_check_period_ticks == 0 {
            return Err(anyhow!("engine.cancel_check_period_ticks must be > 0"));
        }
        if engine.job_fatal_exit_code == 0 {
            return Err(anyhow!("engine.job_fatal_exit_code must not be 0"));
        }
        if engine.output_limit_bytes == 0 {
            return Err(anyhow!("engine.output_limit_bytes must be > 0"));
        }
        if engine.results_file.trim().is_empty() {
            return Err(anyhow!("engine.results_file must not be empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `WorkerConfig::default()`.
pub fn load_config(path: &Path) -> Result<WorkerConfig> {
    if !path.exists() {
        let cfg = WorkerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: WorkerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &WorkerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
