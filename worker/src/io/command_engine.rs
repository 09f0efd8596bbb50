//! Evaluation engine that runs an external command in the workspace.
//!
//! The command sees the staged descriptions in its working directory and the
//! model metadata in `HS_*` environment variables. It writes its full result
//! structure as JSON to the configured results file. While it runs, the
//! engine ticks a [`PeriodicActivities`] once per poll interval to heartbeat
//! the model record and to look for job-wide cancellation.

use std::cell::Cell;
use std::fs;
use std::process::{Command, ExitStatus};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::periodic::{ActivityRequest, PeriodicActivities};
use crate::core::report_keys::filter_results;
use crate::core::types::{CompletionOutcome, CompletionReason, JobId, ModelId};
use crate::io::config::EngineConfig;
use crate::io::engine::{CancellationToken, EngineRequest, EvalError, EvaluationEngine};
use crate::io::process::RunningCommand;
use crate::io::store::{Fields, JobStore, fields};

/// Top-level results key holding the number of processed records.
pub const NUM_RECORDS_KEY: &str = "numRecords";

/// How the supervision loop ended.
enum Stop {
    Exited(ExitStatus),
    JobCancelled(ExitStatus),
    Interrupted(ExitStatus),
    TimedOut(ExitStatus),
}

pub struct CommandEngine {
    config: EngineConfig,
}

impl CommandEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, request: &EngineRequest) -> Result<Command> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("engine.command must be a non-empty array"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workspace_path)
            .env("HS_MODEL_ID", request.model_id.to_string())
            .env("HS_JOB_ID", request.job_id.to_string())
            .env("HS_PREDICTED_FIELD", &request.predicted_field)
            .env("HS_CHECKPOINT_ID", &request.checkpoint_id)
            .env("HS_RESULTS_FILE", &self.config.results_file);
        if let Some(level) = &request.log_level {
            cmd.env("HS_LOG_LEVEL", level);
        }
        if let Some(limit) = request.prediction_cache_limit {
            cmd.env("HS_PREDICTION_CACHE_LIMIT", limit.to_string());
        }
        Ok(cmd)
    }

    /// Poll the child until it exits or something asks it to stop.
    fn supervise(
        &self,
        running: &mut RunningCommand,
        request: &EngineRequest,
        store: &dyn JobStore,
        cancel: &CancellationToken,
    ) -> Result<Stop> {
        let job_cancelled = Cell::new(false);
        let mut activities = PeriodicActivities::new(vec![
            ActivityRequest::repeating(self.config.heartbeat_period_ticks, || {
                heartbeat(store, request.model_id)
            }),
            ActivityRequest::repeating(self.config.cancel_check_period_ticks, || {
                if job_cancel_requested(store, request.job_id)? {
                    job_cancelled.set(true);
                }
                Ok(())
            }),
        ])?;

        let slice = Duration::from_millis(self.config.poll_interval_ms);
        // None: the timeout lies beyond what the clock can represent.
        let deadline = Instant::now().checked_add(Duration::from_secs(self.config.timeout_secs));
        loop {
            if let Some(status) = running.poll(slice)? {
                return Ok(Stop::Exited(status));
            }
            activities.tick()?;
            if job_cancelled.get() {
                warn!("job cancelled, killing evaluation");
                return Ok(Stop::JobCancelled(running.kill()?));
            }
            if cancel.is_cancelled() {
                warn!("worker interrupted, killing evaluation");
                return Ok(Stop::Interrupted(running.kill()?));
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(timeout_secs = self.config.timeout_secs, "evaluation timed out, killing");
                return Ok(Stop::TimedOut(running.kill()?));
            }
        }
    }

    fn record_results(
        &self,
        request: &EngineRequest,
        store: &dyn JobStore,
    ) -> Result<CompletionOutcome, EvalError> {
        let path = request.workspace_path.join(&self.config.results_file);
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let all: Value =
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        let filtered = filter_results(
            &all,
            &request.report_patterns,
            request.optimize_pattern.as_deref(),
        )
        .context("filter results")?;
        let num_records = all.get(NUM_RECORDS_KEY).and_then(Value::as_u64).unwrap_or(0);

        let results = json!({
            "report": filtered.report,
            "optimize": filtered.optimize,
        });
        store.model_update_results(request.model_id, Some(&results), num_records)?;
        info!(num_records, "evaluation results recorded");
        Ok(CompletionOutcome::success())
    }
}

impl EvaluationEngine for CommandEngine {
    #[instrument(skip_all, fields(model_id = %request.model_id, job_id = %request.job_id))]
    fn run(
        &self,
        request: &EngineRequest,
        store: &dyn JobStore,
        cancel: &CancellationToken,
    ) -> Result<CompletionOutcome, EvalError> {
        let cmd = self.build_command(request)?;
        let mut running = RunningCommand::spawn(cmd, self.config.output_limit_bytes)?;

        let stop = match self.supervise(&mut running, request, store, cancel) {
            Ok(stop) => stop,
            Err(err) => {
                if let Err(kill_err) = running.kill() {
                    warn!(err = %kill_err, "failed to kill evaluation");
                }
                return Err(err.into());
            }
        };

        match stop {
            Stop::JobCancelled(status) => {
                running.finish(status)?;
                Ok(CompletionOutcome::new(
                    CompletionReason::Killed,
                    "job was cancelled",
                ))
            }
            Stop::Interrupted(status) => {
                running.finish(status)?;
                Ok(CompletionOutcome::new(
                    CompletionReason::Stopped,
                    "evaluation interrupted by worker",
                ))
            }
            Stop::TimedOut(status) => {
                running.finish(status)?;
                Err(EvalError::Generic(anyhow!(
                    "evaluation timed out after {}s",
                    self.config.timeout_secs
                )))
            }
            Stop::Exited(status) => {
                let output = running.finish(status)?;
                debug!(stdout = %String::from_utf8_lossy(&output.stdout), "evaluation output");
                if status.success() {
                    return self.record_results(request, store);
                }
                let last_line = output.stderr_last_line();
                if status.code() == Some(self.config.job_fatal_exit_code) {
                    return Err(EvalError::job_fatal([last_line.unwrap_or_else(|| {
                        "evaluation reported a job-fatal failure".to_string()
                    })]));
                }
                Err(EvalError::Generic(anyhow!(
                    "evaluation command failed with status {:?}: {}",
                    status.code(),
                    last_line.unwrap_or_default()
                )))
            }
        }
    }
}

fn heartbeat(store: &dyn JobStore, model_id: ModelId) -> Result<()> {
    let mut update = Fields::new();
    update.insert(
        fields::LAST_UPDATED.to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    store
        .model_set_fields(model_id, &update)
        .with_context(|| format!("heartbeat model {model_id}"))
}

fn job_cancel_requested(store: &dyn JobStore, job_id: JobId) -> Result<bool> {
    let values = store
        .job_get_fields(job_id, &[fields::CANCEL])
        .with_context(|| format!("poll cancel flag of job {job_id}"))?;
    Ok(values.first().and_then(Value::as_bool).unwrap_or(false))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::io::store::{JobRecord, MemoryStore, ModelRecord};

    struct Fixture {
        workspace: tempfile::TempDir,
        store: MemoryStore,
    }

    impl Fixture {
        fn new() -> Self {
            let store = MemoryStore::new();
            store.insert_job(JobRecord::new(JobId(1))).expect("job");
            store
                .insert_model(ModelRecord::new(ModelId(2), JobId(1)))
                .expect("model");
            Self {
                workspace: tempfile::tempdir().expect("tempdir"),
                store,
            }
        }

        fn request(&self) -> EngineRequest {
            EngineRequest {
                model_id: ModelId(2),
                job_id: JobId(1),
                predicted_field: "target".to_string(),
                workspace_path: self.workspace.path().to_path_buf(),
                report_patterns: vec!["metrics:.*".to_string()],
                optimize_pattern: Some("metrics:accuracy".to_string()),
                checkpoint_id: "ckpt-1".to_string(),
                log_level: None,
                prediction_cache_limit: None,
            }
        }

        fn config(script: &str) -> EngineConfig {
            EngineConfig {
                command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
                poll_interval_ms: 10,
                heartbeat_period_ticks: 1,
                cancel_check_period_ticks: 1,
                ..EngineConfig::default()
            }
        }

        fn run(
            &self,
            script: &str,
            cancel: &CancellationToken,
        ) -> Result<CompletionOutcome, EvalError> {
            self.run_with(Self::config(script), cancel)
        }

        fn run_with(
            &self,
            config: EngineConfig,
            cancel: &CancellationToken,
        ) -> Result<CompletionOutcome, EvalError> {
            CommandEngine::new(config).run(&self.request(), &self.store, cancel)
        }
    }

    #[test]
    fn successful_command_records_filtered_results() {
        let fixture = Fixture::new();
        let script = r#"printf '{"numRecords": 5, "metrics": {"accuracy": 0.5, "loss": 2}, "debug": {"x": 1}}' > "$HS_RESULTS_FILE""#;
        let outcome = fixture.run(script, &CancellationToken::new()).expect("run");
        assert!(outcome.is_success());

        let model = fixture.store.model_get(ModelId(2)).expect("model");
        assert_eq!(model.num_records, 5);
        assert_eq!(
            model.results,
            Some(json!({
                "report": {"metrics:accuracy": 0.5, "metrics:loss": 2},
                "optimize": {"metrics:accuracy": 0.5},
            }))
        );
    }

    #[test]
    fn command_sees_model_metadata() {
        let fixture = Fixture::new();
        let script = r#"printf '{"metrics": {"accuracy": %s, "model": "%s"}}' "$HS_JOB_ID" "$HS_CHECKPOINT_ID" > results.json"#;
        fixture.run(script, &CancellationToken::new()).expect("run");
        let model = fixture.store.model_get(ModelId(2)).expect("model");
        let results = model.results.expect("results");
        assert_eq!(results["report"]["metrics:accuracy"], json!(1));
        assert_eq!(results["report"]["metrics:model"], json!("ckpt-1"));
    }

    #[test]
    fn job_fatal_exit_code_raises_job_fatal() {
        let fixture = Fixture::new();
        let err = fixture
            .run("echo 'dataset is corrupt' >&2; exit 3", &CancellationToken::new())
            .unwrap_err();
        match err {
            EvalError::JobFatal { args } => assert_eq!(args, vec!["dataset is corrupt"]),
            other => panic!("expected job fatal, got {other:?}"),
        }
    }

    #[test]
    fn job_fatal_message_survives_noisy_stderr() {
        let fixture = Fixture::new();
        let script = "i=0; while [ $i -lt 6000 ]; do echo \"progress line $i\" >&2; \
                      i=$((i+1)); done; echo 'dataset is corrupt' >&2; exit 3";
        let config = EngineConfig {
            output_limit_bytes: 1000,
            ..Fixture::config(script)
        };
        let err = fixture
            .run_with(config, &CancellationToken::new())
            .unwrap_err();
        match err {
            EvalError::JobFatal { args } => assert_eq!(args, vec!["dataset is corrupt"]),
            other => panic!("expected job fatal, got {other:?}"),
        }
    }

    #[test]
    fn unrepresentable_timeout_never_fires() {
        let fixture = Fixture::new();
        let script = r#"printf '{"metrics": {"accuracy": 0.5}}' > results.json"#;
        let config = EngineConfig {
            timeout_secs: u64::MAX,
            ..Fixture::config(script)
        };
        let outcome = fixture
            .run_with(config, &CancellationToken::new())
            .expect("run");
        assert!(outcome.is_success());
    }

    #[test]
    fn other_failures_are_generic() {
        let fixture = Fixture::new();
        let err = fixture
            .run("echo 'out of memory' >&2; exit 1", &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.kind(), "Generic");
        assert!(err.to_string().contains("out of memory"));
    }

    #[test]
    fn missing_results_file_is_generic() {
        let fixture = Fixture::new();
        let err = fixture.run("true", &CancellationToken::new()).unwrap_err();
        assert_eq!(err.kind(), "Generic");
    }

    #[test]
    fn job_cancellation_kills_command() {
        let fixture = Fixture::new();
        let mut job = JobRecord::new(JobId(1));
        job.cancel = true;
        fixture.store.insert_job(job).expect("job");

        let outcome = fixture
            .run("exec sleep 30", &CancellationToken::new())
            .expect("run");
        assert_eq!(outcome.reason, CompletionReason::Killed);
    }

    #[test]
    fn local_interrupt_stops_command() {
        let fixture = Fixture::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = fixture.run("exec sleep 30", &cancel).expect("run");
        assert_eq!(outcome.reason, CompletionReason::Stopped);
    }

    #[test]
    fn heartbeat_updates_model() {
        let fixture = Fixture::new();
        fixture
            .run(
                r#"sleep 0.2; printf '{"metrics": {"accuracy": 1}}' > results.json"#,
                &CancellationToken::new(),
            )
            .expect("run");
        let model = fixture.store.model_get(ModelId(2)).expect("model");
        assert!(model.last_updated.is_some());
    }

    #[test]
    fn broken_store_connection_is_reported() {
        let fixture = Fixture::new();
        fixture.store.disconnect();
        let err = fixture
            .run("exec sleep 30", &CancellationToken::new())
            .unwrap_err();
        assert!(err.is_invalid_connection());
    }
}
