//! Deterministic engine for dry runs and tests.
//!
//! "Processes" a fixed number of records without doing any work, then
//! reports a fixed result structure through the usual key filtering.

use std::cell::Cell;

use anyhow::{Context, anyhow};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::core::periodic::{ActivityRequest, PeriodicActivities};
use crate::core::report_keys::filter_results;
use crate::core::types::{CompletionOutcome, CompletionReason};
use crate::io::engine::{CancellationToken, EngineRequest, EvalError, EvaluationEngine};
use crate::io::store::{JobStore, fields};

/// Failure a [`DummyEngine`] raises on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Generic,
    JobFatal,
    InvalidConnection,
}

#[derive(Debug, Clone)]
pub struct DummyEngine {
    results: Value,
    num_records: u64,
    cancel_check_period: u32,
    fail_after: Option<(u64, InjectedFailure)>,
}

impl DummyEngine {
    pub fn new(results: Value) -> Self {
        Self {
            results,
            num_records: 10,
            cancel_check_period: 1,
            fail_after: None,
        }
    }

    pub fn with_records(mut self, num_records: u64) -> Self {
        self.num_records = num_records;
        self
    }

    pub fn with_cancel_check_period(mut self, period: u32) -> Self {
        self.cancel_check_period = period;
        self
    }

    /// Fail with `failure` before processing record `record`.
    pub fn failing_after(mut self, record: u64, failure: InjectedFailure) -> Self {
        self.fail_after = Some((record, failure));
        self
    }

    fn injected(&self, record: u64) -> Option<EvalError> {
        let (after, failure) = self.fail_after?;
        if record != after {
            return None;
        }
        Some(match failure {
            InjectedFailure::Generic => {
                EvalError::Generic(anyhow!("injected failure at record {record}"))
            }
            InjectedFailure::JobFatal => {
                EvalError::job_fatal(vec![
                    "injected job failure".to_string(),
                    format!("record {record}"),
                ])
            }
            InjectedFailure::InvalidConnection => {
                EvalError::InvalidConnection(format!("injected disconnect at record {record}"))
            }
        })
    }
}

impl EvaluationEngine for DummyEngine {
    #[instrument(skip_all, fields(model_id = %request.model_id, records = self.num_records))]
    fn run(
        &self,
        request: &EngineRequest,
        store: &dyn JobStore,
        cancel: &CancellationToken,
    ) -> Result<CompletionOutcome, EvalError> {
        let job_cancelled = Cell::new(false);
        let mut activities =
            PeriodicActivities::new(vec![ActivityRequest::repeating(
                self.cancel_check_period,
                || {
                    let values = store
                        .job_get_fields(request.job_id, &[fields::CANCEL])
                        .with_context(|| format!("poll cancel flag of job {}", request.job_id))?;
                    if values.first().and_then(Value::as_bool).unwrap_or(false) {
                        job_cancelled.set(true);
                    }
                    Ok(())
                },
            )])?;

        for record in 0..self.num_records {
            if let Some(err) = self.injected(record) {
                return Err(err);
            }
            activities.tick()?;
            if job_cancelled.get() {
                debug!(record, "job cancelled");
                return Ok(CompletionOutcome::new(
                    CompletionReason::Killed,
                    "job was cancelled",
                ));
            }
            if cancel.is_cancelled() {
                debug!(record, "interrupted");
                return Ok(CompletionOutcome::new(
                    CompletionReason::Stopped,
                    "evaluation interrupted by worker",
                ));
            }
        }

        let filtered = filter_results(
            &self.results,
            &request.report_patterns,
            request.optimize_pattern.as_deref(),
        )
        .context("filter results")?;
        let results = json!({
            "report": filtered.report,
            "optimize": filtered.optimize,
        });
        store.model_update_results(request.model_id, Some(&results), self.num_records)?;
        Ok(CompletionOutcome::success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{JobId, ModelId};
    use crate::io::store::{JobRecord, MemoryStore, ModelRecord};
    use std::path::PathBuf;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_job(JobRecord::new(JobId(1))).expect("job");
        store
            .insert_model(ModelRecord::new(ModelId(5), JobId(1)))
            .expect("model");
        store
    }

    fn request() -> EngineRequest {
        EngineRequest {
            model_id: ModelId(5),
            job_id: JobId(1),
            predicted_field: "target".to_string(),
            workspace_path: PathBuf::from("/nonexistent"),
            report_patterns: vec!["score".to_string()],
            optimize_pattern: Some("score".to_string()),
            checkpoint_id: "ckpt".to_string(),
            log_level: None,
            prediction_cache_limit: None,
        }
    }

    fn results() -> Value {
        json!({"score": 0.25, "extra": {"ignored": true}})
    }

    #[test]
    fn records_filtered_results() {
        let store = store();
        let outcome = DummyEngine::new(results())
            .with_records(4)
            .run(&request(), &store, &CancellationToken::new())
            .expect("run");
        assert!(outcome.is_success());

        let model = store.model_get(ModelId(5)).expect("model");
        assert_eq!(model.num_records, 4);
        assert_eq!(
            model.results,
            Some(json!({"report": {"score": 0.25}, "optimize": {"score": 0.25}}))
        );
    }

    #[test]
    fn observes_job_cancellation() {
        let store = store();
        let mut job = JobRecord::new(JobId(1));
        job.cancel = true;
        store.insert_job(job).expect("job");

        let outcome = DummyEngine::new(results())
            .with_cancel_check_period(2)
            .run(&request(), &store, &CancellationToken::new())
            .expect("run");
        assert_eq!(outcome.reason, CompletionReason::Killed);
        assert_eq!(store.model_get(ModelId(5)).expect("model").results, None);
    }

    #[test]
    fn observes_local_interrupt() {
        let store = store();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = DummyEngine::new(results())
            .run(&request(), &store, &cancel)
            .expect("run");
        assert_eq!(outcome.reason, CompletionReason::Stopped);
    }

    #[test]
    fn injects_requested_failure() {
        let store = store();
        let err = DummyEngine::new(results())
            .failing_after(2, InjectedFailure::JobFatal)
            .run(&request(), &store, &CancellationToken::new())
            .unwrap_err();
        match err {
            EvalError::JobFatal { args } => {
                assert_eq!(args, vec!["injected job failure", "record 2"]);
            }
            other => panic!("expected job fatal, got {other:?}"),
        }
    }

    #[test]
    fn bad_optimize_pattern_is_generic() {
        let store = store();
        let mut request = request();
        request.optimize_pattern = Some("missing".to_string());
        let err = DummyEngine::new(results())
            .run(&request, &store, &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.kind(), "Generic");
    }

    #[test]
    fn zero_cancel_period_is_rejected() {
        let store = store();
        let err = DummyEngine::new(results())
            .with_cancel_check_period(0)
            .run(&request(), &store, &CancellationToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("period must be > 0"));
    }
}
