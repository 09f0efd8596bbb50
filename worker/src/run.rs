//! Orchestration for one evaluation attempt.
//!
//! Stages the attempt's descriptions in a scoped workspace, records the
//! generated description on the model, delegates to the engine, and turns any
//! engine failure into a completion outcome.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::classify::classify_failure;
use crate::core::clip::clipped;
use crate::core::description::{ParamOverrides, render_description};
use crate::core::types::{CompletionOutcome, JobId, ModelId};
use crate::io::engine::{CancellationToken, EngineRequest, EvalError, EvaluationEngine};
use crate::io::store::{Fields, JobStore, StoreError, fields};
use crate::io::workspace::Workspace;

/// Everything needed to evaluate one candidate configuration.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub model_id: ModelId,
    pub job_id: JobId,
    /// Contents of the base description, staged verbatim.
    pub base_description: String,
    /// Overrides merged over the base description.
    pub params: ParamOverrides,
    pub predicted_field: String,
    pub report_patterns: Vec<String>,
    pub optimize_pattern: Option<String>,
    pub checkpoint_id: String,
    pub log_level: Option<String>,
    pub prediction_cache_limit: Option<u64>,
    /// Parent directory for workspaces; the system temp dir when `None`.
    pub workspace_root: Option<PathBuf>,
}

/// Evaluate one model and return its completion outcome.
///
/// Engine failures are classified and returned as an `error` outcome. The only
/// engine failure that propagates is a broken store connection, returned as
/// [`StoreError::InvalidConnection`] inside the `anyhow::Error`. The workspace
/// is removed before this function returns on every path; failing to remove it
/// is logged and does not replace the recorded outcome.
#[instrument(skip_all, fields(model_id = %request.model_id, job_id = %request.job_id))]
pub fn run_evaluation<E: EvaluationEngine + ?Sized>(
    engine: &E,
    store: &dyn JobStore,
    request: &EvaluationRequest,
    cancel: &CancellationToken,
) -> Result<CompletionOutcome> {
    let workspace = Workspace::create(request.workspace_root.as_deref(), request.model_id)?;
    info!(workspace = %workspace.path().display(), "using workspace");

    let description = render_description(&request.params);
    let description = workspace
        .write_generated_description(&description)
        .context("write generated description")?;
    workspace
        .write_base_description(&request.base_description)
        .context("write base description")?;
    let params = serde_json::to_value(&request.params).context("serialize params")?;
    debug!(params = %clipped(&params), "descriptions staged");

    let mut gen_fields = Fields::new();
    gen_fields.insert(
        fields::GEN_DESCRIPTION.to_string(),
        Value::String(description),
    );
    store
        .model_set_fields(request.model_id, &gen_fields)
        .with_context(|| format!("record description of model {}", request.model_id))?;

    let engine_request = EngineRequest {
        model_id: request.model_id,
        job_id: request.job_id,
        predicted_field: request.predicted_field.clone(),
        workspace_path: workspace.path().to_path_buf(),
        report_patterns: request.report_patterns.clone(),
        optimize_pattern: request.optimize_pattern.clone(),
        checkpoint_id: request.checkpoint_id.clone(),
        log_level: request.log_level.clone(),
        prediction_cache_limit: request.prediction_cache_limit,
    };

    let outcome = match engine.run(&engine_request, store, cancel) {
        Ok(outcome) => outcome,
        Err(EvalError::InvalidConnection(message)) => {
            warn!(%message, "store connection lost during evaluation");
            return Err(StoreError::InvalidConnection(message).into());
        }
        Err(err) => classify_failure(
            request.job_id,
            request.model_id,
            store,
            workspace.path(),
            &err,
        )?,
    };

    record_completion(store, request.model_id, &outcome)?;
    // The outcome is already recorded; a leftover workspace does not change it.
    if let Err(err) = workspace.close() {
        warn!(err = %format!("{err:#}"), "workspace left behind");
    }
    info!(reason = %outcome.reason, "evaluation finished");
    Ok(outcome)
}

fn record_completion(
    store: &dyn JobStore,
    model_id: ModelId,
    outcome: &CompletionOutcome,
) -> Result<()> {
    let mut update = Fields::new();
    update.insert(
        fields::COMPLETION_REASON.to_string(),
        Value::String(outcome.reason.as_str().to_string()),
    );
    update.insert(
        fields::COMPLETION_MSG.to_string(),
        Value::String(outcome.message.clone()),
    );
    store
        .model_set_fields(model_id, &update)
        .with_context(|| format!("record completion of model {model_id}"))
}

/// True if `err` reports a broken store connection.
pub fn is_invalid_connection(err: &anyhow::Error) -> bool {
    err.downcast_ref::<StoreError>()
        .is_some_and(StoreError::is_invalid_connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::description::ParamValue;
    use crate::core::types::CompletionReason;
    use crate::io::store::{JobRecord, MemoryStore, ModelRecord};
    use anyhow::anyhow;
    use std::cell::RefCell;
    use std::path::Path;

    struct FnEngine<F> {
        seen: RefCell<Option<PathBuf>>,
        run: F,
    }

    impl<F> EvaluationEngine for FnEngine<F>
    where
        F: Fn(&Path) -> Result<CompletionOutcome, EvalError>,
    {
        fn run(
            &self,
            request: &EngineRequest,
            _store: &dyn JobStore,
            _cancel: &CancellationToken,
        ) -> Result<CompletionOutcome, EvalError> {
            *self.seen.borrow_mut() = Some(request.workspace_path.clone());
            (self.run)(&request.workspace_path)
        }
    }

    fn engine<F>(run: F) -> FnEngine<F>
    where
        F: Fn(&Path) -> Result<CompletionOutcome, EvalError>,
    {
        FnEngine {
            seen: RefCell::new(None),
            run,
        }
    }

    fn setup() -> (tempfile::TempDir, MemoryStore, EvaluationRequest) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = MemoryStore::new();
        store.insert_job(JobRecord::new(JobId(1))).expect("job");
        store
            .insert_model(ModelRecord::new(ModelId(3), JobId(1)))
            .expect("model");
        let mut params = ParamOverrides::new();
        params.insert("layers".to_string(), ParamValue::from(2));
        let request = EvaluationRequest {
            model_id: ModelId(3),
            job_id: JobId(1),
            base_description: "base = 1\n".to_string(),
            params,
            predicted_field: "consumption".to_string(),
            report_patterns: vec![".*".to_string()],
            optimize_pattern: None,
            checkpoint_id: "ckpt".to_string(),
            log_level: None,
            prediction_cache_limit: None,
            workspace_root: Some(temp.path().to_path_buf()),
        };
        (temp, store, request)
    }

    #[test]
    fn success_stages_files_and_records_description() {
        let (_temp, store, request) = setup();
        let engine = engine(|workspace| {
            let base = std::fs::read_to_string(workspace.join("base.cfg")).expect("base");
            assert_eq!(base, "base = 1\n");
            assert!(workspace.join("description.cfg").exists());
            Ok(CompletionOutcome::success())
        });

        let outcome =
            run_evaluation(&engine, &store, &request, &CancellationToken::new()).expect("run");
        assert!(outcome.is_success());

        let model = store.model_get(ModelId(3)).expect("model");
        let description = model.gen_description.expect("description");
        assert!(description.contains("  'layers' : 2,\n"));
        assert_eq!(model.completion_reason, Some(CompletionReason::Success));

        let seen = engine.seen.borrow().clone().expect("workspace seen");
        assert!(!seen.exists());
    }

    #[test]
    fn generic_failure_is_classified_and_workspace_removed() {
        let (_temp, store, request) = setup();
        let engine = engine(|_| Err(EvalError::Generic(anyhow!("nan loss"))));

        let outcome =
            run_evaluation(&engine, &store, &request, &CancellationToken::new()).expect("run");
        assert_eq!(outcome.reason, CompletionReason::Error);
        assert!(outcome.message.contains("nan loss"));
        let model = store.model_get(ModelId(3)).expect("model");
        assert_eq!(model.completion_reason, Some(CompletionReason::Error));
        assert_eq!(model.completion_msg.as_deref(), Some(outcome.message.as_str()));

        let seen = engine.seen.borrow().clone().expect("workspace seen");
        assert!(!seen.exists());
    }

    #[test]
    fn outcome_survives_failed_workspace_removal() {
        let (_temp, store, request) = setup();
        let engine = engine(|workspace| {
            std::fs::remove_dir_all(workspace).expect("remove workspace");
            Ok(CompletionOutcome::success())
        });

        let outcome =
            run_evaluation(&engine, &store, &request, &CancellationToken::new()).expect("run");
        assert!(outcome.is_success());
        let model = store.model_get(ModelId(3)).expect("model");
        assert_eq!(model.completion_reason, Some(CompletionReason::Success));
    }

    #[test]
    fn invalid_connection_propagates_and_workspace_removed() {
        let (_temp, store, request) = setup();
        let engine = engine(|_| Err(EvalError::InvalidConnection("reset".to_string())));

        let err = run_evaluation(&engine, &store, &request, &CancellationToken::new()).unwrap_err();
        assert!(is_invalid_connection(&err));
        assert_eq!(store.model_get(ModelId(3)).expect("model").completion_reason, None);

        let seen = engine.seen.borrow().clone().expect("workspace seen");
        assert!(!seen.exists());
    }
}
