//! Test-only engines, store wrappers, and fixtures.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::anyhow;
use serde_json::Value;

use crate::core::description::{ParamOverrides, ParamValue};
use crate::core::types::{CompletionOutcome, JobId, ModelId};
use crate::io::engine::{CancellationToken, EngineRequest, EvalError, EvaluationEngine};
use crate::io::store::{Fields, JobRecord, JobStore, MemoryStore, ModelRecord, StoreError};
use crate::run::EvaluationRequest;

/// One scripted engine invocation.
pub enum ScriptedRun {
    /// Record `results` on the model and succeed.
    Succeed { results: Value, num_records: u64 },
    /// Return this outcome without touching the store.
    Outcome(CompletionOutcome),
    Fail(EvalError),
    Panic(String),
}

/// Engine that replays scripted runs in order and remembers the workspaces
/// it was handed.
pub struct ScriptedEngine {
    runs: RefCell<VecDeque<ScriptedRun>>,
    workspaces: RefCell<Vec<PathBuf>>,
}

impl ScriptedEngine {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            workspaces: RefCell::new(Vec::new()),
        }
    }

    /// Workspace paths seen so far, in call order.
    pub fn workspaces(&self) -> Vec<PathBuf> {
        self.workspaces.borrow().clone()
    }
}

impl EvaluationEngine for ScriptedEngine {
    fn run(
        &self,
        request: &EngineRequest,
        store: &dyn JobStore,
        _cancel: &CancellationToken,
    ) -> Result<CompletionOutcome, EvalError> {
        self.workspaces
            .borrow_mut()
            .push(request.workspace_path.clone());
        let run = self.runs.borrow_mut().pop_front();
        match run {
            Some(ScriptedRun::Succeed {
                results,
                num_records,
            }) => {
                store.model_update_results(request.model_id, Some(&results), num_records)?;
                Ok(CompletionOutcome::success())
            }
            Some(ScriptedRun::Outcome(outcome)) => Ok(outcome),
            Some(ScriptedRun::Fail(err)) => Err(err),
            Some(ScriptedRun::Panic(message)) => panic!("{message}"),
            None => Err(EvalError::Generic(anyhow!("no scripted run left"))),
        }
    }
}

/// Store wrapper that records every model write as `"<model id>:<field>"`.
pub struct RecordingStore<S> {
    inner: S,
    model_writes: Mutex<Vec<String>>,
}

impl<S: JobStore> RecordingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            model_writes: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn model_writes(&self) -> Vec<String> {
        match self.model_writes.lock() {
            Ok(writes) => writes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record<'a>(&self, model_id: ModelId, names: impl IntoIterator<Item = &'a str>) {
        let mut writes = match self.model_writes.lock() {
            Ok(writes) => writes,
            Err(poisoned) => poisoned.into_inner(),
        };
        writes.extend(names.into_iter().map(|name| format!("{model_id}:{name}")));
    }
}

impl<S: JobStore> JobStore for RecordingStore<S> {
    fn model_update_results(
        &self,
        model_id: ModelId,
        results: Option<&Value>,
        num_records: u64,
    ) -> Result<(), StoreError> {
        self.inner
            .model_update_results(model_id, results, num_records)?;
        self.record(model_id, ["results"]);
        Ok(())
    }

    fn model_set_fields(&self, model_id: ModelId, fields: &Fields) -> Result<(), StoreError> {
        self.inner.model_set_fields(model_id, fields)?;
        self.record(model_id, fields.keys().map(String::as_str));
        Ok(())
    }

    fn model_get(&self, model_id: ModelId) -> Result<ModelRecord, StoreError> {
        self.inner.model_get(model_id)
    }

    fn job_get_fields(&self, job_id: JobId, names: &[&str]) -> Result<Vec<Value>, StoreError> {
        self.inner.job_get_fields(job_id, names)
    }

    fn job_set_fields(
        &self,
        job_id: JobId,
        fields: &Fields,
        use_connection_id: bool,
        ignore_unchanged: bool,
    ) -> Result<(), StoreError> {
        self.inner
            .job_set_fields(job_id, fields, use_connection_id, ignore_unchanged)
    }

    fn job_set_fields_if(
        &self,
        job_id: JobId,
        guard_field: &str,
        expected: &Value,
        fields: &Fields,
    ) -> Result<bool, StoreError> {
        self.inner
            .job_set_fields_if(job_id, guard_field, expected, fields)
    }
}

/// Memory store holding one fresh job and the given models of it.
pub fn seeded_store(job_id: JobId, model_ids: &[ModelId]) -> MemoryStore {
    let store = MemoryStore::new();
    store
        .insert_job(JobRecord::new(job_id))
        .expect("seed job");
    for model_id in model_ids {
        store
            .insert_model(ModelRecord::new(*model_id, job_id))
            .expect("seed model");
    }
    store
}

/// Evaluation request with deterministic defaults, staging under `workspace_root`.
pub fn evaluation_request(
    job_id: JobId,
    model_id: ModelId,
    workspace_root: &Path,
) -> EvaluationRequest {
    let mut params = ParamOverrides::new();
    params.insert("activation".to_string(), ParamValue::from("relu"));
    params.insert("layers".to_string(), ParamValue::from(3));
    EvaluationRequest {
        model_id,
        job_id,
        base_description: "config = {'layers': 1}\n".to_string(),
        params,
        predicted_field: "consumption".to_string(),
        report_patterns: vec!["metrics:.*".to_string()],
        optimize_pattern: Some("metrics:accuracy".to_string()),
        checkpoint_id: format!("ckpt-{model_id}"),
        log_level: None,
        prediction_cache_limit: None,
        workspace_root: Some(workspace_root.to_path_buf()),
    }
}

/// Number of entries left directly under `dir`.
pub fn entries_in(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.count())
        .unwrap_or(0)
}
