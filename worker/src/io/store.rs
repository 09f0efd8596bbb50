//! Shared job/model store.
//!
//! Workers coordinate only through this store: field-level updates on model
//! records and conditional updates on job records. [`JobStore`] is the seam;
//! [`MemoryStore`] is the in-process backend used by the CLI and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::core::types::{CompletionReason, JobId, ModelId};

/// Field name/value pairs for a partial record update.
pub type Fields = serde_json::Map<String, Value>;

/// Field names shared by every store backend.
pub mod fields {
    pub const RESULTS: &str = "results";
    pub const NUM_RECORDS: &str = "numRecords";
    pub const GEN_DESCRIPTION: &str = "genDescription";
    pub const COMPLETION_REASON: &str = "completionReason";
    pub const COMPLETION_MSG: &str = "completionMsg";
    pub const LAST_UPDATED: &str = "lastUpdated";

    pub const CANCEL: &str = "cancel";
    pub const WORKER_COMPLETION_REASON: &str = "workerCompletionReason";
    pub const WORKER_COMPLETION_MSG: &str = "workerCompletionMsg";
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection is unusable; nothing more may be written through it.
    #[error("store connection is unusable: {0}")]
    InvalidConnection(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    #[error("unknown {kind} field: {field}")]
    UnknownField { kind: &'static str, field: String },

    #[error("invalid value for {kind} field {field}: {message}")]
    InvalidValue {
        kind: &'static str,
        field: String,
        message: String,
    },

    #[error("update of {kind} {id} changed nothing")]
    Unchanged { kind: &'static str, id: u64 },

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_invalid_connection(&self) -> bool {
        matches!(self, Self::InvalidConnection(_))
    }
}

/// One model (candidate configuration) of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub model_id: ModelId,
    pub job_id: JobId,
    pub results: Option<Value>,
    pub num_records: u64,
    pub gen_description: Option<String>,
    pub completion_reason: Option<CompletionReason>,
    pub completion_msg: Option<String>,
    pub last_updated: Option<String>,
}

impl ModelRecord {
    pub fn new(model_id: ModelId, job_id: JobId) -> Self {
        Self {
            model_id,
            job_id,
            results: None,
            num_records: 0,
            gen_description: None,
            completion_reason: None,
            completion_msg: None,
            last_updated: None,
        }
    }
}

/// Job-wide state shared by every worker of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: JobId,
    pub cancel: bool,
    /// Stays `Success` until the first worker records a job-fatal failure.
    pub worker_completion_reason: CompletionReason,
    pub worker_completion_msg: Option<String>,
}

impl JobRecord {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            cancel: false,
            worker_completion_reason: CompletionReason::Success,
            worker_completion_msg: None,
        }
    }
}

/// Field-level access to job and model records.
///
/// Calls are synchronous. A broken connection must surface as
/// [`StoreError::InvalidConnection`] so callers can stop writing.
pub trait JobStore: Send + Sync {
    /// Replace the results blob and record count of a model.
    fn model_update_results(
        &self,
        model_id: ModelId,
        results: Option<&Value>,
        num_records: u64,
    ) -> Result<(), StoreError>;

    fn model_set_fields(&self, model_id: ModelId, fields: &Fields) -> Result<(), StoreError>;

    fn model_get(&self, model_id: ModelId) -> Result<ModelRecord, StoreError>;

    /// Read the named job fields, in the order requested.
    fn job_get_fields(&self, job_id: JobId, names: &[&str]) -> Result<Vec<Value>, StoreError>;

    /// Unconditional job update.
    ///
    /// `use_connection_id` restricts the update to jobs owned by this
    /// connection. With `ignore_unchanged = false` an update that changes
    /// nothing is an error.
    fn job_set_fields(
        &self,
        job_id: JobId,
        fields: &Fields,
        use_connection_id: bool,
        ignore_unchanged: bool,
    ) -> Result<(), StoreError>;

    /// Apply `fields` only if `guard_field` currently equals `expected`.
    ///
    /// The comparison and the update are one atomic step with respect to every
    /// other caller of the store. Returns whether the update was applied.
    fn job_set_fields_if(
        &self,
        job_id: JobId,
        guard_field: &str,
        expected: &Value,
        fields: &Fields,
    ) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, JobRecord>,
    models: HashMap<ModelId, ModelRecord>,
}

/// In-process store. All operations on one instance are serialized by a mutex,
/// which makes [`JobStore::job_set_fields_if`] atomic.
///
/// There is a single connection, so `use_connection_id` has no effect.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    disconnected: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_job(&self, job: JobRecord) -> Result<(), StoreError> {
        self.lock()?.jobs.insert(job.job_id, job);
        Ok(())
    }

    pub fn insert_model(&self, model: ModelRecord) -> Result<(), StoreError> {
        self.lock()?.models.insert(model.model_id, model);
        Ok(())
    }

    pub fn job(&self, job_id: JobId) -> Result<JobRecord, StoreError> {
        self.lock()?
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "job",
                id: job_id.0,
            })
    }

    /// Make every later call fail with [`StoreError::InvalidConnection`].
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(StoreError::InvalidConnection(
                "memory store disconnected".to_string(),
            ));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Other("memory store lock poisoned".to_string()))
    }
}

impl JobStore for MemoryStore {
    fn model_update_results(
        &self,
        model_id: ModelId,
        results: Option<&Value>,
        num_records: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let model = state
            .models
            .get_mut(&model_id)
            .ok_or(StoreError::NotFound {
                kind: "model",
                id: model_id.0,
            })?;
        model.results = results.cloned();
        model.num_records = num_records;
        debug!(%model_id, num_records, "model results updated");
        Ok(())
    }

    fn model_set_fields(&self, model_id: ModelId, fields: &Fields) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let model = state
            .models
            .get_mut(&model_id)
            .ok_or(StoreError::NotFound {
                kind: "model",
                id: model_id.0,
            })?;
        let (updated, _) = apply_fields(model, fields, "model")?;
        *model = updated;
        debug!(%model_id, fields = ?fields.keys().collect::<Vec<_>>(), "model fields set");
        Ok(())
    }

    fn model_get(&self, model_id: ModelId) -> Result<ModelRecord, StoreError> {
        self.lock()?
            .models
            .get(&model_id)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "model",
                id: model_id.0,
            })
    }

    fn job_get_fields(&self, job_id: JobId, names: &[&str]) -> Result<Vec<Value>, StoreError> {
        let state = self.lock()?;
        let job = find_job(&state, job_id)?;
        let value = to_object(job, "job")?;
        names
            .iter()
            .map(|name| {
                value
                    .get(*name)
                    .cloned()
                    .ok_or_else(|| StoreError::UnknownField {
                        kind: "job",
                        field: name.to_string(),
                    })
            })
            .collect()
    }

    fn job_set_fields(
        &self,
        job_id: JobId,
        fields: &Fields,
        _use_connection_id: bool,
        ignore_unchanged: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let job = find_job_mut(&mut state, job_id)?;
        let (updated, changed) = apply_fields(job, fields, "job")?;
        if !changed && !ignore_unchanged {
            return Err(StoreError::Unchanged {
                kind: "job",
                id: job_id.0,
            });
        }
        *job = updated;
        debug!(%job_id, changed, "job fields set");
        Ok(())
    }

    fn job_set_fields_if(
        &self,
        job_id: JobId,
        guard_field: &str,
        expected: &Value,
        fields: &Fields,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let job = find_job_mut(&mut state, job_id)?;
        let current = to_object(job, "job")?;
        let guard = current
            .get(guard_field)
            .ok_or_else(|| StoreError::UnknownField {
                kind: "job",
                field: guard_field.to_string(),
            })?;
        if guard != expected {
            debug!(%job_id, guard_field, current = %guard, "conditional job update skipped");
            return Ok(false);
        }
        let (updated, _) = apply_fields(job, fields, "job")?;
        *job = updated;
        debug!(%job_id, guard_field, "conditional job update applied");
        Ok(true)
    }
}

fn find_job(state: &MemoryState, job_id: JobId) -> Result<&JobRecord, StoreError> {
    state.jobs.get(&job_id).ok_or(StoreError::NotFound {
        kind: "job",
        id: job_id.0,
    })
}

fn find_job_mut(state: &mut MemoryState, job_id: JobId) -> Result<&mut JobRecord, StoreError> {
    state.jobs.get_mut(&job_id).ok_or(StoreError::NotFound {
        kind: "job",
        id: job_id.0,
    })
}

fn to_object<T: Serialize>(record: &T, kind: &'static str) -> Result<Fields, StoreError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(StoreError::Other(format!("{kind} record is not an object"))),
        Err(err) => Err(StoreError::Other(format!("serialize {kind} record: {err}"))),
    }
}

/// Apply `fields` to a copy of `record`. Returns the copy and whether any
/// field value changed. Unknown fields and ill-typed values are rejected
/// before anything is written.
fn apply_fields<T: Serialize + DeserializeOwned>(
    record: &T,
    fields: &Fields,
    kind: &'static str,
) -> Result<(T, bool), StoreError> {
    let mut object = to_object(record, kind)?;
    let mut changed = false;
    for (field, value) in fields {
        let slot = object
            .get_mut(field)
            .ok_or_else(|| StoreError::UnknownField {
                kind,
                field: field.clone(),
            })?;
        if slot != value {
            *slot = value.clone();
            changed = true;
        }
    }
    let updated = serde_json::from_value(Value::Object(object)).map_err(|err| {
        StoreError::InvalidValue {
            kind,
            field: fields.keys().cloned().collect::<Vec<_>>().join(","),
            message: err.to_string(),
        }
    })?;
    Ok((updated, changed))
}
