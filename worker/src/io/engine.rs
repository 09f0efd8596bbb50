//! Evaluation engine abstraction.
//!
//! The [`EvaluationEngine`] trait decouples the worker from the backend that
//! actually evaluates a model. Engines are handed an explicit
//! [`CancellationToken`] for local interruption and poll the job record for
//! job-wide cancellation.

use std::path::PathBuf;

use thiserror::Error;
pub use tokio_util::sync::CancellationToken;

use crate::core::types::{CompletionOutcome, JobId, ModelId};
use crate::io::store::{JobStore, StoreError};

/// Parameters for one engine invocation.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub model_id: ModelId,
    pub job_id: JobId,
    /// Name of the input field the model is optimized to predict.
    pub predicted_field: String,
    /// Workspace holding the staged descriptions.
    pub workspace_path: PathBuf,
    pub report_patterns: Vec<String>,
    pub optimize_pattern: Option<String>,
    /// Persistent identifier for the model checkpoint key.
    pub checkpoint_id: String,
    pub log_level: Option<String>,
    pub prediction_cache_limit: Option<u64>,
}

/// Failure raised by an engine.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The store connection is unusable. Must propagate unclassified.
    #[error("store connection is unusable: {0}")]
    InvalidConnection(String),

    /// Failure that ends the whole job, not just this attempt.
    #[error("job failed: {}", .args.join(": "))]
    JobFatal { args: Vec<String> },

    /// Failure that ends this attempt only.
    #[error(transparent)]
    Generic(anyhow::Error),
}

impl EvalError {
    pub fn job_fatal<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::JobFatal {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Short name of the error kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidConnection(_) => "InvalidConnection",
            Self::JobFatal { .. } => "JobFatal",
            Self::Generic(_) => "Generic",
        }
    }

    pub fn is_invalid_connection(&self) -> bool {
        matches!(self, Self::InvalidConnection(_))
    }
}

impl From<StoreError> for EvalError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidConnection(message) => Self::InvalidConnection(message),
            other => Self::Generic(other.into()),
        }
    }
}

impl From<anyhow::Error> for EvalError {
    /// Keeps a broken store connection recognizable after it passed through
    /// `anyhow` (for example out of a periodic activity callback).
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<StoreError>() {
            Ok(store_err) => store_err.into(),
            Err(err) => match err.downcast::<EvalError>() {
                Ok(eval_err) => eval_err,
                Err(err) => Self::Generic(err),
            },
        }
    }
}

/// Abstraction over evaluation backends.
pub trait EvaluationEngine {
    /// Evaluate one model to completion. The returned outcome is final for the
    /// attempt; the engine records results on the model as it sees fit.
    fn run(
        &self,
        request: &EngineRequest,
        store: &dyn JobStore,
        cancel: &CancellationToken,
    ) -> Result<CompletionOutcome, EvalError>;
}
