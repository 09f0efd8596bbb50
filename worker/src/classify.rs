//! Failure classification and job-wide cancellation.
//!
//! Every failed attempt is turned into an `error` outcome and recorded on its
//! model. A job-fatal failure is additionally escalated to the job record:
//! the first worker to record one sets `cancel = true`, and sibling workers see
//! the flag on their next poll.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{error, info, instrument, warn};

use crate::core::types::{CompletionOutcome, CompletionReason, JobId, ModelId};
use crate::io::engine::EvalError;
use crate::io::store::{Fields, JobStore, fields};

/// Classify a failed attempt and persist the result.
///
/// Store failures while recording are returned as errors; the classification
/// itself always yields an outcome with reason `error`.
#[instrument(skip_all, fields(%job_id, %model_id, kind = err.kind()))]
pub fn classify_failure(
    job_id: JobId,
    model_id: ModelId,
    store: &dyn JobStore,
    workspace: &Path,
    err: &EvalError,
) -> Result<CompletionOutcome> {
    let diagnostic = render_diagnostic(model_id, workspace, err);
    error!("{diagnostic}");
    let outcome = CompletionOutcome::new(CompletionReason::Error, diagnostic);

    // A broken connection usually means this attempt was orphaned; its model
    // record may already belong to someone else.
    if !err.is_invalid_connection() {
        store
            .model_update_results(model_id, None, 0)
            .with_context(|| format!("record failure of model {model_id}"))?;
    }

    if let EvalError::JobFatal { args } = err {
        escalate_job_failure(job_id, store, &args.join(": "))?;
    }

    Ok(outcome)
}

/// Mark the job cancelled and failed unless another worker already did.
///
/// Returns whether this call recorded the failure.
pub fn escalate_job_failure(job_id: JobId, store: &dyn JobStore, message: &str) -> Result<bool> {
    let success = json!(CompletionReason::Success);
    let current = store
        .job_get_fields(job_id, &[fields::WORKER_COMPLETION_REASON])
        .with_context(|| format!("read completion reason of job {job_id}"))?;
    if current.first() != Some(&success) {
        info!(%job_id, current = ?current.first(), "job failure already recorded");
        return Ok(false);
    }

    let mut update = Fields::new();
    update.insert(fields::CANCEL.to_string(), Value::Bool(true));
    update.insert(
        fields::WORKER_COMPLETION_REASON.to_string(),
        json!(CompletionReason::Error),
    );
    update.insert(
        fields::WORKER_COMPLETION_MSG.to_string(),
        Value::String(message.to_string()),
    );

    let applied = store
        .job_set_fields_if(job_id, fields::WORKER_COMPLETION_REASON, &success, &update)
        .with_context(|| format!("cancel job {job_id}"))?;
    if applied {
        warn!(%job_id, message, "job cancelled after job-fatal failure");
    } else {
        info!(%job_id, "another worker recorded the job failure first");
    }
    Ok(applied)
}

fn render_diagnostic(model_id: ModelId, workspace: &Path, err: &EvalError) -> String {
    let mut msg = format!(
        "Exception occurred while running model {model_id}: {err:#} ({})\nworkspace: {}\n",
        err.kind(),
        workspace.display()
    );
    match err {
        // Debug output of anyhow carries the cause chain and its backtrace.
        EvalError::Generic(inner) => msg.push_str(&format!("{inner:?}\n")),
        _ => {
            let backtrace = Backtrace::capture();
            if backtrace.status() == BacktraceStatus::Captured {
                msg.push_str(&format!("{backtrace}\n"));
            }
        }
    }
    msg
}
