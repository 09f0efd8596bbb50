//! Shared deterministic types for worker core logic.
//!
//! These types define stable contracts between the worker, the evaluation
//! engines, and the shared job/model store. They must not depend on external
//! state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a hypersearch job in the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

/// Identifier of one model (one candidate configuration) in the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal classification reason of one evaluation attempt.
///
/// The same values are used for the job record's worker completion reason,
/// where `Success` is the default that marks "no failure recorded yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionReason {
    #[default]
    Success,
    /// Input stream was exhausted before the evaluation finished.
    Eof,
    /// Stopped on request of the local worker.
    Stopped,
    /// Killed because the job was cancelled.
    Killed,
    /// The attempt was abandoned by a worker that went away.
    Orphan,
    Error,
}

impl CompletionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Eof => "eof",
            Self::Stopped => "stopped",
            Self::Killed => "killed",
            Self::Orphan => "orphan",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one evaluation attempt, produced exactly once per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionOutcome {
    pub reason: CompletionReason,
    pub message: String,
}

impl CompletionOutcome {
    pub fn new(reason: CompletionReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn success() -> Self {
        Self::new(CompletionReason::Success, "")
    }

    pub fn is_success(&self) -> bool {
        self.reason == CompletionReason::Success
    }
}
