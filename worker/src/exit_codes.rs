//! Stable exit codes for `hsworker` commands.

use crate::core::types::CompletionReason;

/// Command succeeded; for `run`, the evaluation completed successfully.
pub const OK: i32 = 0;
/// Invalid arguments, config, or input files.
pub const INVALID: i32 = 1;
/// The evaluation failed and was classified as `error`.
pub const EVAL_ERROR: i32 = 2;
/// The evaluation was stopped, killed, or otherwise ended early.
pub const STOPPED: i32 = 3;
/// The store connection broke; nothing more was recorded.
pub const STORE_UNAVAILABLE: i32 = 4;

/// Exit code of `hsworker run` for a completion reason.
pub fn for_reason(reason: CompletionReason) -> i32 {
    match reason {
        CompletionReason::Success => OK,
        CompletionReason::Error => EVAL_ERROR,
        CompletionReason::Eof
        | CompletionReason::Stopped
        | CompletionReason::Killed
        | CompletionReason::Orphan => STOPPED,
    }
}
