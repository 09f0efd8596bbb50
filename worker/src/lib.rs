//! Hypersearch worker: evaluates one candidate model configuration at a time.
//!
//! A worker stages the candidate's description in a scoped workspace, runs an
//! evaluation engine against it, records the filtered results on the model
//! record, and classifies failures. Workers of one job coordinate only through
//! the shared job/model store:
//!
//! - **[`core`]**: Pure, deterministic logic (report key matching, periodic
//!   scheduling, description rendering). No I/O.
//! - **[`io`]**: Store, workspace, engines, and child processes.
//!
//! [`run::run_evaluation`] ties them together for one attempt;
//! [`classify`] turns failures into outcomes and escalates job-fatal ones into
//! job-wide cancellation.

pub mod classify;
pub mod core;
pub mod exit_codes;
pub mod guid;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
