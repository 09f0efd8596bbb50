//! Deterministic, pure logic shared by the worker.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod clip;
pub mod description;
pub mod periodic;
pub mod report_keys;
pub mod types;
