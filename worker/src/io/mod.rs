//! I/O side of the worker: store, workspace, engines, child processes, config.

pub mod command_engine;
pub mod config;
pub mod dummy_engine;
pub mod engine;
pub mod process;
pub mod store;
pub mod workspace;
