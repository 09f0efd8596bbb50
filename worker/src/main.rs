//! `hsworker`: evaluate one candidate model configuration from the command line.
//!
//! The store is in-process: `run` seeds it with the job and model records,
//! evaluates, and prints the resulting outcome and model record as JSON.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use hypersearch_worker::core::description::ParamOverrides;
use hypersearch_worker::core::report_keys::filter_results;
use hypersearch_worker::core::types::{JobId, ModelId};
use hypersearch_worker::exit_codes;
use hypersearch_worker::guid::generate_persistent_job_guid;
use hypersearch_worker::io::command_engine::CommandEngine;
use hypersearch_worker::io::config::{WorkerConfig, load_config, write_config};
use hypersearch_worker::io::dummy_engine::DummyEngine;
use hypersearch_worker::io::engine::CancellationToken;
use hypersearch_worker::io::store::{JobRecord, JobStore, MemoryStore, ModelRecord};
use hypersearch_worker::logging;
use hypersearch_worker::run::{EvaluationRequest, is_invalid_connection, run_evaluation};
use hypersearch_worker::validate::parse_param_overrides;
use serde_json::{Value, json};

#[derive(Parser)]
#[command(
    name = "hsworker",
    version,
    about = "Hypersearch worker: evaluate one candidate model configuration"
)]
struct Cli {
    /// Tracing filter used when `RUST_LOG` is unset. Not `run --log-level`,
    /// which is handed to the evaluation engine.
    #[arg(long, global = true, default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate one model and print its outcome and model record.
    Run(RunArgs),
    /// Apply report/optimize key patterns to a results JSON file.
    Filter(FilterArgs),
    /// Print a new persistent job GUID.
    JobGuid,
    /// Write a worker config holding the defaults.
    InitConfig(InitConfigArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Worker config (TOML). Defaults apply when the file is missing.
    #[arg(long, default_value = "worker.toml")]
    config: PathBuf,

    #[arg(long)]
    job_id: u64,

    #[arg(long)]
    model_id: u64,

    /// Base description file, staged verbatim.
    #[arg(long)]
    base: PathBuf,

    /// JSON object of parameter overrides.
    #[arg(long)]
    params: Option<PathBuf>,

    #[arg(long)]
    predicted_field: String,

    /// Report key pattern (regex, full match). Repeatable.
    #[arg(long = "report-key")]
    report_keys: Vec<String>,

    /// Optimize key pattern; must match exactly one result key.
    #[arg(long)]
    optimize_key: Option<String>,

    /// Checkpoint id; a new persistent GUID when omitted.
    #[arg(long)]
    checkpoint_id: Option<String>,

    /// Log level handed to the evaluation engine.
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    prediction_cache_limit: Option<u64>,

    /// Evaluate with the dummy engine, reporting this results file.
    #[arg(long)]
    dummy_results: Option<PathBuf>,

    /// Records the dummy engine pretends to process.
    #[arg(long, default_value_t = 10)]
    dummy_records: u64,
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// Results JSON file.
    #[arg(long)]
    results: PathBuf,

    #[arg(long = "report-key")]
    report_keys: Vec<String>,

    #[arg(long)]
    optimize_key: Option<String>,
}

#[derive(Args, Debug)]
struct InitConfigArgs {
    #[arg(long, default_value = "worker.toml")]
    path: PathBuf,

    /// Overwrite an existing file.
    #[arg(long)]
    force: bool,
}

fn main() {
    let cli = Cli::parse();
    logging::init(&cli.log);
    let cancel = CancellationToken::new();
    if let Err(err) = install_interrupt_handler(&cancel) {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::INVALID);
    }
    match run(cli.command, &cancel) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

/// Ctrl-C cancels `cancel` so a running evaluation is stopped, its child
/// killed, and its workspace removed before the process exits.
fn install_interrupt_handler(cancel: &CancellationToken) -> Result<()> {
    let cancel = cancel.clone();
    ctrlc::set_handler(move || cancel.cancel()).context("install Ctrl-C handler")
}

fn run(command: Command, cancel: &CancellationToken) -> Result<i32> {
    match command {
        Command::Run(args) => cmd_run(args, cancel),
        Command::Filter(args) => cmd_filter(&args),
        Command::JobGuid => {
            println!("{}", generate_persistent_job_guid());
            Ok(exit_codes::OK)
        }
        Command::InitConfig(args) => cmd_init_config(&args),
    }
}

fn cmd_run(args: RunArgs, cancel: &CancellationToken) -> Result<i32> {
    let config = load_config(&args.config)?;
    let base_description = fs::read_to_string(&args.base)
        .with_context(|| format!("read base description {}", args.base.display()))?;
    let params = match &args.params {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read params {}", path.display()))?;
            parse_param_overrides(&raw).with_context(|| format!("params {}", path.display()))?
        }
        None => ParamOverrides::new(),
    };

    let job_id = JobId(args.job_id);
    let model_id = ModelId(args.model_id);
    let store = MemoryStore::new();
    store.insert_job(JobRecord::new(job_id))?;
    store.insert_model(ModelRecord::new(model_id, job_id))?;

    let request = EvaluationRequest {
        model_id,
        job_id,
        base_description,
        params,
        predicted_field: args.predicted_field,
        report_patterns: args.report_keys,
        optimize_pattern: args.optimize_key,
        checkpoint_id: args
            .checkpoint_id
            .unwrap_or_else(generate_persistent_job_guid),
        log_level: args.log_level,
        prediction_cache_limit: args.prediction_cache_limit,
        workspace_root: config.workspace_root.clone(),
    };

    let result = match &args.dummy_results {
        Some(path) => {
            let engine = DummyEngine::new(read_json(path)?)
                .with_records(args.dummy_records)
                .with_cancel_check_period(config.engine.cancel_check_period_ticks);
            run_evaluation(&engine, &store, &request, cancel)
        }
        None => {
            let engine = CommandEngine::new(config.engine.clone());
            run_evaluation(&engine, &store, &request, cancel)
        }
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) if is_invalid_connection(&err) => {
            eprintln!("{:#}", err);
            return Ok(exit_codes::STORE_UNAVAILABLE);
        }
        Err(err) => return Err(err),
    };

    let model = store.model_get(model_id)?;
    let report = json!({
        "outcome": outcome,
        "model": model,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize report")?
    );
    Ok(exit_codes::for_reason(outcome.reason))
}

fn cmd_init_config(args: &InitConfigArgs) -> Result<i32> {
    if args.path.exists() && !args.force {
        bail!(
            "{} already exists (pass --force to overwrite)",
            args.path.display()
        );
    }
    write_config(&args.path, &WorkerConfig::default())?;
    println!("{}", args.path.display());
    Ok(exit_codes::OK)
}

fn cmd_filter(args: &FilterArgs) -> Result<i32> {
    let all = read_json(&args.results)?;
    let filtered = filter_results(&all, &args.report_keys, args.optimize_key.as_deref())
        .with_context(|| format!("filter {}", args.results.display()))?;
    let report = json!({
        "report": filtered.report,
        "optimize": filtered.optimize,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize report")?
    );
    Ok(exit_codes::OK)
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}
