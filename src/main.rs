//! fwconverge command-line front end.
//!
//! Reads JSON payloads from files, runs one engine operation and prints the
//! result as JSON on stdout. Logs go to stderr.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use fwconverge::{
    cli::{Cli, Command},
    config::Config,
    ChangeRequest, DeleteRequest, Engine, FwError, InstanceRecord, InstanceRequest,
    LoggingFilterControl, OpReport,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{path::Path, process::ExitCode, sync::Arc};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {:#}", err);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    debug!(?config, "Configuration loaded");

    let Some(command) = cli.command.clone() else {
        // Printing help can only fail on a closed stdout.
        let _ = Cli::command().print_help();
        return ExitCode::from(2);
    };

    let engine = Engine::from_config(&config, Arc::new(LoggingFilterControl));
    match run(&engine, command, cli.dry_run).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}

/// Runs one command. Returns `false` when the operation succeeded but some
/// filters could not be reloaded.
async fn run(engine: &Engine, command: Command, dry_run: bool) -> Result<bool> {
    match command {
        Command::Add { payload } => {
            let mut req: ChangeRequest = read_json(&payload)?;
            req.dry_run |= dry_run;
            finish(engine.add(req).await?)
        }
        Command::Update { payload } => {
            let mut req: ChangeRequest = read_json(&payload)?;
            req.dry_run |= dry_run;
            finish(engine.update(req).await?)
        }
        Command::Del { payload } => {
            let mut req: DeleteRequest = read_json(&payload)?;
            req.dry_run |= dry_run;
            finish(engine.del(req).await?)
        }
        Command::Enable { id, instances } => {
            let req = InstanceRequest {
                id,
                instances: read_json(&instances)?,
                dry_run,
                file_contents: false,
            };
            finish(engine.enable(req).await?)
        }
        Command::Disable { id, instances } => {
            let req = InstanceRequest {
                id,
                instances: read_json(&instances)?,
                dry_run,
                file_contents: false,
            };
            finish(engine.disable(req).await?)
        }
        Command::Get { id } => {
            print_json(&engine.get(&id).await?.serialize())?;
            Ok(true)
        }
        Command::List { fields, owner } => {
            print_json(&engine.list(&fields, owner.as_deref()).await?)?;
            Ok(true)
        }
        Command::Rules { id, instances } => {
            let records: Vec<InstanceRecord> = read_json(&instances)?;
            let rules: Vec<_> = engine
                .rules_for(&id, records)
                .await?
                .iter()
                .map(|r| r.serialize())
                .collect();
            print_json(&rules)?;
            Ok(true)
        }
    }
}

fn finish(report: OpReport) -> Result<bool> {
    print_json(&report)?;
    for failure in &report.reload_failures {
        error!(instance = %failure.instance, "{}", failure.message);
    }
    Ok(report.reload_failures.is_empty())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report_error(err: &anyhow::Error) {
    match err.downcast_ref::<FwError>() {
        Some(fw) => {
            for e in fw.errors() {
                eprintln!("error: {}", e);
            }
        }
        None => eprintln!("error: {:#}", err),
    }
}
