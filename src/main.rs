//! Statement Mapper - command-line entry point.
//!
//! `check` loads template sources and lists their statements; `run`
//! initializes an engine from a config file and executes one statement,
//! printing the result as JSON.

use clap::Parser;
use serde_json::json;
use statement_mapper::config::{Cli, Command};
use statement_mapper::models::{Params, Value};
use statement_mapper::statement::{StatementKind, StatementRegistry};
use statement_mapper::{DbError, DbResult, EngineConfig, SqlEngine};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so stdout carries only the JSON result.
    if cli.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Interpret a command-line literal: integers, reals, booleans and `null`
/// keep their type, anything else is text.
fn parse_value(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(v) = raw.parse::<i64>() {
        return Value::Int(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return Value::Real(v);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::Text(raw.to_string()),
    }
}

fn build_params(named: &[String], positional: &[String]) -> DbResult<Params> {
    let mut params = Params::new();
    for entry in named {
        let (name, value) = entry.split_once('=').ok_or_else(|| {
            DbError::invalid_input(format!("Parameter '{}' must be NAME=VALUE", entry))
        })?;
        params.set(name.trim(), parse_value(value));
    }
    for value in positional {
        params = params.at(parse_value(value));
    }
    Ok(params)
}

fn check(files: &[PathBuf]) -> DbResult<serde_json::Value> {
    let registry = StatementRegistry::load_files(files)?;
    let statements: Vec<_> = registry
        .iter()
        .map(|s| {
            json!({
                "statement": s.full_id(),
                "kind": s.kind(),
                "parameters": s.parameter_names(),
                "source": s.source_name(),
            })
        })
        .collect();
    Ok(json!({
        "namespaces": registry.namespaces(),
        "statements": statements,
    }))
}

async fn run(
    config: PathBuf,
    statement: &str,
    params: &[String],
    args: &[String],
    list: bool,
) -> DbResult<serde_json::Value> {
    let config = EngineConfig::from_file(&config)?;
    let params = build_params(params, args)?;

    let engine = SqlEngine::new();
    engine.initialize(config).await?;

    let result = async {
        let kind = engine.statement(statement)?.kind();
        let output = match kind {
            StatementKind::Select if list => {
                let rows = engine.select_list(statement, &params).await?;
                json!({ "rows": rows.iter().map(|r| r.to_json()).collect::<Vec<_>>() })
            }
            StatementKind::Select => {
                let row = engine.select_one(statement, &params).await?;
                json!({ "row": row.map(|r| r.to_json()) })
            }
            StatementKind::Insert => json!({ "affected": engine.insert(statement, &params).await? }),
            StatementKind::Delete => json!({ "affected": engine.remove(statement, &params).await? }),
            StatementKind::Update | StatementKind::Exec => {
                json!({ "affected": engine.update(statement, &params).await? })
            }
        };
        Ok::<_, DbError>(output)
    }
    .await;

    engine.shutdown().await;
    result
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(&cli);

    info!("Starting statement-mapper v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Command::Check { files } => check(&files),
        Command::Run {
            config,
            statement,
            params,
            args,
            list,
        } => run(config, &statement, &params, &args, list).await,
    };

    match result {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("Hint: {}", suggestion);
            }
            Err(e.into())
        }
    }
}
