// # -----------------------------
// # crates/cli/src/main.rs
// # -----------------------------
use std::fs;
use std::io::{stdin, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

use editgate_cli::core::{CoreError, Engine, EngineConfig};
use editgate_common::{EditPlan, PostCheckCommand};

/// Exit status for a batch that rolled back, failed checks, or a failed command.
const EXIT_FAILED: u8 = 1;
/// Exit status for a request the engine refused or could not start.
const EXIT_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "editgate",
    version,
    about = "Apply edit plans as undoable batches and run checks in a sandbox"
)]
struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true, value_name = "DIR", default_value = ".")]
    root: PathBuf,
    /// Log level (trace, debug, info, warn, error, off). Overrides RUST_LOG if set.
    #[arg(long = "log-level", global = true, value_name = "LEVEL")]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply an edit plan (JSON) as one batch
    Apply {
        /// Plan file, or '-' for stdin
        #[arg(long, value_name = "FILE")]
        plan: String,
        /// Print the plan summary without applying it
        #[arg(long)]
        dry_run: bool,
    },
    /// Restore the files of the last committed batch
    Undo,
    /// Run one command in the sandbox
    Exec {
        command: String,
        /// Working directory, relative to the project root
        #[arg(long, value_name = "DIR")]
        cwd: Option<PathBuf>,
        /// Run even if the command matches a denial pattern
        #[arg(long)]
        override_sandbox: bool,
    },
    /// Run check commands; detected from the project when none are given
    Check { commands: Vec<String> },
    /// Inspect or prune stored snapshots
    Snapshots {
        #[command(subcommand)]
        action: SnapshotCommands,
    },
}

#[derive(Subcommand, Debug)]
enum SnapshotCommands {
    /// List snapshots, newest first
    List,
    /// Keep only the newest N snapshots (and the undo target)
    Prune {
        #[arg(long)]
        retain: usize,
    },
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    hints: Vec<String>,
}

/// Envelope for everything printed on stdout.
#[derive(Debug, Serialize)]
struct Response<T: Serialize> {
    success: bool,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

impl<T: Serialize> Response<T> {
    fn data(success: bool, data: T) -> Self {
        Self {
            success,
            timestamp: Utc::now(),
            error: None,
            data: Some(data),
        }
    }
}

impl Response<()> {
    fn error(code: &str, message: String, hints: Vec<String>) -> Self {
        Self {
            success: false,
            timestamp: Utc::now(),
            error: Some(ErrorBody {
                code: code.to_string(),
                message,
                hints,
            }),
            data: None,
        }
    }

    fn core_error(err: &CoreError) -> Self {
        Self::error(err.error_code(), err.to_string(), err.recovery_hints())
    }
}

fn print_json<T: Serialize>(response: &Response<T>) -> Result<()> {
    let json = serde_json::to_string_pretty(response).context("serialize response")?;
    println!("{}", json);
    Ok(())
}

/// Print `data`, mapping `success` to the process exit status.
fn emit<T: Serialize>(success: bool, data: T) -> Result<ExitCode> {
    print_json(&Response::data(success, data))?;
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILED)
    })
}

fn emit_error(err: &CoreError) -> Result<ExitCode> {
    tracing::debug!(code = err.error_code(), "request failed: {}", err);
    print_json(&Response::core_error(err))?;
    Ok(ExitCode::from(EXIT_ERROR))
}

/// Initialize logging based on CLI arguments and environment
fn init_logging(log_level: Option<&str>) {
    // CLI arg overrides RUST_LOG
    let filter = match log_level {
        Some(level) => match level.to_lowercase().as_str() {
            "off" => EnvFilter::new("off"),
            "error" => EnvFilter::new("error"),
            "warn" | "warning" => EnvFilter::new("warn"),
            "info" => EnvFilter::new("info"),
            "debug" => EnvFilter::new("debug"),
            "trace" => EnvFilter::new("trace"),
            _ => {
                eprintln!("Warning: Invalid log level '{}', using 'warn'", level);
                EnvFilter::new("warn")
            }
        },
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    // stdout carries JSON results only
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn read_plan(source: &str) -> Result<String> {
    if source == "-" {
        let mut raw = String::new();
        stdin().read_to_string(&mut raw).context("read plan from stdin")?;
        Ok(raw)
    } else {
        fs::read_to_string(source).with_context(|| format!("read plan file {}", source))
    }
}

fn open_engine(root: &Path) -> Result<Engine, CoreError> {
    let config = EngineConfig::load(root)?;
    Engine::open(root, config)
}

fn run(cli: Cli) -> Result<ExitCode> {
    if let Commands::Apply {
        plan,
        dry_run: true,
    } = &cli.command
    {
        let raw = read_plan(plan)?;
        return match EditPlan::from_json(&raw) {
            Ok(plan) => emit(true, plan.summary()),
            Err(err) => emit_error(&CoreError::from(err)),
        };
    }

    let mut engine = match open_engine(&cli.root) {
        Ok(engine) => engine,
        Err(err) => return emit_error(&err),
    };

    match cli.command {
        Commands::Apply { plan, .. } => {
            let raw = read_plan(&plan)?;
            let plan = match EditPlan::from_json(&raw) {
                Ok(plan) => plan,
                Err(err) => return emit_error(&CoreError::from(err)),
            };
            tracing::info!(edits = plan.edits.len(), checks = plan.post_checks.len(), "applying plan");
            match engine.apply(&plan) {
                Ok(result) => emit(result.success, result),
                Err(err) => emit_error(&err),
            }
        }
        Commands::Undo => match engine.undo() {
            Ok(result) => emit(true, result),
            Err(err) => emit_error(&err),
        },
        Commands::Exec {
            command,
            cwd,
            override_sandbox,
        } => {
            let result = engine.exec(&command, cwd.as_deref(), override_sandbox);
            emit(result.succeeded(), result)
        }
        Commands::Check { commands } => {
            let commands: Vec<PostCheckCommand> = if commands.is_empty() {
                engine.detect_post_checks()
            } else {
                commands.into_iter().map(PostCheckCommand::new).collect()
            };
            let report = engine.run_post_checks(&commands);
            eprintln!("{}", report.summary());
            emit(report.success, report)
        }
        Commands::Snapshots { action } => match action {
            SnapshotCommands::List => match engine.list_snapshots() {
                Ok(list) => emit(true, list),
                Err(err) => emit_error(&err),
            },
            SnapshotCommands::Prune { retain } => match engine.prune_snapshots(retain) {
                Ok(removed) => emit(true, removed),
                Err(err) => emit_error(&err),
            },
        },
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());
    tracing::debug!("CLI arguments: {:?}", cli);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("editgate: {:#}", err);
            ExitCode::from(EXIT_ERROR)
        }
    }
}
