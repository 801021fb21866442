//! bastion CLI - sandboxed execution and policy-checked I/O.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;
pub(crate) mod shared;

/// bastion - run untrusted code and file/network operations under policy.
#[derive(Debug, Parser)]
#[command(name = "bastion", version, about)]
struct Cli {
    /// Configuration file path (.toml, .json, .yaml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv). Overrides `logging.level`.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format: plain or json (for log aggregation).
    /// Defaults to `logging.format`.
    #[arg(long, global = true, value_parser = ["plain", "json"])]
    log_format: Option<String>,

    /// Write the session audit log to this file after the command runs.
    #[arg(long, global = true, value_name = "PATH")]
    export_audit: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute a code file in a fresh sandbox.
    Run(commands::run::RunArgs),
    /// Read a file through the filesystem policy.
    Read(commands::read::ReadArgs),
    /// Write a file through the filesystem policy.
    Write(commands::write::WriteArgs),
    /// Fetch a URL through the network policy.
    Fetch(commands::fetch::FetchArgs),
    /// Validate a path or URL against the policy without any I/O.
    Check(commands::check::CheckArgs),
    /// Print the merged, validated configuration.
    Policy(commands::policy::PolicyArgs),
    /// Summarize or filter an exported audit log.
    Audit(commands::audit::AuditArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = shared::load(cli.config.as_deref())?;
    init_tracing(&cli, &config.logging);

    tracing::debug!(config = ?cli.config, "bastion starting");

    match &cli.command {
        Commands::Policy(args) => {
            commands::policy::execute(args, &config)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Audit(args) => {
            commands::audit::execute(args)?;
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let manager = shared::create_manager(&config)?;
    let outcome = match &cli.command {
        Commands::Run(args) => commands::run::execute(args, &manager).await,
        Commands::Read(args) => commands::read::execute(args, &manager),
        Commands::Write(args) => commands::write::execute(args, &manager),
        Commands::Fetch(args) => commands::fetch::execute(args, &manager).await,
        Commands::Check(args) => commands::check::execute(args, &manager).await,
        Commands::Policy(_) | Commands::Audit(_) => Ok(ExitCode::SUCCESS),
    };
    manager.shutdown().await;
    if let Some(path) = &cli.export_audit {
        shared::export_audit(&manager, path)?;
    }
    outcome
}

fn init_tracing(cli: &Cli, logging: &bastion_config::LoggingConfig) {
    let filter = match cli.verbose {
        0 => EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    let json = match cli.log_format.as_deref() {
        Some(format) => format == "json",
        None => logging.format == bastion_config::LogFormat::Json,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder
            .json()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .init();
    } else {
        builder.init();
    }
}
