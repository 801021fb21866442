//! `bastion run` command.
//!
//! Executes a code file in a fresh sandbox and exits with the payload's
//! exit code.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Args;

use bastion_runtime::SafetyManager;
use bastion_types::{ExecutionRequest, ExecutionStatus, Language};

use crate::{output, shared};

/// Execute a code file in a fresh sandbox.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Code file to run.
    pub file: PathBuf,
    /// Payload language; inferred from the file extension when omitted.
    #[arg(short, long)]
    pub language: Option<Language>,
    /// Wall-clock timeout in seconds (at most the session limit).
    #[arg(long)]
    pub timeout: Option<u64>,
    /// Memory limit in MB (at most the session limit).
    #[arg(long)]
    pub memory: Option<u64>,
    /// CPU limit in percent of one core (at most the session limit).
    #[arg(long)]
    pub cpu: Option<u32>,
    /// Give the payload mediated network access.
    #[arg(long)]
    pub network: bool,
    /// Restrict network access to these hosts (implies --network).
    #[arg(long = "allow-host", value_name = "HOST")]
    pub allow_hosts: Vec<String>,
    /// Install a requirement before running (repeatable).
    #[arg(short, long = "requirement", value_name = "REQUIREMENT")]
    pub requirements: Vec<String>,
    /// Stage an extra file into the working directory as NAME=PATH.
    #[arg(long = "stage", value_name = "NAME=PATH")]
    pub stage: Vec<String>,
    /// Print the full result as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Infers the language from a file extension.
pub fn language_for(path: &Path) -> Option<Language> {
    match path.extension()?.to_str()? {
        "py" => Some(Language::Python),
        "js" | "mjs" | "cjs" => Some(Language::JavaScript),
        "sh" => Some(Language::Shell),
        "rb" => Some(Language::Ruby),
        _ => None,
    }
}

/// Builds the execution request from the arguments.
///
/// # Errors
///
/// Returns an error if a file cannot be read or the language is unknown.
pub fn build_request(args: &RunArgs) -> anyhow::Result<ExecutionRequest> {
    let language = args
        .language
        .or_else(|| language_for(&args.file))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "cannot infer language from {}; pass --language",
                args.file.display()
            )
        })?;
    let code = std::fs::read_to_string(&args.file)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", args.file.display()))?;

    let mut request = ExecutionRequest::new(code, language);
    if let Some(timeout) = args.timeout {
        request = request.with_timeout_seconds(timeout);
    }
    if let Some(memory) = args.memory {
        request = request.with_max_memory_mb(memory);
    }
    if let Some(cpu) = args.cpu {
        request = request.with_max_cpu_percent(cpu);
    }
    if args.network || !args.allow_hosts.is_empty() {
        request = request.with_network(args.allow_hosts.iter().cloned());
    }
    for requirement in &args.requirements {
        request = request.with_requirement(requirement.clone());
    }
    for staged in &args.stage {
        let (name, path) = staged
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("--stage expects NAME=PATH, got {staged:?}"))?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read staged file {path}: {e}"))?;
        request = request.with_file(name, content);
    }
    Ok(request)
}

/// Executes the run command.
pub async fn execute(args: &RunArgs, manager: &SafetyManager) -> anyhow::Result<ExitCode> {
    let request = build_request(args)?;
    tracing::info!(
        file = %args.file.display(),
        language = %request.language,
        network = request.network_enabled,
        "running payload"
    );

    let cancel = shared::cancel_on_ctrl_c();
    let result = manager
        .execute_with_cancel(&request, &cancel)
        .await
        .map_err(|e| shared::diagnose(e, "execution refused"))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        output::print_result(&result);
    }

    Ok(match (result.status, result.exit_code) {
        (ExecutionStatus::Success, _) => ExitCode::SUCCESS,
        (_, Some(code)) => ExitCode::from(u8::try_from(code).unwrap_or(1).max(1)),
        (_, None) => ExitCode::from(1),
    })
}
