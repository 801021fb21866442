//! `bastion check` command.
//!
//! Validate-only: reports whether the policy would allow an operation,
//! without touching the file or the network.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Subcommand, ValueEnum};

use bastion_access::FileOperation;
use bastion_runtime::{FileOp, FileOpOutput, NetOp, SafetyManager};

use crate::{output, shared};

/// Validate a path or URL against the policy.
#[derive(Debug, Args)]
pub struct CheckArgs {
    #[command(subcommand)]
    pub target: CheckTarget,
}

#[derive(Debug, Subcommand)]
pub enum CheckTarget {
    /// Check a filesystem path.
    Path {
        path: PathBuf,
        /// Operation to check.
        #[arg(short, long, value_enum, default_value = "read")]
        operation: Operation,
    },
    /// Check a URL (no DNS lookup, no connection).
    Url { url: String },
}

/// File operation accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Operation {
    Read,
    Write,
    Append,
    Delete,
    List,
}

impl From<Operation> for FileOperation {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Read => FileOperation::Read,
            Operation::Write => FileOperation::Write,
            Operation::Append => FileOperation::Append,
            Operation::Delete => FileOperation::Delete,
            Operation::List => FileOperation::List,
        }
    }
}

/// Executes the check command. A denial exits with status 1.
pub async fn execute(args: &CheckArgs, manager: &SafetyManager) -> anyhow::Result<ExitCode> {
    let verdict = match &args.target {
        CheckTarget::Path { path, operation } => manager
            .file_op(FileOp::Check {
                path: path.clone(),
                operation: (*operation).into(),
            })
            .map(|out| match out {
                FileOpOutput::Checked(resolved) => format!("allowed: {}", resolved.display()),
                _ => "allowed".to_string(),
            }),
        CheckTarget::Url { url } => manager
            .net_op(NetOp::CheckUrl { url: url.clone() })
            .await
            .map(|_| format!("allowed: {url}")),
    };
    match verdict {
        Ok(message) => {
            output::print_success(&message);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            let err = shared::diagnose(e, "denied");
            output::print_error(&err.to_string());
            Ok(ExitCode::FAILURE)
        }
    }
}
