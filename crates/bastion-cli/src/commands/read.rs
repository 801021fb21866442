//! `bastion read` command.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;

use bastion_runtime::{FileOp, FileOpOutput, SafetyManager};

use crate::shared;

/// Read a file through the filesystem policy.
#[derive(Debug, Args)]
pub struct ReadArgs {
    /// Path to read; relative paths are resolved against the root.
    pub path: PathBuf,
}

/// Executes the read command, copying the file to stdout.
pub fn execute(args: &ReadArgs, manager: &SafetyManager) -> anyhow::Result<ExitCode> {
    let output = manager
        .file_op(FileOp::Read {
            path: args.path.clone(),
        })
        .map_err(|e| shared::diagnose(e, "read failed"))?;
    if let FileOpOutput::Data(bytes) = output {
        std::io::stdout().write_all(&bytes)?;
    }
    Ok(ExitCode::SUCCESS)
}
