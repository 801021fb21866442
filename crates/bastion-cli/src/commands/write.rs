//! `bastion write` command.
//!
//! Content comes from `--content`, `--from-file`, or stdin.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;

use bastion_runtime::{FileOp, FileOpOutput, SafetyManager};

use crate::{output, shared};

/// Write a file through the filesystem policy.
#[derive(Debug, Args)]
pub struct WriteArgs {
    /// Destination path; relative paths are resolved against the root.
    pub path: PathBuf,
    /// Inline content.
    #[arg(long, conflicts_with = "from_file")]
    pub content: Option<String>,
    /// Read content from a file ("-" for stdin, the default).
    #[arg(short = 'f', long)]
    pub from_file: Option<String>,
    /// Append instead of truncating.
    #[arg(short, long)]
    pub append: bool,
}

/// Resolves the bytes to write.
///
/// # Errors
///
/// Returns an error if the source file or stdin cannot be read.
pub fn resolve_content(args: &WriteArgs) -> anyhow::Result<Vec<u8>> {
    if let Some(content) = &args.content {
        return Ok(content.as_bytes().to_vec());
    }
    match args.from_file.as_deref() {
        None | Some("-") => {
            let mut buffer = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buffer)
                .map_err(|e| anyhow::anyhow!("failed to read stdin: {e}"))?;
            Ok(buffer)
        }
        Some(path) => {
            std::fs::read(path).map_err(|e| anyhow::anyhow!("failed to read {path}: {e}"))
        }
    }
}

/// Executes the write command.
pub fn execute(args: &WriteArgs, manager: &SafetyManager) -> anyhow::Result<ExitCode> {
    let data = resolve_content(args)?;
    let output = manager
        .file_op(FileOp::Write {
            path: args.path.clone(),
            data,
            append: args.append,
        })
        .map_err(|e| shared::diagnose(e, "write failed"))?;
    if let FileOpOutput::Written(receipt) = output {
        output::print_success(&format!(
            "{} bytes {} {} (sha256 {})",
            receipt.bytes,
            if args.append { "appended to" } else { "written to" },
            receipt.path.display(),
            receipt.sha256
        ));
    }
    Ok(ExitCode::SUCCESS)
}
