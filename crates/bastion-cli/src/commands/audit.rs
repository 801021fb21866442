//! `bastion audit` command.
//!
//! Reads a JSON audit export (see `--export-audit`) and prints a summary
//! plus the entries matching the filters.

use std::path::PathBuf;

use clap::{Args, ValueEnum};

use bastion_types::{AuditLogEntry, AuditResult};

/// Decision filter accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResultFilter {
    Allowed,
    Denied,
    Restricted,
    Error,
}

impl From<ResultFilter> for AuditResult {
    fn from(r: ResultFilter) -> Self {
        match r {
            ResultFilter::Allowed => AuditResult::Allowed,
            ResultFilter::Denied => AuditResult::Denied,
            ResultFilter::Restricted => AuditResult::Restricted,
            ResultFilter::Error => AuditResult::Error,
        }
    }
}

/// Summarize or filter an exported audit log.
#[derive(Debug, Args)]
pub struct AuditArgs {
    /// JSON file written by `--export-audit`.
    pub file: PathBuf,
    /// Only entries with this decision.
    #[arg(short, long, value_enum)]
    pub result: Option<ResultFilter>,
    /// Only entries for this operation (e.g. write, http_get, exec).
    #[arg(short, long)]
    pub operation: Option<String>,
    /// Only entries for this execution id.
    #[arg(short, long)]
    pub execution: Option<String>,
    /// Print matching entries as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Loads an exported audit log.
///
/// # Errors
///
/// Returns an error if the file is unreadable or not an audit export.
pub fn load(path: &std::path::Path) -> anyhow::Result<Vec<AuditLogEntry>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&text)
        .map_err(|e| anyhow::anyhow!("{} is not an audit export: {e}", path.display()))
}

/// Entries that pass every filter in `args`.
pub fn select<'a>(args: &AuditArgs, entries: &'a [AuditLogEntry]) -> Vec<&'a AuditLogEntry> {
    entries
        .iter()
        .filter(|e| args.result.map_or(true, |r| e.result == AuditResult::from(r)))
        .filter(|e| {
            args.operation
                .as_deref()
                .map_or(true, |op| e.operation.as_str() == op)
        })
        .filter(|e| {
            args.execution
                .as_deref()
                .map_or(true, |id| e.execution_id.as_deref() == Some(id))
        })
        .collect()
}

/// Executes the audit command.
pub fn execute(args: &AuditArgs) -> anyhow::Result<()> {
    let entries = load(&args.file)?;
    let selected = select(args, &entries);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&selected)?);
        return Ok(());
    }

    let count = |r: AuditResult| entries.iter().filter(|e| e.result == r).count();
    println!("Audit log {}", args.file.display());
    println!("{}", "─".repeat(40));
    println!("  Entries    : {}", entries.len());
    println!("  Allowed    : {}", count(AuditResult::Allowed));
    println!("  Denied     : {}", count(AuditResult::Denied));
    println!("  Restricted : {}", count(AuditResult::Restricted));
    println!("  Errors     : {}", count(AuditResult::Error));
    println!();
    for entry in selected {
        println!(
            "{} {:<10} {:<20} {}{}",
            entry.timestamp.to_rfc3339(),
            format!("{:?}", entry.result).to_uppercase(),
            entry.operation.as_str(),
            entry.target,
            entry
                .error_message
                .as_deref()
                .map(|m| format!("  ({m})"))
                .unwrap_or_default()
        );
    }
    Ok(())
}
