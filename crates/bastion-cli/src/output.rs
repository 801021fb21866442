//! Output formatting for CLI responses.

use bastion_runtime::Statistics;
use bastion_types::{ExecutionResult, ExecutionStatus};

/// Prints a success message.
pub fn print_success(message: &str) {
    println!("[OK] {message}");
}

/// Prints an error message.
pub fn print_error(message: &str) {
    eprintln!("[ERROR] {message}");
}

/// Prints a warning.
pub fn print_warning(message: &str) {
    eprintln!("[WARN] {message}");
}

/// Prints a cause/fix pair under an error.
pub fn print_diagnostic(hint: Option<String>, fix: Option<String>) {
    if let Some(hint) = hint {
        eprintln!("\n  Cause: {hint}");
    }
    if let Some(fix) = fix {
        eprintln!("  Fix:   {fix}\n");
    }
}

/// Prints a payload's output the way the payload would have: stdout to
/// stdout, stderr to stderr, then a one-line status.
pub fn print_result(result: &ExecutionResult) {
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if result.stdout_truncated {
        print_warning("stdout truncated at the output limit");
    }
    if result.stderr_truncated {
        print_warning("stderr truncated at the output limit");
    }
    for warning in &result.warnings {
        print_warning(warning);
    }
    for rejected in &result.files_rejected {
        print_warning(&format!("removed policy-violating output file {rejected}"));
    }
    let summary = format!(
        "{} in {} ms (peak {:.1} MB, {:.0}% CPU)",
        result.status.as_str(),
        result.execution_time_ms,
        result.peak_memory_mb,
        result.peak_cpu_percent
    );
    match (&result.status, &result.error_message) {
        (ExecutionStatus::Success, _) => tracing::info!("{summary}"),
        (_, Some(message)) => print_error(&format!("{summary}: {message}")),
        (_, None) => print_error(&summary),
    }
}

/// Prints session counters.
pub fn print_statistics(stats: &Statistics) {
    tracing::debug!(
        total = stats.total_ops,
        allowed = stats.allowed,
        denied = stats.denied,
        restricted = stats.restricted,
        errors = stats.errors,
        files_created = stats.files_created,
        bytes_transferred = stats.bytes_transferred,
        "session statistics"
    );
}
