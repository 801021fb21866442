//! Shared helpers used across CLI commands.
//!
//! Centralises config loading, `SafetyManager` construction and the
//! printing of error diagnostics.

use std::fmt::Display;
use std::path::Path;

use bastion_config::{load_config, BastionConfig};
use bastion_runtime::SafetyManager;
use bastion_types::DiagnosticError;
use tokio_util::sync::CancellationToken;

use crate::output;

/// Loads the layered configuration.
///
/// # Errors
///
/// Returns an error if the file is missing, malformed or fails validation.
pub fn load(path: Option<&Path>) -> anyhow::Result<BastionConfig> {
    load_config(path).map_err(|e| diagnose(e, "configuration error"))
}

/// Builds a `SafetyManager` from the loaded configuration.
///
/// # Errors
///
/// Returns an error if the policies fail validation.
pub fn create_manager(config: &BastionConfig) -> anyhow::Result<SafetyManager> {
    SafetyManager::from_config(config).map_err(|e| diagnose(e, "manager init error"))
}

/// Writes the session audit log to `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn export_audit(manager: &SafetyManager, path: &Path) -> anyhow::Result<()> {
    let written = manager
        .export_audit_log(path)
        .map_err(|e| diagnose(e, "audit export failed"))?;
    output::print_statistics(&manager.statistics());
    output::print_success(&format!(
        "{written} audit entries written to {}",
        path.display()
    ));
    Ok(())
}

/// A token cancelled on the first Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; cancelling execution");
            trigger.cancel();
        }
    });
    token
}

/// Prints the cause and fix for `err` and wraps it for `main`.
pub fn diagnose<E: DiagnosticError + Display>(err: E, context: &str) -> anyhow::Error {
    output::print_diagnostic(err.hint(), err.fix());
    anyhow::anyhow!("{context}: {err}")
}
