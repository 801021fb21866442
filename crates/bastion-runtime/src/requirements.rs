//! Per-execution dependency installation.
//!
//! Requirements go into `<workdir>/.bastion_deps`, never into a host-wide
//! environment, and are removed with the working directory.

use bastion_types::Language;

use crate::error::RuntimeError;

/// Installer command line for `language` installing into `deps_dir`.
///
/// Requirement strings were already checked to contain no option syntax.
///
/// # Errors
///
/// Returns `InvalidRequest` for languages without a package installer.
pub fn installer_argv(
    language: Language,
    deps_dir: &str,
    requirements: &[String],
) -> Result<Vec<String>, RuntimeError> {
    let mut argv: Vec<String> = match language {
        Language::Python => [
            "python3",
            "-m",
            "pip",
            "install",
            "--no-input",
            "--disable-pip-version-check",
            "--no-warn-script-location",
            "--target",
            deps_dir,
        ]
        .map(String::from)
        .to_vec(),
        Language::JavaScript => [
            "npm",
            "install",
            "--no-audit",
            "--no-fund",
            "--ignore-scripts",
            "--prefix",
            deps_dir,
        ]
        .map(String::from)
        .to_vec(),
        Language::Ruby => ["gem", "install", "--no-document", "--install-dir", deps_dir]
            .map(String::from)
            .to_vec(),
        Language::Shell => {
            return Err(RuntimeError::invalid(
                "shell payloads cannot declare requirements",
            ))
        }
    };
    argv.extend(requirements.iter().cloned());
    Ok(argv)
}

/// Environment that makes the payload's interpreter see `deps_dir`.
pub fn deps_env(language: Language, deps_dir: &str) -> Vec<(String, String)> {
    match language {
        Language::Python => vec![("PYTHONPATH".into(), deps_dir.into())],
        Language::JavaScript => vec![("NODE_PATH".into(), format!("{deps_dir}/node_modules"))],
        Language::Ruby => vec![
            ("GEM_HOME".into(), deps_dir.into()),
            ("GEM_PATH".into(), deps_dir.into()),
        ],
        Language::Shell => Vec::new(),
    }
}
