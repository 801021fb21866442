//! Execution requests submitted by orchestration callers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BastionError;

/// Payload language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    /// Python 3.
    Python,
    /// JavaScript on Node.js.
    #[serde(rename = "javascript", alias = "js", alias = "node")]
    JavaScript,
    /// POSIX shell.
    #[serde(alias = "bash", alias = "sh")]
    Shell,
    /// Ruby.
    Ruby,
}

impl Language {
    /// File name the payload is written to inside the working directory.
    pub fn entry_file(&self) -> &'static str {
        match self {
            Self::Python => "main.py",
            Self::JavaScript => "main.js",
            Self::Shell => "main.sh",
            Self::Ruby => "main.rb",
        }
    }

    /// Interpreter binary.
    pub fn interpreter(&self) -> &'static str {
        match self {
            Self::Python => "python3",
            Self::JavaScript => "node",
            Self::Shell => "sh",
            Self::Ruby => "ruby",
        }
    }

    /// Whether an address-space rlimit is safe for this runtime.
    ///
    /// JIT runtimes reserve large virtual regions up front and abort under
    /// `RLIMIT_AS`; those rely on the resource monitor instead.
    pub fn supports_address_space_limit(&self) -> bool {
        !matches!(self, Self::JavaScript)
    }

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::Shell => "shell",
            Self::Ruby => "ruby",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = BastionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Self::Python),
            "javascript" | "js" | "node" => Ok(Self::JavaScript),
            "shell" | "sh" | "bash" => Ok(Self::Shell),
            "ruby" | "rb" => Ok(Self::Ruby),
            other => Err(BastionError::invalid_input(format!(
                "unsupported language: {other}"
            ))),
        }
    }
}

/// A request to run a code payload under isolation.
///
/// Limit fields set to 0 inherit the session ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Source code of the payload.
    pub code: String,
    /// Payload language.
    pub language: Language,
    /// Wall-clock limit in seconds.
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Memory limit in megabytes.
    #[serde(default, rename = "maxMemoryMB")]
    pub max_memory_mb: u64,
    /// CPU limit in percent of one core.
    #[serde(default, rename = "maxCPUPercent")]
    pub max_cpu_percent: u32,
    /// Packages installed into an isolated scope before the run, in order.
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Files staged into the working directory (relative path -> content).
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Whether the payload gets (mediated) network access.
    #[serde(default)]
    pub network_enabled: bool,
    /// Narrows the ambient network policy for this run. Never widens it.
    #[serde(default)]
    pub allowed_hosts: BTreeSet<String>,
}

/// Characters allowed in a requirement specifier.
fn is_requirement_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '-' | '_' | '.' | '=' | '<' | '>' | '!' | '~' | '[' | ']' | ',' | '@' | '/' | '^'
        )
}

impl ExecutionRequest {
    /// Creates a request with session-default limits and no staged files.
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        Self {
            code: code.into(),
            language,
            timeout_seconds: 0,
            max_memory_mb: 0,
            max_cpu_percent: 0,
            requirements: Vec::new(),
            files: BTreeMap::new(),
            network_enabled: false,
            allowed_hosts: BTreeSet::new(),
        }
    }

    /// Sets the wall-clock limit.
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Sets the memory limit.
    pub fn with_max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    /// Sets the CPU limit.
    pub fn with_max_cpu_percent(mut self, percent: u32) -> Self {
        self.max_cpu_percent = percent;
        self
    }

    /// Adds a requirement.
    pub fn with_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.requirements.push(requirement.into());
        self
    }

    /// Stages a file.
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    /// Enables mediated network access restricted to `hosts`.
    pub fn with_network(mut self, hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.network_enabled = true;
        self.allowed_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Structural validation, independent of any policy.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for empty code, absolute or escaping staged
    /// paths, and requirement specifiers that could be read as options.
    pub fn validate(&self) -> Result<(), BastionError> {
        if self.code.trim().is_empty() {
            return Err(BastionError::invalid_input("execution code is empty"));
        }
        for path in self.files.keys() {
            validate_staged_path(path)?;
        }
        for requirement in &self.requirements {
            if requirement.is_empty()
                || requirement.starts_with('-')
                || !requirement.chars().all(is_requirement_char)
            {
                return Err(BastionError::invalid_input(format!(
                    "invalid requirement specifier: {requirement:?}"
                )));
            }
        }
        if !self.allowed_hosts.is_empty() && !self.network_enabled {
            return Err(BastionError::invalid_input(
                "allowed_hosts given but network is not enabled",
            ));
        }
        Ok(())
    }
}

fn validate_staged_path(path: &str) -> Result<(), BastionError> {
    let p = Path::new(path);
    if path.is_empty() || p.is_absolute() || path.starts_with('\\') {
        return Err(BastionError::invalid_input(format!(
            "staged file path must be relative: {path:?}"
        )));
    }
    if p.components().any(|c| matches!(c, Component::ParentDir | Component::Prefix(_))) {
        return Err(BastionError::invalid_input(format!(
            "staged file path escapes the working directory: {path:?}"
        )));
    }
    Ok(())
}
