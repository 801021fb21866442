//! Configuration loader (defaults + file + env + explicit overrides).

use std::path::{Path, PathBuf};

use bastion_access::AccessError;
use bastion_types::{BastionError, DiagnosticError, ErrorKind};
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::Serialize;
use thiserror::Error;

use crate::schema::BastionConfig;

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "BASTION_";

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to load or merge configuration.
    #[error("configuration error: {0}")]
    Load(String),
    /// The named config file does not exist.
    #[error("config file not found: {path}")]
    NotFound { path: PathBuf },
    /// The config file extension is not toml, json, yaml or yml.
    #[error("unsupported config format: {path}")]
    UnsupportedFormat { path: PathBuf },
    /// A value was read but is not acceptable.
    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(section: &str, err: AccessError) -> Self {
        let reason = match err {
            AccessError::InvalidConfig { reason } => reason,
            other => other.to_string(),
        };
        Self::Invalid {
            key: section.to_string(),
            reason,
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Load(e.to_string())
    }
}

impl From<ConfigError> for BastionError {
    fn from(e: ConfigError) -> Self {
        let kind = match &e {
            ConfigError::NotFound { .. } => ErrorKind::NotFound,
            _ => ErrorKind::InvalidInput,
        };
        BastionError::new(kind, e.to_string())
    }
}

impl DiagnosticError for ConfigError {
    fn hint(&self) -> Option<String> {
        match self {
            Self::Load(msg) if msg.contains("unknown field") => Some(
                "The configuration contains a key bastion does not recognize. \
                 Unknown keys are rejected rather than ignored."
                    .into(),
            ),
            Self::Load(msg) if msg.contains(ENV_PREFIX) => Some(format!(
                "An environment variable starting with {ENV_PREFIX} could not be applied."
            )),
            Self::NotFound { path } => Some(format!("Nothing exists at '{}'.", path.display())),
            Self::Invalid { key, .. } => Some(format!("'{key}' failed validation at load time.")),
            _ => None,
        }
    }

    fn fix(&self) -> Option<String> {
        match self {
            Self::Load(_) => Some(
                "Check key names against `bastion policy` output; nested env keys use '__' \
                 (e.g. BASTION_NETWORK__RATE_LIMIT=10)."
                    .into(),
            ),
            Self::UnsupportedFormat { .. } => {
                Some("Use a .toml, .json, .yaml or .yml file.".into())
            }
            Self::NotFound { .. } => Some("Pass an existing file to --config.".into()),
            Self::Invalid { .. } => None,
        }
    }
}

/// Builds a [`BastionConfig`] from layered sources.
///
/// Precedence, lowest first: defaults, config file, `BASTION_*` environment
/// variables, explicit overrides.
#[derive(Debug)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env: bool,
    overrides: Figment,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            file: None,
            env: true,
            overrides: Figment::new(),
        }
    }

    /// Reads `path`; the format follows its extension.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Skips the environment layer.
    pub fn without_env(mut self) -> Self {
        self.env = false;
        self
    }

    /// Sets a dotted key (e.g. `network.rate_limit`) above every other layer.
    pub fn set(mut self, key: &str, value: impl Serialize) -> Self {
        self.overrides = self.overrides.merge(Serialized::default(key, value));
        self
    }

    /// Merges every layer into one figment without extracting it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `UnsupportedFormat` for a bad file path.
    pub fn figment(&self) -> Result<Figment, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(BastionConfig::default()));
        if let Some(path) = &self.file {
            figment = merge_file(figment, path)?;
        }
        if self.env {
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }
        Ok(figment.merge(self.overrides.clone()))
    }

    /// Extracts and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for unreadable sources, unknown keys, type
    /// mismatches, or values that fail validation.
    #[tracing::instrument(skip_all, fields(file = ?self.file))]
    pub fn load(&self) -> Result<BastionConfig, ConfigError> {
        let config: BastionConfig = self.figment()?.extract()?;
        config.validate()?;
        tracing::debug!("configuration loaded");
        Ok(config)
    }
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("toml") => Ok(figment.merge(Toml::file(path))),
        Some("json") => Ok(figment.merge(Json::file(path))),
        Some("yaml" | "yml") => Ok(figment.merge(Yaml::file(path))),
        _ => Err(ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}

/// Loads configuration by merging layers:
/// 1. Default values
/// 2. Config file (if given)
/// 3. Environment variables (`BASTION_` prefix, `__` between sections)
pub fn load_config(config_path: Option<&Path>) -> Result<BastionConfig, ConfigError> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = config_path {
        loader = loader.file(path);
    }
    loader.load()
}
