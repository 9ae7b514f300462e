//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::BalancerConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read at all.
    Read {
        path: String,
        source: std::io::Error,
    },
    /// The file is not valid TOML for the expected schema.
    Parse(toml::de::Error),
    /// The file parsed but fails semantic validation.
    Invalid(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "could not read config at '{}': {}", path, source)
            }
            ConfigError::Parse(e) => write!(f, "could not parse config: {}", e),
            ConfigError::Invalid(errors) => {
                write!(f, "config failed validation ({} problem(s)):", errors.len())?;
                for err in errors {
                    write!(f, " [{}]", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<BalancerConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let config = match toml::from_str::<BalancerConfig>(&raw) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(
                path = %path.display(),
                "Configuration did not match the expected schema"
            );
            return Err(ConfigError::Parse(e));
        }
    };

    if let Err(errors) = validate_config(&config) {
        for error in &errors {
            tracing::error!(path = %path.display(), %error, "Configuration rejected");
        }
        return Err(ConfigError::Invalid(errors));
    }

    tracing::debug!(
        path = %path.display(),
        listeners = config.listeners.len(),
        upstreams = config.upstreams.len(),
        "Configuration loaded"
    );
    Ok(config)
}
