//! Error types for the SSL termination proxy controller

use thiserror::Error;

/// Errors raised by the controller and its collaborators
#[derive(Error, Debug)]
pub enum Error {
    /// The certificate authority was unreachable or rejected the request
    #[error("Certificate issuance failed: {0}")]
    IssuanceError(String),

    /// Credential file or state file could not be written or removed
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Proxy configuration could not be rendered, validated or reloaded
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
}

impl Error {
    /// Short label used for log fields and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            Error::IssuanceError(_) => "issuance",
            Error::IoError(_) => "io",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::SerializationError(_) => "serialization",
            Error::YamlError(_) => "yaml",
            Error::TomlError(_) => "toml",
        }
    }

    /// Whether a later pass may succeed without any input changing
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::IssuanceError(_) | Error::IoError(_) | Error::ConfigError(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
