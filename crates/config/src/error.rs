//! Configuration error types

use thiserror::Error;

use tagbus_client::TagError;

/// Errors loading or applying configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// YAML did not parse
    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A tag declaration is unusable
    #[error("tag '{tag}': {reason}")]
    InvalidTag { tag: String, reason: String },

    /// Applying a declaration to the registry failed
    #[error(transparent)]
    Tag(#[from] TagError),
}

impl ConfigError {
    pub(crate) fn invalid(tag: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTag {
            tag: tag.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;
