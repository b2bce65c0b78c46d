//! Configuration error types.
//!
//! Every other module owns its own error enum next to the code that raises
//! it; this one covers loading and validating the tool configuration.

use thiserror::Error;

/// Errors that can occur when loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error("invalid configuration: {0}")]
    Deserialize(#[from] Box<figment::Error>),

    /// A value deserialized fine but is unusable.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending key, e.g. `release.bulk_change_threshold`.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Result type alias using [`ConfigError`].
pub type ConfigResult<T> = Result<T, ConfigError>;
