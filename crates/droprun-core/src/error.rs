//! Core domain errors.

use thiserror::Error;

/// Core domain errors for droprun.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A required task field is missing or empty.
    #[error("Missing required task field: {0}")]
    MissingField(&'static str),

    /// A proxy string could not be parsed.
    #[error("Invalid proxy: {0}")]
    InvalidProxy(String),

    /// No site driver handles the task's platform.
    #[error("No site driver for platform '{0}'")]
    UnknownPlatform(String),
}

impl CoreError {
    /// Name of the offending task field.
    pub fn field(&self) -> &'static str {
        match self {
            Self::MissingField(field) => *field,
            Self::UnknownPlatform(_) => "platform",
            Self::InvalidProxy(_) => "proxies",
        }
    }
}
