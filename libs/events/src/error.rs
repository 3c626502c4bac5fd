//! Error types for job payload handling.

use thiserror::Error;

/// Errors that can occur when encoding or decoding jobs and notifications.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The envelope carries no argument.
    #[error("job {job_id} has no arguments")]
    MissingArgument { job_id: String },

    /// The lifecycle transition string is unknown.
    #[error("unknown lifecycle transition: {0}")]
    UnknownTransition(String),

    /// The instance build state string is unknown.
    #[error("unknown instance build state: {0}")]
    UnknownBuildState(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
