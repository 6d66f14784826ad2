//! Error types for the run controller.
//!
//! The taxonomy mirrors the layers of the system, each defined with `thiserror`:
//!
//! - **`HardwareError`**: raised by the daemon request protocol. A daemon reported a
//!   non-success `error` field, a wait timed out or was cancelled, or the HTTP exchange
//!   itself failed. Ends the current recipe.
//! - **`SerializationError`**: the persistence collaborator could not write a histogram
//!   or job record. Never retried; the supervising loop logs it and keeps running.
//! - **`RunError`**: what a recipe or a job can fail with. Wraps the two errors above
//!   and adds `Aborted`, the synthetic error injected when the operator aborts a job
//!   between recipes.
//!
//! Configuration errors live next to the configuration loader in [`crate::config`].

use crate::experiment::state::JobOutcome;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results produced by the daemon request protocol.
pub type HardwareResult<T> = std::result::Result<T, HardwareError>;

/// Failure while talking to a hardware daemon.
#[derive(Error, Debug)]
pub enum HardwareError {
    /// The daemon answered, but its `error` field was not a success marker.
    #[error("{url}: {message}")]
    Daemon {
        /// Daemon address.
        url: String,
        /// The daemon's `error` field.
        message: String,
    },

    /// No matching completion was observed within the configured bound.
    #[error("{url}: no completion after {after:?}")]
    Timeout {
        /// Daemon address.
        url: String,
        /// Configured bound.
        after: Duration,
    },

    /// The wait was interrupted by a shutdown request.
    #[error("{url}: wait cancelled")]
    Cancelled {
        /// Daemon address.
        url: String,
    },

    /// The HTTP exchange failed (connection refused, non-2xx status, ...).
    #[error("{url}: transport error: {message}")]
    Transport {
        /// Daemon address.
        url: String,
        /// Client error text.
        message: String,
    },

    /// The daemon answered with a body that could not be decoded.
    #[error("{url}: invalid response: {message}")]
    InvalidResponse {
        /// Daemon address.
        url: String,
        /// Decoder error text.
        message: String,
    },

    /// The configured daemon address is not a valid URI.
    #[error("invalid daemon url '{url}'")]
    InvalidUrl {
        /// The rejected address.
        url: String,
    },
}

/// Failure of the persistence collaborator.
#[derive(Error, Debug)]
pub enum SerializationError {
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The job record could not be encoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Writing was attempted before a job folder was selected.
    #[error("no base folder selected")]
    NoBaseFolder,

    /// Used by in-memory test doubles.
    #[error("serializer failure: {0}")]
    Other(String),
}

/// Why a recipe or a job did not complete.
#[derive(Error, Debug)]
pub enum RunError {
    /// A daemon request failed.
    #[error(transparent)]
    Hardware(#[from] HardwareError),

    /// Histogram or record could not be stored.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    /// The recipe cannot be executed as written.
    #[error("Invalid recipe: {0}")]
    InvalidRecipe(String),

    /// The operator aborted the job.
    #[error("Aborted job")]
    Aborted,

    /// The runner was shut down while the job was in progress.
    #[error("Runner shut down")]
    Shutdown,
}

/// A job was refused at enqueue time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("job rejected: {0}")]
pub struct InvalidJob(pub String);

impl RunError {
    /// Classifies the error for the job history.
    pub fn outcome(&self) -> JobOutcome {
        match self {
            RunError::Aborted => JobOutcome::Aborted,
            _ => JobOutcome::Failed,
        }
    }
}
