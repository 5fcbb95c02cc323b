//! Error types for protos-db
//!
//! Clear error messages with actionable guidance. Three families:
//! usage errors (mistakes in an experiment definition or configuration),
//! step failures (a protocol function raised), and storage failures.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// protos-db error types
#[derive(Error, Debug)]
pub enum Error {
    /// A step consumed a token whose producing step has not run yet
    #[error("Inverted dependency: step '{step}' consumes token {token}, but no step registered before it produces that token")]
    InvertedDependency {
        /// Name of the consuming step
        step: String,
        /// Token id that could not be resolved
        token: usize,
    },

    /// A step returned something that does not satisfy the bundle shape
    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),

    /// No storage adapter is registered under the requested name
    #[error("Unknown storage adapter '{name}' (available: {available})")]
    UnknownAdapter {
        /// Requested adapter name
        name: String,
        /// Comma-separated list of registered names
        available: String,
    },

    /// No protocol is registered under the requested dotted name
    #[error("Unknown protocol '{0}'")]
    UnknownProtocol(String),

    /// A protocol name was registered twice
    #[error("Protocol '{0}' is already registered")]
    DuplicateProtocol(String),

    /// A file added to a bundle does not exist
    #[error("No file '{}' to add to bundle", .0.display())]
    MissingFile(PathBuf),

    /// Configuration value is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A protocol function raised; the experiment run was aborted
    #[error("Step '{step}' (token {token}) failed: {source}")]
    StepFailed {
        /// Name of the failing step
        step: String,
        /// Token id of the failing step
        token: usize,
        /// The error raised by the protocol function
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The backend connection is gone (eligible for one reconnect-and-retry)
    #[error("Storage connection lost: {0}")]
    ConnectionLost(String),

    /// The backend failed again after reconnecting
    #[error("Storage failed after reconnect: {0}\nThe backend is unreachable; check `storage_server`.")]
    StorageFatal(String),

    /// Generic storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Experiment or bundle does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persisted record is malformed
    #[error("Corrupted record: {0}")]
    Corrupted(String),

    /// An id that must be unique matched several records
    #[error("Non-unique id detected: '{0}'\nStored results cannot be trusted. Please report this issue.")]
    NonUniqueId(String),

    /// Timestamp did not follow the `YYYY-MM-DD_HH-MM-SS-ffffff_UTC` layout
    #[error("Timestamp parse error: {0}")]
    Timestamp(#[from] chrono::ParseError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite error
    #[cfg(feature = "relational")]
    #[error("SQLite error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    /// Configuration could not be loaded
    #[error("Config error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl Error {
    /// Whether this error signals a dropped backend connection.
    #[must_use]
    pub const fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }

    /// Whether this error is a usage error in the experiment definition or configuration.
    #[must_use]
    pub const fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::InvertedDependency { .. }
                | Self::InvalidBundle(_)
                | Self::UnknownAdapter { .. }
                | Self::UnknownProtocol(_)
                | Self::DuplicateProtocol(_)
                | Self::MissingFile(_)
                | Self::InvalidConfig(_)
        )
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

#[cfg(feature = "relational")]
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    ErrorCode::CannotOpen | ErrorCode::SystemIoFailure
                ) =>
            {
                Self::ConnectionLost(err.to_string())
            }
            _ => Self::Sqlite(err),
        }
    }
}
