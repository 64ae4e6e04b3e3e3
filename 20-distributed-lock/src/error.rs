//! Error types for the lock service.
//!
//! Every error that can reach a client maps to a short wire reason via
//! `reason()`, which the session worker renders as `ERROR <reason>`.

use thiserror::Error;

/// A request line that could not be turned into a [`crate::protocol::Request`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("{command} requires a {argument} argument")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("invalid lock mode '{0}', expected READ or WRITE")]
    InvalidMode(String),

    #[error("request is not valid UTF-8")]
    InvalidEncoding,

    #[error("request line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
}

impl ProtocolError {
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolError::UnknownCommand(_) => "unknown_command",
            ProtocolError::MissingArgument { .. } => "missing_argument",
            ProtocolError::InvalidMode(_) => "invalid_mode",
            ProtocolError::InvalidEncoding => "invalid_encoding",
            ProtocolError::LineTooLong { .. } => "line_too_long",
        }
    }
}

/// Failures while reading one frame off a connection.
///
/// `Protocol` leaves the stream positioned at the next line, so the
/// connection stays usable; `Io` does not.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failures of the payload store collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource name '{0}' cannot be used as a file name")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the value accessors on the lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("client {client} does not hold a write lock on '{resource}'")]
    NotOwner { resource: String, client: u64 },

    #[error("payload of '{resource}' does not fit on a single reply line")]
    Unframeable { resource: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LockError {
    pub fn reason(&self) -> &'static str {
        match self {
            LockError::NotOwner { .. } => "not_owner",
            LockError::Unframeable { .. } | LockError::Store(_) => "storage_failure",
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
