//! Error types for the server, its sessions, and the load driver.
//!
//! Each layer owns its error enum. Session errors stay inside the session
//! thread; only `ServerError` ever reaches the operator.

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// A line could not be transformed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("line is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidUtf8 { valid_up_to: usize },
}

/// Reasons a single session ended abnormally.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transform rejected line: {0}")]
    Transform(#[from] TransformError),

    #[error("line exceeds {limit} bytes without a delimiter")]
    LineTooLong { limit: usize },
}

impl SessionError {
    /// True when the session ended because a socket timeout elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SessionError::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            )
        )
    }
}

/// Server lifecycle errors. These are fatal for the listener.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Listener failed: {0}")]
    Accept(std::io::Error),

    #[error("Operation '{operation}' not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Failed to spawn {what} thread: {source}")]
    Spawn {
        what: &'static str,
        source: std::io::Error,
    },
}

/// Failure of one load-driver request.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("send failed: {0}")]
    Send(std::io::Error),

    #[error("receive failed: {0}")]
    Receive(std::io::Error),

    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),

    #[error("server closed the connection before responding")]
    UnexpectedEof,

    #[error("unexpected response: expected {expected:?}, got {actual:?}")]
    Mismatch { expected: String, actual: String },

    #[error("cannot resolve {0}")]
    Resolve(String),
}

impl LoadError {
    /// Short, stable label used to group failures in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::Connect { .. } => "connect",
            LoadError::Send(_) => "send",
            LoadError::Receive(_) => "receive",
            LoadError::Timeout(_) => "timeout",
            LoadError::UnexpectedEof => "eof",
            LoadError::Mismatch { .. } => "mismatch",
            LoadError::Resolve(_) => "resolve",
        }
    }
}
