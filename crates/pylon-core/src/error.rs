//! Error types for Pylon components.
//!
//! Construction-time errors ([`ConfigError`], [`ConnectionError`]) abort
//! `init`. [`OperationError`] passes through the middleware chain untouched.
//! [`StatSampleError`] never leaves the stats poller.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::kind::BackendKind;

/// Result type alias for component operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Configuration could not be read or decoded into [`Options`](crate::Options).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{namespace}: failed to decode configuration: {source}")]
    Decode {
        namespace: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Transport-level failure reported by a driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("pool exhausted after waiting {0:?}")]
    PoolExhausted(Duration),

    #[error("connection closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// The connection factory failed to build or verify a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("{kind} {name}: invalid target: {reason}")]
    InvalidTarget {
        kind: BackendKind,
        name: String,
        reason: String,
    },

    #[error("{kind} {name}: failed to open {address}: {source}")]
    Open {
        kind: BackendKind,
        name: String,
        address: String,
        #[source]
        source: DriverError,
    },

    #[error("{kind} {name}: ping {address} failed: {source}")]
    Ping {
        kind: BackendKind,
        name: String,
        address: String,
        #[source]
        source: DriverError,
    },

    #[error("{kind} {name}: ping {address} did not complete within {timeout:?}")]
    PingTimeout {
        kind: BackendKind,
        name: String,
        address: String,
        timeout: Duration,
    },
}

/// A named instance was requested but never registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: instance not found, name: {name}")]
pub struct LookupError {
    pub kind: BackendKind,
    pub name: String,
}

/// A wrapped backend operation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// No matching record. Not counted as a failure by instrumentation.
    #[error("not found")]
    NotFound,

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("operation {0} is not supported by this driver")]
    Unsupported(String),

    /// The connection is unusable; drivers discard it.
    #[error("transport error: {0}")]
    Transport(String),
}

impl OperationError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, OperationError::NotFound)
    }

    /// Whether instrumentation should count this error as a failure.
    pub fn is_failure(&self) -> bool {
        !self.is_not_found()
    }
}

impl From<DriverError> for OperationError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Timeout(after) => OperationError::Timeout(after),
            other => OperationError::Transport(other.to_string()),
        }
    }
}

/// A single pool-stats read failed.
#[derive(Debug, Error)]
pub enum StatSampleError {
    #[error("pool stats unavailable: {0}")]
    Unavailable(String),

    #[error("connection closed")]
    Closed,
}

/// Umbrella error returned by lifecycle operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error("{kind}: instance {name} is already registered")]
    DuplicateInstance { kind: BackendKind, name: String },
}
