//! Error types for blobmemo
//!
//! All modules use `MemoResult<T>` as their return type.

use crate::runner::FunctionError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for blobmemo operations
pub type MemoResult<T> = Result<T, MemoError>;

/// All errors that can occur in blobmemo
#[derive(Error, Debug)]
pub enum MemoError {
    // Configuration errors
    #[error("Invalid lock configuration: {0}")]
    Configuration(String),

    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Blob store errors
    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Blob already exists: {0}")]
    BlobExists(String),

    #[error("Invalid blob uri {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Blob store error at {uri}: {reason}")]
    Store { uri: String, reason: String },

    // Identity errors
    #[error("Memoized function {function} has no logic key")]
    MissingLogicKey { function: String },

    #[error("Function not registered: {0}")]
    UnknownFunction(String),

    #[error("Invalid arguments for {function}: {reason}")]
    InvalidArguments { function: String, reason: String },

    // Memoization errors
    #[error("{0}")]
    Function(FunctionError),

    #[error("Invocation at {address} was started but never finished")]
    Orphaned { address: String },

    #[error("Corrupt control file {uri}: {reason}")]
    CorruptControlFile { uri: String, reason: String },

    #[error("Shim failed for {address}: {reason}")]
    ShimFailed { address: String, reason: String },

    #[error("Shim returned without recording an outcome for {address}")]
    ShimIncomplete { address: String },

    // Lock errors
    #[error("Lock at {address} was taken over by writer {current}")]
    LockStolen { address: String, current: String },

    #[error("Lock at {address} is held by another writer")]
    LockUnavailable { address: String },

    #[error("Lock windows overlap: {first} and {second}")]
    WindowsOverlap { first: String, second: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl MemoError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a store error for a uri
    pub fn store(uri: impl ToString, reason: impl Into<String>) -> Self {
        Self::Store {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this is the store's not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::BlobNotFound(_))
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Configuration(_) => {
                Some("acquire_margin must be non-negative and less than half of expire")
            }
            Self::MissingLogicKey { .. } => {
                Some("Add a line `function-logic-key: v1` to the function documentation")
            }
            Self::Orphaned { .. } => Some("Run: blobmemo memo invalidate <address>"),
            Self::LockStolen { .. } => Some("Heartbeat more often than the lock expiry"),
            Self::WindowsOverlap { .. } => {
                Some("Check clock skew between hosts against lock.acquire_margin_secs")
            }
            _ => None,
        }
    }
}
