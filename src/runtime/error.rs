//! Error types for the Patch runtime
//!
//! Domain errors use thiserror; each subsystem has its own enum and the
//! top-level [`RuntimeError`] folds them together at the embedding boundary.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// RPC channel failures (timeouts, malformed traffic, closed transport)
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Primitive dispatch failures
    #[error("Primitive error: {0}")]
    Primitive(#[from] PrimitiveError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The environment rejected the registered thread bodies
    #[error("Compile error at {position:?}: {message}")]
    Compile {
        /// Compiler message reported by the environment
        message: String,
        /// Statement position, if the environment reported one
        position: Option<usize>,
    },

    /// Target lookup failed
    #[error("Target {0} not found")]
    TargetNotFound(String),

    /// Script lookup failed
    #[error("Script {0} not found")]
    ScriptNotFound(String),
}

impl RuntimeError {
    /// True when the error is fatal to the channel and the environment must be reloaded.
    pub fn is_channel_fatal(&self) -> bool {
        matches!(self, RuntimeError::Channel(err) if err.is_fatal())
    }
}

/// RPC channel errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// A bounded call did not complete in time
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        /// Operation that expired (e.g. "init", "run")
        operation: &'static str,
        /// Deadline that was exceeded
        timeout_ms: u64,
    },

    /// A message could not be decoded
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// The channel was poisoned by an earlier fatal failure
    #[error("Channel poisoned: {0}")]
    Poisoned(String),

    /// The other side went away
    #[error("Channel closed")]
    Closed,
}

impl ChannelError {
    /// Timeouts, malformed traffic and poisoning are fatal; `Closed` is terminal anyway.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ChannelError::Closed)
    }
}

/// Convenience result alias for channel operations
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Primitive execution errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PrimitiveError {
    /// No primitive is registered under the opcode
    #[error("Unknown opcode '{0}'")]
    UnknownOpcode(String),

    /// The primitive's target no longer exists
    #[error("Target {0} not found")]
    TargetNotFound(String),

    /// An argument was missing or had the wrong shape
    #[error("Invalid argument '{name}': {detail}")]
    InvalidArgument {
        /// Argument name
        name: String,
        /// What was wrong with it
        detail: String,
    },
}

/// Convenience result alias for primitive operations
pub type PrimitiveResult<T> = std::result::Result<T, PrimitiveError>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid value
    #[error("Invalid config value: {0}")]
    Invalid(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
