//! Unified error types for weft

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for weft operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Container errors
    #[error("Container {0} unknown to the orchestrator")]
    UnknownContainer(String),

    #[error("Container {0} not running")]
    NotRunning(String),

    #[error("Container {0} died")]
    ContainerDied(String),

    #[error("Orchestrator query failed: {0}")]
    Orchestrator(String),

    // Network errors
    #[error("Failure during network configuration for {target}:\n{diagnostics}")]
    ConfigurationFailure { target: String, diagnostics: String },

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Required tool '{0}' not found")]
    ToolMissing(String),

    #[error("Invalid CIDR '{value}': {reason}")]
    InvalidCidr { value: String, reason: String },

    #[error("Namespace handle error for {path}: {source}")]
    NamespaceHandle { path: PathBuf, source: io::Error },

    #[error("Invalid link state transition: {0}")]
    StateMachine(String),
}

impl Error {
    /// Whether this error came from an external command step
    ///
    /// Step failures are the ones subject to the died-vs-misconfigured diagnosis.
    pub fn is_step_failure(&self) -> bool {
        matches!(self, Error::CommandFailed { .. } | Error::ToolMissing(_))
    }
}

/// Result type alias for weft operations
pub type Result<T> = std::result::Result<T, Error>;
