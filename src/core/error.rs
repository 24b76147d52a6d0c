//! Error types for the agent.
//!
//! One enum per domain, aggregated into [`AgentError`]. OS callbacks never
//! propagate these; they catch and log (see the power listener).

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Top-level error type
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("OS integration error: {0}")]
    Os(#[from] OsError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    FileNotFound { path: String },

    #[error("Config parse failed: {reason}")]
    ParseFailed { reason: String },

    #[error("config validation failed:\n  - {}", violations.join("\n  - "))]
    Validation { violations: Vec<String> },
}

/// MQTT bus errors
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Invalid broker URL: {url}")]
    InvalidBrokerUrl { url: String },
}

/// OS integration errors
#[derive(Error, Debug)]
pub enum OsError {
    #[error("Another instance is already running")]
    AlreadyRunning,

    #[error("Named mutex creation failed: {reason}")]
    MutexCreationFailed { reason: String },

    #[error("Process snapshot failed: {reason}")]
    SnapshotFailed { reason: String },

    #[error("Worker thread spawn failed: {reason}")]
    ThreadSpawnFailed { reason: String },
}

/// Command execution errors
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to spawn shell: {reason}")]
    SpawnFailed { reason: String },
}
