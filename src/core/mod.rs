//! Shared core types.

pub mod error;

pub use error::{AgentError, BusError, CommandError, ConfigError, OsError, Result};
