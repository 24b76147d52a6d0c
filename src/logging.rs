//! Logging initialisation.
//!
//! Console mode writes compact output to stdout; service mode (no console
//! attached) writes to a daily-rolling file next to the executable.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Where log output goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    /// Compact output to stdout (interactive console)
    Console,
    /// Daily-rolling `pc-agent.log.*` files next to the executable (service mode)
    File,
}

/// Initialise the global tracing subscriber.
///
/// Returns a guard that must be kept alive for the lifetime of the process
/// when file output is used; dropping it flushes and stops the writer.
pub fn init(output: LogOutput) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match output {
        LogOutput::Console => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .compact()
                .init();
            None
        }
        LogOutput::File => {
            let dir = log_directory();
            let appender = tracing_appender::rolling::daily(dir, "pc-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
    }
}

/// Log directory: next to the executable, falling back to the working dir.
fn log_directory() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}
