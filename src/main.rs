//! PC Agent entry point.
//!
//! Exit codes: 0 on clean shutdown and on second-instance detection,
//! non-zero on configuration failure.

use std::io::IsTerminal;
use std::process::ExitCode;

use tracing::{error, info};

use pc_agent::logging::{self, LogOutput};
use pc_agent::os::instance::{self, SingleInstance};
use pc_agent::os::service::{self, ServiceControl};

fn main() -> ExitCode {
    // Services and detached launches have no console; log to file there.
    let output = if std::io::stdout().is_terminal() {
        LogOutput::Console
    } else {
        LogOutput::File
    };
    let _log_guard = logging::init(output);

    info!("PC Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let _instance = match SingleInstance::acquire() {
        Ok(guard) => guard,
        Err(e) if instance::is_already_running(&e) => {
            info!("Another instance is already running, exiting");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            error!("Single-instance guard failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Blocks for the agent lifetime, as a service or in console mode.
    let code = service::run(agent_entry);
    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn agent_entry(control: Option<&ServiceControl>) -> u32 {
    pc_agent::agent::run_blocking(control)
}
