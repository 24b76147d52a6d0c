//! Service and console entry plumbing.
//!
//! A Windows build first offers itself to the service control manager; when
//! the dispatcher reports `ERROR_FAILED_SERVICE_CONTROLLER_CONNECT` the
//! process is interactive and a console control handler takes over. Both
//! paths feed the same process-wide shutdown channel.

use std::sync::OnceLock;

use tokio::sync::broadcast;

/// Windows service name (`sc create PcAgentService binPath= ...`)
pub const SERVICE_NAME: &str = "PcAgentService";

/// Agent entry invoked from either mode. Receives the service control
/// reporter when running under the SCM, `None` in console mode. Returns the
/// process exit code.
pub type AgentEntry = fn(Option<&ServiceControl>) -> u32;

static SHUTDOWN: OnceLock<broadcast::Sender<()>> = OnceLock::new();

/// The process-wide shutdown channel. Created on first use; every worker
/// subscribes to it and the control handlers send into it.
pub fn shutdown_channel() -> &'static broadcast::Sender<()> {
    SHUTDOWN.get_or_init(|| broadcast::channel(8).0)
}

/// Request a graceful stop. Safe to call from OS callbacks on any thread.
pub fn signal_stop() {
    let _ = shutdown_channel().send(());
}

#[cfg(windows)]
mod imp {
    use std::sync::atomic::{AtomicIsize, AtomicU32, Ordering};
    use std::sync::OnceLock;

    use tracing::{error, info, warn};
    use windows::core::{Error, PCWSTR, PWSTR};
    use windows::Win32::Foundation::ERROR_FAILED_SERVICE_CONTROLLER_CONNECT;
    use windows::Win32::System::Console::{
        SetConsoleCtrlHandler, CTRL_BREAK_EVENT, CTRL_CLOSE_EVENT, CTRL_C_EVENT,
        CTRL_LOGOFF_EVENT, CTRL_SHUTDOWN_EVENT,
    };
    use windows::Win32::System::Services::{
        RegisterServiceCtrlHandlerExW, SetServiceStatus, StartServiceCtrlDispatcherW,
        SERVICE_ACCEPT_SHUTDOWN, SERVICE_ACCEPT_STOP, SERVICE_CONTROL_INTERROGATE,
        SERVICE_CONTROL_SHUTDOWN, SERVICE_CONTROL_STOP, SERVICE_RUNNING, SERVICE_START_PENDING,
        SERVICE_STATUS, SERVICE_STATUS_CURRENT_STATE, SERVICE_STATUS_HANDLE,
        SERVICE_STOPPED, SERVICE_STOP_PENDING, SERVICE_TABLE_ENTRYW, SERVICE_WIN32_OWN_PROCESS,
    };

    use super::{signal_stop, AgentEntry, SERVICE_NAME};

    const ERROR_CALL_NOT_IMPLEMENTED: u32 = 1051;

    static ENTRY: OnceLock<AgentEntry> = OnceLock::new();
    static STATUS_HANDLE: AtomicIsize = AtomicIsize::new(0);
    static SERVICE_EXIT_CODE: AtomicU32 = AtomicU32::new(0);

    /// Reports service state to the SCM. In console mode no reporter exists
    /// and state transitions are no-ops at the call sites.
    pub struct ServiceControl {
        handle: SERVICE_STATUS_HANDLE,
    }

    impl ServiceControl {
        /// Tell the SCM the agent is up and accepting stop/shutdown.
        pub fn report_running(&self) {
            report(
                self.handle,
                SERVICE_RUNNING,
                SERVICE_ACCEPT_STOP | SERVICE_ACCEPT_SHUTDOWN,
            );
        }
    }

    fn report(handle: SERVICE_STATUS_HANDLE, state: SERVICE_STATUS_CURRENT_STATE, accepts: u32) {
        let status = SERVICE_STATUS {
            dwServiceType: SERVICE_WIN32_OWN_PROCESS,
            dwCurrentState: state,
            dwControlsAccepted: accepts,
            dwWin32ExitCode: SERVICE_EXIT_CODE.load(Ordering::Relaxed),
            dwServiceSpecificExitCode: 0,
            dwCheckPoint: 0,
            dwWaitHint: 0,
        };
        unsafe {
            if let Err(e) = SetServiceStatus(handle, &status) {
                warn!("SetServiceStatus failed: {e}");
            }
        }
    }

    /// Run the agent, as a service when launched by the SCM, otherwise in
    /// console mode with a control handler. Returns the process exit code.
    pub fn run(entry: AgentEntry) -> u32 {
        let _ = ENTRY.set(entry);

        let mut name: Vec<u16> = SERVICE_NAME.encode_utf16().chain(std::iter::once(0)).collect();
        let table = [
            SERVICE_TABLE_ENTRYW {
                lpServiceName: PWSTR(name.as_mut_ptr()),
                lpServiceProc: Some(service_main),
            },
            SERVICE_TABLE_ENTRYW::default(),
        ];

        // Blocks for the service lifetime when launched by the SCM.
        match unsafe { StartServiceCtrlDispatcherW(table.as_ptr()) } {
            Ok(()) => SERVICE_EXIT_CODE.load(Ordering::Relaxed),
            Err(e) if is_not_a_service(&e) => run_console(entry),
            Err(e) => {
                error!("Service dispatcher failed: {e}");
                1
            }
        }
    }

    fn is_not_a_service(e: &Error) -> bool {
        e.code() == ERROR_FAILED_SERVICE_CONTROLLER_CONNECT.to_hresult()
    }

    fn run_console(entry: AgentEntry) -> u32 {
        info!("Running in console mode (not as service)");
        info!("To install as service:");
        info!("  sc create {SERVICE_NAME} binPath= \"C:\\path\\to\\pc-agent.exe\"");
        info!("  sc start {SERVICE_NAME}");

        unsafe {
            if let Err(e) = SetConsoleCtrlHandler(Some(console_handler), true) {
                warn!("Failed to install console control handler: {e}");
            }
        }

        entry(None)
    }

    unsafe extern "system" fn service_main(_argc: u32, _argv: *mut PWSTR) {
        let name: Vec<u16> = SERVICE_NAME.encode_utf16().chain(std::iter::once(0)).collect();
        let handle = match RegisterServiceCtrlHandlerExW(
            PCWSTR(name.as_ptr()),
            Some(service_handler),
            None,
        ) {
            Ok(h) => h,
            Err(e) => {
                error!("RegisterServiceCtrlHandlerExW failed: {e}");
                return;
            }
        };
        STATUS_HANDLE.store(handle.0 as isize, Ordering::SeqCst);

        report(handle, SERVICE_START_PENDING, 0);

        let control = ServiceControl { handle };
        let code = match ENTRY.get() {
            Some(entry) => entry(Some(&control)),
            None => 1,
        };
        SERVICE_EXIT_CODE.store(code, Ordering::Relaxed);

        report(handle, SERVICE_STOPPED, 0);
    }

    unsafe extern "system" fn service_handler(
        control: u32,
        _event_type: u32,
        _event_data: *mut core::ffi::c_void,
        _context: *mut core::ffi::c_void,
    ) -> u32 {
        match control {
            SERVICE_CONTROL_STOP | SERVICE_CONTROL_SHUTDOWN => {
                info!("Service stop requested");
                let handle =
                    SERVICE_STATUS_HANDLE(STATUS_HANDLE.load(Ordering::SeqCst) as *mut _);
                report(handle, SERVICE_STOP_PENDING, 0);
                signal_stop();
                0
            }
            SERVICE_CONTROL_INTERROGATE => 0,
            _ => ERROR_CALL_NOT_IMPLEMENTED,
        }
    }

    unsafe extern "system" fn console_handler(
        ctrl_type: u32,
    ) -> windows::Win32::Foundation::BOOL {
        match ctrl_type {
            CTRL_C_EVENT | CTRL_BREAK_EVENT | CTRL_CLOSE_EVENT | CTRL_LOGOFF_EVENT
            | CTRL_SHUTDOWN_EVENT => {
                info!("Console control event {ctrl_type}, shutting down");
                signal_stop();
                true.into()
            }
            _ => false.into(),
        }
    }
}

#[cfg(not(windows))]
mod imp {
    use super::AgentEntry;

    /// No SCM off Windows; state transitions are no-ops.
    pub struct ServiceControl;

    impl ServiceControl {
        pub fn report_running(&self) {}
    }

    /// Console mode only: Ctrl-C wiring happens inside the runtime (see
    /// `agent::run_blocking`).
    pub fn run(entry: AgentEntry) -> u32 {
        entry(None)
    }
}

pub use imp::{run, ServiceControl};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_channel_fans_out() {
        let mut rx1 = shutdown_channel().subscribe();
        let mut rx2 = shutdown_channel().subscribe();
        signal_stop();
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }
}
