//! Command dispatcher.
//!
//! Bus messages carry a command name from a fixed vocabulary plus an opaque
//! payload. Anything that reaches the shell goes through the launcher
//! grammar and environment expansion first; the grammar's allow-lists are
//! the only barrier between payloads and PowerShell, so rejected strings
//! are dropped, never dispatched.

pub mod launcher;
pub mod notification;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::core::error::CommandError;
use crate::os::input;
use crate::power::WakeHandler;

use launcher::{expand_launcher_shortcut, expand_windows_env, Shortcut};

/// At most this many command children run at once
pub const MAX_CONCURRENT_COMMANDS: usize = 5;

/// Stuck children are killed after this long
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// PowerShell pipeline dismissing any running screensaver
const DISMISS_SCREENSAVER: &str =
    "Get-Process | Where-Object { $_.Path -like '*.scr' } | Stop-Process -Force -ErrorAction SilentlyContinue";

/// Strings starting with one of these run as-is; anything else needs the
/// call operator.
const CMDLET_PREFIXES: &[&str] = &[
    "Start-Process",
    "Add-Type",
    "Get-",
    "Set-",
    "New-",
    "Remove-",
    "Invoke-",
    "Stop-Process",
];

/// Predefined shell strings for the command vocabulary. Empty entries are
/// dynamic: the payload carries the command.
fn predefined_command(name: &str) -> &'static str {
    match name {
        "SteamLaunch" => "",
        "Screensaver" => r"%windir%\System32\scrnsave.scr /s",
        "Shutdown" => "shutdown -s -t 0",
        "sleep" => "Rundll32.exe powrprof.dll,SetSuspendState 0,1,0",
        "discord_join" => "",
        _ => "",
    }
}

/// Trim whitespace and map the bus-side default press payload to empty.
pub fn normalize_payload(payload: &str) -> &str {
    let payload = payload.trim();
    if payload == "PRESS" || payload == "press" {
        ""
    } else {
        payload
    }
}

/// What to do with a shell-bound command after grammar and expansion.
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Dispatch this string to the shell
    Run(String),
    /// Drop the command, with the reason for the log
    Drop(String),
}

/// Resolve a command name and (normalised) payload into a shell string.
pub fn resolve(command: &str, payload: &str) -> Resolution {
    let mut cmd_str = predefined_command(command).to_string();
    if cmd_str.is_empty() && !payload.is_empty() {
        cmd_str = payload.to_string();
    }
    if cmd_str.is_empty() {
        return Resolution::Drop(format!(
            "no command configured for {command} and no payload provided"
        ));
    }

    match expand_launcher_shortcut(&cmd_str) {
        Shortcut::Expanded(expanded) => cmd_str = expanded,
        Shortcut::Rejected => {
            return Resolution::Drop(format!("launcher shortcut rejected: {cmd_str}"))
        }
        Shortcut::NotShortcut => {}
    }

    cmd_str = expand_windows_env(&cmd_str);
    cmd_str = convert_start_syntax(&cmd_str);

    Resolution::Run(cmd_str)
}

/// Convert cmd.exe `start "" "target"` syntax to `Start-Process "target"`.
fn convert_start_syntax(cmd: &str) -> String {
    if !cmd.to_lowercase().starts_with("start ") {
        return cmd.to_string();
    }
    let parts: Vec<&str> = cmd.splitn(4, '"').collect();
    if parts.len() >= 4 {
        let target = parts[3].trim_end_matches('"');
        return format!("Start-Process \"{target}\"");
    }
    cmd.to_string()
}

/// Wrap a command string for `powershell -Command`: executables get the
/// call operator, cmdlet invocations run as-is.
pub fn to_powershell(cmd: &str) -> String {
    if CMDLET_PREFIXES.iter().any(|p| cmd.starts_with(p)) {
        cmd.to_string()
    } else {
        format!("& {cmd}")
    }
}

/// Executes commands under the concurrency cap.
pub struct CommandDispatcher {
    semaphore: Arc<Semaphore>,
    wake: Arc<WakeHandler>,
}

impl CommandDispatcher {
    pub fn new(wake: Arc<WakeHandler>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_COMMANDS)),
            wake,
        }
    }

    /// Non-blocking slot acquisition; `None` means the cap is reached and
    /// the command must be dropped.
    pub fn try_acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    /// Run one command to completion (bounded by the per-command timeout).
    /// The caller holds the semaphore permit for the duration.
    pub async fn execute(&self, command: &str, payload: &str) {
        let payload = normalize_payload(payload);
        info!("Executing command: {command} (payload: {payload:?})");

        match command {
            "Wake" => {
                if let Err(e) =
                    run_powershell(DISMISS_SCREENSAVER.to_string(), COMMAND_TIMEOUT, "Wake").await
                {
                    warn!("Screensaver dismiss failed: {e}");
                }
                self.wake.on_wake();
            }
            "discord_leave_channel" => {
                // Discord's default disconnect keybind.
                let _ = tokio::task::spawn_blocking(|| {
                    input::tap_key_with_modifier(input::VK_CONTROL, input::VK_F6)
                })
                .await;
            }
            "notification" => {
                if payload.is_empty() {
                    info!("Notification received with empty payload, ignoring");
                    return;
                }
                notification::show(payload).await;
            }
            _ => match resolve(command, payload) {
                Resolution::Drop(reason) => info!("Dropping command {command}: {reason}"),
                Resolution::Run(cmd_str) => {
                    info!("Running: {cmd_str}");
                    if let Err(e) =
                        run_powershell(to_powershell(&cmd_str), COMMAND_TIMEOUT, command).await
                    {
                        warn!("Command {command} failed: {e}");
                    }
                }
            },
        }
    }
}

/// Spawn `powershell -NoProfile -Command <script>` with a hidden window and
/// wait, killing the child when the timeout expires. Non-zero exits are
/// logged, not errors.
#[cfg(windows)]
pub(crate) async fn run_powershell(
    script: String,
    timeout: Duration,
    label: &str,
) -> Result<(), CommandError> {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    let mut child = tokio::process::Command::new("powershell")
        .args(["-NoProfile", "-Command", &script])
        .creation_flags(CREATE_NO_WINDOW)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| CommandError::SpawnFailed {
            reason: e.to_string(),
        })?;

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            if !status.success() {
                warn!("Command {label} finished with {status}");
            }
        }
        Ok(Err(e)) => warn!("Waiting on command {label} failed: {e}"),
        Err(_) => {
            warn!("Command {label} timed out after {timeout:?}, killing process");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
    Ok(())
}

/// No PowerShell off Windows; the dispatch is logged and skipped.
#[cfg(not(windows))]
pub(crate) async fn run_powershell(
    script: String,
    _timeout: Duration,
    label: &str,
) -> Result<(), CommandError> {
    tracing::debug!("PowerShell dispatch unavailable on this platform ({label}): {script}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_press_payloads_to_empty() {
        assert_eq!(normalize_payload("PRESS"), "");
        assert_eq!(normalize_payload("  press  "), "");
        assert_eq!(normalize_payload(" steam:440 "), "steam:440");
        assert_eq!(normalize_payload(""), "");
    }

    #[test]
    fn test_resolve_predefined_shutdown() {
        assert_eq!(
            resolve("Shutdown", ""),
            Resolution::Run("shutdown -s -t 0".to_string())
        );
    }

    #[test]
    fn test_resolve_dynamic_command_uses_payload() {
        assert_eq!(
            resolve("SteamLaunch", "steam:440"),
            Resolution::Run(r#"Start-Process "steam://rungameid/440""#.to_string())
        );
    }

    #[test]
    fn test_resolve_rejected_shortcut_never_reaches_shell() {
        let result = resolve("SteamLaunch", "steam:abc");
        assert!(matches!(result, Resolution::Drop(_)));
    }

    #[test]
    fn test_resolve_rejected_exe_metacharacters() {
        for payload in [
            "exe:C:\\a.exe; calc",
            "exe:C:\\a.exe | calc",
            "exe:C:\\a.exe & calc",
            "exe:$env:TEMP\\x.exe",
            "exe:C:\\a`b.exe",
        ] {
            assert!(
                matches!(resolve("SteamLaunch", payload), Resolution::Drop(_)),
                "payload {payload:?} must be dropped"
            );
        }
    }

    #[test]
    fn test_resolve_without_command_or_payload_drops() {
        assert!(matches!(resolve("SteamLaunch", ""), Resolution::Drop(_)));
        assert!(matches!(resolve("unknown_cmd", ""), Resolution::Drop(_)));
    }

    #[test]
    fn test_resolve_expands_environment() {
        std::env::set_var("PC_AGENT_TEST_DIR", "C:\\Test");
        let result = resolve("SteamLaunch", "%PC_AGENT_TEST_DIR%\\tool.lnk");
        assert_eq!(result, Resolution::Run("C:\\Test\\tool.lnk".to_string()));
    }

    #[test]
    fn test_convert_start_syntax() {
        assert_eq!(
            convert_start_syntax(r#"start "" "https://example.com""#),
            r#"Start-Process "https://example.com""#
        );
        assert_eq!(convert_start_syntax("shutdown -s"), "shutdown -s");
    }

    #[test]
    fn test_to_powershell_prefixes_plain_executables() {
        assert_eq!(
            to_powershell("shutdown -s -t 0"),
            "& shutdown -s -t 0"
        );
        assert_eq!(
            to_powershell("Rundll32.exe powrprof.dll,SetSuspendState 0,1,0"),
            "& Rundll32.exe powrprof.dll,SetSuspendState 0,1,0"
        );
    }

    #[test]
    fn test_to_powershell_keeps_cmdlets_bare() {
        for cmd in [
            "Start-Process notepad",
            "Add-Type -AssemblyName System.Windows.Forms",
            "Get-Process",
            "Stop-Process -Name x",
            "Invoke-Item .",
        ] {
            assert_eq!(to_powershell(cmd), cmd);
        }
    }

    #[test]
    fn test_dispatcher_slot_cap() {
        let dispatcher = CommandDispatcher::new(Arc::new(WakeHandler::default()));

        let permits: Vec<_> = (0..MAX_CONCURRENT_COMMANDS)
            .map(|_| dispatcher.try_acquire_slot().expect("slot available"))
            .collect();
        // Cap reached: the next command would be dropped.
        assert!(dispatcher.try_acquire_slot().is_none());

        drop(permits);
        assert!(dispatcher.try_acquire_slot().is_some());
    }
}
