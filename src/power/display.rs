//! Display wake-up after resume.
//!
//! Some firmware drops the first monitor-power command after a cold wake
//! (seen with Wake-on-LAN), so the resume path retries the sequence. The
//! sleep-inhibit window afterwards keeps the machine up long enough for the
//! user to reach it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::os::input;

/// How long the machine is kept awake after a wake sequence
const INHIBIT_WINDOW: Duration = Duration::from_secs(30);

/// Settle delay between monitor-on and the keypress
const SETTLE_DELAY: Duration = Duration::from_millis(100);

// One pending inhibit-release worker at a time; redundant requests are
// idempotent while the flag is held.
#[cfg(windows)]
static INHIBIT_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Run the wake sequence once: monitor-on broadcast, benign keypress,
/// sleep-inhibit window.
pub fn wake_display() {
    info!("WakeDisplay: initiating display wake sequence");
    turn_on_monitor();
    input::tap_key(input::VK_F15);
    inhibit_sleep_for(INHIBIT_WINDOW);
    info!("WakeDisplay: wake sequence completed");
}

/// Run the wake sequence with retries, `delay_between` apart. A single
/// inhibit window follows the last attempt.
pub fn wake_display_with_retry(max_attempts: usize, delay_between: Duration) {
    let attempts = max_attempts.max(1);
    info!("WakeDisplay: starting wake sequence with {attempts} attempts");

    for attempt in 1..=attempts {
        turn_on_monitor();
        std::thread::sleep(SETTLE_DELAY);
        input::tap_key(input::VK_F15);

        if attempt < attempts {
            std::thread::sleep(delay_between);
        }
    }

    inhibit_sleep_for(INHIBIT_WINDOW);
    info!("WakeDisplay: wake sequence completed");
}

/// Broadcast `SC_MONITORPOWER` on to every top-level window.
#[cfg(windows)]
fn turn_on_monitor() {
    use windows::Win32::Foundation::{LPARAM, WPARAM};
    use windows::Win32::UI::WindowsAndMessaging::{SendMessageW, HWND_BROADCAST};

    const WM_SYSCOMMAND: u32 = 0x0112;
    const SC_MONITORPOWER: usize = 0xF170;
    const MONITOR_ON: isize = -1;

    unsafe {
        SendMessageW(
            HWND_BROADCAST,
            WM_SYSCOMMAND,
            WPARAM(SC_MONITORPOWER),
            LPARAM(MONITOR_ON),
        );
    }
}

#[cfg(not(windows))]
fn turn_on_monitor() {
    tracing::debug!("Monitor power control unavailable on this platform");
}

/// Hold the system+display execution state for `duration`, then clear it.
///
/// The state is thread-local at the OS level: the worker thread that raises
/// it is the one that clears it, and the guard flag is released only after
/// the clear call returns.
#[cfg(windows)]
fn inhibit_sleep_for(duration: Duration) {
    use windows::Win32::System::Power::{
        SetThreadExecutionState, ES_CONTINUOUS, ES_DISPLAY_REQUIRED, ES_SYSTEM_REQUIRED,
        EXECUTION_STATE,
    };

    if INHIBIT_ACTIVE
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    let spawned = std::thread::Builder::new()
        .name("sleep-inhibit".into())
        .stack_size(64 * 1024)
        .spawn(move || unsafe {
            let ret =
                SetThreadExecutionState(ES_CONTINUOUS | ES_SYSTEM_REQUIRED | ES_DISPLAY_REQUIRED);
            if ret == EXECUTION_STATE::default() {
                INHIBIT_ACTIVE.store(false, Ordering::SeqCst);
                return;
            }

            std::thread::sleep(duration);

            SetThreadExecutionState(ES_CONTINUOUS);
            INHIBIT_ACTIVE.store(false, Ordering::SeqCst);
            info!("WakeDisplay: sleep inhibit ended");
        });

    if let Err(e) = spawned {
        error!("Failed to spawn sleep inhibit thread: {e}");
        INHIBIT_ACTIVE.store(false, Ordering::SeqCst);
    }
}

#[cfg(not(windows))]
fn inhibit_sleep_for(_duration: Duration) {
    tracing::debug!("Sleep inhibit unavailable on this platform");
}

/// Drives the wake sequence on resume, dropping overlapping requests.
pub struct WakeHandler {
    attempts: usize,
    attempt_delay: Duration,
    initial_delay: Duration,
    running: AtomicBool,
}

impl WakeHandler {
    pub fn new(attempts: usize, attempt_delay: Duration, initial_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            attempt_delay,
            initial_delay,
            running: AtomicBool::new(false),
        }
    }

    /// Trigger the wake sequence on a worker thread.
    ///
    /// Re-entrancy: a non-blocking attempt on the running flag; while one
    /// sequence is in flight further calls are dropped.
    pub fn on_wake(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Wake sequence already running, dropping request");
            return;
        }

        let handler = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("display-wake".into())
            .stack_size(128 * 1024)
            .spawn(move || {
                // Let the system stabilise after resume before poking it.
                if !handler.initial_delay.is_zero() {
                    std::thread::sleep(handler.initial_delay);
                }
                wake_display_with_retry(handler.attempts, handler.attempt_delay);
                handler.running.store(false, Ordering::SeqCst);
            });

        if let Err(e) = spawned {
            error!("Failed to spawn display wake thread: {e}");
            self.running.store(false, Ordering::SeqCst);
        }
    }

    /// True while a wake sequence is in flight.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Default for WakeHandler {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(1))
    }
}
