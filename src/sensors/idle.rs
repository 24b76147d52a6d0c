//! Idle clock: last user-input time from the OS tick counter.
//!
//! `GetLastInputInfo` reports a 32-bit tick stamp. The difference against
//! the current tick is computed in 32-bit arithmetic so the 49-day wrap
//! cancels out; the result is applied to the wall clock.

use chrono::{DateTime, Utc};

/// Milliseconds of idle time given the 64-bit tick counter and the 32-bit
/// last-input tick. Wrapping subtraction absorbs the 49-day rollover.
pub fn idle_millis(tick_count: u64, last_input_tick: u32) -> u32 {
    (tick_count as u32).wrapping_sub(last_input_tick)
}

/// Wall-clock time of the last user input.
///
/// Degrades to "now" (idle 0) when the OS call fails.
#[cfg(windows)]
pub fn last_active_time() -> DateTime<Utc> {
    use windows::Win32::System::SystemInformation::GetTickCount64;
    use windows::Win32::UI::Input::KeyboardAndMouse::{GetLastInputInfo, LASTINPUTINFO};

    let mut info = LASTINPUTINFO {
        cbSize: std::mem::size_of::<LASTINPUTINFO>() as u32,
        dwTime: 0,
    };

    unsafe {
        if !GetLastInputInfo(&mut info).as_bool() {
            return Utc::now();
        }
        let idle = idle_millis(GetTickCount64(), info.dwTime);
        Utc::now() - chrono::Duration::milliseconds(i64::from(idle))
    }
}

/// Fallback: no idle tracking available, report "now".
#[cfg(not(windows))]
pub fn last_active_time() -> DateTime<Utc> {
    Utc::now()
}

/// Seconds since the last user input.
pub fn idle_seconds() -> i64 {
    (Utc::now() - last_active_time()).num_seconds()
}
