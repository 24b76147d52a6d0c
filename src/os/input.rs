//! Synthetic keyboard input.
//!
//! Injects key events via `keybd_event`. F15 is the benign wake key: it
//! exists on Windows, has no default binding, and registers as user input
//! without disturbing the foreground application.

/// Virtual key codes used by the agent
pub const VK_CONTROL: u8 = 0x11;
pub const VK_F6: u8 = 0x75;
pub const VK_F15: u8 = 0x7E;

#[cfg(windows)]
mod imp {
    use std::time::Duration;

    use windows::Win32::UI::Input::KeyboardAndMouse::{
        keybd_event, KEYBD_EVENT_FLAGS, KEYEVENTF_KEYUP,
    };

    /// Delay between down/up edges so applications register the press
    const EDGE_DELAY: Duration = Duration::from_millis(10);

    /// Press and release a single key.
    pub fn tap_key(vk: u8) {
        unsafe {
            keybd_event(vk, 0, KEYBD_EVENT_FLAGS(0), 0);
            std::thread::sleep(EDGE_DELAY);
            keybd_event(vk, 0, KEYEVENTF_KEYUP, 0);
        }
    }

    /// Press and release a key while holding a modifier.
    pub fn tap_key_with_modifier(modifier: u8, vk: u8) {
        unsafe {
            keybd_event(modifier, 0, KEYBD_EVENT_FLAGS(0), 0);
            std::thread::sleep(EDGE_DELAY);
            keybd_event(vk, 0, KEYBD_EVENT_FLAGS(0), 0);
            std::thread::sleep(EDGE_DELAY);
            keybd_event(vk, 0, KEYEVENTF_KEYUP, 0);
            std::thread::sleep(EDGE_DELAY);
            keybd_event(modifier, 0, KEYEVENTF_KEYUP, 0);
        }
    }
}

#[cfg(not(windows))]
mod imp {
    use tracing::debug;

    pub fn tap_key(vk: u8) {
        debug!("Key injection unavailable on this platform (vk=0x{vk:02X})");
    }

    pub fn tap_key_with_modifier(modifier: u8, vk: u8) {
        debug!(
            "Key injection unavailable on this platform (mod=0x{modifier:02X} vk=0x{vk:02X})"
        );
    }
}

pub use imp::{tap_key, tap_key_with_modifier};
