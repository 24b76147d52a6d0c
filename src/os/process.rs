//! Process enumeration.
//!
//! Wraps the Toolhelp32 snapshot API in a single safe iteration function so
//! no raw handles escape this module. The executable name is lower-cased
//! into a fixed stack buffer; enumeration allocates nothing per process.

use crate::core::error::OsError;

/// Longest executable name we look at (Toolhelp's `szExeFile` is 260 UTF-16
/// units).
pub const MAX_NAME_LEN: usize = 260;

/// Lower-cased ASCII view of a process executable name, backed by a stack
/// buffer. Non-ASCII units are mapped to `?` (patterns are ASCII).
pub struct ProcessName {
    buf: [u8; MAX_NAME_LEN],
    len: usize,
}

impl ProcessName {
    #[cfg_attr(not(windows), allow(dead_code))]
    fn from_utf16(units: &[u16]) -> Self {
        let mut buf = [0u8; MAX_NAME_LEN];
        let mut len = 0;
        for &u in units {
            if u == 0 || len == MAX_NAME_LEN {
                break;
            }
            buf[len] = if u < 0x80 {
                (u as u8).to_ascii_lowercase()
            } else {
                b'?'
            };
            len += 1;
        }
        Self { buf, len }
    }

    #[cfg(not(windows))]
    fn from_str(name: &str) -> Self {
        let mut buf = [0u8; MAX_NAME_LEN];
        let mut len = 0;
        for b in name.bytes() {
            if len == MAX_NAME_LEN {
                break;
            }
            buf[len] = if b.is_ascii() {
                b.to_ascii_lowercase()
            } else {
                b'?'
            };
            len += 1;
        }
        Self { buf, len }
    }

    /// The lower-cased name.
    pub fn as_str(&self) -> &str {
        // Buffer holds ASCII only by construction.
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }

    /// The name with a trailing `.exe` stripped.
    pub fn base_name(&self) -> &str {
        let s = self.as_str();
        s.strip_suffix(".exe").unwrap_or(s)
    }
}

/// Snapshot the running processes and call `f` for each entry until it
/// returns `Some`, yielding that value.
#[cfg(windows)]
pub fn find_map<T>(mut f: impl FnMut(&ProcessName) -> Option<T>) -> Result<Option<T>, OsError> {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
        TH32CS_SNAPPROCESS,
    };

    unsafe {
        let snapshot =
            CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0).map_err(|e| OsError::SnapshotFailed {
                reason: e.to_string(),
            })?;

        let mut entry = PROCESSENTRY32W {
            dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };

        let mut result = None;
        if Process32FirstW(snapshot, &mut entry).is_ok() {
            loop {
                let name = ProcessName::from_utf16(&entry.szExeFile);
                if let Some(value) = f(&name) {
                    result = Some(value);
                    break;
                }
                if Process32NextW(snapshot, &mut entry).is_err() {
                    break;
                }
            }
        }

        let _ = CloseHandle(snapshot);
        Ok(result)
    }
}

/// Non-Windows fallback: enumerate `/proc/<pid>/comm`.
#[cfg(not(windows))]
pub fn find_map<T>(mut f: impl FnMut(&ProcessName) -> Option<T>) -> Result<Option<T>, OsError> {
    let entries = std::fs::read_dir("/proc").map_err(|e| OsError::SnapshotFailed {
        reason: e.to_string(),
    })?;

    for entry in entries.flatten() {
        let path = entry.path();
        let is_pid = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.bytes().all(|b| b.is_ascii_digit()));
        if !is_pid {
            continue;
        }
        if let Ok(comm) = std::fs::read_to_string(path.join("comm")) {
            let name = ProcessName::from_str(comm.trim());
            if let Some(value) = f(&name) {
                return Ok(Some(value));
            }
        }
    }
    Ok(None)
}
