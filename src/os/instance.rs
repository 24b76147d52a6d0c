//! Single-instance enforcement via a named mutex.
//!
//! The first process to create `PcAgentSingleInstance` owns it for its
//! lifetime; a second invocation sees `ERROR_ALREADY_EXISTS` and exits
//! cleanly. The guard releases the mutex on every exit path through `Drop`.

use crate::core::error::OsError;

#[cfg(windows)]
mod imp {
    use tracing::debug;
    use windows::core::w;
    use windows::Win32::Foundation::{CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, HANDLE};
    use windows::Win32::System::Threading::{CreateMutexW, ReleaseMutex};

    use crate::core::error::OsError;

    /// Holds the named mutex for the process lifetime.
    pub struct SingleInstance {
        handle: HANDLE,
    }

    // The handle is only used for release/close from whichever thread drops
    // the guard; mutex handles are valid process-wide.
    unsafe impl Send for SingleInstance {}

    impl SingleInstance {
        /// Acquire the process-wide named mutex.
        ///
        /// Returns `OsError::AlreadyRunning` if another instance holds it.
        pub fn acquire() -> Result<Self, OsError> {
            unsafe {
                let handle = CreateMutexW(None, true, w!("PcAgentSingleInstance")).map_err(
                    |e| OsError::MutexCreationFailed {
                        reason: e.to_string(),
                    },
                )?;

                if GetLastError() == ERROR_ALREADY_EXISTS {
                    // We still received a handle to the existing mutex.
                    let _ = CloseHandle(handle);
                    return Err(OsError::AlreadyRunning);
                }

                debug!("Single-instance mutex acquired");
                Ok(Self { handle })
            }
        }
    }

    impl Drop for SingleInstance {
        fn drop(&mut self) {
            unsafe {
                let _ = ReleaseMutex(self.handle);
                let _ = CloseHandle(self.handle);
            }
            debug!("Single-instance mutex released");
        }
    }
}

#[cfg(not(windows))]
mod imp {
    use crate::core::error::OsError;

    /// No enforcement off Windows; acquisition always succeeds.
    pub struct SingleInstance;

    impl SingleInstance {
        pub fn acquire() -> Result<Self, OsError> {
            Ok(Self)
        }
    }
}

pub use imp::SingleInstance;

/// True when the error means another instance already holds the mutex.
pub fn is_already_running(err: &OsError) -> bool {
    matches!(err, OsError::AlreadyRunning)
}
