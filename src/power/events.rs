//! Power-event listener.
//!
//! An invisible native window receives `WM_POWERBROADCAST` on a dedicated
//! OS thread; the window must be created and pumped on that same thread for
//! its whole lifetime. Suspend is delivered synchronously on the pump
//! thread (the OS waits for the window procedure before sleeping), so the
//! sleep callback must stay bounded. Resume callbacks spawn their own
//! workers for anything that may block.
//!
//! A companion watchdog posts a self-addressed heartbeat message and warns
//! when the pump stops answering, which has been observed on some resume
//! paths.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::core::error::OsError;

/// Callbacks invoked from the pump thread.
pub struct PowerCallbacks {
    /// Suspend broadcast; runs synchronously before the OS sleeps.
    pub on_sleep: Box<dyn Fn() + Send + Sync>,
    /// Resume broadcast (automatic or user-triggered); must return quickly.
    pub on_wake: Box<dyn Fn() + Send + Sync>,
}

/// Lifecycle of the message pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PumpState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl PumpState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PumpState::Created,
            1 => PumpState::Running,
            2 => PumpState::Stopping,
            _ => PumpState::Stopped,
        }
    }
}

// Logical power state used to de-duplicate repeated broadcasts: some resume
// paths deliver both PBT_APMRESUMEAUTO and PBT_APMRESUMESUSPEND.
const POWER_AWAKE: u8 = 0;
const POWER_SLEEPING: u8 = 1;

/// State shared between the listener handle, the pump thread and the
/// watchdog. The window handle is published under the mutex once the pump
/// is up.
struct ListenerShared {
    hwnd: Mutex<isize>,
    state: AtomicU8,
    stopped: std::sync::atomic::AtomicBool,
    last_heartbeat: AtomicI64,
    power_state: AtomicU8,
}

impl ListenerShared {
    fn new() -> Self {
        Self {
            hwnd: Mutex::new(0),
            state: AtomicU8::new(PumpState::Created as u8),
            stopped: std::sync::atomic::AtomicBool::new(false),
            last_heartbeat: AtomicI64::new(chrono::Utc::now().timestamp()),
            power_state: AtomicU8::new(POWER_AWAKE),
        }
    }

    /// True only for the call that performed the awake→sleeping transition.
    fn try_transition_to_sleep(&self) -> bool {
        self.power_state
            .compare_exchange(POWER_AWAKE, POWER_SLEEPING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True only for the call that performed the sleeping→awake transition.
    fn try_transition_to_awake(&self) -> bool {
        self.power_state
            .compare_exchange(POWER_SLEEPING, POWER_AWAKE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn store_heartbeat(&self) {
        self.last_heartbeat
            .store(chrono::Utc::now().timestamp(), Ordering::SeqCst);
    }

    fn heartbeat_age_secs(&self) -> i64 {
        chrono::Utc::now().timestamp() - self.last_heartbeat.load(Ordering::SeqCst)
    }
}

/// Owns the pump thread and the heartbeat watchdog.
pub struct PowerEventListener {
    shared: Arc<ListenerShared>,
    pump: Option<std::thread::JoinHandle<()>>,
    watchdog: Option<tokio::task::JoinHandle<()>>,
}

impl PowerEventListener {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ListenerShared::new()),
            pump: None,
            watchdog: None,
        }
    }

    pub fn state(&self) -> PumpState {
        PumpState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Spawn the pump thread and the watchdog task.
    #[cfg(windows)]
    pub fn start(
        &mut self,
        callbacks: PowerCallbacks,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), OsError> {
        let shared = Arc::clone(&self.shared);
        let pump = std::thread::Builder::new()
            .name("power-events".into())
            .stack_size(256 * 1024)
            .spawn(move || imp::run_pump(shared, callbacks))
            .map_err(|e| OsError::ThreadSpawnFailed {
                reason: e.to_string(),
            })?;
        self.pump = Some(pump);

        let shared = Arc::clone(&self.shared);
        self.watchdog = Some(tokio::spawn(imp::watchdog(shared, shutdown_rx)));

        info!("Power event listener started");
        Ok(())
    }

    /// No power broadcasts off Windows; the listener is inert.
    #[cfg(not(windows))]
    pub fn start(
        &mut self,
        _callbacks: PowerCallbacks,
        _shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), OsError> {
        self.shared
            .state
            .store(PumpState::Running as u8, Ordering::SeqCst);
        info!("Power event listener unavailable on this platform");
        Ok(())
    }

    /// Stop the pump and wait for its thread to exit.
    ///
    /// Sets the stopped flag, posts a quit message to the stored window and
    /// joins. Blocking; call off the async runtime.
    pub fn stop(&mut self) {
        self.shared
            .state
            .store(PumpState::Stopping as u8, Ordering::SeqCst);
        self.shared.stopped.store(true, Ordering::SeqCst);

        #[cfg(windows)]
        imp::post_quit(&self.shared);

        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }

        self.shared
            .state
            .store(PumpState::Stopped as u8, Ordering::SeqCst);
        info!("Power event listener stopped");
    }
}

impl Default for PowerEventListener {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(windows)]
mod imp {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::broadcast;
    use tracing::{debug, error, info, warn};
    use windows::core::w;
    use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
    use windows::Win32::UI::WindowsAndMessaging::{
        CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetMessageW,
        GetWindowLongPtrW, PostMessageW, RegisterClassExW, SetWindowLongPtrW, TranslateMessage,
        GWLP_USERDATA, MSG, WINDOW_EX_STYLE, WINDOW_STYLE, WNDCLASSEXW,
    };

    use super::{ListenerShared, PowerCallbacks, PumpState};

    const WM_POWERBROADCAST: u32 = 0x218;
    const WM_QUIT: u32 = 0x12;
    const WM_APP: u32 = 0x8000;
    /// Self-posted heartbeat proving the pump is draining its queue
    pub const WM_APP_HEARTBEAT: u32 = WM_APP + 1;

    const PBT_APMSUSPEND: usize = 4;
    const PBT_APMRESUMESUSPEND: usize = 7;
    const PBT_APMRESUMEAUTO: usize = 0x12;

    /// Heartbeat cadence and the grace allowed before a stall warning
    const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
    const HEARTBEAT_GRACE: Duration = Duration::from_secs(5);
    const STALL_THRESHOLD_SECS: i64 = 70;

    /// Handed to the window procedure through `GWLP_USERDATA`.
    struct PumpContext {
        callbacks: PowerCallbacks,
        shared: Arc<ListenerShared>,
    }

    /// Message pump body. Runs on its dedicated thread until a quit message
    /// arrives or the stopped flag is observed.
    pub fn run_pump(shared: Arc<ListenerShared>, callbacks: PowerCallbacks) {
        unsafe {
            let class_name = w!("PcAgentPowerWindow");

            let wc = WNDCLASSEXW {
                cbSize: std::mem::size_of::<WNDCLASSEXW>() as u32,
                lpfnWndProc: Some(wnd_proc),
                lpszClassName: class_name,
                ..Default::default()
            };
            RegisterClassExW(&wc);

            let hwnd = match CreateWindowExW(
                WINDOW_EX_STYLE::default(),
                class_name,
                w!("PC Agent Power Monitor"),
                WINDOW_STYLE::default(),
                0,
                0,
                0,
                0,
                None,
                None,
                None,
                None,
            ) {
                Ok(h) => h,
                Err(e) => {
                    error!("Failed to create power monitor window: {e}");
                    shared
                        .state
                        .store(PumpState::Stopped as u8, Ordering::SeqCst);
                    return;
                }
            };

            let ctx = Box::into_raw(Box::new(PumpContext {
                callbacks,
                shared: Arc::clone(&shared),
            }));
            SetWindowLongPtrW(hwnd, GWLP_USERDATA, ctx as isize);

            // Publish the handle so stop() and the watchdog can post to us.
            *shared.hwnd.lock() = hwnd.0 as isize;
            shared
                .state
                .store(PumpState::Running as u8, Ordering::SeqCst);
            info!("Power event message pump running (hwnd {:?})", hwnd);

            // Blocks in GetMessageW; zero CPU while idle.
            let mut msg = MSG::default();
            loop {
                let ret = GetMessageW(&mut msg, None, 0, 0);
                if !ret.as_bool() || ret.0 == -1 {
                    break;
                }
                if shared.stopped.load(Ordering::SeqCst) {
                    break;
                }
                let _ = TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
            info!("Power event message pump exiting");

            *shared.hwnd.lock() = 0;
            SetWindowLongPtrW(hwnd, GWLP_USERDATA, 0);
            drop(Box::from_raw(ctx));
            let _ = DestroyWindow(hwnd);
        }
    }

    /// Post a quit message to unblock `GetMessageW`.
    pub fn post_quit(shared: &ListenerShared) {
        let hwnd = *shared.hwnd.lock();
        if hwnd != 0 {
            unsafe {
                let _ = PostMessageW(HWND(hwnd as *mut _), WM_QUIT, WPARAM(0), LPARAM(0));
            }
        }
    }

    unsafe extern "system" fn wnd_proc(
        hwnd: HWND,
        msg: u32,
        wparam: WPARAM,
        lparam: LPARAM,
    ) -> LRESULT {
        let ctx = GetWindowLongPtrW(hwnd, GWLP_USERDATA) as *const PumpContext;

        if !ctx.is_null() {
            let ctx = &*ctx;
            match msg {
                WM_POWERBROADCAST => match wparam.0 {
                    PBT_APMSUSPEND => {
                        if ctx.shared.try_transition_to_sleep() {
                            info!("Power event: SLEEP (PBT_APMSUSPEND)");
                            invoke_callback("on_sleep", &ctx.callbacks.on_sleep);
                        } else {
                            debug!("Ignoring duplicate suspend broadcast");
                        }
                    }
                    PBT_APMRESUMEAUTO | PBT_APMRESUMESUSPEND => {
                        if ctx.shared.try_transition_to_awake() {
                            info!("Power event: WAKE (wparam=0x{:X})", wparam.0);
                            invoke_callback("on_wake", &ctx.callbacks.on_wake);
                        } else {
                            debug!("Ignoring duplicate resume broadcast");
                        }
                    }
                    other => debug!("Power event: unhandled wparam=0x{other:X}"),
                },
                WM_APP_HEARTBEAT => ctx.shared.store_heartbeat(),
                _ => {}
            }
        }

        DefWindowProcW(hwnd, msg, wparam, lparam)
    }

    /// Nothing may escape into the pump thread; a panicking callback is
    /// caught and logged.
    fn invoke_callback(name: &str, callback: &(dyn Fn() + Send + Sync)) {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)).is_err() {
            warn!("Power callback {name} panicked");
        }
    }

    /// Posts a heartbeat every minute and warns when the pump goes quiet.
    pub async fn watchdog(shared: Arc<ListenerShared>, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
            }

            let hwnd = *shared.hwnd.lock();
            if hwnd != 0 {
                unsafe {
                    let _ = PostMessageW(
                        HWND(hwnd as *mut _),
                        WM_APP_HEARTBEAT,
                        WPARAM(0),
                        LPARAM(0),
                    );
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(HEARTBEAT_GRACE) => {}
            }

            if shared.heartbeat_age_secs() > STALL_THRESHOLD_SECS {
                warn!("Power event message pump may be unresponsive (no heartbeat in 70s)");
            }
        }
        tracing::debug!("Heartbeat watchdog stopped");
    }
}
