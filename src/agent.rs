//! Supervisor: worker lifecycle, shared bus handle, periodic publishers.
//!
//! The bus handle has exactly one canonical copy, behind the supervisor's
//! mutex. Publishers copy the handle out under the lock (checking
//! `connected` in the same window) and publish outside it, so a slow broker
//! never blocks the power-event pump or another worker against the lock.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant};
use tracing::{error, info, warn};

use crate::commands::CommandDispatcher;
use crate::config::{ConfigStore, ConfigWatcher};
use crate::core::error::Result;
use crate::mqtt::{self, Command, MqttHandle};
use crate::os::service::ServiceControl;
use crate::power::{PowerCallbacks, PowerEventListener, WakeHandler};
use crate::sensors::{idle, GameScanner};

/// Retry schedule for the retained `awake` publish after resume; the
/// network needs time to come back after wake.
const RESUME_PUBLISH_DELAYS: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

/// The shared bus handle. `None` once the supervisor has shut the bus down.
type SharedBus = Arc<Mutex<Option<MqttHandle>>>;

/// Copy the handle out under the lock, only while connected.
fn connected_handle(bus: &SharedBus) -> Option<MqttHandle> {
    let guard = bus.lock();
    guard.as_ref().filter(|h| h.is_connected()).cloned()
}

/// The running agent and its workers.
pub struct Agent {
    bus: SharedBus,
    listener: PowerEventListener,
    watcher: Option<ConfigWatcher>,
    shutdown_tx: broadcast::Sender<()>,
    sensor_task: Option<tokio::task::JoinHandle<()>>,
    command_task: Option<tokio::task::JoinHandle<()>>,
}

impl Agent {
    /// Bring up all subsystems in order: config watcher, bus, command pump,
    /// wake handler, power listener, initial state, sensor loop.
    pub async fn start(
        store: Arc<ConfigStore>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Result<Self> {
        let watcher = match ConfigWatcher::start(Arc::clone(&store), shutdown_tx.subscribe()) {
            Ok(w) => Some(w),
            Err(e) => {
                // Startup continues; only hot-reload is lost.
                warn!("Config watcher failed to start: {e}");
                None
            }
        };

        let (handle, command_rx) = mqtt::connect(store.config())?;
        let bus: SharedBus = Arc::new(Mutex::new(Some(handle)));

        let wake = Arc::new(WakeHandler::default());
        let dispatcher = Arc::new(CommandDispatcher::new(Arc::clone(&wake)));
        let command_task = tokio::spawn(run_command_pump(
            dispatcher,
            command_rx,
            shutdown_tx.subscribe(),
        ));

        let mut listener = PowerEventListener::new();
        let callbacks = power_callbacks(Arc::clone(&bus), wake, shutdown_tx.clone());
        listener.start(callbacks, shutdown_tx.subscribe())?;

        // Late subscribers must see the current sleep state immediately.
        if let Some(handle) = connected_handle(&bus) {
            handle.publish_sensor_retained("sleep_state", "awake").await;
        }

        let scanner = Arc::new(GameScanner::new(Arc::clone(&store)));
        let sensor_task = tokio::spawn(run_sensor_loop(
            Arc::clone(&bus),
            scanner,
            Arc::clone(&store),
            shutdown_tx.subscribe(),
        ));

        Ok(Self {
            bus,
            listener,
            watcher,
            shutdown_tx,
            sensor_task: Some(sensor_task),
            command_task: Some(command_task),
        })
    }

    /// Ordered teardown: stop channel, sensor loop, power listener, config
    /// watcher, then the bus under the shared lock.
    pub async fn stop(mut self) {
        info!("Shutting down...");
        let _ = self.shutdown_tx.send(());

        if let Some(task) = self.sensor_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.command_task.take() {
            let _ = task.await;
        }

        // Joins the pump thread; keep the blocking join off the runtime.
        let mut listener = self.listener;
        let listener = tokio::task::spawn_blocking(move || {
            listener.stop();
            listener
        })
        .await;
        drop(listener);

        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }

        // Take the handle under the lock, disconnect outside it.
        let handle = self.bus.lock().take();
        if let Some(handle) = handle {
            handle.disconnect().await;
        }

        info!("PC Agent stopped");
    }
}

/// Build the callbacks the power listener runs from its pump thread.
fn power_callbacks(
    bus: SharedBus,
    wake: Arc<WakeHandler>,
    shutdown_tx: broadcast::Sender<()>,
) -> PowerCallbacks {
    let runtime = tokio::runtime::Handle::current();

    // Suspend is synchronous: the retained `sleeping` state must reach the
    // broker before the OS completes the suspend. The publish itself is
    // bounded to 5s, so the pump thread cannot hang here.
    let sleep_bus = Arc::clone(&bus);
    let sleep_runtime = runtime.clone();
    let on_sleep = Box::new(move || {
        match connected_handle(&sleep_bus) {
            Some(handle) => {
                sleep_runtime.block_on(async {
                    handle.publish_sensor_retained("sleep_state", "sleeping").await;
                });
            }
            None => warn!("Bus not connected at suspend; sleep state not published"),
        }
    });

    // Resume must return quickly: the display wake sequence runs on its own
    // thread and the awake publish retries in a background task.
    let on_wake = Box::new(move || {
        wake.on_wake();
        let task_bus = Arc::clone(&bus);
        let shutdown_rx = shutdown_tx.subscribe();
        runtime.spawn(publish_awake_with_retry(task_bus, shutdown_rx));
    });

    PowerCallbacks { on_sleep, on_wake }
}

/// Publish retained `awake` after resume, retrying while the connection
/// comes back. Aborts immediately on shutdown.
async fn publish_awake_with_retry(bus: SharedBus, mut shutdown_rx: broadcast::Receiver<()>) {
    for delay in RESUME_PUBLISH_DELAYS {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        if let Some(handle) = connected_handle(&bus) {
            handle.publish_sensor_retained("sleep_state", "awake").await;
            info!("Published awake state after wake");
            return;
        }
        info!("MQTT not connected after wake, will retry...");
    }
    warn!("Failed to publish awake state after all retries");
}

/// Periodic publishers for the game, last-active and availability topics.
async fn run_sensor_loop(
    bus: SharedBus,
    scanner: Arc<GameScanner>,
    store: Arc<ConfigStore>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let intervals = &store.config().intervals;
    // Validation rejected negatives; clamp only the zero case.
    let game_period = Duration::from_secs(intervals.game_sensor.max(1) as u64);
    let last_active_period = Duration::from_secs(intervals.last_active.max(1) as u64);
    let availability_period = Duration::from_secs(intervals.availability.max(1) as u64);

    publish_game(&bus, &scanner).await;
    publish_last_active(&bus).await;

    // First tick fires one period from now; the initial publish is done.
    let mut game_tick = interval_at(Instant::now() + game_period, game_period);
    let mut last_active_tick =
        interval_at(Instant::now() + last_active_period, last_active_period);
    let mut availability_tick =
        interval_at(Instant::now() + availability_period, availability_period);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Sensor loop stopping");
                break;
            }
            _ = game_tick.tick() => publish_game(&bus, &scanner).await,
            _ = last_active_tick.tick() => publish_last_active(&bus).await,
            _ = availability_tick.tick() => {
                if let Some(handle) = connected_handle(&bus) {
                    handle.publish_availability(true).await;
                }
            }
        }
    }
}

async fn publish_game(bus: &SharedBus, scanner: &Arc<GameScanner>) {
    // The process snapshot is blocking work; keep it off the runtime.
    let scanner = Arc::clone(scanner);
    let game = tokio::task::spawn_blocking(move || scanner.running_game())
        .await
        .unwrap_or_else(|_| crate::sensors::games::NO_GAME.to_string());

    if let Some(handle) = connected_handle(bus) {
        handle.publish_sensor("runninggames", &game).await;
    }
}

async fn publish_last_active(bus: &SharedBus) {
    let last_active = idle::last_active_time().to_rfc3339();
    if let Some(handle) = connected_handle(bus) {
        handle.publish_sensor("lastactive", &last_active).await;
    }
}

/// Receive bus commands and hand each to a bounded worker.
async fn run_command_pump(
    dispatcher: Arc<CommandDispatcher>,
    mut command_rx: mpsc::Receiver<Command>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            command = command_rx.recv() => {
                let Some(command) = command else { break };
                match dispatcher.try_acquire_slot() {
                    Some(permit) => {
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(async move {
                            // Held for the child's whole lifetime.
                            let _permit = permit;
                            dispatcher.execute(&command.name, &command.payload).await;
                        });
                    }
                    None => {
                        warn!(
                            "Dropping command {}: concurrent command limit reached",
                            command.name
                        );
                    }
                }
            }
        }
    }
}

/// Run the agent on a fresh runtime until the shutdown channel fires.
/// Returns the process exit code; configuration failures are fatal.
pub fn run_blocking(control: Option<&ServiceControl>) -> u32 {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create runtime: {e}");
            return 1;
        }
    };

    runtime.block_on(async {
        let shutdown_tx = crate::os::service::shutdown_channel().clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        let store = match ConfigStore::load_default() {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("Failed to load config: {e}");
                return 1;
            }
        };

        #[cfg(not(windows))]
        tokio::spawn(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                crate::os::service::signal_stop();
            }
        });

        let agent = match Agent::start(store, shutdown_tx).await {
            Ok(agent) => agent,
            Err(e) => {
                error!("Failed to start agent: {e}");
                return 1;
            }
        };

        if let Some(control) = control {
            control.report_running();
        }
        info!("PC Agent running");

        let _ = shutdown_rx.recv().await;
        agent.stop().await;
        0
    })
}
