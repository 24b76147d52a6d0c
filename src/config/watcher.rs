//! Config file watcher for games hot-reload.
//!
//! Watches the config file's parent directory (more reliable than watching
//! the file itself: editors replace files via rename) and triggers a
//! games-only reload on write/create/rename events for the configured file
//! name. Bursts from editors saving in multiple syscalls are debounced.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::ConfigStore;

/// Debounce window for bursts of file events
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches the config file and reloads the games map on change.
pub struct ConfigWatcher {
    /// Keeps the notify backend alive; dropping it stops event delivery.
    _watcher: RecommendedWatcher,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ConfigWatcher {
    /// Start watching `store.path()` for changes.
    ///
    /// The returned watcher must be kept alive; `stop()` joins the
    /// processing task during shutdown.
    pub fn start(
        store: Arc<ConfigStore>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> notify::Result<Self> {
        let path = store.path().to_path_buf();
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| ".".into());
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();

        let (event_tx, mut event_rx) = mpsc::channel::<Event>(32);
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = event_tx.blocking_send(event);
                }
                Err(e) => warn!("Config watcher error: {e}"),
            },
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!("Watching for changes to {}", path.display());

        let task = tokio::spawn(async move {
            let mut last_reload: Option<Instant> = None;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Config watcher stopping");
                        break;
                    }
                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        if !is_relevant(&event, &file_name) {
                            continue;
                        }
                        if let Some(at) = last_reload {
                            if at.elapsed() < RELOAD_DEBOUNCE {
                                debug!("Config change debounced");
                                continue;
                            }
                        }
                        last_reload = Some(Instant::now());
                        info!("Config file changed, reloading games");
                        store.reload_games();
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task: Some(task),
        })
    }

    /// Stop the processing task and wait for it to finish.
    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

/// A write, create or rename event touching the watched file name.
fn is_relevant(event: &Event, file_name: &std::ffi::OsStr) -> bool {
    if !matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Any
    ) {
        return false;
    }
    event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(file_name))
}
