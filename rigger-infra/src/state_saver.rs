//! Forwards every write of a runner's state file to its destinations
//!
//! The watcher is placed on the parent directory because the utility may
//! replace the state file instead of writing it in place.

use crate::runner::cache::StateCache;
use async_trait::async_trait;
use futures::future::join_all;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use rigger_core::error::{RiggerError, RiggerResult};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[async_trait]
pub trait SaveDestination: Send + Sync {
    async fn save_state(&self, data: &[u8]) -> RiggerResult<()>;
}

/// Keeps the runner's entry in the local state cache current
pub struct CacheDestination {
    cache: Arc<dyn StateCache>,
    name: String,
}

impl CacheDestination {
    pub fn new(cache: Arc<dyn StateCache>, name: impl Into<String>) -> Self {
        Self {
            cache,
            name: name.into(),
        }
    }
}

#[async_trait]
impl SaveDestination for CacheDestination {
    async fn save_state(&self, data: &[u8]) -> RiggerResult<()> {
        // The runner's state file may be the cache entry itself.
        if self.cache.in_cache(&self.name)? && self.cache.load(&self.name)? == data {
            return Ok(());
        }
        self.cache.save(&self.name, data)
    }
}

/// Collects every saved state in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryDestination {
    saved: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<Vec<u8>> {
        self.saved.lock().clone()
    }
}

#[async_trait]
impl SaveDestination for MemoryDestination {
    async fn save_state(&self, data: &[u8]) -> RiggerResult<()> {
        self.saved.lock().push(data.to_vec());
        Ok(())
    }
}

struct Running {
    _watcher: RecommendedWatcher,
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

pub struct StateSaver {
    destinations: Arc<RwLock<Vec<Arc<dyn SaveDestination>>>>,
    running: tokio::sync::Mutex<Option<Running>>,
    started: std::sync::atomic::AtomicBool,
    done_tx: watch::Sender<bool>,
}

impl StateSaver {
    pub fn new(destinations: Vec<Arc<dyn SaveDestination>>) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            destinations: Arc::new(RwLock::new(destinations)),
            running: tokio::sync::Mutex::new(None),
            started: std::sync::atomic::AtomicBool::new(false),
            done_tx,
        }
    }

    pub fn add_destinations(&self, destinations: Vec<Arc<dyn SaveDestination>>) {
        self.destinations.write().extend(destinations);
    }

    pub fn has_destinations(&self) -> bool {
        !self.destinations.read().is_empty()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Start watching `state_path`. Does nothing without destinations.
    pub async fn start(&self, state_path: &Path) -> RiggerResult<()> {
        if !self.has_destinations() {
            return Ok(());
        }

        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let dir = state_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = state_path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| {
                RiggerError::validation("state_path", format!("{} has no file name", state_path.display()))
            })?;

        let (event_tx, event_rx) = mpsc::channel::<Event>(100);
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);

        let mut watcher = notify::recommended_watcher(move |event: Result<Event, notify::Error>| {
            if let Ok(event) = event {
                let _ = event_tx.blocking_send(event);
            }
        })
        .map_err(|e| RiggerError::internal(format!("Failed to create state file watcher: {}", e)))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| RiggerError::internal(format!("Failed to watch {}: {}", dir.display(), e)))?;

        self.done_tx.send_replace(false);
        let task = tokio::spawn(save_loop(
            event_rx,
            stop_rx,
            state_path.to_path_buf(),
            file_name,
            self.destinations.clone(),
            self.done_tx.clone(),
        ));

        *running = Some(Running {
            _watcher: watcher,
            stop_tx,
            task,
        });
        self.started
            .store(true, std::sync::atomic::Ordering::SeqCst);
        debug!(state = %state_path.display(), "State saver started");
        Ok(())
    }

    /// Close the watcher and wait until queued writes are saved.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let Running {
            _watcher,
            stop_tx,
            task,
        } = running;
        drop(_watcher);
        let _ = stop_tx.send(()).await;
        if let Err(e) = task.await {
            error!("State saver task failed: {}", e);
        }
    }

    /// Resolves once the saver has drained after a stop.
    pub async fn done(&self) {
        let mut rx = self.done_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

async fn save_loop(
    mut events: mpsc::Receiver<Event>,
    mut stop: mpsc::Receiver<()>,
    state_path: PathBuf,
    file_name: OsString,
    destinations: Arc<RwLock<Vec<Arc<dyn SaveDestination>>>>,
    done: watch::Sender<bool>,
) {
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                if is_state_write(&event, &file_name) {
                    save(&state_path, &destinations).await;
                }
            }
            _ = stop.recv() => break,
        }
    }

    while let Ok(event) = events.try_recv() {
        if is_state_write(&event, &file_name) {
            save(&state_path, &destinations).await;
        }
    }

    done.send_replace(true);
    debug!(state = %state_path.display(), "State saver stopped");
}

fn is_state_write(event: &Event, file_name: &OsString) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

async fn save(state_path: &Path, destinations: &RwLock<Vec<Arc<dyn SaveDestination>>>) {
    let data = match tokio::fs::read(state_path).await {
        Ok(data) if !data.is_empty() => data,
        Ok(_) => return,
        Err(e) => {
            error!(state = %state_path.display(), "Cannot read state file: {}", e);
            return;
        }
    };

    let targets: Vec<_> = destinations.read().clone();
    let results = join_all(targets.iter().map(|d| d.save_state(&data))).await;
    for result in results {
        if let Err(e) = result {
            error!(state = %state_path.display(), "Cannot save infrastructure state: {}", e);
        }
    }
    info!(state = %state_path.display(), "Infrastructure state saved");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_writes_reach_destinations() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("base-infrastructure.tfstate");
        std::fs::write(&state, b"").unwrap();

        let memory = MemoryDestination::new();
        let saver = StateSaver::new(vec![Arc::new(memory.clone())]);
        saver.start(&state).await.unwrap();
        assert!(saver.is_started());

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&state, br#"{"version":4}"#).unwrap();

        for _ in 0..50 {
            if !memory.saved().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        saver.stop().await;
        saver.done().await;

        let saved = memory.saved();
        assert!(!saved.is_empty());
        assert_eq!(saved.last().unwrap(), br#"{"version":4}"#);
    }

    #[tokio::test]
    async fn test_without_destinations_does_not_start() {
        let dir = tempfile::tempdir().unwrap();
        let saver = StateSaver::new(Vec::new());
        saver.start(&dir.path().join("x.tfstate")).await.unwrap();
        assert!(!saver.is_started());
        saver.stop().await;
    }
}
