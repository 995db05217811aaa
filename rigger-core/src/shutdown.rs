//! Process-wide shutdown registry
//!
//! Components register a named stop callback; on signal the callbacks run
//! once, in registration order.

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

type StopFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
pub struct ShutdownRegistry {
    entries: Mutex<Vec<(String, StopFn)>>,
}

static GLOBAL: Lazy<Arc<ShutdownRegistry>> = Lazy::new(|| Arc::new(ShutdownRegistry::new()));

/// Registry shared by the whole process
pub fn global() -> Arc<ShutdownRegistry> {
    GLOBAL.clone()
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, name: impl Into<String>, stop: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(name = %name, "Registered shutdown hook");
        self.entries
            .lock()
            .push((name, Box::new(move || Box::pin(stop()))));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Invoke every registered callback and empty the registry.
    pub async fn run_all(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());
        for (name, stop) in entries {
            info!(name = %name, "Running shutdown hook");
            stop().await;
        }
    }

    /// Wait for ctrl-c, then run the registered callbacks.
    pub async fn wait_for_signal(&self) -> std::io::Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("Interrupt received, shutting down");
        self.run_all().await;
        Ok(())
    }
}
