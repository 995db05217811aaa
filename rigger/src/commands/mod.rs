pub mod infra;
pub mod lease;
pub mod registry;

use rigger_core::shutdown::ShutdownRegistry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Token cancelled on ctrl-c, after the registered shutdown hooks ran
pub fn cancel_on_signal(shutdown: Arc<ShutdownRegistry>) -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown.wait_for_signal().await {
            tracing::warn!(error = %e, "Cannot listen for interrupts");
        }
        token.cancel();
    });
    cancel
}
