use super::cancel_on_signal;
use rigger_core::config::RiggerConfig;
use rigger_core::k8s::ClusterClient;
use rigger_core::lease::LeaseManager;
use rigger_core::shutdown;
use std::sync::Arc;
use tracing::info;

pub async fn run(config: &RiggerConfig) -> anyhow::Result<()> {
    let kube = Arc::new(ClusterClient::try_default().await?);
    let manager = LeaseManager::new(kube, config.lease.clone());
    info!(lease = %manager.lease_name(), holder = %manager.holder_identity(), "Holding lease");

    let cancel = cancel_on_signal(shutdown::global());
    manager.run(cancel).await?;
    Ok(())
}
