use super::cancel_on_signal;
use rigger_core::config::RiggerConfig;
use rigger_core::k8s::{ClusterClient, KubeClient};
use rigger_core::shutdown;
use rigger_registry::checker::{self, Checker, CheckerLoop, CheckerStatus};
use rigger_registry::orchestrator::RegistryController;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn kube() -> anyhow::Result<Arc<dyn KubeClient>> {
    Ok(Arc::new(ClusterClient::try_default().await?))
}

fn checker_loop(config: &RiggerConfig, kube: Arc<dyn KubeClient>) -> CheckerLoop {
    CheckerLoop::new(
        Checker::http(config.checker.clone()),
        kube,
        config.registry.namespace.clone(),
        config.checker.interval,
    )
}

/// Controller and checker side by side until interrupted
pub async fn run(config: &RiggerConfig) -> anyhow::Result<()> {
    let kube = kube().await?;
    let (params_tx, params_rx) = watch::channel(checker::Params::default());
    let (status_tx, status_rx) = watch::channel(CheckerStatus::default());

    let controller = RegistryController::new(
        kube.clone(),
        config.registry.namespace.clone(),
        config.registry.reconcile_interval,
        params_tx,
        status_rx,
    );
    let checker = checker_loop(config, kube);

    let cancel = cancel_on_signal(shutdown::global());
    info!(namespace = %config.registry.namespace, "Starting registry controller");

    let (controller_result, checker_result) = tokio::join!(
        controller.run(cancel.clone()),
        checker.run(params_rx, status_tx, cancel.clone()),
    );
    controller_result?;
    checker_result?;
    Ok(())
}

pub async fn reconcile_once(config: &RiggerConfig) -> anyhow::Result<()> {
    let kube = kube().await?;
    let (params_tx, _params_rx) = watch::channel(checker::Params::default());

    // The checker status comes from its last persisted round.
    let store = rigger_registry::StateStore::new(kube.clone(), config.registry.namespace.clone());
    let (params, state) = store.load_checker().await?;
    let status = checker::status(&params.unwrap_or_default(), &state);
    let (_status_tx, status_rx) = watch::channel(status);

    let controller = RegistryController::new(
        kube,
        config.registry.namespace.clone(),
        config.registry.reconcile_interval,
        params_tx,
        status_rx,
    );

    match controller.reconcile_once().await? {
        Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
        None => info!("No registry configuration found"),
    }
    Ok(())
}

pub async fn check_images(config: &RiggerConfig) -> anyhow::Result<()> {
    let checker = checker_loop(config, kube().await?);
    let status = checker.run_once(&CancellationToken::new()).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
