//! Background loop that feeds the checker and persists its progress

use super::{Checker, CheckerStatus, ImagesInfo, Params, State};
use crate::store::StateStore;
use k8s_openapi::api::apps::v1::Deployment;
use rigger_core::error::{RiggerError, RiggerResult};
use rigger_core::k8s::KubeClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const IMAGES_DIGESTS_CONFIG_MAP: &str = "deckhouse-images-digests";
pub const IMAGES_DIGESTS_KEY: &str = "images_digests.json";
pub const DECKHOUSE_DEPLOYMENT: &str = "deckhouse";
pub const DECKHOUSE_CONTAINER: &str = "deckhouse";

/// Tag part of an image reference, empty for digests or untagged images
pub fn image_tag(image: &str) -> &str {
    if image.contains('@') {
        return "";
    }
    let name = image.rsplit('/').next().unwrap_or(image);
    name.split_once(':').map(|(_, tag)| tag).unwrap_or("")
}

fn deckhouse_image(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == DECKHOUSE_CONTAINER)?
        .image
        .as_deref()
}

/// Read the image set of the running release.
pub async fn load_images_info(kube: &dyn KubeClient, namespace: &str) -> RiggerResult<ImagesInfo> {
    let deployment = kube
        .get_deployment(namespace, DECKHOUSE_DEPLOYMENT)
        .await?
        .ok_or_else(|| RiggerError::not_found(format!("deployment {}/{}", namespace, DECKHOUSE_DEPLOYMENT)))?;
    let tag = deckhouse_image(&deployment).map(image_tag).unwrap_or_default();

    let config_map = kube
        .get_config_map(namespace, IMAGES_DIGESTS_CONFIG_MAP)
        .await?
        .ok_or_else(|| {
            RiggerError::not_found(format!("configmap {}/{}", namespace, IMAGES_DIGESTS_CONFIG_MAP))
        })?;
    let digests = config_map
        .data
        .as_ref()
        .and_then(|d| d.get(IMAGES_DIGESTS_KEY))
        .map(String::as_str)
        .unwrap_or("{}");

    ImagesInfo::from_digests_json(tag, digests.as_bytes())
}

pub struct CheckerLoop {
    checker: Checker,
    kube: Arc<dyn KubeClient>,
    store: StateStore,
    namespace: String,
    interval: Duration,
}

impl CheckerLoop {
    pub fn new(
        checker: Checker,
        kube: Arc<dyn KubeClient>,
        namespace: impl Into<String>,
        interval: Duration,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            store: StateStore::new(kube.clone(), namespace.clone()),
            checker,
            kube,
            namespace,
            interval,
        }
    }

    /// Run one round for `params` and persist the outcome.
    #[instrument(skip_all, fields(version = %params.version))]
    pub async fn tick(
        &self,
        params: &Params,
        state: &mut State,
        cancel: &CancellationToken,
    ) -> RiggerResult<CheckerStatus> {
        let images = if params.is_empty() {
            ImagesInfo::default()
        } else {
            load_images_info(self.kube.as_ref(), &self.namespace).await?
        };
        let status = self.checker.process(params, state, &images, cancel).await?;
        self.store.save_checker(params, state).await?;
        debug!(ready = status.ready, "Checker round done");
        Ok(status)
    }

    /// One round with the params saved by the last run
    pub async fn run_once(&self, cancel: &CancellationToken) -> RiggerResult<CheckerStatus> {
        let (params, mut state) = self.store.load_checker().await?;
        let params = params.unwrap_or_default();
        self.tick(&params, &mut state, cancel).await
    }

    /// Check on every interval with the latest params from the orchestrator
    /// and publish the status back, until `cancel` fires. Failed rounds are
    /// logged and retried on the next tick.
    pub async fn run(
        &self,
        params_rx: watch::Receiver<Params>,
        status_tx: watch::Sender<CheckerStatus>,
        cancel: CancellationToken,
    ) -> RiggerResult<()> {
        let (_, mut state) = self.store.load_checker().await.unwrap_or_else(|e| {
            warn!(error = %e, "Cannot restore checker state, starting fresh");
            (None, State::default())
        });

        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Checker stopped");
                    return Ok(());
                }
                _ = interval.tick() => {
                    let params = params_rx.borrow().clone();
                    match self.tick(&params, &mut state, &cancel).await {
                        Ok(status) => {
                            status_tx.send_replace(status);
                        }
                        Err(e) => warn!(error = %e, "Checker round failed"),
                    }
                }
            }
        }
    }
}
