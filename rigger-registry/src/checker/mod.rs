//! Registry image checker
//!
//! Each round compares the orchestrator's [`Params`] with the carried
//! [`State`], rebuilds queues whose registry params changed, promotes
//! cooled-down retries and probes pending items with a worker pool per
//! registry. A new params version resets everything and reports
//! `Initializing` until the next round.

pub mod images;
pub mod params;
pub mod puller;
pub mod queue;
pub mod runner;

pub use images::ImagesInfo;
pub use params::{CheckMode, CheckerStatus, Params, RegistryParams, Scheme};
pub use puller::{HttpProberFactory, ImageProber, ProberFactory};
pub use queue::{Item, Queue, State};
pub use runner::CheckerLoop;

use chrono::Utc;
use futures::future::join_all;
use rigger_core::config::CheckerConfig;
use rigger_core::error::RiggerResult;
use rigger_core::hashing::compute_hash;
use rigger_core::observability::checker_span;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

pub const INITIALIZING_MESSAGE: &str = "Initializing";

/// Readiness as seen by the orchestrator
pub fn status(params: &Params, state: &State) -> CheckerStatus {
    let in_sync = state.version == params.version;
    let built = params.registries.is_empty() || !state.queues.is_empty();
    CheckerStatus {
        version: state.version.clone(),
        ready: in_sync && built && !state.has_pending(),
        message: state.message.clone(),
    }
}

/// Forget every queue; the next round rebuilds them for `params`.
pub fn handle_new_config(params: &Params, state: &mut State) {
    info!(version = %params.version, "Checker params changed, resetting state");
    state.queues.clear();
    state.version = params.version.clone();
    state.message = INITIALIZING_MESSAGE.to_string();
}

fn queue_hash(registry: &RegistryParams, mode: CheckMode) -> RiggerResult<String> {
    compute_hash(&(registry, mode))
}

pub struct Checker {
    config: CheckerConfig,
    probers: Arc<dyn ProberFactory>,
}

impl Checker {
    pub fn new(config: CheckerConfig, probers: Arc<dyn ProberFactory>) -> Self {
        Self { config, probers }
    }

    /// Production checker using HTTP probes
    pub fn http(config: CheckerConfig) -> Self {
        let probers = Arc::new(HttpProberFactory {
            request_timeout: config.request_timeout,
        });
        Self::new(config, probers)
    }

    /// Run one round and return the resulting status.
    ///
    /// The round is bounded by the configured process timeout; `cancel`
    /// stops dispatching early.
    pub async fn process(
        &self,
        params: &Params,
        state: &mut State,
        images: &ImagesInfo,
        cancel: &CancellationToken,
    ) -> RiggerResult<CheckerStatus> {
        if state.version != params.version {
            handle_new_config(params, state);
            return Ok(status(params, state));
        }

        let now = Utc::now();

        for (name, registry) in &params.registries {
            let hash = queue_hash(registry, params.check_mode)?;
            match state.queues.get_mut(name) {
                Some(queue) if queue.params_hash == hash => {
                    if queue.promote_retry(self.config.retry_delay, now) {
                        debug!(registry = %name, items = queue.items.len(), "Retrying failed items");
                    }
                }
                _ => {
                    let items = images::build_items(&registry.address, images, params.check_mode);
                    debug!(registry = %name, items = items.len(), "Built checker queue");
                    state.queues.insert(name.clone(), Queue::new(hash, items));
                }
            }
        }

        state
            .queues
            .retain(|name, _| params.registries.contains_key(name));

        let dispatch = cancel.child_token();
        let deadline = {
            let dispatch = dispatch.clone();
            let timeout = self.config.process_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                dispatch.cancel();
            })
        };

        let mut rounds = Vec::new();
        for (name, queue) in state.queues.iter_mut() {
            if !queue.ready_to_run(self.config.retry_delay, now) {
                continue;
            }
            let Some(registry) = params.registries.get(name) else {
                continue;
            };
            let prober = match self.probers.prober(registry) {
                Ok(prober) => prober,
                Err(e) => {
                    warn!(registry = %name, error = %e, "Cannot build prober");
                    continue;
                }
            };

            queue.last_attempt = Some(now);
            let items = queue.take_items();
            let span = checker_span(name);
            let round = puller::run_round(
                prober,
                items,
                self.config.parallelism_per_registry,
                dispatch.clone(),
                self.config.process_timeout,
            );
            let name = name.clone();
            rounds.push(
                async move {
                    let round = round.await;
                    tracing::Span::current().record("processed", round.results.len());
                    (name, round)
                }
                .instrument(span),
            );
        }

        let finished = join_all(rounds).await;
        deadline.abort();

        for (name, round) in finished {
            let Some(queue) = state.queues.get_mut(&name) else {
                continue;
            };
            for (item, result) in round.results {
                queue.record(item, result);
            }
            queue.restore(round.undispatched);
            debug!(
                registry = %name,
                processed = queue.processed,
                retry = queue.retry.len(),
                pending = queue.items.len(),
                "Checker round finished"
            );
        }

        state.message = state.build_message(self.config.show_max_err_items);
        Ok(status(params, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rigger_core::RiggerError;
    use std::collections::BTreeMap;

    struct DenyList(Vec<&'static str>);

    #[async_trait]
    impl ImageProber for DenyList {
        async fn probe(&self, image: &str) -> RiggerResult<()> {
            if self.0.iter().any(|bad| image.ends_with(bad)) {
                Err(RiggerError::Http {
                    url: image.to_string(),
                    message: "unexpected status 404 Not Found".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    struct Factory(Arc<DenyList>);

    impl ProberFactory for Factory {
        fn prober(&self, _params: &RegistryParams) -> RiggerResult<Arc<dyn ImageProber>> {
            Ok(self.0.clone())
        }
    }

    fn checker(deny: Vec<&'static str>) -> Checker {
        Checker::new(
            CheckerConfig::default(),
            Arc::new(Factory(Arc::new(DenyList(deny)))),
        )
    }

    fn params(version: &str) -> Params {
        Params {
            registries: BTreeMap::from([(
                "r.example.com".to_string(),
                RegistryParams {
                    address: "r.example.com/deckhouse".to_string(),
                    ..Default::default()
                },
            )]),
            check_mode: CheckMode::Default,
            version: version.to_string(),
        }
    }

    fn images(count: usize) -> ImagesInfo {
        ImagesInfo {
            deckhouse_tag: "v1.0.0".to_string(),
            digests: (0..count)
                .map(|i| (format!("mod/img-{:02}", i), format!("sha256:{:02}", i)))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_new_version_resets_state() {
        let mut state = State {
            version: "v1".to_string(),
            queues: BTreeMap::from([(
                "reg".to_string(),
                Queue {
                    processed: 5,
                    ..Default::default()
                },
            )]),
            message: "all 5 items checked".to_string(),
        };

        let checker = checker(vec![]);
        let cancel = CancellationToken::new();
        let status = checker
            .process(&params("v2"), &mut state, &images(10), &cancel)
            .await
            .unwrap();

        assert!(state.queues.is_empty());
        assert_eq!(status.message, "Initializing");
        assert!(!status.ready);

        let status = checker
            .process(&params("v2"), &mut state, &images(10), &cancel)
            .await
            .unwrap();
        assert_eq!(state.queues["r.example.com"].total(), 10);
        assert!(status.ready);
        assert_eq!(status.message, "r.example.com: all 10 items checked");
    }

    #[tokio::test]
    async fn test_failures_block_readiness() {
        let mut state = State::default();
        let checker = checker(vec!["sha256:03"]);
        let cancel = CancellationToken::new();

        checker
            .process(&params("v1"), &mut state, &images(4), &cancel)
            .await
            .unwrap();
        let status = checker
            .process(&params("v1"), &mut state, &images(4), &cancel)
            .await
            .unwrap();

        assert!(!status.ready);
        let queue = &state.queues["r.example.com"];
        assert_eq!(queue.processed, 3);
        assert_eq!(queue.retry.len(), 1);
        assert_eq!(queue.total(), 4);
        assert!(status
            .message
            .starts_with("r.example.com: 3 of 4 processed, 1 items with errors:"));
    }

    #[tokio::test]
    async fn test_removed_registry_is_pruned() {
        let mut state = State::default();
        let checker = checker(vec![]);
        let cancel = CancellationToken::new();

        checker
            .process(&params("v1"), &mut state, &images(2), &cancel)
            .await
            .unwrap();
        checker
            .process(&params("v1"), &mut state, &images(2), &cancel)
            .await
            .unwrap();
        assert_eq!(state.queues.len(), 1);

        let empty = Params {
            version: "v1".to_string(),
            ..Default::default()
        };
        let status = checker
            .process(&empty, &mut state, &images(2), &cancel)
            .await
            .unwrap();
        assert!(state.queues.is_empty());
        assert!(status.ready);
    }
}
