//! Per-pod coordination lease
//!
//! Every replica publishes a lease whose holder identity is its pod DNS
//! endpoint. Peers discover each other by listing labelled leases. A renew
//! loop keeps the lease fresh and a GC loop removes leases of replicas that
//! stopped renewing.

use crate::config::LeaseConfig;
use crate::error::RiggerResult;
use crate::k8s::KubeClient;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const LEASE_LABEL: &str = "deckhouse.io/documentation-builder-sync";

pub struct LeaseManager {
    client: Arc<dyn KubeClient>,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(client: Arc<dyn KubeClient>, config: LeaseConfig) -> Self {
        Self { client, config }
    }

    /// `<module>-<last segment of the pod name>`
    pub fn lease_name(&self) -> String {
        let suffix = self
            .config
            .pod_name
            .rsplit('-')
            .next()
            .unwrap_or(self.config.pod_name.as_str());
        format!("{}-{}", self.config.module, suffix)
    }

    /// `<dashed pod ip>.<namespace>.pod.<cluster domain>:<port>`
    pub fn holder_identity(&self) -> String {
        format!(
            "{}.{}.pod.{}:{}",
            self.config.pod_ip.replace('.', "-"),
            self.config.namespace,
            self.config.cluster_domain,
            self.config.port
        )
    }

    fn build_lease(&self, now: DateTime<Utc>) -> Lease {
        let mut labels = BTreeMap::new();
        labels.insert(LEASE_LABEL.to_string(), String::new());

        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name()),
                namespace: Some(self.config.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.holder_identity()),
                lease_duration_seconds: Some(self.config.duration_seconds),
                renew_time: Some(MicroTime(now)),
                ..Default::default()
            }),
        }
    }

    /// Create the lease, replacing a stale one left by a previous run.
    #[instrument(skip(self), fields(lease = %self.lease_name()))]
    pub async fn create(&self) -> RiggerResult<()> {
        let lease = self.build_lease(Utc::now());
        match self
            .client
            .get_lease(&self.config.namespace, &self.lease_name())
            .await?
        {
            Some(existing) => {
                let mut lease = lease;
                lease.metadata.resource_version = existing.metadata.resource_version;
                self.client.replace_lease(lease).await?;
                info!("Lease replaced");
            }
            None => {
                self.client.create_lease(lease).await?;
                info!("Lease created");
            }
        }
        Ok(())
    }

    pub async fn renew(&self) -> RiggerResult<()> {
        let name = self.lease_name();
        let Some(mut lease) = self.client.get_lease(&self.config.namespace, &name).await? else {
            warn!(lease = %name, "Lease disappeared, recreating");
            return self.create().await;
        };

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        spec.renew_time = Some(MicroTime(Utc::now()));
        self.client.replace_lease(lease).await?;
        debug!(lease = %name, "Lease renewed");
        Ok(())
    }

    /// Delete every labelled lease whose renew time plus duration has passed.
    pub async fn gc(&self) -> RiggerResult<usize> {
        self.gc_at(Utc::now()).await
    }

    async fn gc_at(&self, now: DateTime<Utc>) -> RiggerResult<usize> {
        let leases = self
            .client
            .list_leases(&self.config.namespace, LEASE_LABEL)
            .await?;

        let mut deleted = 0;
        for lease in leases {
            if !is_expired(&lease, now) {
                continue;
            }
            let Some(name) = lease.metadata.name.as_deref() else {
                continue;
            };
            if self.client.delete_lease(&self.config.namespace, name).await? {
                info!(lease = %name, "Expired lease deleted");
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// GC, create, then renew and GC on their intervals until `cancel`
    /// fires. A failing loop cancels the other one.
    pub async fn run(&self, cancel: CancellationToken) -> RiggerResult<()> {
        self.gc().await?;
        self.create().await?;

        let mut renew = tokio::time::interval(self.config.renew_interval);
        let mut gc = tokio::time::interval(self.config.gc_interval);
        renew.tick().await;
        gc.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Lease manager stopped");
                    return Ok(());
                }
                _ = renew.tick() => {
                    if let Err(e) = self.renew().await {
                        cancel.cancel();
                        return Err(e);
                    }
                }
                _ = gc.tick() => {
                    if let Err(e) = self.gc().await {
                        cancel.cancel();
                        return Err(e);
                    }
                }
            }
        }
    }
}

fn is_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let Some(spec) = lease.spec.as_ref() else {
        return true;
    };
    let Some(MicroTime(renewed)) = spec.renew_time.as_ref() else {
        return true;
    };
    let duration = chrono::Duration::seconds(spec.lease_duration_seconds.unwrap_or(0) as i64);
    *renewed + duration <= now
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::fake::FakeKubeClient;

    fn config() -> LeaseConfig {
        LeaseConfig {
            pod_name: "documentation-7d9f8-xk2lp".to_string(),
            pod_ip: "10.111.0.12".to_string(),
            ..LeaseConfig::default()
        }
    }

    #[test]
    fn test_identity() {
        let manager = LeaseManager::new(Arc::new(FakeKubeClient::new()), config());
        assert_eq!(manager.lease_name(), "documentation-xk2lp");
        assert_eq!(
            manager.holder_identity(),
            "10-111-0-12.d8-system.pod.cluster.local:8081"
        );
    }

    #[tokio::test]
    async fn test_create_and_gc() {
        let fake = Arc::new(FakeKubeClient::new());
        let manager = LeaseManager::new(fake.clone(), config());
        manager.create().await.unwrap();

        let lease = fake.lease("d8-system", "documentation-xk2lp").unwrap();
        let spec = lease.spec.unwrap();
        assert_eq!(spec.lease_duration_seconds, Some(35));

        // Still fresh
        assert_eq!(manager.gc().await.unwrap(), 0);

        // 36 seconds later it has expired
        let later = Utc::now() + chrono::Duration::seconds(36);
        assert_eq!(manager.gc_at(later).await.unwrap(), 1);
        assert!(fake.lease_names().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let fake = Arc::new(FakeKubeClient::new());
        let manager = LeaseManager::new(fake.clone(), config());
        let cancel = CancellationToken::new();
        cancel.cancel();
        manager.run(cancel).await.unwrap();
        assert_eq!(fake.lease_names(), vec!["documentation-xk2lp".to_string()]);
    }
}
