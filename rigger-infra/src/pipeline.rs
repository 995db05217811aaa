//! Named sequences of runner operations
//!
//! `apply`: init, plan, apply and output extraction. `check`: init and plan
//! with the verdict captured. `destroy`: init and destroy unless the state is
//! empty.

use crate::plan::{DestructiveChanges, Plan, PlanClass, ZonesChange};
use crate::runner::Runner;
use async_trait::async_trait;
use rigger_core::error::{RiggerError, RiggerResult};
use serde_json::Value;
use tracing::{debug, info, warn};

pub const CLOUD_DISCOVERY_DATA_OUTPUT: &str = "cloud_discovery_data";
const MASTER_SSH_IP_OUTPUT: &str = "master_ip_address_for_ssh";
const NODE_INTERNAL_IP_OUTPUT: &str = "node_internal_ip_address";
const KUBE_DATA_DEVICE_OUTPUT: &str = "kubernetes_data_device_path";
const BASTION_SSH_IP_OUTPUT: &str = "bastion_ip_address_for_ssh";

/// Data pulled out of a runner after an apply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineOutputs {
    pub infrastructure_state: Vec<u8>,
    pub cloud_discovery_data: Vec<u8>,
    pub bastion_host: String,
    pub master_ip_for_ssh: String,
    pub node_internal_ip: String,
    pub kube_data_device_path: String,
}

#[async_trait]
pub trait ExtractOutputs: Send + Sync {
    async fn extract(&self, runner: &Runner) -> RiggerResult<PipelineOutputs>;
}

/// Only the state file
#[derive(Debug, Clone, Copy, Default)]
pub struct OnlyState;

#[async_trait]
impl ExtractOutputs for OnlyState {
    async fn extract(&self, runner: &Runner) -> RiggerResult<PipelineOutputs> {
        Ok(PipelineOutputs {
            infrastructure_state: runner.get_state()?,
            ..Default::default()
        })
    }
}

/// State, discovery data and the optional bastion address
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseInfrastructureOutputs;

#[async_trait]
impl ExtractOutputs for BaseInfrastructureOutputs {
    async fn extract(&self, runner: &Runner) -> RiggerResult<PipelineOutputs> {
        let infrastructure_state = runner.get_state()?;
        let cloud_discovery_data = runner
            .get_infrastructure_output(CLOUD_DISCOVERY_DATA_OUTPUT)
            .await?;

        let bastion_host = match runner.get_infrastructure_output(BASTION_SSH_IP_OUTPUT).await {
            Ok(raw) => output_string(&raw).unwrap_or_default(),
            Err(e) => {
                debug!("No bastion output: {}", e);
                String::new()
            }
        };

        Ok(PipelineOutputs {
            infrastructure_state,
            cloud_discovery_data,
            bastion_host,
            ..Default::default()
        })
    }
}

/// State and the addresses of a freshly ordered master node
#[derive(Debug, Clone, Copy, Default)]
pub struct MasterNodeOutputs;

#[async_trait]
impl ExtractOutputs for MasterNodeOutputs {
    async fn extract(&self, runner: &Runner) -> RiggerResult<PipelineOutputs> {
        let infrastructure_state = runner.get_state()?;
        let master_ip_for_ssh = string_output(runner, MASTER_SSH_IP_OUTPUT).await?;
        let node_internal_ip = string_output(runner, NODE_INTERNAL_IP_OUTPUT).await?;
        let kube_data_device_path = string_output(runner, KUBE_DATA_DEVICE_OUTPUT).await?;

        Ok(PipelineOutputs {
            infrastructure_state,
            master_ip_for_ssh,
            node_internal_ip,
            kube_data_device_path,
            ..Default::default()
        })
    }
}

async fn string_output(runner: &Runner, name: &str) -> RiggerResult<String> {
    let raw = runner.get_infrastructure_output(name).await?;
    output_string(&raw)
}

fn output_string(raw: &[u8]) -> RiggerResult<String> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| RiggerError::parse("infrastructure output", e))?;
    Ok(match value {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Outcome of an apply pipeline. Outputs are extracted even when the
/// pipeline failed, so a partial state still reaches the caller.
#[derive(Debug)]
pub struct ApplyPipelineResult {
    pub outputs: Option<PipelineOutputs>,
    pub error: Option<RiggerError>,
}

impl ApplyPipelineResult {
    pub fn into_result(self) -> RiggerResult<PipelineOutputs> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.outputs.unwrap_or_default()),
        }
    }
}

pub async fn apply_pipeline(
    runner: &Runner,
    name: &str,
    extract: &dyn ExtractOutputs,
) -> ApplyPipelineResult {
    info!("Pipeline {} for {}", runner.step(), name);

    let applied = async {
        runner.init().await?;
        runner.plan(false, false).await?;
        runner.apply().await
    }
    .await;

    let extracted = extract.extract(runner).await;

    match (applied, extracted) {
        (Ok(()), Ok(outputs)) => ApplyPipelineResult {
            outputs: Some(outputs),
            error: None,
        },
        (Ok(()), Err(e)) => ApplyPipelineResult {
            outputs: None,
            error: Some(e),
        },
        (Err(e), extracted) => {
            let outputs = match extracted {
                Ok(outputs) => Some(outputs),
                Err(extract_error) => {
                    warn!("Cannot extract outputs after failed pipeline: {}", extract_error);
                    None
                }
            };
            ApplyPipelineResult {
                outputs,
                error: Some(e),
            }
        }
    }
}

/// Verdict of a check pipeline
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckResult {
    pub changes: PlanClass,
    pub plan: Option<Value>,
    pub destructive_changes: Option<DestructiveChanges>,
}

/// Init and plan without applying. With `no_output` the plan document is
/// not rendered and only the action list is classified.
pub async fn check_pipeline(
    runner: &Runner,
    name: &str,
    destroy: bool,
    no_output: bool,
) -> RiggerResult<CheckResult> {
    info!("Check state {} for {}", runner.step(), name);

    runner.init().await?;
    runner.plan(destroy, no_output).await?;

    let plan = if no_output {
        None
    } else {
        let raw = runner.show_plan().await?;
        Some(
            serde_json::from_slice::<Value>(&raw)
                .map_err(|e| RiggerError::parse("infrastructure plan", e))?,
        )
    };

    Ok(CheckResult {
        changes: runner.changes_in_plan(),
        plan,
        destructive_changes: runner.plan_destructive_changes(),
    })
}

/// Check pipeline for the base infrastructure. Older utility versions do not
/// report output changes in the verdict, so the discovery zones in the state
/// are compared with the zones the plan leaves. A difference is destructive.
pub async fn check_base_infrastructure_pipeline(
    runner: &Runner,
    name: &str,
) -> RiggerResult<CheckResult> {
    let mut result = check_pipeline(runner, name, false, false).await?;

    let Some(plan_value) = result.plan.clone() else {
        return Ok(result);
    };
    let Some(next) = Plan::from_value(plan_value).discovery_zones_after() else {
        debug!("Plan has no cloud discovery zones, skip zones check");
        return Ok(result);
    };

    let raw = runner
        .get_infrastructure_output(CLOUD_DISCOVERY_DATA_OUTPUT)
        .await?;
    let current = zones_from_discovery_data(&raw)?;

    if let Some(zones) = zones_changed(current, next) {
        info!(
            current = ?zones.current,
            next = ?zones.next,
            "Cloud discovery zones changed"
        );
        result.changes = PlanClass::HasDestructiveChanges;
        result
            .destructive_changes
            .get_or_insert_with(DestructiveChanges::default)
            .output_zones_changed = Some(zones);
    }

    Ok(result)
}

fn zones_from_discovery_data(raw: &[u8]) -> RiggerResult<Vec<String>> {
    let data: Value = serde_json::from_slice(raw)
        .map_err(|e| RiggerError::parse("cloud discovery data", e))?;
    Ok(data
        .get("zones")
        .and_then(crate::plan::string_list)
        .unwrap_or_default())
}

/// Both lists sorted; `None` when they hold the same zones.
fn zones_changed(mut current: Vec<String>, mut next: Vec<String>) -> Option<ZonesChange> {
    current.sort();
    next.sort();
    if current == next {
        return None;
    }
    Some(ZonesChange { current, next })
}

pub async fn destroy_pipeline(runner: &Runner, name: &str) -> RiggerResult<()> {
    info!("Destroy {} for {}", runner.step(), name);

    if runner.resources_quantity_in_state() == 0 {
        info!("Nothing to destroy! Skipping ...");
        return Ok(());
    }

    runner.init().await?;
    runner.destroy().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zones_compared_sorted() {
        let same = zones_changed(
            vec!["b".to_string(), "a".to_string()],
            vec!["a".to_string(), "b".to_string()],
        );
        assert!(same.is_none());

        let changed = zones_changed(
            vec!["ru-central1-b".to_string(), "ru-central1-a".to_string()],
            vec!["ru-central1-c".to_string(), "ru-central1-b".to_string()],
        )
        .unwrap();
        assert_eq!(changed.current, vec!["ru-central1-a", "ru-central1-b"]);
        assert_eq!(changed.next, vec!["ru-central1-b", "ru-central1-c"]);
    }

    #[test]
    fn test_output_string() {
        assert_eq!(output_string(br#""10.0.0.1""#).unwrap(), "10.0.0.1");
        assert_eq!(output_string(b"42").unwrap(), "42");
        assert!(output_string(b"not json").is_err());
    }

    #[test]
    fn test_zones_from_discovery_data() {
        let zones = zones_from_discovery_data(br#"{"zones":["z2","z1"],"other":1}"#).unwrap();
        assert_eq!(zones, vec!["z2", "z1"]);
        assert!(zones_from_discovery_data(b"{}").unwrap().is_empty());
    }

    #[test]
    fn test_apply_result_into_result() {
        let failed = ApplyPipelineResult {
            outputs: Some(PipelineOutputs::default()),
            error: Some(RiggerError::ApplyAborted),
        };
        assert!(matches!(failed.into_result(), Err(RiggerError::ApplyAborted)));
    }
}
