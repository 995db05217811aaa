//! Infrastructure utility back-ends
//!
//! A back-end wraps one binary (terraform or opentofu) bound to a single
//! layout step. Runners only talk to [`InfraBackend`]; the CLI driver in
//! [`cli`] is the production implementation.

pub mod cli;

use crate::plan::{plan_actions, Plan, ResourceChange};
use crate::types::{ApplyOpts, DestroyOpts, PlanOpts, Step};
use async_trait::async_trait;
use rigger_core::config::{BackendKind, InfrastructureConfig};
use rigger_core::error::RiggerResult;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use cli::{CliBackend, WorkingDirArg};

#[async_trait]
pub trait InfraBackend: Send + Sync {
    async fn init(&self) -> RiggerResult<()>;

    async fn apply(&self, opts: ApplyOpts) -> RiggerResult<()>;

    /// Returns the exit code; 2 means the plan has changes.
    async fn plan(&self, opts: PlanOpts) -> RiggerResult<i32>;

    async fn destroy(&self, opts: DestroyOpts) -> RiggerResult<()>;

    async fn output(&self, state_path: &Path, fields: &[String]) -> RiggerResult<Vec<u8>>;

    async fn show(&self, plan_path: &Path) -> RiggerResult<Vec<u8>>;

    /// Every resource action recorded in a saved plan.
    async fn get_actions(&self, plan_path: &Path) -> RiggerResult<Vec<String>> {
        let raw = self.show(plan_path).await?;
        plan_actions(&Plan::from_slice(&raw)?)
    }

    fn is_vm_change(&self, change: &ResourceChange) -> bool;

    /// Directory temporary state and plan files are created in
    fn states_dir(&self) -> PathBuf;

    fn step(&self) -> Step;

    fn working_dir(&self) -> PathBuf;

    /// Interrupt the running child, if any.
    fn stop(&self);
}

/// Everything a CLI back-end needs to run one layout step
#[derive(Debug, Clone)]
pub struct BackendParams {
    pub binary: PathBuf,
    pub root_dir: PathBuf,
    pub plugins_dir: PathBuf,
    pub working_dir: PathBuf,
    pub data_dir: PathBuf,
    pub states_dir: PathBuf,
    pub step: Step,
    pub provider: String,
    pub debug: bool,
}

impl BackendParams {
    /// Working dir is `<modules>/<provider>/layouts/<layout>/<step>`.
    pub fn from_config(
        config: &InfrastructureConfig,
        provider: &str,
        layout: &str,
        step: Step,
    ) -> Self {
        let binary = match config.backend {
            BackendKind::Terraform => config.terraform_binary.clone(),
            BackendKind::Opentofu => config.opentofu_binary.clone(),
        };
        Self {
            binary,
            root_dir: config.root_dir.clone(),
            plugins_dir: config.plugins_dir(),
            working_dir: config
                .modules_dir()
                .join(provider)
                .join("layouts")
                .join(layout)
                .join(step.as_str()),
            data_dir: config.data_dir(),
            states_dir: config.tmp_dir.clone(),
            step,
            provider: provider.to_string(),
            debug: config.debug,
        }
    }
}

/// Build the driver for the configured utility.
pub fn new_backend(kind: BackendKind, params: BackendParams) -> Arc<dyn InfraBackend> {
    let placement = match kind {
        BackendKind::Terraform => WorkingDirArg::Positional,
        BackendKind::Opentofu => WorkingDirArg::Chdir,
    };
    Arc::new(CliBackend::new(params, placement))
}

/// Resource type each cloud provider uses for virtual machines
pub fn vm_resource_type(provider: &str) -> Option<&'static str> {
    let resource = match provider.to_ascii_lowercase().as_str() {
        "yandex" => "yandex_compute_instance",
        "openstack" => "openstack_compute_instance_v2",
        "aws" => "aws_instance",
        "gcp" => "google_compute_instance",
        "azure" => "azurerm_linux_virtual_machine",
        "vsphere" => "vsphere_virtual_machine",
        "vcd" => "vcd_vapp_vm",
        "zvirt" => "ovirt_vm",
        "dynamix" => "decort_kvmvm",
        "huaweicloud" => "huaweicloud_compute_instance",
        _ => return None,
    };
    Some(resource)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_working_dir_layout() {
        let config = InfrastructureConfig::default();
        let params = BackendParams::from_config(&config, "yandex", "standard", Step::MasterNode);
        assert!(params
            .working_dir
            .ends_with("yandex/layouts/standard/master-node"));
        assert!(params.working_dir.starts_with(config.modules_dir()));
    }

    #[test]
    fn test_vm_resource_types() {
        assert_eq!(vm_resource_type("Yandex"), Some("yandex_compute_instance"));
        assert_eq!(vm_resource_type("static"), None);
    }
}
