// Scripted back-end and factory shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rigger_core::error::RiggerResult;
use rigger_infra::backend::InfraBackend;
use rigger_infra::context::BackendFactory;
use rigger_infra::meta::MetaConfig;
use rigger_infra::plan::ResourceChange;
use rigger_infra::types::{ApplyOpts, DestroyOpts, PlanOpts, Step};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// What a mock back-end answers
#[derive(Debug, Clone)]
pub struct Script {
    pub plan_exit_code: i32,
    pub plan: Value,
    pub output: Value,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            plan_exit_code: 0,
            plan: json!({}),
            output: json!({}),
        }
    }
}

/// Holds `plan` until released, so a second call can race it
#[derive(Debug, Default)]
pub struct PlanGate {
    pub started: Notify,
    pub release: Notify,
}

pub struct MockBackend {
    step: Step,
    dir: PathBuf,
    script: Script,
    gate: Option<Arc<PlanGate>>,
    pub calls: Mutex<Vec<String>>,
    pub stopped: AtomicBool,
}

impl MockBackend {
    pub fn new(step: Step, dir: &Path, script: Script) -> Self {
        Self {
            step,
            dir: dir.to_path_buf(),
            script,
            gate: None,
            calls: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_gate(mut self, gate: Arc<PlanGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }
}

#[async_trait]
impl InfraBackend for MockBackend {
    async fn init(&self) -> RiggerResult<()> {
        self.record("init");
        Ok(())
    }

    async fn apply(&self, _opts: ApplyOpts) -> RiggerResult<()> {
        self.record("apply");
        Ok(())
    }

    async fn plan(&self, opts: PlanOpts) -> RiggerResult<i32> {
        self.record(if opts.destroy { "plan-destroy" } else { "plan" });
        if let Some(gate) = &self.gate {
            gate.started.notify_one();
            gate.release.notified().await;
        }
        Ok(self.script.plan_exit_code)
    }

    async fn destroy(&self, _opts: DestroyOpts) -> RiggerResult<()> {
        self.record("destroy");
        Ok(())
    }

    async fn output(&self, _state_path: &Path, fields: &[String]) -> RiggerResult<Vec<u8>> {
        self.record(&format!("output {}", fields.join(",")));
        Ok(serde_json::to_vec(&self.script.output)?)
    }

    async fn show(&self, _plan_path: &Path) -> RiggerResult<Vec<u8>> {
        self.record("show");
        Ok(serde_json::to_vec(&self.script.plan)?)
    }

    fn is_vm_change(&self, change: &ResourceChange) -> bool {
        change.type_.ends_with("_instance")
    }

    fn states_dir(&self) -> PathBuf {
        self.dir.clone()
    }

    fn step(&self) -> Step {
        self.step
    }

    fn working_dir(&self) -> PathBuf {
        self.dir.join("layouts").join(self.step.as_str())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Hands out mock back-ends, one script for the base infrastructure and one
/// for every node step.
pub struct MockFactory {
    dir: PathBuf,
    base: Script,
    node: Script,
    pub created: Mutex<Vec<Step>>,
}

impl MockFactory {
    pub fn new(dir: &Path, base: Script, node: Script) -> Self {
        Self {
            dir: dir.to_path_buf(),
            base,
            node,
            created: Mutex::new(Vec::new()),
        }
    }
}

impl BackendFactory for MockFactory {
    fn create(&self, _meta: &MetaConfig, step: Step) -> Arc<dyn InfraBackend> {
        self.created.lock().push(step);
        let script = match step {
            Step::BaseInfrastructure => self.base.clone(),
            _ => self.node.clone(),
        };
        Arc::new(MockBackend::new(step, &self.dir, script))
    }
}

/// Plan that recreates a compute instance
pub fn destructive_plan() -> Value {
    json!({
        "resource_changes": [
            {
                "type": "yandex_compute_instance",
                "name": "master",
                "provider_name": "registry.terraform.io/yandex-cloud/yandex",
                "change": {"actions": ["delete", "create"], "before": {"id": "a"}, "after": {"id": "b"}}
            }
        ]
    })
}
