//! Keyed runner cache
//!
//! Every runner handed out is stored under a key made of the phase, the kind
//! of runner, provider, prefix, layout and, for nodes, step and node name.
//! Each creation replaces the stored runner and registers a shutdown hook
//! that stops it.

use crate::backend::{new_backend, BackendParams, InfraBackend};
use crate::meta::MetaConfig;
use crate::runner::cache::{DummyCache, StateCache};
use crate::runner::confirm::Confirm;
use crate::runner::hook::InfraActionHook;
use crate::runner::{AutoDismiss, LockDirs, Runner, RunnerFlags};
use crate::state_saver::SaveDestination;
use crate::types::Step;
use parking_lot::Mutex;
use rigger_core::config::{InfrastructureConfig, UseStateCache};
use rigger_core::error::RiggerResult;
use rigger_core::shutdown::ShutdownRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const BASE_INFRASTRUCTURE_HOOK: &str = "base-infrastructure";

/// Builds the back-end a runner drives
pub trait BackendFactory: Send + Sync {
    fn create(&self, meta: &MetaConfig, step: Step) -> Arc<dyn InfraBackend>;
}

/// Factory for the configured command-line utility
#[derive(Debug, Clone)]
pub struct CliBackendFactory {
    config: InfrastructureConfig,
}

impl CliBackendFactory {
    pub fn new(config: InfrastructureConfig) -> Self {
        Self { config }
    }
}

impl BackendFactory for CliBackendFactory {
    fn create(&self, meta: &MetaConfig, step: Step) -> Arc<dyn InfraBackend> {
        let params =
            BackendParams::from_config(&self.config, &meta.provider_name, &meta.layout, step);
        new_backend(self.config.backend, params)
    }
}

#[derive(Clone, Default)]
pub struct BaseInfraRunnerOptions {
    pub auto_dismiss_destructive: bool,
    pub auto_approve: bool,
    pub commander_mode: bool,
    pub state_cache: Option<Arc<dyn StateCache>>,
    pub cluster_state: Option<Vec<u8>>,
    pub destinations: Vec<Arc<dyn SaveDestination>>,
}

#[derive(Clone)]
pub struct NodeRunnerOptions {
    pub auto_dismiss_destructive: bool,
    pub auto_approve: bool,
    pub node_name: String,
    pub node_group_name: String,
    pub node_group_step: Step,
    pub node_index: usize,
    pub node_state: Option<Vec<u8>>,
    pub node_cloud_config: String,
    pub commander_mode: bool,
    pub state_cache: Option<Arc<dyn StateCache>>,
    pub destinations: Vec<Arc<dyn SaveDestination>>,
    pub hook: Option<Arc<dyn InfraActionHook>>,
}

#[derive(Clone)]
pub struct NodeDeleteRunnerOptions {
    pub auto_dismiss_destructive: bool,
    pub auto_approve: bool,
    pub node_name: String,
    pub node_group_name: String,
    pub layout_step: Step,
    pub node_index: usize,
    pub node_state: Option<Vec<u8>>,
    pub node_cloud_config: String,
    pub commander_mode: bool,
    pub state_cache: Option<Arc<dyn StateCache>>,
    pub destinations: Vec<Arc<dyn SaveDestination>>,
    pub hook: Option<Arc<dyn InfraActionHook>>,
}

#[derive(Clone)]
pub struct BootstrapNodeRunnerOptions {
    pub auto_approve: bool,
    pub node_name: String,
    pub node_group_name: String,
    pub node_group_step: Step,
    pub node_index: usize,
    pub node_cloud_config: String,
    pub destinations: Vec<Arc<dyn SaveDestination>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyBaseInfraRunnerOptions {
    pub auto_approve: bool,
}

#[derive(Debug, Clone)]
pub struct DestroyNodeRunnerOptions {
    pub auto_approve: bool,
    pub node_name: String,
    pub node_group_name: String,
    pub node_group_step: Step,
    pub node_index: usize,
}

pub struct InfrastructureContext {
    factory: Arc<dyn BackendFactory>,
    confirm: Arc<dyn Confirm>,
    shutdown: Arc<ShutdownRegistry>,
    locks: LockDirs,
    use_state_cache: UseStateCache,
    runners: Mutex<HashMap<String, Arc<Runner>>>,
}

impl InfrastructureContext {
    pub fn new(
        factory: Arc<dyn BackendFactory>,
        confirm: Arc<dyn Confirm>,
        shutdown: Arc<ShutdownRegistry>,
    ) -> Self {
        Self {
            factory,
            confirm,
            shutdown,
            locks: LockDirs::default(),
            use_state_cache: UseStateCache::default(),
            runners: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_lock_dirs(mut self, locks: LockDirs) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_use_state_cache(mut self, use_state_cache: UseStateCache) -> Self {
        self.use_state_cache = use_state_cache;
        self
    }

    /// Runner stored under `key`, if any
    pub fn runner(&self, key: &str) -> Option<Arc<Runner>> {
        self.runners.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.runners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.lock().is_empty()
    }

    /// Always builds a new runner and replaces the stored one.
    fn get_or_create(
        &self,
        key: String,
        hook_name: &str,
        create: impl FnOnce() -> RiggerResult<Runner>,
    ) -> RiggerResult<Arc<Runner>> {
        let mut runners = self.runners.lock();

        let runner = Arc::new(create()?);
        let stopping = runner.clone();
        self.shutdown
            .register(hook_name, move || async move { stopping.stop().await });

        debug!(key = %key, "Infrastructure runner created");
        runners.insert(key, runner.clone());
        Ok(runner)
    }

    fn new_runner(
        &self,
        meta: &MetaConfig,
        step: Step,
        cache: Arc<dyn StateCache>,
    ) -> RiggerResult<Runner> {
        let backend = self.factory.create(meta, step);
        Ok(Runner::new(backend, cache, self.confirm.clone(), &self.locks)?
            .with_use_state_cache(self.use_state_cache))
    }

    /// Runner whose state never reaches the local cache
    fn new_immutable_runner(&self, meta: &MetaConfig, step: Step) -> RiggerResult<Runner> {
        let backend = self.factory.create(meta, step);
        let cache: Arc<dyn StateCache> = Arc::new(DummyCache::new(backend.states_dir()));
        Ok(Runner::new(backend, cache, self.confirm.clone(), &self.locks)?
            .with_use_state_cache(self.use_state_cache))
    }

    fn commander_cache(&self, cache: &Option<Arc<dyn StateCache>>) -> Arc<dyn StateCache> {
        match cache {
            Some(cache) => cache.clone(),
            None => Arc::new(DummyCache::default()),
        }
    }

    pub fn check_base_infra_runner(
        &self,
        meta: &MetaConfig,
        opts: BaseInfraRunnerOptions,
    ) -> RiggerResult<Arc<Runner>> {
        let key = base_key("check", meta);
        self.get_or_create(key, BASE_INFRASTRUCTURE_HOOK, || {
            let variables = meta.marshal_config()?;
            if opts.commander_mode {
                let runner = self
                    .new_runner(meta, Step::BaseInfrastructure, self.commander_cache(&opts.state_cache))?
                    .with_flags(RunnerFlags {
                        auto_approve: opts.auto_approve,
                        auto_dismiss: AutoDismiss::from_flags(opts.auto_dismiss_destructive, false),
                        skip_changes_on_deny: true,
                        allowed_cached_state: false,
                    })
                    .with_destinations(opts.destinations.clone());
                runner.with_variables(&variables)?;
                Ok(runner)
            } else {
                let runner = self
                    .new_immutable_runner(meta, Step::BaseInfrastructure)?
                    .with_flags(RunnerFlags {
                        auto_approve: true,
                        ..Default::default()
                    });
                runner.with_variables(&variables)?;
                if let Some(state) = &opts.cluster_state {
                    runner.with_state(state)?;
                }
                Ok(runner)
            }
        })
    }

    pub fn check_node_runner(
        &self,
        meta: &MetaConfig,
        opts: NodeRunnerOptions,
    ) -> RiggerResult<Arc<Runner>> {
        let key = node_key("check.node", meta, opts.node_group_step, &opts.node_name);
        self.get_or_create(key, &opts.node_name, || {
            let variables =
                meta.node_group_config(&opts.node_group_name, opts.node_index, &opts.node_cloud_config)?;
            if opts.commander_mode {
                let mut runner = self
                    .new_runner(meta, opts.node_group_step, self.commander_cache(&opts.state_cache))?
                    .with_name(&opts.node_name)
                    .with_flags(RunnerFlags {
                        auto_approve: opts.auto_approve,
                        auto_dismiss: AutoDismiss::from_flags(opts.auto_dismiss_destructive, false),
                        skip_changes_on_deny: true,
                        allowed_cached_state: false,
                    })
                    .with_destinations(opts.destinations.clone());
                if let Some(hook) = &opts.hook {
                    runner = runner.with_hook(hook.clone());
                }
                runner.with_variables(&variables)?;
                Ok(runner)
            } else {
                let runner = self
                    .new_immutable_runner(meta, opts.node_group_step)?
                    .with_name(&opts.node_name);
                runner.with_variables(&variables)?;
                if let Some(state) = &opts.node_state {
                    runner.with_state(state)?;
                }
                Ok(runner)
            }
        })
    }

    pub fn check_node_delete_runner(
        &self,
        meta: &MetaConfig,
        opts: NodeDeleteRunnerOptions,
    ) -> RiggerResult<Arc<Runner>> {
        let key = node_key("check.node-delete", meta, opts.layout_step, &opts.node_name);
        self.get_or_create(key, &opts.node_name, || {
            let variables =
                meta.node_group_config(&opts.node_group_name, opts.node_index, &opts.node_cloud_config)?;
            if opts.commander_mode {
                let runner = self
                    .new_runner(meta, opts.layout_step, self.commander_cache(&opts.state_cache))?
                    .with_name(&opts.node_name)
                    .with_flags(RunnerFlags {
                        auto_approve: opts.auto_approve,
                        auto_dismiss: AutoDismiss::from_flags(opts.auto_dismiss_destructive, false),
                        skip_changes_on_deny: true,
                        allowed_cached_state: true,
                    })
                    .with_destinations(opts.destinations.clone());
                runner.with_variables(&variables)?;
                Ok(runner)
            } else {
                let runner = self
                    .new_immutable_runner(meta, opts.layout_step)?
                    .with_name(&opts.node_name)
                    .with_flags(RunnerFlags {
                        auto_approve: true,
                        auto_dismiss: AutoDismiss::None,
                        skip_changes_on_deny: true,
                        allowed_cached_state: false,
                    });
                runner.with_variables(&variables)?;
                if let Some(state) = &opts.node_state {
                    runner.with_state(state)?;
                }
                Ok(runner)
            }
        })
    }

    pub fn converge_base_infra_runner(
        &self,
        meta: &MetaConfig,
        opts: BaseInfraRunnerOptions,
    ) -> RiggerResult<Arc<Runner>> {
        let key = base_key("converge", meta);
        self.get_or_create(key, BASE_INFRASTRUCTURE_HOOK, || {
            let runner = self
                .new_runner(meta, Step::BaseInfrastructure, self.commander_cache(&opts.state_cache))?
                .with_flags(RunnerFlags {
                    auto_approve: opts.auto_approve,
                    auto_dismiss: AutoDismiss::from_flags(opts.auto_dismiss_destructive, false),
                    skip_changes_on_deny: true,
                    allowed_cached_state: false,
                })
                .with_destinations(opts.destinations.clone());
            runner.with_variables(&meta.marshal_config()?)?;
            if let Some(state) = &opts.cluster_state {
                runner.with_state(state)?;
            }
            Ok(runner)
        })
    }

    pub fn converge_node_runner(
        &self,
        meta: &MetaConfig,
        opts: NodeRunnerOptions,
    ) -> RiggerResult<Arc<Runner>> {
        let key = node_key("converge.node", meta, opts.node_group_step, &opts.node_name);
        self.get_or_create(key, &opts.node_name, || {
            let mut runner = self
                .new_runner(meta, opts.node_group_step, self.commander_cache(&opts.state_cache))?
                .with_name(&opts.node_name)
                .with_flags(RunnerFlags {
                    auto_approve: opts.auto_approve,
                    auto_dismiss: AutoDismiss::from_flags(opts.auto_dismiss_destructive, false),
                    skip_changes_on_deny: true,
                    allowed_cached_state: false,
                })
                .with_destinations(opts.destinations.clone());
            if let Some(hook) = &opts.hook {
                runner = runner.with_hook(hook.clone());
            }
            runner.with_variables(&meta.node_group_config(
                &opts.node_group_name,
                opts.node_index,
                &opts.node_cloud_config,
            )?)?;
            if let Some(state) = &opts.node_state {
                runner.with_state(state)?;
            }
            Ok(runner)
        })
    }

    pub fn converge_node_delete_runner(
        &self,
        meta: &MetaConfig,
        opts: NodeDeleteRunnerOptions,
    ) -> RiggerResult<Arc<Runner>> {
        let key = node_key("converge.node-delete", meta, opts.layout_step, &opts.node_name);
        self.get_or_create(key, &opts.node_name, || {
            let mut runner = self
                .new_runner(meta, opts.layout_step, self.commander_cache(&opts.state_cache))?
                .with_name(&opts.node_name)
                .with_flags(RunnerFlags {
                    auto_approve: opts.auto_approve,
                    auto_dismiss: AutoDismiss::from_flags(opts.auto_dismiss_destructive, false),
                    skip_changes_on_deny: true,
                    allowed_cached_state: true,
                })
                .with_destinations(opts.destinations.clone());
            if let Some(hook) = &opts.hook {
                runner = runner.with_hook(hook.clone());
            }
            runner.with_variables(&meta.node_group_config(
                &opts.node_group_name,
                opts.node_index,
                &opts.node_cloud_config,
            )?)?;
            if let Some(state) = &opts.node_state {
                runner.with_state(state)?;
            }
            Ok(runner)
        })
    }

    pub fn bootstrap_base_infra_runner(
        &self,
        meta: &MetaConfig,
        cache: Arc<dyn StateCache>,
    ) -> RiggerResult<Arc<Runner>> {
        let key = base_key("bootstrap", meta);
        self.get_or_create(key, BASE_INFRASTRUCTURE_HOOK, || {
            let runner = self
                .new_runner(meta, Step::BaseInfrastructure, cache)?
                .with_flags(RunnerFlags {
                    auto_approve: true,
                    ..Default::default()
                });
            runner.with_variables(&meta.marshal_config()?)?;
            Ok(runner)
        })
    }

    pub fn bootstrap_node_runner(
        &self,
        meta: &MetaConfig,
        cache: Arc<dyn StateCache>,
        opts: BootstrapNodeRunnerOptions,
    ) -> RiggerResult<Arc<Runner>> {
        let key = node_key("bootstrap.node", meta, opts.node_group_step, &opts.node_name);
        self.get_or_create(key, &opts.node_name, || {
            let runner = self
                .new_runner(meta, opts.node_group_step, cache)?
                .with_name(&opts.node_name)
                .with_flags(RunnerFlags {
                    auto_approve: opts.auto_approve,
                    ..Default::default()
                })
                .with_destinations(opts.destinations.clone());
            runner.with_variables(&meta.node_group_config(
                &opts.node_group_name,
                opts.node_index,
                &opts.node_cloud_config,
            )?)?;
            Ok(runner)
        })
    }

    pub fn destroy_base_infra_runner(
        &self,
        meta: &MetaConfig,
        cache: Arc<dyn StateCache>,
        opts: DestroyBaseInfraRunnerOptions,
    ) -> RiggerResult<Arc<Runner>> {
        let key = base_key("destroy", meta);
        self.get_or_create(key, BASE_INFRASTRUCTURE_HOOK, || {
            let runner = self
                .new_runner(meta, Step::BaseInfrastructure, cache)?
                .with_flags(RunnerFlags {
                    auto_approve: opts.auto_approve,
                    allowed_cached_state: true,
                    ..Default::default()
                });
            runner.with_variables(&meta.marshal_config()?)?;
            Ok(runner)
        })
    }

    pub fn destroy_node_runner(
        &self,
        meta: &MetaConfig,
        cache: Arc<dyn StateCache>,
        opts: DestroyNodeRunnerOptions,
    ) -> RiggerResult<Arc<Runner>> {
        let key = node_key("destroy.node", meta, opts.node_group_step, &opts.node_name);
        self.get_or_create(key, &opts.node_name, || {
            let runner = self
                .new_runner(meta, opts.node_group_step, cache)?
                .with_name(&opts.node_name)
                .with_flags(RunnerFlags {
                    auto_approve: opts.auto_approve,
                    allowed_cached_state: true,
                    ..Default::default()
                });
            runner.with_variables(&meta.node_group_config(
                &opts.node_group_name,
                opts.node_index,
                "",
            )?)?;
            Ok(runner)
        })
    }
}

/// `<phase>.base-infrastructure.<provider>.<prefix>.<layout>`
pub fn base_key(phase: &str, meta: &MetaConfig) -> String {
    format!(
        "{}.base-infrastructure.{}.{}.{}",
        phase, meta.provider_name, meta.cluster_prefix, meta.layout
    )
}

/// `<phase>.<kind>.<provider>.<prefix>.<layout>.<step>.<node>`
pub fn node_key(kind: &str, meta: &MetaConfig, step: Step, node: &str) -> String {
    format!(
        "{}.{}.{}.{}.{}.{}",
        kind, meta.provider_name, meta.cluster_prefix, meta.layout, step, node
    )
}
