//! Stateful driver of one infrastructure utility invocation chain
//!
//! A runner walks `init → plan → apply | destroy` for one layout step. Every
//! call into the back-end goes through a running counter: an odd value means
//! a child is in flight and any concurrent call is refused. After
//! [`Runner::stop`] every operation returns [`RiggerError::RunnerStopped`].

pub mod cache;
pub mod confirm;
pub mod hook;

use crate::backend::InfraBackend;
use crate::lock::release_provider_lock;
use crate::plan::{classify_actions, destructive_report, DestructiveChanges, Plan, PlanClass};
use crate::state_saver::{CacheDestination, SaveDestination, StateSaver};
use crate::types::{ApplyOpts, DestroyOpts, PlanOpts, Step};
use cache::StateCache;
use confirm::Confirm;
use hook::{InfraActionHook, NoopHook};
use parking_lot::Mutex;
use rigger_core::config::defaults::{HAS_CHANGES_EXIT_CODE, STOP_POLL_INTERVAL_MS};
use rigger_core::config::UseStateCache;
use rigger_core::error::{RiggerError, RiggerResult};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const STATE_SUFFIX: &str = ".tfstate";
const PLAN_SUFFIX: &str = ".tfplan";
const VARIABLES_PREFIX: &str = "cluster-config.auto.";
const VARIABLES_SUFFIX: &str = ".tfvars.json";

const CACHED_STATE_PROMPT: &str = "Do you want to continue with infrastructure state from local cache?";
const CHANGE_PROMPT: &str = "Do you want to CHANGE objects state in the cloud?";
const DELETE_PROMPT: &str = "Do you want to DELETE objects from the cloud?";

/// Validates the state file before apply
pub type StateChecker = Arc<dyn Fn(&[u8]) -> RiggerResult<()> + Send + Sync>;

/// What to do with planned changes without asking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoDismiss {
    #[default]
    None,
    /// Skip apply when the plan is destructive
    Destructive,
    /// Abort apply whenever the plan has changes
    Changes,
    All,
}

impl AutoDismiss {
    pub fn from_flags(destructive: bool, changes: bool) -> Self {
        match (destructive, changes) {
            (false, false) => AutoDismiss::None,
            (true, false) => AutoDismiss::Destructive,
            (false, true) => AutoDismiss::Changes,
            (true, true) => AutoDismiss::All,
        }
    }

    pub fn destructive(&self) -> bool {
        matches!(self, AutoDismiss::Destructive | AutoDismiss::All)
    }

    pub fn changes(&self) -> bool {
        matches!(self, AutoDismiss::Changes | AutoDismiss::All)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerFlags {
    pub auto_approve: bool,
    pub auto_dismiss: AutoDismiss,
    pub skip_changes_on_deny: bool,
    /// Use a cached state without asking
    pub allowed_cached_state: bool,
}

/// Directories the runner releases provider locks in
#[derive(Debug, Clone, Default)]
pub struct LockDirs {
    pub dhctl_dir: PathBuf,
    pub modules_dir: PathBuf,
}

#[derive(Debug, Default)]
struct RunnerState {
    state_path: Option<PathBuf>,
    variables_path: Option<PathBuf>,
    plan_path: Option<PathBuf>,
    changes_in_plan: PlanClass,
    destructive_changes: Option<DestructiveChanges>,
    has_vm_destruction: bool,
}

pub struct Runner {
    name: String,
    step: Step,
    backend: Arc<dyn InfraBackend>,
    cache: Arc<dyn StateCache>,
    confirm: Arc<dyn Confirm>,
    use_state_cache: UseStateCache,
    flags: RunnerFlags,
    hook: Arc<dyn InfraActionHook>,
    state_checker: Option<StateChecker>,
    saver: StateSaver,
    state: Mutex<RunnerState>,
    init_lock: tokio::sync::Mutex<()>,
    running: AtomicI32,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("name", &self.name)
            .field("step", &self.step)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Runner {
    /// Release stale provider locks and build a runner for `backend`'s step.
    /// The cache entry of the runner is a state saver destination.
    pub fn new(
        backend: Arc<dyn InfraBackend>,
        cache: Arc<dyn StateCache>,
        confirm: Arc<dyn Confirm>,
        locks: &LockDirs,
    ) -> RiggerResult<Self> {
        let step = backend.step();
        release_provider_lock(
            &locks.dhctl_dir,
            &locks.modules_dir,
            step,
            &backend.working_dir(),
        )
        .map_err(|e| RiggerError::internal(format!("failed to release infrastructure lock: {}", e)))?;

        let name = step.to_string();
        let destination: Arc<dyn SaveDestination> =
            Arc::new(CacheDestination::new(cache.clone(), state_name(&name)));

        Ok(Self {
            name,
            step,
            backend,
            cache,
            confirm,
            use_state_cache: UseStateCache::default(),
            flags: RunnerFlags::default(),
            hook: Arc::new(NoopHook),
            state_checker: None,
            saver: StateSaver::new(vec![destination]),
            state: Mutex::new(RunnerState::default()),
            init_lock: tokio::sync::Mutex::new(()),
            running: AtomicI32::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    /// Rename the runner. The cache destination follows the new name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        let destination: Arc<dyn SaveDestination> =
            Arc::new(CacheDestination::new(self.cache.clone(), state_name(&self.name)));
        self.saver = StateSaver::new(vec![destination]);
        self
    }

    pub fn with_flags(mut self, flags: RunnerFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_use_state_cache(mut self, use_state_cache: UseStateCache) -> Self {
        self.use_state_cache = use_state_cache;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn InfraActionHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn with_state_checker(mut self, checker: StateChecker) -> Self {
        self.state_checker = Some(checker);
        self
    }

    pub fn with_state_path(self, path: impl Into<PathBuf>) -> Self {
        self.state.lock().state_path = Some(path.into());
        self
    }

    pub fn with_destinations(self, destinations: Vec<Arc<dyn SaveDestination>>) -> Self {
        self.saver.add_destinations(destinations);
        self
    }

    /// Write `data` to a fresh temporary state file and use it.
    pub fn with_state(&self, data: &[u8]) -> RiggerResult<()> {
        let prefix = format!("{}-dhctl.", self.step);
        let path = write_temp(&self.backend.states_dir(), &prefix, STATE_SUFFIX, data)
            .map_err(|e| {
                RiggerError::internal(format!(
                    "can't write infrastructure state for runner {}: {}",
                    self.step, e
                ))
            })?;
        self.state.lock().state_path = Some(path);
        Ok(())
    }

    /// Write `data` to a fresh temporary variables file and use it.
    pub fn with_variables(&self, data: &[u8]) -> RiggerResult<()> {
        let path = write_temp(
            &self.backend.states_dir(),
            VARIABLES_PREFIX,
            VARIABLES_SUFFIX,
            data,
        )
        .map_err(|e| {
            RiggerError::internal(format!(
                "can't write infrastructure variables for runner {}: {}",
                self.step, e
            ))
        })?;
        self.state.lock().variables_path = Some(path);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn flags(&self) -> RunnerFlags {
        self.flags
    }

    pub fn working_dir(&self) -> PathBuf {
        self.backend.working_dir()
    }

    pub fn state_path(&self) -> Option<PathBuf> {
        self.state.lock().state_path.clone()
    }

    pub fn plan_path(&self) -> Option<PathBuf> {
        self.state.lock().plan_path.clone()
    }

    pub fn variables_path(&self) -> Option<PathBuf> {
        self.state.lock().variables_path.clone()
    }

    pub fn changes_in_plan(&self) -> PlanClass {
        self.state.lock().changes_in_plan
    }

    pub fn plan_destructive_changes(&self) -> Option<DestructiveChanges> {
        self.state.lock().destructive_changes.clone()
    }

    pub fn has_vm_destruction(&self) -> bool {
        self.state.lock().has_vm_destruction
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn get_state(&self) -> RiggerResult<Vec<u8>> {
        let path = self
            .state_path()
            .ok_or_else(|| RiggerError::not_found(format!("state of runner {}", self.name)))?;
        Ok(std::fs::read(path)?)
    }

    /// Number of entries in the state's `resources` array, 0 when unreadable.
    pub fn resources_quantity_in_state(&self) -> usize {
        let Some(path) = self.state_path() else {
            return 0;
        };
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                warn!(state = %path.display(), "Cannot read state: {}", e);
                return 0;
            }
        };
        match serde_json::from_slice::<serde_json::Value>(&data) {
            Ok(state) => state
                .get("resources")
                .and_then(|r| r.as_array())
                .map(Vec::len)
                .unwrap_or(0),
            Err(e) => {
                warn!(state = %path.display(), "Cannot parse state: {}", e);
                0
            }
        }
    }

    fn state_name(&self) -> String {
        state_name(&self.name)
    }

    fn ensure_not_stopped(&self) -> RiggerResult<()> {
        if self.is_stopped() {
            return Err(RiggerError::RunnerStopped);
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) % 2 == 1
    }

    /// Run one back-end call under the running counter.
    async fn exec_infra_utility<T, F, Fut>(&self, call: F) -> RiggerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RiggerResult<T>>,
    {
        let current = self.running.load(Ordering::SeqCst);
        if current % 2 == 1
            || self
                .running
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return Err(RiggerError::AlreadyRunning);
        }

        let result = call().await;
        self.running.fetch_add(1, Ordering::SeqCst);
        info!("Infrastructure runner {:?} process exited.", self.step.as_str());
        result
    }

    #[instrument(skip(self), fields(runner = %self.name))]
    pub async fn init(&self) -> RiggerResult<()> {
        self.ensure_not_stopped()?;
        let _guard = self.init_lock.lock().await;

        if self.state_path().is_none() {
            let name = self.state_name();
            let path = self.cache.path(&name);
            self.state.lock().state_path = Some(path.clone());

            if self.cache.in_cache(&name)? {
                info!("Cached infrastructure state found:\n\t{}", path.display());
                if !self.flags.allowed_cached_state {
                    let confirmed = match self.use_state_cache {
                        UseStateCache::Yes => true,
                        UseStateCache::No => false,
                        UseStateCache::Ask => self.confirm.confirm(CACHED_STATE_PROMPT, true),
                    };
                    if !confirmed {
                        warn!(
                            "Infrastructure pipeline aborted. If you want to drop the cache and continue, \
                             please run with \"--yes-i-want-to-drop-cache\" flag."
                        );
                        return Err(RiggerError::ApplyAborted);
                    }
                }

                let data = self.cache.load(&name)?;
                if !data.is_empty() {
                    write_if_changed(&path, &data).map_err(|e| {
                        RiggerError::internal(format!(
                            "can't write infrastructure state for runner {}: {}",
                            self.step, e
                        ))
                    })?;
                }
            }
        }

        info!("infrastructure init ...");
        self.exec_infra_utility(|| self.backend.init()).await
    }

    /// Plan against the current state. With `suppress_output` only the
    /// resource actions are inspected, not the destructive report.
    #[instrument(skip(self), fields(runner = %self.name))]
    pub async fn plan(&self, destroy: bool, suppress_output: bool) -> RiggerResult<()> {
        self.ensure_not_stopped()?;
        info!("infrastructure plan ...");

        let prefix = format!("{}-dhctl.", self.step);
        let plan_path = write_temp(&self.backend.states_dir(), &prefix, PLAN_SUFFIX, &[])
            .map_err(|e| RiggerError::internal(format!("can't create temp file for plan: {}", e)))?;

        let opts = PlanOpts {
            destroy,
            state_path: self.state_path().unwrap_or_default(),
            variables_path: self.variables_path().unwrap_or_default(),
            out_path: Some(plan_path.clone()),
            detailed_exit_code: true,
        };

        {
            let mut state = self.state.lock();
            state.changes_in_plan = PlanClass::NoChanges;
            state.destructive_changes = None;
            state.has_vm_destruction = false;
        }

        let exit_code = self.exec_infra_utility(|| self.backend.plan(opts)).await?;

        if exit_code == HAS_CHANGES_EXIT_CODE {
            self.state.lock().changes_in_plan = PlanClass::HasChanges;

            if suppress_output {
                let actions = self
                    .exec_infra_utility(|| self.backend.get_actions(&plan_path))
                    .await
                    .map_err(|e| show_error(&plan_path, e))?;
                self.state.lock().changes_in_plan = classify_actions(&actions);
            } else {
                let raw = self
                    .exec_infra_utility(|| self.backend.show(&plan_path))
                    .await
                    .map_err(|e| show_error(&plan_path, e))?;
                let plan = Plan::from_slice(&raw)?;
                let report = destructive_report(&plan, |rc| self.backend.is_vm_change(rc))?;
                debug!(has_vm_destruction = report.has_vm_destruction, "Destructive report built");

                if let Some(changes) = report.changes {
                    let mut state = self.state.lock();
                    state.changes_in_plan = PlanClass::HasDestructiveChanges;
                    state.destructive_changes = Some(changes);
                    state.has_vm_destruction = report.has_vm_destruction;
                }
            }
        }

        self.state.lock().plan_path = Some(plan_path);
        Ok(())
    }

    /// Returns true when apply must be skipped.
    async fn is_skip_changes(&self) -> RiggerResult<bool> {
        let changes = self.changes_in_plan();

        if changes == PlanClass::HasDestructiveChanges && self.flags.auto_dismiss.destructive() {
            return Ok(true);
        }

        if changes == PlanClass::NoChanges {
            return Ok(false);
        }

        if self.flags.auto_dismiss.changes() {
            return Err(RiggerError::ApplyAborted);
        }

        if !self.flags.auto_approve && !self.confirm.confirm(CHANGE_PROMPT, false) {
            if self.flags.skip_changes_on_deny {
                return Ok(true);
            }
            return Err(RiggerError::ApplyAborted);
        }

        self.run_before_action_and_wait_ready().await?;
        Ok(false)
    }

    async fn run_before_action_and_wait_ready(&self) -> RiggerResult<()> {
        let run_after = self.hook.before_action(self).await?;

        if let Err(not_ready) = self.hook.is_ready().await {
            let mut errors = vec![not_ready];
            if run_after {
                if let Err(e) = self.hook.after_action(self).await {
                    errors.push(e);
                }
            }
            return RiggerError::collect("infrastructure hook", errors);
        }
        Ok(())
    }

    fn check_state_before_apply(&self) -> RiggerResult<()> {
        let Some(checker) = &self.state_checker else {
            return Ok(());
        };
        let Some(path) = self.state_path() else {
            info!("Infrastructure state path is empty. Skip infrastructure state check.");
            return Ok(());
        };
        match std::fs::read(&path) {
            Ok(data) => checker(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(state = %path.display(), "State file not found, skip check");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(runner = %self.name))]
    pub async fn apply(&self) -> RiggerResult<()> {
        self.ensure_not_stopped()?;
        info!("infrastructure apply ...");

        if self.is_skip_changes().await? {
            info!("Skip infrastructure apply.");
            return Ok(());
        }

        self.check_state_before_apply()?;

        let state_path = self.state_path().unwrap_or_default();
        self.saver.start(&state_path).await?;

        let opts = ApplyOpts {
            state_path,
            plan_path: self.plan_path(),
            variables_path: self.variables_path().unwrap_or_default(),
        };
        let applied = self.exec_infra_utility(|| self.backend.apply(opts)).await;
        let after = self.hook.after_action(self).await;

        self.saver.stop().await;
        merge(applied, after)
    }

    #[instrument(skip(self), fields(runner = %self.name))]
    pub async fn destroy(&self) -> RiggerResult<()> {
        self.ensure_not_stopped()?;

        let Some(state_path) = self.state_path() else {
            return Err(RiggerError::not_found(
                "no state found, try to run infrastructure apply first",
            ));
        };

        if self.flags.auto_dismiss.changes() {
            return Err(RiggerError::ApplyAborted);
        }

        if self.flags.auto_dismiss.destructive() {
            info!("infrastructure destroy skipped");
            return Ok(());
        }

        let variables_path = self.variables_path().unwrap_or_default();
        let plan_opts = PlanOpts {
            destroy: true,
            state_path: state_path.clone(),
            variables_path: variables_path.clone(),
            out_path: None,
            detailed_exit_code: false,
        };
        self.exec_infra_utility(|| self.backend.plan(plan_opts))
            .await
            .map_err(|e| {
                RiggerError::aborted(format!("Cannot prepare infrastructure destroy plan: {}", e))
            })?;

        if !self.flags.auto_approve && !self.confirm.confirm(DELETE_PROMPT, false) {
            return Err(RiggerError::aborted("infrastructure destroy aborted"));
        }

        self.run_before_action_and_wait_ready().await?;

        info!("infrastructure destroy ...");
        self.saver.start(&state_path).await?;

        let opts = DestroyOpts {
            state_path,
            variables_path,
        };
        let destroyed = self.exec_infra_utility(|| self.backend.destroy(opts)).await;
        let after = self.hook.after_action(self).await;

        self.saver.stop().await;
        merge(destroyed, after)
    }

    /// Raw JSON of one output from the current state.
    pub async fn get_infrastructure_output(&self, output: &str) -> RiggerResult<Vec<u8>> {
        self.ensure_not_stopped()?;

        let Some(state_path) = self.state_path() else {
            return Err(RiggerError::not_found(
                "no state found, try to run infastructure apply first",
            ));
        };

        let fields = vec![output.to_string()];
        self.exec_infra_utility(|| self.backend.output(&state_path, &fields))
            .await
            .map_err(|e| {
                wrap_backend_error(
                    e,
                    format!("can't get infrastructure output for {:?}", output),
                )
            })
    }

    /// JSON rendition of the last plan.
    pub async fn show_plan(&self) -> RiggerResult<Vec<u8>> {
        self.ensure_not_stopped()?;
        let Some(plan_path) = self.plan_path() else {
            return Err(RiggerError::not_found("no plan found, try to run infrastructure plan first"));
        };
        self.exec_infra_utility(|| self.backend.show(&plan_path))
            .await
            .map_err(|e| show_error(&plan_path, e))
    }

    /// Interrupt the running child, refuse further work and wait until the
    /// child and the state saver are done.
    pub async fn stop(&self) {
        if self.is_running() && !self.is_stopped() {
            debug!("Runner Stop is called for {}.", self.name);
            self.backend.stop();
        }
        self.stopped.store(true, Ordering::SeqCst);

        while self.is_running() {
            tokio::time::sleep(Duration::from_millis(STOP_POLL_INTERVAL_MS)).await;
        }

        if self.saver.is_started() {
            self.saver.done().await;
        }
    }
}

fn state_name(name: &str) -> String {
    format!("{}.tfstate", name)
}

fn merge(first: RiggerResult<()>, second: RiggerResult<()>) -> RiggerResult<()> {
    let errors: Vec<RiggerError> = [first.err(), second.err()].into_iter().flatten().collect();
    RiggerError::collect("infrastructure action", errors)
}

fn wrap_backend_error(error: RiggerError, context: String) -> RiggerError {
    match error {
        RiggerError::RunnerStopped | RiggerError::AlreadyRunning => error,
        RiggerError::BackendExit { exit_code, message } => RiggerError::BackendExit {
            exit_code,
            message: format!("{}\n{}", context, message),
        },
        other => RiggerError::BackendExit {
            exit_code: -1,
            message: format!("{}\n{}", context, other),
        },
    }
}

fn show_error(plan_path: &Path, error: RiggerError) -> RiggerError {
    wrap_backend_error(
        error,
        format!("can't get infrastructure plan for {:?}", plan_path.display().to_string()),
    )
}

fn write_temp(dir: &Path, prefix: &str, suffix: &str, data: &[u8]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(dir)?;
    file.write_all(data)?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

fn write_if_changed(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Ok(current) = std::fs::read(path) {
        if current == data {
            return Ok(());
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_dismiss_flags() {
        assert_eq!(AutoDismiss::from_flags(false, false), AutoDismiss::None);
        assert!(AutoDismiss::from_flags(true, true).destructive());
        assert!(AutoDismiss::from_flags(true, true).changes());
        assert!(!AutoDismiss::Destructive.changes());
        assert!(!AutoDismiss::Changes.destructive());
    }

    #[test]
    fn test_merge_keeps_single_error() {
        let merged = merge(Err(RiggerError::ApplyAborted), Ok(()));
        assert!(matches!(merged, Err(RiggerError::ApplyAborted)));
        assert!(merge(Ok(()), Ok(())).is_ok());
        let both = merge(
            Err(RiggerError::internal("apply")),
            Err(RiggerError::internal("hook")),
        );
        assert!(matches!(both, Err(RiggerError::Multiple { .. })));
    }

    #[test]
    fn test_temp_file_naming() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(dir.path(), "master-node-dhctl.", STATE_SUFFIX, b"{}").unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("master-node-dhctl."));
        assert!(name.ends_with(".tfstate"));
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
    }

    #[test]
    fn test_wrap_keeps_sentinels() {
        let wrapped = wrap_backend_error(RiggerError::RunnerStopped, "ctx".to_string());
        assert!(matches!(wrapped, RiggerError::RunnerStopped));
        let wrapped = wrap_backend_error(
            RiggerError::BackendExit {
                exit_code: 1,
                message: "boom".to_string(),
            },
            "can't get infrastructure output for \"x\"".to_string(),
        );
        assert_eq!(wrapped.to_string(), "can't get infrastructure output for \"x\"\nboom");
    }
}
