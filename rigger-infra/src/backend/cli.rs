//! Command-line driver shared by terraform and opentofu
//!
//! Both utilities take the same arguments. They differ only in where the
//! working directory goes: terraform takes it as the last positional
//! argument, opentofu as a leading `-chdir=`.

use super::{vm_resource_type, BackendParams, InfraBackend};
use crate::executor::{self, ExecOptions, InfraCommand, ProcessSlot};
use crate::plan::ResourceChange;
use crate::types::{ApplyOpts, DestroyOpts, PlanOpts, Step};
use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rigger_core::error::{RiggerError, RiggerResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type InitOutcome = Result<(), (i32, String)>;

/// One init per `(plugins dir, working dir)` for the whole process
static INIT_ONCE: Lazy<DashMap<(PathBuf, PathBuf), Arc<OnceCell<InitOutcome>>>> =
    Lazy::new(DashMap::new);

const PROXY_VARS: [&str; 6] = [
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingDirArg {
    /// Last positional argument
    Positional,
    /// Leading `-chdir=<dir>`
    Chdir,
}

pub struct CliBackend {
    params: BackendParams,
    placement: WorkingDirArg,
    slot: ProcessSlot,
    cancel: CancellationToken,
}

impl CliBackend {
    pub fn new(params: BackendParams, placement: WorkingDirArg) -> Self {
        Self {
            params,
            placement,
            slot: ProcessSlot::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn params(&self) -> &BackendParams {
        &self.params
    }

    fn env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Ok(path) = std::env::var("PATH") {
            env.push(("PATH".to_string(), path));
        }
        for name in PROXY_VARS {
            if let Ok(value) = std::env::var(name) {
                env.push((name.to_string(), value));
            }
        }
        env.push((
            "HOME".to_string(),
            self.params.root_dir.display().to_string(),
        ));
        env.push(("TF_IN_AUTOMATION".to_string(), "yes".to_string()));
        env.push((
            "TF_DATA_DIR".to_string(),
            self.params.data_dir.display().to_string(),
        ));
        let level = if self.params.debug { "DEBUG" } else { "INFO" };
        env.push(("TF_LOG".to_string(), level.to_string()));
        env
    }

    /// Assemble a command. `with_dir` places the working directory the way
    /// this utility expects it.
    pub fn command(&self, subcommand: &str, args: Vec<String>, with_dir: bool) -> InfraCommand {
        let mut cmd = InfraCommand::new(&self.params.binary);
        if with_dir && self.placement == WorkingDirArg::Chdir {
            cmd = cmd.arg(format!("-chdir={}", self.params.working_dir.display()));
        }
        cmd = cmd.arg(subcommand).args(args);
        if with_dir && self.placement == WorkingDirArg::Positional {
            cmd = cmd.arg(self.params.working_dir.display().to_string());
        }
        cmd.env = self.env();
        cmd
    }

    pub fn init_command(&self) -> InfraCommand {
        let mut args = vec![
            format!("-plugin-dir={}", self.params.plugins_dir.display()),
            "-no-color".to_string(),
            "-input=false".to_string(),
        ];
        if self.placement == WorkingDirArg::Positional {
            args.push("-get-plugins=false".to_string());
        }
        self.command("init", args, true)
    }

    pub fn apply_command(&self, opts: &ApplyOpts) -> InfraCommand {
        let state = opts.state_path.display().to_string();
        let mut args = vec![
            "-input=false".to_string(),
            "-no-color".to_string(),
            "-auto-approve".to_string(),
            format!("-state={}", state),
            format!("-state-out={}", state),
        ];
        match &opts.plan_path {
            Some(plan) => {
                args.push(plan.display().to_string());
                self.command("apply", args, false)
            }
            None => {
                args.push(format!("-var-file={}", opts.variables_path.display()));
                self.command("apply", args, true)
            }
        }
    }

    pub fn plan_command(&self, opts: &PlanOpts) -> InfraCommand {
        let mut args = vec![
            "-input=false".to_string(),
            "-no-color".to_string(),
            format!("-var-file={}", opts.variables_path.display()),
            format!("-state={}", opts.state_path.display()),
        ];
        if opts.detailed_exit_code {
            args.push("-detailed-exitcode".to_string());
        }
        if let Some(out) = &opts.out_path {
            args.push(format!("-out={}", out.display()));
        }
        if opts.destroy {
            args.push("-destroy".to_string());
        }
        self.command("plan", args, true)
    }

    pub fn destroy_command(&self, opts: &DestroyOpts) -> InfraCommand {
        let args = vec![
            "-no-color".to_string(),
            "-auto-approve".to_string(),
            format!("-var-file={}", opts.variables_path.display()),
            format!("-state={}", opts.state_path.display()),
        ];
        self.command("destroy", args, true)
    }

    pub fn output_command(&self, state_path: &Path, fields: &[String]) -> InfraCommand {
        let mut args = vec![
            "-no-color".to_string(),
            "-json".to_string(),
            format!("-state={}", state_path.display()),
        ];
        args.extend(fields.iter().cloned());
        self.command("output", args, false)
    }

    pub fn show_command(&self, plan_path: &Path) -> InfraCommand {
        let args = vec!["-json".to_string(), plan_path.display().to_string()];
        self.command("show", args, false)
    }

    async fn exec(&self, cmd: &InfraCommand) -> RiggerResult<i32> {
        let opts = ExecOptions {
            runner: self.params.step.to_string(),
            debug: self.params.debug,
        };
        executor::exec(cmd, &opts, &self.slot, &self.cancel).await
    }
}

#[async_trait]
impl InfraBackend for CliBackend {
    async fn init(&self) -> RiggerResult<()> {
        let key = (
            self.params.plugins_dir.clone(),
            self.params.working_dir.clone(),
        );
        let cell = INIT_ONCE.entry(key).or_default().clone();

        let outcome = cell
            .get_or_init(|| async {
                debug!(working_dir = %self.params.working_dir.display(), "Running infrastructure init");
                self.exec(&self.init_command())
                    .await
                    .map(|_| ())
                    .map_err(|e| match e {
                        RiggerError::BackendExit { exit_code, message } => (exit_code, message),
                        other => (-1, other.to_string()),
                    })
            })
            .await;

        outcome
            .clone()
            .map_err(|(exit_code, message)| RiggerError::BackendExit { exit_code, message })
    }

    async fn apply(&self, opts: ApplyOpts) -> RiggerResult<()> {
        self.exec(&self.apply_command(&opts)).await.map(|_| ())
    }

    async fn plan(&self, opts: PlanOpts) -> RiggerResult<i32> {
        self.exec(&self.plan_command(&opts)).await
    }

    async fn destroy(&self, opts: DestroyOpts) -> RiggerResult<()> {
        self.exec(&self.destroy_command(&opts)).await.map(|_| ())
    }

    async fn output(&self, state_path: &Path, fields: &[String]) -> RiggerResult<Vec<u8>> {
        executor::output(&self.output_command(state_path, fields), &self.slot, &self.cancel).await
    }

    async fn show(&self, plan_path: &Path) -> RiggerResult<Vec<u8>> {
        executor::output(&self.show_command(plan_path), &self.slot, &self.cancel).await
    }

    fn is_vm_change(&self, change: &ResourceChange) -> bool {
        vm_resource_type(&self.params.provider)
            .map(|vm_type| change.type_ == vm_type)
            .unwrap_or(false)
    }

    fn states_dir(&self) -> PathBuf {
        self.params.states_dir.clone()
    }

    fn step(&self) -> Step {
        self.params.step
    }

    fn working_dir(&self) -> PathBuf {
        self.params.working_dir.clone()
    }

    fn stop(&self) {
        self.slot.interrupt();
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(binary: &str, working_dir: &Path) -> BackendParams {
        BackendParams {
            binary: PathBuf::from(binary),
            root_dir: PathBuf::from("/opt/rigger"),
            plugins_dir: PathBuf::from("/opt/rigger/plugins"),
            working_dir: working_dir.to_path_buf(),
            data_dir: PathBuf::from("/tmp/rigger/tf_dhctl"),
            states_dir: PathBuf::from("/tmp/rigger"),
            step: Step::BaseInfrastructure,
            provider: "yandex".to_string(),
            debug: false,
        }
    }

    #[test]
    fn test_terraform_apply_with_plan_omits_vars_and_dir() {
        let backend = CliBackend::new(params("terraform", Path::new("/w")), WorkingDirArg::Positional);
        let cmd = backend.apply_command(&ApplyOpts {
            state_path: PathBuf::from("/s.tfstate"),
            plan_path: Some(PathBuf::from("/p.tfplan")),
            variables_path: PathBuf::from("/v.json"),
        });
        assert_eq!(
            cmd.args,
            vec![
                "apply",
                "-input=false",
                "-no-color",
                "-auto-approve",
                "-state=/s.tfstate",
                "-state-out=/s.tfstate",
                "/p.tfplan",
            ]
        );
    }

    #[test]
    fn test_terraform_plan_places_dir_last() {
        let backend = CliBackend::new(params("terraform", Path::new("/w")), WorkingDirArg::Positional);
        let cmd = backend.plan_command(&PlanOpts {
            destroy: true,
            state_path: PathBuf::from("/s"),
            variables_path: PathBuf::from("/v"),
            out_path: Some(PathBuf::from("/p")),
            detailed_exit_code: true,
        });
        assert_eq!(
            cmd.args,
            vec![
                "plan",
                "-input=false",
                "-no-color",
                "-var-file=/v",
                "-state=/s",
                "-detailed-exitcode",
                "-out=/p",
                "-destroy",
                "/w",
            ]
        );
    }

    #[test]
    fn test_tofu_uses_chdir() {
        let backend = CliBackend::new(params("opentofu", Path::new("/w")), WorkingDirArg::Chdir);
        let cmd = backend.destroy_command(&DestroyOpts {
            state_path: PathBuf::from("/s"),
            variables_path: PathBuf::from("/v"),
        });
        assert_eq!(cmd.args[0], "-chdir=/w");
        assert_eq!(cmd.args[1], "destroy");
        assert_eq!(cmd.args.last().map(String::as_str), Some("-state=/s"));

        let init = backend.init_command();
        assert!(!init.args.iter().any(|a| a == "-get-plugins=false"));
    }

    #[test]
    fn test_env_contains_automation_vars() {
        let backend = CliBackend::new(params("terraform", Path::new("/w")), WorkingDirArg::Positional);
        let env = backend.show_command(Path::new("/p")).env;
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("TF_IN_AUTOMATION"), Some("yes"));
        assert_eq!(get("TF_DATA_DIR"), Some("/tmp/rigger/tf_dhctl"));
        assert_eq!(get("TF_LOG"), Some("INFO"));
        assert_eq!(get("HOME"), Some("/opt/rigger"));
    }

    #[tokio::test]
    async fn test_init_runs_once_per_directory_pair() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let script = dir.path().join("fake-tf");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho run >> {}\n", counter.display()),
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let mut p = params(script.to_str().unwrap(), dir.path());
        p.plugins_dir = dir.path().join("plugins");
        let first = CliBackend::new(p.clone(), WorkingDirArg::Positional);
        let second = CliBackend::new(p, WorkingDirArg::Positional);

        first.init().await.unwrap();
        second.init().await.unwrap();

        let runs = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }
}
