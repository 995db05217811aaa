//! Child process execution for the infrastructure utility
//!
//! Every child runs in its own process group so a signal sent to the parent
//! shell does not reach it. Interrupts are delivered as SIGINT to the whole
//! group, either through [`ProcessSlot::interrupt`] or when the cancellation
//! token fires.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use rigger_core::config::defaults::HAS_CHANGES_EXIT_CODE;
use rigger_core::error::{RiggerError, RiggerResult};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error text reported in debug mode, where stderr goes to the log instead.
pub const DEBUG_FAILURE_MESSAGE: &str = "failed in DEBUG mode, search output above";

/// Verbose-log lines the utility writes to stderr. They are not errors.
static VERBOSE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[(TRACE|DEBUG|INFO|WARN|ERROR)\]|Use TF_LOG=|there is no package|----")
        .expect("verbose line pattern is valid")
});

pub fn is_verbose_line(line: &str) -> bool {
    VERBOSE_LINE.is_match(line)
}

#[derive(Debug, Clone, Default)]
pub struct InfraCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl InfraCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

/// Process group of the child that is currently running, if any.
#[derive(Debug, Clone, Default)]
pub struct ProcessSlot {
    pgid: Arc<Mutex<Option<i32>>>,
}

impl ProcessSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, pid: Option<u32>) {
        *self.pgid.lock() = pid.map(|p| p as i32);
    }

    fn clear(&self) {
        *self.pgid.lock() = None;
    }

    pub fn is_running(&self) -> bool {
        self.pgid.lock().is_some()
    }

    /// Send SIGINT to the running child's process group. Returns false when
    /// nothing is running.
    pub fn interrupt(&self) -> bool {
        let Some(pgid) = *self.pgid.lock() else {
            return false;
        };
        debug!(pgid, "Sending SIGINT to process group");
        if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGINT) {
            warn!(pgid, "Failed to interrupt process group: {}", e);
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Name used in log fields
    pub runner: String,
    pub debug: bool,
}

/// Run `cmd` streaming its output into the log.
///
/// Returns the exit code for 0 and the has-changes code; any other exit is
/// a [`RiggerError::BackendExit`] carrying the filtered stderr. Returns only
/// after the child was reaped and both streams were drained.
pub async fn exec(
    cmd: &InfraCommand,
    opts: &ExecOptions,
    slot: &ProcessSlot,
    cancel: &CancellationToken,
) -> RiggerResult<i32> {
    debug!(program = %cmd.program.display(), args = ?cmd.args, "Starting infrastructure utility");

    let mut child = cmd.to_command().spawn()?;
    slot.set(child.id());

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RiggerError::internal("child stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RiggerError::internal("child stderr was not captured"))?;

    let runner = opts.runner.clone();
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(runner = %runner, "{}", line);
        }
    });

    let debug_mode = opts.debug;
    let stderr_task = tokio::spawn(async move {
        let mut errors = String::new();
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if debug_mode {
                debug!("{}", line);
                continue;
            }
            if is_verbose_line(&line) {
                continue;
            }
            errors.push_str(&line);
            errors.push('\n');
        }
        errors
    });

    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            slot.interrupt();
            child.wait().await
        }
    };
    slot.clear();

    let _ = stdout_task.await;
    let errors = stderr_task.await.unwrap_or_default();
    let status = status?;

    let exit_code = status.code().unwrap_or(-1);
    if exit_code == 0 || exit_code == HAS_CHANGES_EXIT_CODE {
        return Ok(exit_code);
    }

    let message = if debug_mode {
        DEBUG_FAILURE_MESSAGE.to_string()
    } else {
        errors.trim_end().to_string()
    };
    Err(RiggerError::BackendExit { exit_code, message })
}

/// Run `cmd` and capture stdout. On failure the error carries stderr
/// followed by the exit status.
pub async fn output(
    cmd: &InfraCommand,
    slot: &ProcessSlot,
    cancel: &CancellationToken,
) -> RiggerResult<Vec<u8>> {
    let mut child = cmd.to_command().spawn()?;
    slot.set(child.id());

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| RiggerError::internal("child stdout was not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| RiggerError::internal("child stderr was not captured"))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            slot.interrupt();
            child.wait().await
        }
    };
    slot.clear();

    let out = stdout_task.await?;
    let err = stderr_task.await?;
    let status = status?;

    if status.success() {
        return Ok(out);
    }

    let exit_code = status.code().unwrap_or(-1);
    Err(RiggerError::BackendExit {
        exit_code,
        message: format!("{}\n{}", String::from_utf8_lossy(&err).trim_end(), status),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> InfraCommand {
        InfraCommand::new("/bin/sh").arg("-c").arg(script)
    }

    #[test]
    fn test_verbose_filter() {
        assert!(is_verbose_line("2024/01/01 [DEBUG] provider: starting"));
        assert!(is_verbose_line("Use TF_LOG=TRACE to see more"));
        assert!(is_verbose_line("---- request ----"));
        assert!(!is_verbose_line("Error: Invalid provider configuration"));
    }

    #[test]
    fn test_separator_anywhere_is_verbose() {
        assert!(is_verbose_line("----------"));
        assert!(is_verbose_line("  --------"));
        assert!(is_verbose_line("Error: ---- separator"));
        assert!(!is_verbose_line("Error: --var is not allowed"));
    }

    #[tokio::test]
    async fn test_indented_separator_is_filtered_from_stderr() {
        let err = exec(
            &sh("echo '  ------' >&2; echo 'Error: boom' >&2; exit 1"),
            &ExecOptions::default(),
            &ProcessSlot::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            RiggerError::BackendExit { message, .. } => assert_eq!(message, "Error: boom"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_has_changes_exit_is_not_an_error() {
        let code = exec(
            &sh("echo planned; exit 2"),
            &ExecOptions::default(),
            &ProcessSlot::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(code, 2);
    }

    #[tokio::test]
    async fn test_failure_carries_filtered_stderr() {
        let err = exec(
            &sh("echo '[INFO] noise' >&2; echo 'Error: boom' >&2; exit 1"),
            &ExecOptions::default(),
            &ProcessSlot::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            RiggerError::BackendExit { exit_code, message } => {
                assert_eq!(exit_code, 1);
                assert_eq!(message, "Error: boom");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_debug_mode_uses_sentinel() {
        let opts = ExecOptions {
            runner: "base-infrastructure".to_string(),
            debug: true,
        };
        let err = exec(
            &sh("echo 'Error: boom' >&2; exit 3"),
            &opts,
            &ProcessSlot::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), DEBUG_FAILURE_MESSAGE);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_process_group() {
        let cancel = CancellationToken::new();
        let slot = ProcessSlot::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = exec(&sh("sleep 30"), &ExecOptions::default(), &slot, &cancel).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!slot.is_running());
    }

    #[tokio::test]
    async fn test_output_returns_stderr_on_error() {
        let slot = ProcessSlot::new();
        let cancel = CancellationToken::new();
        let out = output(&sh("printf '{\"a\":1}'"), &slot, &cancel).await.unwrap();
        assert_eq!(out, b"{\"a\":1}");

        let err = output(&sh("echo 'no state' >&2; exit 1"), &slot, &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("no state\n"));
    }
}
