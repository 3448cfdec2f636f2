//! cafe-exec: pluggable runners for a task's `command`.
//!
//! A task with an empty `command` is a pure rule and never reaches this
//! crate — its result comes directly from `cafe-session`'s synchronous
//! rule closure. Everything else is dispatched to one of the runners
//! here. Cancellation is grounded on
//! `turborepo-process::child::ShutdownStyle`: send an interrupt, wait up to
//! a duration, then escalate to a kill. The full pty/job-object machinery
//! that crate carries for interactive terminal children is not needed —
//! task commands run batch and non-interactive — so only the
//! signal-then-timeout-then-kill shape is kept, not the pty layer.

use std::{process::Stdio, time::Duration};

use camino::Utf8Path;
use thiserror::Error;
use tokio::{io::AsyncReadExt, process::Command, time::error::Elapsed};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("io error running task command: {0}")]
    Io(#[from] std::io::Error),
    #[error("task command exceeded its timeout")]
    Timeout,
}

impl From<Elapsed> for ExecError {
    fn from(_: Elapsed) -> Self {
        ExecError::Timeout
    }
}

/// How a runner tears a still-running command down when asked to stop.
#[derive(Debug, Clone, Copy)]
pub enum ShutdownStyle {
    /// Send `SIGINT`, wait up to the duration, then kill.
    Graceful(Duration),
    /// Kill immediately.
    Kill,
}

/// A task ready to run: its shell command and the sandbox directory its
/// inputs have already been materialized into (by `cafe-cellar::checkout`).
pub struct TaskSpec<'a> {
    pub command: &'a str,
    pub sandbox: &'a Utf8Path,
}

/// What came out of running a `TaskSpec`.
#[derive(Debug)]
pub struct ExecOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Runs task commands as real child processes.
pub struct LocalExecutor {
    shutdown: ShutdownStyle,
}

impl LocalExecutor {
    pub fn new(shutdown: ShutdownStyle) -> Self {
        Self { shutdown }
    }

    #[tracing::instrument(skip(self, spec), fields(sandbox = %spec.sandbox))]
    pub async fn run(&self, spec: &TaskSpec<'_>, timeout: Option<Duration>) -> Result<ExecOutcome, ExecError> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(spec.command)
            .current_dir(spec.sandbox)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn()?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_end(&mut stdout).await?;
        }
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_end(&mut stderr).await?;
        }

        let status = match timeout {
            Some(duration) => tokio::time::timeout(duration, child.wait()).await??,
            None => child.wait().await?,
        };

        Ok(ExecOutcome {
            success: status.success(),
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }

    /// Interrupts a running child per `self.shutdown`, escalating to a
    /// kill if it does not exit within the grace period.
    #[cfg(unix)]
    pub async fn stop(&self, child: &mut tokio::process::Child) -> Result<(), ExecError> {
        match self.shutdown {
            ShutdownStyle::Graceful(timeout) => {
                if let Some(pid) = child.id() {
                    tracing::debug!(pid, "sending SIGTERM");
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                }
                if tokio::time::timeout(timeout, child.wait()).await.is_err() {
                    tracing::debug!("graceful shutdown timed out, killing");
                    child.kill().await?;
                }
            }
            ShutdownStyle::Kill => {
                child.kill().await?;
            }
        }
        Ok(())
    }
}

/// Records what a task's command would have done without running it.
pub struct DryRunExecutor;

impl DryRunExecutor {
    pub fn run(&self, spec: &TaskSpec<'_>) -> ExecOutcome {
        tracing::info!(command = %spec.command, sandbox = %spec.sandbox, "dry run: would execute");
        ExecOutcome {
            success: true,
            exit_code: Some(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_executor_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let executor = LocalExecutor::new(ShutdownStyle::Kill);
        let spec = TaskSpec { command: "echo hello", sandbox: &sandbox };

        let outcome = executor.run(&spec, None).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(String::from_utf8_lossy(&outcome.stdout).trim(), "hello");
    }

    #[tokio::test]
    async fn local_executor_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let executor = LocalExecutor::new(ShutdownStyle::Kill);
        let spec = TaskSpec { command: "exit 3", sandbox: &sandbox };

        let outcome = executor.run(&spec, None).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn local_executor_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let executor = LocalExecutor::new(ShutdownStyle::Kill);
        let spec = TaskSpec { command: "sleep 5", sandbox: &sandbox };

        let result = executor.run(&spec, Some(Duration::from_millis(50))).await;

        assert!(matches!(result, Err(ExecError::Timeout)));
    }

    #[test]
    fn dry_run_never_touches_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let outcome = DryRunExecutor.run(&TaskSpec { command: "rm -rf /", sandbox: &sandbox });
        assert!(outcome.success);
    }
}
