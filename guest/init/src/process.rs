//! Child process supervision.
//!
//! The supervisor owns each child's handle and learns about its end through
//! an explicit exit status. Liveness checks wait for that status with a
//! deadline instead of polling.

use std::future::Future;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use thinboot_core::error::{Result, ThinbootError};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, absent when the process was killed by a signal.
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Captured result of a command run to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit: ExitOutcome,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit.success()
    }

    /// Both streams, stdout first.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

/// Runs short-lived helper programs (modprobe, udhcpc, ntpd, ...).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion and capture its output. A non-zero exit
    /// is reported in the output, not as an error.
    async fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput>;

    /// Like [`CommandRunner::run`], feeding `input` on stdin.
    async fn run_with_input(&self, program: &Path, args: &[String], input: &str) -> Result<CommandOutput>;
}

/// Runner backed by real processes. With a deadline, a helper still
/// running when it passes is killed and reported as a timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner {
    deadline: Option<Duration>,
}

impl SystemRunner {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    async fn bounded<T>(&self, program: &Path, work: impl Future<Output = std::io::Result<T>>) -> Result<T> {
        let result = match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, work).await.map_err(|_| {
                tracing::warn!(program = %program.display(), ?deadline, "Command killed at deadline");
                ThinbootError::TimeoutError(format!(
                    "{} still running after {}s",
                    program.display(),
                    deadline.as_secs_f32()
                ))
            })?,
            None => work.await,
        };
        result.map_err(|e| process_error(program, e))
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput> {
        tracing::debug!(program = %program.display(), ?args, "Running command");
        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        let output = self.bounded(program, command.output()).await?;
        Ok(CommandOutput {
            exit: output.status.into(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn run_with_input(&self, program: &Path, args: &[String], input: &str) -> Result<CommandOutput> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| process_error(program, e))?;
        let stdin = child.stdin.take();
        let output = self
            .bounded(program, async move {
                if let Some(mut stdin) = stdin {
                    stdin.write_all(input.as_bytes()).await?;
                }
                child.wait_with_output().await
            })
            .await?;
        Ok(CommandOutput {
            exit: output.status.into(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

pub(crate) fn process_error(program: &Path, e: impl std::fmt::Display) -> ThinbootError {
    ThinbootError::ProcessError {
        program: program.display().to_string(),
        message: e.to_string(),
    }
}

/// A long-running child whose end the supervisor waits for.
#[async_trait]
pub trait Supervised: Send {
    /// Wait up to `window` for the process to end. `None` means it is still
    /// running when the window closes.
    async fn exited_within(&mut self, window: Duration) -> Result<Option<ExitOutcome>>;

    /// Wait for the process to end.
    async fn wait(&mut self) -> Result<ExitOutcome>;

    /// Terminate the process and reap it.
    async fn terminate(&mut self) -> Result<()>;
}

/// A spawned child process.
#[derive(Debug)]
pub struct SupervisedChild {
    program: String,
    child: Child,
}

impl SupervisedChild {
    /// Spawn `program` with its output discarded or redirected by `configure`.
    pub fn spawn(
        program: &Path,
        args: &[String],
        configure: impl FnOnce(&mut Command),
    ) -> Result<Self> {
        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).kill_on_drop(false);
        configure(&mut command);

        let child = command.spawn().map_err(|e| process_error(program, e))?;
        tracing::debug!(program = %program.display(), pid = ?child.id(), "Spawned child");
        Ok(Self {
            program: program.display().to_string(),
            child,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn error(&self, e: impl std::fmt::Display) -> ThinbootError {
        ThinbootError::ProcessError {
            program: self.program.clone(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl Supervised for SupervisedChild {
    async fn exited_within(&mut self, window: Duration) -> Result<Option<ExitOutcome>> {
        match tokio::time::timeout(window, self.child.wait()).await {
            Ok(status) => Ok(Some(status.map_err(|e| self.error(e))?.into())),
            Err(_) => Ok(None),
        }
    }

    async fn wait(&mut self) -> Result<ExitOutcome> {
        let status = self.child.wait().await.map_err(|e| self.error(e))?;
        Ok(status.into())
    }

    async fn terminate(&mut self) -> Result<()> {
        if self.child.try_wait().map_err(|e| self.error(e))?.is_some() {
            return Ok(());
        }
        self.child.kill().await.map_err(|e| self.error(e))
    }
}
