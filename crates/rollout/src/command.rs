//! Subprocess execution with hard per-call timeouts.
//!
//! All external CLIs (`kubectl`, `terraform`, `az`, `pluto`) go through the
//! [`CommandRunner`] trait so a hung call can never stall a run and so the
//! collaborators can be replaced in tests.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Errors from running an external command.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The binary could not be started.
    #[error("Failed to spawn {command}: {message}")]
    Spawn { command: String, message: String },

    /// The command exceeded its hard timeout and was killed.
    #[error("{command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    /// The command exited non-zero.
    #[error("{command} exited with {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// A fully described invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    /// Start a new spec with a default 60s timeout.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
            timeout: Duration::from_secs(60),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Render as a shell-like string for logs and error messages.
    #[must_use]
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Convenience constructor for a successful output.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Runs external commands.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command and capture its output, regardless of exit code.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// Run a command and turn a non-zero exit into [`CommandError::Failed`].
///
/// # Errors
///
/// Returns an error if the command cannot be spawned, times out, or exits
/// non-zero.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
) -> Result<CommandOutput, CommandError> {
    let output = runner.run(spec).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(CommandError::Failed {
            command: spec.display(),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let cmd_display = spec.display();
        debug!(command = %cmd_display, timeout_secs = spec.timeout.as_secs(), "Running command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| CommandError::Spawn {
            command: cmd_display.clone(),
            message: e.to_string(),
        })?;

        if let Some(input) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .await
                    .map_err(|e| CommandError::Spawn {
                        command: cmd_display.clone(),
                        message: format!("failed to write stdin: {e}"),
                    })?;
            }
        }

        let start = Instant::now();
        let output = match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| CommandError::Spawn {
                command: cmd_display.clone(),
                message: e.to_string(),
            })?,
            // kill_on_drop reaps the child once the future is dropped
            Err(_) => {
                return Err(CommandError::Timeout {
                    command: cmd_display,
                    secs: spec.timeout.as_secs(),
                })
            }
        };

        debug!(
            command = %cmd_display,
            code = output.status.code().unwrap_or(-1),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Command finished"
        );

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Check whether a binary is available on `PATH`.
#[must_use]
pub fn tool_available(name: &str) -> bool {
    which::which(name).is_ok()
}
