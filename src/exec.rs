use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, StagecraftError};

/// A command to hand to a [`CommandRunner`]. Unlike `tokio::process::Command`
/// this is `Clone` and inspectable, which keeps runners mock-friendly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<PathBuf>,
    /// Bytes piped to the child's stdin, then closed.
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            workdir: None,
            stdin: None,
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

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// Single-line rendering for logs. Environment values are omitted.
    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a completed child process.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Deterministic process execution seam. Implementations must not hold
/// global mutable state across invocations; tests substitute mocks.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, capturing stdout/stderr.
    async fn run(&self, cancel: &CancellationToken, cmd: &CommandSpec) -> Result<ExecOutput>;

    /// Run to completion, streaming combined output into `sink`.
    async fn run_stream(
        &self,
        cancel: &CancellationToken,
        cmd: &CommandSpec,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<i32>;
}

/// Runner backed by `tokio::process`. Children are spawned with
/// `kill_on_drop` and terminated (and awaited) when the caller cancels, so
/// no orphaned processes survive a cancelled run.
pub struct LocalProcessRunner;

impl LocalProcessRunner {
    fn command(cmd: &CommandSpec) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&cmd.program);
        command.args(&cmd.args);
        for (key, value) in &cmd.env {
            command.env(key, value);
        }
        if let Some(dir) = &cmd.workdir {
            command.current_dir(dir);
        }
        command.kill_on_drop(true);
        command.stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command
    }

    async fn feed_stdin(child: &mut tokio::process::Child, cmd: &CommandSpec) -> Result<()> {
        if let Some(bytes) = &cmd.stdin {
            let mut stdin = child.stdin.take().ok_or_else(|| {
                StagecraftError::ExecutionFailed("child stdin handle missing".to_string())
            })?;
            stdin.write_all(bytes).await?;
            stdin.shutdown().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for LocalProcessRunner {
    async fn run(&self, cancel: &CancellationToken, cmd: &CommandSpec) -> Result<ExecOutput> {
        debug!(command = %cmd.display_line(), "running");
        let mut command = Self::command(cmd);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn().map_err(spawn_error(cmd))?;
        Self::feed_stdin(&mut child, cmd).await?;

        let mut stdout = take_pipe(child.stdout.take(), "stdout")?;
        let mut stderr = take_pipe(child.stderr.take(), "stderr")?;
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut out_buf = [0u8; 4096];
        let mut err_buf = [0u8; 4096];
        let mut out_open = true;
        let mut err_open = true;

        loop {
            tokio::select! {
                read = stdout.read(&mut out_buf), if out_open => {
                    match read? {
                        0 => out_open = false,
                        n => out.extend_from_slice(&out_buf[..n]),
                    }
                }
                read = stderr.read(&mut err_buf), if err_open => {
                    match read? {
                        0 => err_open = false,
                        n => err.extend_from_slice(&err_buf[..n]),
                    }
                }
                status = child.wait(), if !out_open && !err_open => {
                    let status = status?;
                    return Ok(ExecOutput {
                        status: status.code(),
                        stdout: String::from_utf8_lossy(&out).into_owned(),
                        stderr: String::from_utf8_lossy(&err).into_owned(),
                    });
                }
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    return Err(StagecraftError::Cancelled);
                }
            }
        }
    }

    async fn run_stream(
        &self,
        cancel: &CancellationToken,
        cmd: &CommandSpec,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<i32> {
        debug!(command = %cmd.display_line(), "running (streamed)");
        let mut command = Self::command(cmd);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn().map_err(spawn_error(cmd))?;
        Self::feed_stdin(&mut child, cmd).await?;

        let mut stdout = take_pipe(child.stdout.take(), "stdout")?;
        let mut stderr = take_pipe(child.stderr.take(), "stderr")?;
        let mut out_buf = [0u8; 4096];
        let mut err_buf = [0u8; 4096];
        let mut out_open = true;
        let mut err_open = true;

        loop {
            tokio::select! {
                read = stdout.read(&mut out_buf), if out_open => {
                    match read? {
                        0 => out_open = false,
                        n => sink.write_all(&out_buf[..n]).await?,
                    }
                }
                read = stderr.read(&mut err_buf), if err_open => {
                    match read? {
                        0 => err_open = false,
                        n => sink.write_all(&err_buf[..n]).await?,
                    }
                }
                status = child.wait(), if !out_open && !err_open => {
                    let status = status?;
                    return Ok(status.code().unwrap_or(-1));
                }
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    return Err(StagecraftError::Cancelled);
                }
            }
        }
    }
}

fn take_pipe<T>(pipe: Option<T>, name: &str) -> Result<T> {
    pipe.ok_or_else(|| StagecraftError::ExecutionFailed(format!("child {name} handle missing")))
}

fn spawn_error(cmd: &CommandSpec) -> impl FnOnce(std::io::Error) -> StagecraftError + '_ {
    move |err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            StagecraftError::ProviderNotAvailable {
                provider: cmd.program.clone(),
                reason: "binary not found on PATH".to_string(),
            }
        } else {
            StagecraftError::Io(err)
        }
    }
}

/// True when `binary` resolves on PATH. Used for optional executors such as
/// docker-rollout.
pub fn binary_available(binary: &str) -> bool {
    which::which(binary).is_ok()
}
