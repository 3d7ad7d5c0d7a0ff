//! Command execution.
//!
//! The engine treats execution as an opaque capability: hand an
//! [`Executor`] a rendered command and eventually get an
//! [`ExecutionOutcome`] back. This module defines that contract and the two
//! executors the CLI uses: [`ShellExecutor`], which runs the command through
//! a shell and captures stdout, and [`EchoExecutor`], which only reports the
//! command it was given.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;

use crate::graph::WatcherId;

/// Grace period between SIGTERM and SIGKILL for a superseded command.
const KILL_GRACE: Duration = Duration::from_millis(500);

pub const DEFAULT_SHELL: &str = "/bin/bash";

/// A rendered command, tagged with the execution it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub watcher: WatcherId,
    pub execution_id: u64,
    pub command: String,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// The command ran and exited (None usually implies signal termination).
    Exited { code: Option<i32> },
    /// The command could not be run at all.
    Failed { error: String },
}

impl ExecutionStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExecutionStatus::Exited { code: Some(0) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub output: String,
    pub status: ExecutionStatus,
}

impl ExecutionOutcome {
    pub fn exited(output: impl Into<String>, code: Option<i32>) -> Self {
        Self {
            output: output.into(),
            status: ExecutionStatus::Exited { code },
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            status: ExecutionStatus::Failed {
                error: error.into(),
            },
        }
    }
}

/// Runs rendered commands.
///
/// Implementations may ignore the [`Supersession`]; the engine discards
/// superseded results either way.
pub trait Executor: Send + Sync + 'static {
    fn execute(
        &self,
        request: ExecutionRequest,
        supersession: Supersession,
    ) -> impl Future<Output = ExecutionOutcome> + Send;
}

/// Fires when the execution it was handed with is no longer current:
/// a newer render superseded it, or its watcher was cancelled.
#[derive(Debug, Clone)]
pub struct Supersession(watch::Receiver<bool>);

/// The engine's side of a [`Supersession`].
#[derive(Debug)]
pub struct Supersede(watch::Sender<bool>);

pub fn supersession() -> (Supersede, Supersession) {
    let (tx, rx) = watch::channel(false);
    (Supersede(tx), Supersession(rx))
}

impl Supersede {
    pub fn fire(&self) {
        let _ = self.0.send(true);
    }
}

impl Supersession {
    pub fn is_superseded(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Resolves once superseded. Dropping the [`Supersede`] side counts.
    pub async fn superseded(&mut self) {
        let _ = self.0.wait_for(|superseded| *superseded).await;
    }
}

/// Runs commands with `<shell> -c`, capturing stdout.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    kill_on_supersede: bool,
}

impl ShellExecutor {
    pub fn new(shell: impl Into<String>, kill_on_supersede: bool) -> Self {
        Self {
            shell: shell.into(),
            kill_on_supersede,
        }
    }
}

impl Executor for ShellExecutor {
    fn execute(
        &self,
        request: ExecutionRequest,
        supersession: Supersession,
    ) -> impl Future<Output = ExecutionOutcome> + Send {
        let shell = self.shell.clone();
        let kill = self.kill_on_supersede;
        async move {
            match run_shell(&shell, &request, kill, supersession).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(watcher = %request.watcher, "execution failed: {:#}", err);
                    ExecutionOutcome::failed(format!("{:#}", err))
                }
            }
        }
    }
}

async fn run_shell(
    shell: &str,
    request: &ExecutionRequest,
    kill_on_supersede: bool,
    mut supersession: Supersession,
) -> Result<ExecutionOutcome> {
    if kill_on_supersede && supersession.is_superseded() {
        tracing::debug!(
            watcher = %request.watcher,
            execution = request.execution_id,
            "superseded before start, not spawning"
        );
        return Ok(ExecutionOutcome::failed("superseded before start"));
    }

    let mut command = Command::new(shell);
    command
        .arg("-c")
        .arg(&request.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    command.kill_on_drop(true);

    // A separate group lets a kill reach everything the shell started.
    #[cfg(unix)]
    if kill_on_supersede {
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }
    }

    tracing::debug!(
        watcher = %request.watcher,
        execution = request.execution_id,
        command = %request.command,
        "spawning"
    );
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", shell))?;
    let pid = child.id();
    let mut stdout = child.stdout.take().context("stdout was not captured")?;
    let reader = tokio::spawn(async move {
        let mut buffer = Vec::new();
        stdout.read_to_end(&mut buffer).await.map(|_| buffer)
    });

    let waited = if kill_on_supersede {
        tokio::select! {
            status = child.wait() => Some(status),
            _ = supersession.superseded() => None,
        }
    } else {
        Some(child.wait().await)
    };
    let status = match waited {
        Some(status) => status?,
        None => {
            tracing::debug!(
                watcher = %request.watcher,
                execution = request.execution_id,
                "killing superseded command"
            );
            if let Some(pid) = pid {
                terminate_group(pid);
            }
            match wait_for_exit(&mut child, KILL_GRACE).await? {
                Some(status) => status,
                None => {
                    if let Some(pid) = pid {
                        kill_group(pid);
                    }
                    let _ = child.kill().await;
                    child.wait().await?
                }
            }
        }
    };

    let buffer = reader.await.context("stdout reader panicked")??;
    Ok(ExecutionOutcome::exited(
        String::from_utf8_lossy(&buffer).into_owned(),
        status.code(),
    ))
}

#[cfg(unix)]
fn terminate_group(pid: u32) {
    signal_group(pid, libc::SIGTERM);
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    signal_group(pid, libc::SIGKILL);
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) {
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
fn terminate_group(_pid: u32) {}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

async fn wait_for_exit(
    child: &mut tokio::process::Child,
    timeout: Duration,
) -> Result<Option<std::process::ExitStatus>> {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Ok(None),
    }
}

/// Reports each command as its own output instead of running it.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

impl Executor for EchoExecutor {
    fn execute(
        &self,
        request: ExecutionRequest,
        _supersession: Supersession,
    ) -> impl Future<Output = ExecutionOutcome> + Send {
        std::future::ready(ExecutionOutcome::exited(
            format!("{}\n", request.command),
            Some(0),
        ))
    }
}
