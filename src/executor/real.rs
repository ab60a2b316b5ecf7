//! Executor that spawns real processes.

use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use which::which;

use super::pipe::{StreamType, panic_message, read_pipe_to_log};
use super::{CommandExecutor, CommandSpec, ExecutionResult};
use crate::error::UpgradeError;

/// Kills the child and joins any reader threads already started.
fn abandon_child<I>(child: &mut Child, handles: I)
where
    I: IntoIterator<Item = JoinHandle<()>>,
{
    let pid = child.id();
    if let Err(e) = child.kill() {
        tracing::debug!(pid = pid, "kill failed (process may have exited): {}", e);
    }
    if let Err(e) = child.wait() {
        tracing::warn!(pid = pid, "failed to reap child process: {}", e);
    }
    for handle in handles {
        if let Err(e) = handle.join() {
            tracing::warn!("reader thread panicked during cleanup: {}", panic_message(&*e));
        }
    }
}

fn spawn_reader<R>(
    pipe: Option<R>,
    stream: StreamType,
) -> std::io::Result<JoinHandle<()>>
where
    R: std::io::Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{}-reader", stream))
        .spawn(move || read_pipe_to_log(pipe, stream))
}

/// Runs commands with `std::process::Command`, streaming output to the log.
///
/// With `dry_run` set, commands are only logged and report no exit status.
pub struct RealCommandExecutor {
    pub dry_run: bool,
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        if self.dry_run {
            tracing::info!("dry run: {}", spec.display());
            return Ok(ExecutionResult { status: None });
        }

        let program =
            which(&spec.command).with_context(|| format!("command not found: {}", spec.command))?;
        tracing::debug!("running {}", spec.display());

        let mut child = Command::new(program)
            .args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", spec.display()))?;

        let failure = |status: String| -> anyhow::Error {
            UpgradeError::Execution {
                command: spec.display(),
                status,
            }
            .into()
        };

        let stdout = match spawn_reader(child.stdout.take(), StreamType::Stdout) {
            Ok(handle) => handle,
            Err(e) => {
                abandon_child(&mut child, []);
                return Err(failure(format!("failed to spawn stdout reader: {}", e)));
            }
        };
        let stderr = match spawn_reader(child.stderr.take(), StreamType::Stderr) {
            Ok(handle) => handle,
            Err(e) => {
                abandon_child(&mut child, [stdout]);
                return Err(failure(format!("failed to spawn stderr reader: {}", e)));
            }
        };

        let status = match child.wait() {
            Ok(status) => status,
            Err(e) => {
                abandon_child(&mut child, [stdout, stderr]);
                return Err(failure(format!("failed to wait for command: {}", e)));
            }
        };

        let panicked: Vec<String> = [("stdout", stdout), ("stderr", stderr)]
            .into_iter()
            .filter_map(|(name, handle)| {
                handle
                    .join()
                    .err()
                    .map(|e| format!("{}: {}", name, panic_message(&*e)))
            })
            .collect();
        if !panicked.is_empty() {
            return Err(failure(format!("reader thread(s) panicked: {}", panicked.join(", "))));
        }

        tracing::trace!(command = %spec.command, success = status.success(), "command finished");
        Ok(ExecutionResult {
            status: Some(status),
        })
    }
}
