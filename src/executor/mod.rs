//! Command execution abstraction.
//!
//! Host primitives (format, mount, copy) are expressed as [`CommandSpec`]s and
//! run through a [`CommandExecutor`], so tests can record the exact command
//! sequence without touching a real disk.

mod pipe;
mod real;

use std::process::ExitStatus;

use anyhow::Result;

use crate::error::UpgradeError;

pub use real::RealCommandExecutor;

/// Formats arguments as a space-separated, debug-quoted string.
pub(crate) fn format_command_args(args: &[String]) -> String {
    args.iter()
        .map(|a| format!("{:?}", a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// `command "arg1" "arg2"`, for logs and error messages.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, format_command_args(&self.args))
        }
    }
}

/// Outcome of running a command.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Exit status (`None` in dry-run mode).
    pub status: Option<ExitStatus>,
}

impl ExecutionResult {
    /// True on zero exit status or in dry-run mode.
    pub fn success(&self) -> bool {
        self.status.is_none_or(|s| s.success())
    }

    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    /// Converts a non-zero exit into [`UpgradeError::Execution`].
    pub fn check(self, spec: &CommandSpec) -> Result<(), UpgradeError> {
        if self.success() {
            return Ok(());
        }
        let status = self
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Err(UpgradeError::Execution {
            command: spec.display(),
            status,
        })
    }
}

/// Runs commands. Implementations must be shareable across threads.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult>;
}
