//! Domain-specific error types for hostupgrade.
//!
//! `UpgradeError` is a `thiserror`-based enum covering the failure modes the
//! upgrade stages can report. Pure functions (registry lookup, layout planning,
//! configuration parsing) return `Result<T, UpgradeError>`; stage functions and
//! collaborator traits use `anyhow::Result` and pick up `UpgradeError` through `?`.

use std::io;

/// Formats an IO error kind into a human-readable message.
///
/// The path or operation is carried separately in `UpgradeError::Io { context }`.
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::IsADirectory => "I/O error: is a directory".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Error type for the upgrade engine.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum UpgradeError {
    /// No registered upgrader handles the given installation.
    #[error("no upgrader available for {product} {version} ({variant})")]
    NotAvailable {
        product: String,
        version: String,
        variant: String,
    },

    /// A required inventory key is absent.
    #[error("missing inventory value: {0}")]
    MissingInventory(String),

    /// The disk layout cannot accommodate the requested partitions.
    #[error("layout error: {0}")]
    Layout(String),

    /// A command execution failed (non-zero exit, spawn failure, etc.).
    #[error("command execution failed: {command}: {status}")]
    Execution {
        /// The command that was executed, with its arguments.
        command: String,
        /// Exit status or a description of the failure.
        status: String,
    },

    /// A configuration or scenario file could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done, usually including a path.
        context: String,
        /// Derived from [`io_error_kind_message`].
        message: String,
        #[source]
        source: std::io::Error,
    },
}

impl UpgradeError {
    /// Creates an `Io` variant with `message` derived from `source`.
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }
}
