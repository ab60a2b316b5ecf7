//! Restores preserved files from the backup partition into the new root.

use std::fmt;
use std::fs;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::error::UpgradeError;
use crate::host::{HostOps, ScopedMount, list_dir};

const RESTORE_MOUNT_PREFIX: &str = "upgrade-src-";

/// Something to bring back from the backup, relative to its root.
#[derive(Debug, Clone)]
pub enum RestoreEntry {
    File(Utf8PathBuf),
    /// Regular files directly inside `dir`. With a pattern, only files whose
    /// path relative to the backup root matches it from the start.
    Dir {
        dir: Utf8PathBuf,
        pattern: Option<Regex>,
    },
}

impl RestoreEntry {
    pub fn file(path: impl Into<Utf8PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn dir(dir: impl Into<Utf8PathBuf>) -> Self {
        Self::Dir {
            dir: dir.into(),
            pattern: None,
        }
    }

    pub fn dir_matching(dir: impl Into<Utf8PathBuf>, pattern: &str) -> Result<Self, UpgradeError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| UpgradeError::Config(format!("invalid restore pattern {:?}: {}", pattern, e)))?;
        Ok(Self::Dir {
            dir: dir.into(),
            pattern: Some(pattern),
        })
    }
}

impl fmt::Display for RestoreEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "/{}", path),
            Self::Dir { dir, pattern: None } => write!(f, "/{}/*", dir),
            Self::Dir {
                dir,
                pattern: Some(pattern),
            } => write!(f, "/{}/* matching {}", dir, pattern),
        }
    }
}

fn matches_from_start(pattern: &Regex, path: &Utf8Path) -> bool {
    pattern.find(path.as_str()).is_some_and(|m| m.start() == 0)
}

/// What a restore pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Restored paths, relative to the roots, in restore order.
    pub restored: Vec<Utf8PathBuf>,
    /// Entries that were absent from the backup.
    pub missing: Vec<Utf8PathBuf>,
}

struct Restorer<'a> {
    host: &'a dyn HostOps,
    backup_root: &'a Utf8Path,
    new_root: &'a Utf8Path,
    report: RestoreReport,
}

impl Restorer<'_> {
    fn restore_file(&mut self, relative: &Utf8Path) -> Result<()> {
        let src = self.backup_root.join(relative);
        let dst = self.new_root.join(relative);
        if !src.exists() {
            tracing::warn!("/{} did not exist in the backup image", relative);
            self.report.missing.push(relative.to_owned());
            return Ok(());
        }

        tracing::info!("restoring /{}", relative);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| UpgradeError::io(format!("failed to create {}", parent), e))?;
        }
        self.host
            .copy_file(&src, &dst)
            .with_context(|| format!("failed to restore /{}", relative))?;
        self.report.restored.push(relative.to_owned());
        Ok(())
    }

    fn restore_dir(&mut self, dir: &Utf8Path, pattern: Option<&Regex>) -> Result<()> {
        let src_dir = self.backup_root.join(dir);
        if !src_dir.is_dir() {
            tracing::warn!("/{} did not exist in the backup image", dir);
            self.report.missing.push(dir.to_owned());
            return Ok(());
        }

        for child in list_dir(&src_dir)? {
            if !child.is_file() {
                continue;
            }
            let relative = child
                .strip_prefix(self.backup_root)
                .with_context(|| format!("{} escaped the backup mount", child))?;
            if pattern.is_some_and(|p| !matches_from_start(p, relative)) {
                continue;
            }
            self.restore_file(relative)?;
        }
        Ok(())
    }
}

/// Copies each entry from `backup_root` to the same place under `new_root`.
///
/// Entries are processed in order. Anything missing from the backup is
/// logged and skipped; copy failures abort the pass.
pub fn restore_entries(
    host: &dyn HostOps,
    backup_root: &Utf8Path,
    new_root: &Utf8Path,
    entries: &[RestoreEntry],
) -> Result<RestoreReport> {
    let mut restorer = Restorer {
        host,
        backup_root,
        new_root,
        report: RestoreReport::default(),
    };
    tracing::info!("restoring preserved files");
    for entry in entries {
        match entry {
            RestoreEntry::File(path) => restorer.restore_file(path)?,
            RestoreEntry::Dir { dir, pattern } => restorer.restore_dir(dir, pattern.as_ref())?,
        }
    }
    Ok(restorer.report)
}

/// Mounts the backup read-only for the duration of `f`.
///
/// The mount point is released even when `f` fails.
pub fn with_backup_mounted<T>(
    host: &dyn HostOps,
    backup_device: &Utf8Path,
    temp_dir: &Utf8Path,
    f: impl FnOnce(&Utf8Path) -> Result<T>,
) -> Result<T> {
    let mount = ScopedMount::new(host, backup_device, temp_dir, RESTORE_MOUNT_PREFIX, &["ro"])?;
    let run_result = f(mount.path());
    let teardown_result = mount.release();

    match (run_result, teardown_result) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(e)) => Err(e).context("failed to release backup mount"),
        (Err(run_err), Err(tear_err)) => {
            Err(run_err.context(format!("additionally, releasing the backup mount failed: {:#}", tear_err)))
        }
    }
}
