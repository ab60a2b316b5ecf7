//! State backup collection.
//!
//! The backup partition is formatted and filled from every candidate state
//! location in turn. Each copy is tagged with the generation read from its
//! marker file; the most advanced copy must end up on top, so when a later,
//! older copy has shadowed it, that copy is laid down again.

use std::fs;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::disk::VolumeTool;
use crate::host::{HostOps, ScopedMount};
use crate::installation::{SourceInstallation, XAPI_DB_COMPAT_VERSION};

/// Generation marker, relative to a state root.
pub const GENERATION_MARKER: &str = "var/xapi/state.db.generation";

/// Present on OEM Flash state partitions only.
const FREQ_ETC: &str = "etc/freq-etc/etc";

const BACKUP_MOUNT_PREFIX: &str = "upgrade-backup-";
const STATE_MOUNT_PREFIX: &str = "upgrade-state-";

/// Reads the generation stamped on a state copy rooted at `root_dir`.
///
/// Returns -1 when the marker is missing or its first line is not an integer.
pub fn read_generation(root_dir: &Utf8Path) -> i64 {
    let path = root_dir.join(GENERATION_MARKER);
    match fs::read_to_string(&path) {
        Ok(content) => content
            .lines()
            .next()
            .and_then(|line| line.trim().parse().ok())
            .unwrap_or(-1),
        Err(e) => {
            tracing::debug!("no generation marker at {}: {}", path, e);
            -1
        }
    }
}

/// One copied state location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupCandidate {
    pub generation: i64,
    pub device: Utf8PathBuf,
    /// Directory within the device that holds the state tree.
    pub prefix: Utf8PathBuf,
}

/// Result of the backup stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupOutcome {
    /// Candidates in copy order.
    pub copied: Vec<BackupCandidate>,
    /// The highest-generation candidate, if any had a valid generation.
    pub selected: Option<BackupCandidate>,
    /// Whether the selected candidate was copied a second time.
    pub recopied: bool,
}

/// Where the backup goes and where temporary mount points live.
pub struct BackupTarget<'a> {
    pub device: &'a Utf8Path,
    pub temp_dir: &'a Utf8Path,
}

fn format_backup(host: &dyn HostOps, device: &Utf8Path) -> Result<()> {
    tracing::info!(device = %device, "formatting backup partition");
    host.format_ext3(device)
        .with_context(|| format!("backup: failed to format filesystem on {}", device))
}

/// Mounts a state location read-only and copies its tree into `backup_root`.
fn copy_candidate(
    host: &dyn HostOps,
    candidate: &BackupCandidate,
    backup_root: &Utf8Path,
    temp_dir: &Utf8Path,
    with_freq_etc: bool,
) -> Result<i64> {
    let mount = ScopedMount::new(host, &candidate.device, temp_dir, STATE_MOUNT_PREFIX, &["ro"])?;
    let root_dir = mount.path().join(&candidate.prefix);
    let generation = read_generation(&root_dir);

    tracing::info!(device = %candidate.device, generation, "copying state from {}", root_dir);
    host.copy_tree_contents(&root_dir, backup_root)
        .with_context(|| format!("failed to copy state from {}", candidate.device))?;

    let freq_etc = root_dir.join(FREQ_ETC);
    if with_freq_etc && freq_etc.is_dir() {
        tracing::info!("copying {} into backup", FREQ_ETC);
        host.copy_into(&freq_etc, backup_root)
            .with_context(|| format!("failed to copy {} from {}", FREQ_ETC, candidate.device))?;
    }

    mount.release()?;
    Ok(generation)
}

/// Backs up a single state location: the root filesystem of a Retail install.
pub fn backup_single_source(
    host: &dyn HostOps,
    source_device: &Utf8Path,
    target: &BackupTarget<'_>,
    progress: &mut dyn FnMut(u8),
) -> Result<BackupOutcome> {
    progress(10);
    format_backup(host, target.device)?;
    progress(20);

    let backup = ScopedMount::new(host, target.device, target.temp_dir, BACKUP_MOUNT_PREFIX, &[])?;
    let mut candidate = BackupCandidate {
        generation: -1,
        device: source_device.to_owned(),
        prefix: Utf8PathBuf::new(),
    };
    candidate.generation = copy_candidate(host, &candidate, backup.path(), target.temp_dir, false)?;
    backup.release()?;

    Ok(BackupOutcome {
        copied: vec![candidate.clone()],
        selected: (candidate.generation >= 0).then_some(candidate),
        recopied: false,
    })
}

/// Backs up every OEM state location and keeps the most advanced one on top.
///
/// The primary state partition is copied first, then each auxiliary volume
/// after activating its volume group. All volume groups are deactivated on
/// the way out, whatever happened.
pub fn collect_oem_state(
    host: &dyn HostOps,
    volumes: &mut dyn VolumeTool,
    installation: &SourceInstallation,
    target: &BackupTarget<'_>,
    progress: &mut dyn FnMut(u8),
) -> Result<BackupOutcome> {
    format_backup(host, target.device)?;
    progress(10);

    let backup = ScopedMount::new(host, target.device, target.temp_dir, BACKUP_MOUNT_PREFIX, &[])?;
    let run_result = copy_all_candidates(host, volumes, installation, backup.path(), target, progress);

    let teardown_result = volumes
        .deactivate_all()
        .context("failed to deactivate volume groups")
        .and(backup.release());

    match (run_result, teardown_result) {
        (Ok(outcome), Ok(())) => Ok(outcome),
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(e)) => Err(e).context("failed to clean up after backup"),
        (Err(run_err), Err(tear_err)) => {
            Err(run_err.context(format!("additionally, cleanup failed: {:#}", tear_err)))
        }
    }
}

fn copy_all_candidates(
    host: &dyn HostOps,
    volumes: &mut dyn VolumeTool,
    installation: &SourceInstallation,
    backup_root: &Utf8Path,
    target: &BackupTarget<'_>,
    progress: &mut dyn FnMut(u8),
) -> Result<BackupOutcome> {
    let state_device = installation
        .state_device
        .as_deref()
        .context("installation has no state device to back up")?;

    let mut outcome = BackupOutcome::default();
    // Index into `outcome.copied` of the best candidate so far.
    let mut best: Option<usize> = None;
    let mut record = |outcome: &mut BackupOutcome, candidate: BackupCandidate| {
        let current_best = best.map_or(-1, |i| outcome.copied[i].generation);
        if candidate.generation > current_best {
            best = Some(outcome.copied.len());
        }
        outcome.copied.push(candidate);
    };

    let mut primary = BackupCandidate {
        generation: -1,
        device: state_device.to_owned(),
        prefix: installation.state_prefix.clone(),
    };
    primary.generation = copy_candidate(host, &primary, backup_root, target.temp_dir, true)?;
    record(&mut outcome, primary);

    if !installation.auxiliary_state_devices.is_empty() {
        let prefix = Utf8PathBuf::from(installation.inventory_value(XAPI_DB_COMPAT_VERSION)?);
        for aux in &installation.auxiliary_state_devices {
            volumes
                .activate_vg(&aux.vg)
                .with_context(|| format!("failed to activate volume group {}", aux.vg))?;
            let mut candidate = BackupCandidate {
                generation: -1,
                device: aux.device_path(),
                prefix: prefix.clone(),
            };
            candidate.generation = copy_candidate(host, &candidate, backup_root, target.temp_dir, false)?;
            record(&mut outcome, candidate);
        }
    }
    progress(50);

    if let Some(index) = best {
        let last = outcome.copied.len() - 1;
        if index != last {
            let selected = outcome.copied[index].clone();
            tracing::info!(
                device = %selected.device,
                generation = selected.generation,
                "re-copying highest generation state"
            );
            copy_candidate(host, &selected, backup_root, target.temp_dir, index == 0)?;
            outcome.recopied = true;
        }
        outcome.selected = Some(outcome.copied[index].clone());
    } else {
        tracing::warn!("no state copy carries a valid generation marker");
    }
    progress(90);

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn write_marker(root: &Utf8Path, content: &str) {
        let path = root.join(GENERATION_MARKER);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn generation_reads_first_line() {
        let (_keep, dir) = root();
        write_marker(&dir, "42\nignored\n");
        assert_eq!(read_generation(&dir), 42);
    }

    #[test]
    fn generation_defaults_when_missing_or_garbage() {
        let (_keep, dir) = root();
        assert_eq!(read_generation(&dir), -1);
        write_marker(&dir, "not a number\n");
        assert_eq!(read_generation(&dir), -1);
    }

    #[test]
    fn generation_tolerates_surrounding_whitespace() {
        let (_keep, dir) = root();
        write_marker(&dir, " 7 \n");
        assert_eq!(read_generation(&dir), 7);
    }
}
