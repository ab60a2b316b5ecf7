//! Upgrade strategies.
//!
//! An [`Upgrader`] is bound to one [`SourceInstallation`] and exposes the
//! four stages the installer runs in order: prepare the target disk, back up
//! state, prepare the upgrade, and complete it once the new system has been
//! written. Each stage takes a typed input and returns a typed output that
//! the driver threads into later stages.

mod oem;
mod oem_disk;
mod thirdgen;

use anyhow::Result;
use camino::Utf8PathBuf;

use crate::backup::BackupOutcome;
use crate::config::UpgradeConfig;
use crate::disk::{PartitionTool, VolumeTool};
use crate::error::UpgradeError;
use crate::host::HostOps;
use crate::installation::{CONTROL_DOMAIN_UUID, INSTALLATION_UUID, SourceInstallation};
use crate::planner::{PartitionPlan, PartitionTargets};
use crate::registry::UpgraderDescriptor;
use crate::restore::RestoreReport;

pub use oem::{ThirdGenOemUpgrader, apply_plan};
pub use oem_disk::{OemDiskBackend, ThirdGenOemDiskUpgrader};
pub use thirdgen::{ThirdGenUpgrader, render_initial_ifcfg, third_gen_restore_list};

/// Collaborators shared by every stage.
pub struct StageEnv<'a> {
    pub host: &'a dyn HostOps,
    /// Partition table of the installation's primary disk.
    pub partitions: &'a mut dyn PartitionTool,
    pub volumes: &'a mut dyn VolumeTool,
    pub config: &'a UpgradeConfig,
    /// Required by strategies that repartition through the OEM disk backend.
    pub oem_backend: Option<&'a dyn OemDiskBackend>,
    /// Log writes into the new root instead of performing them.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareTargetInput {
    pub targets: PartitionTargets,
}

/// Values produced by the layout stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareTargetOutput {
    pub plan: Option<PartitionPlan>,
    /// Partitions still holding state until the backup is taken.
    pub post_backup_delete: Vec<u32>,
    pub root_start: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupInput {
    pub targets: PartitionTargets,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareUpgradeInput {
    pub targets: PartitionTargets,
    pub root_start: Option<u64>,
    pub post_backup_delete: Vec<u32>,
}

impl PrepareUpgradeInput {
    pub fn new(targets: PartitionTargets, target: &PrepareTargetOutput) -> Self {
        Self {
            targets,
            root_start: target.root_start,
            post_backup_delete: target.post_backup_delete.clone(),
        }
    }
}

/// Identifiers carried over to the new installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreservedIdentity {
    pub installation_uuid: String,
    pub control_domain_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteUpgradeInput {
    /// Where the new root filesystem is mounted.
    pub root_mount: Utf8PathBuf,
    pub backup_partnum: u32,
}

/// Reads the identifiers that must survive the upgrade.
pub fn preserve_identity(source: &SourceInstallation) -> Result<PreservedIdentity, UpgradeError> {
    let lookup = |key: &str| {
        source.inventory_value(key).map(str::to_string).map_err(|_| {
            UpgradeError::MissingInventory(format!(
                "required information ({}, {}) was missing from the inventory; \
                 replace these keys and try again",
                INSTALLATION_UUID, CONTROL_DOMAIN_UUID
            ))
        })
    };
    Ok(PreservedIdentity {
        installation_uuid: lookup(INSTALLATION_UUID)?,
        control_domain_uuid: lookup(CONTROL_DOMAIN_UUID)?,
    })
}

/// A staged upgrade strategy bound to one installation.
///
/// Defaults do nothing, except [`prepare_upgrade`](Self::prepare_upgrade),
/// which preserves the installation identity, and
/// [`complete_upgrade`](Self::complete_upgrade), which restores the series 5
/// configuration every strategy shares.
pub trait Upgrader {
    fn descriptor(&self) -> &UpgraderDescriptor;

    fn installation(&self) -> &SourceInstallation;

    /// Makes room on the target disk before installation.
    fn prepare_target(
        &mut self,
        _env: &mut StageEnv<'_>,
        _input: &PrepareTargetInput,
        _progress: &mut dyn FnMut(u8),
    ) -> Result<PrepareTargetOutput> {
        Ok(PrepareTargetOutput::default())
    }

    /// Collects state from the installation onto the backup partition.
    fn do_backup(
        &mut self,
        _env: &mut StageEnv<'_>,
        _input: &BackupInput,
        _progress: &mut dyn FnMut(u8),
    ) -> Result<BackupOutcome> {
        Ok(BackupOutcome::default())
    }

    fn prepare_upgrade(
        &mut self,
        _env: &mut StageEnv<'_>,
        _input: &PrepareUpgradeInput,
        _progress: &mut dyn FnMut(u8),
    ) -> Result<PreservedIdentity> {
        Ok(preserve_identity(self.installation())?)
    }

    /// Writes preserved data into the freshly installed root.
    fn complete_upgrade(
        &mut self,
        env: &mut StageEnv<'_>,
        input: &CompleteUpgradeInput,
    ) -> Result<RestoreReport> {
        thirdgen::complete_third_gen(self.installation(), env, input)
    }
}
