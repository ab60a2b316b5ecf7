//! Series 5 OEM Flash and OEM HDD upgrades.
//!
//! The OEM layouts have no free space for the new system, so the target
//! stage carves it out: unneeded partitions go, the SR gives up room, and a
//! backup partition is created. The root partition itself is only created
//! after the backup, once the old config partition can be deleted.

use anyhow::{Context, Result};

use super::{
    BackupInput, PrepareTargetInput, PrepareTargetOutput, PrepareUpgradeInput, PreservedIdentity,
    StageEnv, Upgrader, preserve_identity,
};
use crate::backup::{self, BackupOutcome, BackupTarget};
use crate::disk::{PartitionId, PartitionTool, VolumeTool};
use crate::installation::SourceInstallation;
use crate::planner::{DiskSnapshot, Disposition, PartitionPlan, PartitionTargets, plan_layout};
use crate::registry::UpgraderDescriptor;

fn rename(
    partitions: &mut dyn PartitionTool,
    source: &mut SourceInstallation,
    from: u32,
    to: u32,
) -> Result<()> {
    if from == to {
        return Ok(());
    }
    tracing::info!("renumbering partition {} to {}", from, to);
    partitions
        .rename_partition(from, to)
        .with_context(|| format!("failed to renumber partition {} to {}", from, to))?;
    source.partition_was_renamed(&partitions.partition_device(from), &partitions.partition_device(to));
    Ok(())
}

/// Applies a layout plan to the disk.
///
/// Swap and unneeded partitions are dropped first, then the preserved
/// partitions are renumbered (the SR shrinking, volume before partition,
/// ahead of its rename) and the backup partition is created. Volume changes
/// are committed before the partition table.
pub fn apply_plan(
    plan: &PartitionPlan,
    targets: &PartitionTargets,
    partitions: &mut dyn PartitionTool,
    volumes: &mut dyn VolumeTool,
    source: &mut SourceInstallation,
    progress: &mut dyn FnMut(u8),
) -> Result<()> {
    if let Some(swap) = plan.swap {
        let device = partitions.partition_device(swap);
        tracing::info!(device = %device, "dropping swap volume");
        volumes
            .delete_device(&device)
            .with_context(|| format!("failed to delete swap volume on {}", device))?;
    }

    let deleted = plan.deleted();
    if !deleted.is_empty() {
        tracing::info!(partitions = ?deleted, "deleting partitions not needed by the upgrade");
        partitions.delete_partitions(&deleted)?;
    }

    if plan.oem_hdd
        && let Some(config) = plan.config
        && let Some(Disposition::RenameTo(to)) = plan.dispositions.get(&config)
    {
        rename(partitions, source, config, *to)?;
    }

    if let Some(sr) = plan.sr {
        if let Some(shrink) = plan.sr_shrink {
            let device = partitions.partition_device(sr);
            tracing::info!(device = %device, size = shrink.volume_size, "shrinking SR volume");
            volumes
                .resize_device(&device, shrink.volume_size)
                .with_context(|| format!("failed to shrink SR volume on {}", device))?;
            partitions
                .resize_partition(sr, shrink.partition_size)
                .with_context(|| format!("failed to shrink SR partition {}", sr))?;
        }
        rename(partitions, source, sr, targets.storage)?;
    }

    partitions.delete_partition_if_present(targets.backup)?;
    tracing::info!(
        start = plan.backup_start,
        size = plan.backup_size,
        "creating backup partition {}",
        targets.backup
    );
    partitions
        .create_partition(targets.backup, PartitionId::LINUX, plan.backup_start, plan.backup_size)
        .context("failed to create backup partition")?;

    volumes.commit(progress).context("failed to commit volume changes")?;
    partitions.commit().context("failed to commit partition table")?;
    Ok(())
}

/// Deletes the deferred partitions, creates the bootable root partition and
/// grows the backup partition to full size, committing once.
fn finish_layout(
    partitions: &mut dyn PartitionTool,
    input: &PrepareUpgradeInput,
    root_size: u64,
) -> Result<()> {
    let root_start = input
        .root_start
        .context("root partition start was not computed by the target stage")?;
    let targets = &input.targets;

    tracing::info!(partitions = ?input.post_backup_delete, "backup complete, deleting partitions");
    partitions.delete_partitions(&input.post_backup_delete)?;

    tracing::info!("creating root partition {}", targets.primary);
    partitions
        .create_partition(targets.primary, PartitionId::LINUX, root_start, root_size)
        .context("failed to create root partition")?;
    partitions.inactivate_disk()?;
    partitions.set_active(targets.primary, true)?;
    partitions
        .resize_partition(targets.backup, root_size)
        .context("failed to grow backup partition")?;
    partitions.commit().context("failed to commit partition table")?;
    Ok(())
}

/// Upgrader for series 5 OEM installations.
pub struct ThirdGenOemUpgrader<'a> {
    descriptor: UpgraderDescriptor,
    source: &'a mut SourceInstallation,
}

impl<'a> ThirdGenOemUpgrader<'a> {
    pub fn new(descriptor: UpgraderDescriptor, source: &'a mut SourceInstallation) -> Self {
        Self { descriptor, source }
    }
}

impl Upgrader for ThirdGenOemUpgrader<'_> {
    fn descriptor(&self) -> &UpgraderDescriptor {
        &self.descriptor
    }

    fn installation(&self) -> &SourceInstallation {
        &*self.source
    }

    fn prepare_target(
        &mut self,
        env: &mut StageEnv<'_>,
        input: &PrepareTargetInput,
        progress: &mut dyn FnMut(u8),
    ) -> Result<PrepareTargetOutput> {
        let snapshot = DiskSnapshot::capture(&*env.partitions, &*env.volumes)?;
        let plan = plan_layout(&snapshot, &input.targets, &env.config.plan_params()?)?;
        tracing::info!(
            utility = ?plan.utility,
            config = ?plan.config,
            swap = ?plan.swap,
            sr = ?plan.sr,
            oem_hdd = plan.oem_hdd,
            preserve = ?plan.preserved(),
            "planned layout for {}",
            snapshot.disk
        );

        apply_plan(
            &plan,
            &input.targets,
            &mut *env.partitions,
            &mut *env.volumes,
            &mut *self.source,
            progress,
        )?;

        Ok(PrepareTargetOutput {
            post_backup_delete: plan.post_backup_delete.clone(),
            root_start: Some(plan.root_start),
            plan: Some(plan),
        })
    }

    fn do_backup(
        &mut self,
        env: &mut StageEnv<'_>,
        input: &BackupInput,
        progress: &mut dyn FnMut(u8),
    ) -> Result<BackupOutcome> {
        let device = env.partitions.partition_device(input.targets.backup);
        let target = BackupTarget {
            device: &device,
            temp_dir: &env.config.temp_dir,
        };
        backup::collect_oem_state(env.host, &mut *env.volumes, &*self.source, &target, progress)
    }

    fn prepare_upgrade(
        &mut self,
        env: &mut StageEnv<'_>,
        input: &PrepareUpgradeInput,
        _progress: &mut dyn FnMut(u8),
    ) -> Result<PreservedIdentity> {
        let identity = preserve_identity(&*self.source)?;
        finish_layout(&mut *env.partitions, input, env.config.root_size_bytes()?)?;
        Ok(identity)
    }
}
