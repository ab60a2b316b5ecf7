//! Partition layout planning for OEM upgrades.
//!
//! [`plan_layout`] is pure: it looks at a [`DiskSnapshot`] and decides which
//! partitions survive, which are renumbered or shrunk, and where the new root
//! and backup partitions go. Nothing touches the disk until the plan is
//! applied, so every layout problem is reported before the first destructive
//! edit.
//!
//! Placement rules, with `R` the root partition size:
//!
//! - Space starts after the utility partition, or at the first usable sector.
//! - Without an SR, root and backup go at the start of that space.
//! - On OEM HDD the backup fills the gap between the root and the old config
//!   partition; it grows to `R` once the config partition is deleted.
//! - Otherwise the SR gives up `2R`; root and backup sit flush against the
//!   SR's start when that gap is free, else right after the shrunk SR.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::disk::{Partition, PartitionTool, VolumeTool};
use crate::error::UpgradeError;

/// Partition numbers the new installation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTargets {
    pub primary: u32,
    pub backup: u32,
    pub storage: u32,
}

impl Default for PartitionTargets {
    fn default() -> Self {
        Self {
            primary: 1,
            backup: 2,
            storage: 3,
        }
    }
}

/// What the planner needs to know about the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSnapshot {
    pub disk: Utf8PathBuf,
    pub sector_size: u64,
    pub disk_size: u64,
    pub partitions: BTreeMap<u32, Partition>,
    /// Partition holding the config volume, if any.
    pub config: Option<u32>,
    /// Partition holding the swap volume, if any.
    pub swap: Option<u32>,
    /// Partition holding the SR volume, if any.
    pub sr: Option<u32>,
    /// Size of the SR logical volume.
    pub sr_volume_size: Option<u64>,
}

impl DiskSnapshot {
    /// Reads the current layout through the collaborator tools.
    pub fn capture(partitions: &dyn PartitionTool, volumes: &dyn VolumeTool) -> Result<Self> {
        let disk = partitions.disk().to_owned();
        let lookup = |device: Option<Utf8PathBuf>| -> Result<Option<(Utf8PathBuf, u32)>> {
            device
                .map(|d| partitions.partition_number(&d).map(|n| (d, n)))
                .transpose()
        };

        let config = lookup(volumes.config_partition(&disk))?;
        let swap = lookup(volumes.swap_partition(&disk))?;
        let sr = lookup(volumes.sr_partition(&disk))?;
        let sr_volume_size = match &sr {
            Some((device, _)) => Some(
                volumes
                    .device_size(device)
                    .with_context(|| format!("failed to read SR volume size on {}", device))?,
            ),
            None => None,
        };

        Ok(Self {
            sector_size: partitions.sector_size(),
            disk_size: partitions.disk_size(),
            partitions: partitions.partitions().into_iter().collect(),
            config: config.map(|(_, n)| n),
            swap: swap.map(|(_, n)| n),
            sr: sr.map(|(_, n)| n),
            sr_volume_size,
            disk,
        })
    }
}

/// Planner parameters that come from product configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanParams {
    /// Root partition size in bytes.
    pub root_size: u64,
    /// SR partition number that identifies an OEM HDD layout.
    pub oem_hdd_sr_partition: u32,
}

/// Fate of an existing partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Preserve,
    Delete,
    RenameTo(u32),
    ResizeTo(u64),
    ResizeAndRename { size: u64, to: u32 },
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preserve => f.write_str("preserve"),
            Self::Delete => f.write_str("delete"),
            Self::RenameTo(n) => write!(f, "rename to {}", n),
            Self::ResizeTo(size) => write!(f, "resize to {} bytes", size),
            Self::ResizeAndRename { size, to } => {
                write!(f, "resize to {} bytes, rename to {}", size, to)
            }
        }
    }
}

/// New sizes for the SR volume and its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrShrink {
    pub volume_size: u64,
    pub partition_size: u64,
}

/// Output of [`plan_layout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub dispositions: BTreeMap<u32, Disposition>,
    pub utility: Option<u32>,
    pub config: Option<u32>,
    pub swap: Option<u32>,
    pub sr: Option<u32>,
    pub oem_hdd: bool,
    pub sr_shrink: Option<SrShrink>,
    pub root_start: u64,
    pub root_size: u64,
    pub backup_start: u64,
    pub backup_size: u64,
    /// Partitions (by their post-rename numbers) to delete once the backup exists.
    pub post_backup_delete: Vec<u32>,
}

impl PartitionPlan {
    /// Original numbers of the partitions that survive the destructive phase.
    pub fn preserved(&self) -> Vec<u32> {
        self.dispositions
            .iter()
            .filter(|(_, d)| **d != Disposition::Delete)
            .map(|(n, _)| *n)
            .collect()
    }

    /// Original numbers of the partitions deleted up front.
    pub fn deleted(&self) -> Vec<u32> {
        self.dispositions
            .iter()
            .filter(|(_, d)| **d == Disposition::Delete)
            .map(|(n, _)| *n)
            .collect()
    }
}

fn layout_err(msg: String) -> UpgradeError {
    UpgradeError::Layout(msg)
}

fn require(snapshot: &DiskSnapshot, number: u32, role: &str) -> Result<Partition, UpgradeError> {
    snapshot.partitions.get(&number).copied().ok_or_else(|| {
        layout_err(format!("{} partition {} not present on {}", role, number, snapshot.disk))
    })
}

/// Computes the layout changes for an OEM upgrade.
pub fn plan_layout(
    snapshot: &DiskSnapshot,
    targets: &PartitionTargets,
    params: &PlanParams,
) -> Result<PartitionPlan, UpgradeError> {
    let root = params.root_size;
    // Every position computed below stays within the disk plus `2R`.
    if root == 0 || root.checked_mul(2).and_then(|d| snapshot.disk_size.checked_add(d)).is_none() {
        return Err(layout_err(format!(
            "root size {} bytes cannot be laid out on {} ({} bytes)",
            root, snapshot.disk, snapshot.disk_size
        )));
    }

    let utility = (targets.primary != 1 && snapshot.partitions.contains_key(&1)).then_some(1);
    let oem_hdd = snapshot.sr == Some(params.oem_hdd_sr_partition);
    // On OEM HDD the state partition sits right before the SR and is not an LVM volume.
    let config = if oem_hdd {
        Some(params.oem_hdd_sr_partition - 1)
    } else {
        snapshot.config
    };

    let mut preserve: BTreeSet<u32> = BTreeSet::new();
    preserve.extend(utility);
    preserve.extend(config);
    preserve.extend(snapshot.sr);
    // A config volume found through LVM on OEM HDD is kept alongside the state partition.
    if oem_hdd {
        preserve.extend(snapshot.config);
    }
    for number in &preserve {
        require(snapshot, *number, "preserved")?;
    }

    // Renumbering happens one step at a time; each target must be free when reached.
    let mut occupied = preserve.clone();
    let mut rename = |from: u32, to: u32| -> Result<u32, UpgradeError> {
        if from == to {
            return Ok(to);
        }
        if occupied.contains(&to) {
            return Err(layout_err(format!(
                "cannot renumber partition {} to {}: number still in use",
                from, to
            )));
        }
        occupied.remove(&from);
        occupied.insert(to);
        Ok(to)
    };
    let config_final = match config {
        Some(n) if oem_hdd => Some(rename(n, targets.primary)?),
        other => other,
    };
    let sr_final = snapshot.sr.map(|n| rename(n, targets.storage)).transpose()?;
    if occupied.contains(&targets.backup) {
        return Err(layout_err(format!(
            "backup partition number {} is held by a partition that must be preserved",
            targets.backup
        )));
    }

    let sr_shrink = match snapshot.sr {
        Some(sr) if !oem_hdd => {
            let part = require(snapshot, sr, "SR")?;
            let volume = snapshot.sr_volume_size.unwrap_or(part.size);
            if volume <= 2 * root || part.size <= 2 * root {
                return Err(layout_err(format!(
                    "SR partition {} ({} bytes, volume {} bytes) is too small to give up {} bytes",
                    sr,
                    part.size,
                    volume,
                    2 * root
                )));
            }
            Some(SrShrink {
                volume_size: volume - 2 * root,
                partition_size: part.size - 2 * root,
            })
        }
        _ => None,
    };

    let mut dispositions = BTreeMap::new();
    for number in snapshot.partitions.keys() {
        let disposition = if Some(*number) == snapshot.sr {
            let to = sr_final.unwrap_or(*number);
            match (sr_shrink, to != *number) {
                (Some(s), true) => Disposition::ResizeAndRename {
                    size: s.partition_size,
                    to,
                },
                (Some(s), false) => Disposition::ResizeTo(s.partition_size),
                (None, true) => Disposition::RenameTo(to),
                (None, false) => Disposition::Preserve,
            }
        } else if Some(*number) == config {
            match config_final {
                Some(to) if to != *number => Disposition::RenameTo(to),
                _ => Disposition::Preserve,
            }
        } else if preserve.contains(number) {
            Disposition::Preserve
        } else {
            Disposition::Delete
        };
        dispositions.insert(*number, disposition);
    }

    let avail = match utility {
        Some(n) => require(snapshot, n, "utility")?.end(),
        None => snapshot.sector_size,
    };

    let (root_start, backup_size) = match snapshot.sr {
        None => (avail, root),
        Some(sr) if oem_hdd => {
            let config_part = require(snapshot, params.oem_hdd_sr_partition - 1, "config")?;
            let sr_part = require(snapshot, sr, "SR")?;
            let backup_start = avail + root;
            if config_part.start <= backup_start {
                return Err(layout_err(format!(
                    "no room for a backup partition between {} and the config partition at {}",
                    backup_start, config_part.start
                )));
            }
            // The backup grows to `root` once the config partition is gone.
            if backup_start + root > sr_part.start {
                return Err(layout_err(format!(
                    "backup partition at {} cannot grow to {} bytes before SR partition {} at {}",
                    backup_start, root, sr, sr_part.start
                )));
            }
            (avail, config_part.start - backup_start)
        }
        Some(sr) => {
            let sr_part = require(snapshot, sr, "SR")?;
            let shrunk_end = sr_part.start + sr_shrink.map_or(sr_part.size, |s| s.partition_size);
            let fits_before = sr_part.start >= avail + 2 * root
                && !kept_overlap(snapshot, &preserve, Some(sr), sr_part.start - 2 * root, 2 * root);
            if fits_before {
                (sr_part.start - 2 * root, root)
            } else {
                (shrunk_end, root)
            }
        }
    };
    let backup_start = root_start + root;

    // The backup must not collide with anything kept; the root only with what
    // survives the post-backup deletion.
    if backup_start + backup_size > snapshot.disk_size || root_start + root > snapshot.disk_size {
        return Err(layout_err(format!(
            "root/backup region [{}, {}) runs past the end of {} ({} bytes)",
            root_start,
            backup_start + backup_size,
            snapshot.disk,
            snapshot.disk_size
        )));
    }
    let shrunk = |n: u32, p: Partition| -> Partition {
        match (Some(n) == snapshot.sr, sr_shrink) {
            (true, Some(s)) => Partition {
                size: s.partition_size,
                ..p
            },
            _ => p,
        }
    };
    for number in &preserve {
        let part = shrunk(*number, snapshot.partitions[number]);
        if part.overlaps(backup_start, backup_size) {
            return Err(layout_err(format!(
                "backup region [{}, {}) overlaps preserved partition {}",
                backup_start,
                backup_start + backup_size,
                number
            )));
        }
        if Some(*number) != config && part.overlaps(root_start, root) {
            return Err(layout_err(format!(
                "root region [{}, {}) overlaps preserved partition {}",
                root_start,
                root_start + root,
                number
            )));
        }
    }

    Ok(PartitionPlan {
        dispositions,
        utility,
        config,
        swap: snapshot.swap,
        sr: snapshot.sr,
        oem_hdd,
        sr_shrink,
        root_start,
        root_size: root,
        backup_start,
        backup_size,
        post_backup_delete: config_final.into_iter().collect(),
    })
}

/// True if any preserved partition other than `skip` intersects the region.
fn kept_overlap(
    snapshot: &DiskSnapshot,
    preserve: &BTreeSet<u32>,
    skip: Option<u32>,
    start: u64,
    size: u64,
) -> bool {
    preserve
        .iter()
        .filter(|n| Some(**n) != skip)
        .filter_map(|n| snapshot.partitions.get(n))
        .any(|p| p.overlaps(start, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::PartitionId;

    const MIB: u64 = 1 << 20;
    const R: u64 = 100 * MIB;

    fn part(start: u64, size: u64) -> Partition {
        Partition {
            start,
            size,
            id: PartitionId::LINUX,
            active: false,
        }
    }

    fn snapshot(partitions: &[(u32, Partition)]) -> DiskSnapshot {
        DiskSnapshot {
            disk: "/dev/sda".into(),
            sector_size: 512,
            disk_size: 2000 * MIB,
            partitions: partitions.iter().copied().collect(),
            config: None,
            swap: None,
            sr: None,
            sr_volume_size: None,
        }
    }

    fn params() -> PlanParams {
        PlanParams {
            root_size: R,
            oem_hdd_sr_partition: 8,
        }
    }

    #[test]
    fn no_sr_no_utility_starts_at_first_sector() {
        let snap = snapshot(&[(1, part(512, 50 * MIB)), (2, part(60 * MIB, 50 * MIB))]);
        let plan = plan_layout(&snap, &PartitionTargets::default(), &params()).unwrap();
        assert_eq!(plan.root_start, 512);
        assert_eq!(plan.backup_start, 512 + R);
        assert_eq!(plan.backup_size, R);
        assert_eq!(plan.deleted(), vec![1, 2]);
        assert!(plan.post_backup_delete.is_empty());
        assert!(!plan.oem_hdd);
    }

    #[test]
    fn utility_partition_is_preserved_and_shifts_start() {
        let snap = snapshot(&[(1, part(512, 8 * MIB - 512)), (2, part(8 * MIB, 50 * MIB))]);
        let targets = PartitionTargets {
            primary: 2,
            backup: 3,
            storage: 4,
        };
        let plan = plan_layout(&snap, &targets, &params()).unwrap();
        assert_eq!(plan.utility, Some(1));
        assert_eq!(plan.dispositions[&1], Disposition::Preserve);
        assert_eq!(plan.dispositions[&2], Disposition::Delete);
        assert_eq!(plan.root_start, 8 * MIB);
    }

    #[test]
    fn flash_sr_with_room_before_is_flush_against_sr() {
        let x = 512 + 3 * R;
        let mut snap = snapshot(&[(1, part(512, 50 * MIB)), (4, part(x, 1000 * MIB))]);
        snap.sr = Some(4);
        snap.sr_volume_size = Some(990 * MIB);
        let plan = plan_layout(&snap, &PartitionTargets::default(), &params()).unwrap();
        assert_eq!(plan.root_start, x - 2 * R);
        assert_eq!(plan.backup_start, x - R);
        assert_eq!(plan.backup_start + plan.backup_size, x);
        assert_eq!(
            plan.sr_shrink,
            Some(SrShrink {
                volume_size: 990 * MIB - 2 * R,
                partition_size: 1000 * MIB - 2 * R,
            })
        );
        assert_eq!(
            plan.dispositions[&4],
            Disposition::ResizeAndRename {
                size: 1000 * MIB - 2 * R,
                to: 3
            }
        );
    }

    #[test]
    fn flash_sr_without_room_goes_after_shrunk_sr() {
        let sr_start = 512 + R;
        let mut snap = snapshot(&[(3, part(sr_start, 1000 * MIB))]);
        snap.sr = Some(3);
        let plan = plan_layout(&snap, &PartitionTargets::default(), &params()).unwrap();
        let shrunk_end = sr_start + 1000 * MIB - 2 * R;
        assert_eq!(plan.root_start, shrunk_end);
        assert_eq!(plan.backup_start, shrunk_end + R);
        assert_eq!(plan.dispositions[&3], Disposition::ResizeTo(1000 * MIB - 2 * R));
    }

    #[test]
    fn config_in_gap_forces_placement_after_sr() {
        let sr_start = 512 + 4 * R;
        let mut snap = snapshot(&[(5, part(512 + 3 * R, 10 * MIB)), (6, part(sr_start, 1000 * MIB))]);
        snap.config = Some(5);
        snap.sr = Some(6);
        let plan = plan_layout(&snap, &PartitionTargets::default(), &params()).unwrap();
        assert_eq!(plan.root_start, sr_start + 1000 * MIB - 2 * R);
        assert_eq!(plan.post_backup_delete, vec![5]);
        assert_eq!(plan.dispositions[&5], Disposition::Preserve);
    }

    #[test]
    fn oem_hdd_fills_gap_before_config() {
        let config_start = 512 + R + 60 * MIB;
        let mut snap = snapshot(&[
            (5, part(512, 50 * MIB)),
            (6, part(512 + 50 * MIB, 50 * MIB)),
            (7, part(config_start, 40 * MIB)),
            (8, part(config_start + 40 * MIB, 1000 * MIB)),
        ]);
        snap.sr = Some(8);
        snap.swap = Some(6);
        let plan = plan_layout(&snap, &PartitionTargets::default(), &params()).unwrap();
        assert!(plan.oem_hdd);
        assert_eq!(plan.root_start, 512);
        assert_eq!(plan.backup_start, 512 + R);
        assert_eq!(plan.backup_start + plan.backup_size, config_start);
        assert_eq!(plan.dispositions[&7], Disposition::RenameTo(1));
        assert_eq!(plan.dispositions[&8], Disposition::RenameTo(3));
        assert_eq!(plan.dispositions[&5], Disposition::Delete);
        assert_eq!(plan.dispositions[&6], Disposition::Delete);
        assert!(plan.sr_shrink.is_none());
        assert_eq!(plan.post_backup_delete, vec![1]);
    }

    #[test]
    fn oem_hdd_backup_must_be_able_to_grow() {
        let config_start = 512 + R + 60 * MIB;
        let mut snap = snapshot(&[
            (7, part(config_start, 20 * MIB)),
            (8, part(config_start + 20 * MIB, 1000 * MIB)),
        ]);
        snap.sr = Some(8);
        let err = plan_layout(&snap, &PartitionTargets::default(), &params()).unwrap_err();
        assert!(err.to_string().contains("cannot grow"), "{}", err);
    }

    #[test]
    fn oem_hdd_keeps_config_volume_found_through_lvm() {
        let config_start = 512 + R + 60 * MIB;
        let sr_end = config_start + 40 * MIB + 1000 * MIB;
        let mut snap = snapshot(&[
            (5, part(512, 50 * MIB)),
            (7, part(config_start, 40 * MIB)),
            (8, part(config_start + 40 * MIB, 1000 * MIB)),
            (9, part(sr_end, 50 * MIB)),
        ]);
        snap.sr = Some(8);
        snap.config = Some(9);
        let plan = plan_layout(&snap, &PartitionTargets::default(), &params()).unwrap();
        assert!(plan.oem_hdd);
        assert_eq!(plan.config, Some(7));
        assert_eq!(plan.dispositions[&9], Disposition::Preserve);
        assert_eq!(plan.deleted(), vec![5]);
        assert_eq!(plan.post_backup_delete, vec![1]);
    }

    #[test]
    fn root_size_that_overflows_positions_is_rejected() {
        let snap = snapshot(&[(1, part(512, 50 * MIB))]);
        let huge = PlanParams {
            root_size: u64::MAX / 2,
            ..params()
        };
        let err = plan_layout(&snap, &PartitionTargets::default(), &huge).unwrap_err();
        assert!(matches!(err, UpgradeError::Layout(ref m) if m.contains("cannot be laid out")), "{}", err);
    }

    #[test]
    fn oem_hdd_without_config_partition_is_rejected() {
        let mut snap = snapshot(&[(8, part(500 * MIB, 1000 * MIB))]);
        snap.sr = Some(8);
        let err = plan_layout(&snap, &PartitionTargets::default(), &params()).unwrap_err();
        assert!(err.to_string().contains("partition 7 not present"), "{}", err);
    }

    #[test]
    fn sr_too_small_is_rejected() {
        let mut snap = snapshot(&[(3, part(512, 150 * MIB))]);
        snap.sr = Some(3);
        let err = plan_layout(&snap, &PartitionTargets::default(), &params()).unwrap_err();
        assert!(matches!(err, UpgradeError::Layout(ref m) if m.contains("too small")), "{}", err);
    }

    #[test]
    fn region_past_end_of_disk_is_rejected() {
        let mut snap = snapshot(&[]);
        snap.disk_size = R;
        let err = plan_layout(&snap, &PartitionTargets::default(), &params()).unwrap_err();
        assert!(err.to_string().contains("past the end"), "{}", err);
    }

    #[test]
    fn preserved_partition_on_backup_number_is_rejected() {
        let mut snap = snapshot(&[(2, part(512, 10 * MIB)), (3, part(1000 * MIB, 900 * MIB))]);
        snap.config = Some(2);
        snap.sr = Some(3);
        let err = plan_layout(&snap, &PartitionTargets::default(), &params()).unwrap_err();
        assert!(err.to_string().contains("backup partition number 2"), "{}", err);
    }
}
