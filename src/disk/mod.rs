//! Partition-table and volume-group collaborators.
//!
//! The upgrade stages never edit a disk directly; they drive a
//! [`PartitionTool`] bound to the target disk and a [`VolumeTool`] for the
//! LVM side. Edits are staged in the tool and only reach the disk on
//! `commit()`, so every stage decides its full set of changes before any of
//! them become visible.
//!
//! [`memory`] provides an in-memory implementation of both traits, used for
//! layout previews and tests.

pub mod memory;

use std::fmt;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

pub use memory::{DiskDescription, DiskOp, MemoryDisk, MemoryVolumes};

/// MBR partition type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u8);

impl PartitionId {
    pub const LINUX: Self = Self(0x83);
    pub const LINUX_LVM: Self = Self(0x8e);
}

impl Default for PartitionId {
    fn default() -> Self {
        Self::LINUX
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// One entry of a partition table. Offsets and sizes are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub start: u64,
    pub size: u64,
    pub id: PartitionId,
    pub active: bool,
}

impl Partition {
    /// First byte after the partition.
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    /// True when `[start, start + size)` intersects this partition.
    pub fn overlaps(&self, start: u64, size: u64) -> bool {
        start < self.end() && self.start < start + size
    }
}

/// Device node for partition `number` of `disk`.
///
/// Disks whose name ends in a digit (`/dev/nvme0n1`, `/dev/cciss/c0d0`) take a
/// `p` separator.
pub fn partition_device(disk: &Utf8Path, number: u32) -> Utf8PathBuf {
    if disk.as_str().ends_with(|c: char| c.is_ascii_digit()) {
        Utf8PathBuf::from(format!("{}p{}", disk, number))
    } else {
        Utf8PathBuf::from(format!("{}{}", disk, number))
    }
}

/// Inverse of [`partition_device`]; `None` if `device` is not on `disk`.
pub fn partition_number(disk: &Utf8Path, device: &Utf8Path) -> Option<u32> {
    let rest = device.as_str().strip_prefix(disk.as_str())?;
    let digits = if disk.as_str().ends_with(|c: char| c.is_ascii_digit()) {
        rest.strip_prefix('p')?
    } else {
        rest
    };
    digits.parse().ok()
}

/// Partition-table editor bound to one disk.
///
/// Queries reflect staged edits; `commit()` writes them as one transaction.
pub trait PartitionTool {
    /// The disk this tool edits.
    fn disk(&self) -> &Utf8Path;

    fn sector_size(&self) -> u64;

    /// Size of the whole disk in bytes.
    fn disk_size(&self) -> u64;

    /// All entries, ordered by partition number.
    fn partitions(&self) -> Vec<(u32, Partition)>;

    fn partition(&self, number: u32) -> Option<Partition>;

    fn create_partition(&mut self, number: u32, id: PartitionId, start: u64, size: u64)
    -> Result<()>;

    fn delete_partitions(&mut self, numbers: &[u32]) -> Result<()>;

    /// Renumbers a partition without moving its data.
    fn rename_partition(&mut self, from: u32, to: u32) -> Result<()>;

    /// Changes a partition's size, keeping its start.
    fn resize_partition(&mut self, number: u32, size: u64) -> Result<()>;

    fn set_active(&mut self, number: u32, active: bool) -> Result<()>;

    /// Clears the active flag on every partition.
    fn inactivate_disk(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn partition_device(&self, number: u32) -> Utf8PathBuf {
        partition_device(self.disk(), number)
    }

    fn partition_number(&self, device: &Utf8Path) -> Result<u32> {
        partition_number(self.disk(), device).ok_or_else(|| {
            anyhow::anyhow!("{} is not a partition of {}", device, self.disk())
        })
    }

    fn delete_partition_if_present(&mut self, number: u32) -> Result<()> {
        if self.partition(number).is_some() {
            self.delete_partitions(&[number])?;
        }
        Ok(())
    }

    fn require(&self, number: u32) -> Result<Partition> {
        self.partition(number)
            .ok_or_else(|| anyhow::anyhow!("partition {} not present on {}", number, self.disk()))
    }

    fn partition_start(&self, number: u32) -> Result<u64> {
        Ok(self.require(number)?.start)
    }

    fn partition_end(&self, number: u32) -> Result<u64> {
        Ok(self.require(number)?.end())
    }

    fn partition_size(&self, number: u32) -> Result<u64> {
        Ok(self.require(number)?.size)
    }
}

/// Logical volume manager collaborator.
///
/// Lookups return the partition device that backs the volume of that role.
pub trait VolumeTool {
    fn config_partition(&self, disk: &Utf8Path) -> Option<Utf8PathBuf>;

    fn swap_partition(&self, disk: &Utf8Path) -> Option<Utf8PathBuf>;

    fn sr_partition(&self, disk: &Utf8Path) -> Option<Utf8PathBuf>;

    /// Size of the volume on `device` in bytes.
    fn device_size(&self, device: &Utf8Path) -> Result<u64>;

    fn resize_device(&mut self, device: &Utf8Path, size: u64) -> Result<()>;

    /// Drops the volume's record.
    fn delete_device(&mut self, device: &Utf8Path) -> Result<()>;

    fn activate_vg(&mut self, vg: &str) -> Result<()>;

    fn deactivate_all(&mut self) -> Result<()>;

    /// Applies staged edits, reporting progress on a 0..=100 scale.
    fn commit(&mut self, progress: &mut dyn FnMut(u8)) -> Result<()>;
}
