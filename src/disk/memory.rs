//! In-memory partition table and volume manager.
//!
//! [`MemoryDisk`] and [`MemoryVolumes`] implement the collaborator traits over a
//! table described in YAML. They enforce the same constraints a real table
//! would (no overlapping extents, no duplicate numbers, nothing past the end
//! of the disk) and record every operation in a shared journal so the order of
//! destructive steps can be inspected afterwards.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use anyhow::{Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use strum::Display;

use super::{
    Partition, PartitionId, PartitionTool, VolumeTool, partition_device, partition_number,
};

fn default_sector_size() -> u64 {
    512
}

/// YAML description of a disk and the volumes living on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskDescription {
    pub device: Utf8PathBuf,
    /// Total size in bytes.
    pub size: u64,
    #[serde(default = "default_sector_size")]
    pub sector_size: u64,
    #[serde(default)]
    pub partitions: Vec<PartitionDescription>,
    #[serde(default)]
    pub volumes: Vec<VolumeDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionDescription {
    pub number: u32,
    pub start: u64,
    pub size: u64,
    #[serde(default)]
    pub id: PartitionId,
    #[serde(default)]
    pub active: bool,
}

/// Role of a logical volume found on one of the disk's partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VolumeRole {
    Config,
    Swap,
    Sr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeDescription {
    /// Partition number backing the volume.
    pub partition: u32,
    pub role: VolumeRole,
    /// Logical volume size; defaults to the partition size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// An operation applied to the in-memory disk or volumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskOp {
    Create { number: u32, start: u64, size: u64 },
    Delete(u32),
    Rename { from: u32, to: u32 },
    Resize { number: u32, size: u64 },
    SetActive { number: u32, active: bool },
    InactivateDisk,
    CommitTable,
    VolumeResize { device: Utf8PathBuf, size: u64 },
    VolumeDelete(Utf8PathBuf),
    ActivateVg(String),
    DeactivateAll,
    CommitVolumes,
}

pub type Journal = Rc<RefCell<Vec<DiskOp>>>;

/// In-memory [`PartitionTool`].
#[derive(Debug)]
pub struct MemoryDisk {
    device: Utf8PathBuf,
    size: u64,
    sector_size: u64,
    table: BTreeMap<u32, Partition>,
    committed: BTreeMap<u32, Partition>,
    journal: Journal,
}

impl MemoryDisk {
    /// Builds the disk and its volume manager from a description.
    ///
    /// Both share one journal.
    pub fn from_description(desc: &DiskDescription) -> Result<(Self, MemoryVolumes)> {
        let journal = Journal::default();
        let mut disk = Self {
            device: desc.device.clone(),
            size: desc.size,
            sector_size: desc.sector_size,
            table: BTreeMap::new(),
            committed: BTreeMap::new(),
            journal: journal.clone(),
        };
        for p in &desc.partitions {
            let partition = Partition {
                start: p.start,
                size: p.size,
                id: p.id,
                active: p.active,
            };
            disk.check_fits(p.number, &partition)?;
            if disk.table.insert(p.number, partition).is_some() {
                bail!("duplicate partition number {} in description of {}", p.number, desc.device);
            }
        }
        disk.committed = disk.table.clone();

        let mut volumes = BTreeMap::new();
        for v in &desc.volumes {
            let Some(backing) = disk.table.get(&v.partition) else {
                bail!("volume references missing partition {} on {}", v.partition, desc.device);
            };
            volumes.insert(
                partition_device(&desc.device, v.partition),
                MemoryVolume {
                    role: v.role,
                    size: v.size.unwrap_or(backing.size),
                },
            );
        }
        let volumes = MemoryVolumes {
            volumes,
            active_groups: BTreeSet::new(),
            journal,
        };
        Ok((disk, volumes))
    }

    /// The table as last committed.
    pub fn committed(&self) -> &BTreeMap<u32, Partition> {
        &self.committed
    }

    /// True when staged edits have not been committed.
    pub fn is_dirty(&self) -> bool {
        self.table != self.committed
    }

    pub fn journal(&self) -> Vec<DiskOp> {
        self.journal.borrow().clone()
    }

    fn record(&self, op: DiskOp) {
        self.journal.borrow_mut().push(op);
    }

    fn check_fits(&self, number: u32, candidate: &Partition) -> Result<()> {
        if candidate.size == 0 {
            bail!("partition {} on {} would be empty", number, self.device);
        }
        if candidate.start < self.sector_size || candidate.end() > self.size {
            bail!(
                "partition {} [{}, {}) lies outside usable area of {} ({} bytes)",
                number,
                candidate.start,
                candidate.end(),
                self.device,
                self.size
            );
        }
        for (other_num, other) in &self.table {
            if *other_num != number && other.overlaps(candidate.start, candidate.size) {
                bail!(
                    "partition {} [{}, {}) overlaps partition {} on {}",
                    number,
                    candidate.start,
                    candidate.end(),
                    other_num,
                    self.device
                );
            }
        }
        Ok(())
    }
}

impl PartitionTool for MemoryDisk {
    fn disk(&self) -> &Utf8Path {
        &self.device
    }

    fn sector_size(&self) -> u64 {
        self.sector_size
    }

    fn disk_size(&self) -> u64 {
        self.size
    }

    fn partitions(&self) -> Vec<(u32, Partition)> {
        self.table.iter().map(|(n, p)| (*n, *p)).collect()
    }

    fn partition(&self, number: u32) -> Option<Partition> {
        self.table.get(&number).copied()
    }

    fn create_partition(
        &mut self,
        number: u32,
        id: PartitionId,
        start: u64,
        size: u64,
    ) -> Result<()> {
        if self.table.contains_key(&number) {
            bail!("partition {} already exists on {}", number, self.device);
        }
        let partition = Partition {
            start,
            size,
            id,
            active: false,
        };
        self.check_fits(number, &partition)?;
        self.table.insert(number, partition);
        self.record(DiskOp::Create {
            number,
            start,
            size,
        });
        Ok(())
    }

    fn delete_partitions(&mut self, numbers: &[u32]) -> Result<()> {
        if let Some(missing) = numbers.iter().find(|n| !self.table.contains_key(*n)) {
            bail!("cannot delete partition {}: not present on {}", missing, self.device);
        }
        for number in numbers {
            self.table.remove(number);
            self.record(DiskOp::Delete(*number));
        }
        Ok(())
    }

    fn rename_partition(&mut self, from: u32, to: u32) -> Result<()> {
        if self.table.contains_key(&to) {
            bail!("cannot rename partition {} to {}: target in use on {}", from, to, self.device);
        }
        let Some(partition) = self.table.remove(&from) else {
            bail!("cannot rename partition {}: not present on {}", from, self.device);
        };
        self.table.insert(to, partition);
        self.record(DiskOp::Rename { from, to });
        Ok(())
    }

    fn resize_partition(&mut self, number: u32, size: u64) -> Result<()> {
        let mut partition = self.require(number)?;
        partition.size = size;
        self.check_fits(number, &partition)?;
        self.table.insert(number, partition);
        self.record(DiskOp::Resize { number, size });
        Ok(())
    }

    fn set_active(&mut self, number: u32, active: bool) -> Result<()> {
        let Some(partition) = self.table.get_mut(&number) else {
            bail!("cannot flag partition {}: not present on {}", number, self.device);
        };
        partition.active = active;
        self.record(DiskOp::SetActive { number, active });
        Ok(())
    }

    fn inactivate_disk(&mut self) -> Result<()> {
        for partition in self.table.values_mut() {
            partition.active = false;
        }
        self.record(DiskOp::InactivateDisk);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.committed = self.table.clone();
        self.record(DiskOp::CommitTable);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct MemoryVolume {
    role: VolumeRole,
    size: u64,
}

/// In-memory [`VolumeTool`].
#[derive(Debug)]
pub struct MemoryVolumes {
    volumes: BTreeMap<Utf8PathBuf, MemoryVolume>,
    active_groups: BTreeSet<String>,
    journal: Journal,
}

impl MemoryVolumes {
    pub fn active_groups(&self) -> &BTreeSet<String> {
        &self.active_groups
    }

    fn find(&self, disk: &Utf8Path, role: VolumeRole) -> Option<Utf8PathBuf> {
        self.volumes
            .iter()
            .find(|(device, v)| v.role == role && partition_number(disk, device).is_some())
            .map(|(device, _)| device.clone())
    }

    fn record(&self, op: DiskOp) {
        self.journal.borrow_mut().push(op);
    }
}

impl VolumeTool for MemoryVolumes {
    fn config_partition(&self, disk: &Utf8Path) -> Option<Utf8PathBuf> {
        self.find(disk, VolumeRole::Config)
    }

    fn swap_partition(&self, disk: &Utf8Path) -> Option<Utf8PathBuf> {
        self.find(disk, VolumeRole::Swap)
    }

    fn sr_partition(&self, disk: &Utf8Path) -> Option<Utf8PathBuf> {
        self.find(disk, VolumeRole::Sr)
    }

    fn device_size(&self, device: &Utf8Path) -> Result<u64> {
        match self.volumes.get(device) {
            Some(v) => Ok(v.size),
            None => bail!("no volume on {}", device),
        }
    }

    fn resize_device(&mut self, device: &Utf8Path, size: u64) -> Result<()> {
        let Some(volume) = self.volumes.get_mut(device) else {
            bail!("cannot resize: no volume on {}", device);
        };
        volume.size = size;
        self.record(DiskOp::VolumeResize {
            device: device.to_owned(),
            size,
        });
        Ok(())
    }

    fn delete_device(&mut self, device: &Utf8Path) -> Result<()> {
        if self.volumes.remove(device).is_none() {
            bail!("cannot delete: no volume on {}", device);
        }
        self.record(DiskOp::VolumeDelete(device.to_owned()));
        Ok(())
    }

    fn activate_vg(&mut self, vg: &str) -> Result<()> {
        self.active_groups.insert(vg.to_string());
        self.record(DiskOp::ActivateVg(vg.to_string()));
        Ok(())
    }

    fn deactivate_all(&mut self) -> Result<()> {
        self.active_groups.clear();
        self.record(DiskOp::DeactivateAll);
        Ok(())
    }

    fn commit(&mut self, progress: &mut dyn FnMut(u8)) -> Result<()> {
        progress(0);
        self.record(DiskOp::CommitVolumes);
        progress(100);
        Ok(())
    }
}
