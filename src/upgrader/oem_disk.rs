//! OEM installations converted to a Retail layout.
//!
//! The conversion itself is done by an [`OemDiskBackend`]; this strategy
//! only sequences its steps and reports progress between them.

use anyhow::{Context, Result};
use camino::Utf8Path;

use super::{
    BackupInput, PrepareUpgradeInput, PreservedIdentity, StageEnv, Upgrader, preserve_identity,
    thirdgen::backup_root_device,
};
use crate::backup::BackupOutcome;
use crate::installation::SourceInstallation;
use crate::registry::UpgraderDescriptor;

/// Disk operations used to turn an OEM disk into a Retail one.
pub trait OemDiskBackend {
    fn remove_excess_oem_partitions(&self, source: &SourceInstallation) -> Result<()>;

    fn create_root_partition_table_entry(&self, disk: &Utf8Path) -> Result<()>;

    fn create_dom0_disk_filesystems(&self, disk: &Utf8Path) -> Result<()>;

    fn transfer_fs_from_backup_to_root(&self, disk: &Utf8Path) -> Result<()>;

    fn remove_backup_partition(&self, disk: &Utf8Path) -> Result<()>;

    fn create_backup_partition(&self, disk: &Utf8Path) -> Result<()>;

    fn extract_oem_state_from_root_to_backup(&self, source: &SourceInstallation) -> Result<()>;
}

fn convert_disk(
    backend: &dyn OemDiskBackend,
    source: &SourceInstallation,
    progress: &mut dyn FnMut(u8),
) -> Result<()> {
    let disk = source.primary_disk.as_path();

    progress(10);
    backend
        .remove_excess_oem_partitions(source)
        .context("failed to remove excess OEM partitions")?;
    progress(20);
    backend
        .create_root_partition_table_entry(disk)
        .context("failed to create root partition table entry")?;
    progress(30);
    backend
        .create_dom0_disk_filesystems(disk)
        .context("failed to create dom0 filesystems")?;
    progress(40);
    backend
        .transfer_fs_from_backup_to_root(disk)
        .context("failed to transfer filesystem from backup to root")?;
    progress(50);
    backend
        .remove_backup_partition(disk)
        .context("failed to remove backup partition")?;
    progress(60);
    backend
        .create_backup_partition(disk)
        .context("failed to create backup partition")?;
    progress(70);
    backend
        .extract_oem_state_from_root_to_backup(source)
        .context("failed to extract OEM state to backup")?;
    progress(80);
    Ok(())
}

/// Upgrader for OEM installations repartitioned into a Retail layout.
pub struct ThirdGenOemDiskUpgrader<'a> {
    descriptor: UpgraderDescriptor,
    source: &'a mut SourceInstallation,
}

impl<'a> ThirdGenOemDiskUpgrader<'a> {
    pub fn new(descriptor: UpgraderDescriptor, source: &'a mut SourceInstallation) -> Self {
        Self { descriptor, source }
    }
}

impl Upgrader for ThirdGenOemDiskUpgrader<'_> {
    fn descriptor(&self) -> &UpgraderDescriptor {
        &self.descriptor
    }

    fn installation(&self) -> &SourceInstallation {
        &*self.source
    }

    fn do_backup(
        &mut self,
        env: &mut StageEnv<'_>,
        input: &BackupInput,
        progress: &mut dyn FnMut(u8),
    ) -> Result<BackupOutcome> {
        backup_root_device(&*self.source, env, input, progress)
    }

    fn prepare_upgrade(
        &mut self,
        env: &mut StageEnv<'_>,
        _input: &PrepareUpgradeInput,
        progress: &mut dyn FnMut(u8),
    ) -> Result<PreservedIdentity> {
        let identity = preserve_identity(&*self.source)?;
        let backend = env
            .oem_backend
            .context("converting an OEM disk requires an OEM disk backend")?;
        tracing::info!(disk = %self.source.primary_disk, "converting OEM disk layout");
        convert_disk(backend, &*self.source, progress)?;
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installation::InstallVariant;
    use crate::version::ProductVersion;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingBackend {
        calls: RefCell<Vec<String>>,
        fail_at: Option<&'static str>,
    }

    impl RecordingBackend {
        fn step(&self, name: &'static str) -> Result<()> {
            self.calls.borrow_mut().push(name.to_string());
            if self.fail_at == Some(name) {
                anyhow::bail!("{} failed", name);
            }
            Ok(())
        }
    }

    impl OemDiskBackend for RecordingBackend {
        fn remove_excess_oem_partitions(&self, _source: &SourceInstallation) -> Result<()> {
            self.step("remove_excess")
        }
        fn create_root_partition_table_entry(&self, _disk: &Utf8Path) -> Result<()> {
            self.step("root_entry")
        }
        fn create_dom0_disk_filesystems(&self, _disk: &Utf8Path) -> Result<()> {
            self.step("dom0_fs")
        }
        fn transfer_fs_from_backup_to_root(&self, _disk: &Utf8Path) -> Result<()> {
            self.step("transfer")
        }
        fn remove_backup_partition(&self, _disk: &Utf8Path) -> Result<()> {
            self.step("remove_backup")
        }
        fn create_backup_partition(&self, _disk: &Utf8Path) -> Result<()> {
            self.step("create_backup")
        }
        fn extract_oem_state_from_root_to_backup(&self, _source: &SourceInstallation) -> Result<()> {
            self.step("extract_state")
        }
    }

    fn source() -> SourceInstallation {
        SourceInstallation::new("xenenterprise", ProductVersion::new(5, 5, 0), InstallVariant::Oem, "/dev/sda")
    }

    #[test]
    fn steps_run_in_order_with_progress() {
        let backend = RecordingBackend::default();
        let mut seen = Vec::new();
        convert_disk(&backend, &source(), &mut |p: u8| seen.push(p)).unwrap();
        assert_eq!(
            *backend.calls.borrow(),
            vec![
                "remove_excess",
                "root_entry",
                "dom0_fs",
                "transfer",
                "remove_backup",
                "create_backup",
                "extract_state"
            ]
        );
        assert_eq!(seen, vec![10, 20, 30, 40, 50, 60, 70, 80]);
    }

    #[test]
    fn failure_stops_the_sequence() {
        let backend = RecordingBackend {
            fail_at: Some("transfer"),
            ..RecordingBackend::default()
        };
        let err = convert_disk(&backend, &source(), &mut |_: u8| {}).unwrap_err();
        assert!(format!("{:#}", err).contains("transfer filesystem"));
        assert_eq!(backend.calls.borrow().len(), 4);
    }
}
