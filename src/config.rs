//! Product configuration and scenario files.
//!
//! A scenario bundles everything the CLI needs to reason about one upgrade
//! without probing hardware: the product configuration, the installation
//! descriptor, the target partition numbers and, optionally, a description
//! of the disk.

use std::fs::File;
use std::io::BufReader;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::disk::DiskDescription;
use crate::error::UpgradeError;
use crate::installation::SourceInstallation;
use crate::planner::{PartitionTargets, PlanParams};
use crate::version::ProductVersion;

fn default_product() -> String {
    "xenenterprise".to_string()
}

fn default_product_version() -> ProductVersion {
    ProductVersion::new(5, 6, 100)
}

/// Largest accepted root partition, 1 TiB.
pub const MAX_ROOT_SIZE_MIB: u64 = 1 << 20;

fn default_root_size_mib() -> u64 {
    4096
}

fn default_oem_hdd_sr_partition() -> u32 {
    8
}

fn default_firstboot_data_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("etc/firstboot.d/data")
}

fn default_temp_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("/tmp")
}

/// Constants of the product being installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpgradeConfig {
    /// Product name that installations must carry to be upgradeable.
    #[serde(default = "default_product")]
    pub product: String,
    /// Version being installed; the upper bound of every upgrade range.
    #[serde(default = "default_product_version")]
    pub product_version: ProductVersion,
    /// Root partition size in MiB.
    #[serde(default = "default_root_size_mib")]
    pub root_size_mib: u64,
    /// SR partition number that marks an OEM HDD layout.
    #[serde(default = "default_oem_hdd_sr_partition")]
    pub oem_hdd_sr_partition: u32,
    /// First-boot data directory, relative to a root filesystem.
    #[serde(default = "default_firstboot_data_dir")]
    pub firstboot_data_dir: Utf8PathBuf,
    /// Where private mount points are created.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: Utf8PathBuf,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            product: default_product(),
            product_version: default_product_version(),
            root_size_mib: default_root_size_mib(),
            oem_hdd_sr_partition: default_oem_hdd_sr_partition(),
            firstboot_data_dir: default_firstboot_data_dir(),
            temp_dir: default_temp_dir(),
        }
    }
}

impl UpgradeConfig {
    pub fn root_size_bytes(&self) -> Result<u64, UpgradeError> {
        self.root_size_mib
            .checked_mul(1 << 20)
            .ok_or_else(|| UpgradeError::Config(format!("root_size_mib {} is too large", self.root_size_mib)))
    }

    pub fn plan_params(&self) -> Result<PlanParams, UpgradeError> {
        Ok(PlanParams {
            root_size: self.root_size_bytes()?,
            oem_hdd_sr_partition: self.oem_hdd_sr_partition,
        })
    }

    pub fn validate(&self) -> Result<(), UpgradeError> {
        if self.product.is_empty() {
            return Err(UpgradeError::Config("product must not be empty".to_string()));
        }
        if self.root_size_mib == 0 {
            return Err(UpgradeError::Config("root_size_mib must be positive".to_string()));
        }
        if self.root_size_mib > MAX_ROOT_SIZE_MIB {
            return Err(UpgradeError::Config(format!(
                "root_size_mib must be at most {}, got {}",
                MAX_ROOT_SIZE_MIB, self.root_size_mib
            )));
        }
        if self.oem_hdd_sr_partition < 2 {
            return Err(UpgradeError::Config(format!(
                "oem_hdd_sr_partition must leave room for a config partition before it, got {}",
                self.oem_hdd_sr_partition
            )));
        }
        if self.firstboot_data_dir.is_absolute() {
            return Err(UpgradeError::Config(format!(
                "firstboot_data_dir must be relative to the root filesystem: {}",
                self.firstboot_data_dir
            )));
        }
        Ok(())
    }
}

/// One upgrade described on disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub config: UpgradeConfig,
    pub installation: SourceInstallation,
    /// Inventory file merged into the installation; relative paths resolve
    /// against the scenario file's directory.
    #[serde(default)]
    pub inventory_file: Option<Utf8PathBuf>,
    #[serde(default)]
    pub targets: PartitionTargets,
    #[serde(default)]
    pub disk: Option<DiskDescription>,
}

impl Scenario {
    pub fn validate(&self) -> Result<(), UpgradeError> {
        self.config.validate()?;

        let t = &self.targets;
        if t.primary == 0 || t.backup == 0 || t.storage == 0 {
            return Err(UpgradeError::Config("partition numbers start at 1".to_string()));
        }
        if t.primary == t.backup || t.primary == t.storage || t.backup == t.storage {
            return Err(UpgradeError::Config(format!(
                "target partition numbers must be distinct: primary {}, backup {}, storage {}",
                t.primary, t.backup, t.storage
            )));
        }

        if let Some(disk) = &self.disk
            && disk.device != self.installation.primary_disk
        {
            return Err(UpgradeError::Config(format!(
                "disk description is for {} but the installation lives on {}",
                disk.device, self.installation.primary_disk
            )));
        }
        Ok(())
    }
}

/// Loads and validates a scenario file.
pub fn load_scenario(path: &Utf8Path) -> Result<Scenario, UpgradeError> {
    let file = File::open(path)
        .map_err(|e| UpgradeError::io(format!("failed to load scenario {}", path), e))?;
    let mut scenario: Scenario = serde_yaml::from_reader(BufReader::new(file))
        .map_err(|e| UpgradeError::Config(format!("failed to parse yaml {}: {}", path, e)))?;

    if let Some(inventory) = &scenario.inventory_file {
        let inventory = match path.parent() {
            Some(dir) if inventory.is_relative() => dir.join(inventory),
            _ => inventory.clone(),
        };
        let values = crate::keyvalue::read_key_value_file(&inventory)?;
        scenario.installation.inventory.extend(values);
    }

    scenario
        .validate()
        .map_err(|e| UpgradeError::Config(format!("{}: {}", path, e)))?;
    Ok(scenario)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_field() {
        let config: UpgradeConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, UpgradeConfig::default());
        assert_eq!(config.product, "xenenterprise");
        assert_eq!(config.product_version, ProductVersion::new(5, 6, 100));
        assert_eq!(config.root_size_bytes().unwrap(), 4096 << 20);
        assert_eq!(config.oem_hdd_sr_partition, 8);
    }

    #[test]
    fn oversized_root_is_rejected() {
        let config = UpgradeConfig {
            root_size_mib: u64::MAX / 1024,
            ..UpgradeConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("root_size_mib must be at most"), "{}", err);
        assert!(matches!(config.plan_params(), Err(UpgradeError::Config(_))));

        let largest = UpgradeConfig {
            root_size_mib: MAX_ROOT_SIZE_MIB,
            ..UpgradeConfig::default()
        };
        assert!(largest.validate().is_ok());
        assert_eq!(largest.root_size_bytes().unwrap(), 1 << 40);
    }

    #[test]
    fn absolute_firstboot_dir_is_rejected() {
        let config = UpgradeConfig {
            firstboot_data_dir: "/etc/firstboot.d/data".into(),
            ..UpgradeConfig::default()
        };
        assert!(matches!(config.validate(), Err(UpgradeError::Config(_))));
    }

    #[test]
    fn unknown_config_field_is_rejected() {
        let result: Result<UpgradeConfig, _> = serde_yaml::from_str("root_size: 10");
        assert!(result.is_err());
    }
}
