//! Descriptor of the installation being upgraded.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::error::UpgradeError;
use crate::keyvalue;
use crate::version::ProductVersion;

pub const INSTALLATION_UUID: &str = "INSTALLATION_UUID";
pub const CONTROL_DOMAIN_UUID: &str = "CONTROL_DOMAIN_UUID";
pub const XAPI_DB_COMPAT_VERSION: &str = "XAPI_DB_COMPAT_VERSION";

/// Install flavour of a source installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum InstallVariant {
    Retail,
    #[serde(rename = "OEM", alias = "Oem")]
    #[strum(serialize = "OEM")]
    Oem,
}

/// An auxiliary state volume (OEM installations keep extra copies in LVM).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxiliaryStateDevice {
    pub vg: String,
    pub lv: String,
}

impl AuxiliaryStateDevice {
    /// Device node of the logical volume once its group is active.
    pub fn device_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from("/dev").join(&self.vg).join(&self.lv)
    }
}

/// Snapshot of the installation to upgrade, taken before any destructive step.
///
/// The only mutation is [`partition_was_renamed`](Self::partition_was_renamed),
/// which keeps device references valid after the layout stage renumbers
/// partitions underneath them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInstallation {
    pub product: String,
    pub version: ProductVersion,
    pub variant: InstallVariant,
    pub primary_disk: Utf8PathBuf,
    /// Root filesystem holding state on Retail installations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_device: Option<Utf8PathBuf>,
    /// Primary state location on OEM installations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_device: Option<Utf8PathBuf>,
    /// Directory within the state device that holds the state tree.
    #[serde(default)]
    pub state_prefix: Utf8PathBuf,
    #[serde(default)]
    pub inventory: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auxiliary_state_devices: Vec<AuxiliaryStateDevice>,
}

impl SourceInstallation {
    pub fn new(
        product: impl Into<String>,
        version: ProductVersion,
        variant: InstallVariant,
        primary_disk: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            product: product.into(),
            version,
            variant,
            primary_disk: primary_disk.into(),
            root_device: None,
            state_device: None,
            state_prefix: Utf8PathBuf::new(),
            inventory: BTreeMap::new(),
            auxiliary_state_devices: Vec::new(),
        }
    }

    /// Looks up an inventory key, failing when it is absent.
    pub fn inventory_value(&self, key: &str) -> Result<&str, UpgradeError> {
        self.inventory
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| UpgradeError::MissingInventory(key.to_string()))
    }

    /// Replaces the inventory with the contents of an inventory file.
    pub fn load_inventory(&mut self, path: &Utf8Path) -> Result<(), UpgradeError> {
        self.inventory = keyvalue::read_key_value_file(path)?;
        Ok(())
    }

    /// Records that the partition at `old` is now addressed as `new`.
    pub fn partition_was_renamed(&mut self, old: &Utf8Path, new: &Utf8Path) {
        for device in [&mut self.root_device, &mut self.state_device]
            .into_iter()
            .flatten()
        {
            if device.as_path() == old {
                tracing::debug!(old = %old, new = %new, "updating renamed device reference");
                *device = new.to_owned();
            }
        }
    }
}
