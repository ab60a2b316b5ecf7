//! Series 5 Retail upgrades, and the restore behaviour shared by the OEM strategies.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;

use anyhow::{Context, Result, bail};
use camino::Utf8Path;

use super::{BackupInput, CompleteUpgradeInput, StageEnv, Upgrader};
use crate::backup::{self, BackupOutcome, BackupTarget};
use crate::config::UpgradeConfig;
use crate::disk::partition_device;
use crate::error::UpgradeError;
use crate::installation::SourceInstallation;
use crate::keyvalue::read_key_value_file;
use crate::registry::UpgraderDescriptor;
use crate::restore::{self, RestoreEntry, RestoreReport};

const IFCFG_PATTERN: &str = r".*/ifcfg-[a-z0-9.]+";
const INITIAL_IFCFG: &str = "initial-ifcfg";

/// Preserved configuration of a series 5 host.
pub fn third_gen_restore_list(config: &UpgradeConfig) -> Result<Vec<RestoreEntry>, UpgradeError> {
    let firstboot = &config.firstboot_data_dir;
    let mut entries: Vec<RestoreEntry> = [
        "etc/xensource/ptoken",
        "etc/xensource/pool.conf",
        "etc/xensource/xapi-ssl.pem",
        "etc/ssh/ssh_host_dsa_key",
        "etc/ssh/ssh_host_dsa_key.pub",
        "etc/ssh/ssh_host_key",
        "etc/ssh/ssh_host_key.pub",
        "etc/ssh/ssh_host_rsa_key",
        "etc/ssh/ssh_host_rsa_key.pub",
        "etc/sysconfig/network",
    ]
    .into_iter()
    .map(RestoreEntry::file)
    .collect();

    entries.push(RestoreEntry::dir_matching("etc/sysconfig/network-scripts", IFCFG_PATTERN)?);
    entries.push(RestoreEntry::file("var/xapi/state.db"));
    entries.push(RestoreEntry::file("etc/xensource/license"));
    entries.push(RestoreEntry::dir_matching(firstboot.clone(), r".*.conf")?);
    entries.push(RestoreEntry::dir_matching(firstboot.join(INITIAL_IFCFG), IFCFG_PATTERN)?);
    Ok(entries)
}

/// Copies the root filesystem of a Retail installation onto the backup partition.
pub(super) fn backup_root_device(
    source: &SourceInstallation,
    env: &StageEnv<'_>,
    input: &BackupInput,
    progress: &mut dyn FnMut(u8),
) -> Result<BackupOutcome> {
    let root_device = source
        .root_device
        .as_deref()
        .context("installation has no root device to back up")?;
    let backup_device = partition_device(&source.primary_disk, input.targets.backup);
    let target = BackupTarget {
        device: &backup_device,
        temp_dir: &env.config.temp_dir,
    };
    backup::backup_single_source(env.host, root_device, &target, progress)
}

fn write_file(path: &Utf8Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| UpgradeError::io(format!("failed to create {}", parent), e))?;
    }
    fs::write(path, content).map_err(|e| UpgradeError::io(format!("failed to write {}", path), e))?;
    Ok(())
}

/// Builds `ifcfg-<label>` and `ifcfg-xenbr<n>` for the management interface.
///
/// `network` is the first-boot `network.conf`; `interface` the matching
/// `interface-<mac>.conf`. Returns `(file name, content)` pairs.
pub fn render_initial_ifcfg(
    network: &BTreeMap<String, String>,
    interface: &BTreeMap<String, String>,
) -> Result<Vec<(String, String)>> {
    let get = |map: &BTreeMap<String, String>, key: &str| -> Result<String> {
        map.get(key).cloned().with_context(|| format!("{} not set", key))
    };
    let hwaddr = get(network, "ADMIN_INTERFACE")?;
    let label = get(interface, "LABEL")?;
    let Some(index) = label.get(3..).filter(|s| !s.is_empty()) else {
        bail!("unexpected interface label {:?}", label);
    };
    let bridge = format!("xenbr{}", index);

    let mut eth = String::new();
    writeln!(eth, "XEMANAGED=yes")?;
    writeln!(eth, "DEVICE={}", label)?;
    writeln!(eth, "ONBOOT=no")?;
    writeln!(eth, "TYPE=Ethernet")?;
    writeln!(eth, "HWADDR={}", hwaddr)?;
    writeln!(eth, "BRIDGE={}", bridge)?;

    let mut br = String::new();
    writeln!(br, "XEMANAGED=yes")?;
    writeln!(br, "DEVICE={}", bridge)?;
    writeln!(br, "ONBOOT=no")?;
    writeln!(br, "TYPE=Bridge")?;
    writeln!(br, "DELAY=0")?;
    writeln!(br, "STP=0")?;
    writeln!(br, "PIFDEV={}", label)?;
    if get(interface, "MODE")? == "static" {
        writeln!(br, "BOOTPROTO=none")?;
        writeln!(br, "NETMASK={}", get(interface, "NETMASK")?)?;
        writeln!(br, "IPADDR={}", get(interface, "IP")?)?;
        writeln!(br, "GATEWAY={}", get(interface, "GATEWAY")?)?;
        let mut n = 1;
        while let Some(dns) = interface.get(&format!("DNS{}", n)) {
            writeln!(br, "DNS{}={}", n, dns)?;
            n += 1;
        }
        if n > 1 {
            writeln!(br, "PEERDNS=yes")?;
        }
    } else {
        writeln!(br, "BOOTPROTO=dhcp")?;
        writeln!(br, "PERSISTENT_DHCLIENT=yes")?;
        writeln!(br, "PEERDNS=yes")?;
    }

    Ok(vec![(format!("ifcfg-{}", label), eth), (format!("ifcfg-{}", bridge), br)])
}

fn regenerate_initial_ifcfg(backup_firstboot: &Utf8Path, save_dir: &Utf8Path) -> Result<()> {
    let network = read_key_value_file(&backup_firstboot.join("network.conf"))?;
    let Some(mac) = network.get("ADMIN_INTERFACE") else {
        tracing::debug!("no management interface recorded, skipping ifcfg generation");
        return Ok(());
    };
    let interface = read_key_value_file(&backup_firstboot.join(format!("interface-{}.conf", mac)))?;
    let files = render_initial_ifcfg(&network, &interface)?;

    fs::create_dir_all(save_dir)
        .map_err(|e| UpgradeError::io(format!("failed to create {}", save_dir), e))?;
    for (name, content) in files {
        write_file(&save_dir.join(name), &content)?;
    }
    Ok(())
}

/// Writes into the new root, or only logs what it would write.
struct RootWriter<'a> {
    root: &'a Utf8Path,
    dry_run: bool,
}

impl RootWriter<'_> {
    fn create_dir(&self, relative: &Utf8Path) -> Result<()> {
        let path = self.root.join(relative);
        if self.dry_run {
            tracing::info!("dry run: would create {}", path);
            return Ok(());
        }
        fs::create_dir_all(&path).map_err(|e| UpgradeError::io(format!("failed to create {}", path), e))?;
        Ok(())
    }

    fn write(&self, relative: &Utf8Path, content: &str) -> Result<()> {
        let path = self.root.join(relative);
        if self.dry_run {
            tracing::info!("dry run: would write {}", path);
            return Ok(());
        }
        write_file(&path, content)
    }
}

/// Restores preserved state into the new root and marks the first boot as an upgrade.
///
/// With `env.dry_run` set the backup is still mounted through the host, but
/// nothing is restored or written under the new root.
pub(super) fn complete_third_gen(
    source: &SourceInstallation,
    env: &StageEnv<'_>,
    input: &CompleteUpgradeInput,
) -> Result<RestoreReport> {
    let entries = third_gen_restore_list(env.config)?;
    let root = input.root_mount.as_path();
    let writer = RootWriter {
        root,
        dry_run: env.dry_run,
    };
    for dir in ["var/xapi", "etc/xensource"] {
        writer.create_dir(Utf8Path::new(dir))?;
    }

    let firstboot = env.config.firstboot_data_dir.as_path();
    let backup_device = partition_device(&source.primary_disk, input.backup_partnum);
    let host = env.host;

    restore::with_backup_mounted(host, &backup_device, &env.config.temp_dir, |backup_root| {
        let report = if env.dry_run {
            for entry in &entries {
                tracing::info!("dry run: would restore {}", entry);
            }
            RestoreReport::default()
        } else {
            restore::restore_entries(host, backup_root, root, &entries)?
        };

        writer.write(
            Utf8Path::new("var/tmp/.previousVersion"),
            &format!("PRODUCT_VERSION='{}'\n", source.version),
        )?;
        writer.write(&firstboot.join("host.conf"), "UPGRADE=true\n")?;

        let save_dir = root.join(firstboot).join(INITIAL_IFCFG);
        if env.dry_run {
            tracing::info!("dry run: would generate firstboot ifcfg files in {}", save_dir);
        } else if !save_dir.exists() {
            tracing::info!("generating firstboot ifcfg files from firstboot data");
            if let Err(e) = regenerate_initial_ifcfg(&backup_root.join(firstboot), &save_dir) {
                tracing::debug!("initial ifcfg generation skipped: {:#}", e);
            }
        }
        Ok(report)
    })
}

/// Upgrader for series 5 Retail installations.
pub struct ThirdGenUpgrader<'a> {
    descriptor: UpgraderDescriptor,
    source: &'a mut SourceInstallation,
}

impl<'a> ThirdGenUpgrader<'a> {
    pub fn new(descriptor: UpgraderDescriptor, source: &'a mut SourceInstallation) -> Self {
        Self { descriptor, source }
    }
}

impl Upgrader for ThirdGenUpgrader<'_> {
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
}
