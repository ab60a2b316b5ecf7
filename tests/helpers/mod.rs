//! Shared fixtures for integration tests.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use hostupgrade::disk::DiskDescription;
use hostupgrade::executor::{CommandExecutor, CommandSpec, ExecutionResult};
use hostupgrade::host::HostOps;

pub const MIB: u64 = 1 << 20;

/// Creates a scratch directory and returns it with its UTF-8 path.
#[allow(dead_code)]
pub fn scratch_dir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("non UTF-8 temp dir");
    (dir, path)
}

/// Writes `(relative path, content)` pairs below `root`, creating parents.
#[allow(dead_code)]
pub fn write_tree(root: &Utf8Path, files: &[(&str, &str)]) {
    for (relative, content) in files {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
    }
}

#[allow(dead_code)]
pub fn read(path: impl AsRef<Utf8Path>) -> String {
    let path = path.as_ref();
    fs::read_to_string(path).unwrap_or_else(|e| panic!("failed to read {}: {}", path, e))
}

fn copy_dir_all(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in src.read_dir_utf8()? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// [`HostOps`] that "mounts" a device by symlinking its fixture directory
/// onto the mount point, and records every call.
///
/// Formatting empties the device's fixture directory.
#[derive(Default)]
pub struct FakeHost {
    devices: BTreeMap<Utf8PathBuf, Utf8PathBuf>,
    mounted: RefCell<BTreeMap<Utf8PathBuf, Utf8PathBuf>>,
    calls: RefCell<Vec<String>>,
}

#[allow(dead_code)]
impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backs `device` with the directory `dir`.
    pub fn with_device(mut self, device: impl Into<Utf8PathBuf>, dir: impl Into<Utf8PathBuf>) -> Self {
        let dir = dir.into();
        fs::create_dir_all(&dir).unwrap();
        self.devices.insert(device.into(), dir);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// Devices whose trees were copied, in order.
    pub fn copied_devices(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| c.strip_prefix("copy-tree ").map(str::to_string))
            .collect()
    }

    pub fn mounted_count(&self) -> usize {
        self.mounted.borrow().len()
    }

    fn record(&self, call: String) {
        self.calls.borrow_mut().push(call);
    }

    fn device_under(&self, path: &Utf8Path) -> String {
        self.mounted
            .borrow()
            .iter()
            .find(|(target, _)| path.starts_with(target))
            .map(|(_, device)| device.to_string())
            .unwrap_or_else(|| path.to_string())
    }
}

impl HostOps for FakeHost {
    fn format_ext3(&self, device: &Utf8Path) -> Result<()> {
        self.record(format!("format {}", device));
        let Some(dir) = self.devices.get(device) else {
            bail!("no such device: {}", device);
        };
        fs::remove_dir_all(dir)?;
        fs::create_dir(dir)?;
        Ok(())
    }

    fn mount(&self, device: &Utf8Path, target: &Utf8Path, options: &[&str]) -> Result<()> {
        self.record(format!("mount {} {}", device, options.join(",")));
        let Some(dir) = self.devices.get(device) else {
            bail!("no such device: {}", device);
        };
        fs::remove_dir(target).with_context(|| format!("mount point {} not empty", target))?;
        symlink(dir, target)?;
        self.mounted.borrow_mut().insert(target.to_owned(), device.to_owned());
        Ok(())
    }

    fn umount(&self, target: &Utf8Path) -> Result<()> {
        let device = self
            .mounted
            .borrow_mut()
            .remove(target)
            .with_context(|| format!("{} is not mounted", target))?;
        self.record(format!("umount {}", device));
        fs::remove_file(target)?;
        fs::create_dir(target)?;
        Ok(())
    }

    fn copy_tree_contents(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
        self.record(format!("copy-tree {}", self.device_under(src)));
        copy_dir_all(src, dst)
    }

    fn copy_into(&self, src: &Utf8Path, dst_dir: &Utf8Path) -> Result<()> {
        self.record(format!("copy-into {}", src.file_name().unwrap_or_default()));
        copy_dir_all(src, &dst_dir.join(src.file_name().context("no file name")?))
    }

    fn copy_file(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
        fs::copy(src, dst)?;
        Ok(())
    }
}

/// Executor that records every command and reports success.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<Vec<String>>>,
}

#[allow(dead_code)]
impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandExecutor for RecordingExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        let mut call = vec![spec.command.clone()];
        call.extend(spec.args.iter().cloned());
        self.calls.lock().unwrap().push(call);
        Ok(ExecutionResult { status: None })
    }
}

/// Builds a disk description from `(number, start, size)` triples and
/// `(partition, role)` volume pairs, roles written as in YAML.
#[allow(dead_code)]
pub fn describe_disk(
    device: &str,
    size: u64,
    partitions: &[(u32, u64, u64)],
    volumes: &[(u32, &str)],
) -> DiskDescription {
    let mut yaml = format!("device: {}\nsize: {}\npartitions:\n", device, size);
    for (number, start, psize) in partitions {
        yaml.push_str(&format!("  - {{ number: {}, start: {}, size: {} }}\n", number, start, psize));
    }
    yaml.push_str("volumes:\n");
    for (partition, role) in volumes {
        yaml.push_str(&format!("  - {{ partition: {}, role: {} }}\n", partition, role));
    }
    if volumes.is_empty() {
        yaml = yaml.replace("volumes:\n", "volumes: []\n");
    }
    if partitions.is_empty() {
        yaml = yaml.replace("partitions:\n", "partitions: []\n");
    }
    serde_yaml::from_str(&yaml).expect("invalid disk description")
}
