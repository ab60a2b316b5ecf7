//! Filesystem primitives on the installer host, and scoped mounts.
//!
//! [`HostOps`] is the contract the backup and restore stages rely on.
//! [`CommandHost`] implements it with the usual tools (`mkfs.ext3`, `mount`,
//! `umount`, `cp`) through a [`CommandExecutor`].
//!
//! [`ScopedMount`] owns a private mount point: a fresh directory under the
//! configured temp root, unmounted and removed when the guard goes away on
//! any exit path. The directory is removed with `remove_dir`, never
//! recursively, so a failed unmount can never take the mounted data with it.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::error::UpgradeError;
use crate::executor::{CommandExecutor, CommandSpec};

/// Mount, copy and format primitives.
///
/// Every method either succeeds or returns an error that aborts the
/// calling stage.
pub trait HostOps {
    /// Creates an ext3 filesystem on `device`.
    fn format_ext3(&self, device: &Utf8Path) -> Result<()>;

    fn mount(&self, device: &Utf8Path, target: &Utf8Path, options: &[&str]) -> Result<()>;

    fn umount(&self, target: &Utf8Path) -> Result<()>;

    /// Copies every entry of `src` into `dst`, preserving attributes (`cp -a src/* dst/`).
    fn copy_tree_contents(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<()>;

    /// Copies `src` itself (file or directory) into the directory `dst_dir`.
    fn copy_into(&self, src: &Utf8Path, dst_dir: &Utf8Path) -> Result<()>;

    /// Copies a single file to `dst`, preserving mode, ownership and timestamps.
    fn copy_file(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<()>;
}

/// Sorted entries of a directory, as UTF-8 paths.
pub fn list_dir(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, UpgradeError> {
    let mut entries = Vec::new();
    for entry in dir
        .read_dir_utf8()
        .map_err(|e| UpgradeError::io(format!("failed to list {}", dir), e))?
    {
        let entry = entry.map_err(|e| UpgradeError::io(format!("failed to list {}", dir), e))?;
        entries.push(entry.into_path());
    }
    entries.sort();
    Ok(entries)
}

/// [`HostOps`] backed by external commands.
pub struct CommandHost {
    executor: Arc<dyn CommandExecutor>,
}

impl CommandHost {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn run(&self, command: &str, args: Vec<String>) -> Result<()> {
        let spec = CommandSpec::new(command, args);
        let result = self
            .executor
            .execute(&spec)
            .with_context(|| format!("failed to execute {}", spec.display()))?;
        result.check(&spec)?;
        Ok(())
    }
}

impl HostOps for CommandHost {
    fn format_ext3(&self, device: &Utf8Path) -> Result<()> {
        self.run("mkfs.ext3", vec![device.to_string()])
    }

    fn mount(&self, device: &Utf8Path, target: &Utf8Path, options: &[&str]) -> Result<()> {
        let mut args = Vec::new();
        if !options.is_empty() {
            args.push("-o".to_string());
            args.push(options.join(","));
        }
        args.push(device.to_string());
        args.push(target.to_string());
        self.run("mount", args)
    }

    fn umount(&self, target: &Utf8Path) -> Result<()> {
        self.run("umount", vec![target.to_string()])
    }

    fn copy_tree_contents(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
        let children = list_dir(src)?;
        if children.is_empty() {
            tracing::debug!("nothing to copy from {}", src);
            return Ok(());
        }
        let mut args = vec!["-a".to_string()];
        args.extend(children.into_iter().map(String::from));
        args.push(format!("{}/", dst));
        self.run("cp", args)
    }

    fn copy_into(&self, src: &Utf8Path, dst_dir: &Utf8Path) -> Result<()> {
        self.run("cp", vec!["-a".to_string(), src.to_string(), format!("{}/", dst_dir)])
    }

    fn copy_file(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
        self.run("cp", vec!["-p".to_string(), src.to_string(), dst.to_string()])
    }
}

/// A device mounted on a private, uniquely named directory.
///
/// Dropping the guard unmounts and removes the directory; use
/// [`release`](Self::release) to observe cleanup errors instead of only
/// logging them.
pub struct ScopedMount<'h> {
    host: &'h dyn HostOps,
    device: Utf8PathBuf,
    dir: Utf8PathBuf,
    mounted: bool,
    released: bool,
}

impl<'h> ScopedMount<'h> {
    /// Creates a mount point under `temp_root` named `<prefix>XXXXXX` and
    /// mounts `device` on it.
    pub fn new(
        host: &'h dyn HostOps,
        device: &Utf8Path,
        temp_root: &Utf8Path,
        prefix: &str,
        options: &[&str],
    ) -> Result<Self> {
        fs::create_dir_all(temp_root)
            .map_err(|e| UpgradeError::io(format!("failed to create {}", temp_root), e))?;
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(temp_root)
            .map_err(|e| UpgradeError::io(format!("failed to create mount point in {}", temp_root), e))?
            .keep();
        let dir = Utf8PathBuf::from_path_buf(dir)
            .map_err(|p| anyhow::anyhow!("mount point is not UTF-8: {}", p.display()))?;

        let mut guard = Self {
            host,
            device: device.to_owned(),
            dir,
            mounted: false,
            released: false,
        };
        tracing::debug!(device = %device, target = %guard.dir, ?options, "mounting");
        host.mount(device, &guard.dir, options)
            .with_context(|| format!("failed to mount {} on {}", device, guard.dir))?;
        guard.mounted = true;
        Ok(guard)
    }

    /// Where the device is mounted.
    pub fn path(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn device(&self) -> &Utf8Path {
        &self.device
    }

    /// Unmounts and removes the mount point, reporting failures.
    pub fn release(mut self) -> Result<()> {
        self.cleanup()
    }

    /// Attempted at most once; a failure is not retried on drop.
    fn cleanup(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.released, true) {
            return Ok(());
        }
        if std::mem::take(&mut self.mounted) {
            self.host
                .umount(&self.dir)
                .with_context(|| format!("failed to unmount {}", self.dir))?;
        }
        fs::remove_dir(&self.dir)
            .map_err(|e| UpgradeError::io(format!("failed to remove mount point {}", self.dir), e))?;
        Ok(())
    }
}

impl Drop for ScopedMount<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::error!(
                device = %self.device,
                "failed to clean up mount point {}: {:#}. Manual cleanup may be required",
                self.dir,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionResult;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::Mutex;

    struct MockExecutor {
        calls: Mutex<Vec<Vec<String>>>,
        fail_command: Option<&'static str>,
    }

    impl MockExecutor {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_command: None,
            }
        }

        fn failing(command: &'static str) -> Self {
            Self {
                fail_command: Some(command),
                ..Self::new()
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandExecutor for MockExecutor {
        fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
            let mut call = vec![spec.command.clone()];
            call.extend(spec.args.iter().cloned());
            self.calls.lock().unwrap().push(call);
            let code = if self.fail_command == Some(spec.command.as_str()) { 1 } else { 0 };
            Ok(ExecutionResult {
                status: Some(ExitStatus::from_raw(code << 8)),
            })
        }
    }

    fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn mount_builds_option_list() {
        let executor = Arc::new(MockExecutor::new());
        let host = CommandHost::new(executor.clone());
        host.mount(Utf8Path::new("/dev/sda2"), Utf8Path::new("/mnt"), &["ro", "noatime"])
            .unwrap();
        host.mount(Utf8Path::new("/dev/sda3"), Utf8Path::new("/mnt"), &[]).unwrap();
        let calls = executor.calls();
        assert_eq!(calls[0], vec!["mount", "-o", "ro,noatime", "/dev/sda2", "/mnt"]);
        assert_eq!(calls[1], vec!["mount", "/dev/sda3", "/mnt"]);
    }

    #[test]
    fn copy_tree_contents_lists_children() {
        let (_keep, root) = temp_root();
        fs::write(root.join("b"), "").unwrap();
        fs::create_dir(root.join("a")).unwrap();
        let executor = Arc::new(MockExecutor::new());
        let host = CommandHost::new(executor.clone());
        host.copy_tree_contents(&root, Utf8Path::new("/backup")).unwrap();
        let calls = executor.calls();
        assert_eq!(
            calls[0],
            vec![
                "cp".to_string(),
                "-a".to_string(),
                root.join("a").to_string(),
                root.join("b").to_string(),
                "/backup/".to_string()
            ]
        );
    }

    #[test]
    fn copy_tree_contents_of_empty_dir_runs_nothing() {
        let (_keep, root) = temp_root();
        let executor = Arc::new(MockExecutor::new());
        CommandHost::new(executor.clone())
            .copy_tree_contents(&root, Utf8Path::new("/backup"))
            .unwrap();
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn failed_format_is_execution_error() {
        let executor = Arc::new(MockExecutor::failing("mkfs.ext3"));
        let err = CommandHost::new(executor)
            .format_ext3(Utf8Path::new("/dev/sda2"))
            .unwrap_err();
        let typed = err.downcast_ref::<UpgradeError>();
        assert!(matches!(typed, Some(UpgradeError::Execution { .. })), "{:#}", err);
    }

    #[test]
    fn scoped_mount_unmounts_and_removes_dir_on_drop() {
        let (_keep, root) = temp_root();
        let executor = Arc::new(MockExecutor::new());
        let host = CommandHost::new(executor.clone());
        let dir = {
            let mount =
                ScopedMount::new(&host, Utf8Path::new("/dev/sda2"), &root, "upgrade-src-", &["ro"])
                    .unwrap();
            assert!(mount.path().file_name().unwrap().starts_with("upgrade-src-"));
            assert!(mount.path().is_dir());
            mount.path().to_owned()
        };
        assert!(!dir.exists());
        let calls = executor.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0][0], "mount");
        assert_eq!(calls[1], vec!["umount".to_string(), dir.to_string()]);
    }

    #[test]
    fn scoped_mount_keeps_dir_when_unmount_fails() {
        let (_keep, root) = temp_root();
        let executor = Arc::new(MockExecutor::failing("umount"));
        let host = CommandHost::new(executor.clone());
        let mount =
            ScopedMount::new(&host, Utf8Path::new("/dev/sda2"), &root, "upgrade-src-", &[]).unwrap();
        let dir = mount.path().to_owned();
        assert!(mount.release().is_err());
        assert!(dir.exists(), "mount point must survive a failed unmount");
    }

    #[test]
    fn failed_release_is_not_retried_on_drop() {
        let (_keep, root) = temp_root();
        let executor = Arc::new(MockExecutor::failing("umount"));
        let host = CommandHost::new(executor.clone());
        let mount =
            ScopedMount::new(&host, Utf8Path::new("/dev/sda2"), &root, "upgrade-src-", &[]).unwrap();
        assert!(mount.release().is_err());
        let umounts = executor.calls().iter().filter(|c| c[0] == "umount").count();
        assert_eq!(umounts, 1);
    }

    #[test]
    fn failed_mount_removes_mount_point() {
        let (_keep, root) = temp_root();
        let executor = Arc::new(MockExecutor::failing("mount"));
        let host = CommandHost::new(executor);
        let err = ScopedMount::new(&host, Utf8Path::new("/dev/sda2"), &root, "upgrade-src-", &[])
            .err()
            .expect("mount should fail");
        assert!(format!("{:#}", err).contains("failed to mount /dev/sda2"));
        assert!(list_dir(&root).unwrap().is_empty());
    }
}
