//! Filesystem probing, formatting and mounting.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Device, FilesystemError, FormatError};
use crate::exec::CommandRunner;

/// Inspects, formats, mounts and unmounts local devices.
#[derive(Clone)]
pub struct FilesystemManager {
    runner: Arc<dyn CommandRunner>,
    strict_fs_check: bool,
}

impl FilesystemManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            strict_fs_check: false,
        }
    }

    /// Refuse to reformat a device that already carries another filesystem.
    pub fn with_strict_fs_check(mut self, strict: bool) -> Self {
        self.strict_fs_check = strict;
        self
    }

    /// Filesystem type found on the device, `None` when unrecognised.
    pub fn detect_filesystem_type(&self, device: &Device) -> Option<String> {
        match self
            .runner
            .run("blkid", &["-o", "value", "-s", "TYPE", device.path()])
        {
            Ok(fs_type) if !fs_type.is_empty() => Some(fs_type),
            Ok(_) => None,
            Err(e) => {
                debug!(device = %device.path(), error = %e, "No filesystem detected");
                None
            }
        }
    }

    /// True iff the detected type equals the declared type.
    pub fn is_formatted(&self, device: &Device) -> bool {
        self.detect_filesystem_type(device).as_deref() == Some(device.fs_type())
    }

    /// Create the declared filesystem on the device. Destroys existing data.
    ///
    /// No flags are passed, so utilities that refuse to overwrite an existing
    /// filesystem fail with [`FormatError::Failed`].
    pub fn format(&self, device: &Device) -> Result<(), FormatError> {
        self.run_mkfs(device, &[])
    }

    /// Like [`FilesystemManager::format`], but overwrite whatever filesystem
    /// the device holds.
    pub fn reformat(&self, device: &Device) -> Result<(), FormatError> {
        match force_flag(device.fs_type()) {
            Some(flag) => self.run_mkfs(device, &[flag]),
            None => self.run_mkfs(device, &[]),
        }
    }

    fn run_mkfs(&self, device: &Device, flags: &[&str]) -> Result<(), FormatError> {
        let utility = format!("mkfs.{}", device.fs_type());
        let mkfs = self
            .runner
            .locate(&utility)
            .ok_or_else(|| FormatError::UtilityNotFound {
                device: device.path().to_string(),
                utility: utility.clone(),
            })?;

        info!(device = %device.path(), fs_type = %device.fs_type(), ?flags, "Formatting device");

        let mut args = flags.to_vec();
        args.push(device.path());
        self.runner
            .run(&mkfs.to_string_lossy(), &args)
            .map_err(|source| FormatError::Failed {
                device: device.path().to_string(),
                fs_type: device.fs_type().to_string(),
                source,
            })?;

        Ok(())
    }

    /// Format the device unless it already carries the declared type.
    ///
    /// Returns whether a format ran.
    pub fn ensure_formatted(&self, device: &Device) -> Result<bool, FormatError> {
        let found = self.detect_filesystem_type(device);

        match found.as_deref() {
            Some(fs_type) if fs_type == device.fs_type() => {
                debug!(device = %device.path(), fs_type, "Device already formatted");
                return Ok(false);
            }
            Some(other) if self.strict_fs_check => {
                return Err(FormatError::ForeignFilesystem {
                    device: device.path().to_string(),
                    found: other.to_string(),
                    expected: device.fs_type().to_string(),
                });
            }
            Some(other) => {
                warn!(
                    device = %device.path(),
                    found = other,
                    expected = %device.fs_type(),
                    "Device holds a different filesystem; reformatting"
                );
                self.reformat(device)?;
                return Ok(true);
            }
            None => {}
        }

        self.format(device)?;
        Ok(true)
    }

    /// Mount the device at `mount_point`, formatting it first if needed.
    ///
    /// Fails if the device is already recorded at this mount point. A mount
    /// at a different point is attempted and replaces the recorded one.
    pub fn mount(&self, device: &mut Device, mount_point: &str) -> Result<String, FilesystemError> {
        self.check_mount_target(device, mount_point)?;
        self.ensure_formatted(device)?;
        self.run_mount(device, mount_point)
    }

    /// Mount a device already known to carry its declared filesystem.
    ///
    /// Same as [`FilesystemManager::mount`] without probing or formatting.
    pub fn mount_formatted(
        &self,
        device: &mut Device,
        mount_point: &str,
    ) -> Result<String, FilesystemError> {
        self.check_mount_target(device, mount_point)?;
        self.run_mount(device, mount_point)
    }

    fn run_mount(&self, device: &mut Device, mount_point: &str) -> Result<String, FilesystemError> {
        self.runner
            .run(
                "mount",
                &["-t", device.fs_type(), device.path(), mount_point],
            )
            .map_err(|source| FilesystemError::Mount {
                device: device.path().to_string(),
                mount_point: mount_point.to_string(),
                source,
            })?;

        device.record_mount(mount_point);
        info!(
            device = %device.path(),
            mount_point,
            fs_type = %device.fs_type(),
            "Device mounted"
        );

        Ok(mount_point.to_string())
    }

    fn check_mount_target(&self, device: &Device, mount_point: &str) -> Result<(), FilesystemError> {
        if !device.is_mounted() {
            return Ok(());
        }
        match device.mount_point() {
            Some(current) if current == mount_point => Err(FilesystemError::AlreadyMounted {
                device: device.path().to_string(),
                mount_point: current.to_string(),
            }),
            current => {
                warn!(
                    device = %device.path(),
                    current = current.unwrap_or(""),
                    requested = mount_point,
                    "Device is already mounted elsewhere"
                );
                Ok(())
            }
        }
    }

    /// Unmount the device.
    ///
    /// The caller clears the recorded mount with [`Device::clear_mount`].
    pub fn unmount(&self, device: &Device) -> Result<(), FilesystemError> {
        self.runner
            .run("umount", &[device.path()])
            .map_err(|source| FilesystemError::Unmount {
                device: device.path().to_string(),
                source,
            })?;

        info!(device = %device.path(), "Device unmounted");
        Ok(())
    }
}

/// Flag that makes `mkfs.<fs_type>` overwrite an existing filesystem.
fn force_flag(fs_type: &str) -> Option<&'static str> {
    match fs_type {
        "xfs" | "btrfs" => Some("-f"),
        "ext2" | "ext3" | "ext4" => Some("-F"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ScriptedRunner;

    fn manager() -> (Arc<ScriptedRunner>, FilesystemManager) {
        let runner = Arc::new(ScriptedRunner::new());
        let fs = FilesystemManager::new(runner.clone());
        (runner, fs)
    }

    #[test]
    fn test_detect_empty_means_none() {
        let (runner, fs) = manager();
        runner.respond("blkid", &[], "");
        assert_eq!(fs.detect_filesystem_type(&Device::new("/dev/rbd0", "ext4")), None);
        assert_eq!(
            runner.lines(),
            vec!["blkid -o value -s TYPE /dev/rbd0".to_string()]
        );
    }

    #[test]
    fn test_detect_failure_means_none() {
        let (runner, fs) = manager();
        runner.fail("blkid", &[], 2, "");
        assert_eq!(fs.detect_filesystem_type(&Device::new("/dev/rbd0", "ext4")), None);
    }

    #[test]
    fn test_format_then_formatted() {
        let (runner, fs) = manager();
        runner
            .install("mkfs.ext4")
            .respond("mkfs.ext4", &[], "")
            .respond("blkid", &[], "")
            .respond("blkid", &[], "ext4");
        let device = Device::new("/dev/rbd0", "ext4");

        assert!(!fs.is_formatted(&device));
        fs.format(&device).unwrap();
        assert!(fs.is_formatted(&device));
        assert!(runner
            .lines()
            .contains(&"/usr/sbin/mkfs.ext4 /dev/rbd0".to_string()));
    }

    #[test]
    fn test_format_without_utility() {
        let (_runner, fs) = manager();
        let err = fs.format(&Device::new("/dev/rbd0", "zfs")).unwrap_err();
        assert!(matches!(err, FormatError::UtilityNotFound { .. }));
        assert!(err.to_string().contains("mkfs.zfs"));
    }

    #[test]
    fn test_format_failure() {
        let (runner, fs) = manager();
        runner.install("mkfs.xfs").fail("mkfs.xfs", &[], 1, "device busy");
        let err = fs.format(&Device::new("/dev/rbd0", "xfs")).unwrap_err();
        assert!(matches!(err, FormatError::Failed { .. }));
    }

    #[test]
    fn test_mount_formatted_device_skips_format() {
        let (runner, fs) = manager();
        runner
            .install("mkfs.ext4")
            .respond("blkid", &[], "ext4")
            .respond("mount", &[], "");
        let mut device = Device::new("/dev/rbd0", "ext4");

        let mount_point = fs.mount(&mut device, "/mnt/foo").unwrap();
        assert_eq!(mount_point, "/mnt/foo");
        assert_eq!(device.mount_point(), Some("/mnt/foo"));
        assert_eq!(runner.count("mkfs.ext4", &[]), 0);
        assert_eq!(runner.count("mount", &["-t", "ext4", "/dev/rbd0", "/mnt/foo"]), 1);
    }

    #[test]
    fn test_mount_unformatted_device_formats_first() {
        let (runner, fs) = manager();
        runner
            .install("mkfs.ext4")
            .respond("mkfs.ext4", &[], "")
            .respond("blkid", &[], "")
            .respond("mount", &[], "");
        let mut device = Device::new("/dev/rbd0", "ext4");

        fs.mount(&mut device, "/mnt/foo").unwrap();
        let lines = runner.lines();
        let mkfs = lines.iter().position(|l| l.contains("mkfs.ext4")).unwrap();
        let mount = lines.iter().position(|l| l.starts_with("mount")).unwrap();
        assert!(mkfs < mount);
    }

    #[test]
    fn test_mount_twice_same_point_rejected() {
        let (runner, fs) = manager();
        runner.respond("blkid", &[], "ext4").respond("mount", &[], "");
        let mut device = Device::new("/dev/rbd0", "ext4");

        fs.mount(&mut device, "/mnt/foo").unwrap();
        let err = fs.mount(&mut device, "/mnt/foo").unwrap_err();
        assert!(matches!(err, FilesystemError::AlreadyMounted { .. }));
        assert_eq!(device.mount_point(), Some("/mnt/foo"));
        assert_eq!(runner.count("mount", &[]), 1);
    }

    #[test]
    fn test_mount_elsewhere_is_attempted() {
        let (runner, fs) = manager();
        runner.respond("blkid", &[], "ext4").respond("mount", &[], "");
        let mut device = Device::mounted_at("/dev/rbd0", "ext4", "/mnt/foo");

        fs.mount(&mut device, "/mnt/bar").unwrap();
        assert_eq!(device.mount_point(), Some("/mnt/bar"));
    }

    #[test]
    fn test_mount_failure_leaves_device_unmounted() {
        let (runner, fs) = manager();
        runner
            .respond("blkid", &[], "ext4")
            .fail("mount", &[], 32, "mount point does not exist");
        let mut device = Device::new("/dev/rbd0", "ext4");

        let err = fs.mount(&mut device, "/mnt/foo").unwrap_err();
        assert_eq!(err.reason_code(), "mount_failed");
        assert!(!device.is_mounted());
    }

    #[test]
    fn test_strict_fs_check_refuses_foreign_filesystem() {
        let (runner, fs) = manager();
        let fs = fs.with_strict_fs_check(true);
        runner.install("mkfs.ext4").respond("blkid", &[], "xfs");
        let device = Device::new("/dev/rbd0", "ext4");

        let err = fs.ensure_formatted(&device).unwrap_err();
        assert!(matches!(err, FormatError::ForeignFilesystem { .. }));
        assert_eq!(runner.count("mkfs.ext4", &[]), 0);
    }

    #[test]
    fn test_lenient_check_reformats_foreign_filesystem() {
        let (runner, fs) = manager();
        runner
            .install("mkfs.ext4")
            .respond("mkfs.ext4", &[], "")
            .respond("blkid", &[], "xfs");
        let device = Device::new("/dev/rbd0", "ext4");

        assert!(fs.ensure_formatted(&device).unwrap());
        assert_eq!(
            runner.lines().last().map(String::as_str),
            Some("/usr/sbin/mkfs.ext4 -F /dev/rbd0")
        );
    }

    #[test]
    fn test_reformat_xfs_forces_overwrite() {
        let (runner, fs) = manager();
        runner
            .install("mkfs.xfs")
            .respond("mkfs.xfs", &[], "")
            .respond("blkid", &[], "ext4");
        let device = Device::new("/dev/rbd0", "xfs");

        assert!(fs.ensure_formatted(&device).unwrap());
        assert_eq!(runner.count("mkfs.xfs", &["-f", "/dev/rbd0"]), 1);
    }

    #[test]
    fn test_blank_device_is_formatted_without_force() {
        let (runner, fs) = manager();
        runner
            .install("mkfs.xfs")
            .respond("mkfs.xfs", &[], "")
            .respond("blkid", &[], "");
        let device = Device::new("/dev/rbd0", "xfs");

        assert!(fs.ensure_formatted(&device).unwrap());
        assert_eq!(runner.count("mkfs.xfs", &["-f"]), 0);
        assert_eq!(runner.count("mkfs.xfs", &["/dev/rbd0"]), 1);
    }

    #[test]
    fn test_mount_formatted_does_not_detect_filesystem() {
        let (runner, fs) = manager();
        runner.install("mkfs.xfs").respond("mount", &[], "");
        let mut device = Device::new("/dev/rbd0", "xfs");

        fs.mount_formatted(&mut device, "/mnt/foo").unwrap();
        assert_eq!(
            runner.lines(),
            vec!["mount -t xfs /dev/rbd0 /mnt/foo".to_string()]
        );
        assert_eq!(device.mount_point(), Some("/mnt/foo"));
    }

    #[test]
    fn test_unmount_uses_umount() {
        let (runner, fs) = manager();
        runner.respond("umount", &[], "");
        fs.unmount(&Device::mounted_at("/dev/rbd0", "ext4", "/mnt/foo"))
            .unwrap();
        assert_eq!(runner.lines(), vec!["umount /dev/rbd0".to_string()]);
    }
}
