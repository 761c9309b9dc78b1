//! Image to local device mapping.

use std::sync::Arc;

use tracing::info;

use super::{Device, FilesystemManager, MappingError, UnmapError, DEFAULT_FS_TYPE};
use crate::exec::CommandRunner;
use crate::remote::Image;

/// Attaches images as local block devices and detaches them again.
#[derive(Clone)]
pub struct DeviceMapper {
    runner: Arc<dyn CommandRunner>,
    filesystems: FilesystemManager,
}

impl DeviceMapper {
    pub fn new(runner: Arc<dyn CommandRunner>, filesystems: FilesystemManager) -> Self {
        Self {
            runner,
            filesystems,
        }
    }

    /// Map `image` and return the unmounted device it was assigned.
    pub fn map(&self, image: &Image, fs_type: Option<&str>) -> Result<Device, MappingError> {
        let mut args = vec!["map"];
        if let Some(user) = image.username() {
            args.extend(["--id", user]);
        }
        args.extend(["--pool", image.pool(), image.name()]);

        let path = self
            .runner
            .run("rbd", &args)
            .map_err(|source| MappingError::Map {
                image: image.name().to_string(),
                pool: image.pool().to_string(),
                source,
            })?;

        if path.is_empty() {
            return Err(MappingError::EmptyPath {
                image: image.name().to_string(),
            });
        }

        let fs_type = fs_type.filter(|t| !t.is_empty()).unwrap_or(DEFAULT_FS_TYPE);
        info!(
            image = %image.name(),
            pool = %image.pool(),
            device = %path,
            fs_type,
            "Image mapped"
        );

        Ok(Device::new(path, fs_type))
    }

    /// Detach the device, unmounting it first if it is mounted.
    ///
    /// A failed unmount aborts before anything is detached. After success the
    /// device record is stale and should be discarded.
    pub fn unmap(&self, device: &mut Device) -> Result<(), UnmapError> {
        if device.is_mounted() {
            self.filesystems
                .unmount(device)
                .map_err(|source| UnmapError::StillMounted {
                    device: device.path().to_string(),
                    source,
                })?;
            device.clear_mount();
        }

        self.runner
            .run("rbd", &["unmap", device.path()])
            .map_err(|source| UnmapError::Unmap {
                device: device.path().to_string(),
                source,
            })?;

        info!(device = %device.path(), "Device unmapped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::exec::ScriptedRunner;
    use crate::remote::{ConfigSource, ConnectOptions, Connection, MemoryStore};

    fn mapper() -> (Arc<ScriptedRunner>, DeviceMapper) {
        let runner = Arc::new(ScriptedRunner::new());
        let mapper = DeviceMapper::new(runner.clone(), FilesystemManager::new(runner.clone()));
        (runner, mapper)
    }

    fn image(dir: &Path, user: Option<&str>) -> Image {
        let conf = dir.join("ceph.conf");
        std::fs::write(&conf, "[global]\n").unwrap();
        let store = MemoryStore::new().with_pool("lxd");
        let options = ConnectOptions {
            user: user.map(str::to_string),
            pool: Some("lxd".to_string()),
            cluster: None,
            config: ConfigSource::Explicit(conf),
        };
        let mut conn = Connection::connect(Arc::new(store), &options).unwrap();
        let image = conn.get_or_create_image("foobar", 20).unwrap();
        conn.shutdown();
        image
    }

    #[test]
    fn test_map_argument_vector() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, mapper) = mapper();
        runner.respond("rbd", &["map"], "/dev/rbd0\n");

        let device = mapper.map(&image(dir.path(), Some("lxd")), Some("ext4")).unwrap();
        assert_eq!(device.path(), "/dev/rbd0");
        assert_eq!(device.fs_type(), "ext4");
        assert!(!device.is_mounted());
        assert_eq!(
            runner.lines(),
            vec!["rbd map --id lxd --pool lxd foobar".to_string()]
        );
    }

    #[test]
    fn test_map_without_user_or_fs_type() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, mapper) = mapper();
        runner.respond("rbd", &["map"], "/dev/rbd3");

        let device = mapper.map(&image(dir.path(), None), None).unwrap();
        assert_eq!(device.fs_type(), DEFAULT_FS_TYPE);
        assert_eq!(runner.lines(), vec!["rbd map --pool lxd foobar".to_string()]);
    }

    #[test]
    fn test_map_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, mapper) = mapper();
        runner.fail("rbd", &["map"], 1, "rbd: sysfs write failed");

        let err = mapper.map(&image(dir.path(), Some("lxd")), None).unwrap_err();
        assert_eq!(err.reason_code(), "map_failed");
    }

    #[test]
    fn test_map_empty_path() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, mapper) = mapper();
        runner.respond("rbd", &["map"], "");

        let err = mapper.map(&image(dir.path(), Some("lxd")), None).unwrap_err();
        assert!(matches!(err, MappingError::EmptyPath { .. }));
    }

    #[test]
    fn test_unmap_mounted_unmounts_first() {
        let (runner, mapper) = mapper();
        runner.respond("umount", &[], "").respond("rbd", &["unmap"], "");
        let mut device = Device::mounted_at("/dev/rbd0", "ext4", "/mnt/foo");

        mapper.unmap(&mut device).unwrap();
        assert_eq!(
            runner.lines(),
            vec!["umount /dev/rbd0".to_string(), "rbd unmap /dev/rbd0".to_string()]
        );
        assert!(!device.is_mounted());
    }

    #[test]
    fn test_unmap_aborts_when_unmount_fails() {
        let (runner, mapper) = mapper();
        runner
            .fail("umount", &[], 32, "target is busy")
            .respond("rbd", &["unmap"], "");
        let mut device = Device::mounted_at("/dev/rbd0", "ext4", "/mnt/foo");

        let err = mapper.unmap(&mut device).unwrap_err();
        assert!(matches!(err, UnmapError::StillMounted { .. }));
        assert!(device.is_mounted());
        assert_eq!(runner.count("rbd", &["unmap"]), 0);
    }

    #[test]
    fn test_unmap_unmounted_device() {
        let (runner, mapper) = mapper();
        runner.respond("rbd", &["unmap"], "");
        let mut device = Device::new("/dev/rbd0", "xfs");

        mapper.unmap(&mut device).unwrap();
        assert_eq!(runner.lines(), vec!["rbd unmap /dev/rbd0".to_string()]);
    }

    #[test]
    fn test_unmap_failure() {
        let (runner, mapper) = mapper();
        runner.fail("rbd", &["unmap"], 16, "rbd: sysfs write failed");
        let mut device = Device::new("/dev/rbd0", "xfs");

        let err = mapper.unmap(&mut device).unwrap_err();
        assert_eq!(err.reason_code(), "unmap_failed");
    }
}
