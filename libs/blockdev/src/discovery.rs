//! Discovery of images already mapped on this host.
//!
//! Results are a point-in-time snapshot of `rbd showmapped`; they can race
//! with map/unmap calls made elsewhere and are never a lock.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::device::Device;
use crate::exec::{CommandError, CommandRunner};
use crate::remote::Image;

/// Prefix of every device path `rbd map` assigns.
pub const RBD_DEVICE_PREFIX: &str = "/dev/rbd";

/// Fewest whitespace separated fields a mapping row can have
/// (`id pool image snap device`).
const MIN_ROW_FIELDS: usize = 5;

/// Errors querying mapped devices.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("listing mapped devices failed: {0}")]
    ShowMapped(#[from] CommandError),
}

/// One row of `rbd showmapped`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub pool: String,
    /// Set only for images inside a pool namespace.
    pub namespace: Option<String>,
    pub image: String,
    pub device: String,
}

impl Mapping {
    /// Whether this row is `image_name` in the default namespace of `pool`.
    pub fn is(&self, pool: &str, image_name: &str) -> bool {
        self.pool == pool && self.namespace.is_none() && self.image == image_name
    }
}

/// Parse `rbd showmapped` output.
///
/// Handles both the `id pool image snap device` table and the newer
/// `id pool namespace image snap device` one, whose namespace cell is often
/// blank. The pool is the second field; the device is the last field and the
/// image the third from last. Rows that do not start with a numeric id or do
/// not end in a device under [`RBD_DEVICE_PREFIX`] are skipped.
pub fn parse_showmapped(output: &str) -> Vec<Mapping> {
    let mut mappings = Vec::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();

        let well_formed = fields.len() >= MIN_ROW_FIELDS
            && fields[0].parse::<u32>().is_ok()
            && fields[fields.len() - 1].starts_with(RBD_DEVICE_PREFIX);
        if !well_formed {
            trace!(line, "Skipping showmapped line");
            continue;
        }

        let namespace = (fields.len() > MIN_ROW_FIELDS).then(|| fields[2].to_string());
        mappings.push(Mapping {
            pool: fields[1].to_string(),
            namespace,
            image: fields[fields.len() - 3].to_string(),
            device: fields[fields.len() - 1].to_string(),
        });
    }

    mappings
}

/// Queries the host for current mappings and mounts.
#[derive(Clone)]
pub struct DeviceDiscovery {
    runner: Arc<dyn CommandRunner>,
}

impl DeviceDiscovery {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Every image mapped on this host.
    pub fn list_mapped_devices(&self) -> Result<Vec<Mapping>, DiscoveryError> {
        let output = self.runner.run("rbd", &["showmapped"])?;
        Ok(parse_showmapped(&output))
    }

    /// Device path of `image` if it is mapped from its own pool.
    pub fn is_already_mapped(&self, image: &Image) -> Option<String> {
        self.mapped_path(image.pool(), image.name())
    }

    /// Device path of `image_name` in `pool` if it is mapped.
    ///
    /// Images of the same name in other pools or namespaces do not count.
    /// A failed query reads as "not mapped".
    pub fn mapped_path(&self, pool: &str, image_name: &str) -> Option<String> {
        match self.list_mapped_devices() {
            Ok(mappings) => mappings
                .into_iter()
                .find(|m| m.is(pool, image_name))
                .map(|m| m.device),
            Err(e) => {
                warn!(image = %image_name, error = %e, "Could not list mapped devices");
                None
            }
        }
    }

    /// Where `path` is currently mounted, if anywhere.
    pub fn mount_point_of(&self, path: &str) -> Option<String> {
        match self
            .runner
            .run("findmnt", &["-n", "-o", "TARGET", "--source", path])
        {
            Ok(output) => output
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string),
            Err(e) => {
                debug!(device = %path, error = %e, "Device not mounted");
                None
            }
        }
    }

    /// Assemble a device record for a mapped image, including its mount.
    pub fn locate(&self, pool: &str, image_name: &str, fs_type: &str) -> Option<Device> {
        let path = self.mapped_path(pool, image_name)?;
        let device = match self.mount_point_of(&path) {
            Some(mount_point) => Device::mounted_at(path, fs_type, mount_point),
            None => Device::new(path, fs_type),
        };
        Some(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ScriptedRunner;
    use proptest::prelude::*;

    const LEGACY: &str = "\
id pool image  snap device
0  rbd  foobar -    /dev/rbd0
";

    const NAMESPACED: &str = "\
id  pool  namespace  image   snap  device
0   lxd              foobar  -     /dev/rbd0
1   lxd   tenant-a   other   -     /dev/rbd1
";

    fn device_of<'a>(mappings: &'a [Mapping], pool: &str, image: &str) -> Option<&'a str> {
        mappings
            .iter()
            .find(|m| m.is(pool, image))
            .map(|m| m.device.as_str())
    }

    #[test]
    fn test_parse_legacy_table() {
        let mappings = parse_showmapped(LEGACY);
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].pool, "rbd");
        assert_eq!(mappings[0].namespace, None);
        assert_eq!(device_of(&mappings, "rbd", "foobar"), Some("/dev/rbd0"));
    }

    #[test]
    fn test_parse_namespaced_table() {
        let mappings = parse_showmapped(NAMESPACED);
        assert_eq!(device_of(&mappings, "lxd", "foobar"), Some("/dev/rbd0"));
        assert_eq!(mappings[1].namespace.as_deref(), Some("tenant-a"));
        assert_eq!(mappings[1].image, "other");
        assert_eq!(device_of(&mappings, "lxd", "other"), None);
    }

    #[test]
    fn test_parse_skips_garbage() {
        let output = "\
rbd: warning: can't get image map information
0  rbd  foobar -    /dev/rbd0
x  rbd  broken -    /dev/rbd9
3  rbd  nodev  -    /dev/sda1
4  rbd
";
        let mappings = parse_showmapped(output);
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].image, "foobar");
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_showmapped("").is_empty());
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(output in "\\PC*") {
            let _ = parse_showmapped(&output);
        }

        #[test]
        fn prop_every_result_is_an_rbd_device(lines in prop::collection::vec("[0-9a-z/ ]{0,40}", 0..8)) {
            let mappings = parse_showmapped(&lines.join("\n"));
            prop_assert!(mappings.iter().all(|m| m.device.starts_with(RBD_DEVICE_PREFIX)));
        }
    }

    #[test]
    fn test_mapped_path_lookup() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("rbd", &["showmapped"], NAMESPACED);
        let discovery = DeviceDiscovery::new(runner.clone());

        assert_eq!(discovery.mapped_path("lxd", "foobar").as_deref(), Some("/dev/rbd0"));
        assert_eq!(discovery.mapped_path("lxd", "missing"), None);
    }

    #[test]
    fn test_same_name_in_another_pool_is_not_mapped() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("rbd", &["showmapped"], LEGACY);
        let discovery = DeviceDiscovery::new(runner);

        assert_eq!(discovery.mapped_path("lxd", "foobar"), None);
        assert_eq!(discovery.mapped_path("rbd", "foobar").as_deref(), Some("/dev/rbd0"));
    }

    #[test]
    fn test_mapped_path_query_failure_is_absent() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("rbd", &["showmapped"], 1, "rbd: failed to open sysfs");
        let discovery = DeviceDiscovery::new(runner);

        assert_eq!(discovery.mapped_path("rbd", "foobar"), None);
    }

    #[test]
    fn test_locate_mounted_device() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .respond("rbd", &["showmapped"], LEGACY)
            .respond("findmnt", &[], "/mnt/foo");
        let discovery = DeviceDiscovery::new(runner.clone());

        let device = discovery.locate("rbd", "foobar", "ext4").unwrap();
        assert_eq!(device, Device::mounted_at("/dev/rbd0", "ext4", "/mnt/foo"));
        assert!(runner
            .lines()
            .contains(&"findmnt -n -o TARGET --source /dev/rbd0".to_string()));
    }

    #[test]
    fn test_locate_unmounted_device() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .respond("rbd", &["showmapped"], LEGACY)
            .fail("findmnt", &[], 1, "");
        let discovery = DeviceDiscovery::new(runner);

        let device = discovery.locate("rbd", "foobar", "ext4").unwrap();
        assert!(!device.is_mounted());
        assert_eq!(device.path(), "/dev/rbd0");
    }
}
