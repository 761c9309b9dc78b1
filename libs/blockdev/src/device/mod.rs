//! Local block devices backed by mapped images.
//!
//! [`DeviceMapper`] attaches and detaches images as `/dev/rbd*` devices;
//! [`FilesystemManager`] inspects, formats, mounts and unmounts them. A
//! [`Device`] is a plain value record: it holds no reference to the image it
//! was mapped from.

mod filesystem;
mod mapper;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exec::CommandError;

pub use filesystem::FilesystemManager;
pub use mapper::DeviceMapper;

/// Filesystem type used when none is requested.
pub const DEFAULT_FS_TYPE: &str = "xfs";

/// One local mapping of an image.
///
/// `mounted` implies `mount_point` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    path: String,
    mounted: bool,
    fs_type: String,
    mount_point: Option<String>,
}

impl Device {
    /// An unmounted device at `path`.
    pub fn new(path: impl Into<String>, fs_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mounted: false,
            fs_type: fs_type.into(),
            mount_point: None,
        }
    }

    /// A device already mounted at `mount_point`.
    pub fn mounted_at(
        path: impl Into<String>,
        fs_type: impl Into<String>,
        mount_point: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            mounted: true,
            fs_type: fs_type.into(),
            mount_point: Some(mount_point.into()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Declared filesystem type.
    pub fn fs_type(&self) -> &str {
        &self.fs_type
    }

    pub fn mount_point(&self) -> Option<&str> {
        self.mount_point.as_deref()
    }

    /// Forget the recorded mount after a successful unmount.
    pub fn clear_mount(&mut self) {
        self.mounted = false;
        self.mount_point = None;
    }

    fn record_mount(&mut self, mount_point: &str) {
        self.mounted = true;
        self.mount_point = Some(mount_point.to_string());
    }
}

/// Errors mapping an image to a local device.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("cannot map image {image} from pool {pool}: {source}")]
    Map {
        image: String,
        pool: String,
        #[source]
        source: CommandError,
    },

    #[error("mapping image {image} returned no device path")]
    EmptyPath { image: String },
}

impl MappingError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            MappingError::Map { .. } => "map_failed",
            MappingError::EmptyPath { .. } => "map_no_device",
        }
    }
}

/// Errors detaching a device.
#[derive(Debug, Error)]
pub enum UnmapError {
    #[error("refusing to unmap {device}: {source}")]
    StillMounted {
        device: String,
        #[source]
        source: FilesystemError,
    },

    #[error("cannot unmap {device}: {source}")]
    Unmap {
        device: String,
        #[source]
        source: CommandError,
    },
}

impl UnmapError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            UnmapError::StillMounted { .. } => "unmount_failed",
            UnmapError::Unmap { .. } => "unmap_failed",
        }
    }
}

/// Errors formatting a device.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("cannot format device {device}: {utility} not found")]
    UtilityNotFound { device: String, utility: String },

    #[error("cannot format device {device} as {fs_type}: {source}")]
    Failed {
        device: String,
        fs_type: String,
        #[source]
        source: CommandError,
    },

    #[error("device {device} holds {found}, expected {expected}; refusing to reformat")]
    ForeignFilesystem {
        device: String,
        found: String,
        expected: String,
    },
}

/// Errors mounting or unmounting a device.
#[derive(Debug, Error)]
pub enum FilesystemError {
    #[error("device {device} is already mounted on {mount_point}")]
    AlreadyMounted { device: String, mount_point: String },

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("cannot mount {device} on {mount_point}: {source}")]
    Mount {
        device: String,
        mount_point: String,
        #[source]
        source: CommandError,
    },

    #[error("cannot unmount {device}: {source}")]
    Unmount {
        device: String,
        #[source]
        source: CommandError,
    },
}

impl FilesystemError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            FilesystemError::AlreadyMounted { .. } => "already_mounted",
            FilesystemError::Format(FormatError::UtilityNotFound { .. }) => "mkfs_not_found",
            FilesystemError::Format(FormatError::Failed { .. }) => "format_failed",
            FilesystemError::Format(FormatError::ForeignFilesystem { .. }) => "foreign_filesystem",
            FilesystemError::Mount { .. } => "mount_failed",
            FilesystemError::Unmount { .. } => "unmount_failed",
        }
    }
}
