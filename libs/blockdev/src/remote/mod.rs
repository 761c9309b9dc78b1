//! Remote image storage.
//!
//! The cluster is reached through the narrow [`RemoteStore`] capability:
//! authenticate, open a pool, then create/open/stat/list/remove images in it.
//! [`Connection`] drives the connect sequence and owns the open pool context;
//! [`Image`] is a fully opened and stat-ed handle to one image.
//!
//! Two backends ship with the crate:
//! - [`RbdCliStore`]: drives the `rados`/`rbd` utilities on the host
//! - [`MemoryStore`]: in-memory cluster for tests and dry runs

mod connection;
mod memory;
mod rbd;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exec::CommandError;

pub use connection::{
    mb_to_bytes, ConnectOptions, ConnectStep, Connection, ConnectionError, Image, ImageError,
};
pub use memory::{Fault, MemoryStore};
pub use rbd::RbdCliStore;

/// Pool used when none is configured.
pub const DEFAULT_POOL: &str = "rbd";

/// Cluster name used when none is configured.
pub const DEFAULT_CLUSTER: &str = "ceph";

/// Directory holding cluster configuration files.
pub const CEPH_CONFIG_DIR: &str = "/etc/ceph";

/// Credential combination used to authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Named cluster and named principal.
    ClusterAndUser { cluster: String, user: String },
    /// Named principal against the default cluster.
    User { user: String },
    /// Host defaults.
    Default,
}

impl Credentials {
    /// Pick the most specific combination supplied. Empty strings count as absent.
    pub fn select(cluster: Option<&str>, user: Option<&str>) -> Self {
        let cluster = cluster.filter(|c| !c.is_empty());
        let user = user.filter(|u| !u.is_empty());

        match (cluster, user) {
            (Some(cluster), Some(user)) => Credentials::ClusterAndUser {
                cluster: cluster.to_string(),
                user: user.to_string(),
            },
            (None, Some(user)) => Credentials::User {
                user: user.to_string(),
            },
            _ => Credentials::Default,
        }
    }

    pub fn user(&self) -> Option<&str> {
        match self {
            Credentials::ClusterAndUser { user, .. } | Credentials::User { user } => Some(user),
            Credentials::Default => None,
        }
    }

    pub fn cluster(&self) -> Option<&str> {
        match self {
            Credentials::ClusterAndUser { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Principal name for logs (`client.<user>` or `default`).
    pub fn principal(&self) -> String {
        match self.user() {
            Some(user) => format!("client.{}", user),
            None => "default".to_string(),
        }
    }
}

/// Where cluster configuration is read from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// An explicit file, which must exist.
    Explicit(PathBuf),
    /// The first existing file in the default search path.
    #[default]
    Default,
}

impl ConfigSource {
    /// From an optional path; `None` or empty selects the default search path.
    pub fn from_option(path: Option<&Path>) -> Self {
        match path {
            Some(p) if !p.as_os_str().is_empty() => ConfigSource::Explicit(p.to_path_buf()),
            _ => ConfigSource::Default,
        }
    }

    /// Resolve to an existing configuration file.
    pub fn resolve(&self, cluster: Option<&str>) -> Result<PathBuf, String> {
        match self {
            ConfigSource::Explicit(path) => {
                if path.is_file() {
                    Ok(path.clone())
                } else {
                    Err(format!("{} does not exist", path.display()))
                }
            }
            ConfigSource::Default => {
                let candidates = default_config_candidates(cluster);
                candidates
                    .iter()
                    .find(|p| p.is_file())
                    .cloned()
                    .ok_or_else(|| {
                        let searched: Vec<String> =
                            candidates.iter().map(|p| p.display().to_string()).collect();
                        format!("no configuration found (searched {})", searched.join(", "))
                    })
            }
        }
    }
}

/// Default configuration search path, most specific first.
pub fn default_config_candidates(cluster: Option<&str>) -> Vec<PathBuf> {
    let cluster = cluster.filter(|c| !c.is_empty()).unwrap_or(DEFAULT_CLUSTER);
    let mut candidates = Vec::new();

    if let Some(path) = std::env::var_os("CEPH_CONF").filter(|p| !p.is_empty()) {
        candidates.push(PathBuf::from(path));
    }
    candidates.push(Path::new(CEPH_CONFIG_DIR).join(format!("{}.conf", cluster)));
    if let Some(home) = std::env::var_os("HOME") {
        candidates.push(Path::new(&home).join(".ceph").join("config"));
    }
    candidates.push(PathBuf::from(format!("{}.conf", cluster)));
    candidates
}

/// An authenticated session against one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: u64,
    pub credentials: Credentials,
    pub config_path: PathBuf,
}

/// An open pool context inside a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub session: Session,
    pub pool: String,
}

/// Descriptor snapshot of an image, as reported by `rbd info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    #[serde(default)]
    pub objects: u64,
    #[serde(default)]
    pub order: u8,
    #[serde(default)]
    pub object_size: u64,
    #[serde(default)]
    pub block_name_prefix: String,
    #[serde(default)]
    pub format: u8,
}

impl ImageInfo {
    /// Descriptor for a freshly created image using 4 MiB objects.
    pub fn new(name: &str, size: u64) -> Self {
        const ORDER: u8 = 22;
        let object_size = 1u64 << ORDER;
        Self {
            name: name.to_string(),
            size,
            objects: size.div_ceil(object_size),
            order: ORDER,
            object_size,
            block_name_prefix: String::new(),
            format: 2,
        }
    }
}

/// Errors reported by a [`RemoteStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("unexpected {what} output: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Rejected(String),
}

/// Capability interface to the storage cluster.
///
/// Calls block until the cluster answers. Implementations must tolerate
/// `close_namespace`/`disconnect` being called exactly once per handle.
pub trait RemoteStore: Send + Sync {
    /// Authenticate with `credentials` using the configuration at `config_path`.
    fn connect(&self, credentials: &Credentials, config_path: &Path)
        -> Result<Session, StoreError>;

    /// Open the pool context `pool`.
    fn open_namespace(&self, session: &Session, pool: &str) -> Result<Namespace, StoreError>;

    /// Look up an image by exact name. `Ok(None)` means it does not exist.
    fn lookup_image(&self, ns: &Namespace, name: &str) -> Result<Option<ImageInfo>, StoreError>;

    /// Allocate a new image of `size_bytes`.
    fn create_image(&self, ns: &Namespace, name: &str, size_bytes: u64) -> Result<(), StoreError>;

    /// Open an image for use.
    fn open_image(&self, ns: &Namespace, name: &str) -> Result<(), StoreError>;

    /// Retrieve the descriptor of an open image.
    fn stat_image(&self, ns: &Namespace, name: &str) -> Result<ImageInfo, StoreError>;

    /// Names of all images in the pool.
    fn list_images(&self, ns: &Namespace) -> Result<Vec<String>, StoreError>;

    /// Destroy an image and its data.
    fn remove_image(&self, ns: &Namespace, name: &str) -> Result<(), StoreError>;

    /// Release a pool context.
    fn close_namespace(&self, ns: &Namespace);

    /// Release a session.
    fn disconnect(&self, session: &Session);
}
