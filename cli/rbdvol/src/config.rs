//! Configuration loading.
//!
//! Precedence, highest first:
//! - command-line flags
//! - `RBDVOL_*` environment variables (folded into the flags by clap)
//! - the TOML file (`--config`, `RBDVOL_CONFIG`, or [`DEFAULT_CONFIG_PATH`])
//! - built-in defaults

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rbdvol_blockdev::{ConfigSource, ConnectOptions, Settings};
use serde::{Deserialize, Serialize};

/// Config file read when none is named and it exists.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rbdvol/config.toml";

/// Contents of the TOML config file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Principal to authenticate as.
    pub user: Option<String>,

    /// Pool holding the images.
    pub pool: Option<String>,

    /// Cluster name.
    pub cluster: Option<String>,

    /// Cluster configuration file.
    pub ceph_conf: Option<PathBuf>,

    pub strict_size_check: Option<bool>,

    pub strict_fs_check: Option<bool>,

    /// Filesystem used when a request names none.
    pub default_fs_type: Option<String>,
}

impl FileConfig {
    /// Load the named file, or the default file when present.
    ///
    /// A named file must exist; a missing default file yields an empty config.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::read(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.is_file() {
                    Self::read(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;

        toml::from_str(&contents).with_context(|| format!("Failed to parse config from {:?}", path))
    }
}

/// Values taken from flags and the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub user: Option<String>,
    pub pool: Option<String>,
    pub cluster: Option<String>,
    pub ceph_conf: Option<PathBuf>,
    /// Flags can only switch a check on.
    pub strict_size_check: bool,
    pub strict_fs_check: bool,
}

/// Connection parameters and policy after merging every source.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub connect: ConnectOptions,
    pub settings: Settings,
}

/// Merge overrides over the file config over defaults.
pub fn resolve(overrides: Overrides, file: FileConfig) -> Resolved {
    let defaults = Settings::default();

    let ceph_conf = non_empty_path(overrides.ceph_conf).or(non_empty_path(file.ceph_conf));

    let connect = ConnectOptions {
        user: non_empty(overrides.user).or(non_empty(file.user)),
        pool: non_empty(overrides.pool).or(non_empty(file.pool)),
        cluster: non_empty(overrides.cluster).or(non_empty(file.cluster)),
        config: ConfigSource::from_option(ceph_conf.as_deref()),
    };

    let settings = Settings {
        strict_size_check: overrides.strict_size_check
            || file.strict_size_check.unwrap_or(defaults.strict_size_check),
        strict_fs_check: overrides.strict_fs_check
            || file.strict_fs_check.unwrap_or(defaults.strict_fs_check),
        default_fs_type: non_empty(file.default_fs_type).unwrap_or(defaults.default_fs_type),
    };

    Resolved { connect, settings }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn non_empty_path(value: Option<PathBuf>) -> Option<PathBuf> {
    value.filter(|v| !v.as_os_str().is_empty())
}
