//! CLI commands.

mod destroy;
mod images;
mod info;
mod mapped;
mod provision;
mod teardown;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rbdvol_blockdev::{
    CommandRunner, ConnectOptions, DeviceDiscovery, Provisioner, RbdCliStore, Settings,
    SystemRunner,
};
use tracing::debug;

use crate::config::{self, FileConfig, Overrides};
use crate::logging::{self, LogFormat};
use crate::output::OutputFormat;

/// rbdvol - Provision RBD-backed block devices on this host.
#[derive(Debug, Parser)]
#[command(name = "rbdvol")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Log format (written to stderr).
    #[arg(long, global = true, value_enum, env = "RBDVOL_LOG_FORMAT", default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// TOML config file.
    #[arg(long, global = true, env = "RBDVOL_CONFIG")]
    config: Option<PathBuf>,

    /// Principal to authenticate as.
    #[arg(long, global = true, env = "RBDVOL_USER")]
    user: Option<String>,

    /// Pool holding the images (default: rbd).
    #[arg(long, global = true, env = "RBDVOL_POOL")]
    pool: Option<String>,

    /// Cluster name.
    #[arg(long, global = true, env = "RBDVOL_CLUSTER")]
    cluster: Option<String>,

    /// Cluster configuration file (default: /etc/ceph/<cluster>.conf).
    #[arg(long, global = true, env = "RBDVOL_CEPH_CONF")]
    ceph_conf: Option<PathBuf>,

    /// Fail when an existing image's size differs from the request.
    #[arg(long, global = true, env = "RBDVOL_STRICT_SIZE_CHECK")]
    strict_size_check: bool,

    /// Fail instead of reformatting a device holding another filesystem.
    #[arg(long, global = true, env = "RBDVOL_STRICT_FS_CHECK")]
    strict_fs_check: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or reuse an image, then map, format and mount it.
    Provision(provision::ProvisionCommand),

    /// Unmount and unmap a device, optionally destroying its image.
    Teardown(teardown::TeardownCommand),

    /// List images mapped on this host.
    Mapped(mapped::MappedCommand),

    /// List images in the pool.
    Images(images::ImagesCommand),

    /// Show an image.
    Info(info::InfoCommand),

    /// Remove an unmapped image from the pool.
    Destroy(destroy::DestroyCommand),
}

impl Cli {
    /// Run the CLI command.
    pub fn run(self) -> Result<()> {
        logging::init(self.log_format);

        let file = FileConfig::load(self.config.as_deref())?;
        let overrides = Overrides {
            user: self.user,
            pool: self.pool,
            cluster: self.cluster,
            ceph_conf: self.ceph_conf,
            strict_size_check: self.strict_size_check,
            strict_fs_check: self.strict_fs_check,
        };
        let resolved = config::resolve(overrides, file);
        debug!(
            pool = %resolved.connect.pool_name(),
            strict_size_check = resolved.settings.strict_size_check,
            strict_fs_check = resolved.settings.strict_fs_check,
            "Configuration resolved"
        );

        let ctx = CommandContext::new(resolved.connect, resolved.settings, self.format);

        match self.command {
            Commands::Provision(cmd) => cmd.run(&ctx),
            Commands::Teardown(cmd) => cmd.run(&ctx),
            Commands::Mapped(cmd) => cmd.run(&ctx),
            Commands::Images(cmd) => cmd.run(&ctx),
            Commands::Info(cmd) => cmd.run(&ctx),
            Commands::Destroy(cmd) => cmd.run(&ctx),
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub connect: ConnectOptions,
    pub settings: Settings,
    pub format: OutputFormat,
    runner: Arc<dyn CommandRunner>,
}

impl CommandContext {
    fn new(connect: ConnectOptions, settings: Settings, format: OutputFormat) -> Self {
        Self {
            connect,
            settings,
            format,
            runner: Arc::new(SystemRunner::new()),
        }
    }

    /// Provisioner over the host's rbd tooling. Callers shut it down.
    pub fn provisioner(&self) -> Provisioner {
        let store = Arc::new(RbdCliStore::new(Arc::clone(&self.runner)));
        Provisioner::new(
            store,
            Arc::clone(&self.runner),
            self.connect.clone(),
            self.settings.clone(),
        )
    }

    /// Host discovery without a cluster connection.
    pub fn discovery(&self) -> DeviceDiscovery {
        DeviceDiscovery::new(Arc::clone(&self.runner))
    }
}
