//! Teardown command.

use anyhow::{anyhow, bail, Result};
use clap::Args;
use rbdvol_blockdev::{Device, TeardownOptions, TeardownPolicy};
use serde_json::json;

use crate::error::CliError;
use crate::output::{print_single, print_success, OutputFormat};

use super::CommandContext;

/// Unmount and unmap a device.
#[derive(Debug, Args)]
#[command(group = clap::ArgGroup::new("target").required(true).args(["image", "device"]))]
pub struct TeardownCommand {
    /// Image whose device to tear down.
    #[arg(long)]
    image: Option<String>,

    /// Device path to tear down (e.g. /dev/rbd0).
    #[arg(long)]
    device: Option<String>,

    /// Filesystem type recorded for the device.
    #[arg(long)]
    fs_type: Option<String>,

    /// Remove the image from the pool after unmapping.
    #[arg(long, requires = "image", conflicts_with = "device")]
    destroy: bool,

    /// Keep going after a failed step and report every failure.
    #[arg(long)]
    best_effort: bool,
}

impl TeardownCommand {
    fn validate(&self) -> Result<()> {
        if self.destroy && self.image.is_none() {
            bail!("--destroy needs --image to name the image to remove");
        }
        Ok(())
    }

    pub fn run(self, ctx: &CommandContext) -> Result<()> {
        self.validate()?;

        let mut provisioner = ctx.provisioner();
        let fs_type = self
            .fs_type
            .unwrap_or_else(|| ctx.settings.default_fs_type.clone());

        let mut device = match (&self.image, &self.device) {
            (Some(image), _) => provisioner
                .locate(image, Some(fs_type.as_str()))
                .ok_or_else(|| CliError::NotMapped {
                    image: image.clone(),
                })?,
            (None, path) => {
                let path = path
                    .as_deref()
                    .ok_or_else(|| anyhow!("either --image or --device is required"))?;
                match provisioner.discovery().mount_point_of(path) {
                    Some(mount_point) => Device::mounted_at(path, fs_type, mount_point),
                    None => Device::new(path, fs_type),
                }
            }
        };

        let options = TeardownOptions {
            policy: if self.best_effort {
                TeardownPolicy::BestEffort
            } else {
                TeardownPolicy::AbortOnFirst
            },
            destroy_image: if self.destroy { self.image.clone() } else { None },
            release_connection: true,
        };

        let result = provisioner.teardown(&mut device, &options);
        provisioner.shutdown();
        result?;

        match ctx.format {
            OutputFormat::Json => print_single(&json!({
                "device": device,
                "destroyed_image": options.destroy_image,
            })),
            OutputFormat::Table => {
                print_success(&format!("Device {} unmapped", device.path()));
                if let Some(image) = &options.destroy_image {
                    print_success(&format!("Image {} destroyed", image));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(image: Option<&str>, device: Option<&str>, destroy: bool) -> TeardownCommand {
        TeardownCommand {
            image: image.map(str::to_string),
            device: device.map(str::to_string),
            fs_type: None,
            destroy,
            best_effort: false,
        }
    }

    #[test]
    fn test_destroy_without_image_is_refused() {
        assert!(command(None, Some("/dev/rbd0"), true).validate().is_err());
        assert!(command(Some("foobar"), None, true).validate().is_ok());
        assert!(command(None, Some("/dev/rbd0"), false).validate().is_ok());
    }
}
