//! Provision command.

use anyhow::Result;
use clap::Args;
use rbdvol_blockdev::{Branch, ProvisionRequest};

use crate::output::{print_info, print_single, print_success, OutputFormat};

use super::CommandContext;

/// Create or reuse an image and bring it to the mounted state.
#[derive(Debug, Args)]
pub struct ProvisionCommand {
    /// Image name.
    image: String,

    /// Size in megabytes, used when the image has to be created.
    #[arg(long, value_name = "MB")]
    size: u64,

    /// Where to mount the device (must exist).
    #[arg(long)]
    mount_point: String,

    /// Filesystem type (default from config, else xfs).
    #[arg(long)]
    fs_type: Option<String>,
}

impl ProvisionCommand {
    pub fn run(self, ctx: &CommandContext) -> Result<()> {
        let request = ProvisionRequest {
            image: self.image,
            size_mb: self.size,
            fs_type: self.fs_type,
            mount_point: self.mount_point,
        };

        let mut provisioner = ctx.provisioner();
        let result = provisioner.provision(&request);
        provisioner.shutdown();
        let provisioned = result?;

        match ctx.format {
            OutputFormat::Json => print_single(&provisioned),
            OutputFormat::Table => {
                let device = &provisioned.device;
                match provisioned.branch {
                    Branch::AlreadyMapped => {
                        print_info(&format!(
                            "Image {} is already mapped at {}",
                            request.image,
                            device.path()
                        ));
                        match device.mount_point() {
                            Some(mp) => print_info(&format!("Mounted on {}", mp)),
                            None => print_info("Not mounted; nothing was changed"),
                        }
                    }
                    Branch::Fresh => {
                        if provisioned.image_created {
                            print_info(&format!(
                                "Created image {} ({} bytes) in pool {}",
                                request.image, provisioned.image.size, provisioned.pool
                            ));
                        }
                        if provisioned.formatted {
                            print_info(&format!(
                                "Formatted {} as {}",
                                device.path(),
                                device.fs_type()
                            ));
                        }
                        print_success(&format!(
                            "Image {} mapped at {} and mounted on {}",
                            request.image,
                            device.path(),
                            device.mount_point().unwrap_or(&request.mount_point)
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}
