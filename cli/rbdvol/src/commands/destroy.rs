//! Destroy command.

use anyhow::Result;
use clap::Args;
use serde_json::json;

use crate::error::CliError;
use crate::output::{print_single, print_success, OutputFormat};

use super::CommandContext;

/// Remove an image from the pool. Mapped images are refused.
#[derive(Debug, Args)]
pub struct DestroyCommand {
    /// Image name.
    image: String,
}

impl DestroyCommand {
    pub fn run(self, ctx: &CommandContext) -> Result<()> {
        if let Some(device) = ctx.discovery().mapped_path(ctx.connect.pool_name(), &self.image) {
            return Err(CliError::StillMapped {
                image: self.image,
                device,
            }
            .into());
        }

        let mut provisioner = ctx.provisioner();
        let result = provisioner.destroy_image(&self.image);
        provisioner.shutdown();
        result?;

        match ctx.format {
            OutputFormat::Json => print_single(&json!({ "destroyed_image": self.image })),
            OutputFormat::Table => print_success(&format!("Image {} destroyed", self.image)),
        }
        Ok(())
    }
}
