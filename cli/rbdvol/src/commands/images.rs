//! Images command.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{cell, print_output};

use super::CommandContext;

/// List images in the pool.
#[derive(Debug, Args)]
pub struct ImagesCommand {}

#[derive(Debug, Serialize, Tabled)]
struct ImageRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "DEVICE")]
    device: String,
}

impl ImagesCommand {
    pub fn run(self, ctx: &CommandContext) -> Result<()> {
        let mut provisioner = ctx.provisioner();
        let result = provisioner.list_images();
        provisioner.shutdown();
        let names = result?;

        // A failed showmapped leaves the device column empty
        let mapped = provisioner.discovery().list_mapped_devices().unwrap_or_default();

        let rows: Vec<ImageRow> = names
            .into_iter()
            .map(|name| {
                let device = cell(
                    mapped
                        .iter()
                        .find(|m| m.is(provisioner.pool(), &name))
                        .map(|m| m.device.as_str()),
                );
                ImageRow { name, device }
            })
            .collect();

        print_output(&rows, ctx.format);
        Ok(())
    }
}
