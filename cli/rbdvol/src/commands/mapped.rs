//! Mapped command.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{cell, print_output};

use super::CommandContext;

/// List images mapped on this host.
#[derive(Debug, Args)]
pub struct MappedCommand {}

#[derive(Debug, Serialize, Tabled)]
struct MappedRow {
    #[tabled(rename = "POOL")]
    pool: String,
    #[tabled(rename = "IMAGE")]
    image: String,
    #[tabled(rename = "DEVICE")]
    device: String,
    #[tabled(rename = "MOUNT POINT")]
    mount_point: String,
}

impl MappedCommand {
    pub fn run(self, ctx: &CommandContext) -> Result<()> {
        let discovery = ctx.discovery();
        let rows: Vec<MappedRow> = discovery
            .list_mapped_devices()?
            .into_iter()
            .map(|mapping| {
                let mount_point = discovery.mount_point_of(&mapping.device);
                MappedRow {
                    pool: mapping.pool,
                    image: mapping.image,
                    device: mapping.device,
                    mount_point: cell(mount_point.as_deref()),
                }
            })
            .collect();

        print_output(&rows, ctx.format);
        Ok(())
    }
}
