//! Info command.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use crate::output::{cell, print_single, OutputFormat};

use super::CommandContext;

/// Show an image and where it is mapped.
#[derive(Debug, Args)]
pub struct InfoCommand {
    /// Image name.
    image: String,
}

#[derive(Debug, Serialize)]
struct ImageDetails {
    name: String,
    pool: String,
    size_bytes: u64,
    objects: u64,
    object_size: u64,
    format: u8,
    device: Option<String>,
    mount_point: Option<String>,
}

impl ImageDetails {
    fn lines(&self) -> Vec<String> {
        vec![
            format!("name: {}", self.name),
            format!("pool: {}", self.pool),
            format!("size_bytes: {}", self.size_bytes),
            format!("objects: {}", self.objects),
            format!("object_size: {}", self.object_size),
            format!("format: {}", self.format),
            format!("device: {}", cell(self.device.as_deref())),
            format!("mount_point: {}", cell(self.mount_point.as_deref())),
        ]
    }
}

impl InfoCommand {
    pub fn run(self, ctx: &CommandContext) -> Result<()> {
        let mut provisioner = ctx.provisioner();
        let result = provisioner.image(&self.image);
        provisioner.shutdown();
        let image = result?;

        let device = provisioner.locate(&self.image, None);
        let info = image.info();

        let details = ImageDetails {
            name: info.name.clone(),
            pool: image.pool().to_string(),
            size_bytes: info.size,
            objects: info.objects,
            object_size: info.object_size,
            format: info.format,
            device: device.as_ref().map(|d| d.path().to_string()),
            mount_point: device.as_ref().and_then(|d| d.mount_point()).map(str::to_string),
        };

        match ctx.format {
            OutputFormat::Json => print_single(&details),
            OutputFormat::Table => {
                for line in details.lines() {
                    println!("{line}");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmapped_image_lines() {
        let details = ImageDetails {
            name: "foobar".to_string(),
            pool: "lxd".to_string(),
            size_bytes: 20 * 1024 * 1024,
            objects: 5,
            object_size: 4 * 1024 * 1024,
            format: 2,
            device: None,
            mount_point: None,
        };

        let lines = details.lines();
        assert_eq!(lines[0], "name: foobar");
        assert_eq!(lines[2], "size_bytes: 20971520");
        assert_eq!(lines[6], "device: -");
        assert_eq!(lines[7], "mount_point: -");
    }
}
