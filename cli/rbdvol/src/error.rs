//! Error handling and display for the CLI.

use colored::Colorize;
use rbdvol_blockdev::provision::StageError;
use rbdvol_blockdev::{ProvisionError, TeardownError};
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Image {image} is not mapped on this host")]
    NotMapped { image: String },

    #[error("Image {image} is still mapped at {device}")]
    StillMapped { image: String, device: String },
}

/// Reason code of the first library error in the chain.
fn reason_code(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(e) = err.downcast_ref::<ProvisionError>() {
        return Some(e.reason_code());
    }
    if let Some(e) = err.downcast_ref::<TeardownError>() {
        return e.failures.first().map(|f| f.source.reason_code());
    }
    err.downcast_ref::<StageError>().map(StageError::reason_code)
}

fn hint(reason: &str) -> Option<&'static str> {
    let hint = match reason {
        "config_unreadable" => {
            "Hint: Pass --ceph-conf or set CEPH_CONF to a readable cluster configuration."
        }
        "connect_failed" => "Hint: Check --user and that its keyring is readable.",
        "namespace_failed" => "Hint: Check that the pool exists and --user may access it.",
        "image_size_mismatch" => {
            "Hint: Request the existing size or drop --strict-size-check to reuse the image."
        }
        "foreign_filesystem" => {
            "Hint: Drop --strict-fs-check to reformat the device. This destroys its data."
        }
        "mkfs_not_found" => "Hint: Install the tools for the requested filesystem type.",
        "map_failed" | "unmap_failed" => {
            "Hint: Mapping needs root and the rbd kernel module loaded."
        }
        "mount_failed" => "Hint: The mount point must exist and be a directory.",
        "unmount_failed" => "Hint: The device is busy; stop processes using the mount point.",
        _ => return None,
    };
    Some(hint)
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    let mut shown = err.to_string();
    eprintln!("{} {}", "Error:".red().bold(), shown);

    // Causes already folded into the previous message are not repeated
    for cause in err.chain().skip(1) {
        let text = cause.to_string();
        if !shown.contains(&text) {
            eprintln!("  {} {}", "Caused by:".dimmed(), text);
            shown = text;
        }
    }

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::NotMapped { image } => {
                eprintln!(
                    "\n{}",
                    format!("Hint: Run `rbdvol provision {image}` first, or pass --device.")
                        .yellow()
                );
            }
            CliError::StillMapped { image, .. } => {
                eprintln!(
                    "\n{}",
                    format!("Hint: Run `rbdvol teardown --image {image} --destroy` instead.")
                        .yellow()
                );
            }
        }
        return;
    }

    if let Some(hint) = reason_code(err).and_then(hint) {
        eprintln!("\n{}", hint.yellow());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbdvol_blockdev::remote::ImageError;

    #[test]
    fn test_reason_code_from_stage_error() {
        let err = anyhow::Error::new(StageError::Image(ImageError::ConnectionClosed));
        assert_eq!(reason_code(&err), Some("connection_closed"));
    }

    #[test]
    fn test_reason_code_absent_for_other_errors() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(reason_code(&err), None);
    }

    #[test]
    fn test_known_reasons_have_hints() {
        for reason in ["config_unreadable", "foreign_filesystem", "image_size_mismatch"] {
            assert!(hint(reason).is_some(), "{reason}");
        }
        assert!(hint("connection_closed").is_none());
    }
}
