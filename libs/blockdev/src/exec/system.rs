//! [`CommandRunner`] backed by real host processes.

use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use super::{render, CommandError, CommandRunner};

/// Runs utilities with `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        debug!(command = %render(program, args), "Running host command");

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(
                command = %render(program, args),
                status = ?output.status.code(),
                stderr = %stderr,
                "Host command failed"
            );
            return Err(CommandError::Failed {
                command: render(program, args),
                status: output.status.code(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}
