//! Host command execution.
//!
//! Every host utility the provisioner drives (`rbd`, `rados`, `blkid`,
//! `mkfs.<type>`, `mount`, `umount`, `findmnt`) goes through
//! [`CommandRunner`]. Production code uses [`SystemRunner`]; tests inject a
//! [`ScriptedRunner`] and assert the exact argument vectors it received.

mod scripted;
mod system;

use std::path::PathBuf;

use thiserror::Error;

pub use scripted::{Invocation, ScriptedRunner};
pub use system::SystemRunner;

/// Errors from running a host utility.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {}: {stderr}", describe_status(.status))]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

impl CommandError {
    /// Exit status of a command that ran and failed.
    pub fn status(&self) -> Option<i32> {
        match self {
            CommandError::Failed { status, .. } => *status,
            CommandError::Spawn { .. } => None,
        }
    }

    /// Captured stderr of a command that ran and failed.
    pub fn stderr(&self) -> &str {
        match self {
            CommandError::Failed { stderr, .. } => stderr,
            CommandError::Spawn { .. } => "",
        }
    }
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "no status (terminated by signal)".to_string(),
    }
}

/// Capability to run host utilities.
///
/// `run` blocks until the utility exits and returns its trimmed stdout. A
/// non-zero exit is an error carrying stderr.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`.
    fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError>;

    /// Resolve `program` to an executable path, if installed.
    fn locate(&self, program: &str) -> Option<PathBuf>;
}

/// Render a command line for logs and error messages.
pub fn render(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        assert_eq!(render("rbd", &["unmap", "/dev/rbd0"]), "rbd unmap /dev/rbd0");
        assert_eq!(render("sync", &[]), "sync");
    }

    #[test]
    fn test_failed_display() {
        let err = CommandError::Failed {
            command: "rbd map foo".to_string(),
            status: Some(2),
            stderr: "rbd: error opening image".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("status 2"));
        assert!(msg.contains("error opening image"));
        assert_eq!(err.status(), Some(2));
    }
}
