//! [`RemoteStore`] over the `rados` and `rbd` command line utilities.
//!
//! Sessions carry no live state: every call re-passes `--cluster`, `--id` and
//! `--conf` so the utilities authenticate the same way the session did.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::{Credentials, ImageInfo, Namespace, RemoteStore, Session, StoreError};
use crate::exec::{CommandError, CommandRunner};

/// Exit status `rbd` uses for ENOENT.
const ENOENT_STATUS: i32 = 2;

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Cluster access through host utilities.
pub struct RbdCliStore {
    runner: Arc<dyn CommandRunner>,
    next_session: AtomicU64,
}

impl RbdCliStore {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            next_session: AtomicU64::new(1),
        }
    }

    fn run(
        &self,
        program: &str,
        credentials: &Credentials,
        config_path: &Path,
        args: &[&str],
    ) -> Result<String, CommandError> {
        let config = config_path.to_string_lossy();
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 6);
        if let Some(cluster) = credentials.cluster() {
            full.extend(["--cluster", cluster]);
        }
        if let Some(user) = credentials.user() {
            full.extend(["--id", user]);
        }
        full.extend(["--conf", &*config]);
        full.extend_from_slice(args);

        self.runner.run(program, &full)
    }

    fn rbd(&self, ns: &Namespace, args: &[&str]) -> Result<String, CommandError> {
        self.run(
            "rbd",
            &ns.session.credentials,
            &ns.session.config_path,
            args,
        )
    }

    fn info(&self, ns: &Namespace, name: &str) -> Result<Option<ImageInfo>, StoreError> {
        match self.rbd(ns, &["info", "--pool", &ns.pool, "--format", "json", name]) {
            Ok(output) => serde_json::from_str(&output)
                .map(Some)
                .map_err(|source| StoreError::Decode {
                    what: "rbd info",
                    source,
                }),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether `rbd` failed because the image does not exist.
fn is_not_found(err: &CommandError) -> bool {
    err.status() == Some(ENOENT_STATUS) || err.stderr().contains("No such file or directory")
}

/// `--size` argument for `rbd create`; whole MiB use the default unit.
fn size_arg(size_bytes: u64) -> String {
    if size_bytes % BYTES_PER_MIB == 0 {
        format!("{}M", size_bytes / BYTES_PER_MIB)
    } else {
        format!("{}B", size_bytes)
    }
}

impl RemoteStore for RbdCliStore {
    fn connect(
        &self,
        credentials: &Credentials,
        config_path: &Path,
    ) -> Result<Session, StoreError> {
        // lspools forces a full authentication round trip.
        self.run("rados", credentials, config_path, &["lspools"])?;

        Ok(Session {
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            credentials: credentials.clone(),
            config_path: config_path.to_path_buf(),
        })
    }

    fn open_namespace(&self, session: &Session, pool: &str) -> Result<Namespace, StoreError> {
        let ns = Namespace {
            session: session.clone(),
            pool: pool.to_string(),
        };
        self.rbd(&ns, &["ls", "--pool", pool])?;
        Ok(ns)
    }

    fn lookup_image(&self, ns: &Namespace, name: &str) -> Result<Option<ImageInfo>, StoreError> {
        self.info(ns, name)
    }

    fn create_image(&self, ns: &Namespace, name: &str, size_bytes: u64) -> Result<(), StoreError> {
        let size = size_arg(size_bytes);
        self.rbd(ns, &["create", "--pool", &ns.pool, "--size", &size, name])?;
        Ok(())
    }

    fn open_image(&self, ns: &Namespace, name: &str) -> Result<(), StoreError> {
        self.rbd(ns, &["status", "--pool", &ns.pool, name])?;
        Ok(())
    }

    fn stat_image(&self, ns: &Namespace, name: &str) -> Result<ImageInfo, StoreError> {
        self.info(ns, name)?
            .ok_or_else(|| StoreError::Rejected(format!("image {} vanished", name)))
    }

    fn list_images(&self, ns: &Namespace) -> Result<Vec<String>, StoreError> {
        let output = self.rbd(ns, &["ls", "--pool", &ns.pool, "--format", "json"])?;
        if output.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&output).map_err(|source| StoreError::Decode {
            what: "rbd ls",
            source,
        })
    }

    fn remove_image(&self, ns: &Namespace, name: &str) -> Result<(), StoreError> {
        self.rbd(ns, &["rm", "--pool", &ns.pool, name])?;
        Ok(())
    }

    fn close_namespace(&self, ns: &Namespace) {
        debug!(pool = %ns.pool, "Releasing pool context");
    }

    fn disconnect(&self, session: &Session) {
        debug!(session = session.id, "Releasing cluster session");
    }
}
