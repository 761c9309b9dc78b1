//! In-memory [`RemoteStore`] for tests and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::{Credentials, ImageInfo, Namespace, RemoteStore, Session, StoreError};

/// Store operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Connect,
    OpenNamespace,
    Lookup,
    Create,
    Open,
    Stat,
    List,
    Remove,
}

#[derive(Debug, Default)]
struct Cluster {
    pools: HashMap<String, BTreeMap<String, ImageInfo>>,
    next_session: u64,
    sessions: HashSet<u64>,
    open_namespaces: usize,
    namespace_releases: usize,
    creations: usize,
    faults: HashMap<Fault, String>,
}

impl Cluster {
    fn check(&self, fault: Fault) -> Result<(), StoreError> {
        match self.faults.get(&fault) {
            Some(message) => Err(StoreError::Rejected(message.clone())),
            None => Ok(()),
        }
    }

    fn pool(&self, ns: &Namespace) -> Result<&BTreeMap<String, ImageInfo>, StoreError> {
        self.pools
            .get(&ns.pool)
            .ok_or_else(|| StoreError::Rejected(format!("pool {} does not exist", ns.pool)))
    }

    fn pool_mut(&mut self, ns: &Namespace) -> Result<&mut BTreeMap<String, ImageInfo>, StoreError> {
        self.pools
            .get_mut(&ns.pool)
            .ok_or_else(|| StoreError::Rejected(format!("pool {} does not exist", ns.pool)))
    }
}

/// Cluster held in memory.
///
/// Clones share state, so a test can keep a clone to inspect counters after
/// handing the store to a [`Connection`](super::Connection).
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    cluster: Arc<Mutex<Cluster>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an empty pool.
    pub fn with_pool(self, pool: &str) -> Self {
        self.lock().pools.entry(pool.to_string()).or_default();
        self
    }

    /// Seed an existing image, creating the pool if needed.
    pub fn insert_image(&self, pool: &str, name: &str, size_bytes: u64) {
        self.lock()
            .pools
            .entry(pool.to_string())
            .or_default()
            .insert(name.to_string(), ImageInfo::new(name, size_bytes));
    }

    /// Make every later call of `fault` fail with `message`.
    pub fn fail(&self, fault: Fault, message: &str) {
        self.lock().faults.insert(fault, message.to_string());
    }

    /// Stop failing `fault`.
    pub fn clear_fault(&self, fault: Fault) {
        self.lock().faults.remove(&fault);
    }

    pub fn image(&self, pool: &str, name: &str) -> Option<ImageInfo> {
        self.lock().pools.get(pool)?.get(name).cloned()
    }

    /// Number of images created through the store.
    pub fn creations(&self) -> usize {
        self.lock().creations
    }

    /// Pool contexts currently open.
    pub fn open_namespaces(&self) -> usize {
        self.lock().open_namespaces
    }

    /// Pool contexts released so far.
    pub fn namespace_releases(&self) -> usize {
        self.lock().namespace_releases
    }

    /// Sessions currently connected.
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> MutexGuard<'_, Cluster> {
        self.cluster.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RemoteStore for MemoryStore {
    fn connect(
        &self,
        credentials: &Credentials,
        config_path: &Path,
    ) -> Result<Session, StoreError> {
        let mut cluster = self.lock();
        cluster.check(Fault::Connect)?;

        cluster.next_session += 1;
        let id = cluster.next_session;
        cluster.sessions.insert(id);

        Ok(Session {
            id,
            credentials: credentials.clone(),
            config_path: config_path.to_path_buf(),
        })
    }

    fn open_namespace(&self, session: &Session, pool: &str) -> Result<Namespace, StoreError> {
        let mut cluster = self.lock();
        cluster.check(Fault::OpenNamespace)?;

        if !cluster.sessions.contains(&session.id) {
            return Err(StoreError::Rejected(format!(
                "session {} is not connected",
                session.id
            )));
        }
        if !cluster.pools.contains_key(pool) {
            return Err(StoreError::Rejected(format!("pool {} does not exist", pool)));
        }

        cluster.open_namespaces += 1;
        Ok(Namespace {
            session: session.clone(),
            pool: pool.to_string(),
        })
    }

    fn lookup_image(&self, ns: &Namespace, name: &str) -> Result<Option<ImageInfo>, StoreError> {
        let cluster = self.lock();
        cluster.check(Fault::Lookup)?;
        Ok(cluster.pool(ns)?.get(name).cloned())
    }

    fn create_image(&self, ns: &Namespace, name: &str, size_bytes: u64) -> Result<(), StoreError> {
        let mut cluster = self.lock();
        cluster.check(Fault::Create)?;

        let pool = cluster.pool_mut(ns)?;
        if pool.contains_key(name) {
            return Err(StoreError::Rejected(format!("image {} already exists", name)));
        }
        pool.insert(name.to_string(), ImageInfo::new(name, size_bytes));
        cluster.creations += 1;

        debug!(pool = %ns.pool, image = %name, size_bytes, "[MEMORY] Image created");
        Ok(())
    }

    fn open_image(&self, ns: &Namespace, name: &str) -> Result<(), StoreError> {
        let cluster = self.lock();
        cluster.check(Fault::Open)?;
        match cluster.pool(ns)?.contains_key(name) {
            true => Ok(()),
            false => Err(StoreError::Rejected(format!("image {} does not exist", name))),
        }
    }

    fn stat_image(&self, ns: &Namespace, name: &str) -> Result<ImageInfo, StoreError> {
        let cluster = self.lock();
        cluster.check(Fault::Stat)?;
        cluster
            .pool(ns)?
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::Rejected(format!("image {} does not exist", name)))
    }

    fn list_images(&self, ns: &Namespace) -> Result<Vec<String>, StoreError> {
        let cluster = self.lock();
        cluster.check(Fault::List)?;
        Ok(cluster.pool(ns)?.keys().cloned().collect())
    }

    fn remove_image(&self, ns: &Namespace, name: &str) -> Result<(), StoreError> {
        let mut cluster = self.lock();
        cluster.check(Fault::Remove)?;
        match cluster.pool_mut(ns)?.remove(name) {
            Some(_) => Ok(()),
            None => Err(StoreError::Rejected(format!("image {} does not exist", name))),
        }
    }

    fn close_namespace(&self, _ns: &Namespace) {
        let mut cluster = self.lock();
        cluster.open_namespaces = cluster.open_namespaces.saturating_sub(1);
        cluster.namespace_releases += 1;
    }

    fn disconnect(&self, session: &Session) {
        self.lock().sessions.remove(&session.id);
    }
}
