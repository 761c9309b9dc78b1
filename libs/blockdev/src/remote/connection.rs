//! Cluster connection and image handles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{ConfigSource, Credentials, ImageInfo, Namespace, RemoteStore, StoreError, DEFAULT_POOL};

/// Bytes per megabyte as used for image sizes.
const BYTES_PER_MB: u64 = 1024 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Convert a size in megabytes to bytes.
pub fn mb_to_bytes(size_mb: u64) -> Result<u64, ImageError> {
    size_mb
        .checked_mul(BYTES_PER_MB)
        .ok_or(ImageError::SizeOverflow { size_mb })
}

/// Step of the connect sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectStep {
    ReadConfig,
    Authenticate,
    OpenNamespace,
}

impl fmt::Display for ConnectStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectStep::ReadConfig => "read_config",
            ConnectStep::Authenticate => "authenticate",
            ConnectStep::OpenNamespace => "open_namespace",
        };
        f.write_str(s)
    }
}

/// Errors establishing a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("reading cluster configuration failed: {0}")]
    Config(String),

    #[error("authenticating as {principal} failed: {source}")]
    Authenticate {
        principal: String,
        #[source]
        source: StoreError,
    },

    #[error("opening pool {pool} failed: {source}")]
    Namespace {
        pool: String,
        #[source]
        source: StoreError,
    },
}

impl ConnectionError {
    /// The connect step that failed.
    pub fn step(&self) -> ConnectStep {
        match self {
            ConnectionError::Config(_) => ConnectStep::ReadConfig,
            ConnectionError::Authenticate { .. } => ConnectStep::Authenticate,
            ConnectionError::Namespace { .. } => ConnectStep::OpenNamespace,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            ConnectionError::Config(_) => "config_unreadable",
            ConnectionError::Authenticate { .. } => "connect_failed",
            ConnectionError::Namespace { .. } => "namespace_failed",
        }
    }
}

/// Errors resolving, creating or removing images.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image {name} not found on pool {pool}")]
    NotFound { name: String, pool: String },

    #[error("looking up image {name} failed: {source}")]
    Lookup {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("creating image {name} of {size_bytes} bytes on pool {pool} failed: {source}")]
    Create {
        name: String,
        size_bytes: u64,
        pool: String,
        #[source]
        source: StoreError,
    },

    #[error("opening image {name} failed: {source}")]
    Open {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("cannot stat image {name}: {source}")]
    Stat {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("listing images on pool {pool} failed: {source}")]
    List {
        pool: String,
        #[source]
        source: StoreError,
    },

    #[error("removing image {name} failed: {source}")]
    Remove {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("image {name} exists with {actual} bytes, requested {requested} bytes")]
    SizeMismatch {
        name: String,
        requested: u64,
        actual: u64,
    },

    #[error("size of {size_mb} MB overflows a byte count")]
    SizeOverflow { size_mb: u64 },

    #[error("image {name} belongs to a different connection")]
    ForeignImage { name: String },

    #[error("connection has been shut down")]
    ConnectionClosed,
}

impl ImageError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            ImageError::NotFound { .. } => "image_not_found",
            ImageError::Lookup { .. } => "image_lookup_failed",
            ImageError::Create { .. } => "image_create_failed",
            ImageError::Open { .. } => "image_open_failed",
            ImageError::Stat { .. } => "image_stat_failed",
            ImageError::List { .. } => "image_list_failed",
            ImageError::Remove { .. } => "image_remove_failed",
            ImageError::SizeMismatch { .. } => "image_size_mismatch",
            ImageError::SizeOverflow { .. } => "image_size_overflow",
            ImageError::ForeignImage { .. } => "foreign_image",
            ImageError::ConnectionClosed => "connection_closed",
        }
    }
}

/// Parameters for [`Connection::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Principal to authenticate as.
    pub user: Option<String>,
    /// Pool to open; [`DEFAULT_POOL`] when unset.
    pub pool: Option<String>,
    /// Cluster name; host default when unset.
    pub cluster: Option<String>,
    /// Configuration source.
    pub config: ConfigSource,
}

impl ConnectOptions {
    /// The pool that will be opened.
    pub fn pool_name(&self) -> &str {
        self.pool
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_POOL)
    }
}

/// An authenticated session bound to one open pool.
///
/// The pool context must be released with [`Connection::shutdown`]; dropping
/// an open connection only logs a warning.
pub struct Connection {
    id: u64,
    store: Arc<dyn RemoteStore>,
    namespace: Option<Namespace>,
    pool: String,
    username: Option<String>,
    cluster: Option<String>,
    strict_size_check: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("pool", &self.pool)
            .field("username", &self.username)
            .field("cluster", &self.cluster)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection {
    /// Read configuration, authenticate, then open the pool.
    pub fn connect(
        store: Arc<dyn RemoteStore>,
        options: &ConnectOptions,
    ) -> Result<Self, ConnectionError> {
        let cluster = options.cluster.as_deref();
        let config_path = options
            .config
            .resolve(cluster)
            .map_err(ConnectionError::Config)?;

        let credentials = Credentials::select(cluster, options.user.as_deref());
        debug!(
            principal = %credentials.principal(),
            config = %config_path.display(),
            "Authenticating with cluster"
        );

        let session =
            store
                .connect(&credentials, &config_path)
                .map_err(|source| ConnectionError::Authenticate {
                    principal: credentials.principal(),
                    source,
                })?;

        let pool = options.pool_name().to_string();
        let namespace = match store.open_namespace(&session, &pool) {
            Ok(ns) => ns,
            Err(source) => {
                store.disconnect(&session);
                return Err(ConnectionError::Namespace { pool, source });
            }
        };

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            connection_id = id,
            pool = %pool,
            principal = %credentials.principal(),
            "Connected to cluster"
        );

        Ok(Self {
            id,
            store,
            namespace: Some(namespace),
            pool,
            username: credentials.user().map(str::to_string),
            cluster: credentials.cluster().map(str::to_string),
            strict_size_check: false,
        })
    }

    /// Refuse to reuse an existing image whose size differs from the request.
    pub fn with_strict_size_check(mut self, strict: bool) -> Self {
        self.strict_size_check = strict;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    /// Whether the pool context is still held.
    pub fn is_open(&self) -> bool {
        self.namespace.is_some()
    }

    /// Release the pool context, then the session. Later calls do nothing.
    pub fn shutdown(&mut self) {
        if let Some(ns) = self.namespace.take() {
            self.store.close_namespace(&ns);
            self.store.disconnect(&ns.session);
            info!(connection_id = self.id, pool = %self.pool, "Connection shut down");
        }
    }

    fn namespace(&self) -> Result<&Namespace, ImageError> {
        self.namespace.as_ref().ok_or(ImageError::ConnectionClosed)
    }

    /// Look up an existing image and open it.
    pub fn get_image_by_name(&self, name: &str) -> Result<Image, ImageError> {
        let ns = self.namespace()?;
        let found = self
            .store
            .lookup_image(ns, name)
            .map_err(|source| ImageError::Lookup {
                name: name.to_string(),
                source,
            })?;

        if found.is_none() {
            return Err(ImageError::NotFound {
                name: name.to_string(),
                pool: self.pool.clone(),
            });
        }

        self.open(name, false)
    }

    /// Return the named image, creating it with `size_mb` megabytes if absent.
    ///
    /// An existing image is returned as-is; a size mismatch is only an
    /// error under the strict size check. The size is only converted to
    /// bytes once it is needed, so a request that overflows still reuses an
    /// existing image.
    pub fn get_or_create_image(&self, name: &str, size_mb: u64) -> Result<Image, ImageError> {
        match self.get_image_by_name(name) {
            Ok(image) => {
                self.check_size(&image, size_mb)?;
                debug!(image = %name, pool = %self.pool, "Reusing existing image");
                return Ok(image);
            }
            Err(ImageError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let size_bytes = mb_to_bytes(size_mb)?;
        let ns = self.namespace()?;
        self.store
            .create_image(ns, name, size_bytes)
            .map_err(|source| ImageError::Create {
                name: name.to_string(),
                size_bytes,
                pool: self.pool.clone(),
                source,
            })?;

        info!(image = %name, pool = %self.pool, size_bytes, "Image created");

        self.open(name, true)
    }

    /// Names of all images in the pool.
    pub fn list_images(&self) -> Result<Vec<String>, ImageError> {
        let ns = self.namespace()?;
        self.store
            .list_images(ns)
            .map_err(|source| ImageError::List {
                pool: self.pool.clone(),
                source,
            })
    }

    /// Destroy an image obtained from this connection.
    pub fn remove_image(&self, image: Image) -> Result<(), ImageError> {
        if image.connection_id != self.id {
            return Err(ImageError::ForeignImage { name: image.name });
        }

        let ns = self.namespace()?;
        self.store
            .remove_image(ns, &image.name)
            .map_err(|source| ImageError::Remove {
                name: image.name.clone(),
                source,
            })?;

        info!(image = %image.name, pool = %self.pool, "Image removed");
        Ok(())
    }

    fn check_size(&self, image: &Image, size_mb: u64) -> Result<(), ImageError> {
        let actual = image.info.size;
        if mb_to_bytes(size_mb).ok() == Some(actual) {
            return Ok(());
        }

        if self.strict_size_check {
            let requested = mb_to_bytes(size_mb)?;
            return Err(ImageError::SizeMismatch {
                name: image.name.clone(),
                requested,
                actual,
            });
        }

        warn!(
            image = %image.name,
            requested_mb = size_mb,
            actual_bytes = actual,
            "Existing image size differs from request; using it unchanged"
        );
        Ok(())
    }

    /// Open then stat; both must succeed.
    fn open(&self, name: &str, created: bool) -> Result<Image, ImageError> {
        let ns = self.namespace()?;
        self.store
            .open_image(ns, name)
            .map_err(|source| ImageError::Open {
                name: name.to_string(),
                source,
            })?;

        let info = self
            .store
            .stat_image(ns, name)
            .map_err(|source| ImageError::Stat {
                name: name.to_string(),
                source,
            })?;

        Ok(Image {
            name: name.to_string(),
            pool: self.pool.clone(),
            username: self.username.clone(),
            info,
            connection_id: self.id,
            created,
        })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.is_open() {
            warn!(
                connection_id = self.id,
                pool = %self.pool,
                "Connection dropped without shutdown; pool context leaked"
            );
        }
    }
}

/// An opened image and its descriptor snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Image {
    name: String,
    pool: String,
    username: Option<String>,
    info: ImageInfo,
    connection_id: u64,
    created: bool,
}

impl Image {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Principal the owning connection authenticated as.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn size_bytes(&self) -> u64 {
        self.info.size
    }

    /// Identifier of the owning [`Connection`].
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// True when this call allocated the image.
    pub fn was_created(&self) -> bool {
        self.created
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Fault, MemoryStore};

    fn options(dir: &tempfile::TempDir) -> ConnectOptions {
        let conf = dir.path().join("ceph.conf");
        std::fs::write(&conf, "[global]\n").unwrap();
        ConnectOptions {
            user: Some("lxd".to_string()),
            pool: Some("lxd".to_string()),
            cluster: None,
            config: ConfigSource::Explicit(conf),
        }
    }

    #[test]
    fn test_mb_to_bytes() {
        assert_eq!(mb_to_bytes(20).unwrap(), 20 * 1024 * 1024);
        assert!(matches!(
            mb_to_bytes(u64::MAX),
            Err(ImageError::SizeOverflow { .. })
        ));
    }

    #[test]
    fn test_connect_and_shutdown_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new().with_pool("lxd");
        let mut conn = Connection::connect(Arc::new(store.clone()), &options(&dir)).unwrap();

        assert!(conn.is_open());
        assert_eq!(conn.username(), Some("lxd"));
        assert_eq!(store.open_namespaces(), 1);

        conn.shutdown();
        conn.shutdown();
        assert!(!conn.is_open());
        assert_eq!(store.open_namespaces(), 0);
        assert_eq!(store.namespace_releases(), 1);
        assert_eq!(store.open_sessions(), 0);
    }

    #[test]
    fn test_connect_reports_failed_step() {
        let dir = tempfile::tempdir().unwrap();

        let store = MemoryStore::new().with_pool("lxd");
        store.fail(Fault::Connect, "auth denied");
        let err = Connection::connect(Arc::new(store), &options(&dir)).unwrap_err();
        assert_eq!(err.step(), ConnectStep::Authenticate);

        let store = MemoryStore::new();
        let err = Connection::connect(Arc::new(store.clone()), &options(&dir)).unwrap_err();
        assert_eq!(err.step(), ConnectStep::OpenNamespace);
        assert_eq!(store.open_sessions(), 0);

        let mut opts = options(&dir);
        opts.config = ConfigSource::Explicit(dir.path().join("nope.conf"));
        let err = Connection::connect(Arc::new(MemoryStore::new()), &opts).unwrap_err();
        assert_eq!(err.step(), ConnectStep::ReadConfig);
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new().with_pool("lxd");
        let mut conn = Connection::connect(Arc::new(store.clone()), &options(&dir)).unwrap();

        let first = conn.get_or_create_image("foobar", 20).unwrap();
        assert!(first.was_created());
        assert_eq!(first.size_bytes(), 20 * 1024 * 1024);

        let second = conn.get_or_create_image("foobar", 20).unwrap();
        assert!(!second.was_created());
        assert_eq!(second.name(), first.name());
        assert_eq!(second.info(), first.info());
        assert_eq!(store.creations(), 1);

        conn.shutdown();
    }

    #[test]
    fn test_size_mismatch_policy() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new().with_pool("lxd");
        store.insert_image("lxd", "foobar", 10 * 1024 * 1024);

        let mut lenient = Connection::connect(Arc::new(store.clone()), &options(&dir)).unwrap();
        let image = lenient.get_or_create_image("foobar", 20).unwrap();
        assert_eq!(image.size_bytes(), 10 * 1024 * 1024);
        lenient.shutdown();

        let mut strict = Connection::connect(Arc::new(store.clone()), &options(&dir))
            .unwrap()
            .with_strict_size_check(true);
        let err = strict.get_or_create_image("foobar", 20).unwrap_err();
        assert!(matches!(err, ImageError::SizeMismatch { .. }));
        strict.shutdown();
    }

    #[test]
    fn test_oversized_request_reuses_existing_image() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new().with_pool("lxd");
        store.insert_image("lxd", "foobar", 20 * 1024 * 1024);
        let mut conn = Connection::connect(Arc::new(store.clone()), &options(&dir)).unwrap();

        let image = conn.get_or_create_image("foobar", u64::MAX).unwrap();
        assert_eq!(image.size_bytes(), 20 * 1024 * 1024);

        let err = conn.get_or_create_image("other", u64::MAX).unwrap_err();
        assert!(matches!(err, ImageError::SizeOverflow { .. }));
        assert_eq!(store.creations(), 0);
        conn.shutdown();
    }

    #[test]
    fn test_lookup_failure_is_not_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new().with_pool("lxd");
        store.fail(Fault::Lookup, "timed out");
        let mut conn = Connection::connect(Arc::new(store.clone()), &options(&dir)).unwrap();

        let err = conn.get_or_create_image("foobar", 20).unwrap_err();
        assert!(matches!(err, ImageError::Lookup { .. }));
        assert_eq!(store.creations(), 0);
        conn.shutdown();
    }

    #[test]
    fn test_stat_failure_returns_no_image() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new().with_pool("lxd");
        store.insert_image("lxd", "foobar", 1024);
        store.fail(Fault::Stat, "io error");
        let mut conn = Connection::connect(Arc::new(store), &options(&dir)).unwrap();

        let err = conn.get_image_by_name("foobar").unwrap_err();
        assert_eq!(err.reason_code(), "image_stat_failed");
        conn.shutdown();
    }

    #[test]
    fn test_closed_connection_rejects_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new().with_pool("lxd");
        let mut conn = Connection::connect(Arc::new(store), &options(&dir)).unwrap();
        conn.shutdown();

        assert!(matches!(
            conn.get_image_by_name("foobar"),
            Err(ImageError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_remove_image() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new().with_pool("lxd");
        let mut conn = Connection::connect(Arc::new(store.clone()), &options(&dir)).unwrap();
        let mut other = Connection::connect(Arc::new(store.clone()), &options(&dir)).unwrap();

        let image = conn.get_or_create_image("foobar", 1).unwrap();
        let err = other.remove_image(image.clone()).unwrap_err();
        assert!(matches!(err, ImageError::ForeignImage { .. }));

        conn.remove_image(image).unwrap();
        assert!(store.image("lxd", "foobar").is_none());

        conn.shutdown();
        other.shutdown();
    }
}
