//! Provisioning state machine and teardown.
//!
//! ```text
//! Disconnected → Connected → ImageResolved → MappingKnown ─┬→ Mapped → FormattedOrSkipped → Mounted
//!                                                          └→ (already mapped) reported as found
//! ```
//!
//! Any failing transition moves to `Failed` and aborts the remaining steps.
//! Teardown is a separate entry point and is never triggered by a failed
//! provision.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::device::{Device, DeviceMapper, FilesystemError, FilesystemManager, MappingError, UnmapError};
use crate::discovery::DeviceDiscovery;
use crate::exec::CommandRunner;
use crate::remote::{ConnectOptions, Connection, ConnectionError, Image, ImageError, ImageInfo, RemoteStore};
use crate::settings::Settings;

/// What to provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// Image name within the pool.
    pub image: String,
    /// Size in megabytes, used only when the image has to be created.
    pub size_mb: u64,
    /// Filesystem type; the configured default when unset.
    pub fs_type: Option<String>,
    /// Where to mount the device.
    pub mount_point: String,
}

/// Lifecycle state of a [`Provisioner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Disconnected,
    Connected,
    ImageResolved,
    MappingKnown,
    Mapped,
    FormattedOrSkipped,
    Mounted,
    Failed,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisionState::Disconnected => "disconnected",
            ProvisionState::Connected => "connected",
            ProvisionState::ImageResolved => "image_resolved",
            ProvisionState::MappingKnown => "mapping_known",
            ProvisionState::Mapped => "mapped",
            ProvisionState::FormattedOrSkipped => "formatted_or_skipped",
            ProvisionState::Mounted => "mounted",
            ProvisionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Which path a successful provision took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    /// Mapped (and formatted if needed) and mounted by this call.
    Fresh,
    /// Already mapped on this host; nothing was changed.
    AlreadyMapped,
}

/// Result of a successful provision.
#[derive(Debug, Clone, Serialize)]
pub struct Provisioned {
    pub device: Device,
    pub image: ImageInfo,
    pub pool: String,
    pub branch: Branch,
    /// The image was allocated by this call.
    pub image_created: bool,
    /// A filesystem was created by this call.
    pub formatted: bool,
    pub completed_at: DateTime<Utc>,
}

/// Provisioning stage that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Connect,
    ResolveImage,
    Map,
    Filesystem,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Connect => "connect",
            Stage::ResolveImage => "resolve_image",
            Stage::Map => "map",
            Stage::Filesystem => "filesystem",
        };
        f.write_str(s)
    }
}

/// Underlying error of a provisioning stage or teardown step.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Unmap(#[from] UnmapError),

    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
}

impl StageError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            StageError::Connection(e) => e.reason_code(),
            StageError::Image(e) => e.reason_code(),
            StageError::Mapping(e) => e.reason_code(),
            StageError::Unmap(e) => e.reason_code(),
            StageError::Filesystem(e) => e.reason_code(),
        }
    }
}

/// A provision that stopped at `stage`.
#[derive(Debug, Error)]
#[error("provisioning failed at {stage}: {source}")]
pub struct ProvisionError {
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

impl ProvisionError {
    fn new(stage: Stage, source: impl Into<StageError>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }

    pub fn reason_code(&self) -> &'static str {
        self.source.reason_code()
    }
}

/// How teardown reacts to a failing step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPolicy {
    /// Stop at the first failure; later steps are skipped.
    #[default]
    AbortOnFirst,
    /// Keep going with every step that does not depend on a failed one and
    /// report all failures together.
    BestEffort,
}

/// Parameters for [`Provisioner::teardown`].
#[derive(Debug, Clone, Default)]
pub struct TeardownOptions {
    pub policy: TeardownPolicy,
    /// Remove this image from the pool once the device is unmapped.
    pub destroy_image: Option<String>,
    /// Shut the cluster connection down as the last step.
    pub release_connection: bool,
}

/// One teardown step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownStep {
    Unmount,
    Unmap,
    DestroyImage,
    ReleaseConnection,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TeardownStep::Unmount => "unmount",
            TeardownStep::Unmap => "unmap",
            TeardownStep::DestroyImage => "destroy_image",
            TeardownStep::ReleaseConnection => "release_connection",
        };
        f.write_str(s)
    }
}

/// A failed teardown step.
#[derive(Debug)]
pub struct TeardownFailure {
    pub step: TeardownStep,
    pub source: StageError,
}

/// Every failure of a teardown, plus the steps that were not attempted.
#[derive(Debug, Default, Error)]
#[error("teardown failed: {}", summarize(.failures))]
pub struct TeardownError {
    pub failures: Vec<TeardownFailure>,
    pub skipped: Vec<TeardownStep>,
}

fn summarize(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.step, f.source))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Drives an image to the mounted state and back.
///
/// The cluster connection is opened on first use and held until
/// [`Provisioner::shutdown`].
pub struct Provisioner {
    store: Arc<dyn RemoteStore>,
    connect_options: ConnectOptions,
    settings: Settings,
    discovery: DeviceDiscovery,
    mapper: DeviceMapper,
    filesystems: FilesystemManager,
    connection: Option<Connection>,
    state: ProvisionState,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        runner: Arc<dyn CommandRunner>,
        connect_options: ConnectOptions,
        settings: Settings,
    ) -> Self {
        let filesystems = FilesystemManager::new(Arc::clone(&runner))
            .with_strict_fs_check(settings.strict_fs_check);
        let mapper = DeviceMapper::new(Arc::clone(&runner), filesystems.clone());
        let discovery = DeviceDiscovery::new(runner);

        Self {
            store,
            connect_options,
            settings,
            discovery,
            mapper,
            filesystems,
            connection: None,
            state: ProvisionState::Disconnected,
        }
    }

    pub fn state(&self) -> ProvisionState {
        self.state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn discovery(&self) -> &DeviceDiscovery {
        &self.discovery
    }

    /// Whether a cluster connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_open)
    }

    /// Open the cluster connection if it is not already open.
    pub fn ensure_connected(&mut self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }

        let connection = Connection::connect(Arc::clone(&self.store), &self.connect_options)?
            .with_strict_size_check(self.settings.strict_size_check);
        self.connection = Some(connection);
        self.transition(ProvisionState::Connected);
        Ok(())
    }

    fn connection(&self) -> Result<&Connection, ImageError> {
        self.connection
            .as_ref()
            .filter(|c| c.is_open())
            .ok_or(ImageError::ConnectionClosed)
    }

    /// Take `request` to the mounted state.
    ///
    /// If the image is already mapped on this host the existing device is
    /// reported as found, with its current mount if any, and nothing is
    /// mapped, formatted or mounted.
    pub fn provision(&mut self, request: &ProvisionRequest) -> Result<Provisioned, ProvisionError> {
        info!(
            image = %request.image,
            size_mb = request.size_mb,
            mount_point = %request.mount_point,
            "Provisioning block device"
        );

        match self.drive(request) {
            Ok(provisioned) => {
                info!(
                    image = %request.image,
                    device = %provisioned.device.path(),
                    branch = ?provisioned.branch,
                    state = %self.state,
                    "Provisioning complete"
                );
                Ok(provisioned)
            }
            Err(e) => {
                self.transition(ProvisionState::Failed);
                error!(
                    image = %request.image,
                    stage = %e.stage,
                    reason = e.reason_code(),
                    error = %e.source,
                    "Provisioning failed"
                );
                Err(e)
            }
        }
    }

    fn drive(&mut self, request: &ProvisionRequest) -> Result<Provisioned, ProvisionError> {
        let fs_type = request
            .fs_type
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.settings.default_fs_type.clone());

        self.ensure_connected()
            .map_err(|e| ProvisionError::new(Stage::Connect, e))?;

        let image = self
            .connection()
            .and_then(|c| c.get_or_create_image(&request.image, request.size_mb))
            .map_err(|e| ProvisionError::new(Stage::ResolveImage, e))?;
        self.transition(ProvisionState::ImageResolved);

        let existing = self.discovery.is_already_mapped(&image);
        self.transition(ProvisionState::MappingKnown);

        if let Some(path) = existing {
            let device = match self.discovery.mount_point_of(&path) {
                Some(mount_point) => Device::mounted_at(path, fs_type, mount_point),
                None => Device::new(path, fs_type),
            };
            info!(
                image = %image.name(),
                device = %device.path(),
                mount_point = device.mount_point().unwrap_or(""),
                "Image already mapped; skipping map, format and mount"
            );
            self.transition(if device.is_mounted() {
                ProvisionState::Mounted
            } else {
                ProvisionState::Mapped
            });
            return Ok(finish(device, &image, Branch::AlreadyMapped, false));
        }

        let mut device = self
            .mapper
            .map(&image, Some(fs_type.as_str()))
            .map_err(|e| ProvisionError::new(Stage::Map, e))?;
        self.transition(ProvisionState::Mapped);

        let formatted = self
            .filesystems
            .ensure_formatted(&device)
            .map_err(|e| ProvisionError::new(Stage::Filesystem, FilesystemError::from(e)))?;
        self.transition(ProvisionState::FormattedOrSkipped);

        self.filesystems
            .mount_formatted(&mut device, &request.mount_point)
            .map_err(|e| ProvisionError::new(Stage::Filesystem, e))?;
        self.transition(ProvisionState::Mounted);

        Ok(finish(device, &image, Branch::Fresh, formatted))
    }

    /// Device record for an image of the configured pool, found through
    /// discovery.
    pub fn locate(&self, image_name: &str, fs_type: Option<&str>) -> Option<Device> {
        let fs_type = fs_type
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.settings.default_fs_type);
        self.discovery
            .locate(self.connect_options.pool_name(), image_name, fs_type)
    }

    /// Pool this provisioner works on.
    pub fn pool(&self) -> &str {
        self.connect_options.pool_name()
    }

    /// Names of all images in the pool.
    pub fn list_images(&mut self) -> Result<Vec<String>, StageError> {
        self.ensure_connected()?;
        Ok(self.connection()?.list_images()?)
    }

    /// Open an existing image.
    pub fn image(&mut self, name: &str) -> Result<Image, StageError> {
        self.ensure_connected()?;
        Ok(self.connection()?.get_image_by_name(name)?)
    }

    /// Remove an existing image from the pool.
    pub fn destroy_image(&mut self, name: &str) -> Result<(), StageError> {
        self.ensure_connected()?;
        let connection = self.connection()?;
        let image = connection.get_image_by_name(name)?;
        connection.remove_image(image)?;
        Ok(())
    }

    /// Unmount (if mounted) then unmap `device`, optionally destroying the
    /// image and releasing the connection afterwards.
    ///
    /// Unmap is never attempted while the device is still mounted, and the
    /// image is only destroyed once unmapped.
    pub fn teardown(
        &mut self,
        device: &mut Device,
        options: &TeardownOptions,
    ) -> Result<(), TeardownError> {
        info!(
            device = %device.path(),
            mounted = device.is_mounted(),
            policy = ?options.policy,
            "Tearing down block device"
        );

        let mut outcome = TeardownError::default();
        let mut aborted = false;
        let mut unmapped = false;

        let steps = [
            TeardownStep::Unmount,
            TeardownStep::Unmap,
            TeardownStep::DestroyImage,
            TeardownStep::ReleaseConnection,
        ];

        for step in steps {
            let applies = match step {
                TeardownStep::Unmount => device.is_mounted(),
                TeardownStep::Unmap => true,
                TeardownStep::DestroyImage => options.destroy_image.is_some(),
                TeardownStep::ReleaseConnection => options.release_connection,
            };
            if !applies {
                continue;
            }

            let blocked = match step {
                TeardownStep::Unmap => device.is_mounted(),
                TeardownStep::DestroyImage => !unmapped,
                _ => false,
            };
            if aborted || blocked {
                debug!(step = %step, "Skipping teardown step");
                outcome.skipped.push(step);
                continue;
            }

            let result = match step {
                TeardownStep::Unmount => self
                    .filesystems
                    .unmount(device)
                    .map(|()| device.clear_mount())
                    .map_err(StageError::from),
                TeardownStep::Unmap => self
                    .mapper
                    .unmap(device)
                    .map(|()| unmapped = true)
                    .map_err(StageError::from),
                TeardownStep::DestroyImage => match options.destroy_image.as_deref() {
                    Some(name) => self.destroy_image(name),
                    None => Ok(()),
                },
                TeardownStep::ReleaseConnection => {
                    self.shutdown();
                    Ok(())
                }
            };

            if let Err(source) = result {
                warn!(
                    step = %step,
                    reason = source.reason_code(),
                    error = %source,
                    "Teardown step failed"
                );
                outcome.failures.push(TeardownFailure { step, source });
                if options.policy == TeardownPolicy::AbortOnFirst {
                    aborted = true;
                }
            }
        }

        if outcome.failures.is_empty() {
            info!(device = %device.path(), "Teardown complete");
            Ok(())
        } else {
            Err(outcome)
        }
    }

    /// Release the cluster connection. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown();
        }
        self.transition(ProvisionState::Disconnected);
    }

    fn transition(&mut self, next: ProvisionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "State transition");
            self.state = next;
        }
    }
}

fn finish(device: Device, image: &Image, branch: Branch, formatted: bool) -> Provisioned {
    Provisioned {
        device,
        image: image.info().clone(),
        pool: image.pool().to_string(),
        branch,
        image_created: image.was_created(),
        formatted,
        completed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ProvisionState::FormattedOrSkipped.to_string(), "formatted_or_skipped");
        assert_eq!(Stage::ResolveImage.to_string(), "resolve_image");
    }

    #[test]
    fn test_teardown_error_summary() {
        let err = TeardownError {
            failures: vec![TeardownFailure {
                step: TeardownStep::Unmount,
                source: StageError::Image(ImageError::ConnectionClosed),
            }],
            skipped: vec![TeardownStep::Unmap],
        };
        assert_eq!(
            err.to_string(),
            "teardown failed: unmount: connection has been shut down"
        );
    }

    #[test]
    fn test_default_teardown_policy_aborts() {
        assert_eq!(TeardownPolicy::default(), TeardownPolicy::AbortOnFirst);
    }
}
