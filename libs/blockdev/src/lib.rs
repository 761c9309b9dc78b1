//! rbdvol block device provisioning.
//!
//! Takes a named image in a storage cluster pool from "may or may not
//! exist" to "mapped, formatted and mounted" on this host, and back again.
//!
//! ## Architecture
//!
//! ```text
//! Provisioner
//! ├── Connection        (remote: session + pool context)
//! │   └── RemoteStore   (RbdCliStore on hosts, MemoryStore in tests)
//! ├── DeviceDiscovery   (rbd showmapped / findmnt snapshot)
//! ├── DeviceMapper      (rbd map / rbd unmap)
//! └── FilesystemManager (blkid / mkfs.<type> / mount / umount)
//! ```
//!
//! Every host utility runs through an injected [`exec::CommandRunner`].
//! All calls block; nothing here is async.
//!
//! ## Modules
//!
//! - `exec`: host command capability and its scripted fake
//! - `remote`: cluster connection, image handles and store backends
//! - `discovery`: mapped device and mount discovery
//! - `device`: mapping, formatting and mounting
//! - `provision`: the provisioning state machine and teardown
//! - `settings`: policy toggles

pub mod device;
pub mod discovery;
pub mod exec;
pub mod provision;
pub mod remote;
pub mod settings;

// Re-export commonly used types
pub use device::{Device, DeviceMapper, FilesystemManager, DEFAULT_FS_TYPE};
pub use discovery::{DeviceDiscovery, Mapping};
pub use exec::{CommandRunner, ScriptedRunner, SystemRunner};
pub use provision::{
    Branch, ProvisionError, ProvisionRequest, ProvisionState, Provisioned, Provisioner, Stage,
    TeardownError, TeardownOptions, TeardownPolicy,
};
pub use remote::{ConfigSource, ConnectOptions, Connection, MemoryStore, RbdCliStore, RemoteStore};
pub use settings::Settings;
