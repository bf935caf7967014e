//! Block-storage drivers behind one capability interface.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use common::DriverOptions;

pub mod ceph;
pub mod error;
pub mod fake;

pub use ceph::CephDriver;
pub use error::DriverError;
pub use fake::{FakeDriver, FakeOp};

/// A volume currently mapped and mounted on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// Backend name, `policy.volume`.
    pub name: String,
    pub pool: String,
    pub device: String,
    pub mountpoint: PathBuf,
}

/// Operations volplugin needs from a storage backend. `name` is always the
/// backend name of a volume; `opts` carries the pool and filesystem from its
/// policy.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Creates and formats a new image.
    async fn create(&self, name: &str, opts: &DriverOptions, size_mb: u64)
    -> Result<(), DriverError>;

    /// Destroys an image together with all of its snapshots.
    async fn remove(&self, name: &str, opts: &DriverOptions) -> Result<(), DriverError>;

    async fn mount(
        &self,
        name: &str,
        opts: &DriverOptions,
        mountpoint: &Path,
    ) -> Result<MountInfo, DriverError>;

    /// Unmounting something that is not mounted succeeds.
    async fn unmount(
        &self,
        name: &str,
        opts: &DriverOptions,
        mountpoint: &Path,
    ) -> Result<(), DriverError>;

    async fn snapshot(&self, name: &str, opts: &DriverOptions, snap: &str)
    -> Result<(), DriverError>;

    /// Snapshot names, oldest first. Fails with [`DriverError::NotFound`]
    /// when the image does not exist.
    async fn list_snapshots(
        &self,
        name: &str,
        opts: &DriverOptions,
    ) -> Result<Vec<String>, DriverError>;

    async fn delete_snapshot(
        &self,
        name: &str,
        opts: &DriverOptions,
        snap: &str,
    ) -> Result<(), DriverError>;

    /// Everything this host currently has mounted through the driver.
    async fn mounted(&self) -> Result<Vec<MountInfo>, DriverError>;
}
