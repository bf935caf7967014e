use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use common::DriverOptions;

use crate::{DriverError, MountInfo, StorageDriver};

/// Operations of [`FakeDriver`] that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Create,
    Remove,
    Mount,
    Unmount,
    Snapshot,
    ListSnapshots,
    DeleteSnapshot,
}

impl FakeOp {
    fn label(self) -> &'static str {
        match self {
            FakeOp::Create => "create",
            FakeOp::Remove => "remove",
            FakeOp::Mount => "mount",
            FakeOp::Unmount => "unmount",
            FakeOp::Snapshot => "snapshot",
            FakeOp::ListSnapshots => "list_snapshots",
            FakeOp::DeleteSnapshot => "delete_snapshot",
        }
    }
}

#[derive(Debug, Default)]
struct Image {
    pool: String,
    snapshots: Vec<String>,
    mount: Option<MountInfo>,
}

#[derive(Debug, Default)]
struct State {
    images: BTreeMap<String, Image>,
    failing: HashSet<FakeOp>,
    snapshots_taken: usize,
}

/// In-memory driver that keeps images, snapshots and mounts in a map.
#[derive(Debug, Default)]
pub struct FakeDriver {
    state: Mutex<State>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later call of `op` fail until cleared.
    pub fn set_failing(&self, op: FakeOp, failing: bool) {
        let mut st = self.lock();
        if failing {
            st.failing.insert(op);
        } else {
            st.failing.remove(&op);
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.lock().images.contains_key(name)
    }

    /// Snapshots ever created, including pruned ones.
    pub fn snapshots_taken(&self) -> usize {
        self.lock().snapshots_taken
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn guarded(&self, op: FakeOp) -> Result<std::sync::MutexGuard<'_, State>, DriverError> {
        let st = self.lock();
        if st.failing.contains(&op) {
            return Err(DriverError::Injected(op.label()));
        }
        Ok(st)
    }
}

fn image_mut<'a>(st: &'a mut State, name: &str) -> Result<&'a mut Image, DriverError> {
    st.images
        .get_mut(name)
        .ok_or_else(|| DriverError::NotFound(name.to_string()))
}

#[async_trait]
impl StorageDriver for FakeDriver {
    async fn create(
        &self,
        name: &str,
        opts: &DriverOptions,
        _size_mb: u64,
    ) -> Result<(), DriverError> {
        let mut st = self.guarded(FakeOp::Create)?;
        if st.images.contains_key(name) {
            return Err(DriverError::Failed {
                command: format!("create {name}"),
                code: Some(17),
                stderr: "image already exists".to_string(),
            });
        }
        st.images.insert(
            name.to_string(),
            Image {
                pool: opts.pool.clone(),
                ..Image::default()
            },
        );
        Ok(())
    }

    async fn remove(&self, name: &str, _opts: &DriverOptions) -> Result<(), DriverError> {
        let mut st = self.guarded(FakeOp::Remove)?;
        st.images
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DriverError::NotFound(name.to_string()))
    }

    async fn mount(
        &self,
        name: &str,
        _opts: &DriverOptions,
        mountpoint: &Path,
    ) -> Result<MountInfo, DriverError> {
        let mut st = self.guarded(FakeOp::Mount)?;
        let image = image_mut(&mut st, name)?;
        if let Some(existing) = &image.mount {
            return Ok(existing.clone());
        }
        let info = MountInfo {
            name: name.to_string(),
            pool: image.pool.clone(),
            device: format!("/dev/fake/{name}"),
            mountpoint: mountpoint.to_path_buf(),
        };
        image.mount = Some(info.clone());
        Ok(info)
    }

    async fn unmount(
        &self,
        name: &str,
        _opts: &DriverOptions,
        _mountpoint: &Path,
    ) -> Result<(), DriverError> {
        let mut st = self.guarded(FakeOp::Unmount)?;
        if let Some(image) = st.images.get_mut(name) {
            image.mount = None;
        }
        Ok(())
    }

    async fn snapshot(
        &self,
        name: &str,
        _opts: &DriverOptions,
        snap: &str,
    ) -> Result<(), DriverError> {
        let mut st = self.guarded(FakeOp::Snapshot)?;
        let image = image_mut(&mut st, name)?;
        if image.snapshots.iter().any(|s| s == snap) {
            return Err(DriverError::Failed {
                command: format!("snap create {name}@{snap}"),
                code: Some(17),
                stderr: "snapshot already exists".to_string(),
            });
        }
        image.snapshots.push(snap.to_string());
        st.snapshots_taken += 1;
        Ok(())
    }

    async fn list_snapshots(
        &self,
        name: &str,
        _opts: &DriverOptions,
    ) -> Result<Vec<String>, DriverError> {
        let mut st = self.guarded(FakeOp::ListSnapshots)?;
        Ok(image_mut(&mut st, name)?.snapshots.clone())
    }

    async fn delete_snapshot(
        &self,
        name: &str,
        _opts: &DriverOptions,
        snap: &str,
    ) -> Result<(), DriverError> {
        let mut st = self.guarded(FakeOp::DeleteSnapshot)?;
        let image = image_mut(&mut st, name)?;
        let before = image.snapshots.len();
        image.snapshots.retain(|s| s != snap);
        if image.snapshots.len() == before {
            return Err(DriverError::NotFound(format!("{name}@{snap}")));
        }
        Ok(())
    }

    async fn mounted(&self) -> Result<Vec<MountInfo>, DriverError> {
        Ok(self
            .lock()
            .images
            .values()
            .filter_map(|i| i.mount.clone())
            .collect())
    }
}

impl FakeDriver {
    /// Mounts `name` behind the daemon's back, as a crashed handler would leave it.
    pub fn force_mount(&self, name: &str, mountpoint: PathBuf) {
        let mut st = self.lock();
        if let Some(image) = st.images.get_mut(name) {
            image.mount = Some(MountInfo {
                name: name.to_string(),
                pool: image.pool.clone(),
                device: format!("/dev/fake/{name}"),
                mountpoint,
            });
        }
    }
}
