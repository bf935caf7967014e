use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use common::VolumeName;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = HashMap<VolumeName, Arc<AsyncMutex<()>>>;

/// One async lock per volume, shared by protocol handlers and the
/// reconciliation loop. Entries live only while someone holds or waits
/// for them.
#[derive(Default, Clone)]
pub struct VolumeLocks {
    inner: Arc<Mutex<LockMap>>,
}

/// Holds a volume's lock; releasing the last interest in it drops the entry.
pub struct VolumeGuard {
    guard: Option<OwnedMutexGuard<()>>,
    name: VolumeName,
    locks: VolumeLocks,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, LockMap> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry(&self, name: &VolumeName) -> Arc<AsyncMutex<()>> {
        self.map().entry(name.clone()).or_default().clone()
    }

    fn guard(&self, name: &VolumeName, guard: OwnedMutexGuard<()>) -> VolumeGuard {
        VolumeGuard {
            guard: Some(guard),
            name: name.clone(),
            locks: self.clone(),
        }
    }

    pub async fn lock(&self, name: &VolumeName) -> VolumeGuard {
        let guard = self.entry(name).lock_owned().await;
        self.guard(name, guard)
    }

    /// Returns `None` while a handler is working on the volume.
    pub fn try_lock(&self, name: &VolumeName) -> Option<VolumeGuard> {
        let guard = self.entry(name).try_lock_owned().ok()?;
        Some(self.guard(name, guard))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map().len()
    }
}

impl Drop for VolumeGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.locks.map();
        // waiters and other guards each hold a clone of the entry
        if map
            .get(&self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.name);
        }
    }
}
