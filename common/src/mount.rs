use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which host has a volume mounted, and for which container requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountState {
    pub host: String,
    /// Instance id of the daemon that performed the mount.
    pub owner: String,
    /// Request ids sharing the mount; the volume is unmounted when the last goes.
    #[serde(default)]
    pub mount_ids: Vec<String>,
    pub mountpoint: PathBuf,
    #[serde(default)]
    pub device: Option<String>,
    pub mounted_at: DateTime<Utc>,
}

impl MountState {
    /// Adds `id`, returning false if it was already holding the mount.
    pub fn acquire(&mut self, id: &str) -> bool {
        if self.mount_ids.iter().any(|m| m == id) {
            return false;
        }
        self.mount_ids.push(id.to_string());
        true
    }

    /// Drops `id`, returning true when no request holds the mount anymore.
    pub fn release(&mut self, id: &str) -> bool {
        self.mount_ids.retain(|m| m != id);
        self.mount_ids.is_empty()
    }
}
