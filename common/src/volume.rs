use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::naming::VolumeName;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub policy: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size_mb: u64,
}

impl Volume {
    pub fn new(name: &VolumeName, size_mb: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            policy: name.policy.clone(),
            name: name.volume.clone(),
            created_at,
            size_mb,
        }
    }

    pub fn volume_name(&self) -> VolumeName {
        VolumeName {
            policy: self.policy.clone(),
            volume: self.name.clone(),
        }
    }

    pub fn backend_name(&self) -> String {
        self.volume_name().backend_name()
    }
}
