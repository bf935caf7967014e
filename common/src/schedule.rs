use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::volume::Volume;

/// Persisted phase of a volume's snapshot schedule.
///
/// `volume_created_at` ties the state to one incarnation of the volume: a
/// volume removed and created again under the same name starts a fresh phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub volume_created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_fired: Option<DateTime<Utc>>,
}

impl SchedulerState {
    pub fn for_volume(volume: &Volume) -> Self {
        Self {
            volume_created_at: volume.created_at,
            last_fired: None,
        }
    }

    pub fn belongs_to(&self, volume: &Volume) -> bool {
        self.volume_created_at == volume.created_at
    }

    /// The phase anchor is the last successful firing, or volume creation.
    pub fn next_due(&self, frequency: Duration) -> DateTime<Utc> {
        let anchor = self.last_fired.unwrap_or(self.volume_created_at);
        after(anchor, frequency)
    }
}

/// `at + d`, saturating at the largest representable instant.
pub fn after(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Deterministic, lexically sortable snapshot name.
pub fn snapshot_name(at: DateTime<Utc>) -> String {
    format!("snap-{}", at.format("%Y%m%dT%H%M%S%.3fZ"))
}
