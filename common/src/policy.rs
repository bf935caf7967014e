use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::naming::{NameError, validate_policy_name};

const DEFAULT_FREQUENCY: Duration = Duration::from_secs(30 * 60);
const DEFAULT_KEEP_MIN: u32 = 1;
const DEFAULT_KEEP_MAX: u32 = 20;
const DEFAULT_POOL: &str = "rbd";
const DEFAULT_SIZE_MB: u64 = 10 * 1024;
const DEFAULT_FILESYSTEM: &str = "ext4";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error(transparent)]
    Name(#[from] NameError),
    #[error("snapshot frequency must be greater than zero")]
    ZeroFrequency,
    #[error("snapshot keep_max must be at least 1")]
    ZeroKeepMax,
    #[error("snapshot keep_min ({keep_min}) exceeds keep_max ({keep_max})")]
    KeepRange { keep_min: u32, keep_max: u32 },
    #[error("driver pool must not be empty")]
    EmptyPool,
    #[error("driver size_mb must be greater than zero")]
    ZeroSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(with = "humantime_serde", default = "default_frequency")]
    pub frequency: Duration,
    #[serde(default = "default_keep_min")]
    pub keep_min: u32,
    #[serde(default = "default_keep_max")]
    pub keep_max: u32,
}

fn default_frequency() -> Duration {
    DEFAULT_FREQUENCY
}

fn default_keep_min() -> u32 {
    DEFAULT_KEEP_MIN
}

fn default_keep_max() -> u32 {
    DEFAULT_KEEP_MAX
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: DEFAULT_FREQUENCY,
            keep_min: DEFAULT_KEEP_MIN,
            keep_max: DEFAULT_KEEP_MAX,
        }
    }
}

impl SnapshotPolicy {
    /// Number of oldest snapshots to delete so that `existing` falls back to
    /// `keep_max`. Since `keep_min <= keep_max`, pruning never crosses `keep_min`.
    pub fn excess(&self, existing: usize) -> usize {
        existing.saturating_sub(self.keep_max as usize)
    }

    fn validate(&self) -> Result<(), PolicyError> {
        if !self.enabled {
            return Ok(());
        }
        if self.frequency.is_zero() {
            return Err(PolicyError::ZeroFrequency);
        }
        if self.keep_max == 0 {
            return Err(PolicyError::ZeroKeepMax);
        }
        if self.keep_min > self.keep_max {
            return Err(PolicyError::KeepRange {
                keep_min: self.keep_min,
                keep_max: self.keep_max,
            });
        }
        Ok(())
    }
}

/// Parameters handed to the storage driver when a volume is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverOptions {
    #[serde(default = "default_pool")]
    pub pool: String,
    #[serde(default = "default_size_mb")]
    pub size_mb: u64,
    #[serde(default = "default_filesystem")]
    pub filesystem: String,
}

fn default_pool() -> String {
    DEFAULT_POOL.to_string()
}

fn default_size_mb() -> u64 {
    DEFAULT_SIZE_MB
}

fn default_filesystem() -> String {
    DEFAULT_FILESYSTEM.to_string()
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            pool: default_pool(),
            size_mb: DEFAULT_SIZE_MB,
            filesystem: default_filesystem(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    #[serde(default)]
    pub snapshot: SnapshotPolicy,
    #[serde(default)]
    pub driver: DriverOptions,
}

/// The document an operator uploads. It only becomes a [`Policy`] once
/// [`Intent::validate`] accepts it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    #[serde(default)]
    pub snapshot: SnapshotPolicy,
    #[serde(default)]
    pub driver: DriverOptions,
}

impl Intent {
    pub fn validate(self, name: &str) -> Result<Policy, PolicyError> {
        validate_policy_name(name)?;
        self.snapshot.validate()?;
        if self.driver.pool.trim().is_empty() {
            return Err(PolicyError::EmptyPool);
        }
        if self.driver.size_mb == 0 {
            return Err(PolicyError::ZeroSize);
        }
        Ok(Policy {
            name: name.to_string(),
            snapshot: self.snapshot,
            driver: self.driver,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FASTSNAP: &str = r#"
snapshot:
  enabled: true
  frequency: 1s
  keep_min: 5
  keep_max: 10
driver:
  pool: rbd
  size_mb: 10
"#;

    #[test]
    fn fastsnap_intent_becomes_policy() {
        let intent: Intent = serde_yaml::from_str(FASTSNAP).unwrap();
        let policy = intent.validate("policy1").unwrap();
        assert!(policy.snapshot.enabled);
        assert_eq!(policy.snapshot.frequency, Duration::from_secs(1));
        assert_eq!(policy.snapshot.keep_min, 5);
        assert_eq!(policy.snapshot.keep_max, 10);
        assert_eq!(policy.driver.filesystem, "ext4");
    }

    #[test]
    fn frequency_round_trips_as_humantime() {
        let intent: Intent = serde_yaml::from_str(FASTSNAP).unwrap();
        let json = serde_json::to_value(intent.validate("policy1").unwrap()).unwrap();
        assert_eq!(json["snapshot"]["frequency"], "1s");
    }

    #[test]
    fn empty_intent_is_disabled() {
        let policy = Intent::default().validate("nosnap").unwrap();
        assert!(!policy.snapshot.enabled);
    }

    #[test]
    fn reject_inverted_keep_window() {
        let mut intent = Intent::default();
        intent.snapshot.enabled = true;
        intent.snapshot.keep_min = 11;
        intent.snapshot.keep_max = 10;
        assert_eq!(
            intent.validate("p").unwrap_err(),
            PolicyError::KeepRange {
                keep_min: 11,
                keep_max: 10
            }
        );
    }

    #[test]
    fn reject_zero_frequency_only_when_enabled() {
        let mut intent = Intent::default();
        intent.snapshot.frequency = Duration::ZERO;
        assert!(intent.clone().validate("p").is_ok());
        intent.snapshot.enabled = true;
        assert_eq!(intent.validate("p").unwrap_err(), PolicyError::ZeroFrequency);
    }

    #[test]
    fn reject_bad_policy_name() {
        assert!(matches!(
            Intent::default().validate("a.b"),
            Err(PolicyError::Name(_))
        ));
    }

    #[test]
    fn excess_counts_down_to_keep_max() {
        let policy = SnapshotPolicy {
            enabled: true,
            frequency: Duration::from_secs(1),
            keep_min: 5,
            keep_max: 10,
        };
        assert_eq!(policy.excess(3), 0);
        assert_eq!(policy.excess(10), 0);
        assert_eq!(policy.excess(13), 3);
    }
}
