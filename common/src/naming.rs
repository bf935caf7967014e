use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("volume name {0:?} must be of the form <policy>/<volume>")]
    Malformed(String),
    #[error("{kind} name {name:?} is empty or contains invalid characters")]
    Invalid { kind: &'static str, name: String },
}

fn validate(kind: &'static str, name: &str, forbidden: &[char]) -> Result<(), NameError> {
    let bad = name.is_empty()
        || name.starts_with('-')
        || name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || forbidden.contains(&c));
    if bad {
        return Err(NameError::Invalid {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Policy names end up as the first half of `policy.volume` on the storage
/// cluster, so a dot would make the backend name ambiguous.
pub fn validate_policy_name(name: &str) -> Result<(), NameError> {
    validate("policy", name, &['/', '.', '@'])
}

/// `@` separates image and snapshot in rbd specs.
pub fn validate_volume_name(name: &str) -> Result<(), NameError> {
    validate("volume", name, &['/', '@'])
}

/// Composite identity of a volume: `(policy, volume)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeName {
    pub policy: String,
    pub volume: String,
}

impl VolumeName {
    pub fn new(policy: &str, volume: &str) -> Result<Self, NameError> {
        validate_policy_name(policy)?;
        validate_volume_name(volume)?;
        Ok(Self {
            policy: policy.to_string(),
            volume: volume.to_string(),
        })
    }

    /// Parses the `policy/volume` form used on the plugin protocol.
    pub fn parse(s: &str) -> Result<Self, NameError> {
        let (policy, volume) = s
            .split_once('/')
            .ok_or_else(|| NameError::Malformed(s.to_string()))?;
        if policy.is_empty() || volume.is_empty() {
            return Err(NameError::Malformed(s.to_string()));
        }
        Self::new(policy, volume)
    }

    /// Name of the image on the storage cluster.
    pub fn backend_name(&self) -> String {
        format!("{}.{}", self.policy, self.volume)
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.policy, self.volume)
    }
}

impl FromStr for VolumeName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_policy_and_volume() {
        let name = VolumeName::parse("policy1/foo").unwrap();
        assert_eq!(name.policy, "policy1");
        assert_eq!(name.volume, "foo");
        assert_eq!(name.backend_name(), "policy1.foo");
        assert_eq!(name.to_string(), "policy1/foo");
    }

    #[test]
    fn reject_malformed_names() {
        for bad in ["foo", "/foo", "policy1/", "", "a/b/c", "pol.icy/foo", "p/fo@o"] {
            assert!(VolumeName::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn volume_part_may_contain_dots() {
        let name: VolumeName = "policy1/foo.bar".parse().unwrap();
        assert_eq!(name.backend_name(), "policy1.foo.bar");
    }
}
