use common::VolumeName;

/// Key layout under the store prefix.
///
/// ```text
/// <prefix>/global-config
/// <prefix>/policies/<policy>
/// <prefix>/volumes/<policy>/<volume>
/// <prefix>/mounts/<policy>/<volume>/<host>
/// <prefix>/supervisor/schedules/<policy>/<volume>
/// <prefix>/supervisor/owners/<policy>/<volume>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn global(&self) -> String {
        format!("{}/global-config", self.prefix)
    }

    pub fn policies(&self) -> String {
        format!("{}/policies/", self.prefix)
    }

    pub fn policy(&self, name: &str) -> String {
        format!("{}{name}", self.policies())
    }

    pub fn volumes(&self) -> String {
        format!("{}/volumes/", self.prefix)
    }

    pub fn policy_volumes(&self, policy: &str) -> String {
        format!("{}{policy}/", self.volumes())
    }

    pub fn volume(&self, name: &VolumeName) -> String {
        format!("{}{}/{}", self.volumes(), name.policy, name.volume)
    }

    pub fn mounts(&self) -> String {
        format!("{}/mounts/", self.prefix)
    }

    pub fn volume_mounts(&self, name: &VolumeName) -> String {
        format!("{}{}/{}/", self.mounts(), name.policy, name.volume)
    }

    pub fn mount(&self, name: &VolumeName, host: &str) -> String {
        format!("{}{host}", self.volume_mounts(name))
    }

    pub fn schedule(&self, name: &VolumeName) -> String {
        format!(
            "{}/supervisor/schedules/{}/{}",
            self.prefix, name.policy, name.volume
        )
    }

    pub fn owner(&self, name: &VolumeName) -> String {
        format!(
            "{}/supervisor/owners/{}/{}",
            self.prefix, name.policy, name.volume
        )
    }

    /// Recovers the volume name from a key under [`Keys::volumes`].
    pub fn parse_volume(&self, key: &str) -> Option<VolumeName> {
        let rest = key.strip_prefix(&self.volumes())?;
        let (policy, volume) = rest.split_once('/')?;
        VolumeName::new(policy, volume).ok()
    }

    /// Recovers `(volume, host)` from a key under [`Keys::mounts`].
    pub fn parse_mount(&self, key: &str) -> Option<(VolumeName, String)> {
        let rest = key.strip_prefix(&self.mounts())?;
        let mut parts = rest.splitn(3, '/');
        let policy = parts.next()?;
        let volume = parts.next()?;
        let host = parts.next()?;
        if host.is_empty() {
            return None;
        }
        Some((VolumeName::new(policy, volume).ok()?, host.to_string()))
    }

    pub fn parse_policy(&self, key: &str) -> Option<String> {
        let name = key.strip_prefix(&self.policies())?;
        (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_under_prefix() {
        let keys = Keys::new("/volplugin/");
        let name = VolumeName::parse("policy1/foo").unwrap();
        assert_eq!(keys.global(), "/volplugin/global-config");
        assert_eq!(keys.policy("policy1"), "/volplugin/policies/policy1");
        assert_eq!(keys.volume(&name), "/volplugin/volumes/policy1/foo");
        assert_eq!(keys.mount(&name, "mon0"), "/volplugin/mounts/policy1/foo/mon0");
        assert_eq!(
            keys.schedule(&name),
            "/volplugin/supervisor/schedules/policy1/foo"
        );
    }

    #[test]
    fn parse_keys_back() {
        let keys = Keys::new("/volplugin");
        let name = VolumeName::parse("policy1/foo").unwrap();
        assert_eq!(keys.parse_volume(&keys.volume(&name)), Some(name.clone()));
        assert_eq!(
            keys.parse_mount(&keys.mount(&name, "mon0")),
            Some((name, "mon0".to_string()))
        );
        assert_eq!(keys.parse_policy(&keys.policy("policy1")).as_deref(), Some("policy1"));
        assert_eq!(keys.parse_volume("/other/volumes/a/b"), None);
        assert_eq!(keys.parse_mount("/volplugin/mounts/a/b/"), None);
    }
}
