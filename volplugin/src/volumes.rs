use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use common::{DriverOptions, GlobalConfig, MountState, Policy, Volume, VolumeName};
use libstorage::StorageDriver;
use libvolstore::Client;
use log::{info, warn};
use tokio::sync::watch;

use crate::error::ApiError;
use crate::locks::VolumeLocks;

/// Volume lifecycle operations shared by the plugin protocol and volcli.
///
/// Every mutating call holds the volume's lock for its whole duration, so
/// requests for one volume are serialized on this host. Across hosts the
/// store's create-if-absent on the volume record decides races.
pub struct Volumes {
    client: Client,
    driver: Arc<dyn StorageDriver>,
    host: String,
    instance: String,
    global: watch::Receiver<GlobalConfig>,
    locks: VolumeLocks,
}

impl Volumes {
    pub fn new(
        client: Client,
        driver: Arc<dyn StorageDriver>,
        host: impl Into<String>,
        instance: impl Into<String>,
        global: watch::Receiver<GlobalConfig>,
    ) -> Self {
        Self {
            client,
            driver,
            host: host.into(),
            instance: instance.into(),
            global,
            locks: VolumeLocks::new(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn driver(&self) -> Arc<dyn StorageDriver> {
        self.driver.clone()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn locks(&self) -> &VolumeLocks {
        &self.locks
    }

    /// Where `name` is mounted on this host.
    pub fn mountpoint(&self, name: &VolumeName) -> PathBuf {
        self.global
            .borrow()
            .mount_base
            .join(&name.policy)
            .join(&name.volume)
    }

    async fn policy(&self, name: &str) -> Result<Policy, ApiError> {
        self.client
            .get_policy(name)
            .await?
            .ok_or_else(|| ApiError::PolicyNotFound(name.to_string()))
    }

    async fn volume(&self, name: &VolumeName) -> Result<Volume, ApiError> {
        self.client
            .get_volume(name)
            .await?
            .ok_or_else(|| ApiError::VolumeNotFound(name.to_string()))
    }

    /// Driver options of the volume's policy. Policies are not deleted while
    /// volumes reference them, but an unreadable one should not keep a
    /// volume from being unmounted.
    async fn driver_options(&self, name: &VolumeName) -> DriverOptions {
        match self.client.get_policy(&name.policy).await {
            Ok(Some(policy)) => policy.driver,
            Ok(None) => {
                warn!("Policy {} of {name} is gone; using default driver options", name.policy);
                DriverOptions::default()
            }
            Err(e) => {
                warn!(
                    "Could not read policy {} of {name}: {e}; using default driver options",
                    name.policy
                );
                DriverOptions::default()
            }
        }
    }

    pub async fn create(
        &self,
        name: &str,
        opts: &HashMap<String, String>,
    ) -> Result<Volume, ApiError> {
        let name = VolumeName::parse(name)?;
        let policy = self.policy(&name.policy).await?;
        let size_mb = match opts.get("size") {
            Some(v) => v
                .parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| ApiError::InvalidOption {
                    key: "size".to_string(),
                    value: v.clone(),
                })?,
            None => policy.driver.size_mb,
        };

        let _guard = self.locks.lock(&name).await;
        let volume = Volume::new(&name, size_mb, Utc::now());
        if !self.client.create_volume(&volume).await? {
            return Err(ApiError::VolumeExists(name));
        }

        if let Err(e) = self
            .driver
            .create(&name.backend_name(), &policy.driver, size_mb)
            .await
        {
            if let Err(rollback) = self.client.delete_volume(&name).await {
                warn!("Failed to roll back record of {name}: {rollback}");
            }
            return Err(e.into());
        }
        info!("Created volume {name} ({size_mb} MB)");
        Ok(volume)
    }

    pub async fn remove(&self, name: &str) -> Result<Volume, ApiError> {
        let name = VolumeName::parse(name)?;
        let _guard = self.locks.lock(&name).await;
        self.volume(&name).await?;
        if let Some(m) = self.client.volume_mounts(&name).await?.into_iter().next() {
            return Err(ApiError::VolumeMounted {
                name,
                host: m.host,
            });
        }
        let opts = self.driver_options(&name).await;

        let Some(volume) = self.client.delete_volume(&name).await? else {
            return Err(ApiError::VolumeNotFound(name.to_string()));
        };
        match self.driver.remove(&name.backend_name(), &opts).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!("Backing image of {name} was already gone");
            }
            Err(e) => {
                if let Err(restore) = self.client.create_volume(&volume).await {
                    warn!("Failed to restore record of {name}: {restore}");
                }
                return Err(e.into());
            }
        }
        info!("Removed volume {name}");
        Ok(volume)
    }

    /// Mounts the volume on this host, or joins an existing mount.
    pub async fn mount(&self, name: &str, id: &str) -> Result<PathBuf, ApiError> {
        let name = VolumeName::parse(name)?;
        let _guard = self.locks.lock(&name).await;
        self.volume(&name).await?;

        let mut local = None;
        for m in self.client.volume_mounts(&name).await? {
            if m.host == self.host {
                local = Some(m);
            } else {
                return Err(ApiError::VolumeMounted {
                    name,
                    host: m.host,
                });
            }
        }

        if let Some(mut state) = local {
            if state.acquire(id) {
                self.client.set_mount(&name, &state).await?;
            }
            return Ok(state.mountpoint);
        }

        let opts = self.driver_options(&name).await;
        let mountpoint = self.mountpoint(&name);
        let info = self
            .driver
            .mount(&name.backend_name(), &opts, &mountpoint)
            .await?;
        let state = MountState {
            host: self.host.clone(),
            owner: self.instance.clone(),
            mount_ids: vec![id.to_string()],
            mountpoint: info.mountpoint.clone(),
            device: Some(info.device),
            mounted_at: Utc::now(),
        };
        if let Err(e) = self.client.set_mount(&name, &state).await {
            if let Err(undo) = self
                .driver
                .unmount(&name.backend_name(), &opts, &info.mountpoint)
                .await
            {
                warn!("Failed to undo mount of {name}: {undo}");
            }
            return Err(e.into());
        }
        info!("Mounted {name} at {}", info.mountpoint.display());
        Ok(info.mountpoint)
    }

    /// Releases `id`'s hold on the volume; the last release unmounts it.
    /// Unmounting a volume that is not mounted here succeeds.
    pub async fn unmount(&self, name: &str, id: &str) -> Result<(), ApiError> {
        let name = VolumeName::parse(name)?;
        let _guard = self.locks.lock(&name).await;
        let Some(mut state) = self.client.get_mount(&name, &self.host).await? else {
            return Ok(());
        };
        if !state.release(id) {
            self.client.set_mount(&name, &state).await?;
            return Ok(());
        }

        let opts = self.driver_options(&name).await;
        self.driver
            .unmount(&name.backend_name(), &opts, &state.mountpoint)
            .await?;
        self.client.delete_mount(&name, &self.host).await?;
        info!("Unmounted {name}");
        Ok(())
    }

    /// The volume's mountpoint on this host, if mounted here.
    pub async fn path(&self, name: &str) -> Result<Option<PathBuf>, ApiError> {
        let name = VolumeName::parse(name)?;
        self.volume(&name).await?;
        Ok(self.local_mountpoint(&name).await?)
    }

    pub async fn get(&self, name: &str) -> Result<(Volume, Option<PathBuf>), ApiError> {
        let name = VolumeName::parse(name)?;
        let volume = self.volume(&name).await?;
        let mountpoint = self.local_mountpoint(&name).await?;
        Ok((volume, mountpoint))
    }

    pub async fn list(&self) -> Result<Vec<(Volume, Option<PathBuf>)>, ApiError> {
        let (volumes, _) = self.client.list_volumes().await?;
        let mounts: HashMap<VolumeName, PathBuf> = self
            .client
            .host_mounts(&self.host)
            .await?
            .into_iter()
            .map(|(name, state)| (name, state.mountpoint))
            .collect();
        Ok(volumes
            .into_iter()
            .map(|v| {
                let mp = mounts.get(&v.volume_name()).cloned();
                (v, mp)
            })
            .collect())
    }

    async fn local_mountpoint(
        &self,
        name: &VolumeName,
    ) -> Result<Option<PathBuf>, libvolstore::StoreError> {
        Ok(self
            .client
            .get_mount(name, &self.host)
            .await?
            .map(|m| m.mountpoint))
    }
}

/// Recovers a volume name from its backend name, `policy.volume`.
pub fn from_backend_name(backend: &str) -> Option<VolumeName> {
    let (policy, volume) = backend.split_once('.')?;
    VolumeName::new(policy, volume).ok()
}

pub(crate) fn display(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Intent;
    use libstorage::{FakeDriver, FakeOp};
    use libvolstore::MemoryBackend;

    struct Fixture {
        volumes: Volumes,
        driver: Arc<FakeDriver>,
    }

    async fn fixture(host: &str) -> Fixture {
        let client = Client::new(Arc::new(MemoryBackend::new()), "/volplugin");
        client.upload_intent("policy1", Intent::default()).await.unwrap();
        fixture_with(client, host)
    }

    fn fixture_with(client: Client, host: &str) -> Fixture {
        let driver = Arc::new(FakeDriver::new());
        let (_, rx) = watch::channel(GlobalConfig::default());
        Fixture {
            volumes: Volumes::new(client, driver.clone(), host, "instance-1", rx),
            driver,
        }
    }

    fn no_opts() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn create_requires_policy_and_unique_name() {
        let f = fixture("mon0").await;
        assert!(matches!(
            f.volumes.create("nopolicy/foo", &no_opts()).await,
            Err(ApiError::PolicyNotFound(_))
        ));
        f.volumes.create("policy1/foo", &no_opts()).await.unwrap();
        assert!(f.driver.exists("policy1.foo"));
        assert!(matches!(
            f.volumes.create("policy1/foo", &no_opts()).await,
            Err(ApiError::VolumeExists(_))
        ));
    }

    #[tokio::test]
    async fn create_honours_size_option() {
        let f = fixture("mon0").await;
        let opts = HashMap::from([("size".to_string(), "20".to_string())]);
        assert_eq!(f.volumes.create("policy1/foo", &opts).await.unwrap().size_mb, 20);

        let bad = HashMap::from([("size".to_string(), "lots".to_string())]);
        assert!(matches!(
            f.volumes.create("policy1/bar", &bad).await,
            Err(ApiError::InvalidOption { .. })
        ));
    }

    #[tokio::test]
    async fn failed_backend_create_leaves_no_record() {
        let f = fixture("mon0").await;
        f.driver.set_failing(FakeOp::Create, true);
        assert!(f.volumes.create("policy1/foo", &no_opts()).await.is_err());
        let name = VolumeName::parse("policy1/foo").unwrap();
        assert!(f.volumes.client().get_volume(&name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mounts_are_reference_counted() {
        let f = fixture("mon0").await;
        f.volumes.create("policy1/foo", &no_opts()).await.unwrap();
        let a = f.volumes.mount("policy1/foo", "c1").await.unwrap();
        let b = f.volumes.mount("policy1/foo", "c2").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a, PathBuf::from("/mnt/ceph/policy1/foo"));

        f.volumes.unmount("policy1/foo", "c1").await.unwrap();
        assert_eq!(f.driver.mounted().await.unwrap().len(), 1);
        f.volumes.unmount("policy1/foo", "c2").await.unwrap();
        assert!(f.driver.mounted().await.unwrap().is_empty());
        assert_eq!(f.volumes.path("policy1/foo").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unmount_without_mount_succeeds() {
        let f = fixture("mon0").await;
        f.volumes.create("policy1/foo", &no_opts()).await.unwrap();
        f.volumes.unmount("policy1/foo", "c1").await.unwrap();
        f.volumes.unmount("policy1/foo", "c1").await.unwrap();
    }

    #[tokio::test]
    async fn mount_on_other_host_is_refused() {
        let f = fixture("mon0").await;
        f.volumes.create("policy1/foo", &no_opts()).await.unwrap();
        f.volumes.mount("policy1/foo", "c1").await.unwrap();

        let other = fixture_with(f.volumes.client().clone(), "mon1");
        match other.volumes.mount("policy1/foo", "c9").await {
            Err(ApiError::VolumeMounted { host, .. }) => assert_eq!(host, "mon0"),
            res => panic!("unexpected {res:?}"),
        }
    }

    #[tokio::test]
    async fn remove_refuses_mounted_volume() {
        let f = fixture("mon0").await;
        f.volumes.create("policy1/foo", &no_opts()).await.unwrap();
        f.volumes.mount("policy1/foo", "c1").await.unwrap();
        assert!(matches!(
            f.volumes.remove("policy1/foo").await,
            Err(ApiError::VolumeMounted { .. })
        ));
        f.volumes.unmount("policy1/foo", "c1").await.unwrap();
        f.volumes.remove("policy1/foo").await.unwrap();
        assert!(!f.driver.exists("policy1.foo"));
        assert!(matches!(
            f.volumes.get("policy1/foo").await,
            Err(ApiError::VolumeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_backend_remove_restores_record() {
        let f = fixture("mon0").await;
        f.volumes.create("policy1/foo", &no_opts()).await.unwrap();
        f.driver.set_failing(FakeOp::Remove, true);
        assert!(matches!(
            f.volumes.remove("policy1/foo").await,
            Err(ApiError::Driver(_))
        ));
        assert!(f.volumes.get("policy1/foo").await.is_ok());
    }

    #[tokio::test]
    async fn malformed_names_are_rejected() {
        let f = fixture("mon0").await;
        assert!(matches!(
            f.volumes.create("foo", &no_opts()).await,
            Err(ApiError::Name(_))
        ));
        assert!(matches!(
            f.volumes.path("policy1/missing").await,
            Err(ApiError::VolumeNotFound(_))
        ));
    }

    #[test]
    fn backend_names_map_back() {
        assert_eq!(
            from_backend_name("policy1.foo.bar"),
            Some(VolumeName::parse("policy1/foo.bar").unwrap())
        );
        assert_eq!(from_backend_name("nodot"), None);
    }
}
