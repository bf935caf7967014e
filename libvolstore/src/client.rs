use std::sync::Arc;
use std::time::Duration;

use common::{GlobalConfig, Intent, MountState, Policy, SchedulerState, Volume, VolumeName};
use log::{info, warn};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::sleep;

use crate::backend::{KvBackend, KvEntry, xline::XlineBackend};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::keys::Keys;
use crate::watch::{DEFAULT_CAPACITY, WatchStream};

const CONNECT_BASE_DELAY: Duration = Duration::from_millis(100);
const CONNECT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Typed access to every record volplugin keeps in the config store.
#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn KvBackend>,
    keys: Keys,
}

impl Client {
    pub fn new(backend: Arc<dyn KvBackend>, prefix: &str) -> Self {
        Self {
            backend,
            keys: Keys::new(prefix),
        }
    }

    /// Connects to the etcd cluster, retrying forever with jittered
    /// exponential backoff. Daemons have nothing useful to do without the
    /// store, so an unreachable cluster is waited out rather than reported.
    pub async fn connect(config: &StoreConfig) -> Self {
        let mut attempt = 0u32;
        loop {
            match XlineBackend::connect(config).await {
                Ok(backend) => {
                    info!("Connected to config store at {:?}", config.endpoints);
                    return Self::new(Arc::new(backend), &config.prefix);
                }
                Err(e) => {
                    let delay = connect_delay(attempt);
                    warn!(
                        "Could not establish client to etcd cluster: {e}. Retrying in {delay:?}"
                    );
                    sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    pub fn backend(&self) -> Arc<dyn KvBackend> {
        self.backend.clone()
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.backend
            .get(key)
            .await?
            .map(|kv| decode(&kv))
            .transpose()
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.backend.put(key, serde_json::to_vec(value)?).await
    }

    pub async fn create<T: Serialize>(&self, key: &str, value: &T) -> Result<bool, StoreError> {
        self.backend.create(key, serde_json::to_vec(value)?).await
    }

    pub async fn remove<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.backend
            .delete(key)
            .await?
            .map(|kv| decode(&kv))
            .transpose()
    }

    /// Decodes every record under `prefix`, skipping ones that do not parse.
    pub async fn list<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<(Vec<(String, T)>, i64), StoreError> {
        let (entries, revision) = self.backend.list(prefix).await?;
        let mut items = Vec::with_capacity(entries.len());
        for kv in entries {
            match decode(&kv) {
                Ok(value) => items.push((kv.key, value)),
                Err(e) => warn!("Ignoring bad record: {e}"),
            }
        }
        Ok((items, revision))
    }

    /// Watches `prefix` starting from the current revision.
    pub fn watch<T: DeserializeOwned + Send + 'static>(&self, prefix: &str) -> WatchStream<T> {
        self.watch_from(prefix, 0)
    }

    /// Watches `prefix` from `revision`, typically one past a prior [`Client::list`].
    pub fn watch_from<T: DeserializeOwned + Send + 'static>(
        &self,
        prefix: &str,
        revision: i64,
    ) -> WatchStream<T> {
        WatchStream::spawn(
            self.backend.clone(),
            prefix.to_string(),
            revision,
            DEFAULT_CAPACITY,
        )
    }

    pub async fn get_global(&self) -> Result<Option<GlobalConfig>, StoreError> {
        self.get(&self.keys.global()).await
    }

    pub async fn set_global(&self, global: &GlobalConfig) -> Result<(), StoreError> {
        self.set(&self.keys.global(), global).await
    }

    pub async fn get_policy(&self, name: &str) -> Result<Option<Policy>, StoreError> {
        self.get(&self.keys.policy(name)).await
    }

    pub async fn list_policies(&self) -> Result<(Vec<Policy>, i64), StoreError> {
        let (items, rev) = self.list::<Policy>(&self.keys.policies()).await?;
        Ok((items.into_iter().map(|(_, p)| p).collect(), rev))
    }

    /// Validates an uploaded intent and stores the resulting policy,
    /// replacing any previous version of it.
    pub async fn upload_intent(&self, name: &str, intent: Intent) -> Result<Policy, StoreError> {
        let policy = intent.validate(name)?;
        self.set(&self.keys.policy(name), &policy).await?;
        info!("Uploaded policy {name}");
        Ok(policy)
    }

    /// Deletes a policy; refused while volumes still reference it.
    pub async fn delete_policy(&self, name: &str) -> Result<Option<Policy>, StoreError> {
        let (volumes, _) = self
            .list::<Volume>(&self.keys.policy_volumes(name))
            .await?;
        if !volumes.is_empty() {
            return Err(StoreError::PolicyInUse {
                policy: name.to_string(),
                count: volumes.len(),
            });
        }
        self.remove(&self.keys.policy(name)).await
    }

    pub async fn get_volume(&self, name: &VolumeName) -> Result<Option<Volume>, StoreError> {
        self.get(&self.keys.volume(name)).await
    }

    pub async fn list_volumes(&self) -> Result<(Vec<Volume>, i64), StoreError> {
        let (items, rev) = self.list::<Volume>(&self.keys.volumes()).await?;
        Ok((items.into_iter().map(|(_, v)| v).collect(), rev))
    }

    /// Returns false if a volume with that name already exists.
    pub async fn create_volume(&self, volume: &Volume) -> Result<bool, StoreError> {
        self.create(&self.keys.volume(&volume.volume_name()), volume)
            .await
    }

    pub async fn delete_volume(&self, name: &VolumeName) -> Result<Option<Volume>, StoreError> {
        self.remove(&self.keys.volume(name)).await
    }

    pub fn watch_volumes_from(&self, revision: i64) -> WatchStream<Volume> {
        self.watch_from(&self.keys.volumes(), revision)
    }

    pub fn watch_policies_from(&self, revision: i64) -> WatchStream<Policy> {
        self.watch_from(&self.keys.policies(), revision)
    }

    /// The global config together with the revision it was read at, so a
    /// watch can resume right after it.
    pub async fn get_global_at(&self) -> Result<(Option<GlobalConfig>, i64), StoreError> {
        let global = self.keys.global();
        let (items, rev) = self.list::<GlobalConfig>(&global).await?;
        let value = items
            .into_iter()
            .find_map(|(key, value)| (key == global).then_some(value));
        Ok((value, rev))
    }

    pub fn watch_global_from(&self, revision: i64) -> WatchStream<GlobalConfig> {
        self.watch_from(&self.keys.global(), revision)
    }

    pub async fn get_mount(
        &self,
        name: &VolumeName,
        host: &str,
    ) -> Result<Option<MountState>, StoreError> {
        self.get(&self.keys.mount(name, host)).await
    }

    pub async fn set_mount(&self, name: &VolumeName, state: &MountState) -> Result<(), StoreError> {
        self.set(&self.keys.mount(name, &state.host), state).await
    }

    pub async fn delete_mount(
        &self,
        name: &VolumeName,
        host: &str,
    ) -> Result<Option<MountState>, StoreError> {
        self.remove(&self.keys.mount(name, host)).await
    }

    /// Mount records of one volume, across all hosts.
    pub async fn volume_mounts(&self, name: &VolumeName) -> Result<Vec<MountState>, StoreError> {
        let (items, _) = self
            .list::<MountState>(&self.keys.volume_mounts(name))
            .await?;
        Ok(items.into_iter().map(|(_, m)| m).collect())
    }

    /// Mount records held by `host`, across all volumes.
    pub async fn host_mounts(
        &self,
        host: &str,
    ) -> Result<Vec<(VolumeName, MountState)>, StoreError> {
        let (items, _) = self.list::<MountState>(&self.keys.mounts()).await?;
        Ok(items
            .into_iter()
            .filter_map(|(key, state)| {
                let (name, key_host) = self.keys.parse_mount(&key)?;
                (key_host == host).then_some((name, state))
            })
            .collect())
    }

    pub async fn get_schedule(
        &self,
        name: &VolumeName,
    ) -> Result<Option<SchedulerState>, StoreError> {
        self.get(&self.keys.schedule(name)).await
    }

    pub async fn set_schedule(
        &self,
        name: &VolumeName,
        state: &SchedulerState,
    ) -> Result<(), StoreError> {
        self.set(&self.keys.schedule(name), state).await
    }

    pub async fn delete_schedule(&self, name: &VolumeName) -> Result<(), StoreError> {
        self.backend.delete(&self.keys.schedule(name)).await?;
        Ok(())
    }

    /// Claims (or renews) ownership of a volume's snapshot schedule.
    pub async fn claim_volume(
        &self,
        name: &VolumeName,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.backend
            .claim(&self.keys.owner(name), holder, ttl)
            .await
    }
}

fn decode<T: DeserializeOwned>(kv: &KvEntry) -> Result<T, StoreError> {
    serde_json::from_slice(&kv.value).map_err(|source| StoreError::Decode {
        key: kv.key.clone(),
        source,
    })
}

/// Delay before connection attempt `attempt + 1`: exponential from 100ms,
/// capped at 10s, then scaled by a random factor in `[0.5, 1.5)`.
pub fn connect_delay(attempt: u32) -> Duration {
    let exp = CONNECT_BASE_DELAY.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(CONNECT_MAX_DELAY);
    let factor: f64 = rand::rng().random_range(0.5..1.5);
    capped.mul_f64(factor)
}
