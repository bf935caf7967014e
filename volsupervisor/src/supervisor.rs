use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{GlobalConfig, Volume, VolumeName};
use libstorage::StorageDriver;
use libvolstore::{Client, StoreError, WatchEvent};
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::scheduler::{LoopContext, StateTable, VolumeLoop};

const LIST_BACKOFF_MIN: Duration = Duration::from_millis(100);
const LIST_BACKOFF_MAX: Duration = Duration::from_secs(5);

struct Running {
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs one [`VolumeLoop`] per declared volume and keeps the set in step
/// with the store.
pub struct Supervisor {
    client: Client,
    driver: Arc<dyn StorageDriver>,
    holder: String,
    global: watch::Receiver<GlobalConfig>,
    policies: watch::Sender<u64>,
    states: StateTable,
    running: HashMap<VolumeName, Running>,
    /// Teardown of removed volumes still in flight.
    cleanups: Vec<JoinHandle<()>>,
}

/// Volumes and the store revisions they were read at.
struct Listing {
    volumes: Vec<Volume>,
    policy_rev: i64,
    volume_rev: i64,
}

impl Supervisor {
    pub fn new(
        client: Client,
        driver: Arc<dyn StorageDriver>,
        holder: impl Into<String>,
        global: watch::Receiver<GlobalConfig>,
    ) -> Self {
        let (policies, _) = watch::channel(0);
        Self {
            client,
            driver,
            holder: holder.into(),
            global,
            policies,
            states: StateTable::default(),
            running: HashMap::new(),
            cleanups: Vec::new(),
        }
    }

    pub fn states(&self) -> StateTable {
        self.states.clone()
    }

    /// Supervises until `cancel` fires. An unreachable store delays the
    /// start instead of failing it.
    pub async fn run(mut self, cancel: CancellationToken) {
        let Some(listing) = self.initial_listing(&cancel).await else {
            info!("Supervisor stopped before the store could be read");
            return;
        };

        let mut policy_watch = self.client.watch_policies_from(listing.policy_rev + 1);
        let mut volume_watch = self.client.watch_volumes_from(listing.volume_rev + 1);
        for volume in listing.volumes {
            self.start(volume, &cancel);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ev = volume_watch.next() => match ev {
                    Some(ev) => self.on_volume_event(ev, &cancel).await,
                    None => break,
                },
                ev = policy_watch.next() => match ev {
                    Some(_) => {
                        self.policies.send_modify(|generation| *generation += 1);
                    }
                    None => break,
                },
            }
        }

        self.stop_all().await;
    }

    /// Reads policies and volumes, retrying with backoff until the store
    /// answers. `None` if cancelled first.
    async fn initial_listing(&self, cancel: &CancellationToken) -> Option<Listing> {
        let mut backoff = LIST_BACKOFF_MIN;
        loop {
            match self.list_once().await {
                Ok(listing) => return Some(listing),
                Err(e) => error!("Could not list volumes, retrying in {backoff:?}: {e}"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(LIST_BACKOFF_MAX);
        }
    }

    async fn list_once(&self) -> Result<Listing, StoreError> {
        let (policies, policy_rev) = self.client.list_policies().await?;
        let (volumes, volume_rev) = self.client.list_volumes().await?;
        info!(
            "Found {} policies and {} volumes",
            policies.len(),
            volumes.len()
        );
        Ok(Listing {
            volumes,
            policy_rev,
            volume_rev,
        })
    }

    async fn on_volume_event(&mut self, ev: WatchEvent<Volume>, cancel: &CancellationToken) {
        match ev {
            WatchEvent::Created { value, .. } | WatchEvent::Updated { value, .. } => {
                self.start(value, cancel);
            }
            WatchEvent::Deleted { key } => {
                if let Some(name) = self.client.keys().parse_volume(&key) {
                    self.remove(&name);
                }
            }
            WatchEvent::Resync(all) => {
                let live: HashMap<VolumeName, Volume> = all
                    .into_iter()
                    .map(|(_, v)| (v.volume_name(), v))
                    .collect();
                let gone: Vec<VolumeName> = self
                    .running
                    .keys()
                    .filter(|name| !live.contains_key(*name))
                    .cloned()
                    .collect();
                for name in gone {
                    self.remove(&name);
                }
                for volume in live.into_values() {
                    self.start(volume, cancel);
                }
            }
        }
    }

    /// Starts a loop for `volume` unless one for this incarnation runs already.
    fn start(&mut self, volume: Volume, cancel: &CancellationToken) {
        let name = volume.volume_name();
        if let Some(running) = self.running.get(&name) {
            if running.created_at == volume.created_at && !running.handle.is_finished() {
                return;
            }
            debug!("{name} was recreated, restarting its loop");
            running.cancel.cancel();
        }

        let ctx = LoopContext {
            client: self.client.clone(),
            driver: self.driver.clone(),
            holder: self.holder.clone(),
            global: self.global.clone(),
            policies: self.policies.subscribe(),
            states: self.states.clone(),
        };
        let child = cancel.child_token();
        let created_at = volume.created_at;
        let handle = tokio::spawn(VolumeLoop::new(ctx, volume, child.clone()).run());
        self.running.insert(
            name,
            Running {
                created_at,
                cancel: child,
                handle,
            },
        );
    }

    /// Stops the loop of a deleted volume and drops its schedule. Snapshots
    /// are left to whoever removed the volume.
    ///
    /// The loop may be inside a driver call, so waiting for it and deleting
    /// the schedule happen off the event loop.
    fn remove(&mut self, name: &VolumeName) {
        let running = self.running.remove(name);
        if let Some(running) = &running {
            running.cancel.cancel();
        }
        info!("Volume {name} removed, stopping its snapshots");

        let client = self.client.clone();
        let name = name.clone();
        self.cleanups.retain(|task| !task.is_finished());
        self.cleanups.push(tokio::spawn(async move {
            let created_at = match running {
                Some(running) => {
                    if let Err(e) = running.handle.await {
                        warn!("Loop of {name} ended abnormally: {e}");
                    }
                    Some(running.created_at)
                }
                None => None,
            };
            drop_schedule(&client, &name, created_at).await;
        }));
    }

    async fn stop_all(&mut self) {
        for running in self.running.values() {
            running.cancel.cancel();
        }
        for (name, running) in self.running.drain() {
            if let Err(e) = running.handle.await {
                warn!("Loop of {name} ended abnormally: {e}");
            }
        }
        for task in self.cleanups.drain(..) {
            if let Err(e) = task.await {
                warn!("Volume cleanup ended abnormally: {e}");
            }
        }
        info!("Supervisor stopped");
    }
}

/// Deletes the schedule of a removed volume unless it already belongs to a
/// newer volume of the same name.
async fn drop_schedule(client: &Client, name: &VolumeName, created_at: Option<DateTime<Utc>>) {
    match client.get_schedule(name).await {
        Ok(Some(state)) if created_at.is_some_and(|at| at != state.volume_created_at) => {
            debug!("Schedule of {name} belongs to a newer volume, keeping it");
        }
        Ok(Some(_)) => {
            if let Err(e) = client.delete_schedule(name).await {
                warn!("Could not delete schedule of {name}: {e}");
            }
        }
        Ok(None) => {}
        Err(e) => warn!("Could not read schedule of {name}: {e}"),
    }
}
