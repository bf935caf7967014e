use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{GlobalConfig, Policy, SchedulerState, Volume, VolumeName, after, snapshot_name};
use libstorage::StorageDriver;
use libvolstore::Client;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Wait before re-reading a policy the store could not deliver.
const STORE_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Snapshotting is disabled for the volume's policy.
    Idle,
    Scheduled,
    Snapshotting,
    Pruning,
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Current state of every volume loop, readable from outside the loops.
#[derive(Debug, Default, Clone)]
pub struct StateTable {
    inner: Arc<Mutex<HashMap<VolumeName, LoopState>>>,
}

impl StateTable {
    pub fn get(&self, name: &VolumeName) -> Option<LoopState> {
        self.lock().get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().values().filter(|s| **s != LoopState::Stopped).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set(&self, name: &VolumeName, state: LoopState) {
        self.lock().insert(name.clone(), state);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<VolumeName, LoopState>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// What a volume loop shares with the rest of the supervisor.
#[derive(Clone)]
pub struct LoopContext {
    pub client: Client,
    pub driver: Arc<dyn StorageDriver>,
    /// Identity written into ownership claims.
    pub holder: String,
    pub global: watch::Receiver<GlobalConfig>,
    /// Bumped whenever any policy changes.
    pub policies: watch::Receiver<u64>,
    pub states: StateTable,
}

enum Fired {
    /// The snapshot was taken and the phase recorded.
    Done,
    /// Nothing was recorded; try again one period from now.
    Retry,
}

/// Scheduling loop of one volume.
///
/// Each round re-reads the volume's policy and persisted phase from the store,
/// sleeps until the next firing and then snapshots and prunes. A firing that
/// failed is retried one period later; a phase that fell due while nobody was
/// running fires once, not once per missed period.
pub struct VolumeLoop {
    ctx: LoopContext,
    volume: Volume,
    name: VolumeName,
    cancel: CancellationToken,
    retry_at: Option<DateTime<Utc>>,
    /// Last firing of this loop, kept even when recording it failed.
    last_fired: Option<DateTime<Utc>>,
}

impl VolumeLoop {
    pub fn new(ctx: LoopContext, volume: Volume, cancel: CancellationToken) -> Self {
        let name = volume.volume_name();
        Self {
            ctx,
            volume,
            name,
            cancel,
            retry_at: None,
            last_fired: None,
        }
    }

    fn enter(&self, state: LoopState) {
        debug!("{}: {state}", self.name);
        self.ctx.states.set(&self.name, state);
    }

    pub async fn run(mut self) {
        info!("Supervising {}", self.name);
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let policy = match self.ctx.client.get_policy(&self.name.policy).await {
                Ok(Some(policy)) => policy,
                Ok(None) => {
                    warn!("{}: policy {} does not exist", self.name, self.name.policy);
                    self.enter(LoopState::Idle);
                    if !self.wait_policy_change(None).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!("{}: could not read policy: {e}", self.name);
                    if !self.wait_policy_change(Some(STORE_RETRY)).await {
                        break;
                    }
                    continue;
                }
            };

            if !policy.snapshot.enabled {
                self.enter(LoopState::Idle);
                self.retry_at = None;
                if !self.wait_policy_change(None).await {
                    break;
                }
                continue;
            }

            self.enter(LoopState::Scheduled);
            let due = match self.next_due(&policy).await {
                Some(due) => due,
                None => {
                    if !self.wait_policy_change(Some(STORE_RETRY)).await {
                        break;
                    }
                    continue;
                }
            };
            let wait = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if !wait.is_zero() {
                debug!("{}: next snapshot at {due}", self.name);
                // a policy change may move the due time; re-derive it
                if !self.wait_policy_change(Some(wait)).await {
                    break;
                }
                if Utc::now() < due {
                    continue;
                }
            }

            match self.fire(&policy).await {
                Fired::Done => self.retry_at = None,
                Fired::Retry => {
                    self.retry_at = Some(after(Utc::now(), policy.snapshot.frequency));
                }
            }
        }
        self.enter(LoopState::Stopped);
        info!("Stopped supervising {}", self.name);
    }

    /// Next firing from the persisted phase, or from the volume's creation
    /// when the stored phase is missing or belongs to an earlier volume of
    /// the same name.
    async fn next_due(&self, policy: &Policy) -> Option<DateTime<Utc>> {
        let state = match self.ctx.client.get_schedule(&self.name).await {
            Ok(Some(state)) if state.belongs_to(&self.volume) => state,
            Ok(_) => SchedulerState::for_volume(&self.volume),
            Err(e) => {
                error!("{}: could not read schedule: {e}", self.name);
                return None;
            }
        };
        let frequency = policy.snapshot.frequency;
        let mut due = state.next_due(frequency);
        if let Some(fired) = self.last_fired {
            due = due.max(after(fired, frequency));
        }
        if let Some(retry) = self.retry_at {
            due = due.max(retry);
        }
        Some(due)
    }

    async fn fire(&mut self, policy: &Policy) -> Fired {
        let ttl = Duration::from_secs(self.ctx.global.borrow().ttl_secs.max(1));
        match self
            .ctx
            .client
            .claim_volume(&self.name, &self.ctx.holder, ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("{}: owned by another supervisor", self.name);
                return Fired::Retry;
            }
            Err(e) => {
                error!("{}: could not claim ownership: {e}", self.name);
                return Fired::Retry;
            }
        }

        // another supervisor may have fired while this one was asleep
        if let Ok(Some(state)) = self.ctx.client.get_schedule(&self.name).await {
            if state.belongs_to(&self.volume)
                && state.next_due(policy.snapshot.frequency) > Utc::now()
            {
                return Fired::Done;
            }
        }

        let backend = self.name.backend_name();
        let now = Utc::now();
        let snap = snapshot_name(now);

        self.enter(LoopState::Snapshotting);
        if let Err(e) = self.ctx.driver.snapshot(&backend, &policy.driver, &snap).await {
            error!("{}: snapshot {snap} failed: {e}", self.name);
            return Fired::Retry;
        }
        debug!("{}: took snapshot {snap}", self.name);

        self.enter(LoopState::Pruning);
        let snapshots = match self.ctx.driver.list_snapshots(&backend, &policy.driver).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!("{}: listing snapshots failed: {e}", self.name);
                return Fired::Retry;
            }
        };

        self.last_fired = Some(now);
        let state = SchedulerState {
            volume_created_at: self.volume.created_at,
            last_fired: Some(now),
        };
        if let Err(e) = self.ctx.client.set_schedule(&self.name, &state).await {
            error!("{}: could not record schedule: {e}", self.name);
        }

        let excess = policy.snapshot.excess(snapshots.len());
        for old in snapshots.iter().take(excess) {
            match self
                .ctx
                .driver
                .delete_snapshot(&backend, &policy.driver, old)
                .await
            {
                Ok(()) => debug!("{}: pruned snapshot {old}", self.name),
                Err(e) => warn!("{}: could not prune snapshot {old}: {e}", self.name),
            }
        }
        Fired::Done
    }

    /// Sleeps for `limit` (forever if `None`) or until a policy changes.
    /// Returns false when the loop has to stop.
    async fn wait_policy_change(&mut self, limit: Option<Duration>) -> bool {
        let timer = async {
            match limit {
                Some(d) => sleep(d).await,
                None => std::future::pending().await,
            }
        };
        let policies = &mut self.ctx.policies;
        let changed = async {
            if policies.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = timer => true,
            _ = changed => true,
        }
    }
}
