use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::DriverOptions;
use libstorage::DriverError;
use libvolstore::StoreError;
use log::{debug, error, warn};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::volumes::{Volumes, from_backend_name};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Corrections made by one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Backend mounts this host had no record for.
    pub unmounted: usize,
    /// Records for mounts the backend no longer has.
    pub cleared: usize,
    /// Volumes skipped because a request was working on them.
    pub busy: usize,
}

/// Periodically brings this host's mounts and its mount records back in line.
///
/// The loop never waits on a volume lock: a volume a request handler is
/// working on is skipped until the next pass.
pub struct Reconciler {
    volumes: Arc<Volumes>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(volumes: Arc<Volumes>, interval: Duration) -> Self {
        Self { volumes, interval }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.reconcile_once().await {
                Ok(report) if report != Report::default() => debug!("reconcile: {report:?}"),
                Ok(_) => {}
                Err(e) => error!("Mount reconciliation failed: {e}"),
            }
        }
        debug!("reconciler stopped");
    }

    pub async fn reconcile_once(&self) -> Result<Report, ReconcileError> {
        let started = Utc::now();
        let client = self.volumes.client();
        let driver = self.volumes.driver();
        let host = self.volumes.host();

        let actual = driver.mounted().await?;
        let desired = client.host_mounts(host).await?;

        let actual_names: HashSet<&str> = actual.iter().map(|m| m.name.as_str()).collect();
        let desired_names: HashSet<String> =
            desired.iter().map(|(name, _)| name.backend_name()).collect();

        let mut report = Report::default();

        for mount in actual.iter().filter(|m| !desired_names.contains(&m.name)) {
            let Some(name) = from_backend_name(&mount.name) else {
                debug!("ignoring foreign mapping {}", mount.name);
                continue;
            };
            let Some(_guard) = self.volumes.locks().try_lock(&name) else {
                report.busy += 1;
                continue;
            };
            // a mount may have completed since the snapshot was taken
            if client.get_mount(&name, host).await?.is_some() {
                continue;
            }
            let opts = DriverOptions {
                pool: mount.pool.clone(),
                ..DriverOptions::default()
            };
            match driver.unmount(&mount.name, &opts, &mount.mountpoint).await {
                Ok(()) => {
                    warn!(
                        "Unmounted {name} from {}: no mount record for this host",
                        mount.mountpoint.display()
                    );
                    report.unmounted += 1;
                }
                Err(e) => error!("Could not unmount undesired {name}: {e}"),
            }
        }

        for (name, _) in desired
            .iter()
            .filter(|(name, _)| !actual_names.contains(name.backend_name().as_str()))
        {
            let Some(_guard) = self.volumes.locks().try_lock(name) else {
                report.busy += 1;
                continue;
            };
            let Some(current) = client.get_mount(name, host).await? else {
                continue;
            };
            if current.mounted_at >= started {
                continue;
            }
            warn!(
                "Clearing stale mount record of {name} on {host} (owner {}): not mounted",
                current.owner
            );
            client.delete_mount(name, host).await?;
            report.cleared += 1;
        }

        Ok(report)
    }
}
