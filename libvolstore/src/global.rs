use std::sync::atomic::{AtomicBool, Ordering};

use common::GlobalConfig;
use log::{LevelFilter, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::watch::WatchEvent;

static DEBUG: AtomicBool = AtomicBool::new(false);

/// Switches process-wide log verbosity. The logger itself must be built
/// with a filter at least as permissive as `Debug` for this to take effect.
pub fn set_debug(on: bool) {
    let was = DEBUG.swap(on, Ordering::SeqCst);
    log::set_max_level(if on {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    if was != on {
        info!("Debug logging {}", if on { "enabled" } else { "disabled" });
    }
}

pub fn debug_enabled() -> bool {
    DEBUG.load(Ordering::SeqCst)
}

/// The global config as read at `revision`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalSnapshot {
    pub config: GlobalConfig,
    /// `None` when the store could not be read; the watch then starts from now.
    pub revision: Option<i64>,
}

/// Reads the global config, falling back to defaults when none was stored
/// or it cannot be decoded.
pub async fn fetch_global(client: &Client) -> GlobalSnapshot {
    match client.get_global_at().await {
        Ok((Some(config), revision)) => GlobalSnapshot {
            config,
            revision: Some(revision),
        },
        Ok((None, revision)) => {
            warn!("Global configuration is missing; using defaults");
            GlobalSnapshot {
                config: GlobalConfig::default(),
                revision: Some(revision),
            }
        }
        Err(e) => {
            warn!("Could not read global configuration: {e}; using defaults");
            GlobalSnapshot {
                config: GlobalConfig::default(),
                revision: None,
            }
        }
    }
}

/// Applies `initial`, then follows the global-config record from the
/// revision after it for the life of the process. The returned receiver
/// always holds the config in effect; a deleted record reverts to defaults.
/// With `force_debug` set, debug logging stays on whatever the store says.
pub fn spawn_global_watch(
    client: &Client,
    initial: GlobalSnapshot,
    force_debug: bool,
    cancel: CancellationToken,
) -> (watch::Receiver<GlobalConfig>, JoinHandle<()>) {
    let effective = move |mut config: GlobalConfig| {
        config.debug |= force_debug;
        config
    };
    let first = effective(initial.config);
    set_debug(first.debug);
    let (tx, rx) = watch::channel(first);
    let mut stream = client.watch_global_from(initial.revision.map_or(0, |rev| rev + 1));

    let handle = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = stream.next() => ev,
            };
            let next = match event {
                None => break,
                Some(
                    WatchEvent::Created { value, .. } | WatchEvent::Updated { value, .. },
                ) => value,
                Some(WatchEvent::Deleted { .. }) => {
                    warn!("Global configuration was removed; reverting to defaults");
                    GlobalConfig::default()
                }
                Some(WatchEvent::Resync(mut all)) => match all.pop() {
                    Some((_, value)) => value,
                    None => GlobalConfig::default(),
                },
            };
            let next = effective(next);
            set_debug(next.debug);
            tx.send_replace(next);
        }
    });

    (rx, handle)
}
