use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::backend::{KvBackend, KvEntry, RawEvent};
use crate::error::StoreError;

pub const DEFAULT_CAPACITY: usize = 128;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// A decoded change under a watched prefix.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Created { key: String, value: T },
    Updated { key: String, value: T },
    Deleted { key: String },
    /// Full state of the prefix after the stream had to be rebuilt. Events
    /// between the last delivered one and the snapshot were dropped, so the
    /// consumer reconciles against this list instead.
    Resync(Vec<(String, T)>),
}

/// Typed, restartable subscription to a key prefix.
///
/// A dedicated task owns the store subscription and feeds a bounded buffer.
/// After a disconnect it resubscribes from the revision after the last event
/// it delivered, so delivery is at-least-once. When the consumer lets the
/// buffer fill up, or the store compacted the revision the task wanted to
/// resume from, the subscription is dropped and replaced by a
/// [`WatchEvent::Resync`] snapshot. Dropping the stream stops the task.
pub struct WatchStream<T> {
    rx: mpsc::Receiver<WatchEvent<T>>,
    cancel: CancellationToken,
}

impl<T> WatchStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn spawn(
        backend: Arc<dyn KvBackend>,
        prefix: String,
        start_revision: i64,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let task = WatchTask {
            backend,
            prefix,
            next_revision: start_revision,
            tx,
            cancel: cancel.clone(),
            _marker: PhantomData,
        };
        tokio::spawn(task.run());
        Self { rx, cancel }
    }

    pub async fn next(&mut self) -> Option<WatchEvent<T>> {
        self.rx.recv().await
    }
}

impl<T> Stream for WatchStream<T> {
    type Item = WatchEvent<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<T> Drop for WatchStream<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Outcome {
    /// Subscription ended or failed; resubscribe after a backoff.
    Lost,
    /// Rebuild from a snapshot, then resubscribe.
    Resync,
    Stop,
}

struct WatchTask<T> {
    backend: Arc<dyn KvBackend>,
    prefix: String,
    next_revision: i64,
    tx: mpsc::Sender<WatchEvent<T>>,
    cancel: CancellationToken,
    _marker: PhantomData<fn() -> T>,
}

impl<T> WatchTask<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let outcome = self.follow(&mut backoff).await;
            match outcome {
                Outcome::Stop => break,
                Outcome::Resync => {
                    if !self.resync().await {
                        break;
                    }
                }
                Outcome::Lost => {
                    if !self.pause(backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
        debug!("watch on {} stopped", self.prefix);
    }

    /// Subscribes from `next_revision` and forwards events until the
    /// subscription ends.
    async fn follow(&mut self, backoff: &mut Duration) -> Outcome {
        let subscribe = self.backend.watch(&self.prefix, self.next_revision);
        let subscribed = tokio::select! {
            _ = self.cancel.cancelled() => return Outcome::Stop,
            res = subscribe => res,
        };
        let mut stream = match subscribed {
            Ok(stream) => stream,
            Err(StoreError::Compacted(rev)) => {
                warn!(
                    "watch on {} from revision {} is past compaction ({rev}), resyncing",
                    self.prefix, self.next_revision
                );
                return Outcome::Resync;
            }
            Err(e) => {
                error!("Failed to establish watch on {}: {e}", self.prefix);
                return Outcome::Lost;
            }
        };
        *backoff = INITIAL_BACKOFF;

        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return Outcome::Stop,
                item = stream.next() => item,
            };
            let batch = match item {
                None => {
                    warn!("watch on {} ended, resubscribing", self.prefix);
                    return Outcome::Lost;
                }
                Some(Err(StoreError::Compacted(rev))) => {
                    warn!("watch on {} hit compaction at {rev}, resyncing", self.prefix);
                    return Outcome::Resync;
                }
                Some(Err(e)) => {
                    error!("watch stream error on {}: {e}", self.prefix);
                    return Outcome::Lost;
                }
                Some(Ok(batch)) => batch,
            };

            for raw in batch.events {
                let revision = raw.revision();
                let Some(event) = decode::<T>(raw) else {
                    self.next_revision = revision + 1;
                    continue;
                };
                match self.tx.try_send(event) {
                    Ok(()) => self.next_revision = revision + 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "consumer of {} is falling behind, dropping watch to resync",
                            self.prefix
                        );
                        return Outcome::Resync;
                    }
                    Err(TrySendError::Closed(_)) => return Outcome::Stop,
                }
            }
        }
    }

    /// Waits for buffer space, then delivers a snapshot of the prefix and
    /// moves `next_revision` past it. Returns false when the task must stop.
    async fn resync(&mut self) -> bool {
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            permit = self.tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        let mut backoff = INITIAL_BACKOFF;
        loop {
            let listed = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                res = self.backend.list(&self.prefix) => res,
            };
            match listed {
                Ok((entries, revision)) => {
                    let snapshot = entries.into_iter().filter_map(decode_entry).collect();
                    permit.send(WatchEvent::Resync(snapshot));
                    self.next_revision = revision + 1;
                    return true;
                }
                Err(e) => {
                    error!("Failed to list {} for resync: {e}", self.prefix);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        _ = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn pause(&self, d: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(d) => true,
        }
    }
}

fn decode_entry<T: DeserializeOwned>(kv: KvEntry) -> Option<(String, T)> {
    match serde_json::from_slice(&kv.value) {
        Ok(value) => Some((kv.key, value)),
        Err(e) => {
            warn!("Ignoring bad record at {}: {e}", kv.key);
            None
        }
    }
}

fn decode<T: DeserializeOwned>(raw: RawEvent) -> Option<WatchEvent<T>> {
    match raw {
        RawEvent::Delete { key, .. } => Some(WatchEvent::Deleted { key }),
        RawEvent::Put(kv) => {
            let created = kv.version == 1;
            let (key, value) = decode_entry(kv)?;
            Some(if created {
                WatchEvent::Created { key, value }
            } else {
                WatchEvent::Updated { key, value }
            })
        }
    }
}
