use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;

use crate::backend::{KvBackend, KvEntry, RawBatch, RawEvent, RawWatch};
use crate::error::StoreError;

const FANOUT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Fanout {
    Batch(RawBatch),
    Disconnect,
}

#[derive(Debug)]
struct Stored {
    entry: KvEntry,
    expires: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    data: BTreeMap<String, Stored>,
    revision: i64,
    compacted: i64,
    history: Vec<RawEvent>,
}

impl State {
    fn live(&self, key: &str) -> Option<&KvEntry> {
        self.data
            .get(key)
            .filter(|s| s.expires.is_none_or(|at| at > Instant::now()))
            .map(|s| &s.entry)
    }

    fn write(&mut self, key: &str, value: Vec<u8>, expires: Option<Instant>) -> RawEvent {
        self.revision += 1;
        let version = self.live(key).map_or(0, |e| e.version) + 1;
        let entry = KvEntry {
            key: key.to_string(),
            value,
            version,
            mod_revision: self.revision,
        };
        self.data.insert(
            key.to_string(),
            Stored {
                entry: entry.clone(),
                expires,
            },
        );
        let ev = RawEvent::Put(entry);
        self.history.push(ev.clone());
        ev
    }

    fn remove(&mut self, key: &str) -> Option<(KvEntry, RawEvent)> {
        let prev = self.live(key).cloned();
        self.data.remove(key);
        let prev = prev?;
        self.revision += 1;
        let ev = RawEvent::Delete {
            key: key.to_string(),
            mod_revision: self.revision,
        };
        self.history.push(ev.clone());
        Some((prev, ev))
    }
}

/// In-process [`KvBackend`] with etcd-like revisions and watch replay.
///
/// Used by tests and single-node runs without an etcd cluster. Leased keys
/// expire lazily: once past their deadline they read as absent.
pub struct MemoryBackend {
    state: Mutex<State>,
    fanout: broadcast::Sender<Fanout>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            fanout,
        }
    }

    pub async fn revision(&self) -> i64 {
        self.state.lock().await.revision
    }

    /// Discards history up to and including `revision`; watches starting at or
    /// before it fail with [`StoreError::Compacted`].
    pub async fn compact(&self, revision: i64) {
        let mut st = self.state.lock().await;
        let revision = revision.min(st.revision);
        st.history.retain(|ev| ev.revision() > revision);
        st.compacted = st.compacted.max(revision);
    }

    /// Ends every open watch stream with an error, as a lost connection would.
    pub fn disconnect_watchers(&self) {
        let _ = self.fanout.send(Fanout::Disconnect);
    }

    fn publish(&self, ev: RawEvent) {
        let _ = self.fanout.send(Fanout::Batch(RawBatch { events: vec![ev] }));
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        Ok(self.state.lock().await.live(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<(Vec<KvEntry>, i64), StoreError> {
        let st = self.state.lock().await;
        let entries = st
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter_map(|(k, _)| st.live(k).cloned())
            .collect();
        Ok((entries, st.revision))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut st = self.state.lock().await;
        let ev = st.write(key, value, None);
        self.publish(ev);
        Ok(())
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        let mut st = self.state.lock().await;
        if st.live(key).is_some() {
            return Ok(false);
        }
        let ev = st.write(key, value, None);
        self.publish(ev);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        let mut st = self.state.lock().await;
        Ok(st.remove(key).map(|(prev, ev)| {
            self.publish(ev);
            prev
        }))
    }

    async fn claim(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut st = self.state.lock().await;
        let held_by_other = st
            .live(key)
            .is_some_and(|e| e.value.as_slice() != holder.as_bytes());
        if held_by_other {
            return Ok(false);
        }
        let ev = st.write(key, holder.as_bytes().to_vec(), Some(Instant::now() + ttl));
        self.publish(ev);
        Ok(true)
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<RawWatch, StoreError> {
        let (replay, rx) = {
            let st = self.state.lock().await;
            if start_revision > 0 && start_revision <= st.compacted {
                return Err(StoreError::Compacted(st.compacted));
            }
            let start = if start_revision > 0 {
                start_revision
            } else {
                st.revision + 1
            };
            let replay: Vec<Result<RawBatch, StoreError>> = st
                .history
                .iter()
                .filter(|ev| ev.revision() >= start && ev.key().starts_with(prefix))
                .map(|ev| {
                    Ok(RawBatch {
                        events: vec![ev.clone()],
                    })
                })
                .collect();
            // subscribe while still holding the lock so nothing falls between
            // the replayed history and the live feed
            (replay, self.fanout.subscribe())
        };

        let prefix = prefix.to_string();
        let live = stream::unfold(Some(rx), move |rx| {
            let prefix = prefix.clone();
            async move {
                let mut rx = rx?;
                loop {
                    match rx.recv().await {
                        Ok(Fanout::Batch(batch)) => {
                            let events: Vec<_> = batch
                                .events
                                .into_iter()
                                .filter(|ev| ev.key().starts_with(&prefix))
                                .collect();
                            if !events.is_empty() {
                                return Some((Ok(RawBatch { events }), Some(rx)));
                            }
                        }
                        Ok(Fanout::Disconnect) => {
                            return Some((Err(StoreError::Disconnected), None));
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            return Some((Err(StoreError::Lagged(n)), None));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream::iter(replay).chain(live).boxed())
    }
}
