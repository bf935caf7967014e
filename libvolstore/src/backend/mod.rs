use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::StoreError;

pub mod memory;
pub mod xline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// 1 on the write that created the key.
    pub version: i64,
    pub mod_revision: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    Put(KvEntry),
    Delete { key: String, mod_revision: i64 },
}

impl RawEvent {
    pub fn key(&self) -> &str {
        match self {
            RawEvent::Put(kv) => &kv.key,
            RawEvent::Delete { key, .. } => key,
        }
    }

    pub fn revision(&self) -> i64 {
        match self {
            RawEvent::Put(kv) => kv.mod_revision,
            RawEvent::Delete { mod_revision, .. } => *mod_revision,
        }
    }
}

/// Events of one watch response, in commit order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBatch {
    pub events: Vec<RawEvent>,
}

pub type RawWatch = BoxStream<'static, Result<RawBatch, StoreError>>;

/// The operations the coordination core needs from a strongly-ordered
/// key-value store. Every call may fail transiently.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError>;

    /// All entries under `prefix`, with the store revision they were read at.
    async fn list(&self, prefix: &str) -> Result<(Vec<KvEntry>, i64), StoreError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Writes `value` only if `key` does not exist yet.
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError>;

    /// Deletes `key`, returning the entry it held.
    async fn delete(&self, key: &str) -> Result<Option<KvEntry>, StoreError>;

    /// First-writer-wins lease on `key`. Succeeds if the key is free or
    /// already held by `holder`, in which case the lease is renewed for `ttl`.
    async fn claim(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Changes under `prefix` from `start_revision` on; 0 means "from now".
    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<RawWatch, StoreError>;
}
