//! Coordination core shared by volplugin, volsupervisor and volcli.
//!
//! [`Client`] is the only path to persistent state: policies, volumes,
//! mount records, scheduler state and the global config all live in an
//! etcd-compatible store under a configurable prefix. [`WatchStream`] turns a
//! key prefix into a typed, restartable stream of changes.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod global;
pub mod keys;
pub mod watch;

pub use backend::{
    KvBackend, KvEntry, RawBatch, RawEvent, memory::MemoryBackend, xline::XlineBackend,
};
pub use client::Client;
pub use config::{StoreConfig, load_config};
pub use error::StoreError;
pub use global::{GlobalSnapshot, debug_enabled, fetch_global, set_debug, spawn_global_watch};
pub use keys::Keys;
pub use watch::{WatchEvent, WatchStream};
