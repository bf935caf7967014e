use std::sync::{Arc, Once};

use common::GlobalConfig;
use libvolstore::{
    Client, KvBackend, MemoryBackend, debug_enabled, fetch_global, set_debug, spawn_global_watch,
};
use serial_test::serial;
use tokio::sync::watch;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .is_test(true)
            .try_init();
    });
}

fn setup() -> (Arc<MemoryBackend>, Client) {
    init_logging();
    set_debug(false);
    let backend = Arc::new(MemoryBackend::new());
    let client = Client::new(backend.clone(), "/volplugin");
    (backend, client)
}

fn config(debug: bool, ttl_secs: u64) -> GlobalConfig {
    GlobalConfig {
        debug,
        ttl_secs,
        ..GlobalConfig::default()
    }
}

async fn wait_until(
    rx: &mut watch::Receiver<GlobalConfig>,
    check: impl FnMut(&GlobalConfig) -> bool,
) {
    timeout(Duration::from_secs(5), rx.wait_for(check))
        .await
        .expect("global config did not change")
        .expect("global watch ended");
}

#[tokio::test]
#[serial]
async fn change_between_fetch_and_watch_is_applied() {
    let (_, client) = setup();
    client.set_global(&config(false, 30)).await.unwrap();
    let initial = fetch_global(&client).await;
    assert_eq!(initial.config.ttl_secs, 30);

    client.set_global(&config(false, 99)).await.unwrap();

    let cancel = CancellationToken::new();
    let (mut rx, task) = spawn_global_watch(&client, initial, false, cancel.clone());
    wait_until(&mut rx, |c| c.ttl_secs == 99).await;
    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
#[serial]
async fn created_record_replaces_defaults() {
    let (_, client) = setup();
    let initial = fetch_global(&client).await;
    assert_eq!(initial.config, GlobalConfig::default());
    assert_eq!(initial.revision, Some(0));

    let cancel = CancellationToken::new();
    let (mut rx, _task) = spawn_global_watch(&client, initial, false, cancel.clone());
    assert!(!debug_enabled());

    client.set_global(&config(true, 45)).await.unwrap();
    wait_until(&mut rx, |c| c.debug && c.ttl_secs == 45).await;
    assert!(debug_enabled());
    cancel.cancel();
}

#[tokio::test]
#[serial]
async fn deleted_record_reverts_to_defaults() {
    let (_, client) = setup();
    client.set_global(&config(true, 99)).await.unwrap();
    let initial = fetch_global(&client).await;

    let cancel = CancellationToken::new();
    let (mut rx, _task) = spawn_global_watch(&client, initial, false, cancel.clone());
    assert_eq!(rx.borrow().ttl_secs, 99);
    assert!(debug_enabled());

    client
        .remove::<GlobalConfig>(&client.keys().global())
        .await
        .unwrap();
    wait_until(&mut rx, |c| *c == GlobalConfig::default()).await;
    assert!(!debug_enabled());
    cancel.cancel();
}

#[tokio::test]
#[serial]
async fn compacted_history_resyncs_to_the_latest_record() {
    let (backend, client) = setup();
    client.set_global(&config(false, 10)).await.unwrap();
    let initial = fetch_global(&client).await;

    client.set_global(&config(false, 50)).await.unwrap();
    client.set_global(&config(false, 60)).await.unwrap();
    backend.compact(backend.revision().await).await;

    let cancel = CancellationToken::new();
    let (mut rx, _task) = spawn_global_watch(&client, initial, false, cancel.clone());
    wait_until(&mut rx, |c| c.ttl_secs == 60).await;
    cancel.cancel();
}

#[tokio::test]
#[serial]
async fn forced_debug_survives_store_updates() {
    let (_, client) = setup();
    client.set_global(&config(false, 30)).await.unwrap();
    let initial = fetch_global(&client).await;

    let cancel = CancellationToken::new();
    let (mut rx, _task) = spawn_global_watch(&client, initial, true, cancel.clone());
    assert!(rx.borrow().debug);
    assert!(debug_enabled());

    client.set_global(&config(false, 77)).await.unwrap();
    wait_until(&mut rx, |c| c.ttl_secs == 77).await;
    assert!(rx.borrow().debug);
    assert!(debug_enabled());

    client
        .remove::<GlobalConfig>(&client.keys().global())
        .await
        .unwrap();
    wait_until(&mut rx, |c| c.ttl_secs == GlobalConfig::default().ttl_secs).await;
    assert!(debug_enabled());
    cancel.cancel();
}

#[tokio::test]
#[serial]
async fn undecodable_record_is_treated_as_missing() {
    let (backend, client) = setup();
    backend
        .put(&client.keys().global(), b"not json".to_vec())
        .await
        .unwrap();

    let initial = fetch_global(&client).await;
    assert_eq!(initial.config, GlobalConfig::default());
    assert_eq!(initial.revision, Some(backend.revision().await));

    let cancel = CancellationToken::new();
    let (mut rx, _task) = spawn_global_watch(&client, initial, false, cancel.clone());
    client.set_global(&config(true, 20)).await.unwrap();
    wait_until(&mut rx, |c| c.debug && c.ttl_secs == 20).await;
    cancel.cancel();
}
