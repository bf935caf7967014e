use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{DriverOptions, GlobalConfig, Intent, SnapshotPolicy, Volume, VolumeName};
use libstorage::{DriverError, FakeDriver, FakeOp, MountInfo, StorageDriver};
use libvolstore::backend::RawWatch;
use libvolstore::{Client, KvBackend, KvEntry, MemoryBackend, StoreError};
use serial_test::serial;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use volsupervisor::{LoopState, StateTable, Supervisor};

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .is_test(true)
            .try_init();
    });
}

struct Harness {
    client: Client,
    driver: Arc<FakeDriver>,
}

struct Running {
    states: StateTable,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.cancel.cancel();
        self.handle.await.unwrap();
    }
}

fn snapshots(enabled: bool, frequency: Duration, keep_min: u32, keep_max: u32) -> Intent {
    Intent {
        snapshot: SnapshotPolicy {
            enabled,
            frequency,
            keep_min,
            keep_max,
        },
        ..Intent::default()
    }
}

/// Memory store whose schedule writes and listings can be made to fail.
struct FlakyBackend {
    inner: MemoryBackend,
    fail_schedule_writes: AtomicBool,
    /// Number of upcoming listings that fail.
    failing_lists: AtomicUsize,
}

impl FlakyBackend {
    fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            fail_schedule_writes: AtomicBool::new(false),
            failing_lists: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl KvBackend for FlakyBackend {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<(Vec<KvEntry>, i64), StoreError> {
        let fail = self
            .failing_lists
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(StoreError::Disconnected);
        }
        self.inner.list(prefix).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        if key.contains("/supervisor/schedules/")
            && self.fail_schedule_writes.load(Ordering::SeqCst)
        {
            return Err(StoreError::Disconnected);
        }
        self.inner.put(key, value).await
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        self.inner.create(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        self.inner.delete(key).await
    }

    async fn claim(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.inner.claim(key, holder, ttl).await
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<RawWatch, StoreError> {
        self.inner.watch(prefix, start_revision).await
    }
}

/// Fake driver whose snapshots of one image take `delay`.
struct SlowDriver {
    inner: Arc<FakeDriver>,
    slow: String,
    delay: Duration,
}

#[async_trait]
impl StorageDriver for SlowDriver {
    async fn create(
        &self,
        name: &str,
        opts: &DriverOptions,
        size_mb: u64,
    ) -> Result<(), DriverError> {
        self.inner.create(name, opts, size_mb).await
    }

    async fn remove(&self, name: &str, opts: &DriverOptions) -> Result<(), DriverError> {
        self.inner.remove(name, opts).await
    }

    async fn mount(
        &self,
        name: &str,
        opts: &DriverOptions,
        mountpoint: &Path,
    ) -> Result<MountInfo, DriverError> {
        self.inner.mount(name, opts, mountpoint).await
    }

    async fn unmount(
        &self,
        name: &str,
        opts: &DriverOptions,
        mountpoint: &Path,
    ) -> Result<(), DriverError> {
        self.inner.unmount(name, opts, mountpoint).await
    }

    async fn snapshot(
        &self,
        name: &str,
        opts: &DriverOptions,
        snap: &str,
    ) -> Result<(), DriverError> {
        if name == self.slow {
            sleep(self.delay).await;
        }
        self.inner.snapshot(name, opts, snap).await
    }

    async fn list_snapshots(
        &self,
        name: &str,
        opts: &DriverOptions,
    ) -> Result<Vec<String>, DriverError> {
        self.inner.list_snapshots(name, opts).await
    }

    async fn delete_snapshot(
        &self,
        name: &str,
        opts: &DriverOptions,
        snap: &str,
    ) -> Result<(), DriverError> {
        self.inner.delete_snapshot(name, opts, snap).await
    }

    async fn mounted(&self) -> Result<Vec<MountInfo>, DriverError> {
        self.inner.mounted().await
    }
}

impl Harness {
    fn new() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()))
    }

    fn with_backend(backend: Arc<dyn KvBackend>) -> Self {
        init_logging();
        Self {
            client: Client::new(backend, "/volplugin"),
            driver: Arc::new(FakeDriver::new()),
        }
    }

    async fn volume(&self, name: &str) -> VolumeName {
        let name = VolumeName::parse(name).unwrap();
        let policy = self.client.get_policy(&name.policy).await.unwrap().unwrap();
        self.driver
            .create(&name.backend_name(), &policy.driver, 10)
            .await
            .unwrap();
        assert!(
            self.client
                .create_volume(&Volume::new(&name, 10, Utc::now()))
                .await
                .unwrap()
        );
        name
    }

    fn start(&self, holder: &str) -> Running {
        self.start_with(holder, self.driver.clone())
    }

    fn start_with(&self, holder: &str, driver: Arc<dyn StorageDriver>) -> Running {
        let (_, global) = watch::channel(GlobalConfig::default());
        let supervisor = Supervisor::new(self.client.clone(), driver, holder, global);
        let states = supervisor.states();
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { supervisor.run(cancel).await })
        };
        Running {
            states,
            cancel,
            handle,
        }
    }

    async fn snapshot_count(&self, name: &VolumeName) -> usize {
        let policy = self.client.get_policy(&name.policy).await.unwrap().unwrap();
        self.driver
            .list_snapshots(&name.backend_name(), &policy.driver)
            .await
            .unwrap()
            .len()
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
#[serial]
async fn snapshots_follow_the_policy_frequency() {
    let h = Harness::new();
    h.client
        .upload_intent("policy1", snapshots(true, Duration::from_millis(100), 1, 20))
        .await
        .unwrap();
    let name = h.volume("policy1/foo").await;

    let started = Instant::now();
    let running = h.start("sup-1");
    sleep(Duration::from_millis(550)).await;
    running.stop().await;
    let elapsed = started.elapsed();

    let taken = h.driver.snapshots_taken();
    assert!(taken >= 2, "only {taken} snapshots");
    assert!(taken as u128 <= elapsed.as_millis() / 100 + 1, "{taken} in {elapsed:?}");
    assert_eq!(h.snapshot_count(&name).await, taken);
    let state = h.client.get_schedule(&name).await.unwrap().unwrap();
    assert!(state.last_fired.is_some());
}

#[tokio::test]
#[serial]
async fn retention_keeps_between_min_and_max() {
    let h = Harness::new();
    h.client
        .upload_intent("policy1", snapshots(true, Duration::from_millis(40), 5, 10))
        .await
        .unwrap();
    let name = h.volume("policy1/foo").await;

    let running = h.start("sup-1");
    eventually("fourteen snapshots", || async { h.driver.snapshots_taken() >= 14 }).await;
    running.stop().await;

    let kept = h.snapshot_count(&name).await;
    assert!((5..=10).contains(&kept), "{kept} snapshots kept");
    assert_eq!(kept, 10);
}

#[tokio::test]
#[serial]
async fn disabled_policy_idles_until_enabled() {
    let h = Harness::new();
    h.client
        .upload_intent("policy1", snapshots(false, Duration::from_millis(100), 1, 20))
        .await
        .unwrap();
    let name = h.volume("policy1/foo").await;

    let running = h.start("sup-1");
    sleep(Duration::from_millis(400)).await;
    assert_eq!(h.driver.snapshots_taken(), 0);
    assert_eq!(running.states.get(&name), Some(LoopState::Idle));

    h.client
        .upload_intent("policy1", snapshots(true, Duration::from_millis(100), 1, 20))
        .await
        .unwrap();
    eventually("a snapshot after enabling", || async {
        h.driver.snapshots_taken() > 0
    })
    .await;
    running.stop().await;
}

#[tokio::test]
#[serial]
async fn failed_snapshot_is_not_recorded_and_retried() {
    let h = Harness::new();
    h.client
        .upload_intent("policy1", snapshots(true, Duration::from_millis(100), 1, 20))
        .await
        .unwrap();
    let name = h.volume("policy1/foo").await;
    h.driver.set_failing(FakeOp::Snapshot, true);

    let running = h.start("sup-1");
    sleep(Duration::from_millis(350)).await;
    assert_eq!(h.driver.snapshots_taken(), 0);
    let fired = h
        .client
        .get_schedule(&name)
        .await
        .unwrap()
        .and_then(|s| s.last_fired);
    assert_eq!(fired, None);

    h.driver.set_failing(FakeOp::Snapshot, false);
    eventually("a snapshot once the driver recovers", || async {
        h.driver.snapshots_taken() > 0
    })
    .await;
    eventually("the firing to be recorded", || async {
        matches!(h.client.get_schedule(&name).await, Ok(Some(s)) if s.last_fired.is_some())
    })
    .await;
    running.stop().await;
}

#[tokio::test]
#[serial]
async fn listing_failure_does_not_record_the_firing() {
    let h = Harness::new();
    h.client
        .upload_intent("policy1", snapshots(true, Duration::from_millis(100), 1, 20))
        .await
        .unwrap();
    let name = h.volume("policy1/foo").await;
    h.driver.set_failing(FakeOp::ListSnapshots, true);

    let running = h.start("sup-1");
    eventually("a snapshot", || async { h.driver.snapshots_taken() > 0 }).await;
    running.stop().await;

    let fired = h
        .client
        .get_schedule(&name)
        .await
        .unwrap()
        .and_then(|s| s.last_fired);
    assert_eq!(fired, None);
}

#[tokio::test]
#[serial]
async fn removed_volume_stops_its_loop() {
    let h = Harness::new();
    h.client
        .upload_intent("policy1", snapshots(true, Duration::from_millis(100), 1, 20))
        .await
        .unwrap();
    let name = h.volume("policy1/foo").await;
    let other = h.volume("policy1/bar").await;

    let running = h.start("sup-1");
    eventually("both volumes snapshotted", || async {
        h.client.get_schedule(&name).await.unwrap().is_some()
            && h.client.get_schedule(&other).await.unwrap().is_some()
    })
    .await;

    h.client.delete_volume(&name).await.unwrap();
    eventually("the loop to stop", || async {
        running.states.get(&name) == Some(LoopState::Stopped)
    })
    .await;
    eventually("the schedule to be dropped", || async {
        h.client.get_schedule(&name).await.unwrap().is_none()
    })
    .await;
    assert_eq!(running.states.len(), 1);

    let policy = h.client.get_policy("policy1").await.unwrap().unwrap();
    h.driver.remove(&name.backend_name(), &policy.driver).await.unwrap();
    let err = h
        .driver
        .list_snapshots(&name.backend_name(), &policy.driver)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    // the remaining volume keeps its cadence
    let before = h.snapshot_count(&other).await;
    eventually("another snapshot of the remaining volume", || async {
        h.snapshot_count(&other).await > before
    })
    .await;
    running.stop().await;
}

#[tokio::test]
#[serial]
async fn restart_resumes_phase_without_a_burst() {
    let h = Harness::new();
    h.client
        .upload_intent("policy1", snapshots(true, Duration::from_millis(400), 1, 20))
        .await
        .unwrap();
    let name = h.volume("policy1/foo").await;

    let running = h.start("sup-1");
    eventually("the first snapshot", || async { h.driver.snapshots_taken() >= 1 }).await;
    running.stop().await;
    let before = h.driver.snapshots_taken();

    // several periods pass with nobody running
    sleep(Duration::from_millis(1300)).await;

    let running = h.start("sup-1");
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.driver.snapshots_taken(), before + 1);

    eventually("the next period", || async {
        h.driver.snapshots_taken() >= before + 2
    })
    .await;
    running.stop().await;
    assert!(h.snapshot_count(&name).await >= before + 2);
}

#[tokio::test]
#[serial]
async fn two_supervisors_do_not_duplicate() {
    let h = Harness::new();
    h.client
        .upload_intent("policy1", snapshots(true, Duration::from_millis(100), 1, 50))
        .await
        .unwrap();
    let name = h.volume("policy1/foo").await;

    let started = Instant::now();
    let a = h.start("sup-a");
    let b = h.start("sup-b");
    sleep(Duration::from_millis(650)).await;
    a.stop().await;
    b.stop().await;
    let elapsed = started.elapsed();

    let taken = h.driver.snapshots_taken();
    assert!(taken >= 2, "only {taken} snapshots");
    assert!(taken as u128 <= elapsed.as_millis() / 100 + 1, "{taken} in {elapsed:?}");
    assert_eq!(h.snapshot_count(&name).await, taken);
}

#[tokio::test]
#[serial]
async fn unrecorded_firing_keeps_the_cadence() {
    let backend = Arc::new(FlakyBackend::new());
    let h = Harness::with_backend(backend.clone());
    h.client
        .upload_intent("policy1", snapshots(true, Duration::from_millis(200), 1, 50))
        .await
        .unwrap();
    let name = h.volume("policy1/foo").await;
    backend.fail_schedule_writes.store(true, Ordering::SeqCst);

    let started = Instant::now();
    let running = h.start("sup-1");
    sleep(Duration::from_millis(700)).await;
    running.stop().await;
    let elapsed = started.elapsed();

    let taken = h.driver.snapshots_taken();
    assert!(taken >= 2, "only {taken} snapshots");
    assert!(taken as u128 <= elapsed.as_millis() / 200 + 1, "{taken} in {elapsed:?}");
    assert_eq!(h.client.get_schedule(&name).await.unwrap(), None);
}

#[tokio::test]
#[serial]
async fn unreachable_store_delays_the_start() {
    let backend = Arc::new(FlakyBackend::new());
    let h = Harness::with_backend(backend.clone());
    h.client
        .upload_intent("policy1", snapshots(true, Duration::from_millis(100), 1, 20))
        .await
        .unwrap();
    let name = h.volume("policy1/foo").await;
    backend.failing_lists.store(2, Ordering::SeqCst);

    let running = h.start("sup-1");
    eventually("a snapshot after the store recovers", || async {
        h.driver.snapshots_taken() > 0
    })
    .await;
    assert_eq!(backend.failing_lists.load(Ordering::SeqCst), 0);
    assert!(!running.handle.is_finished());
    running.stop().await;
    assert!(h.snapshot_count(&name).await > 0);
}

#[tokio::test]
#[serial]
async fn cancelled_before_the_store_answers() {
    let backend = Arc::new(FlakyBackend::new());
    let h = Harness::with_backend(backend.clone());
    backend.failing_lists.store(usize::MAX, Ordering::SeqCst);

    let running = h.start("sup-1");
    sleep(Duration::from_millis(300)).await;
    assert!(!running.handle.is_finished());
    tokio::time::timeout(Duration::from_secs(1), running.stop())
        .await
        .expect("supervisor did not stop");
}

#[tokio::test]
#[serial]
async fn slow_removal_does_not_hold_up_other_volumes() {
    let h = Harness::new();
    h.client
        .upload_intent("policy1", snapshots(true, Duration::from_millis(100), 1, 20))
        .await
        .unwrap();
    let slow = h.volume("policy1/slow").await;
    let delay = Duration::from_secs(3);
    let driver = Arc::new(SlowDriver {
        inner: h.driver.clone(),
        slow: slow.backend_name(),
        delay,
    });

    let running = h.start_with("sup-1", driver);
    eventually("the slow snapshot to begin", || async {
        running.states.get(&slow) == Some(LoopState::Snapshotting)
    })
    .await;

    let started = Instant::now();
    h.client.delete_volume(&slow).await.unwrap();
    let fresh = h.volume("policy1/fresh").await;
    eventually("a snapshot of the new volume", || async {
        h.snapshot_count(&fresh).await > 0
    })
    .await;
    assert!(started.elapsed() < delay, "took {:?}", started.elapsed());

    eventually("the removed volume's schedule to be dropped", || async {
        running.states.get(&slow) == Some(LoopState::Stopped)
            && h.client.get_schedule(&slow).await.unwrap().is_none()
    })
    .await;
    running.stop().await;
}

#[tokio::test]
#[serial]
async fn recreated_volume_follows_the_new_policy() {
    let h = Harness::new();
    h.client
        .upload_intent("policy1", snapshots(true, Duration::from_millis(100), 1, 20))
        .await
        .unwrap();
    let name = h.volume("policy1/foo").await;

    let running = h.start("sup-1");
    eventually("a snapshot", || async { h.driver.snapshots_taken() > 0 }).await;

    let policy = h.client.get_policy("policy1").await.unwrap().unwrap();
    h.client.delete_volume(&name).await.unwrap();
    h.driver.remove(&name.backend_name(), &policy.driver).await.unwrap();
    eventually("the old loop to stop", || async {
        running.states.get(&name) == Some(LoopState::Stopped)
    })
    .await;

    h.client
        .upload_intent("policy1", snapshots(false, Duration::from_millis(100), 1, 20))
        .await
        .unwrap();
    let name = h.volume("policy1/foo").await;
    let taken = h.driver.snapshots_taken();

    eventually("the new volume to idle", || async {
        running.states.get(&name) == Some(LoopState::Idle)
    })
    .await;
    sleep(Duration::from_millis(400)).await;
    assert_eq!(h.driver.snapshots_taken(), taken);
    assert_eq!(h.snapshot_count(&name).await, 0);
    assert_eq!(running.states.get(&name), Some(LoopState::Idle));
    running.stop().await;
}

#[tokio::test]
#[serial]
async fn rewritten_volume_restarts_its_phase() {
    let h = Harness::new();
    h.client
        .upload_intent("policy1", snapshots(true, Duration::from_millis(400), 1, 20))
        .await
        .unwrap();
    let name = h.volume("policy1/foo").await;

    let running = h.start("sup-1");
    eventually("the first snapshot", || async { h.driver.snapshots_taken() >= 1 }).await;
    let taken = h.driver.snapshots_taken();

    let created_at = Utc::now();
    h.client
        .set(&h.client.keys().volume(&name), &Volume::new(&name, 10, created_at))
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.driver.snapshots_taken(), taken);

    eventually("a firing of the new volume", || async {
        matches!(
            h.client.get_schedule(&name).await,
            Ok(Some(s)) if s.volume_created_at == created_at && s.last_fired.is_some()
        )
    })
    .await;
    running.stop().await;
}

#[tokio::test]
#[serial]
async fn fastsnap_scenario() {
    let h = Harness::new();
    h.client
        .upload_intent("fastsnap", snapshots(true, Duration::from_secs(1), 5, 10))
        .await
        .unwrap();
    let name = h.volume("fastsnap/foo").await;
    let running = h.start("sup-1");

    sleep(Duration::from_secs(4)).await;
    assert!(h.snapshot_count(&name).await >= 2);

    sleep(Duration::from_secs(15)).await;
    eventually("the count to settle within the keep window", || async {
        (5..=10).contains(&h.snapshot_count(&name).await)
    })
    .await;
    running.stop().await;
    assert!((5..=10).contains(&h.snapshot_count(&name).await));
}
