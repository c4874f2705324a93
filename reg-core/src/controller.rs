//! The single-threaded dispatcher binding a controller session's task
//! queue, reconnect loop, booking maps, and backup cadence (spec §4.2).
//!
//! One [`RegistryController`] is constructed per `open()` call and torn
//! down on `close()`; the facade hands it a fresh [`Arc`] every time the
//! registry reopens (spec §4.1, §9 "State machine").

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use reg_config::RegistryOptions;
use reg_primitives::UrlKey;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::booking::{ClusterBooking, ConfigBooking};
use crate::driver::{
    BackupDatum, BackupStore, ClusterHandler, ConfigHandler, RegistryDriver, ShardRecordSerde,
};
use crate::error::RegistryError;
use crate::queue::TaskQueue;
use crate::registion::Registion;
use crate::task::{Completion, Task, TaskKind, VoidCompletion, VoidFuture};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Bound on how long `unregister()` waits for its drain batch to finish
/// during `close()` before giving up on the stragglers (spec §9 "bounded
/// time" per S6; not itself named in §4.2.3's pseudocode).
const CLOSE_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Bound on a single task's execution while the controller is closing. A
/// driver hook that never resolves (S6) would otherwise wedge the
/// single-threaded dispatcher forever; outside of `close()`, tasks retry
/// indefinitely per §5 with no such bound.
const CLOSE_TASK_TIMEOUT: Duration = Duration::from_secs(2);

/// A scheduled reconnect attempt, the in-memory analogue of spec §3's
/// `ReconnectTask`: the state needed to resume
/// [`RegistryController::attempt_reconnect`], plus the absolute expiration
/// time the dispatch loop polls.
struct PendingReconnect {
    attempts: u32,
    max: i64,
    /// Only the very first reconnect (the one `open()` is waiting on)
    /// carries a completion; reconnects after a later disconnect resolve
    /// nothing, they just flip `connected` back on.
    completion: Option<VoidCompletion>,
    expires_at: Instant,
}

/// Binds task queue, reconnect state, and booking maps to one session
/// (spec §4.2). Exclusively owned by its dispatcher worker except for the
/// thread-safe maps and atomics noted in spec §5.
pub struct RegistryController {
    name: String,
    options: RegistryOptions,
    driver: Arc<dyn RegistryDriver>,
    backup: Option<Arc<dyn BackupStore>>,
    tasks: TaskQueue,
    connected: AtomicBool,
    dirty: AtomicBool,
    closing: AtomicBool,
    reconnect: Mutex<Option<PendingReconnect>>,
    registrations: Arc<DashMap<String, Arc<Registion>>>,
    clusters: DashMap<String, Arc<ClusterBooking>>,
    configs: DashMap<String, Arc<ConfigBooking>>,
    restored: Mutex<Option<BackupDatum>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RegistryController {
    /// Constructs a controller bound to `registrations` (owned by the
    /// facade, shared so `recover()`/`unregister()` can walk it) and fresh,
    /// controller-owned booking maps.
    #[must_use]
    pub fn new(
        name: String,
        options: RegistryOptions,
        driver: Arc<dyn RegistryDriver>,
        backup: Option<Arc<dyn BackupStore>>,
        registrations: Arc<DashMap<String, Arc<Registion>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            options,
            driver,
            backup,
            tasks: TaskQueue::new(),
            connected: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            reconnect: Mutex::new(None),
            registrations,
            clusters: DashMap::new(),
            configs: DashMap::new(),
            restored: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Whether the controller currently believes it holds a live session.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Signals that a previously established session was lost (e.g. a
    /// session-expiry watch fired) and re-enters the reconnect loop (spec
    /// §4.2.1; §1 "survive transient disconnects" applies beyond the
    /// initial `open()` as well as during it). A concrete driver invokes
    /// this through whatever out-of-band wiring it holds on the
    /// controller, the same way it routes inbound subscription events to
    /// a booking's `handle` (spec §6.1 `doSubscribe*`). A no-op if the
    /// controller was already disconnected or reconnecting.
    pub fn notify_disconnected(self: &Arc<Self>) {
        if self.connected.swap(false, Ordering::AcqRel) {
            warn!("session lost; re-entering reconnect loop");
            *self.reconnect.lock() = Some(PendingReconnect {
                attempts: 0,
                max: self.options.max_connect_retry_times(),
                completion: None,
                expires_at: Instant::now(),
            });
            self.tasks.wake();
        }
    }

    /// Returns the restored backup datum, if `restore()` found one at
    /// `prepare` time. Drivers may consult this to seed initial views
    /// before the first network response arrives (spec §4.6).
    #[must_use]
    pub fn restored_datum(&self) -> Option<BackupDatum> {
        self.restored.lock().clone()
    }

    /// Looks up an existing cluster booking for `key`.
    #[must_use]
    pub fn find_cluster_booking(&self, key: &str) -> Option<Arc<ClusterBooking>> {
        self.clusters.get(key).map(|entry| entry.clone())
    }

    /// Looks up an existing config booking for `key`.
    #[must_use]
    pub fn find_config_booking(&self, key: &str) -> Option<Arc<ConfigBooking>> {
        self.configs.get(key).map(|entry| entry.clone())
    }

    /// Starts the dispatcher worker, restores the backup (if configured),
    /// and initiates `reconnect(0, maxConnectRetryTimes)` (spec §4.2). The
    /// returned future resolves once the first connect succeeds or the
    /// connect-retry budget is exhausted.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn open(self: &Arc<Self>) -> VoidFuture {
        if let Some(store) = &self.backup {
            match store.restore(&self.name).await {
                Ok(datum) => *self.restored.lock() = datum,
                Err(err) => {
                    warn!(error = %err, "backup restore failed; starting with empty state");
                }
            }
        }

        let worker = {
            let controller = Arc::clone(self);
            tokio::spawn(async move { controller.dispatch_loop().await })
        };
        *self.worker.lock() = Some(worker);

        let completion = VoidCompletion::new();
        *self.reconnect.lock() = Some(PendingReconnect {
            attempts: 0,
            max: self.options.max_connect_retry_times(),
            completion: Some(completion.clone()),
            expires_at: Instant::now(),
        });
        self.tasks.wake();
        completion.future()
    }

    /// Enqueues an immediate register task for `registion` (spec §4.2
    /// "register(Registion)").
    pub fn register(self: &Arc<Self>, registion: Arc<Registion>) {
        let task = self.build_register_task(registion);
        self.tasks.add_new_task(task);
    }

    /// Enqueues an immediate deregister task with the given retry budget
    /// (spec §4.2 "deregister(Registion, maxRetry)").
    pub fn deregister(self: &Arc<Self>, registion: Arc<Registion>, max_retry: u32) {
        let task = self.build_deregister_task(registion, Some(max_retry));
        self.tasks.add_new_task(task);
    }

    /// Adds a cluster handler; on first handler for `key` this creates the
    /// booking and enqueues a subscribe task (spec §4.2).
    pub fn subscribe_cluster(self: &Arc<Self>, key: &UrlKey, handler: ClusterHandler) -> Completion {
        let completion = Completion::new();
        let is_first = !self.clusters.contains_key(key.key());
        let booking = self
            .clusters
            .entry(key.key().to_owned())
            .or_insert_with(|| Arc::new(ClusterBooking::new(key.clone())))
            .clone();
        booking.add_handler(handler);

        if is_first {
            let task = self.build_cluster_subscribe_task(key.clone(), TaskKind::Subscribe, completion.clone());
            self.tasks.add_new_task(task);
        } else {
            completion.complete(Ok(key.url().clone()));
        }
        completion
    }

    /// Removes a cluster handler; when it was the last one, drops the
    /// booking and enqueues an unsubscribe task.
    pub fn unsubscribe_cluster(self: &Arc<Self>, key: &UrlKey, handler: &ClusterHandler) -> Completion {
        let completion = Completion::new();
        let Some(booking) = self.find_cluster_booking(key.key()) else {
            completion.complete(Ok(key.url().clone()));
            return completion;
        };
        if booking.remove_handler(handler) {
            self.clusters.remove(key.key());
            let task = self.build_cluster_subscribe_task(key.clone(), TaskKind::Unsubscribe, completion.clone());
            self.tasks.add_new_task(task);
        } else {
            completion.complete(Ok(key.url().clone()));
        }
        completion
    }

    /// Adds a config handler; symmetric to [`RegistryController::subscribe_cluster`].
    pub fn subscribe_config(self: &Arc<Self>, key: &UrlKey, handler: ConfigHandler) -> Completion {
        let completion = Completion::new();
        let is_first = !self.configs.contains_key(key.key());
        let booking = self
            .configs
            .entry(key.key().to_owned())
            .or_insert_with(|| Arc::new(ConfigBooking::new(key.clone())))
            .clone();
        booking.add_handler(handler);

        if is_first {
            let task = self.build_config_subscribe_task(key.clone(), TaskKind::Subscribe, completion.clone());
            self.tasks.add_new_task(task);
        } else {
            completion.complete(Ok(key.url().clone()));
        }
        completion
    }

    /// Removes a config handler; symmetric to [`RegistryController::unsubscribe_cluster`].
    pub fn unsubscribe_config(self: &Arc<Self>, key: &UrlKey, handler: &ConfigHandler) -> Completion {
        let completion = Completion::new();
        let Some(booking) = self.find_config_booking(key.key()) else {
            completion.complete(Ok(key.url().clone()));
            return completion;
        };
        if booking.remove_handler(handler) {
            self.configs.remove(key.key());
            let task = self.build_config_subscribe_task(key.clone(), TaskKind::Unsubscribe, completion.clone());
            self.tasks.add_new_task(task);
        } else {
            completion.complete(Ok(key.url().clone()));
        }
        completion
    }

    /// Drains in-flight work and stops the dispatcher worker (spec
    /// §4.2.3): deregisters every successfully-registered Registion with a
    /// zero retry budget, unsubscribes every booking that ever reached the
    /// remote, then signals the worker to exit.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn close(self: &Arc<Self>) {
        // Flip `closing` before draining so the dispatcher treats the
        // unregister/unsubscribe batch under the same bounded-execution
        // rule as everything else run after close was requested.
        self.closing.store(true, Ordering::Release);
        self.tasks.wake();
        self.unregister().await;
        self.driver.disconnect().await;

        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.await;
        }
    }

    /// For every Registion whose open-future already succeeded, enqueues a
    /// deregister task with a zero retry budget; for every booking that
    /// ever received a subscribed event, enqueues an unsubscribe task.
    /// Waits for all of them to finish or fail (spec §4.2.3).
    async fn unregister(self: &Arc<Self>) {
        let mut pending = Vec::new();

        for entry in self.registrations.iter() {
            let registion = entry.value().clone();
            if registion.register_time() > 0 {
                let task = self.build_deregister_task(registion, Some(0));
                pending.push(task.completion().future());
                self.tasks.add_new_task(task);
            }
        }

        for entry in self.clusters.iter() {
            if entry.value().is_full() {
                let completion = Completion::new();
                pending.push(completion.future());
                let task = self.build_cluster_subscribe_task(
                    entry.value().key().clone(),
                    TaskKind::Unsubscribe,
                    completion,
                );
                self.tasks.add_new_task(task);
            }
        }
        for entry in self.configs.iter() {
            if entry.value().is_full() {
                let completion = Completion::new();
                pending.push(completion.future());
                let task = self.build_config_subscribe_task(
                    entry.value().key().clone(),
                    TaskKind::Unsubscribe,
                    completion,
                );
                self.tasks.add_new_task(task);
            }
        }

        if tokio::time::timeout(CLOSE_DRAIN_GRACE, futures::future::join_all(pending))
            .await
            .is_err()
        {
            warn!("unregister drain exceeded grace period; some completions may fail later");
        }
    }

    fn build_register_task(self: &Arc<Self>, registion: Arc<Registion>) -> Task {
        let driver = Arc::clone(&self.driver);
        let key = registion.key().clone();
        let target = Arc::clone(&registion);
        let completion = registion.state_future().open().clone();
        let body = Arc::new({
            let completion = completion.clone();
            move || {
                let driver = Arc::clone(&driver);
                let key = key.clone();
                let target = Arc::clone(&target);
                let completion = completion.clone();
                Box::pin(async move {
                    match driver.do_register(&key).await {
                        Ok(()) => {
                            target.mark_registered(now_millis());
                            Ok(true)
                        }
                        Err(err) => {
                            if driver.retry(&err) {
                                Ok(false)
                            } else {
                                completion.complete(Err(err));
                                Ok(true)
                            }
                        }
                    }
                }) as _
            }
        });
        Task::new(TaskKind::Register, registion.key().clone(), completion, body, None)
    }

    fn build_deregister_task(self: &Arc<Self>, registion: Arc<Registion>, max_retry: Option<u32>) -> Task {
        let driver = Arc::clone(&self.driver);
        let key = registion.key().clone();
        let target = Arc::clone(&registion);
        let completion = registion.state_future().close().clone();
        let body = Arc::new({
            let completion = completion.clone();
            move || {
                let driver = Arc::clone(&driver);
                let key = key.clone();
                let target = Arc::clone(&target);
                let completion = completion.clone();
                Box::pin(async move {
                    match driver.do_deregister(&key).await {
                        Ok(()) => {
                            target.mark_closed();
                            Ok(true)
                        }
                        Err(err) => {
                            if driver.retry(&err) {
                                Ok(false)
                            } else {
                                completion.complete(Err(err));
                                Ok(true)
                            }
                        }
                    }
                }) as _
            }
        });
        Task::new(TaskKind::Deregister, registion.key().clone(), completion, body, max_retry)
    }

    /// Builds a subscribe or unsubscribe task for a cluster key. Per spec
    /// §4.2.4, the task's body always reports success to the generic retry
    /// ladder (`Ok(true)`) once it has decided the final outcome itself —
    /// it only returns `Ok(false)` (asking the ladder for an ordinary
    /// retry-after-`taskRetryInterval`) while the booking is still present
    /// and the driver's policy considers the failure retryable.
    fn build_cluster_subscribe_task(self: &Arc<Self>, key: UrlKey, kind: TaskKind, completion: Completion) -> Task {
        let driver = Arc::clone(&self.driver);
        let controller = Arc::clone(self);
        let body = Arc::new(move || {
            let driver = Arc::clone(&driver);
            let key = key.clone();
            let completion = completion.clone();
            let controller = Arc::clone(&controller);
            Box::pin(async move {
                let outcome = match kind {
                    TaskKind::Subscribe => driver.do_subscribe_cluster(&key).await,
                    _ => driver.do_unsubscribe_cluster(&key).await,
                };
                match outcome {
                    Ok(()) => {
                        completion.complete(Ok(key.url().clone()));
                        Ok(true)
                    }
                    Err(err) => {
                        if controller.clusters.contains_key(key.key()) && driver.retry(&err) {
                            Ok(false)
                        } else {
                            completion.complete(Err(err));
                            Ok(true)
                        }
                    }
                }
            }) as _
        });
        Task::new(kind, key, Completion::new(), body, None)
    }

    /// Symmetric to [`RegistryController::build_cluster_subscribe_task`].
    fn build_config_subscribe_task(self: &Arc<Self>, key: UrlKey, kind: TaskKind, completion: Completion) -> Task {
        let driver = Arc::clone(&self.driver);
        let controller = Arc::clone(self);
        let body = Arc::new(move || {
            let driver = Arc::clone(&driver);
            let key = key.clone();
            let completion = completion.clone();
            let controller = Arc::clone(&controller);
            Box::pin(async move {
                let outcome = match kind {
                    TaskKind::Subscribe => driver.do_subscribe_config(&key).await,
                    _ => driver.do_unsubscribe_config(&key).await,
                };
                match outcome {
                    Ok(()) => {
                        completion.complete(Ok(key.url().clone()));
                        Ok(true)
                    }
                    Err(err) => {
                        if controller.configs.contains_key(key.key()) && driver.retry(&err) {
                            Ok(false)
                        } else {
                            completion.complete(Err(err));
                            Ok(true)
                        }
                    }
                }
            }) as _
        });
        Task::new(kind, key, Completion::new(), body, None)
    }

    /// Re-issues register tasks for every local Registion and subscribe
    /// tasks for every cluster/config booking that still has handlers, in
    /// that order, after a successful (re)connect (spec §4.2.3).
    fn recover(self: &Arc<Self>) {
        for entry in self.registrations.iter() {
            let registion = entry.value().clone();
            let task = self.build_register_task(registion);
            self.tasks.add_new_task(task);
        }
        for entry in self.clusters.iter() {
            if entry.value().handler_count() > 0 {
                let key = entry.value().key().clone();
                let task = self.build_cluster_subscribe_task(key, TaskKind::Subscribe, Completion::new());
                self.tasks.add_new_task(task);
            }
        }
        for entry in self.configs.iter() {
            if entry.value().handler_count() > 0 {
                let key = entry.value().key().clone();
                let task = self.build_config_subscribe_task(key, TaskKind::Subscribe, Completion::new());
                self.tasks.add_new_task(task);
            }
        }
        info!(
            registrations = self.registrations.len(),
            clusters = self.clusters.len(),
            configs = self.configs.len(),
            "replaying local intent after (re)connect"
        );
    }

    /// Builds the backup snapshot from every persistable booking and hands
    /// it to the backup store, clearing `dirty` first so a write racing a
    /// fresh mutation does not wrongly suppress the *next* backup (spec
    /// §4.6).
    async fn run_backup(self: &Arc<Self>) {
        let Some(store) = &self.backup else { return };

        let mut clusters = HashMap::new();
        for entry in self.clusters.iter() {
            if entry.value().is_persistable() {
                let records: Vec<ShardRecordSerde> = entry
                    .value()
                    .snapshot()
                    .values()
                    .map(ShardRecordSerde::from)
                    .collect();
                clusters.insert(entry.key().clone(), records);
            }
        }

        let mut configs = HashMap::new();
        for entry in self.configs.iter() {
            if entry.value().is_persistable() {
                if let Some(datum) = entry.value().snapshot() {
                    configs.insert(entry.key().clone(), datum);
                }
            }
        }

        let datum = BackupDatum { clusters, configs };
        if let Err(err) = store.backup(&self.name, &datum).await {
            warn!(error = %err, "backup write failed");
        }
    }

    /// Marks the controller's state dirty, to be backed up on the next
    /// idle dispatcher turn (spec §4.3 rule 8, §4.6).
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        !self.closing.load(Ordering::Acquire)
    }

    /// The dispatcher's event loop (spec §4.2.2).
    #[instrument(skip(self), fields(name = %self.name))]
    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            if self.closing.load(Ordering::Acquire) && self.tasks.is_empty() {
                break;
            }

            if !self.connected.load(Ordering::Acquire) && self.is_open() {
                let due = {
                    let guard = self.reconnect.lock();
                    guard.as_ref().map(|task| task.expires_at <= Instant::now())
                };
                match due {
                    Some(true) => {
                        let pending = self.reconnect.lock().take();
                        if let Some(pending) = pending {
                            self.attempt_reconnect(pending).await;
                        }
                    }
                    _ => self.tasks.wait(Duration::from_secs(1)).await,
                }
                continue;
            }

            if self.closing.load(Ordering::Acquire) {
                if let Some(task) = self.tasks.poll_first_if_due(Instant::now()) {
                    let completion = task.completion().clone();
                    let kind = task.kind();
                    let outcome = tokio::time::timeout(
                        CLOSE_TASK_TIMEOUT,
                        task.run(false, self.options.task_retry_interval()),
                    )
                    .await;
                    if outcome.is_err() {
                        warn!(?kind, "task did not resolve before close drain timeout; failing as closed");
                        completion.complete(Err(RegistryError::AlreadyClosed));
                    }
                } else if self.tasks.is_empty() {
                    break;
                } else {
                    self.tasks.wait(Duration::from_millis(50)).await;
                }
                continue;
            }

            let wait_time = match self.tasks.peek_first_retry_time() {
                Some(retry_time) => retry_time.saturating_duration_since(Instant::now()),
                None => self.options.max_idle_wait(),
            };

            if wait_time.is_zero() {
                if let Some(task) = self.tasks.poll_first_if_due(Instant::now()) {
                    if let Some(retry) = task.run(self.is_open(), self.options.task_retry_interval()).await {
                        self.tasks.add_retry_task(retry);
                    }
                }
            } else {
                let should_backup = self.backup.is_some()
                    && self
                        .dirty
                        .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                if should_backup {
                    self.run_backup().await;
                }
                self.tasks.wait(wait_time).await;
            }
        }
        debug!("dispatcher worker exiting");
    }

    /// Attempts a connect, scheduling the next attempt or failing the
    /// caller's open-future according to spec §4.2.1.
    async fn attempt_reconnect(self: &Arc<Self>, pending: PendingReconnect) {
        let PendingReconnect {
            attempts,
            max,
            completion,
            ..
        } = pending;

        let result = self.driver.do_connect().await;
        if !self.is_open() {
            self.driver.disconnect().await;
            if let Some(completion) = completion {
                completion.complete(Err(RegistryError::AlreadyClosed));
            }
            return;
        }

        match result {
            Ok(()) => {
                self.connected.store(true, Ordering::Release);
                self.tasks.wake();
                self.recover();
                if let Some(completion) = completion {
                    completion.complete(Ok(()));
                }
            }
            Err(err) => {
                let can_retry = max < 0 || (max > 0 && i64::from(attempts + 1) <= max);
                if can_retry {
                    warn!(attempts = attempts + 1, error = %err, "connect attempt failed; retrying");
                    *self.reconnect.lock() = Some(PendingReconnect {
                        attempts: attempts + 1,
                        max,
                        completion,
                        expires_at: Instant::now() + Duration::from_secs(1),
                    });
                } else if let Some(completion) = completion {
                    completion.complete(Err(RegistryError::ConnectRetriesExhausted {
                        attempts: attempts + 1,
                        reason: err.to_string(),
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ClusterEventKind, ConfigEventKind};
    use async_trait::async_trait;
    use reg_primitives::RegistryUrl;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Once;
    use std::time::Duration as StdDuration;

    static INIT_LOGGING: Once = Once::new();

    /// Turns on `tracing` output for the reconnect/dispatch tests below so a
    /// failure can be diagnosed from `cargo test -- --nocapture` without
    /// reaching for a debugger on a single-threaded worker loop.
    fn init_test_logging() {
        INIT_LOGGING.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }

    struct FlakyDriver {
        connect_failures: AtomicUsize,
        fail_n_times: usize,
        registers: AtomicUsize,
    }

    #[async_trait]
    impl RegistryDriver for FlakyDriver {
        async fn do_connect(&self) -> Result<(), RegistryError> {
            let attempt = self.connect_failures.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_n_times {
                Err(RegistryError::retryable("connection refused"))
            } else {
                Ok(())
            }
        }

        async fn disconnect(&self) {}

        async fn do_register(&self, _key: &UrlKey) -> Result<(), RegistryError> {
            self.registers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn do_deregister(&self, _key: &UrlKey) -> Result<(), RegistryError> {
            Ok(())
        }

        async fn do_subscribe_cluster(&self, _key: &UrlKey) -> Result<(), RegistryError> {
            Ok(())
        }

        async fn do_subscribe_config(&self, _key: &UrlKey) -> Result<(), RegistryError> {
            Ok(())
        }

        async fn do_unsubscribe_cluster(&self, _key: &UrlKey) -> Result<(), RegistryError> {
            Ok(())
        }

        async fn do_unsubscribe_config(&self, _key: &UrlKey) -> Result<(), RegistryError> {
            Ok(())
        }
    }

    fn url() -> RegistryUrl {
        RegistryUrl::builder("rpc", "svc").path("svc").build()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_succeeds_after_transient_connect_failures() {
        let driver = Arc::new(FlakyDriver {
            connect_failures: AtomicUsize::new(0),
            fail_n_times: 2,
            registers: AtomicUsize::new(0),
        });
        let options = RegistryOptions::from_url(&url()).unwrap();
        let registrations = Arc::new(DashMap::new());
        let controller = RegistryController::new(
            "test".to_owned(),
            options,
            driver.clone(),
            None,
            registrations,
        );

        let opened = controller.open().await;
        let result = tokio::time::timeout(StdDuration::from_secs(5), opened)
            .await
            .expect("open should resolve");
        assert!(result.is_ok());
        assert!(controller.is_connected());

        controller.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_completes_and_marks_registered() {
        let driver = Arc::new(FlakyDriver {
            connect_failures: AtomicUsize::new(0),
            fail_n_times: 0,
            registers: AtomicUsize::new(0),
        });
        let options = RegistryOptions::from_url(&url()).unwrap();
        let registrations: Arc<DashMap<String, Arc<Registion>>> = Arc::new(DashMap::new());
        let controller = RegistryController::new(
            "test".to_owned(),
            options,
            driver.clone(),
            None,
            registrations.clone(),
        );

        controller.open().await.await.unwrap();

        let key = UrlKey::for_register(url());
        let registion = Arc::new(Registion::new(key.clone()));
        registrations.insert(key.key().to_owned(), registion.clone());
        let future = registion.state_future().open_future();
        controller.register(registion.clone());

        let resolved = tokio::time::timeout(StdDuration::from_secs(5), future)
            .await
            .expect("register should complete")
            .unwrap();
        assert_eq!(resolved, url());
        assert!(registion.register_time() > 0);
        assert_eq!(driver.registers.load(Ordering::SeqCst), 1);

        controller.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscribe_delivers_synthetic_full_on_join_after_event() {
        let driver = Arc::new(FlakyDriver {
            connect_failures: AtomicUsize::new(0),
            fail_n_times: 0,
            registers: AtomicUsize::new(0),
        });
        let options = RegistryOptions::from_url(&url()).unwrap();
        let registrations = Arc::new(DashMap::new());
        let controller = RegistryController::new(
            "test".to_owned(),
            options,
            driver,
            None,
            registrations,
        );
        controller.open().await.await.unwrap();

        let key = UrlKey::for_cluster(url());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let completion = controller.subscribe_cluster(
            &key,
            Arc::new(move |event: ClusterEventKind| sink.lock().push(event)),
        );
        completion.future().await.unwrap();

        let booking = controller.find_cluster_booking(key.key()).unwrap();
        booking.handle(crate::driver::ClusterEvent {
            update_type: crate::driver::UpdateType::Full,
            version: 1,
            shard_events: vec![],
            protect_null_datum: false,
        });

        assert!(booking.is_full());
        assert_eq!(received.lock().len(), 1);

        controller.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn notify_disconnected_triggers_reconnect_and_recovers_registrations() {
        init_test_logging();
        let driver = Arc::new(FlakyDriver {
            connect_failures: AtomicUsize::new(0),
            fail_n_times: 0,
            registers: AtomicUsize::new(0),
        });
        let options = RegistryOptions::from_url(&url()).unwrap();
        let registrations: Arc<DashMap<String, Arc<Registion>>> = Arc::new(DashMap::new());
        let controller = RegistryController::new(
            "test".to_owned(),
            options,
            driver.clone(),
            None,
            registrations.clone(),
        );
        controller.open().await.await.unwrap();

        let key = UrlKey::for_register(url());
        let registion = Arc::new(Registion::new(key.clone()));
        registrations.insert(key.key().to_owned(), registion.clone());
        controller.register(registion.clone());
        tokio::time::timeout(StdDuration::from_secs(5), registion.state_future().open_future())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(driver.registers.load(Ordering::SeqCst), 1);

        assert!(controller.is_connected());
        controller.notify_disconnected();
        assert!(!controller.is_connected());

        // Give the dispatcher time to notice the disconnect, reconnect,
        // and replay the registration via `recover()`.
        for _ in 0..50 {
            if controller.is_connected() && driver.registers.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }
        assert!(controller.is_connected());
        assert_eq!(driver.registers.load(Ordering::SeqCst), 2);

        controller.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_is_idempotent_with_respect_to_pending_registrations() {
        let driver = Arc::new(FlakyDriver {
            connect_failures: AtomicUsize::new(0),
            fail_n_times: 0,
            registers: AtomicUsize::new(0),
        });
        let options = RegistryOptions::from_url(&url()).unwrap();
        let registrations = Arc::new(DashMap::new());
        let controller = RegistryController::new(
            "test".to_owned(),
            options,
            driver,
            None,
            registrations,
        );
        controller.open().await.await.unwrap();
        controller.close().await;
        controller.close().await;
    }

    #[allow(dead_code)]
    fn assert_config_event_kind_is_clone(_: ConfigEventKind) {}

    struct JsonBackupStore {
        written: Mutex<Option<String>>,
    }

    impl JsonBackupStore {
        fn new() -> Self {
            Self {
                written: Mutex::new(None),
            }
        }

        fn seed(&self, datum: &BackupDatum) {
            *self.written.lock() = Some(serde_json::to_string(datum).unwrap());
        }
    }

    #[async_trait]
    impl BackupStore for JsonBackupStore {
        async fn backup(&self, _name: &str, datum: &BackupDatum) -> Result<(), RegistryError> {
            *self.written.lock() = Some(serde_json::to_string(datum).unwrap());
            Ok(())
        }

        async fn restore(&self, _name: &str) -> Result<Option<BackupDatum>, RegistryError> {
            let guard = self.written.lock();
            Ok(match guard.as_deref() {
                Some(json) => Some(serde_json::from_str(json).unwrap()),
                None => None,
            })
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_restores_seeded_backup_datum() {
        let driver = Arc::new(FlakyDriver {
            connect_failures: AtomicUsize::new(0),
            fail_n_times: 0,
            registers: AtomicUsize::new(0),
        });
        let mut clusters = HashMap::new();
        clusters.insert(
            "rpc/svc?alias=&role=&type=cluster".to_owned(),
            vec![ShardRecordSerde {
                name: "shard-1".to_owned(),
                url: "rpc://svc/svc".to_owned(),
                weight: 100,
                region: None,
                datacenter: None,
            }],
        );
        let store = Arc::new(JsonBackupStore::new());
        store.seed(&BackupDatum {
            clusters,
            configs: HashMap::new(),
        });

        let options = RegistryOptions::from_url(&url()).unwrap();
        let registrations = Arc::new(DashMap::new());
        let controller = RegistryController::new(
            "test".to_owned(),
            options,
            driver,
            Some(store),
            registrations,
        );
        controller.open().await.await.unwrap();

        let restored = controller.restored_datum().expect("backup should have been restored");
        assert_eq!(restored.clusters.len(), 1);

        controller.close().await;
    }
}
