//! `AbstractRegistry`: the external API surface (spec §4.1).
//!
//! The facade owns the top-level registration map and both subscription
//! record sets (spec §3 "Ownership"). It binds a fresh [`RegistryController`]
//! on every `open()` and replays the facade's own intent into whichever
//! controller is currently live: registrations via the shared map the
//! controller is handed at construction time, subscriptions via an explicit
//! replay pass driven by a per-record `forwarded` flag.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use reg_config::{RegistryOptions, registry_name};
use reg_primitives::{RegistryUrl, UrlKey};
use tracing::{info, instrument, warn};

use crate::controller::RegistryController;
use crate::driver::{BackupStore, ClusterHandler, ConfigHandler, RegistryDriver};
use crate::error::RegistryError;
use crate::lifecycle::{LifecycleGate, TransitionOutcome};
use crate::registion::Registion;
use crate::task::{Completion, VoidCompletion, VoidFuture};

/// Bound on how long `close()` waits on the controller's own drain before
/// returning anyway. The controller keeps draining in the background past
/// this point if it hasn't finished; this only bounds how long the
/// *caller* of `close()` waits (spec §9 "bounded time" per S6).
const CLOSE_WAIT_GRACE: Duration = Duration::from_secs(10);

struct ClusterSubscriptionRecord {
    key: UrlKey,
    handler: ClusterHandler,
    /// Whether this record has been forwarded into the currently live
    /// controller's booking map. Reset to `false` whenever a fresh
    /// controller is constructed, so a reopen replays every prior
    /// subscription into the new (empty) booking map.
    forwarded: bool,
}

struct ConfigSubscriptionRecord {
    key: UrlKey,
    handler: ConfigHandler,
    forwarded: bool,
}

/// The user-facing registry session (spec §4.1). One instance corresponds
/// to one connection URL; `open()`/`close()` may be cycled any number of
/// times, each cycle binding a fresh [`RegistryController`].
pub struct AbstractRegistry {
    url: RegistryUrl,
    name: String,
    options: RegistryOptions,
    driver: Arc<dyn RegistryDriver>,
    backup: Option<Arc<dyn BackupStore>>,
    gate: LifecycleGate,
    controller: Mutex<Option<Arc<RegistryController>>>,
    registrations: Arc<DashMap<String, Arc<Registion>>>,
    cluster_subscriptions: Mutex<Vec<ClusterSubscriptionRecord>>,
    config_subscriptions: Mutex<Vec<ConfigSubscriptionRecord>>,
    open_future: Mutex<Option<VoidFuture>>,
    close_future: Mutex<Option<VoidFuture>>,
}

impl AbstractRegistry {
    /// Builds a registry session bound to `url`, deriving its options
    /// (spec §6.3) and logical name up front.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Configuration`] when the URL carries an
    /// invalid option value.
    pub fn new(
        url: RegistryUrl,
        driver: Arc<dyn RegistryDriver>,
        backup: Option<Arc<dyn BackupStore>>,
    ) -> Result<Self, RegistryError> {
        let options = RegistryOptions::from_url(&url)?;
        let name = registry_name(&url);
        Ok(Self {
            url,
            name,
            options,
            driver,
            backup,
            gate: LifecycleGate::new(),
            controller: Mutex::new(None),
            registrations: Arc::new(DashMap::new()),
            cluster_subscriptions: Mutex::new(Vec::new()),
            config_subscriptions: Mutex::new(Vec::new()),
            open_future: Mutex::new(None),
            close_future: Mutex::new(None),
        })
    }

    /// Returns the connection URL this session was built from.
    #[must_use]
    pub fn url(&self) -> &RegistryUrl {
        &self.url
    }

    /// Returns the registry's logical name (spec §6.3).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` iff the session is currently `Open`.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.gate.is_open()
    }

    /// Opens the session: `Closed -> Opening -> Open` (spec §4.1). Calling
    /// `open()` again while already `Opening` or `Open` returns the same
    /// future rather than starting a second attempt.
    #[instrument(skip(self), fields(name = %self.name))]
    pub fn open(self: &Arc<Self>) -> VoidFuture {
        match self.gate.begin_open() {
            Ok(TransitionOutcome::Proceed) => {
                let completion = VoidCompletion::new();
                *self.open_future.lock() = Some(completion.future());
                let registry = Arc::clone(self);
                tokio::spawn(async move {
                    registry.run_open(completion).await;
                });
            }
            Ok(TransitionOutcome::AlreadyInProgress) => {}
            Err(err) => {
                let completion = VoidCompletion::new();
                completion.complete(Err(err));
                return completion.future();
            }
        }
        self.open_future
            .lock()
            .clone()
            .expect("open future set by begin_open's Proceed branch before first return")
    }

    async fn run_open(self: Arc<Self>, completion: VoidCompletion) {
        // A brand new controller's booking maps start empty; every prior
        // subscription must be replayed into it once connected.
        self.reset_subscription_forward_flags();

        let controller = RegistryController::new(
            self.name.clone(),
            self.options,
            Arc::clone(&self.driver),
            self.backup.clone(),
            Arc::clone(&self.registrations),
        );
        *self.controller.lock() = Some(Arc::clone(&controller));

        let opened = controller.open().await;
        match opened.await {
            Ok(()) => {
                self.replay_subscriptions(&controller);
                self.gate.complete_open();
                info!("registry session open");
                completion.complete(Ok(()));
            }
            Err(err) => {
                *self.controller.lock() = None;
                self.gate.abort_open();
                completion.complete(Err(err));
            }
        }
    }

    /// Closes the session: `Open -> Closing -> Closed` (spec §4.1). Before
    /// delegating to the controller's shutdown, every Registion is bumped
    /// to a fresh generation and its `registerTime` reset. Idempotent:
    /// calling `close()` twice resolves both futures without error.
    #[instrument(skip(self), fields(name = %self.name))]
    pub fn close(self: &Arc<Self>) -> VoidFuture {
        match self.gate.begin_close() {
            Ok(TransitionOutcome::Proceed) => {
                let completion = VoidCompletion::new();
                *self.close_future.lock() = Some(completion.future());
                let registry = Arc::clone(self);
                tokio::spawn(async move {
                    registry.run_close(completion).await;
                });
            }
            Ok(TransitionOutcome::AlreadyInProgress) => {
                let existing = self.close_future.lock().clone();
                if let Some(future) = existing {
                    return future;
                }
                // Never opened: Closed -> Closing is rejected by the gate
                // (it only accepts Open -> Closing), so reaching here with
                // no cached future means close() on a fresh registry.
                let completion = VoidCompletion::new();
                completion.complete(Ok(()));
                return completion.future();
            }
            Err(_) => {
                // Opening -> Closing is rejected; a close() racing an
                // in-flight open() waits for the open to resolve and then
                // retries, rather than failing outright.
                let registry = Arc::clone(self);
                let completion = VoidCompletion::new();
                let future = completion.future();
                let open_future = self.open_future.lock().clone();
                tokio::spawn(async move {
                    if let Some(open_future) = open_future {
                        let _ = open_future.await;
                    }
                    completion.complete(Ok(()));
                    let _ = registry.close();
                });
                return future;
            }
        }
        self.close_future
            .lock()
            .clone()
            .expect("close future set by begin_close's Proceed branch before first return")
    }

    async fn run_close(self: Arc<Self>, completion: VoidCompletion) {
        for entry in self.registrations.iter() {
            entry.value().close();
        }

        let controller = self.controller.lock().take();
        if let Some(controller) = controller {
            if tokio::time::timeout(CLOSE_WAIT_GRACE, controller.close())
                .await
                .is_err()
            {
                warn!("controller close exceeded grace period; returning anyway");
            }
        }

        self.gate.complete_close();
        *self.open_future.lock() = None;
        info!("registry session closed");
        completion.complete(Ok(()));
    }

    /// Registers `url` (spec §4.1 "register"). A second `register()` call
    /// for the same canonical key bumps the ref-count and returns the same
    /// open future rather than creating a second registration.
    pub fn register(self: &Arc<Self>, url: RegistryUrl) -> crate::task::UrlFuture {
        let key = UrlKey::for_register(url);
        let registion = self
            .registrations
            .entry(key.key().to_owned())
            .and_modify(|existing| {
                existing.increment();
            })
            .or_insert_with(|| Arc::new(Registion::new(key.clone())))
            .clone();

        let future = registion.state_future().open_future();
        if self.gate.is_open() {
            if let Some(controller) = self.controller.lock().clone() {
                controller.register(registion);
            }
        }
        future
    }

    /// Deregisters `url` (spec §4.1 "deregister"): decrements the
    /// registration's ref-count; only once it reaches zero is the entry
    /// removed and a deregister task enqueued with `max_retry` retries.
    ///
    /// When the registry is not currently `Open` — or the key was not
    /// (still) registered — there is nothing to tell a remote about, so
    /// the returned future resolves immediately with `Ok(url)` rather than
    /// waiting on a hypothetical future `open()`.
    pub fn deregister(self: &Arc<Self>, url: RegistryUrl, max_retry: u32) -> crate::task::UrlFuture {
        let key = UrlKey::for_register(url.clone());
        let removed = self
            .registrations
            .remove_if(key.key(), |_, registion| registion.decrement() == 0);

        let Some((_, registion)) = removed else {
            return Self::already_resolved(url);
        };

        if self.gate.is_open() {
            if let Some(controller) = self.controller.lock().clone() {
                controller.deregister(Arc::clone(&registion), max_retry);
                return registion.state_future().close_future();
            }
        }
        Self::already_resolved(url)
    }

    fn already_resolved(url: RegistryUrl) -> crate::task::UrlFuture {
        let completion = Completion::new();
        completion.complete(Ok(url));
        completion.future()
    }

    /// Subscribes `handler` to cluster-membership events for `url` (spec
    /// §4.1 "subscribe"). Returns `false` when an equal subscription (same
    /// canonical key, same handler identity) was already present.
    pub fn subscribe_cluster(self: &Arc<Self>, url: &RegistryUrl, handler: ClusterHandler) -> bool {
        let key = UrlKey::for_cluster(url.clone());
        let mut records = self.cluster_subscriptions.lock();
        if records
            .iter()
            .any(|record| record.key == key && Arc::ptr_eq(&record.handler, &handler))
        {
            return false;
        }
        let forward_now = self.gate.is_open();
        records.push(ClusterSubscriptionRecord {
            key: key.clone(),
            handler: handler.clone(),
            forwarded: forward_now,
        });
        drop(records);

        if forward_now {
            if let Some(controller) = self.controller.lock().clone() {
                controller.subscribe_cluster(&key, handler);
            }
        }
        true
    }

    /// Unsubscribes `handler` from cluster events for `url`. Returns
    /// `false` when no matching subscription was present.
    pub fn unsubscribe_cluster(self: &Arc<Self>, url: &RegistryUrl, handler: &ClusterHandler) -> bool {
        let key = UrlKey::for_cluster(url.clone());
        let mut records = self.cluster_subscriptions.lock();
        let Some(position) = records
            .iter()
            .position(|record| record.key == key && Arc::ptr_eq(&record.handler, handler))
        else {
            return false;
        };
        let record = records.remove(position);
        drop(records);

        if record.forwarded {
            if let Some(controller) = self.controller.lock().clone() {
                controller.unsubscribe_cluster(&key, handler);
            }
        }
        true
    }

    /// Subscribes `handler` to configuration events for `url`. Symmetric to
    /// [`AbstractRegistry::subscribe_cluster`].
    pub fn subscribe_config(self: &Arc<Self>, url: &RegistryUrl, handler: ConfigHandler) -> bool {
        let key = UrlKey::for_config(url.clone());
        let mut records = self.config_subscriptions.lock();
        if records
            .iter()
            .any(|record| record.key == key && Arc::ptr_eq(&record.handler, &handler))
        {
            return false;
        }
        let forward_now = self.gate.is_open();
        records.push(ConfigSubscriptionRecord {
            key: key.clone(),
            handler: handler.clone(),
            forwarded: forward_now,
        });
        drop(records);

        if forward_now {
            if let Some(controller) = self.controller.lock().clone() {
                controller.subscribe_config(&key, handler);
            }
        }
        true
    }

    /// Unsubscribes `handler` from configuration events for `url`.
    /// Symmetric to [`AbstractRegistry::unsubscribe_cluster`].
    pub fn unsubscribe_config(self: &Arc<Self>, url: &RegistryUrl, handler: &ConfigHandler) -> bool {
        let key = UrlKey::for_config(url.clone());
        let mut records = self.config_subscriptions.lock();
        let Some(position) = records
            .iter()
            .position(|record| record.key == key && Arc::ptr_eq(&record.handler, handler))
        else {
            return false;
        };
        let record = records.remove(position);
        drop(records);

        if record.forwarded {
            if let Some(controller) = self.controller.lock().clone() {
                controller.unsubscribe_config(&key, handler);
            }
        }
        true
    }

    fn replay_subscriptions(&self, controller: &Arc<RegistryController>) {
        let mut clusters = self.cluster_subscriptions.lock();
        for record in clusters.iter_mut().filter(|record| !record.forwarded) {
            controller.subscribe_cluster(&record.key, record.handler.clone());
            record.forwarded = true;
        }
        drop(clusters);

        let mut configs = self.config_subscriptions.lock();
        for record in configs.iter_mut().filter(|record| !record.forwarded) {
            controller.subscribe_config(&record.key, record.handler.clone());
            record.forwarded = true;
        }
    }

    fn reset_subscription_forward_flags(&self) {
        for record in self.cluster_subscriptions.lock().iter_mut() {
            record.forwarded = false;
        }
        for record in self.config_subscriptions.lock().iter_mut() {
            record.forwarded = false;
        }
    }
}
