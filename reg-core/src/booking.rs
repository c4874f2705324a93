//! Per-subscription merge engines reconciling full-plus-incremental update
//! streams into a coherent view, and the fan-out bus that delivers the
//! resulting events to user handlers (spec §4.3, §4.4, §4.5).
//!
//! All mutation happens on the dispatcher worker; `datum` and `full` are
//! published through atomics/mutexes so handler callbacks — which may run
//! on a different task than the dispatcher — always observe a consistent
//! snapshot (spec §9).

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use reg_primitives::UrlKey;
use tracing::warn;

use crate::driver::{
    ClusterEvent, ClusterEventKind, ClusterHandler, ConfigEvent, ConfigEventKind, ConfigHandler,
    Shard, ShardAction, UpdateType,
};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Fan-out event bus for one booking. Delivery to each handler is FIFO;
/// a handler's panic is caught and logged so it cannot take down the
/// dispatcher or any other handler (spec §4.5).
pub struct Publisher<E> {
    handlers: Mutex<Vec<Arc<dyn Fn(E) + Send + Sync>>>,
}

impl<E: Clone> Default for Publisher<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> Publisher<E> {
    /// Creates an empty publisher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a handler. Does not itself send a synthetic event; the
    /// booking decides whether one is owed.
    pub fn add_handler(&self, handler: Arc<dyn Fn(E) + Send + Sync>) {
        self.handlers.lock().push(handler);
    }

    /// Removes a handler by pointer identity. Returns `true` when no
    /// handlers remain afterward, signaling the caller to remove the
    /// booking itself (spec §4.5).
    pub fn remove_handler(&self, handler: &Arc<dyn Fn(E) + Send + Sync>) -> bool {
        let mut handlers = self.handlers.lock();
        handlers.retain(|existing| !Arc::ptr_eq(existing, handler));
        handlers.is_empty()
    }

    /// Number of currently registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Returns `true` when no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    /// Delivers `event` to every registered handler, cloning the handler
    /// list first so callbacks never run with the publisher's internal
    /// lock held.
    pub fn publish(&self, event: &E) {
        let handlers = self.handlers.lock().clone();
        for handler in handlers {
            Self::invoke(&handler, event.clone());
        }
    }

    /// Delivers `event` to a single handler only, used for the synthetic
    /// FULL sent to a handler that joins an already-full booking.
    pub fn publish_to(&self, handler: &Arc<dyn Fn(E) + Send + Sync>, event: E) {
        Self::invoke(handler, event);
    }

    fn invoke(handler: &Arc<dyn Fn(E) + Send + Sync>, event: E) {
        let handler = handler.clone();
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            warn!("booking handler panicked; isolated from other handlers");
        }
    }
}

/// Pending per-shard state accumulated before a booking has ever seen a
/// full snapshot (spec §4.3 rule 3): `None` records a pending delete.
type PendingShards = HashMap<String, Option<Shard>>;

fn apply_shard_events(target: &mut HashMap<String, Shard>, events: &[crate::driver::ShardEvent], protect_null_datum: bool) {
    for delta in events {
        match delta.action {
            ShardAction::Add | ShardAction::Update => {
                target.insert(delta.shard.name.clone(), delta.shard.clone());
            }
            ShardAction::Delete => {
                if target.len() > 1 || !protect_null_datum {
                    target.remove(&delta.shard.name);
                }
            }
        }
    }
}

/// Per-subscription merge state for cluster membership (spec §4.3).
pub struct ClusterBooking {
    key: UrlKey,
    version: AtomicI64,
    full: AtomicBool,
    last_event_time: AtomicI64,
    datum: Mutex<HashMap<String, Shard>>,
    pending: Mutex<PendingShards>,
    publisher: Publisher<ClusterEventKind>,
}

impl ClusterBooking {
    /// Creates an empty booking for `key`, `version = -1`, not yet full.
    #[must_use]
    pub fn new(key: UrlKey) -> Self {
        Self {
            key,
            version: AtomicI64::new(-1),
            full: AtomicBool::new(false),
            last_event_time: AtomicI64::new(0),
            datum: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            publisher: Publisher::new(),
        }
    }

    /// Returns the identity key this booking was subscribed under.
    #[must_use]
    pub fn key(&self) -> &UrlKey {
        &self.key
    }

    /// Current version, monotonically non-decreasing.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version.load(Ordering::Acquire)
    }

    /// Whether a full snapshot has ever been merged in.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    /// Monotonic millis of the last inbound event.
    #[must_use]
    pub fn last_event_time(&self) -> i64 {
        self.last_event_time.load(Ordering::Acquire)
    }

    /// Clones the current full view.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Shard> {
        self.datum.lock().clone()
    }

    /// `true` iff this booking holds a non-empty full snapshot, making it
    /// eligible for backup (spec §4.6).
    #[must_use]
    pub fn is_persistable(&self) -> bool {
        self.is_full() && !self.datum.lock().is_empty()
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.publisher.len()
    }

    /// Registers a handler, sending it a synthetic FULL event immediately
    /// if the booking is already full (spec §4.3 invariant, §4.5).
    pub fn add_handler(&self, handler: ClusterHandler) {
        self.publisher.add_handler(handler.clone());
        if self.is_full() {
            let snapshot = self.snapshot();
            self.publisher
                .publish_to(&handler, ClusterEventKind::Full(snapshot));
        }
    }

    /// Removes a handler. Returns `true` when no handlers remain, signaling
    /// the caller to drop this booking from its parent map.
    pub fn remove_handler(&self, handler: &ClusterHandler) -> bool {
        self.publisher.remove_handler(handler)
    }

    /// Merges one inbound event, applying the full spec §4.3 rule set and
    /// publishing to handlers when the merge produces a user-visible event.
    pub fn handle(&self, event: ClusterEvent) {
        self.last_event_time.store(now_millis(), Ordering::Release);

        let is_full_datum = event.update_type.is_full_datum();
        let protect_null_datum = event.protect_null_datum;

        // Rule 3: no full snapshot yet and this event is itself incremental.
        if !self.is_full() && !is_full_datum {
            if event.version > self.version() {
                let mut pending = self.pending.lock();
                for delta in &event.shard_events {
                    match delta.action {
                        ShardAction::Add | ShardAction::Update => {
                            pending.insert(delta.shard.name.clone(), Some(delta.shard.clone()));
                        }
                        ShardAction::Delete => {
                            pending.insert(delta.shard.name.clone(), None);
                        }
                    }
                }
                self.version.store(event.version, Ordering::Release);
            }
            return;
        }

        // Rule 4: already full and this event is stale.
        if self.is_full() && self.version() >= event.version {
            return;
        }

        // Rule 5: start from a copy of the current datum for incremental
        // events, or an empty map for full/clear events.
        let mut cluster = if is_full_datum {
            HashMap::new()
        } else {
            self.datum.lock().clone()
        };

        // Rule 6.
        apply_shard_events(&mut cluster, &event.shard_events, protect_null_datum);

        // Rule 7: null-protection guard.
        if self.is_full() && cluster.is_empty() && protect_null_datum {
            self.version.store(self.version().max(event.version), Ordering::Release);
            warn!(
                version = event.version,
                "cluster update suppressed by protectNullDatum guard"
            );
            return;
        }

        // Rule 8.
        let transitioning_to_full = is_full_datum && !self.is_full();
        if transitioning_to_full {
            let mut pending = self.pending.lock();
            let mut replay: Vec<_> = pending
                .iter()
                .map(|(name, shard)| (name.clone(), shard.clone()))
                .collect();
            replay.sort_by(|a, b| a.0.cmp(&b.0));
            for (name, maybe_shard) in replay {
                match maybe_shard {
                    Some(shard) => {
                        cluster.insert(name, shard);
                    }
                    None => {
                        cluster.remove(&name);
                    }
                }
            }
            pending.clear();
        }

        let clear_event = matches!(event.update_type, UpdateType::Clear);
        let raw_clear_datum: HashMap<String, Shard> = event
            .shard_events
            .iter()
            .map(|delta| (delta.shard.name.clone(), delta.shard.clone()))
            .collect();

        *self.datum.lock() = cluster.clone();
        self.version.store(self.version().max(event.version), Ordering::Release);
        if transitioning_to_full {
            self.full.store(true, Ordering::Release);
        }

        let outgoing = if clear_event {
            Some(ClusterEventKind::Clear(raw_clear_datum))
        } else if transitioning_to_full {
            Some(ClusterEventKind::Full(cluster))
        } else {
            let shards: Vec<Shard> = event
                .shard_events
                .iter()
                .map(|delta| delta.shard.clone())
                .collect();
            match (event.update_type, shards) {
                (UpdateType::Add, shards) if !shards.is_empty() => {
                    Some(ClusterEventKind::Add(shards))
                }
                (UpdateType::Update, shards) if !shards.is_empty() => {
                    Some(ClusterEventKind::Update(shards))
                }
                (UpdateType::Delete, shards) if !shards.is_empty() => {
                    Some(ClusterEventKind::Delete(shards))
                }
                (UpdateType::Full | UpdateType::Clear, _) => Some(ClusterEventKind::Full(cluster)),
                (_, _) => {
                    warn!("cluster event carried no shard payload; dropping");
                    None
                }
            }
        };
        if let Some(outgoing) = outgoing {
            self.publisher.publish(&outgoing);
        }
    }
}

/// Per-subscription merge state for configuration (spec §4.4). Simpler
/// than cluster merging: every inbound event is a full replacement.
pub struct ConfigBooking {
    key: UrlKey,
    version: AtomicI64,
    full: AtomicBool,
    last_event_time: AtomicI64,
    datum: Mutex<Option<HashMap<String, String>>>,
    publisher: Publisher<ConfigEventKind>,
}

impl ConfigBooking {
    /// Creates an empty booking for `key`, `version = -1`, not yet full.
    #[must_use]
    pub fn new(key: UrlKey) -> Self {
        Self {
            key,
            version: AtomicI64::new(-1),
            full: AtomicBool::new(false),
            last_event_time: AtomicI64::new(0),
            datum: Mutex::new(None),
            publisher: Publisher::new(),
        }
    }

    /// Returns the identity key this booking was subscribed under.
    #[must_use]
    pub fn key(&self) -> &UrlKey {
        &self.key
    }

    /// Current version.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version.load(Ordering::Acquire)
    }

    /// Whether a snapshot has ever been merged in.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    /// Monotonic millis of the last inbound event.
    #[must_use]
    pub fn last_event_time(&self) -> i64 {
        self.last_event_time.load(Ordering::Acquire)
    }

    /// Clones the current full view, if any has arrived yet.
    #[must_use]
    pub fn snapshot(&self) -> Option<HashMap<String, String>> {
        self.datum.lock().clone()
    }

    /// `true` iff this booking holds a full snapshot, making it eligible
    /// for backup.
    #[must_use]
    pub fn is_persistable(&self) -> bool {
        self.is_full()
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.publisher.len()
    }

    /// Registers a handler, sending it a synthetic full event immediately
    /// if the booking is already full.
    pub fn add_handler(&self, handler: ConfigHandler) {
        self.publisher.add_handler(handler.clone());
        if let Some(datum) = self.snapshot() {
            self.publisher.publish_to(
                &handler,
                ConfigEventKind {
                    version: self.version(),
                    datum,
                },
            );
        }
    }

    /// Removes a handler. Returns `true` when no handlers remain.
    pub fn remove_handler(&self, handler: &ConfigHandler) -> bool {
        self.publisher.remove_handler(handler)
    }

    /// Merges one inbound event (spec §4.4): replace outright if this is
    /// the first snapshot or a newer version, otherwise drop.
    pub fn handle(&self, event: ConfigEvent) {
        self.last_event_time.store(now_millis(), Ordering::Release);

        if self.snapshot().is_none() || event.version > self.version() {
            let datum = event.datum.unwrap_or_default();
            *self.datum.lock() = Some(datum.clone());
            self.version.store(event.version, Ordering::Release);
            self.full.store(true, Ordering::Release);
            self.publisher.publish(&ConfigEventKind {
                version: event.version,
                datum,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ShardEvent;
    use reg_primitives::RegistryUrl;
    use std::sync::atomic::AtomicUsize;

    fn cluster_key() -> UrlKey {
        UrlKey::for_cluster(RegistryUrl::builder("rpc", "svc").build())
    }

    fn config_key() -> UrlKey {
        UrlKey::for_config(RegistryUrl::builder("rpc", "svc").path("cfg").build())
    }

    fn shard(name: &str) -> Shard {
        Shard {
            name: name.to_owned(),
            url: RegistryUrl::builder("rpc", name).build(),
            weight: 100,
            region: None,
            datacenter: None,
        }
    }

    fn add(name: &str) -> ShardEvent {
        ShardEvent {
            action: ShardAction::Add,
            shard: shard(name),
        }
    }

    fn delete(name: &str) -> ShardEvent {
        ShardEvent {
            action: ShardAction::Delete,
            shard: shard(name),
        }
    }

    #[test]
    fn pending_deltas_are_replayed_into_first_full_snapshot() {
        let booking = ClusterBooking::new(cluster_key());
        booking.handle(ClusterEvent {
            update_type: UpdateType::Add,
            version: 1,
            shard_events: vec![add("s1")],
            protect_null_datum: false,
        });
        booking.handle(ClusterEvent {
            update_type: UpdateType::Add,
            version: 2,
            shard_events: vec![add("s2")],
            protect_null_datum: false,
        });

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        booking.add_handler(Arc::new(move |event: ClusterEventKind| {
            sink.lock().push(event);
        }));

        booking.handle(ClusterEvent {
            update_type: UpdateType::Full,
            version: 5,
            shard_events: vec![add("s1"), add("s3")],
            protect_null_datum: false,
        });

        let events = received.lock();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ClusterEventKind::Full(datum) => {
                assert_eq!(datum.len(), 3);
                assert!(datum.contains_key("s1"));
                assert!(datum.contains_key("s2"));
                assert!(datum.contains_key("s3"));
            }
            other => panic!("expected Full, got {other:?}"),
        }
        assert!(booking.is_full());
        assert_eq!(booking.version(), 5);
    }

    #[test]
    fn null_protection_guard_suppresses_emptying_event() {
        let booking = ClusterBooking::new(cluster_key());
        booking.handle(ClusterEvent {
            update_type: UpdateType::Full,
            version: 1,
            shard_events: vec![add("s1")],
            protect_null_datum: true,
        });

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        booking.add_handler(Arc::new(move |_event: ClusterEventKind| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1); // synthetic FULL on join

        booking.handle(ClusterEvent {
            update_type: UpdateType::Delete,
            version: 2,
            shard_events: vec![delete("s1")],
            protect_null_datum: true,
        });

        assert_eq!(booking.snapshot().len(), 1);
        assert_eq!(booking.version(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1); // no new event published
    }

    #[test]
    fn multi_shard_add_batch_publishes_every_shard() {
        let booking = ClusterBooking::new(cluster_key());
        booking.handle(ClusterEvent {
            update_type: UpdateType::Full,
            version: 1,
            shard_events: vec![add("s1")],
            protect_null_datum: false,
        });

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        booking.add_handler(Arc::new(move |event: ClusterEventKind| {
            sink.lock().push(event);
        }));

        booking.handle(ClusterEvent {
            update_type: UpdateType::Add,
            version: 2,
            shard_events: vec![add("s2"), add("s3")],
            protect_null_datum: false,
        });

        let events = received.lock();
        // index 0 is the synthetic FULL sent on join.
        match &events[1] {
            ClusterEventKind::Add(shards) => {
                let names: Vec<&str> = shards.iter().map(|s| s.name.as_str()).collect();
                assert_eq!(names, vec!["s2", "s3"]);
            }
            other => panic!("expected Add, got {other:?}"),
        }
    }

    #[test]
    fn stale_event_after_full_is_dropped() {
        let booking = ClusterBooking::new(cluster_key());
        booking.handle(ClusterEvent {
            update_type: UpdateType::Full,
            version: 5,
            shard_events: vec![add("s1")],
            protect_null_datum: false,
        });
        booking.handle(ClusterEvent {
            update_type: UpdateType::Add,
            version: 3,
            shard_events: vec![add("s2")],
            protect_null_datum: false,
        });
        assert_eq!(booking.version(), 5);
        assert!(!booking.snapshot().contains_key("s2"));
    }

    #[test]
    fn config_booking_drops_stale_and_publishes_newer() {
        let booking = ConfigBooking::new(config_key());
        let mut first = HashMap::new();
        first.insert("a".to_owned(), "1".to_owned());
        booking.handle(ConfigEvent {
            version: 1,
            datum: Some(first),
        });

        let mut stale = HashMap::new();
        stale.insert("a".to_owned(), "stale".to_owned());
        booking.handle(ConfigEvent {
            version: 0,
            datum: Some(stale),
        });
        assert_eq!(booking.snapshot().unwrap().get("a").unwrap(), "1");

        let mut newer = HashMap::new();
        newer.insert("a".to_owned(), "2".to_owned());
        booking.handle(ConfigEvent {
            version: 2,
            datum: Some(newer),
        });
        assert_eq!(booking.snapshot().unwrap().get("a").unwrap(), "2");
    }

    #[test]
    fn remove_last_handler_reports_empty() {
        let booking = ConfigBooking::new(config_key());
        let handler: ConfigHandler = Arc::new(|_| {});
        booking.add_handler(handler.clone());
        assert!(booking.remove_handler(&handler));
    }
}
