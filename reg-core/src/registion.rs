//! A single local registration and its lifecycle-bearing future pair
//! (spec §3 "StateFuture", "Registion").

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use reg_primitives::UrlKey;

use crate::task::{Completion, UrlFuture};

/// A pair of completion handles tracking a lifecycle-bearing entity's
/// current open attempt and close attempt. Re-created on reopen so a
/// caller who awaited a stale open-future after a subsequent `close()`
/// and `open()` does not observe a result from the wrong generation.
#[derive(Debug, Clone)]
pub struct StateFuture {
    open: Completion,
    close: Completion,
}

impl Default for StateFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl StateFuture {
    /// Creates a fresh, unresolved pair.
    #[must_use]
    pub fn new() -> Self {
        Self {
            open: Completion::new(),
            close: Completion::new(),
        }
    }

    /// Returns the open-side completion handle.
    #[must_use]
    pub fn open(&self) -> &Completion {
        &self.open
    }

    /// Returns the close-side completion handle.
    #[must_use]
    pub fn close(&self) -> &Completion {
        &self.close
    }

    /// Returns the open future, awaited by `register()` callers.
    #[must_use]
    pub fn open_future(&self) -> UrlFuture {
        self.open.future()
    }

    /// Returns the close future, awaited by `deregister()` callers.
    #[must_use]
    pub fn close_future(&self) -> UrlFuture {
        self.close.future()
    }
}

/// A single local registration: identity, reference count, and the
/// StateFuture pair tracking its current register/deregister attempt
/// (spec §3 "Registion").
#[derive(Debug)]
pub struct Registion {
    key: UrlKey,
    ref_count: AtomicUsize,
    future: parking_lot::Mutex<StateFuture>,
    /// Wall-clock millis of the last successful remote registration; 0
    /// before the first success or after close.
    register_time: AtomicI64,
}

impl Registion {
    /// Creates a registration with ref-count 1 and a fresh StateFuture.
    #[must_use]
    pub fn new(key: UrlKey) -> Self {
        Self {
            key,
            ref_count: AtomicUsize::new(1),
            future: parking_lot::Mutex::new(StateFuture::new()),
            register_time: AtomicI64::new(0),
        }
    }

    /// Returns the registration's identity key.
    #[must_use]
    pub fn key(&self) -> &UrlKey {
        &self.key
    }

    /// Increments the ref-count, as a second `register()` call on the same
    /// key does.
    pub fn increment(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the ref-count and returns the new value. Saturates at 0;
    /// callers must not decrement below an already-zero count.
    pub fn decrement(&self) -> usize {
        let previous = self.ref_count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            Some(n.saturating_sub(1))
        });
        previous.map(|n| n.saturating_sub(1)).unwrap_or(0)
    }

    /// Returns the current ref-count.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Returns a clone of the current StateFuture pair.
    #[must_use]
    pub fn state_future(&self) -> StateFuture {
        self.future.lock().clone()
    }

    /// Replaces the StateFuture with a fresh pair, as `close()` does before
    /// tearing the registration down, so any future `open()`/`register()`
    /// on the same key starts a new generation.
    pub fn renew_future(&self) {
        *self.future.lock() = StateFuture::new();
    }

    /// Records a successful remote registration at `millis`.
    pub fn mark_registered(&self, millis: i64) {
        self.register_time.store(millis, Ordering::Release);
    }

    /// Resets the last-registered timestamp to 0, as `close()` does.
    pub fn mark_closed(&self) {
        self.register_time.store(0, Ordering::Release);
    }

    /// Bumps the StateFuture to a fresh generation and resets
    /// `register_time` to 0, as `AbstractRegistry::close()` does to every
    /// Registion before delegating to the controller's shutdown (spec
    /// §4.1).
    pub fn close(&self) {
        self.renew_future();
        self.mark_closed();
    }

    /// Returns the wall-clock millis of the last successful registration,
    /// or 0 before the first success or after close.
    #[must_use]
    pub fn register_time(&self) -> i64 {
        self.register_time.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reg_primitives::RegistryUrl;

    fn key() -> UrlKey {
        UrlKey::for_register(RegistryUrl::builder("rpc", "svc").path("svc").build())
    }

    #[test]
    fn starts_at_ref_count_one() {
        let registion = Registion::new(key());
        assert_eq!(registion.ref_count(), 1);
    }

    #[test]
    fn increment_and_decrement_track_ref_count() {
        let registion = Registion::new(key());
        assert_eq!(registion.increment(), 2);
        assert_eq!(registion.decrement(), 1);
        assert_eq!(registion.decrement(), 0);
    }

    #[test]
    fn decrement_saturates_at_zero() {
        let registion = Registion::new(key());
        registion.decrement();
        assert_eq!(registion.decrement(), 0);
    }

    #[test]
    fn renew_future_replaces_completion_pair() {
        let registion = Registion::new(key());
        let before = registion.state_future();
        registion.renew_future();
        let after = registion.state_future();
        before.open().complete(Ok(RegistryUrl::builder("rpc", "svc").build()));
        assert!(!after.open().is_completed());
    }

    #[test]
    fn register_time_round_trips() {
        let registion = Registion::new(key());
        assert_eq!(registion.register_time(), 0);
        registion.mark_registered(42);
        assert_eq!(registion.register_time(), 42);
        registion.mark_closed();
        assert_eq!(registion.register_time(), 0);
    }
}
