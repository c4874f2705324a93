//! The registry's lifecycle state machine (spec §9): `Closed → Opening →
//! Open → Closing → Closed`, guarded by a compare-and-swap on an atomic
//! state field so concurrent callers never observe a torn transition.

use std::sync::atomic::{AtomicU8, Ordering};

use tracing::debug;

use crate::error::RegistryError;

/// The four states a registry session can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// No controller exists; the registry has never been opened, or a
    /// prior controller finished closing.
    Closed = 0,
    /// A controller has been constructed and is attempting its first
    /// connect; user operations are queued against the eventual `Open`
    /// state rather than rejected.
    Opening = 1,
    /// The controller is connected (or has at least completed its first
    /// connect attempt) and accepts register/subscribe operations directly.
    Open = 2,
    /// The controller is draining in-flight work before its worker stops.
    Closing = 3,
}

impl LifecycleState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Closed,
            1 => Self::Opening,
            2 => Self::Open,
            _ => Self::Closing,
        }
    }
}

/// Outcome of requesting a transition: whether the caller is the one who
/// should actually perform the transition's side effect (construct a
/// controller, tear one down, ...), or whether an equivalent transition is
/// already underway and the caller should just await the existing future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The caller won the CAS and must perform the transition's work.
    Proceed,
    /// An equivalent transition is already in flight or complete; the
    /// caller should reuse the existing future instead of starting new
    /// work (this is what makes `open()`/`close()` idempotent).
    AlreadyInProgress,
}

/// Atomic gate implementing the four-state machine.
#[derive(Debug)]
pub struct LifecycleGate {
    state: AtomicU8,
}

impl Default for LifecycleGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleGate {
    /// Creates a gate starting in [`LifecycleState::Closed`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Closed as u8),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` iff the gate is in [`LifecycleState::Open`].
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == LifecycleState::Open
    }

    /// Attempts `Closed -> Opening`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidState`] when the gate is currently
    /// `Closing` (a close is in flight; the caller must wait for it).
    pub fn begin_open(&self) -> Result<TransitionOutcome, RegistryError> {
        match self.compare_exchange(LifecycleState::Closed, LifecycleState::Opening) {
            Ok(()) => Ok(TransitionOutcome::Proceed),
            Err(LifecycleState::Opening | LifecycleState::Open) => {
                Ok(TransitionOutcome::AlreadyInProgress)
            }
            Err(other) => Err(RegistryError::InvalidState {
                detail: format!("cannot open while {other:?}"),
            }),
        }
    }

    /// Completes `Opening -> Open`.
    pub fn complete_open(&self) {
        self.force(LifecycleState::Open);
    }

    /// Attempts `Open -> Closing`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidState`] when the gate is currently
    /// `Opening` (the caller should await the open future first).
    pub fn begin_close(&self) -> Result<TransitionOutcome, RegistryError> {
        match self.compare_exchange(LifecycleState::Open, LifecycleState::Closing) {
            Ok(()) => Ok(TransitionOutcome::Proceed),
            Err(LifecycleState::Closing | LifecycleState::Closed) => {
                Ok(TransitionOutcome::AlreadyInProgress)
            }
            Err(other) => Err(RegistryError::InvalidState {
                detail: format!("cannot close while {other:?}"),
            }),
        }
    }

    /// Completes `Closing -> Closed`, making the gate eligible for another
    /// `open()` with a freshly constructed controller.
    pub fn complete_close(&self) {
        self.force(LifecycleState::Closed);
    }

    /// Forces `Opening -> Closed` after an in-flight open attempt failed
    /// (connect retries exhausted). Without this, a failed `open()` would
    /// strand the gate in `Opening` forever, since only `complete_open`
    /// advances it and nothing would ever call that.
    pub fn abort_open(&self) {
        self.force(LifecycleState::Closed);
    }

    fn compare_exchange(
        &self,
        expected: LifecycleState,
        new: LifecycleState,
    ) -> Result<(), LifecycleState> {
        self.state
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| {
                debug!(from = ?expected, to = ?new, "registry lifecycle transition");
            })
            .map_err(LifecycleState::from_u8)
    }

    fn force(&self, new: LifecycleState) {
        let previous = LifecycleState::from_u8(self.state.swap(new as u8, Ordering::AcqRel));
        debug!(from = ?previous, to = ?new, "registry lifecycle transition");
    }
}
