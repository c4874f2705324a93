//! Error taxonomy for the registry controller (spec §7).
//!
//! The taxonomy is behavioral rather than type-exhaustive: retryable
//! transport failures drive the reconnect loop and task retry ladder,
//! non-retryable failures fail the caller's future outright, lifecycle
//! errors report operations attempted after close, and backup I/O errors
//! never reach this type at all — they are logged and swallowed at the
//! call site (§4.6).

use thiserror::Error;

/// Result alias used throughout the controller.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors surfaced to callers of [`crate::AbstractRegistry`] and to the
/// dispatcher's internal retry logic.
#[derive(Debug, Error, Clone)]
pub enum RegistryError {
    /// A driver hook reported a failure the `retry` policy considers
    /// transient (connection refused, timeout, remote unavailable, ...).
    #[error("retryable transport error: {reason}")]
    Retryable {
        /// Human-readable detail from the driver.
        reason: String,
    },

    /// A driver hook reported a failure the `retry` policy considers
    /// permanent (malformed request, permission denied, ...). The task's
    /// future fails immediately; the local registration/subscription stays
    /// in its map for operator inspection.
    #[error("non-retryable remote error: {reason}")]
    NonRetryable {
        /// Human-readable detail from the driver.
        reason: String,
    },

    /// The operation was attempted after the registry had already closed,
    /// or the controller shut down while the operation was outstanding.
    #[error("registry already closed")]
    AlreadyClosed,

    /// A lifecycle transition was attempted that the state machine does
    /// not permit from the current state (e.g. `open()` while `CLOSING`).
    #[error("invalid registry state transition: {detail}")]
    InvalidState {
        /// Human-readable detail about the rejected transition.
        detail: String,
    },

    /// Connect retries were exhausted per `maxConnectRetryTimes`.
    #[error("exhausted {attempts} connect attempts: {reason}")]
    ConnectRetriesExhausted {
        /// Number of attempts made before giving up.
        attempts: u32,
        /// The last failure's detail.
        reason: String,
    },

    /// The registry URL carried an invalid option value (spec §6.3).
    #[error(transparent)]
    Configuration(#[from] reg_config::ConfigError),
}

impl RegistryError {
    /// Convenience constructor for a retryable transport failure.
    #[must_use]
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for a non-retryable remote failure.
    #[must_use]
    pub fn non_retryable(reason: impl Into<String>) -> Self {
        Self::NonRetryable {
            reason: reason.into(),
        }
    }

    /// Returns `true` when the default retry policy should re-attempt the
    /// operation that produced this error. Mirrors the driver hook
    /// `retry(err) -> bool` from spec §6.1, whose default implementation
    /// "returns true unconditionally" — callers that need a stricter
    /// policy (e.g. never retry authentication failures) should consult
    /// their own driver's `retry` hook instead of this default.
    #[must_use]
    pub fn is_retryable_by_default(&self) -> bool {
        !matches!(
            self,
            Self::NonRetryable { .. }
                | Self::AlreadyClosed
                | Self::InvalidState { .. }
                | Self::Configuration(_)
        )
    }
}
