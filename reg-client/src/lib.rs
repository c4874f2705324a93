//! Registry client SDK facade.
//!
//! Depend on this crate via `cargo add reg-client`. It bundles the internal
//! `reg-*` crates behind feature flags so downstream users can depend on
//! just the identity/config layer, or pull in the full controller.

#![warn(missing_docs, clippy::pedantic)]

/// URL/key identity types with no async runtime dependency (enabled by the
/// `primitives` feature).
#[cfg(feature = "primitives")]
pub use reg_primitives as primitives;

/// Typed options parsed from a registry URL's query parameters (enabled by
/// the `config` feature).
#[cfg(feature = "config")]
pub use reg_config as config;

/// The lifecycle state machine, dispatcher, and `AbstractRegistry` facade
/// (enabled by the `core` feature).
#[cfg(feature = "core")]
pub use reg_core as core;
