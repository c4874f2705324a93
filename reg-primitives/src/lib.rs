//! Identity primitives shared by the registry controller crates.
//!
//! This crate has no async runtime dependency: it carries only the URL
//! type and the canonical-key derivation rules that registrations and
//! subscriptions are keyed on.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod key;
mod url;

/// Error type and result alias shared across the primitives crate.
pub use error::{Error, Result};
/// Canonical key derivation and the `UrlKey` identity type.
pub use key::{UrlKey, cluster_key, config_key, register_key};
/// The registry connection URL type.
pub use url::{RegistryUrl, RegistryUrlBuilder};
