//! Canonical key derivation and the [`UrlKey`] identity type.
//!
//! A [`UrlKey`] pairs a [`RegistryUrl`] with a canonical string derived from
//! a subset of its fields. Equality and hashing are based solely on that
//! string, so two URLs that differ only in attributes outside the
//! canonicalization projection are considered the same registration or
//! subscription.

use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};

use crate::url::RegistryUrl;

const GLOBAL_SETTING: &str = "GLOBAL_SETTING";

/// Projects a URL onto the register-key string: `scheme/path?alias=..&role=..`.
#[must_use]
pub fn register_key(url: &RegistryUrl) -> String {
    let alias = url.parameter_or("alias", "");
    let role = url.parameter_or("role", "");
    format!(
        "{}/{}?alias={}&role={}",
        url.scheme(),
        url.path(),
        alias,
        role
    )
}

/// Projects a URL onto the cluster subscription key: the register key with
/// `type=cluster` appended to disambiguate it from a config subscription
/// on the same URL.
#[must_use]
pub fn cluster_key(url: &RegistryUrl) -> String {
    format!("{}&type=cluster", register_key(url))
}

/// Projects a URL onto the config subscription key. When the URL carries no
/// path, the canonical key is the literal [`GLOBAL_SETTING`] sentinel
/// rather than a per-path key, so every global-config subscriber observes
/// the same booking.
#[must_use]
pub fn config_key(url: &RegistryUrl) -> String {
    if url.path().is_empty() {
        GLOBAL_SETTING.to_owned()
    } else {
        format!("{}&type=config", register_key(url))
    }
}

/// Immutable identity pairing a [`RegistryUrl`] with its canonical key.
#[derive(Clone)]
pub struct UrlKey {
    url: RegistryUrl,
    key: String,
}

impl UrlKey {
    /// Builds a `UrlKey` for a registration.
    #[must_use]
    pub fn for_register(url: RegistryUrl) -> Self {
        let key = register_key(&url);
        Self { url, key }
    }

    /// Builds a `UrlKey` for a cluster subscription.
    #[must_use]
    pub fn for_cluster(url: RegistryUrl) -> Self {
        let key = cluster_key(&url);
        Self { url, key }
    }

    /// Builds a `UrlKey` for a config subscription.
    #[must_use]
    pub fn for_config(url: RegistryUrl) -> Self {
        let key = config_key(&url);
        Self { url, key }
    }

    /// Returns the underlying URL.
    #[must_use]
    pub fn url(&self) -> &RegistryUrl {
        &self.url
    }

    /// Returns the canonical key string used for equality and map lookups.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Debug for UrlKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlKey").field("key", &self.key).finish()
    }
}

impl PartialEq for UrlKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for UrlKey {}

impl Hash for UrlKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str, alias: &str, role: &str) -> RegistryUrl {
        RegistryUrl::builder("rpc", "svc")
            .path(path)
            .parameter("alias", alias)
            .parameter("role", role)
            .build()
    }

    #[test]
    fn register_key_ignores_non_projected_fields() {
        let a = url("svc", "A", "provider").with_parameter("weight", "100");
        let b = url("svc", "A", "provider").with_parameter("weight", "200");
        assert_eq!(register_key(&a), register_key(&b));
    }

    #[test]
    fn cluster_and_config_keys_disambiguate_same_url() {
        let u = url("svc", "A", "provider");
        assert_ne!(cluster_key(&u), config_key(&u));
    }

    #[test]
    fn config_key_empty_path_is_global_setting() {
        let u = RegistryUrl::builder("rpc", "svc").build();
        assert_eq!(config_key(&u), "GLOBAL_SETTING");
    }

    #[test]
    fn url_key_equality_is_key_based() {
        let a = UrlKey::for_register(url("svc", "A", "provider").with_parameter("weight", "1"));
        let b = UrlKey::for_register(url("svc", "A", "provider").with_parameter("weight", "2"));
        assert_eq!(a, b);
    }
}
