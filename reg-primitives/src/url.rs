//! A minimal, allocation-light URL type carrying registry connection
//! parameters and semantic attributes.
//!
//! This is deliberately not a general-purpose URI parser — the registry
//! controller only ever needs `scheme://host[:port]/path?k=v&k2=v2`, and
//! ties query parameters to a sorted map so canonical keys (see
//! [`crate::key`]) are stable regardless of insertion order.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A registry connection URL: scheme, host, optional port, path, and a
/// sorted table of query parameters.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RegistryUrl {
    scheme: String,
    host: String,
    port: Option<u16>,
    path: String,
    params: BTreeMap<String, String>,
}

impl RegistryUrl {
    /// Starts building a [`RegistryUrl`] for the given scheme and host.
    #[must_use]
    pub fn builder(scheme: impl Into<String>, host: impl Into<String>) -> RegistryUrlBuilder {
        RegistryUrlBuilder {
            scheme: scheme.into(),
            host: host.into(),
            port: None,
            path: String::new(),
            params: BTreeMap::new(),
        }
    }

    /// Returns the URL scheme (e.g. `zookeeper`, `etcd`, `nacos`).
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Returns the host component.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port, if one was specified.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Returns the path component (without a leading `/` for the empty path).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the value of a query parameter, if present.
    #[must_use]
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Returns the value of a query parameter, or `default` when absent.
    #[must_use]
    pub fn parameter_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.parameter(key).unwrap_or(default)
    }

    /// Parses a query parameter as `T`, returning `Ok(None)` when the
    /// parameter is absent and `Err` when present but unparsable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] when the parameter is present but
    /// does not parse as `T`.
    pub fn parameter_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
    {
        match self.parameter(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| Error::InvalidParameter {
                key: key.to_owned(),
                value: raw.to_owned(),
            }),
        }
    }

    /// Returns an iterator over all query parameters.
    pub fn parameters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns a new URL with `key=value` added or overwritten.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

impl Display for RegistryUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "/{}", self.path)?;
        if !self.params.is_empty() {
            write!(f, "?")?;
            for (index, (key, value)) in self.params.iter().enumerate() {
                if index > 0 {
                    write!(f, "&")?;
                }
                write!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for RegistryUrl {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let (scheme, rest) = input.split_once("://").ok_or(Error::MalformedUrl {
            input: input.to_owned(),
            reason: "missing `scheme://` prefix",
        })?;
        if scheme.is_empty() {
            return Err(Error::MalformedUrl {
                input: input.to_owned(),
                reason: "empty scheme",
            });
        }

        let (authority_and_path, query) = match rest.split_once('?') {
            Some((head, tail)) => (head, Some(tail)),
            None => (rest, None),
        };

        let (authority, path) = match authority_and_path.split_once('/') {
            Some((head, tail)) => (head, tail),
            None => (authority_and_path, ""),
        };

        if authority.is_empty() {
            return Err(Error::MalformedUrl {
                input: input.to_owned(),
                reason: "empty host",
            });
        }

        let (host, port) = match authority.split_once(':') {
            Some((host, port_str)) => {
                let port = port_str.parse::<u16>().map_err(|_| Error::MalformedUrl {
                    input: input.to_owned(),
                    reason: "invalid port",
                })?;
                (host, Some(port))
            }
            None => (authority, None),
        };

        let mut params = BTreeMap::new();
        if let Some(query) = query {
            if !query.is_empty() {
                for pair in query.split('&') {
                    let (key, value) = pair.split_once('=').ok_or(Error::MalformedUrl {
                        input: input.to_owned(),
                        reason: "query parameter missing `=`",
                    })?;
                    params.insert(key.to_owned(), value.to_owned());
                }
            }
        }

        Ok(Self {
            scheme: scheme.to_owned(),
            host: host.to_owned(),
            port,
            path: path.to_owned(),
            params,
        })
    }
}

/// Builder for [`RegistryUrl`].
#[derive(Debug, Clone)]
pub struct RegistryUrlBuilder {
    scheme: String,
    host: String,
    port: Option<u16>,
    path: String,
    params: BTreeMap<String, String>,
}

impl RegistryUrlBuilder {
    /// Sets the port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Adds a query parameter.
    #[must_use]
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Finalizes the URL.
    #[must_use]
    pub fn build(self) -> RegistryUrl {
        RegistryUrl {
            scheme: self.scheme,
            host: self.host,
            port: self.port,
            path: self.path,
            params: self.params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_parse() {
        let url = RegistryUrl::builder("rpc", "svc")
            .parameter("alias", "A")
            .parameter("role", "provider")
            .build();

        let parsed: RegistryUrl = url.to_string().parse().unwrap();
        assert_eq!(url, parsed);
    }

    #[test]
    fn parses_scheme_host_port_path_and_query() {
        let url: RegistryUrl = "zookeeper://127.0.0.1:2181/services?alias=A&role=provider"
            .parse()
            .unwrap();
        assert_eq!(url.scheme(), "zookeeper");
        assert_eq!(url.host(), "127.0.0.1");
        assert_eq!(url.port(), Some(2181));
        assert_eq!(url.path(), "services");
        assert_eq!(url.parameter("alias"), Some("A"));
        assert_eq!(url.parameter("role"), Some("provider"));
    }

    #[test]
    fn rejects_missing_scheme_separator() {
        let err = "not-a-url".parse::<RegistryUrl>().unwrap_err();
        assert!(matches!(err, Error::MalformedUrl { .. }));
    }

    #[test]
    fn parameter_parsed_rejects_bad_values() {
        let url = RegistryUrl::builder("rpc", "svc")
            .parameter("maxConnectRetryTimes", "not-a-number")
            .build();
        let err = url.parameter_parsed::<i64>("maxConnectRetryTimes").unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));
    }

    #[test]
    fn empty_path_defaults_to_empty_string() {
        let url: RegistryUrl = "rpc://svc".parse().unwrap();
        assert_eq!(url.path(), "");
    }
}
