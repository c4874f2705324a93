//! Typed configuration options read from a [`RegistryUrl`](reg_primitives::RegistryUrl).
//!
//! The registry controller is configured entirely through URL query
//! parameters (§6.3 of the design): no separate config file format is
//! defined, matching the non-goal that URL parsing itself stays out of the
//! core's concern and is handled here, once, at controller construction
//! time.

#![warn(missing_docs, clippy::pedantic)]

use std::time::Duration;

use reg_primitives::RegistryUrl;
use thiserror::Error;
use tracing::warn;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors produced while deriving [`RegistryOptions`] from a URL.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A parameter was present but failed to parse as its expected type.
    #[error(transparent)]
    InvalidParameter(#[from] reg_primitives::Error),

    /// `taskRetryInterval` was zero, which would spin the dispatcher.
    #[error("taskRetryInterval must be greater than zero milliseconds")]
    ZeroRetryInterval,
}

/// Options governing a single controller session, derived once from the
/// registry URL at `open()` time.
#[derive(Debug, Clone, Copy)]
pub struct RegistryOptions {
    max_connect_retry_times: i64,
    task_retry_interval: Duration,
    max_idle_wait: Duration,
}

impl RegistryOptions {
    /// Derives options from a [`RegistryUrl`], falling back to the defaults
    /// documented in spec §6.3 for any parameter that is absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a present parameter fails to parse, or
    /// when `taskRetryInterval` resolves to zero.
    pub fn from_url(url: &RegistryUrl) -> Result<Self> {
        let max_connect_retry_times = url
            .parameter_parsed::<i64>("maxConnectRetryTimes")?
            .unwrap_or(-1);

        let task_retry_interval_ms = url
            .parameter_parsed::<u64>("taskRetryInterval")?
            .unwrap_or(500);
        if task_retry_interval_ms == 0 {
            return Err(ConfigError::ZeroRetryInterval);
        }

        let max_idle_wait_ms = url
            .parameter_parsed::<u64>("maxIdleWaitMillis")?
            .unwrap_or(10_000);
        if max_idle_wait_ms == 0 {
            warn!("maxIdleWaitMillis=0 requested; the dispatcher will busy-poll");
        }

        Ok(Self {
            max_connect_retry_times,
            task_retry_interval: Duration::from_millis(task_retry_interval_ms),
            max_idle_wait: Duration::from_millis(max_idle_wait_ms.max(1)),
        })
    }

    /// Returns the connect-retry budget: negative means unbounded, zero
    /// means no retry, positive is the bounded attempt count.
    #[must_use]
    pub const fn max_connect_retry_times(self) -> i64 {
        self.max_connect_retry_times
    }

    /// Returns the delay inserted before a failed task is retried.
    #[must_use]
    pub const fn task_retry_interval(self) -> Duration {
        self.task_retry_interval
    }

    /// Returns the cap on how long the dispatcher waits for the next
    /// scheduled task before it takes an idle turn (and may run backup).
    #[must_use]
    pub const fn max_idle_wait(self) -> Duration {
        self.max_idle_wait
    }
}

/// Resolves the logical name of a registry session: the `name` parameter
/// if present, otherwise the URL's scheme.
#[must_use]
pub fn registry_name(url: &RegistryUrl) -> String {
    url.parameter("name").map_or_else(|| url.scheme().to_owned(), str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let url = RegistryUrl::builder("rpc", "svc").build();
        let options = RegistryOptions::from_url(&url).unwrap();
        assert_eq!(options.max_connect_retry_times(), -1);
        assert_eq!(options.task_retry_interval(), Duration::from_millis(500));
        assert_eq!(options.max_idle_wait(), Duration::from_secs(10));
    }

    #[test]
    fn reads_overrides() {
        let url = RegistryUrl::builder("rpc", "svc")
            .parameter("maxConnectRetryTimes", "3")
            .parameter("taskRetryInterval", "250")
            .build();
        let options = RegistryOptions::from_url(&url).unwrap();
        assert_eq!(options.max_connect_retry_times(), 3);
        assert_eq!(options.task_retry_interval(), Duration::from_millis(250));
    }

    #[test]
    fn rejects_zero_retry_interval() {
        let url = RegistryUrl::builder("rpc", "svc")
            .parameter("taskRetryInterval", "0")
            .build();
        let err = RegistryOptions::from_url(&url).unwrap_err();
        assert_eq!(err, ConfigError::ZeroRetryInterval);
    }

    #[test]
    fn name_falls_back_to_scheme() {
        let url = RegistryUrl::builder("zookeeper", "svc").build();
        assert_eq!(registry_name(&url), "zookeeper");

        let named = url.with_parameter("name", "primary");
        assert_eq!(registry_name(&named), "primary");
    }
}
