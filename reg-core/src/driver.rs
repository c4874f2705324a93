//! Boundary contract to the concrete registry transport and backup store
//! (spec §6). Neither trait is implemented in this crate; a ZooKeeper-,
//! etcd- or Nacos-backed implementation plugs in by providing one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::RegistryError;
use reg_primitives::{RegistryUrl, UrlKey};

/// The kind of a shard-membership event, determining how
/// [`crate::booking::ClusterBooking`] merges it (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    /// A complete replacement of the cluster's membership.
    Full,
    /// An incremental add/update/remove batch.
    Update,
    /// A single shard was added.
    Add,
    /// A single shard was removed.
    Delete,
    /// The cluster was explicitly cleared.
    Clear,
}

impl UpdateType {
    /// Whether this update type carries a complete snapshot rather than an
    /// incremental delta.
    #[must_use]
    pub const fn is_full_datum(self) -> bool {
        matches!(self, Self::Full | Self::Clear)
    }
}

/// One member instance of a service cluster (spec GLOSSARY "Shard").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    /// Logical instance name, unique within its cluster.
    pub name: String,
    /// Connection URL of the instance.
    pub url: RegistryUrl,
    /// Load-balancing weight.
    pub weight: u32,
    /// Deployment region, if the driver reports one.
    pub region: Option<String>,
    /// Deployment datacenter, if the driver reports one.
    pub datacenter: Option<String>,
}

/// The per-shard action carried by one entry of a [`ClusterEvent`]'s shard
/// list, independent of the event's own [`UpdateType`] — a `Full` event is
/// simply a list of `Add` actions covering the entire membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardAction {
    /// Add (or overwrite) a shard.
    Add,
    /// Update an existing shard in place.
    Update,
    /// Remove a shard, subject to null-protection (spec §4.3 rule 6).
    Delete,
}

/// One shard-level delta within a [`ClusterEvent`].
#[derive(Debug, Clone)]
pub struct ShardEvent {
    /// What to do with `shard`.
    pub action: ShardAction,
    /// The shard this delta concerns.
    pub shard: Shard,
}

/// A single inbound cluster-membership update (spec §4.3, §6.4).
#[derive(Debug, Clone)]
pub struct ClusterEvent {
    /// What kind of update this is.
    pub update_type: UpdateType,
    /// Monotonic version assigned by the source.
    pub version: i64,
    /// Shard-level deltas carried by this event (empty for `Clear`).
    pub shard_events: Vec<ShardEvent>,
    /// Whether a non-empty cluster must never be collapsed to empty by this
    /// event (spec GLOSSARY "protectNullDatum").
    pub protect_null_datum: bool,
}

/// A single inbound configuration update (spec §4.4, §6.4).
#[derive(Debug, Clone)]
pub struct ConfigEvent {
    /// Monotonic version assigned by the source.
    pub version: i64,
    /// The full key/value replacement, or `None` for an empty config.
    pub datum: Option<HashMap<String, String>>,
}

/// User-visible cluster event shape delivered by the publisher (spec §6.4).
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEventKind {
    /// The handler's first (or a resynchronized) complete view.
    Full(HashMap<String, Shard>),
    /// One or more shards were added, carrying every shard the inbound
    /// batch added (not just the first).
    Add(Vec<Shard>),
    /// One or more shards were updated, carrying every shard the inbound
    /// batch updated.
    Update(Vec<Shard>),
    /// One or more shards were removed, carrying every shard the inbound
    /// batch removed.
    Delete(Vec<Shard>),
    /// The cluster was cleared; carries the raw event datum as received,
    /// not the merged view (spec §9 open question — preserved to match
    /// observable upstream behavior).
    Clear(HashMap<String, Shard>),
}

/// User-visible config event shape delivered by the publisher (spec §6.4).
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigEventKind {
    /// Version this snapshot corresponds to.
    pub version: i64,
    /// The full key/value view.
    pub datum: HashMap<String, String>,
}

/// A serializable snapshot of one cluster booking's full datum, keyed by
/// cluster key, suitable for handing to a [`BackupStore`] (spec §6.2).
pub type ShardRecordSet = Vec<Shard>;

/// Everything the controller backs up on an idle dispatcher turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupDatum {
    /// Cluster key → list of shard records.
    pub clusters: HashMap<String, Vec<ShardRecordSerde>>,
    /// Config key → key/value map.
    pub configs: HashMap<String, HashMap<String, String>>,
}

/// Serde-friendly mirror of [`Shard`] used only at the backup boundary, so
/// [`BackupDatum`] stays free of the non-`Serialize` parts of [`RegistryUrl`]
/// callers might swap out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecordSerde {
    /// Logical instance name.
    pub name: String,
    /// Connection URL, serialized as its canonical string form.
    pub url: String,
    /// Load-balancing weight.
    pub weight: u32,
    /// Deployment region, if reported.
    pub region: Option<String>,
    /// Deployment datacenter, if reported.
    pub datacenter: Option<String>,
}

impl From<&Shard> for ShardRecordSerde {
    fn from(shard: &Shard) -> Self {
        Self {
            name: shard.name.clone(),
            url: shard.url.to_string(),
            weight: shard.weight,
            region: shard.region.clone(),
            datacenter: shard.datacenter.clone(),
        }
    }
}

/// Handler callback for cluster subscriptions.
pub type ClusterHandler = std::sync::Arc<dyn Fn(ClusterEventKind) + Send + Sync>;

/// Handler callback for config subscriptions.
pub type ConfigHandler = std::sync::Arc<dyn Fn(ConfigEventKind) + Send + Sync>;

/// Boundary contract implemented by a concrete registry transport (spec
/// §6.1). All hooks are async and non-blocking; a driver that must block
/// should spawn its own background work and resolve the returned future
/// once that work completes.
#[async_trait]
pub trait RegistryDriver: Send + Sync {
    /// Establishes a session. Must be idempotent against a redundant call
    /// while already connected.
    async fn do_connect(&self) -> Result<(), RegistryError>;

    /// Tears down the session. Must never fail the caller; log internally.
    async fn disconnect(&self);

    /// Transmits a registration; resolves when the remote acknowledges.
    async fn do_register(&self, key: &UrlKey) -> Result<(), RegistryError>;

    /// Symmetric to [`RegistryDriver::do_register`].
    async fn do_deregister(&self, key: &UrlKey) -> Result<(), RegistryError>;

    /// Starts a cluster subscription; incoming events must be routed to
    /// the owning booking's `handle` (not modeled in this trait; the
    /// driver is expected to hold a channel or callback wired up
    /// out-of-band by the concrete implementation).
    async fn do_subscribe_cluster(&self, key: &UrlKey) -> Result<(), RegistryError>;

    /// Starts a config subscription, symmetric to
    /// [`RegistryDriver::do_subscribe_cluster`].
    async fn do_subscribe_config(&self, key: &UrlKey) -> Result<(), RegistryError>;

    /// Stops a cluster subscription.
    async fn do_unsubscribe_cluster(&self, key: &UrlKey) -> Result<(), RegistryError>;

    /// Stops a config subscription.
    async fn do_unsubscribe_config(&self, key: &UrlKey) -> Result<(), RegistryError>;

    /// Policy predicate: is `err` retryable? Defaults to the error's own
    /// [`RegistryError::is_retryable_by_default`], which drivers may
    /// override (e.g. to never retry authentication failures, per the
    /// spec's open recommendation).
    fn retry(&self, err: &RegistryError) -> bool {
        err.is_retryable_by_default()
    }
}

/// Boundary contract for persisting the last-known full datum to an
/// external store (spec §6.2). Errors are logged and swallowed by the
/// caller; this trait never propagates failures into task dispatch.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Persists `datum` under the registry's logical `name`.
    async fn backup(&self, name: &str, datum: &BackupDatum) -> Result<(), RegistryError>;

    /// Loads the last persisted datum for `name`, if any exists.
    async fn restore(&self, name: &str) -> Result<Option<BackupDatum>, RegistryError>;
}
