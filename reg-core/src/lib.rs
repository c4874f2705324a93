//! Client-side service discovery registry controller.
//!
//! This crate implements the lifecycle state machine, single-threaded task
//! dispatcher, and cluster/config event-merge engines that sit behind
//! [`AbstractRegistry`], the facade a concrete registry client (ZooKeeper-,
//! etcd-, Nacos-backed, ...) builds on by providing a [`RegistryDriver`]
//! (and optionally a [`BackupStore`]).

#![warn(missing_docs, clippy::pedantic)]

mod booking;
mod controller;
mod driver;
mod error;
mod facade;
mod lifecycle;
mod queue;
mod registion;
mod task;

pub use booking::{ClusterBooking, ConfigBooking, Publisher};
pub use controller::RegistryController;
pub use driver::{
    BackupDatum, BackupStore, ClusterEvent, ClusterEventKind, ClusterHandler, ConfigEvent,
    ConfigEventKind, ConfigHandler, RegistryDriver, Shard, ShardAction, ShardEvent,
    ShardRecordSerde, ShardRecordSet, UpdateType,
};
pub use error::{RegistryError, Result};
pub use facade::AbstractRegistry;
pub use lifecycle::{LifecycleGate, LifecycleState, TransitionOutcome};
pub use queue::TaskQueue;
pub use registion::{Registion, StateFuture};
pub use task::{
    Completion, GenericCompletion, Task, TaskBody, TaskKind, UrlFuture, UrlResult, VoidCompletion,
    VoidFuture, VoidResult,
};
