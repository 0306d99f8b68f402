// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! Advances the global checkpoint of continuous log backup tasks.
//!
//! Storage nodes flush their buffered log per region and report a "last
//! flushed ts" for each. A restore is only safe up to the minimum of those
//! over all regions of the task's key ranges. This crate hosts the control
//! loop that computes and publishes that minimum: it watches the task set in
//! the meta service, collects per-region flush timestamps (by polling the
//! stores or by subscribing to their push streams), folds them into an
//! interval map over the task's key space, and writes the resulting global
//! checkpoint and service GC safe point back. At most one instance holds the
//! advancing duty at a time, gated by an election over the meta service.

#[macro_use]
extern crate slog;
#[macro_use]
extern crate slog_scope;

pub mod advancer;
pub mod collector;
pub mod config;
pub mod env;
pub mod errors;
pub mod metadata;
pub mod metrics;
pub mod owner;
pub mod spans;
pub mod subscription;
pub mod types;
pub mod utils;

pub use advancer::CheckpointAdvancer;
pub use collector::{ClusterCollector, CollectResult};
pub use config::Config;
pub use env::AdvancerEnv;
pub use owner::{EtcdOwnerManager, ManualOwner, OwnerDaemon, OwnerManager, TickingDaemon};
pub use subscription::{FlushSubscriber, MergeSink};
