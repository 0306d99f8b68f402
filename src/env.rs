// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The cluster-facing interfaces the advancer consumes. The services behind
//! them (region placement, the log backup endpoint on every store, the
//! timestamp oracle, GC coordination and the transaction layer) are external
//! collaborators; the advancer only ever talks to them through these traits.

use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use futures::Stream;

use crate::{
    errors::Result,
    types::{KeyRange, LockInfo, Region, RegionInfo, TimeStamp},
};

/// One per-region reply of a "get last flush ts" request.
#[derive(Debug, Clone)]
pub enum GetCheckpointResult {
    Ok {
        region: Region,
        checkpoint: TimeStamp,
    },
    /// The store doesn't track the region, maybe it isn't the leader or the
    /// region has never flushed. Don't retry within the tick.
    NotFound { region_id: u64 },
    /// The store knows the region but lost its progress record. Transient.
    DataLoss { region_id: u64 },
}

impl GetCheckpointResult {
    pub fn ok(region: Region, checkpoint: TimeStamp) -> Self {
        Self::Ok { region, checkpoint }
    }

    pub fn region_id(&self) -> u64 {
        match self {
            Self::Ok { region, .. } => region.id,
            Self::NotFound { region_id } | Self::DataLoss { region_id } => *region_id,
        }
    }
}

/// An incremental flush report pushed by a store: the range got persisted to
/// the external storage up to the timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushEvent {
    pub range: KeyRange,
    pub checkpoint: TimeStamp,
}

/// The push stream of one store. Each item is a batch of flush reports; an
/// empty batch is a heartbeat.
pub type FlushEventStream = Pin<Box<dyn Stream<Item = Result<Vec<FlushEvent>>> + Send>>;

/// Paginated access to the region topology kept by the meta service.
#[async_trait]
pub trait RegionScanner: Clone + Send + Sync + 'static {
    /// List up to `limit` leader regions intersecting `[from_key, end_key)`,
    /// in key order. An empty `end_key` means unbounded above.
    async fn scan_regions(
        &self,
        from_key: &[u8],
        end_key: &[u8],
        limit: usize,
    ) -> Result<Vec<RegionInfo>>;

    /// The ids of the stores currently alive in the cluster.
    async fn stores(&self) -> Result<Vec<u64>>;

    /// Drop the cached topology learned from the store, so the next scan
    /// fetches it afresh.
    async fn invalidate_store_cache(&self, store_id: u64) -> Result<()>;
}

/// The log backup service running on every store.
#[async_trait]
pub trait LogBackupService: Clone + Send + Sync + 'static {
    /// Ask one store for the last flush ts of the regions it owns.
    async fn get_last_flush_ts_of_regions(
        &self,
        store_id: u64,
        regions: Vec<Region>,
    ) -> Result<Vec<GetCheckpointResult>>;

    /// Open the long-lived flush-event stream of one store.
    async fn subscribe_flush_events(&self, store_id: u64) -> Result<FlushEventStream>;
}

/// The timestamp oracle.
#[async_trait]
pub trait TsoService: Clone + Send + Sync + 'static {
    async fn get_tso(&self) -> Result<TimeStamp>;
}

/// Service GC safe point coordination with the meta service.
#[async_trait]
pub trait SafePointManager: Clone + Send + Sync + 'static {
    /// Keep data newer than `ts` from being garbage collected, in the name of
    /// `service`. A zero `ttl` unregisters the safe point.
    async fn update_service_safe_point(
        &self,
        service: &str,
        ts: TimeStamp,
        ttl: Duration,
    ) -> Result<()>;
}

/// The transaction layer's view over pending locks.
#[async_trait]
pub trait PendingLockScanner: Clone + Send + Sync + 'static {
    /// Scan up to `limit` locks in the range with `lock_ts <= max_ts`.
    async fn scan_locks(
        &self,
        range: &KeyRange,
        max_ts: TimeStamp,
        limit: usize,
    ) -> Result<Vec<LockInfo>>;

    /// Resolve the locks by checking their transaction status.
    async fn resolve_locks(&self, locks: Vec<LockInfo>) -> Result<()>;
}

/// Everything the advancer needs from the cluster, in one bound.
pub trait AdvancerEnv:
    RegionScanner + LogBackupService + TsoService + SafePointManager + PendingLockScanner
{
}

impl<T> AdvancerEnv for T where
    T: RegionScanner + LogBackupService + TsoService + SafePointManager + PendingLockScanner
{
}
