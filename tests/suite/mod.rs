// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.
#![allow(dead_code)]

//! A miniature cluster for driving the advancer end to end: regions scattered
//! over a handful of stores, a hand-cranked timestamp oracle, pending locks,
//! flush-event streams, and per-store failure injection.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use log_backup_advancer::{
    annotate,
    env::{
        FlushEvent, FlushEventStream, GetCheckpointResult, LogBackupService, PendingLockScanner,
        RegionScanner, SafePointManager, TsoService,
    },
    errors::Result,
    metadata::{store::SlashEtcStore, MetadataClient, MetadataEvent, StreamTask, TaskInfo},
    types::{KeyRange, LockInfo, Region, RegionInfo, TimeStamp},
    CheckpointAdvancer, Config,
};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const TASK_NAME: &str = "integration-test";

/// How one store misbehaves.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StoreBehavior {
    Normal,
    /// Claims to know none of the regions asked about.
    NotFound,
    /// Lost the flush progress of every region asked about.
    DataLoss,
    /// Fails every RPC outright.
    Unreachable,
    /// Never answers.
    Hang,
}

struct RegionState {
    region: Region,
    leader_store: u64,
    checkpoint: TimeStamp,
}

struct StoreState {
    behavior: StoreBehavior,
    subscribers: Vec<tokio::sync::mpsc::UnboundedSender<Result<Vec<FlushEvent>>>>,
}

#[derive(Default)]
struct ClusterState {
    /// Sorted by start key.
    regions: Vec<RegionState>,
    stores: HashMap<u64, StoreState>,
    locks: Vec<LockInfo>,
    resolved: Vec<LockInfo>,
    safe_points: HashMap<String, TimeStamp>,
    invalidated: Vec<u64>,
    subscribe_calls: usize,
    region_id_alloc: u64,
}

pub struct MockClusterInner {
    state: Mutex<ClusterState>,
    tso: AtomicU64,
    /// While `true`, lock scans park until released.
    scan_gate: tokio::sync::watch::Sender<bool>,
}

#[derive(Clone)]
pub struct MockCluster(Arc<MockClusterInner>);

impl MockCluster {
    /// A cluster of `stores` stores and one region spanning the key space.
    pub fn new(stores: u64) -> Self {
        let mut state = ClusterState::default();
        for id in 1..=stores {
            state.stores.insert(
                id,
                StoreState {
                    behavior: StoreBehavior::Normal,
                    subscribers: vec![],
                },
            );
        }
        state.region_id_alloc = 2;
        state.regions.push(RegionState {
            region: Region {
                id: 1,
                version: 1,
                start_key: vec![],
                end_key: vec![],
            },
            leader_store: 1,
            checkpoint: TimeStamp::zero(),
        });
        let (scan_gate, _) = tokio::sync::watch::channel(false);
        Self(Arc::new(MockClusterInner {
            state: Mutex::new(state),
            tso: AtomicU64::new(0),
            scan_gate,
        }))
    }

    /// Split the key space at the keys and scatter the pieces over the
    /// stores round-robin.
    pub fn split_and_scatter(&self, keys: &[&[u8]]) {
        let mut state = self.0.state.lock().unwrap();
        let mut boundaries: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
        boundaries.sort();
        let store_ids = {
            let mut ids: Vec<u64> = state.stores.keys().copied().collect();
            ids.sort_unstable();
            ids
        };
        let mut starts = vec![vec![]];
        starts.extend(boundaries.iter().cloned());
        let mut ends = boundaries;
        ends.push(vec![]);
        state.regions = starts
            .into_iter()
            .zip(ends)
            .enumerate()
            .map(|(i, (start_key, end_key))| RegionState {
                region: Region {
                    id: i as u64 + 1,
                    version: 2,
                    start_key,
                    end_key,
                },
                leader_store: store_ids[i % store_ids.len()],
                checkpoint: TimeStamp::zero(),
            })
            .collect();
        state.region_id_alloc = state.regions.len() as u64 + 1;
    }

    /// Split the region containing `key` in two at `key`.
    pub fn split_region_at(&self, key: &[u8]) {
        let mut state = self.0.state.lock().unwrap();
        let new_id = state.region_id_alloc;
        state.region_id_alloc += 1;
        let pos = state
            .regions
            .iter()
            .position(|r| {
                KeyRange::new(r.region.start_key.clone(), r.region.end_key.clone())
                    .contains_key(key)
            })
            .expect("no region contains the split key");
        let old = &mut state.regions[pos];
        assert!(old.region.start_key.as_slice() < key);
        let right = RegionState {
            region: Region {
                id: new_id,
                version: old.region.version + 1,
                start_key: key.to_vec(),
                end_key: std::mem::take(&mut old.region.end_key),
            },
            leader_store: old.leader_store,
            checkpoint: old.checkpoint,
        };
        old.region.end_key = key.to_vec();
        old.region.version += 1;
        state.regions.insert(pos + 1, right);
    }

    pub fn region_count(&self) -> usize {
        self.0.state.lock().unwrap().regions.len()
    }

    pub fn flush_all(&self, ts: TimeStamp) {
        for region in self.0.state.lock().unwrap().regions.iter_mut() {
            region.checkpoint = ts;
        }
    }

    /// Give the i-th region (in key order) the flush ts `base + i`, so the
    /// cluster minimum is exactly `base`.
    pub fn flush_staggered(&self, base: TimeStamp) {
        for (i, region) in self.0.state.lock().unwrap().regions.iter_mut().enumerate() {
            region.checkpoint = TimeStamp::new(base.into_inner() + i as u64);
        }
    }

    pub fn flush_region_containing(&self, key: &[u8], ts: TimeStamp) {
        let mut state = self.0.state.lock().unwrap();
        let region = state
            .regions
            .iter_mut()
            .find(|r| {
                KeyRange::new(r.region.start_key.clone(), r.region.end_key.clone())
                    .contains_key(key)
            })
            .expect("no region contains the key");
        region.checkpoint = ts;
    }

    /// Push a flush report to every open subscription of every store.
    pub fn push_flush_event(&self, range: KeyRange, ts: TimeStamp) {
        let state = self.0.state.lock().unwrap();
        for store in state.stores.values() {
            for tx in &store.subscribers {
                let _ = tx.send(Ok(vec![FlushEvent {
                    range: range.clone(),
                    checkpoint: ts,
                }]));
            }
        }
    }

    pub fn set_store_behavior(&self, store_id: u64, behavior: StoreBehavior) {
        self.0
            .state
            .lock()
            .unwrap()
            .stores
            .get_mut(&store_id)
            .expect("no such store")
            .behavior = behavior;
    }

    pub fn set_tso(&self, ts: TimeStamp) {
        self.0.tso.store(ts.into_inner(), Ordering::SeqCst);
    }

    pub fn put_lock(&self, key: &[u8], ts: TimeStamp) {
        self.0.state.lock().unwrap().locks.push(LockInfo {
            key: key.to_vec(),
            lock_ts: ts,
        });
    }

    pub fn resolved_locks(&self) -> Vec<LockInfo> {
        self.0.state.lock().unwrap().resolved.clone()
    }

    /// Park every lock scan until [`Self::release_lock_scans`].
    pub fn hold_lock_scans(&self) {
        self.0.scan_gate.send_replace(true);
    }

    pub fn release_lock_scans(&self) {
        self.0.scan_gate.send_replace(false);
    }

    pub fn subscribe_calls(&self) -> usize {
        self.0.state.lock().unwrap().subscribe_calls
    }

    pub fn invalidated_stores(&self) -> Vec<u64> {
        self.0.state.lock().unwrap().invalidated.clone()
    }

    pub fn safe_point_of(&self, service: &str) -> Option<TimeStamp> {
        self.0
            .state
            .lock()
            .unwrap()
            .safe_points
            .get(service)
            .copied()
    }

    fn behavior_of(&self, store_id: u64) -> StoreBehavior {
        self.0
            .state
            .lock()
            .unwrap()
            .stores
            .get(&store_id)
            .map(|s| s.behavior)
            .unwrap_or(StoreBehavior::Unreachable)
    }
}

#[async_trait]
impl RegionScanner for MockCluster {
    async fn scan_regions(
        &self,
        from_key: &[u8],
        end_key: &[u8],
        limit: usize,
    ) -> Result<Vec<RegionInfo>> {
        let state = self.0.state.lock().unwrap();
        Ok(state
            .regions
            .iter()
            .filter(|r| {
                let past_from =
                    r.region.end_key.is_empty() || r.region.end_key.as_slice() > from_key;
                let before_end =
                    end_key.is_empty() || r.region.start_key.as_slice() < end_key;
                past_from && before_end
            })
            .take(limit)
            .map(|r| RegionInfo {
                region: r.region.clone(),
                leader_store: r.leader_store,
            })
            .collect())
    }

    async fn stores(&self) -> Result<Vec<u64>> {
        let mut ids: Vec<u64> = self.0.state.lock().unwrap().stores.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn invalidate_store_cache(&self, store_id: u64) -> Result<()> {
        self.0.state.lock().unwrap().invalidated.push(store_id);
        Ok(())
    }
}

#[async_trait]
impl LogBackupService for MockCluster {
    async fn get_last_flush_ts_of_regions(
        &self,
        store_id: u64,
        regions: Vec<Region>,
    ) -> Result<Vec<GetCheckpointResult>> {
        match self.behavior_of(store_id) {
            StoreBehavior::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            StoreBehavior::Unreachable => {
                Err(annotate!("injected failure", "store {} is unreachable", store_id))
            }
            StoreBehavior::NotFound => Ok(regions
                .into_iter()
                .map(|r| GetCheckpointResult::NotFound { region_id: r.id })
                .collect()),
            StoreBehavior::DataLoss => Ok(regions
                .into_iter()
                .map(|r| GetCheckpointResult::DataLoss { region_id: r.id })
                .collect()),
            StoreBehavior::Normal => {
                let state = self.0.state.lock().unwrap();
                Ok(regions
                    .into_iter()
                    .map(|asked| {
                        match state.regions.iter().find(|r| r.region.id == asked.id) {
                            Some(found) => GetCheckpointResult::ok(
                                found.region.clone(),
                                found.checkpoint,
                            ),
                            None => GetCheckpointResult::NotFound {
                                region_id: asked.id,
                            },
                        }
                    })
                    .collect())
            }
        }
    }

    async fn subscribe_flush_events(&self, store_id: u64) -> Result<FlushEventStream> {
        let mut state = self.0.state.lock().unwrap();
        state.subscribe_calls += 1;
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        state
            .stores
            .get_mut(&store_id)
            .expect("no such store")
            .subscribers
            .push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

#[async_trait]
impl TsoService for MockCluster {
    async fn get_tso(&self) -> Result<TimeStamp> {
        Ok(TimeStamp::new(self.0.tso.load(Ordering::SeqCst)))
    }
}

#[async_trait]
impl SafePointManager for MockCluster {
    async fn update_service_safe_point(
        &self,
        service: &str,
        ts: TimeStamp,
        ttl: Duration,
    ) -> Result<()> {
        let mut state = self.0.state.lock().unwrap();
        if ttl.is_zero() {
            state.safe_points.remove(service);
        } else {
            state.safe_points.insert(service.to_owned(), ts);
        }
        Ok(())
    }
}

#[async_trait]
impl PendingLockScanner for MockCluster {
    async fn scan_locks(
        &self,
        range: &KeyRange,
        max_ts: TimeStamp,
        limit: usize,
    ) -> Result<Vec<LockInfo>> {
        let mut gate = self.0.scan_gate.subscribe();
        loop {
            if !*gate.borrow() {
                break;
            }
            if gate.changed().await.is_err() {
                break;
            }
        }
        let state = self.0.state.lock().unwrap();
        Ok(state
            .locks
            .iter()
            .filter(|lock| range.contains_key(&lock.key) && lock.lock_ts <= max_ts)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn resolve_locks(&self, locks: Vec<LockInfo>) -> Result<()> {
        let mut state = self.0.state.lock().unwrap();
        state.locks.retain(|l| !locks.contains(l));
        state.resolved.extend(locks);
        Ok(())
    }
}

pub fn task_at(start_ts: TimeStamp) -> StreamTask {
    StreamTask {
        info: TaskInfo {
            name: TASK_NAME.to_owned(),
            start_ts: start_ts.into_inner(),
            end_ts: u64::MAX,
            storage: "s3://backup/prefix?access-key=hunter2".to_owned(),
        },
        is_paused: false,
    }
}

pub struct Suite {
    pub cluster: MockCluster,
    pub meta: MetadataClient<SlashEtcStore>,
    pub advancer: CheckpointAdvancer<MockCluster, SlashEtcStore>,
}

impl Suite {
    /// A cluster of `stores` stores, one whole-key-space task starting at
    /// `start_ts`, and an advancer that already adopted it.
    pub async fn new(stores: u64, start_ts: TimeStamp, config: Config) -> Self {
        let cluster = MockCluster::new(stores);
        let meta = MetadataClient::new(SlashEtcStore::default());
        let task = task_at(start_ts);
        meta.insert_task_with_ranges(&task, &[KeyRange::full()])
            .await
            .expect("failed to insert the task");
        let mut advancer = CheckpointAdvancer::new(cluster.clone(), meta.clone(), config);
        advancer
            .on_task_event(MetadataEvent::AddTask { task })
            .await
            .expect("failed to adopt the task");
        Self {
            cluster,
            meta,
            advancer,
        }
    }

    pub async fn checkpoint_in_meta(&self) -> Option<TimeStamp> {
        self.meta
            .global_checkpoint_of(TASK_NAME)
            .await
            .expect("failed to read the checkpoint")
    }
}

/// A timestamp with the physical part `physical_ms` and no logical suffix.
pub fn ts(physical_ms: u64) -> TimeStamp {
    TimeStamp::compose(physical_ms, 0)
}
