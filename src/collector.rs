// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The polling path of the advancer: enumerate the regions of a range, fan a
//! "get last flush ts" request out to every owning store, and merge whatever
//! came back. A single failing store never fails the whole collection, its
//! sub-ranges are reported back instead so the caller knows where the map is
//! still incomplete.

use std::collections::HashMap;

use futures::future::join_all;
use slog_scope::{debug, warn};

use crate::{
    env::{AdvancerEnv, GetCheckpointResult},
    errors::{Error, Result},
    metrics,
    types::{cmp_end_key, collapse, KeyRange, Region, TimeStamp},
};

const SCAN_REGION_PAGE_SIZE: usize = 128;

/// What one collection round learned about a range.
#[derive(Debug)]
pub struct CollectResult {
    /// The minimum over the sub-ranges that did reply. `TimeStamp::max()`
    /// when nothing replied at all.
    pub checkpoint: TimeStamp,
    /// The sub-ranges no store reply was obtained for.
    pub failure_sub_ranges: Vec<KeyRange>,
}

pub struct ClusterCollector<E> {
    env: E,
}

impl<E: AdvancerEnv> ClusterCollector<E> {
    pub fn new(env: E) -> Self {
        Self { env }
    }

    /// Collect the flush checkpoints of all regions overlapping `query`.
    /// `on_success` runs once per successfully reported region, with the
    /// region's range clamped into `query`; calls are serialized.
    ///
    /// Fails with [`Error::AllStoresUnavailable`] when every store failed at
    /// the RPC level; per-region failures only land in `failure_sub_ranges`.
    pub async fn get_checkpoint_in_range(
        &self,
        query: &KeyRange,
        mut on_success: impl FnMut(KeyRange, TimeStamp),
    ) -> Result<CollectResult> {
        let regions = self.regions_overlapping(query).await?;
        let mut result = CollectResult {
            checkpoint: TimeStamp::max(),
            failure_sub_ranges: vec![],
        };
        if regions.is_empty() {
            return Ok(result);
        }

        let mut by_store: HashMap<u64, Vec<Region>> = HashMap::new();
        for info in regions {
            by_store
                .entry(info.leader_store)
                .or_default()
                .push(info.region);
        }
        let store_count = by_store.len();

        let replies = join_all(by_store.into_iter().map(|(store_id, regions)| {
            let env = self.env.clone();
            async move {
                let reply = env
                    .get_last_flush_ts_of_regions(store_id, regions.clone())
                    .await;
                (store_id, regions, reply)
            }
        }))
        .await;

        let mut failed_stores = 0;
        for (store_id, regions, reply) in replies {
            let ranges_of: HashMap<u64, KeyRange> = regions
                .iter()
                .map(|r| (r.id, r.key_range()))
                .collect();
            match reply {
                Ok(items) => {
                    for item in items {
                        let covered = ranges_of
                            .get(&item.region_id())
                            .and_then(|range| range.intersect(query));
                        let covered = match covered {
                            Some(covered) => covered,
                            // A region we never asked about, or one that
                            // doesn't overlap the query anymore. Skip.
                            None => continue,
                        };
                        match item {
                            GetCheckpointResult::Ok { checkpoint, .. } => {
                                result.checkpoint = result.checkpoint.min(checkpoint);
                                on_success(covered, checkpoint);
                            }
                            GetCheckpointResult::NotFound { region_id } => {
                                debug!("region not found while collecting";
                                    "store" => store_id, "region" => region_id);
                                metrics::COLLECT_FAILURE
                                    .with_label_values(&["not_found"])
                                    .inc();
                                result.failure_sub_ranges.push(covered);
                            }
                            GetCheckpointResult::DataLoss { region_id } => {
                                warn!("store lost the flush progress of a region";
                                    "store" => store_id, "region" => region_id);
                                metrics::COLLECT_FAILURE
                                    .with_label_values(&["data_loss"])
                                    .inc();
                                result.failure_sub_ranges.push(covered);
                            }
                        }
                    }
                }
                Err(err) => {
                    err.report(format_args!(
                        "failed to query the flush ts from the store {}",
                        store_id
                    ));
                    metrics::COLLECT_FAILURE
                        .with_label_values(&["store_unreachable"])
                        .inc();
                    failed_stores += 1;
                    result.failure_sub_ranges.extend(
                        ranges_of
                            .into_values()
                            .filter_map(|range| range.intersect(query)),
                    );
                    // The store may have restarted or moved its leaders
                    // around, make the next tick re-learn the topology.
                    if let Err(err) = self.env.invalidate_store_cache(store_id).await {
                        err.report(format_args!(
                            "failed to invalidate the region cache of the store {}",
                            store_id
                        ));
                    }
                }
            }
        }
        if failed_stores == store_count {
            return Err(Error::AllStoresUnavailable);
        }
        result.failure_sub_ranges = collapse(std::mem::take(&mut result.failure_sub_ranges));
        Ok(result)
    }

    /// Page through the meta service for the regions intersecting `query`.
    async fn regions_overlapping(
        &self,
        query: &KeyRange,
    ) -> Result<Vec<crate::types::RegionInfo>> {
        let mut result = vec![];
        let mut from_key = query.start_key.clone();
        loop {
            let page = self
                .env
                .scan_regions(&from_key, &query.end_key, SCAN_REGION_PAGE_SIZE)
                .await?;
            let last_end = match page.last() {
                Some(info) => info.region.end_key.clone(),
                None => break,
            };
            result.extend(page);
            // The page ran over the end of the key space or past the query.
            if last_end.is_empty()
                || cmp_end_key(&last_end, &query.end_key) != std::cmp::Ordering::Less
            {
                break;
            }
            from_key = last_end;
        }
        Ok(result)
    }
}
