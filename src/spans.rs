// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! An interval map from sub-ranges of the task key space to timestamps.
//!
//! The map keeps two indices: a `BTreeMap` keyed by start key for range
//! queries, and a `(value, start key)` set for fetching the minimum in
//! `O(log n)`. Sub-ranges partition the task's key space with no gaps and no
//! overlaps; a freshly created map holds the initial value (usually zero,
//! which reads as "not yet reported") over every task range.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    ops::Bound,
};

use crate::{
    errors::{Error, Result},
    types::{cmp_end_key, collapse, KeyRange, TimeStamp},
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    end_key: Vec<u8>,
    ts: TimeStamp,
}

#[derive(Debug, Default, Clone)]
pub struct ValueSortedFull {
    segments: BTreeMap<Vec<u8>, Segment>,
    by_value: BTreeSet<(TimeStamp, Vec<u8>)>,
}

impl ValueSortedFull {
    /// Create a map covering `ranges`, every sub-range holding `init`.
    pub fn new(ranges: Vec<KeyRange>, init: TimeStamp) -> Self {
        let mut this = Self::default();
        for range in collapse(ranges) {
            this.insert_segment(range.start_key, range.end_key, init);
        }
        this
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// The minimum timestamp over all sub-ranges. Zero when some sub-range
    /// was never reported (or when the map holds nothing at all).
    pub fn min_value(&self) -> TimeStamp {
        self.by_value
            .iter()
            .next()
            .map(|(ts, _)| *ts)
            .unwrap_or_else(TimeStamp::zero)
    }

    /// One of the sub-ranges holding the minimum.
    pub fn min_segment(&self) -> Option<(KeyRange, TimeStamp)> {
        let (ts, start) = self.by_value.iter().next()?;
        let seg = &self.segments[start];
        Some((KeyRange::new(start.clone(), seg.end_key.clone()), *ts))
    }

    /// All sub-ranges holding the minimum, in key order. These are the
    /// bottleneck of advancing.
    pub fn min_segments(&self) -> Vec<KeyRange> {
        let min = self.min_value();
        let mut result: Vec<KeyRange> = self
            .by_value
            .iter()
            .take_while(|(ts, _)| *ts == min)
            .map(|(_, start)| {
                let seg = &self.segments[start];
                KeyRange::new(start.clone(), seg.end_key.clone())
            })
            .collect();
        result.sort_by(|a, b| a.start_key.cmp(&b.start_key));
        result
    }

    /// Visit the sub-ranges in key order.
    pub fn traverse(&self, mut cb: impl FnMut(KeyRange, TimeStamp)) {
        for (start, seg) in &self.segments {
            cb(KeyRange::new(start.clone(), seg.end_key.clone()), seg.ts);
        }
    }

    /// Update `[range.start_key, range.end_key)` to `ts`. Sub-ranges that
    /// straddle the boundary are split there; the portion covered by `range`
    /// takes the new value (last writer wins), everything outside is
    /// untouched. Portions of `range` outside the task key space are dropped.
    pub fn merge(&mut self, range: KeyRange, ts: TimeStamp) -> Result<()> {
        if !range.end_key.is_empty() && range.start_key >= range.end_key {
            return Err(Error::InvalidRange { range });
        }

        let touched = self.take_overlapping(&range);
        if touched.is_empty() {
            return Ok(());
        }

        let mut covered: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(touched.len());
        for (start, seg) in touched {
            // The part on the left of the queried range keeps its old value.
            if start < range.start_key {
                self.insert_segment(start.clone(), range.start_key.clone(), seg.ts);
            }
            let cov_start = std::cmp::max(start, range.start_key.clone());
            let cov_end = match cmp_end_key(&seg.end_key, &range.end_key) {
                Ordering::Less | Ordering::Equal => seg.end_key.clone(),
                Ordering::Greater => range.end_key.clone(),
            };
            // ...so does the part on the right.
            if cmp_end_key(&seg.end_key, &range.end_key) == Ordering::Greater {
                self.insert_segment(range.end_key.clone(), seg.end_key, seg.ts);
            }
            covered.push((cov_start, cov_end));
        }

        // Contiguous covered parts get the same value, write them back as one
        // segment so the map doesn't grow with every event.
        covered.sort_by(|a, b| a.0.cmp(&b.0));
        let mut merged: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(covered.len());
        for (start, end) in covered {
            match merged.last_mut() {
                Some(last) if last.1 == start => last.1 = end,
                _ => merged.push((start, end)),
            }
        }
        for (start, end) in merged {
            self.insert_segment(start.clone(), end.clone(), ts);
            self.coalesce_with_left_neighbor(&start);
            self.coalesce_with_right_neighbor(&end);
        }
        Ok(())
    }

    /// Remove and return every segment overlapping `range`, in key order.
    fn take_overlapping(&mut self, range: &KeyRange) -> Vec<(Vec<u8>, Segment)> {
        let mut starts: Vec<Vec<u8>> = Vec::new();
        if let Some((start, seg)) = self
            .segments
            .range::<[u8], _>((
                Bound::Unbounded,
                Bound::Included(range.start_key.as_slice()),
            ))
            .next_back()
        {
            if cmp_end_key(&seg.end_key, &range.start_key) == Ordering::Greater {
                starts.push(start.clone());
            }
        }
        let upper: (Bound<&[u8]>, Bound<&[u8]>) = if range.end_key.is_empty() {
            (Bound::Excluded(range.start_key.as_slice()), Bound::Unbounded)
        } else {
            (
                Bound::Excluded(range.start_key.as_slice()),
                Bound::Excluded(range.end_key.as_slice()),
            )
        };
        starts.extend(self.segments.range::<[u8], _>(upper).map(|(k, _)| k.clone()));

        starts
            .into_iter()
            .map(|start| {
                let seg = self.remove_segment(&start);
                (start, seg)
            })
            .collect()
    }

    fn insert_segment(&mut self, start: Vec<u8>, end: Vec<u8>, ts: TimeStamp) {
        self.by_value.insert((ts, start.clone()));
        self.segments.insert(start, Segment { end_key: end, ts });
    }

    fn remove_segment(&mut self, start: &[u8]) -> Segment {
        let seg = self.segments.remove(start).expect("segment vanished");
        self.by_value.remove(&(seg.ts, start.to_vec()));
        seg
    }

    fn coalesce_with_left_neighbor(&mut self, start: &[u8]) {
        if start.is_empty() {
            return;
        }
        let this = match self.segments.get(start) {
            Some(seg) => seg.clone(),
            None => return,
        };
        let left = self
            .segments
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(start)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()));
        if let Some((left_start, left_seg)) = left {
            if left_seg.end_key.as_slice() == start && left_seg.ts == this.ts {
                self.remove_segment(start);
                self.remove_segment(&left_start);
                self.insert_segment(left_start, this.end_key, this.ts);
            }
        }
    }

    fn coalesce_with_right_neighbor(&mut self, end: &[u8]) {
        if end.is_empty() {
            return;
        }
        let right = match self.segments.get(end) {
            Some(seg) => seg.clone(),
            None => return,
        };
        let left = self
            .segments
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(end)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()));
        if let Some((left_start, left_seg)) = left {
            if left_seg.end_key.as_slice() == end && left_seg.ts == right.ts {
                self.remove_segment(end);
                self.remove_segment(&left_start);
                self.insert_segment(left_start, right.end_key, right.ts);
            }
        }
    }
}
