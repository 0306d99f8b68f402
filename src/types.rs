// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use std::{
    cmp::Ordering,
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::utils::redact;

const TSO_PHYSICAL_SHIFT_BITS: u64 = 18;

/// A hybrid-logical timestamp. The higher bits hold the physical part
/// (milliseconds), the lower 18 bits hold the logical counter.
#[derive(
    Eq, PartialEq, Ord, PartialOrd, Debug, Clone, Copy, Default, Hash, Serialize, Deserialize,
)]
pub struct TimeStamp(u64);

impl TimeStamp {
    pub fn new(ts: u64) -> TimeStamp {
        TimeStamp(ts)
    }

    pub fn compose(physical: u64, logical: u64) -> TimeStamp {
        TimeStamp((physical << TSO_PHYSICAL_SHIFT_BITS) + logical)
    }

    pub fn zero() -> TimeStamp {
        TimeStamp(0)
    }

    pub fn max() -> TimeStamp {
        TimeStamp(u64::MAX)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn physical(self) -> u64 {
        self.0 >> TSO_PHYSICAL_SHIFT_BITS
    }

    pub fn logical(self) -> u64 {
        self.0 & ((1 << TSO_PHYSICAL_SHIFT_BITS) - 1)
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }

    /// The current wall clock in the physical-part unit (milliseconds).
    pub fn physical_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock jumped before the unix epoch")
            .as_millis() as u64
    }
}

impl From<u64> for TimeStamp {
    fn from(ts: u64) -> TimeStamp {
        TimeStamp(ts)
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A half-open key range `[start_key, end_key)`.
/// An empty `end_key` means "unbounded above", an empty `start_key` means
/// "unbounded below"; both empty cover the whole key space.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyRange {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            redact(&self.start_key),
            if self.end_key.is_empty() {
                "+inf".to_owned()
            } else {
                redact(&self.end_key)
            }
        )
    }
}

impl KeyRange {
    pub fn new(start_key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Self {
        Self {
            start_key: start_key.into(),
            end_key: end_key.into(),
        }
    }

    /// The range covering the whole key space.
    pub fn full() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        !self.end_key.is_empty() && self.start_key >= self.end_key
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice()
            && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    /// Intersect two ranges; `None` when they don't overlap.
    pub fn intersect(&self, other: &KeyRange) -> Option<KeyRange> {
        let start = std::cmp::max(self.start_key.as_slice(), other.start_key.as_slice());
        let end = match cmp_end_key(&self.end_key, &other.end_key) {
            Ordering::Less | Ordering::Equal => self.end_key.as_slice(),
            Ordering::Greater => other.end_key.as_slice(),
        };
        if !end.is_empty() && start >= end {
            return None;
        }
        Some(KeyRange::new(start.to_vec(), end.to_vec()))
    }
}

/// Compare two end keys, treating the empty key as positive infinity.
pub fn cmp_end_key(a: &[u8], b: &[u8]) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

/// Sort the ranges and merge the overlapping or touching ones.
pub fn collapse(mut ranges: Vec<KeyRange>) -> Vec<KeyRange> {
    ranges.retain(|r| !r.is_empty());
    ranges.sort_by(|a, b| a.start_key.cmp(&b.start_key));
    let mut result = Vec::<KeyRange>::with_capacity(ranges.len());
    for range in ranges {
        match result.last_mut() {
            Some(last) if cmp_end_key(&last.end_key, &range.start_key) != Ordering::Less => {
                if cmp_end_key(&last.end_key, &range.end_key) == Ordering::Less {
                    last.end_key = range.end_key;
                }
            }
            _ => result.push(range),
        }
    }
    result
}

/// The placement unit of the cluster. The region-to-store mapping is volatile,
/// always fetched from the meta service and never persisted here.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Region {
    pub id: u64,
    /// The epoch version. Bumped on split / merge.
    pub version: u64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("range", &self.key_range())
            .finish()
    }
}

impl Region {
    pub fn key_range(&self) -> KeyRange {
        KeyRange::new(self.start_key.clone(), self.end_key.clone())
    }
}

/// A region with the store its leader currently lives on.
#[derive(Clone, Debug)]
pub struct RegionInfo {
    pub region: Region,
    pub leader_store: u64,
}

/// A pending transaction lock observed while scanning.
#[derive(Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub key: Vec<u8>,
    pub lock_ts: TimeStamp,
}

impl fmt::Debug for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockInfo")
            .field("key", &format_args!("{}", redact(&self.key)))
            .field("lock_ts", &self.lock_ts)
            .finish()
    }
}
