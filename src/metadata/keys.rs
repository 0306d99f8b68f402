// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use bytes::{BufMut, BytesMut};
use lazy_static::lazy_static;
use regex::Regex;

const PREFIX: &str = "/tidb/br-stream";
const PATH_INFO: &str = "/info";
const PATH_CHECKPOINT: &str = "/checkpoint";
const PATH_RANGES: &str = "/ranges";
const PATH_PAUSE: &str = "/pause";
const PATH_LAST_ERROR: &str = "/last-error";
const PATH_STORAGE_CHECKPOINT: &str = "/storage-checkpoint";

lazy_static! {
    static ref EXTRACT_NAME_FROM_INFO_RE: Regex =
        Regex::new(r"/tidb/br-stream/info/(?P<task_name>[0-9a-zA-Z_\-]+)").unwrap();
    static ref EXTRACT_NAME_FROM_PAUSE_RE: Regex =
        Regex::new(r"/tidb/br-stream/pause/(?P<task_name>[0-9a-zA-Z_\-]+)").unwrap();
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MetaKey(pub Vec<u8>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue(pub MetaKey, pub Vec<u8>);

impl std::fmt::Debug for MetaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match std::str::from_utf8(&self.0) {
            Ok(s) => s.to_owned(),
            Err(_) => format!("<{}>", hex::encode(&self.0)),
        };
        f.debug_tuple("MetaKey").field(&s).finish()
    }
}

impl KeyValue {
    pub fn key(&self) -> &[u8] {
        self.0.0.as_slice()
    }

    pub fn value(&self) -> &[u8] {
        self.1.as_slice()
    }

    pub fn take_key(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.0.0)
    }

    pub fn take_value(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.1)
    }
}

impl From<MetaKey> for Vec<u8> {
    fn from(key: MetaKey) -> Self {
        key.0
    }
}

impl MetaKey {
    /// The prefix of all task info.
    pub fn tasks() -> Self {
        Self(format!("{}{}", PREFIX, PATH_INFO).into_bytes())
    }

    /// The path of the info of the specified task.
    pub fn task_of(name: &str) -> Self {
        Self(format!("{}{}/{}", PREFIX, PATH_INFO, name).into_bytes())
    }

    /// The prefix of the ranges of some task.
    pub fn ranges_of(name: &str) -> Self {
        Self(format!("{}{}/{}/", PREFIX, PATH_RANGES, name).into_bytes())
    }

    /// The key of one range of some task.
    /// It is `<prefix>/ranges/<task-name(string)>/<start-key(binary)>`.
    pub fn range_of(name: &str, rng: &[u8]) -> Self {
        let mut ranges = Self::ranges_of(name);
        ranges.0.extend(rng);
        ranges
    }

    /// The key of the global checkpoint of some task.
    pub fn central_global_checkpoint_of(name: &str) -> Self {
        Self(format!("{}{}/{}", PREFIX, PATH_CHECKPOINT, name).into_bytes())
    }

    /// The prefix of the per-store storage checkpoints of some task.
    /// Those are advisory: written by the stores, only read from here.
    pub fn storage_checkpoint_prefix(name: &str) -> Self {
        Self(format!("{}{}/{}", PREFIX, PATH_STORAGE_CHECKPOINT, name).into_bytes())
    }

    /// The key of the storage checkpoint reported by one store.
    pub fn storage_checkpoint_of(name: &str, store_id: u64) -> Self {
        let base = format!("{}{}/{}", PREFIX, PATH_STORAGE_CHECKPOINT, name);
        let mut buf = BytesMut::from(base.as_str());
        buf.put_u8(b'/');
        buf.put_u64(store_id);
        Self(buf.to_vec())
    }

    /// The prefix of all pause markers.
    pub fn pauses() -> Self {
        Self(format!("{}{}", PREFIX, PATH_PAUSE).into_bytes())
    }

    /// The key marking some task paused. The value carries the reason.
    pub fn pause_of(name: &str) -> Self {
        Self(format!("{}{}/{}", PREFIX, PATH_PAUSE, name).into_bytes())
    }

    /// The key recording the last error reported for some task.
    pub fn last_error_of(name: &str) -> Self {
        Self(format!("{}{}/{}", PREFIX, PATH_LAST_ERROR, name).into_bytes())
    }

    /// The key that keeps the range `[self, self.next())` containing only
    /// `self`.
    pub fn next(&self) -> Self {
        let mut next = self.clone();
        next.0.push(0);
        next
    }

    /// The key that keeps the range `[self, self.next_prefix())` containing
    /// all keys with the prefix `self`.
    pub fn next_prefix(&self) -> Self {
        let mut next_prefix = self.clone();
        while let Some(last) = next_prefix.0.last_mut() {
            if *last == u8::MAX {
                next_prefix.0.pop();
            } else {
                *last += 1;
                break;
            }
        }
        next_prefix
    }
}

/// Extract the task name from the task info path.
pub fn extract_name_from_info(full_path: &str) -> Option<&str> {
    Some(
        EXTRACT_NAME_FROM_INFO_RE
            .captures(full_path)?
            .name("task_name")?
            .as_str(),
    )
}

/// Extract the task name from the pause marker path.
pub fn extract_name_from_pause(full_path: &str) -> Option<&str> {
    Some(
        EXTRACT_NAME_FROM_PAUSE_RE
            .captures(full_path)?
            .name("task_name")?
            .as_str(),
    )
}

#[cfg(test)]
mod test {
    use super::{extract_name_from_info, extract_name_from_pause, MetaKey};

    #[test]
    fn test_key_layout() {
        assert_eq!(MetaKey::task_of("simple").0, b"/tidb/br-stream/info/simple");
        assert_eq!(
            MetaKey::central_global_checkpoint_of("simple").0,
            b"/tidb/br-stream/checkpoint/simple"
        );
        assert_eq!(
            MetaKey::pause_of("simple").0,
            b"/tidb/br-stream/pause/simple"
        );
        let range = MetaKey::range_of("simple", b"\x01\x02");
        assert_eq!(range.0, b"/tidb/br-stream/ranges/simple/\x01\x02");
    }

    #[test]
    fn test_next_prefix() {
        assert_eq!(MetaKey(b"abc".to_vec()).next_prefix().0, b"abd");
        assert_eq!(MetaKey(b"a\xff".to_vec()).next_prefix().0, b"b");
        assert_eq!(MetaKey(b"ab".to_vec()).next().0, b"ab\x00");
    }

    #[test]
    fn test_extract_name() {
        assert_eq!(
            extract_name_from_info("/tidb/br-stream/info/some_task-1"),
            Some("some_task-1")
        );
        assert_eq!(extract_name_from_info("/tidb/br-stream/ranges/t/xx"), None);
        assert_eq!(
            extract_name_from_pause("/tidb/br-stream/pause/some_task"),
            Some("some_task")
        );
    }
}
