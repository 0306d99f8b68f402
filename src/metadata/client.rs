// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::{fmt, future::Future, pin::Pin};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::{
    keys::{self, KeyValue, MetaKey},
    store::{Keys, KvEvent, KvEventType, MetaStore, Snapshot, WithRevision},
};
use crate::{
    annotate,
    errors::{Error, Result},
    types::{KeyRange, TimeStamp},
};

/// The immutable descriptor of a backup task, as persisted in the meta
/// service. The key ranges live under separate keys (see
/// [`MetaKey::ranges_of`]) so they can be range-queried.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq, Debug)]
pub struct TaskInfo {
    pub name: String,
    /// The inclusive lower bound of any computed checkpoint.
    pub start_ts: u64,
    pub end_ts: u64,
    /// An opaque reference to the external storage backend. It may embed
    /// credentials, never log it raw.
    pub storage: String,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct StreamTask {
    pub info: TaskInfo,
    pub is_paused: bool,
}

impl fmt::Debug for StreamTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTask")
            .field("name", &self.info.name)
            .field("start_ts", &self.info.start_ts)
            .field("end_ts", &self.info.end_ts)
            .field("is_paused", &self.is_paused)
            .finish()
    }
}

/// The last error recorded for a task, kept for operators.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastError {
    pub error_message: String,
    /// The physical (millisecond) part of the instant it happened at.
    pub happen_at: u64,
}

#[derive(Debug)]
pub enum MetadataEvent {
    AddTask { task: StreamTask },
    RemoveTask { task: String },
    PauseTask { task: String, reason: String },
    ResumeTask { task: String },
    Error { err: Error },
}

impl PartialEq for MetadataEvent {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::AddTask { task: a }, Self::AddTask { task: b }) => a.info == b.info,
            (Self::RemoveTask { task: a }, Self::RemoveTask { task: b }) => a == b,
            (
                Self::PauseTask { task: a, reason: ra },
                Self::PauseTask { task: b, reason: rb },
            ) => a == b && ra == rb,
            (Self::ResumeTask { task: a }, Self::ResumeTask { task: b }) => a == b,
            // Errors never compare equal.
            _ => false,
        }
    }
}

impl MetadataEvent {
    fn from_task_event(event: &KvEvent) -> Option<MetadataEvent> {
        let key = std::str::from_utf8(event.pair.key()).ok()?;
        let task_name = keys::extract_name_from_info(key)?;
        Some(match event.kind {
            KvEventType::Put => {
                let info: TaskInfo = serde_json::from_slice(event.pair.value()).ok()?;
                MetadataEvent::AddTask {
                    task: StreamTask {
                        info,
                        is_paused: false,
                    },
                }
            }
            KvEventType::Delete => MetadataEvent::RemoveTask {
                task: task_name.to_owned(),
            },
        })
    }

    fn from_pause_event(event: &KvEvent) -> Option<MetadataEvent> {
        let key = std::str::from_utf8(event.pair.key()).ok()?;
        let task_name = keys::extract_name_from_pause(key)?;
        Some(match event.kind {
            KvEventType::Put => MetadataEvent::PauseTask {
                task: task_name.to_owned(),
                reason: String::from_utf8_lossy(event.pair.value()).into_owned(),
            },
            KvEventType::Delete => MetadataEvent::ResumeTask {
                task: task_name.to_owned(),
            },
        })
    }
}

/// A live watch over the metadata. Await `cancel` to stop it; afterwards the
/// stream terminates.
pub struct Watcher {
    pub stream: Pin<Box<dyn Stream<Item = MetadataEvent> + Send>>,
    pub cancel: Pin<Box<dyn Future<Output = ()> + Send>>,
}

/// Operations over the metadata key space.
#[derive(Clone)]
pub struct MetadataClient<S> {
    pub meta_store: S,
}

impl<S: MetaStore> MetadataClient<S> {
    pub fn new(store: S) -> Self {
        Self { meta_store: store }
    }

    pub async fn insert_task_with_ranges(
        &self,
        task: &StreamTask,
        ranges: &[KeyRange],
    ) -> Result<()> {
        let info = serde_json::to_vec(&task.info)?;
        self.meta_store
            .set(KeyValue(MetaKey::task_of(&task.info.name), info))
            .await?;
        for range in ranges {
            self.meta_store
                .set(KeyValue(
                    MetaKey::range_of(&task.info.name, &range.start_key),
                    range.end_key.clone(),
                ))
                .await?;
        }
        Ok(())
    }

    pub async fn get_task(&self, name: &str) -> Result<Option<StreamTask>> {
        let snap = self.meta_store.snapshot().await?;
        let kvs = snap.get(Keys::Key(MetaKey::task_of(name))).await?;
        if kvs.is_empty() {
            return Ok(None);
        }
        let info: TaskInfo = serde_json::from_slice(kvs[0].value())?;
        let paused = !snap.get(Keys::Key(MetaKey::pause_of(name))).await?.is_empty();
        Ok(Some(StreamTask {
            info,
            is_paused: paused,
        }))
    }

    pub async fn get_tasks(&self) -> Result<WithRevision<Vec<StreamTask>>> {
        let snap = self.meta_store.snapshot().await?;
        let kvs = snap.get(Keys::Prefix(MetaKey::tasks())).await?;
        let paused = snap
            .get(Keys::Prefix(MetaKey::pauses()))
            .await?
            .into_iter()
            .filter_map(|kv| {
                std::str::from_utf8(kv.key())
                    .ok()
                    .and_then(keys::extract_name_from_pause)
                    .map(ToOwned::to_owned)
            })
            .collect::<std::collections::HashSet<_>>();
        let mut tasks = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let info: TaskInfo = serde_json::from_slice(kv.value())?;
            let is_paused = paused.contains(&info.name);
            tasks.push(StreamTask { info, is_paused });
        }
        Ok(WithRevision {
            revision: snap.revision(),
            inner: tasks,
        })
    }

    pub async fn ranges_of_task(&self, name: &str) -> Result<WithRevision<Vec<KeyRange>>> {
        let snap = self.meta_store.snapshot().await?;
        let prefix = MetaKey::ranges_of(name);
        let kvs = snap.get(Keys::Prefix(prefix.clone())).await?;
        let ranges = kvs
            .into_iter()
            .map(|mut kv| {
                let key = kv.take_key();
                let start = key[prefix.0.len()..].to_vec();
                KeyRange::new(start, kv.take_value())
            })
            .collect();
        Ok(WithRevision {
            revision: snap.revision(),
            inner: ranges,
        })
    }

    pub async fn current_revision(&self) -> Result<i64> {
        Ok(self.meta_store.snapshot().await?.revision())
    }

    /// Remove every record of the task. The service GC safe point is managed
    /// by the advancer and has to be unregistered separately.
    pub async fn remove_task(&self, name: &str) -> Result<()> {
        self.meta_store
            .delete(Keys::Key(MetaKey::task_of(name)))
            .await?;
        self.meta_store
            .delete(Keys::Prefix(MetaKey::ranges_of(name)))
            .await?;
        self.meta_store
            .delete(Keys::Key(MetaKey::central_global_checkpoint_of(name)))
            .await?;
        self.meta_store
            .delete(Keys::Prefix(MetaKey::storage_checkpoint_prefix(name)))
            .await?;
        self.meta_store
            .delete(Keys::Key(MetaKey::pause_of(name)))
            .await?;
        self.meta_store
            .delete(Keys::Key(MetaKey::last_error_of(name)))
            .await?;
        Ok(())
    }

    pub async fn pause(&self, name: &str, reason: &str) -> Result<()> {
        self.meta_store
            .set(KeyValue(
                MetaKey::pause_of(name),
                reason.as_bytes().to_vec(),
            ))
            .await
    }

    pub async fn resume(&self, name: &str) -> Result<()> {
        self.meta_store
            .delete(Keys::Key(MetaKey::pause_of(name)))
            .await
    }

    /// Whether the task is paused, together with the recorded reason.
    pub async fn paused(&self, name: &str) -> Result<Option<String>> {
        let snap = self.meta_store.snapshot().await?;
        let kvs = snap.get(Keys::Key(MetaKey::pause_of(name))).await?;
        Ok(kvs
            .into_iter()
            .next()
            .map(|mut kv| String::from_utf8_lossy(&kv.take_value()).into_owned()))
    }

    /// Watch the task set from the revision (exclusive).
    pub async fn events_from(&self, revision: i64) -> Result<Watcher> {
        let sub = self
            .meta_store
            .watch(Keys::Prefix(MetaKey::tasks()), revision + 1)
            .await?;
        Ok(Watcher {
            stream: Box::pin(sub.stream.filter_map(|result| {
                futures::future::ready(match result {
                    Ok(event) => MetadataEvent::from_task_event(&event),
                    Err(err) => Some(MetadataEvent::Error { err }),
                })
            })),
            cancel: sub.cancel,
        })
    }

    /// Watch the pause markers from the revision (exclusive).
    pub async fn events_from_pause(&self, revision: i64) -> Result<Watcher> {
        let sub = self
            .meta_store
            .watch(Keys::Prefix(MetaKey::pauses()), revision + 1)
            .await?;
        Ok(Watcher {
            stream: Box::pin(sub.stream.filter_map(|result| {
                futures::future::ready(match result {
                    Ok(event) => MetadataEvent::from_pause_event(&event),
                    Err(err) => Some(MetadataEvent::Error { err }),
                })
            })),
            cancel: sub.cancel,
        })
    }

    pub async fn global_checkpoint_of(&self, task: &str) -> Result<Option<TimeStamp>> {
        let snap = self.meta_store.snapshot().await?;
        let kvs = snap
            .get(Keys::Key(MetaKey::central_global_checkpoint_of(task)))
            .await?;
        kvs.into_iter().next().map(parse_ts).transpose()
    }

    /// The progress of the task: the stored global checkpoint, bounded below
    /// by the task's start ts.
    pub async fn global_progress_of_task(&self, task: &str) -> Result<TimeStamp> {
        let info = self
            .get_task(task)
            .await?
            .ok_or_else(|| Error::NoSuchTask {
                task_name: task.to_owned(),
            })?;
        let stored = self.global_checkpoint_of(task).await?;
        Ok(stored
            .unwrap_or_else(TimeStamp::zero)
            .max(TimeStamp::new(info.info.start_ts)))
    }

    pub async fn set_global_checkpoint(&self, task: &str, checkpoint: TimeStamp) -> Result<()> {
        self.meta_store
            .set(KeyValue(
                MetaKey::central_global_checkpoint_of(task),
                checkpoint.into_inner().to_be_bytes().to_vec(),
            ))
            .await
    }

    /// The advisory per-store storage checkpoint. Only written by the
    /// storage nodes, never from here.
    pub async fn storage_checkpoint_of(
        &self,
        task: &str,
        store_id: u64,
    ) -> Result<Option<TimeStamp>> {
        let snap = self.meta_store.snapshot().await?;
        let kvs = snap
            .get(Keys::Key(MetaKey::storage_checkpoint_of(task, store_id)))
            .await?;
        kvs.into_iter().next().map(parse_ts).transpose()
    }

    pub async fn report_last_error(&self, task: &str, last_error: LastError) -> Result<()> {
        self.meta_store
            .set(KeyValue(
                MetaKey::last_error_of(task),
                serde_json::to_vec(&last_error)?,
            ))
            .await
    }

    pub async fn get_last_error(&self, task: &str) -> Result<Option<LastError>> {
        let snap = self.meta_store.snapshot().await?;
        let kvs = snap.get(Keys::Key(MetaKey::last_error_of(task))).await?;
        kvs.into_iter()
            .next()
            .map(|kv| serde_json::from_slice(kv.value()).map_err(|err| err.into()))
            .transpose()
    }
}

fn parse_ts(kv: KeyValue) -> Result<TimeStamp> {
    let value = kv.value();
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| annotate!(format_args!("{} bytes", value.len()), "malformed checkpoint"))?;
    Ok(TimeStamp::new(u64::from_be_bytes(bytes)))
}
