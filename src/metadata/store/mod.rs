// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The abstraction over an etcd-like meta store: a sorted KV store with
//! revisions and watchable ranges.

pub mod etcd;
pub mod slash_etc;

pub use etcd::EtcdStore;
pub use slash_etc::SlashEtcStore;

use std::{future::Future, pin::Pin};

use async_trait::async_trait;
use futures::Stream;

use super::keys::{KeyValue, MetaKey};
use crate::errors::Result;

/// An item associated with the store revision it was read at.
#[derive(Debug, Clone)]
pub struct WithRevision<T> {
    pub revision: i64,
    pub inner: T,
}

/// The key set of one operation.
#[derive(Debug, Clone)]
pub enum Keys {
    Prefix(MetaKey),
    Range(MetaKey, MetaKey),
    Key(MetaKey),
}

impl Keys {
    /// Convert the key set into a half-open `[start, end)` pair.
    pub fn into_bound(self) -> (Vec<u8>, Vec<u8>) {
        match self {
            Keys::Prefix(key) => {
                let next = key.next_prefix();
                (key.into(), next.into())
            }
            Keys::Range(start, end) => (start.into(), end.into()),
            Keys::Key(key) => {
                let next = key.next();
                (key.into(), next.into())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventType {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub kind: KvEventType,
    pub pair: KeyValue,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetExtra {
    pub desc_order: bool,
    /// Zero means no limit.
    pub limit: usize,
}

#[derive(Debug)]
pub struct GetResponse {
    pub kvs: Vec<KeyValue>,
    pub more: bool,
}

/// A watch over some key set. Polling `stream` yields the changes; awaiting
/// `cancel` stops the watch and releases the server side resource.
pub struct Subscription {
    pub stream: Pin<Box<dyn Stream<Item = Result<KvEvent>> + Send>>,
    pub cancel: Pin<Box<dyn Future<Output = ()> + Send>>,
}

pub type KvChangeSubscription = Subscription;

#[async_trait]
pub trait Snapshot: Send + Sync + 'static {
    async fn get_extra(&self, keys: Keys, extra: GetExtra) -> Result<GetResponse>;
    fn revision(&self) -> i64;

    async fn get(&self, keys: Keys) -> Result<Vec<KeyValue>> {
        Ok(self.get_extra(keys, GetExtra::default()).await?.kvs)
    }
}

#[async_trait]
pub trait MetaStore: Clone + Send + Sync + 'static {
    type Snap: Snapshot;

    /// Take a consistent snapshot of the store.
    async fn snapshot(&self) -> Result<Self::Snap>;
    /// Write one key.
    async fn set(&self, pair: KeyValue) -> Result<()>;
    /// Delete a key set.
    async fn delete(&self, keys: Keys) -> Result<()>;
    /// Watch the key set from the revision (exclusive). When the requested
    /// revision is no longer watchable, the implementation fails and the
    /// caller is supposed to re-list and re-watch.
    async fn watch(&self, keys: Keys, start_rev: i64) -> Result<KvChangeSubscription>;
}
