// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! An in-memory, etcd-like store. Mostly for testing, also handy for
//! playgrounds where a real etcd cluster would be overkill.

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::StreamExt;

use super::{
    GetExtra, GetResponse, Keys, KvChangeSubscription, KvEvent, KvEventType, MetaStore, Snapshot,
    Subscription, WithRevision,
};
use crate::{
    annotate,
    errors::Result,
    metadata::keys::{KeyValue, MetaKey},
};

struct Subscriber {
    start_key: Vec<u8>,
    end_key: Vec<u8>,
    tx: mpsc::Sender<KvEvent>,
}

#[derive(Default)]
struct SlashEtc {
    items: BTreeMap<Vec<u8>, Vec<u8>>,
    // Maybe a range tree here if this gets too slow.
    subs: HashMap<usize, Subscriber>,
    revision: i64,
    sub_id_alloc: usize,
}

#[derive(Clone, Default)]
pub struct SlashEtcStore(Arc<Mutex<SlashEtc>>);

impl SlashEtc {
    fn notify(&self, event: KvEvent) {
        for sub in self.subs.values() {
            if event.pair.key() < sub.end_key.as_slice()
                && event.pair.key() >= sub.start_key.as_slice()
            {
                // A lagging watcher shouldn't block the writer.
                let _ = sub.tx.try_send(event.clone());
            }
        }
    }
}

#[async_trait]
impl Snapshot for WithRevision<SlashEtcStore> {
    async fn get_extra(&self, keys: Keys, extra: GetExtra) -> Result<GetResponse> {
        let data = self.inner.0.lock().await;
        let (start_key, end_key) = keys.into_bound();
        let mut kvs = data
            .items
            .range::<[u8], _>((
                Bound::Included(start_key.as_slice()),
                Bound::Excluded(end_key.as_slice()),
            ))
            .map(|(k, v)| KeyValue(MetaKey(k.clone()), v.clone()))
            .collect::<Vec<_>>();
        if extra.desc_order {
            kvs.reverse();
        }
        let more = if extra.limit > 0 && kvs.len() > extra.limit {
            kvs.truncate(extra.limit);
            true
        } else {
            false
        };
        Ok(GetResponse { kvs, more })
    }

    fn revision(&self) -> i64 {
        self.revision
    }
}

#[async_trait]
impl MetaStore for SlashEtcStore {
    type Snap = WithRevision<Self>;

    async fn snapshot(&self) -> Result<Self::Snap> {
        Ok(WithRevision {
            inner: self.clone(),
            revision: self.0.lock().await.revision,
        })
    }

    async fn set(&self, mut pair: KeyValue) -> Result<()> {
        let mut data = self.0.lock().await;
        data.revision += 1;
        data.notify(KvEvent {
            kind: KvEventType::Put,
            pair: pair.clone(),
        });
        data.items.insert(pair.take_key(), pair.take_value());
        Ok(())
    }

    async fn delete(&self, keys: Keys) -> Result<()> {
        let mut data = self.0.lock().await;
        let (start_key, end_key) = keys.into_bound();
        data.revision += 1;
        let victims = data
            .items
            .range::<[u8], _>((
                Bound::Included(start_key.as_slice()),
                Bound::Excluded(end_key.as_slice()),
            ))
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();
        for victim in victims {
            data.items.remove(&victim);
            data.notify(KvEvent {
                kind: KvEventType::Delete,
                pair: KeyValue(MetaKey(victim), vec![]),
            });
        }
        Ok(())
    }

    async fn watch(&self, keys: Keys, start_rev: i64) -> Result<KvChangeSubscription> {
        let mut data = self.0.lock().await;
        if start_rev != data.revision + 1 {
            // Multi-version isn't kept; the watcher must re-list.
            return Err(annotate!(
                format_args!("current revision is {}", data.revision),
                "cannot watch from stale revision {}",
                start_rev
            ));
        }
        let id = data.sub_id_alloc;
        data.sub_id_alloc += 1;
        let this = self.clone();
        let (tx, rx) = mpsc::channel(64);
        let (start_key, end_key) = keys.into_bound();
        data.subs.insert(
            id,
            Subscriber {
                start_key,
                end_key,
                tx,
            },
        );

        Ok(Subscription {
            stream: Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx).map(Result::Ok)),
            cancel: Box::pin(async move {
                this.0.lock().await.subs.remove(&id);
            }),
        })
    }
}
