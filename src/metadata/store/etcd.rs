// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use etcd_client::{DeleteOptions, EventType, GetOptions, SortOrder, SortTarget, WatchOptions};
use slog_scope::warn;
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;

use super::{
    GetExtra, GetResponse, Keys, KvChangeSubscription, KvEvent, KvEventType, MetaStore, Snapshot,
    Subscription,
};
use crate::{
    errors::{ContextualResultExt, Result},
    metadata::keys::{KeyValue, MetaKey},
    utils,
};

const CONNECT_MAX_RETRY: usize = 5;
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// A meta store backed by an etcd cluster.
#[derive(Clone)]
pub struct EtcdStore(Arc<Mutex<etcd_client::Client>>);

impl EtcdStore {
    /// Connect to the etcd cluster, retrying transient failures.
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let cli = utils::retry(
            || async {
                etcd_client::Client::connect(endpoints, None)
                    .await
                    .map_err(|err| err.into())
            },
            CONNECT_MAX_RETRY,
            CONNECT_BACKOFF,
        )
        .await
        .context("during connecting to the etcd")?;
        Ok(Self::from(cli))
    }
}

impl From<etcd_client::Client> for EtcdStore {
    fn from(cli: etcd_client::Client) -> Self {
        Self(Arc::new(Mutex::new(cli)))
    }
}

pub struct EtcdSnapshot {
    store: EtcdStore,
    revision: i64,
}

#[async_trait]
impl Snapshot for EtcdSnapshot {
    async fn get_extra(&self, keys: Keys, extra: GetExtra) -> Result<GetResponse> {
        let (start, end) = keys.into_bound();
        let mut opts = GetOptions::new()
            .with_range(end)
            .with_revision(self.revision);
        if extra.desc_order {
            opts = opts.with_sort(SortTarget::Key, SortOrder::Descend);
        }
        if extra.limit > 0 {
            opts = opts.with_limit(extra.limit as i64);
        }
        let resp = self.store.0.lock().await.get(start, Some(opts)).await?;
        Ok(GetResponse {
            kvs: resp
                .kvs()
                .iter()
                .map(|kv| KeyValue(MetaKey(kv.key().to_vec()), kv.value().to_vec()))
                .collect(),
            more: resp.more(),
        })
    }

    fn revision(&self) -> i64 {
        self.revision
    }
}

#[async_trait]
impl MetaStore for EtcdStore {
    type Snap = EtcdSnapshot;

    async fn snapshot(&self) -> Result<Self::Snap> {
        let resp = self
            .0
            .lock()
            .await
            .get(vec![0u8], Some(GetOptions::new().with_count_only()))
            .await?;
        let revision = resp
            .header()
            .map(|header| header.revision())
            .unwrap_or_default();
        Ok(EtcdSnapshot {
            store: self.clone(),
            revision,
        })
    }

    async fn set(&self, mut pair: KeyValue) -> Result<()> {
        self.0
            .lock()
            .await
            .put(pair.take_key(), pair.take_value(), None)
            .await?;
        Ok(())
    }

    async fn delete(&self, keys: Keys) -> Result<()> {
        let (start, end) = keys.into_bound();
        self.0
            .lock()
            .await
            .delete(start, Some(DeleteOptions::new().with_range(end)))
            .await?;
        Ok(())
    }

    async fn watch(&self, keys: Keys, start_rev: i64) -> Result<KvChangeSubscription> {
        let (start, end) = keys.into_bound();
        let (mut watcher, mut stream) = self
            .0
            .lock()
            .await
            .watch(
                start,
                Some(
                    WatchOptions::new()
                        .with_range(end)
                        .with_start_revision(start_rev),
                ),
            )
            .await?;
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                let msg = stream.message().await;
                match msg {
                    Err(err) => {
                        if tx.send(Err(err.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            break;
                        }
                        for event in resp.events() {
                            let kv = match event.kv() {
                                Some(kv) => kv,
                                None => continue,
                            };
                            let kind = match event.event_type() {
                                EventType::Put => KvEventType::Put,
                                EventType::Delete => KvEventType::Delete,
                            };
                            let item = KvEvent {
                                kind,
                                pair: KeyValue(MetaKey(kv.key().to_vec()), kv.value().to_vec()),
                            };
                            if tx.send(Ok(item)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
        Ok(Subscription {
            stream: Box::pin(ReceiverStream::new(rx)),
            cancel: Box::pin(async move {
                if let Err(err) = watcher.cancel().await {
                    warn!("failed to cancel the etcd watcher"; "err" => %err);
                }
            }),
        })
    }
}
