// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The streaming path of the advancer. One long-lived task per store keeps a
//! flush-event subscription open, feeding every report into the shared
//! interval map through a [`MergeSink`]. Streams that error out are re-dialed
//! with exponential backoff; streams that go silent are declared stale and
//! torn down by the next tick.

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use rand::Rng;
use slog_scope::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    env::{FlushEventStream, LogBackupService},
    metrics,
    types::{KeyRange, TimeStamp},
    utils::CallbackWaitGroup,
};

/// How often the stores flush their buffered logs. A subscription that kept
/// silent for two of these is considered dead.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3 * 60);

const RECONNECT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(16);

fn backoff_for_reconnect(failed_for: u32) -> Duration {
    let backoff = Ord::min(
        RECONNECT_BACKOFF_BASE * (1 << failed_for.min(8)),
        RECONNECT_BACKOFF_MAX,
    );
    // Spread the reconnections of the stores a bit.
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..500))
}

/// The one thing a subscription may do to the rest of the advancer: merge a
/// flush report into the interval map.
pub trait MergeSink: Send + Sync + 'static {
    fn merge(&self, range: KeyRange, ts: TimeStamp);
}

impl<F> MergeSink for F
where
    F: Fn(KeyRange, TimeStamp) + Send + Sync + 'static,
{
    fn merge(&self, range: KeyRange, ts: TimeStamp) {
        self(range, ts)
    }
}

struct StoreSubscription {
    handle: JoinHandle<()>,
    last_event: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
}

impl StoreSubscription {
    fn is_fresh(&self, staleness: Duration) -> bool {
        !self.handle.is_finished() && self.last_event.lock().unwrap().elapsed() < staleness
    }
}

/// The set of per-store flush subscriptions of one task.
pub struct FlushSubscriber<E> {
    env: E,
    sink: Arc<dyn MergeSink>,
    subs: DashMap<u64, StoreSubscription>,
    flush_interval: Duration,
    wait_group: Arc<CallbackWaitGroup>,
    cancel: CancellationToken,
}

impl<E: LogBackupService> FlushSubscriber<E> {
    pub fn new(env: E, sink: Arc<dyn MergeSink>, flush_interval: Duration) -> Self {
        Self {
            env,
            sink,
            subs: DashMap::new(),
            flush_interval,
            wait_group: CallbackWaitGroup::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe the stores we don't know yet and drop the subscriptions of
    /// stores that left the cluster. Stores already tracked are untouched, so
    /// feeding the same set twice is a no-op.
    pub fn update_store_topology(&self, stores: &[u64]) {
        for store_id in stores {
            if !self.subs.contains_key(store_id) {
                self.subscribe(*store_id);
            }
        }
        let gone = self
            .subs
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| !stores.contains(id))
            .collect::<Vec<_>>();
        for store_id in gone {
            info!("dropping the subscription of a gone store"; "store" => store_id);
            self.remove(store_id);
        }
    }

    /// Tear down the subscriptions that went silent for too long (or whose
    /// task died) and dial them again. Until an event arrives they count as
    /// unhealthy.
    pub fn purge_stale(&self) {
        let staleness = self.staleness();
        let stale = self
            .subs
            .iter()
            .filter(|entry| !entry.is_fresh(staleness))
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();
        for store_id in stale {
            warn!("subscription went stale, redialing"; "store" => store_id);
            metrics::SUBSCRIPTION_EVENT
                .with_label_values(&["stale"])
                .inc();
            self.remove(store_id);
            self.subscribe(store_id);
        }
    }

    /// Whether the store's subscription received something recently.
    pub fn is_healthy(&self, store_id: u64) -> bool {
        self.subs
            .get(&store_id)
            .map(|sub| sub.is_fresh(self.staleness()))
            .unwrap_or(false)
    }

    /// Whether the push path can be trusted as the single source of flush
    /// reports. An empty set cannot.
    pub fn all_healthy(&self) -> bool {
        let staleness = self.staleness();
        !self.subs.is_empty() && self.subs.iter().all(|entry| entry.is_fresh(staleness))
    }

    pub fn tracked_stores(&self) -> Vec<u64> {
        self.subs.iter().map(|entry| *entry.key()).collect()
    }

    /// Tear everything down. The returned future completes once every
    /// subscription task has unwound.
    pub fn clear(&self) -> impl Future<Output = ()> + Send + 'static {
        let stores = self.tracked_stores();
        for store_id in stores {
            self.remove(store_id);
        }
        self.wait_group.wait()
    }

    fn staleness(&self) -> Duration {
        self.flush_interval * 2
    }

    fn remove(&self, store_id: u64) {
        if let Some((_, sub)) = self.subs.remove(&store_id) {
            sub.cancel.cancel();
        }
    }

    fn subscribe(&self, store_id: u64) {
        let cancel = self.cancel.child_token();
        let last_event = Arc::new(Mutex::new(Instant::now()));
        let env = self.env.clone();
        let sink = self.sink.clone();
        let work = self.wait_group.work();
        let handle = tokio::spawn(subscription_loop(
            env,
            sink,
            store_id,
            last_event.clone(),
            cancel.clone(),
            work,
        ));
        self.subs.insert(
            store_id,
            StoreSubscription {
                handle,
                last_event,
                cancel,
            },
        );
    }
}

impl<E> Drop for FlushSubscriber<E> {
    fn drop(&mut self) {
        // Children of this token are held by the per-store tasks.
        self.cancel.cancel();
    }
}

/// Connect, consume, reconnect, until cancelled.
async fn subscription_loop<E: LogBackupService>(
    env: E,
    sink: Arc<dyn MergeSink>,
    store_id: u64,
    last_event: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
    work: crate::utils::Work,
) {
    let _work = work;
    let mut failed_for = 0u32;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let conn = tokio::select! {
            _ = cancel.cancelled() => return,
            conn = env.subscribe_flush_events(store_id) => conn,
        };
        match conn {
            Ok(stream) => {
                *last_event.lock().unwrap() = Instant::now();
                failed_for = 0;
                // The handler runs in its own task: a panic while merging one
                // event only kills this subscription, which then re-enters
                // the connect loop like any other stream failure.
                let consumer = tokio::spawn(consume_stream(
                    stream,
                    sink.clone(),
                    store_id,
                    last_event.clone(),
                    cancel.clone(),
                ));
                match consumer.await {
                    Ok(()) => {}
                    Err(err) if err.is_panic() => {
                        error!("flush event handler panicked"; "store" => store_id);
                        metrics::SUBSCRIPTION_EVENT
                            .with_label_values(&["handler_panic"])
                            .inc();
                    }
                    Err(_) => return,
                }
            }
            Err(err) => {
                failed_for += 1;
                err.report(format_args!(
                    "failed to subscribe the flush events of the store {}",
                    store_id
                ));
            }
        }
        if cancel.is_cancelled() {
            return;
        }
        let backoff = backoff_for_reconnect(failed_for);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

async fn consume_stream(
    mut stream: FlushEventStream,
    sink: Arc<dyn MergeSink>,
    store_id: u64,
    last_event: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
) {
    use futures::StreamExt;
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => return,
            batch = stream.next() => batch,
        };
        match batch {
            Some(Ok(events)) => {
                *last_event.lock().unwrap() = Instant::now();
                if events.is_empty() {
                    metrics::SUBSCRIPTION_EVENT
                        .with_label_values(&["heartbeat"])
                        .inc();
                    continue;
                }
                for event in events {
                    metrics::SUBSCRIPTION_EVENT
                        .with_label_values(&["flush"])
                        .inc();
                    sink.merge(event.range, event.checkpoint);
                }
            }
            Some(Err(err)) => {
                err.report(format_args!(
                    "the flush event stream of the store {} failed",
                    store_id
                ));
                return;
            }
            None => {
                info!("the store closed its flush event stream"; "store" => store_id);
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::{FlushSubscriber, MergeSink};
    use crate::{
        env::{FlushEvent, FlushEventStream, GetCheckpointResult, LogBackupService},
        errors::Result,
        types::{KeyRange, Region, TimeStamp},
    };

    #[derive(Clone, Default)]
    struct MockFlushService {
        subscribed: Arc<AtomicUsize>,
        senders: Arc<Mutex<Vec<tokio::sync::mpsc::UnboundedSender<Result<Vec<FlushEvent>>>>>>,
    }

    impl MockFlushService {
        fn push(&self, events: Vec<FlushEvent>) {
            for tx in self.senders.lock().unwrap().iter() {
                let _ = tx.send(Ok(events.clone()));
            }
        }

        fn drop_streams(&self) {
            self.senders.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl LogBackupService for MockFlushService {
        async fn get_last_flush_ts_of_regions(
            &self,
            _store_id: u64,
            _regions: Vec<Region>,
        ) -> Result<Vec<GetCheckpointResult>> {
            Ok(vec![])
        }

        async fn subscribe_flush_events(&self, _store_id: u64) -> Result<FlushEventStream> {
            self.subscribed.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            self.senders.lock().unwrap().push(tx);
            Ok(Box::pin(UnboundedReceiverStream::new(rx)))
        }
    }

    fn recording_sink() -> (Arc<dyn MergeSink>, Arc<Mutex<Vec<(KeyRange, TimeStamp)>>>) {
        let seen = Arc::new(Mutex::new(vec![]));
        let recorded = seen.clone();
        let sink: Arc<dyn MergeSink> = Arc::new(move |range: KeyRange, ts: TimeStamp| {
            recorded.lock().unwrap().push((range, ts))
        });
        (sink, seen)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn test_events_reach_the_sink() {
        let svc = MockFlushService::default();
        let (sink, seen) = recording_sink();
        let sub = FlushSubscriber::new(svc.clone(), sink, Duration::from_secs(60));
        sub.update_store_topology(&[1, 2]);
        wait_until(|| svc.subscribed.load(Ordering::SeqCst) == 2).await;

        svc.push(vec![FlushEvent {
            range: KeyRange::new(b"a".to_vec(), b"b".to_vec()),
            checkpoint: TimeStamp::new(42),
        }]);
        wait_until(|| seen.lock().unwrap().len() == 2).await;
        assert!(sub.all_healthy());
    }

    #[tokio::test]
    async fn test_no_duplicate_subscriptions() {
        let svc = MockFlushService::default();
        let (sink, _) = recording_sink();
        let sub = FlushSubscriber::new(svc.clone(), sink, Duration::from_secs(60));
        sub.update_store_topology(&[1, 2, 3]);
        wait_until(|| svc.subscribed.load(Ordering::SeqCst) == 3).await;
        sub.update_store_topology(&[1, 2, 3]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(svc.subscribed.load(Ordering::SeqCst), 3);
        assert_eq!(sub.tracked_stores().len(), 3);

        // A store leaving drops its subscription.
        sub.update_store_topology(&[1, 2]);
        assert_eq!(sub.tracked_stores().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_subscription_redialed() {
        let svc = MockFlushService::default();
        let (sink, _) = recording_sink();
        // Tiny flush interval so silence is noticed quickly.
        let sub = FlushSubscriber::new(svc.clone(), sink, Duration::from_millis(20));
        sub.update_store_topology(&[7]);
        wait_until(|| svc.subscribed.load(Ordering::SeqCst) == 1).await;

        svc.drop_streams();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!sub.all_healthy());
        sub.purge_stale();
        wait_until(|| svc.subscribed.load(Ordering::SeqCst) >= 2).await;
    }

    #[tokio::test]
    async fn test_clear_fires_drain_callback() {
        let svc = MockFlushService::default();
        let (sink, _) = recording_sink();
        let sub = FlushSubscriber::new(svc.clone(), sink, Duration::from_secs(60));
        sub.update_store_topology(&[1, 2, 3, 4]);
        wait_until(|| svc.subscribed.load(Ordering::SeqCst) == 4).await;

        tokio::time::timeout(Duration::from_secs(5), sub.clear())
            .await
            .expect("the subscriptions never drained");
        assert!(sub.tracked_stores().is_empty());
        assert!(!sub.all_healthy());
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let svc = MockFlushService::default();
        let panicking: Arc<dyn MergeSink> = Arc::new(|_range: KeyRange, _ts: TimeStamp| {
            panic!("boom");
        });
        let sub = FlushSubscriber::new(svc.clone(), panicking, Duration::from_secs(60));
        sub.update_store_topology(&[1]);
        wait_until(|| svc.subscribed.load(Ordering::SeqCst) == 1).await;

        svc.push(vec![FlushEvent {
            range: KeyRange::new(b"a".to_vec(), b"b".to_vec()),
            checkpoint: TimeStamp::new(1),
        }]);
        // The offending subscription reconnects instead of tearing the
        // manager down.
        wait_until(|| svc.subscribed.load(Ordering::SeqCst) >= 2).await;
        assert_eq!(sub.tracked_stores(), vec![1]);
    }
}
