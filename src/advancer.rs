// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The checkpoint advancer: the owner-side control loop that turns per-region
//! flush reports into one cluster-wide "safe to restore up to" timestamp.
//!
//! Every tick either trusts the push path (all store subscriptions healthy
//! and the checkpoint still fresh) or polls the whole cluster, then reduces
//! the interval map to its minimum and publishes the result together with
//! the service GC safe point. When the minimum refuses to move and the
//! blocker looks like a pending transaction, a lock resolution pass runs in
//! the background.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::StreamExt;
use slog_scope::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    collector::ClusterCollector,
    config::Config,
    env::AdvancerEnv,
    errors::{ContextualResultExt, Error, Result},
    metadata::{
        store::MetaStore, LastError, MetadataClient, MetadataEvent, StreamTask, TaskInfo,
    },
    metrics::{self, TaskStatus},
    owner::TickingDaemon,
    spans::ValueSortedFull,
    subscription::{FlushSubscriber, MergeSink, DEFAULT_FLUSH_INTERVAL},
    types::{KeyRange, TimeStamp},
    utils::StopWatch,
};

/// The reason written to the pause marker when the lag limit trips.
pub const PAUSE_REASON_LAGGED: &str = "checkpoint is lagged";

/// Transactions younger than this are left alone by the lock resolver.
const LOCK_RESOLVE_SLACK: Duration = Duration::from_secs(60);
const LOCK_SCAN_BATCH: usize = 1024;
/// Refreshed every tick; generous, so a short owner outage loses no data.
const SAFE_POINT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Feeds flush reports into the shared interval map. The subscriptions only
/// ever see this, never the advancer itself.
struct MapSink(Arc<Mutex<ValueSortedFull>>);

impl MergeSink for MapSink {
    fn merge(&self, range: KeyRange, ts: TimeStamp) {
        if let Err(err) = self.0.lock().unwrap().merge(range, ts) {
            err.report("merging a pushed flush event");
        }
    }
}

/// Everything the advancer keeps for the one active task.
struct TaskContext<E> {
    task: TaskInfo,
    ranges: Vec<KeyRange>,
    map: Arc<Mutex<ValueSortedFull>>,
    /// The last published checkpoint (or the recorded progress at adoption).
    checkpoint: TimeStamp,
    /// Whether a checkpoint record exists in the meta service at all.
    ever_published: bool,
    /// When the map was last known complete. `None` forces a full poll.
    last_checkpoint_time: Option<Instant>,
    paused: bool,
    in_resolving_lock: Arc<AtomicBool>,
    subscriber: Option<FlushSubscriber<E>>,
    /// Cancelled on task removal or owner retirement; the lock resolution
    /// pass hangs off it.
    cancel: CancellationToken,
}

pub struct CheckpointAdvancer<E, S: MetaStore> {
    env: E,
    meta: MetadataClient<S>,
    config: Config,
    task: Option<TaskContext<E>>,
    event_rx: Option<mpsc::Receiver<MetadataEvent>>,
    listener_cancel: Option<CancellationToken>,
}

impl<E: AdvancerEnv, S: MetaStore> CheckpointAdvancer<E, S> {
    pub fn new(env: E, meta: MetadataClient<S>, config: Config) -> Self {
        Self {
            env,
            meta,
            config,
            task: None,
            event_rx: None,
            listener_cancel: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn has_task(&self) -> bool {
        self.task.is_some()
    }

    /// The last checkpoint this instance published or adopted.
    pub fn checkpoint(&self) -> Option<TimeStamp> {
        self.task.as_ref().map(|ctx| ctx.checkpoint)
    }

    /// Whether the active task is paused.
    pub fn paused(&self) -> bool {
        self.task.as_ref().map(|ctx| ctx.paused).unwrap_or(false)
    }

    /// Whether a lock resolution pass is running right now.
    pub fn in_resolving_lock(&self) -> bool {
        self.task
            .as_ref()
            .map(|ctx| ctx.in_resolving_lock.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Adopt the advancing duty: start listening for task events. The
    /// current task set arrives through the same channel as live events.
    pub async fn on_become_owner(&mut self) -> Result<()> {
        self.start_task_listener().await
    }

    /// Give the duty up: stop the listener, drop all per-task state and
    /// unwind the subscriptions. Nothing is written to the meta service.
    pub async fn on_retire(&mut self) {
        if let Some(cancel) = self.listener_cancel.take() {
            cancel.cancel();
        }
        self.event_rx = None;
        if let Some(ctx) = self.task.take() {
            ctx.cancel.cancel();
            if let Some(subscriber) = ctx.subscriber {
                subscriber.clear().await;
            }
        }
    }

    /// Watch the meta service for task events. On reconnect the active set
    /// is re-listed, so events missed during the disconnection are recovered.
    pub async fn start_task_listener(&mut self) -> Result<()> {
        let (tx, rx) = mpsc::channel(128);
        let cancel = CancellationToken::new();
        tokio::spawn(task_listener_loop(
            self.meta.clone(),
            tx,
            cancel.clone(),
            self.config.backoff_time,
        ));
        self.event_rx = Some(rx);
        self.listener_cancel = Some(cancel);
        Ok(())
    }

    /// Apply one task event to the in-memory state.
    pub async fn on_task_event(&mut self, event: MetadataEvent) -> Result<()> {
        match event {
            MetadataEvent::AddTask { task } => self.add_task(task).await,
            MetadataEvent::RemoveTask { task } => self.remove_task(&task).await,
            MetadataEvent::PauseTask { task, reason } => {
                if let Some(ctx) = self.task.as_mut().filter(|ctx| ctx.task.name == task) {
                    info!("pausing the task"; "task" => %task, "reason" => %reason);
                    ctx.paused = true;
                    metrics::update_task_status(TaskStatus::Paused, &task);
                }
                Ok(())
            }
            MetadataEvent::ResumeTask { task } => {
                if let Some(ctx) = self.task.as_mut().filter(|ctx| ctx.task.name == task) {
                    info!("resuming the task"; "task" => %task);
                    ctx.paused = false;
                    // Make the next tick rebuild the map from a full poll.
                    ctx.last_checkpoint_time = None;
                    metrics::update_task_status(TaskStatus::Running, &task);
                }
                Ok(())
            }
            MetadataEvent::Error { err } => {
                err.report("received an error from the task listener");
                Ok(())
            }
        }
    }

    async fn add_task(&mut self, task: StreamTask) -> Result<()> {
        if let Some(ctx) = self.task.as_mut() {
            if ctx.task.name == task.info.name {
                // Re-announced by a relist after a reconnection; keep the
                // live state.
                ctx.paused = task.is_paused;
                return Ok(());
            }
            warn!("a task is already being advanced, ignoring the new one";
                "active" => %ctx.task.name, "new" => %task.info.name);
            return Ok(());
        }
        let name = task.info.name.clone();
        let ranges = self.meta.ranges_of_task(&name).await?.inner;
        let ranges = if ranges.is_empty() {
            // No recorded ranges: the task covers the whole key space.
            vec![KeyRange::full()]
        } else {
            ranges
        };
        let stored = self.meta.global_checkpoint_of(&name).await?;
        let checkpoint = stored
            .unwrap_or_else(TimeStamp::zero)
            .max(TimeStamp::new(task.info.start_ts));
        info!("added the backup stream task";
            "task" => %name, "start_ts" => task.info.start_ts, "checkpoint" => %checkpoint,
            "ranges" => ranges.len());
        metrics::update_task_status(
            if task.is_paused {
                TaskStatus::Paused
            } else {
                TaskStatus::Running
            },
            &name,
        );
        self.task = Some(TaskContext {
            ranges: ranges.clone(),
            map: Arc::new(Mutex::new(ValueSortedFull::new(ranges, TimeStamp::zero()))),
            checkpoint,
            ever_published: stored.is_some(),
            last_checkpoint_time: None,
            paused: task.is_paused,
            in_resolving_lock: Arc::new(AtomicBool::new(false)),
            subscriber: None,
            cancel: CancellationToken::new(),
            task: task.info,
        });
        Ok(())
    }

    async fn remove_task(&mut self, name: &str) -> Result<()> {
        match self.task.take() {
            Some(ctx) if ctx.task.name == name => {
                // Aborts the in-flight lock resolution, if any.
                ctx.cancel.cancel();
                if let Some(subscriber) = ctx.subscriber {
                    subscriber.clear().await;
                }
                if ctx.ever_published {
                    self.env
                        .update_service_safe_point(name, ctx.checkpoint, Duration::ZERO)
                        .await
                        .context("during unregistering the service safe point")?;
                }
                info!("removed the backup stream task"; "task" => %name);
                Ok(())
            }
            other => {
                self.task = other;
                Ok(())
            }
        }
    }

    /// Drain and apply the task events gathered since the last tick.
    async fn process_task_events(&mut self) {
        let mut rx = match self.event_rx.take() {
            Some(rx) => rx,
            None => return,
        };
        while let Ok(event) = rx.try_recv() {
            debug!("applying a task event"; "event" => ?event);
            if let Err(err) = self.on_task_event(event).await {
                err.report("applying a task event");
            }
        }
        self.event_rx = Some(rx);
    }

    /// One round of the advancing loop. Returns within
    /// `config.tick_duration` even when a store hangs.
    pub async fn on_tick(&mut self) -> Result<()> {
        self.process_task_events().await;
        let budget = self.config.tick_duration;
        match tokio::time::timeout(budget, self.tick_inner()).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded { op: "tick", budget }),
        }
    }

    async fn tick_inner(&mut self) -> Result<()> {
        let env = self.env.clone();
        let meta = self.meta.clone();
        let config = self.config.clone();
        let ctx = match self.task.as_mut() {
            Some(ctx) => ctx,
            None => return Ok(()),
        };
        if ctx.paused {
            return Ok(());
        }
        let mut watch = StopWatch::new();
        let now = env
            .get_tso()
            .await
            .context("during fetching the cluster timestamp")?;

        // How hard to try: with a healthy push path a fresh checkpoint can
        // ride on pushed events alone; a degraded one polls more eagerly.
        let healthy = ctx
            .subscriber
            .as_ref()
            .map(|sub| {
                sub.purge_stale();
                sub.all_healthy()
            })
            .unwrap_or(false);
        let threshold = if healthy {
            config.try_advance_threshold
        } else {
            config.degraded_poll_threshold()
        };
        let fresh = ctx
            .last_checkpoint_time
            .map(|at| at.elapsed() < threshold)
            .unwrap_or(false);

        if !(healthy && fresh) {
            Self::full_poll(&env, ctx).await?;
            metrics::TICK_DURATION
                .with_label_values(&["collect"])
                .observe(watch.lap().as_secs_f64());
        }

        let new_cp = ctx
            .map
            .lock()
            .unwrap()
            .min_value()
            .max(TimeStamp::new(ctx.task.start_ts));
        let current = ctx.checkpoint;
        if new_cp < current {
            return Err(Error::CheckpointRollback {
                current,
                target: new_cp,
            });
        }

        let lag = Duration::from_millis(now.physical().saturating_sub(new_cp.physical()));
        if lag > config.checkpoint_lag_limit {
            let err = Error::LaggedTooLarge {
                checkpoint: new_cp,
                lag,
                limit: config.checkpoint_lag_limit,
            };
            warn!("pausing the task: the checkpoint lagged too far behind";
                "task" => %ctx.task.name, "checkpoint" => %new_cp, "lag" => ?lag);
            meta.pause(&ctx.task.name, PAUSE_REASON_LAGGED).await?;
            if let Err(report_err) = meta
                .report_last_error(
                    &ctx.task.name,
                    LastError {
                        error_message: err.to_string(),
                        happen_at: TimeStamp::physical_now(),
                    },
                )
                .await
            {
                report_err.report("recording the pause cause");
            }
            ctx.paused = true;
            metrics::update_task_status(TaskStatus::Error, &ctx.task.name);
            return Err(err);
        }

        if new_cp > current {
            meta.set_global_checkpoint(&ctx.task.name, new_cp)
                .await
                .context("during publishing the checkpoint")?;
            env.update_service_safe_point(
                &ctx.task.name,
                TimeStamp::new(new_cp.into_inner().saturating_sub(1)),
                SAFE_POINT_TTL,
            )
            .await
            .context("during registering the service safe point")?;
            ctx.checkpoint = new_cp;
            ctx.ever_published = true;
            ctx.last_checkpoint_time = Some(Instant::now());
            metrics::CHECKPOINT_TS
                .with_label_values(&[ctx.task.name.as_str()])
                .set(new_cp.into_inner() as i64);
            metrics::TICK_DURATION
                .with_label_values(&["publish"])
                .observe(watch.lap().as_secs_f64());
            info!("the global checkpoint advanced";
                "task" => %ctx.task.name, "checkpoint" => %new_cp);
        } else {
            // Keep the safe point registration from expiring while stuck.
            if ctx.ever_published {
                env.update_service_safe_point(
                    &ctx.task.name,
                    TimeStamp::new(current.into_inner().saturating_sub(1)),
                    SAFE_POINT_TTL,
                )
                .await
                .context("during refreshing the service safe point")?;
            }
            Self::try_resolve_locks(&env, ctx, now);
        }
        Ok(())
    }

    /// Ask every store for the flush ts of the regions it owns, merging the
    /// replies into the interval map. Also the spot where subscriptions get
    /// (lazily) dialed, so the push path warms up alongside the poll.
    async fn full_poll(env: &E, ctx: &mut TaskContext<E>) -> Result<()> {
        let stores = env.stores().await.context("during listing the stores")?;
        let subscriber = ctx.subscriber.get_or_insert_with(|| {
            FlushSubscriber::new(
                env.clone(),
                Arc::new(MapSink(ctx.map.clone())),
                DEFAULT_FLUSH_INTERVAL,
            )
        });
        subscriber.update_store_topology(&stores);

        let collector = ClusterCollector::new(env.clone());
        let map = ctx.map.clone();
        let mut failures = vec![];
        for range in &ctx.ranges {
            let result = collector
                .get_checkpoint_in_range(range, |covered, ts| {
                    if let Err(err) = map.lock().unwrap().merge(covered, ts) {
                        err.report("merging a polled region checkpoint");
                    }
                })
                .await?;
            failures.extend(result.failure_sub_ranges);
        }
        if !failures.is_empty() {
            return Err(Error::PartialStoreFailure { ranges: failures });
        }
        // Only a poll that covered everything counts as fresh knowledge.
        ctx.last_checkpoint_time = Some(Instant::now());
        Ok(())
    }

    /// The checkpoint refused to move: when the bottleneck is old enough to
    /// be a stuck transaction, scan and resolve its locks in the background.
    /// One pass per task at a time.
    fn try_resolve_locks(env: &E, ctx: &TaskContext<E>, now: TimeStamp) {
        let target = TimeStamp::compose(
            TimeStamp::physical_now().saturating_sub(LOCK_RESOLVE_SLACK.as_millis() as u64),
            0,
        );
        if ctx.checkpoint >= target {
            return;
        }
        if ctx.in_resolving_lock.swap(true, Ordering::SeqCst) {
            return;
        }
        metrics::IN_RESOLVING_LOCK.set(1);
        let bottlenecks = ctx.map.lock().unwrap().min_segments();
        // Locks newer than the cluster's max timestamp are still needed for
        // correctness, never touch them.
        let max_ts = now.min(target);
        info!("the checkpoint is stuck, scanning for pending locks";
            "task" => %ctx.task.name, "checkpoint" => %ctx.checkpoint,
            "max_ts" => %max_ts, "ranges" => bottlenecks.len());
        let env = env.clone();
        let flag = ctx.in_resolving_lock.clone();
        let cancel = ctx.cancel.child_token();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                // The task got removed (or the owner retired) meanwhile.
                _ = cancel.cancelled() => Ok(()),
                outcome = resolve_locks_in(env, bottlenecks, max_ts) => outcome,
            };
            if let Err(err) = outcome {
                err.report("resolving pending locks");
            }
            flag.store(false, Ordering::SeqCst);
            metrics::IN_RESOLVING_LOCK.set(0);
        });
    }
}

async fn resolve_locks_in<E: AdvancerEnv>(
    env: E,
    ranges: Vec<KeyRange>,
    max_ts: TimeStamp,
) -> Result<()> {
    for range in ranges {
        loop {
            let locks = env.scan_locks(&range, max_ts, LOCK_SCAN_BATCH).await?;
            if locks.is_empty() {
                break;
            }
            let maybe_more = locks.len() == LOCK_SCAN_BATCH;
            info!("resolving a batch of pending locks";
                "count" => locks.len(), "max_ts" => %max_ts);
            env.resolve_locks(locks).await?;
            if !maybe_more {
                break;
            }
        }
    }
    Ok(())
}

/// List the current task set, then watch for changes; relist from scratch
/// whenever the watch breaks.
async fn task_listener_loop<S: MetaStore>(
    meta: MetadataClient<S>,
    tx: mpsc::Sender<MetadataEvent>,
    cancel: CancellationToken,
    backoff: Duration,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match watch_round(&meta, &tx, &cancel).await {
            Ok(()) => return,
            Err(err) => {
                err.report("watching the task events");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

async fn watch_round<S: MetaStore>(
    meta: &MetadataClient<S>,
    tx: &mpsc::Sender<MetadataEvent>,
    cancel: &CancellationToken,
) -> Result<()> {
    let tasks = meta.get_tasks().await?;
    let revision = tasks.revision;
    for task in tasks.inner {
        if tx.send(MetadataEvent::AddTask { task }).await.is_err() {
            return Ok(());
        }
    }
    let crate::metadata::Watcher {
        stream: task_stream,
        cancel: cancel_task_watch,
    } = meta.events_from(revision).await?;
    let crate::metadata::Watcher {
        stream: pause_stream,
        cancel: cancel_pause_watch,
    } = meta.events_from_pause(revision).await?;
    let mut stream = futures::stream::select(task_stream, pause_stream);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                drop(stream);
                cancel_task_watch.await;
                cancel_pause_watch.await;
                return Ok(());
            }
            event = stream.next() => match event {
                None => {
                    drop(stream);
                    cancel_task_watch.await;
                    cancel_pause_watch.await;
                    return Err(crate::annotate!(
                        "the server went away",
                        "the task watch stream closed unexpectedly"
                    ));
                }
                Some(MetadataEvent::Error { err }) => {
                    drop(stream);
                    cancel_task_watch.await;
                    cancel_pause_watch.await;
                    return Err(err);
                }
                Some(event) => {
                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<E: AdvancerEnv, S: MetaStore> TickingDaemon for CheckpointAdvancer<E, S> {
    fn name(&self) -> &'static str {
        "log-backup-advancer"
    }

    fn interval(&self) -> Duration {
        self.config.tick_duration
    }

    async fn on_start(&mut self) -> Result<()> {
        CheckpointAdvancer::on_become_owner(self).await
    }

    async fn on_tick(&mut self) -> Result<()> {
        CheckpointAdvancer::on_tick(self).await
    }

    async fn on_retire(&mut self) {
        CheckpointAdvancer::on_retire(self).await
    }
}
