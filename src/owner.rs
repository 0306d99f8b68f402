// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The single-owner gate. Many advancer instances may run at once; only the
//! one holding the lease actually subscribes, polls and publishes. The rest
//! camp on the election until the owner's lease expires.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use etcd_client::{Compare, CompareOp, PutOptions, Txn, TxnOp};
use slog_scope::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    errors::{ContextualResultExt, Error, Result},
    metrics,
};

const ELECTION_KEY: &str = "/tidb/br-stream/owner";
const LEASE_TTL: i64 = 15;
const CAMPAIGN_RETRY_GAP: Duration = Duration::from_secs(1);

/// Election over the meta service. `campaign` parks until this instance wins;
/// afterwards `is_owner` flips back to false once the lease is lost or given
/// up.
#[async_trait]
pub trait OwnerManager: Clone + Send + Sync + 'static {
    async fn campaign(&self) -> Result<()>;
    fn is_owner(&self) -> bool;
    async fn resign(&self) -> Result<()>;
}

struct EtcdOwnerInner {
    client: tokio::sync::Mutex<etcd_client::Client>,
    instance_id: String,
    is_owner: AtomicBool,
    lease: tokio::sync::Mutex<Option<i64>>,
}

/// An owner manager over an etcd lease: the owner is whoever managed to
/// create the election key attached to its own lease. Losing the lease (the
/// keep-alive fails) deletes the key server-side and lets others in.
#[derive(Clone)]
pub struct EtcdOwnerManager(Arc<EtcdOwnerInner>);

impl EtcdOwnerManager {
    pub fn new(client: etcd_client::Client, instance_id: String) -> Self {
        Self(Arc::new(EtcdOwnerInner {
            client: tokio::sync::Mutex::new(client),
            instance_id,
            is_owner: AtomicBool::new(false),
            lease: tokio::sync::Mutex::new(None),
        }))
    }

    async fn try_claim(&self) -> Result<bool> {
        let mut client = self.0.client.lock().await;
        let lease = client.lease_grant(LEASE_TTL, None).await?;
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                ELECTION_KEY,
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(
                ELECTION_KEY,
                self.0.instance_id.as_bytes(),
                Some(PutOptions::new().with_lease(lease.id())),
            )]);
        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            // Somebody else holds the key, give the lease back.
            let _ = client.lease_revoke(lease.id()).await;
            return Ok(false);
        }
        *self.0.lease.lock().await = Some(lease.id());
        self.0.is_owner.store(true, Ordering::SeqCst);
        self.spawn_keep_alive(lease.id());
        Ok(true)
    }

    fn spawn_keep_alive(&self, lease: i64) {
        let this = self.0.clone();
        tokio::spawn(async move {
            let keep_alive = async {
                let (mut keeper, mut responses) =
                    this.client.lock().await.lease_keep_alive(lease).await?;
                let mut ticker = tokio::time::interval(Duration::from_secs(
                    (LEASE_TTL as u64 / 3).max(1),
                ));
                loop {
                    ticker.tick().await;
                    if !this.is_owner.load(Ordering::SeqCst) {
                        return Result::Ok(());
                    }
                    keeper.keep_alive().await?;
                    responses.message().await?;
                }
            };
            if let Err(err) = keep_alive.await {
                err.report("the ownership lease keep-alive failed");
                this.is_owner.store(false, Ordering::SeqCst);
            }
        });
    }
}

#[async_trait]
impl OwnerManager for EtcdOwnerManager {
    async fn campaign(&self) -> Result<()> {
        loop {
            if self
                .try_claim()
                .await
                .context("during claiming the ownership")?
            {
                return Ok(());
            }
            tokio::time::sleep(CAMPAIGN_RETRY_GAP).await;
        }
    }

    fn is_owner(&self) -> bool {
        self.0.is_owner.load(Ordering::SeqCst)
    }

    async fn resign(&self) -> Result<()> {
        self.0.is_owner.store(false, Ordering::SeqCst);
        let mut client = self.0.client.lock().await;
        if let Some(lease) = self.0.lease.lock().await.take() {
            // Revoking the lease removes the election key with it.
            client.lease_revoke(lease).await?;
        }
        Ok(())
    }
}

struct ManualOwnerInner {
    granted: tokio::sync::watch::Sender<bool>,
}

/// An owner manager steered by hand. For tests.
#[derive(Clone)]
pub struct ManualOwner(Arc<ManualOwnerInner>);

impl Default for ManualOwner {
    fn default() -> Self {
        let (granted, _) = tokio::sync::watch::channel(false);
        Self(Arc::new(ManualOwnerInner { granted }))
    }
}

impl ManualOwner {
    pub fn grant(&self) {
        self.0.granted.send_replace(true);
    }

    pub fn revoke(&self) {
        self.0.granted.send_replace(false);
    }
}

#[async_trait]
impl OwnerManager for ManualOwner {
    async fn campaign(&self) -> Result<()> {
        let mut rx = self.0.granted.subscribe();
        loop {
            if *rx.borrow() {
                return Ok(());
            }
            // The sender lives in `self`, this cannot fail.
            let _ = rx.changed().await;
        }
    }

    fn is_owner(&self) -> bool {
        *self.0.granted.borrow()
    }

    async fn resign(&self) -> Result<()> {
        self.0.granted.send_replace(false);
        Ok(())
    }
}

/// The long-lived component the owner daemon drives: started when ownership
/// arrives, ticked while it lasts, retired when it goes.
#[async_trait]
pub trait TickingDaemon: Send + 'static {
    fn name(&self) -> &'static str;
    fn interval(&self) -> Duration;

    async fn on_start(&mut self) -> Result<()>;
    async fn on_tick(&mut self) -> Result<()>;
    async fn on_retire(&mut self);
}

/// Runs a [`TickingDaemon`] whenever (and only while) the election is won.
pub struct OwnerDaemon<D, O> {
    daemon: D,
    owner: O,
    /// When nonzero, step down after holding the ownership this long. A
    /// chaos-testing hook, keep zero in production.
    pub ownership_cycle_interval: Duration,
}

impl<D: TickingDaemon, O: OwnerManager> OwnerDaemon<D, O> {
    pub fn new(daemon: D, owner: O) -> Self {
        Self {
            daemon,
            owner,
            ownership_cycle_interval: Duration::ZERO,
        }
    }

    /// Enable the voluntary step-down chaos hook (usually from
    /// `Config::ownership_cycle_interval`).
    pub fn with_ownership_cycle(mut self, interval: Duration) -> Self {
        self.ownership_cycle_interval = interval;
        self
    }

    /// Drive the daemon until `cancel` fires. Returns the daemon so callers
    /// can inspect it afterwards.
    pub async fn run(mut self, cancel: CancellationToken) -> D {
        loop {
            let campaign = tokio::select! {
                _ = cancel.cancelled() => return self.daemon,
                result = self.owner.campaign() => result,
            };
            if let Err(err) = campaign {
                err.report("campaigning for the ownership");
                tokio::select! {
                    _ = cancel.cancelled() => return self.daemon,
                    _ = tokio::time::sleep(CAMPAIGN_RETRY_GAP) => continue,
                }
            }
            info!("became the owner"; "daemon" => self.daemon.name());
            metrics::OWNER.set(1);
            if let Err(err) = self.daemon.on_start().await {
                err.report("starting the owned daemon");
                self.step_down().await;
                continue;
            }

            let held_since = Instant::now();
            let mut ticker = tokio::time::interval(self.daemon.interval());
            // The first tick of `interval` fires at once; skip it so the
            // daemon observes a full period after starting.
            ticker.tick().await;
            while self.owner.is_owner() && !cancel.is_cancelled() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !self.owner.is_owner() {
                    break;
                }
                tokio::select! {
                    // A cancellation mid-tick drops the in-flight work before
                    // it can write anywhere.
                    _ = cancel.cancelled() => {
                        Error::OwnershipLost.report("a tick was still in flight");
                        break;
                    }
                    result = self.daemon.on_tick() => {
                        if let Err(err) = result {
                            err.report("ticking the owned daemon");
                        }
                    }
                }
                if !self.ownership_cycle_interval.is_zero()
                    && held_since.elapsed() >= self.ownership_cycle_interval
                {
                    warn!("voluntarily stepping down"; "daemon" => self.daemon.name());
                    break;
                }
            }
            self.step_down().await;
            if cancel.is_cancelled() {
                return self.daemon;
            }
        }
    }

    async fn step_down(&mut self) {
        if let Err(err) = self.owner.resign().await {
            err.report("resigning the ownership");
        }
        self.daemon.on_retire().await;
        metrics::OWNER.set(0);
        info!("retired from the owner"; "daemon" => self.daemon.name());
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::{ManualOwner, OwnerDaemon, OwnerManager, TickingDaemon};
    use crate::errors::Result;

    #[derive(Default, Clone)]
    struct Counters {
        starts: Arc<AtomicUsize>,
        ticks: Arc<AtomicUsize>,
        retires: Arc<AtomicUsize>,
    }

    struct CountingDaemon(Counters);

    #[async_trait]
    impl TickingDaemon for CountingDaemon {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn on_start(&mut self) -> Result<()> {
            self.0.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_tick(&mut self) -> Result<()> {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_retire(&mut self) {
            self.0.retires.fetch_add(1, Ordering::SeqCst);
        }
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
    async fn test_daemon_follows_ownership() {
        let counters = Counters::default();
        let owner = ManualOwner::default();
        let daemon = OwnerDaemon::new(CountingDaemon(counters.clone()), owner.clone());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(cancel.clone()));

        // Nothing runs before the election is won.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counters.starts.load(Ordering::SeqCst), 0);

        owner.grant();
        let ticks = counters.ticks.clone();
        wait_until(move || ticks.load(Ordering::SeqCst) >= 3).await;
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);

        // Losing the lease retires the daemon...
        owner.revoke();
        let retires = counters.retires.clone();
        wait_until(move || retires.load(Ordering::SeqCst) == 1).await;

        // ...and winning it again restarts it.
        owner.grant();
        let starts = counters.starts.clone();
        wait_until(move || starts.load(Ordering::SeqCst) == 2).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("the daemon never observed the cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn test_ownership_cycling() {
        let counters = Counters::default();
        let owner = ManualOwner::default();
        let mut daemon = OwnerDaemon::new(CountingDaemon(counters.clone()), owner.clone());
        daemon.ownership_cycle_interval = Duration::from_millis(30);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(cancel.clone()));

        owner.grant();
        let retires = counters.retires.clone();
        wait_until(move || retires.load(Ordering::SeqCst) >= 1).await;
        assert!(!owner.is_owner());

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("the daemon never observed the cancellation");
    }
}
