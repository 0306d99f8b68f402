// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use slog_scope::warn;
use tokio::sync::oneshot;

use crate::errors::Result;

/// Render a key for logging. Keys are user data, don't print them raw.
pub fn redact(key: &impl AsRef<[u8]>) -> String {
    hex::encode_upper(key.as_ref())
}

/// StopWatch is a utility for recording time cost in multi-stage tasks.
pub struct StopWatch(Instant);

impl StopWatch {
    pub fn new() -> Self {
        Self(Instant::now())
    }

    /// Get time elapsed since last lap (or creation if the first time).
    pub fn lap(&mut self) -> Duration {
        let elapsed = self.0.elapsed();
        self.0 = Instant::now();
        elapsed
    }
}

impl Default for StopWatch {
    fn default() -> Self {
        Self::new()
    }
}

/// A wait group that notifies waiters via callbacks once every piece of
/// outstanding work has been dropped.
pub struct CallbackWaitGroup {
    running: AtomicUsize,
    on_finish_all: Mutex<Vec<Box<dyn FnOnce() + Send + 'static>>>,
}

/// A guard for one piece of running work.
pub struct Work(Arc<CallbackWaitGroup>);

impl Drop for Work {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.notify_all();
        }
    }
}

impl CallbackWaitGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicUsize::new(0),
            on_finish_all: Mutex::new(vec![]),
        })
    }

    pub fn work(self: &Arc<Self>) -> Work {
        self.running.fetch_add(1, Ordering::SeqCst);
        Work(self.clone())
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait until all current works are dropped.
    pub fn wait(self: &Arc<Self>) -> impl Future<Output = ()> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.on_finish_all.lock().unwrap().push(Box::new(move || {
            // The waiter may have gone.
            let _ = tx.send(());
        }));
        if self.running() == 0 {
            self.notify_all();
        }
        async move {
            let _ = rx.await;
        }
    }

    fn notify_all(&self) {
        let callbacks = std::mem::take(&mut *self.on_finish_all.lock().unwrap());
        for cb in callbacks {
            cb()
        }
    }
}

/// Run the action, retrying transient failures with a fixed backoff.
pub async fn retry<T, F, Fut>(mut action: F, max_retry: usize, backoff: Duration) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry_time = 0;
    loop {
        match action().await {
            Ok(item) => return Ok(item),
            Err(err) if retry_time < max_retry => {
                warn!("retrying failed operation"; "err" => %err, "retry_time" => retry_time);
                retry_time += 1;
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}
