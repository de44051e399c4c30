//! Backlog of pending downstream calls and the drain loop that dispatches
//! them in batches under keys granted by the [`KeyPool`].
//!
//! At most one drain loop runs at a time. It is started by the first
//! [`DispatchQueue::submit`] that finds it idle and exits once the backlog
//! is empty. One key acquisition authorizes a whole batch, so a key's quota
//! bounds batches per window rather than individual calls.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::future::join_all;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::downstream::Downstream;
use crate::key_pool::{KeyPool, KeyUsage};
use crate::metrics::{BACKLOG_DEPTH, BATCHES_DISPATCHED, CALL_FAILURES, CALLS_SUBMITTED, KEY_WAITS};
use crate::models::{CallOutcome, QueueEntry};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue is full (max: {max})")]
    Full { max: usize },

    #[error("Queue shutdown")]
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub batch_size: usize,
    /// `None` keeps the backlog unbounded.
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub submitted: u64,
    pub dispatched: u64,
    pub batches: u64,
    pub key_selections: u64,
    pub key_waits: u64,
    pub failures: u64,
    pub backlog: usize,
    pub draining: bool,
}

/// Completes once with the outcome of the submitted call, or with
/// [`QueueError::Closed`] if the queue shut down before dispatching it.
#[derive(Debug)]
pub struct Ticket {
    response_rx: oneshot::Receiver<CallOutcome>,
}

impl Future for Ticket {
    type Output = Result<CallOutcome, QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.response_rx)
            .poll(cx)
            .map(|result| result.map_err(|_| QueueError::Closed))
    }
}

// backlog and drain flag share one lock so check-and-set is atomic
#[derive(Default)]
struct Backlog {
    entries: VecDeque<QueueEntry>,
    draining: bool,
    closed: bool,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    batches: AtomicU64,
    key_selections: AtomicU64,
    key_waits: AtomicU64,
    failures: AtomicU64,
}

struct Inner {
    key_pool: Mutex<KeyPool>,
    downstream: Arc<dyn Downstream>,
    config: QueueConfig,
    backlog: Mutex<Backlog>,
    counters: Counters,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DispatchQueue {
    pub fn new(key_pool: KeyPool, downstream: Arc<dyn Downstream>, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                key_pool: Mutex::new(key_pool),
                downstream,
                config: QueueConfig {
                    batch_size: config.batch_size.max(1),
                    ..config
                },
                backlog: Mutex::new(Backlog::default()),
                counters: Counters::default(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Appends one call to the tail of the backlog and starts the drain loop
    /// if it is idle. Never waits; fails only when the queue is bounded and
    /// full, or shut down.
    pub fn submit(&self) -> Result<Ticket, QueueError> {
        let mut tickets = self.submit_many(1)?;
        tickets.pop().ok_or(QueueError::Closed)
    }

    /// Appends `count` calls under a single lock. Either all of them are
    /// queued or none is, so a rejected caller leaves nothing behind.
    pub fn submit_many(&self, count: usize) -> Result<Vec<Ticket>, QueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let (start_drain, tickets) = {
            let mut backlog = lock(&self.inner.backlog);
            if backlog.closed {
                return Err(QueueError::Closed);
            }
            if let Some(max) = self
                .inner
                .config
                .capacity
                .filter(|max| backlog.entries.len() + count > *max)
            {
                return Err(QueueError::Full { max });
            }

            let tickets = (0..count)
                .map(|_| {
                    let (response_tx, response_rx) = oneshot::channel();
                    backlog.entries.push_back(QueueEntry { response_tx });
                    Ticket { response_rx }
                })
                .collect::<Vec<_>>();
            BACKLOG_DEPTH.set(backlog.entries.len() as f64);
            (!std::mem::replace(&mut backlog.draining, true), tickets)
        };

        self.inner
            .counters
            .submitted
            .fetch_add(count as u64, Ordering::Relaxed);
        CALLS_SUBMITTED.inc_by(count as f64);

        if start_drain {
            tokio::spawn(Arc::clone(&self.inner).drain());
        }

        Ok(tickets)
    }

    /// Stops dispatching. Entries still in the backlog are dropped and their
    /// tickets resolve to [`QueueError::Closed`].
    pub fn shutdown(&self) {
        let dropped = {
            let mut backlog = lock(&self.inner.backlog);
            backlog.closed = true;
            let dropped = backlog.entries.len();
            backlog.entries.clear();
            dropped
        };
        BACKLOG_DEPTH.set(0.0);
        self.inner.shutdown.cancel();
        tracing::info!(dropped, "Dispatch queue shut down");
    }

    pub fn stats(&self) -> QueueStats {
        let counters = &self.inner.counters;
        let (backlog, draining) = {
            let backlog = lock(&self.inner.backlog);
            (backlog.entries.len(), backlog.draining)
        };
        QueueStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            batches: counters.batches.load(Ordering::Relaxed),
            key_selections: counters.key_selections.load(Ordering::Relaxed),
            key_waits: counters.key_waits.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            backlog,
            draining,
        }
    }

    pub fn key_usage(&self) -> Vec<KeyUsage> {
        lock(&self.inner.key_pool).snapshot()
    }
}

impl Inner {
    async fn drain(self: Arc<Self>) {
        tracing::debug!("Drain loop started");

        loop {
            // emptiness check, key charge and batch take happen under one
            // backlog lock, so a granted key always gets a non-empty batch
            let grant = {
                let mut backlog = lock(&self.backlog);
                if backlog.entries.is_empty() {
                    backlog.draining = false;
                    break;
                }

                self.counters.key_selections.fetch_add(1, Ordering::Relaxed);
                let selection = lock(&self.key_pool).select_key();

                selection
                    .key
                    .map(|key| {
                        let take = self.config.batch_size.min(backlog.entries.len());
                        let batch: Vec<QueueEntry> = backlog.entries.drain(..take).collect();
                        BACKLOG_DEPTH.set(backlog.entries.len() as f64);
                        (key, batch)
                    })
                    .ok_or(selection.wait)
            };

            let (key, batch) = match grant {
                Ok(granted) => granted,
                Err(wait) => {
                    self.counters.key_waits.fetch_add(1, Ordering::Relaxed);
                    KEY_WAITS.inc();
                    tracing::debug!(
                        wait_ms = wait.as_millis() as u64,
                        "All keys at quota, waiting for a window reset"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                    continue;
                }
            };

            self.counters.batches.fetch_add(1, Ordering::Relaxed);
            self.counters
                .dispatched
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            BATCHES_DISPATCHED.inc();
            tracing::debug!(key = %key, size = batch.len(), "Dispatching batch");

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::warn!("Shutdown interrupted an in-flight batch");
                }
                _ = self.dispatch(&key, batch) => {}
            }
        }

        tracing::debug!("Drain loop finished, backlog empty");
    }

    // Calls run concurrently; returns once every entry has been resolved
    async fn dispatch(&self, key: &str, batch: Vec<QueueEntry>) {
        let calls = batch.into_iter().map(|entry| async move {
            let outcome = match self.downstream.call(key).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(key, error = %e, "Downstream call failed");
                    CallOutcome::Error
                }
            };
            if outcome == CallOutcome::Error {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                CALL_FAILURES.inc();
            }
            // caller may have gone away, nothing to do then
            let _ = entry.response_tx.send(outcome);
        });

        join_all(calls).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downstream::DownstreamError;
    use crate::key_pool::DEFAULT_WINDOW;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        Succeed,
        Fail,
        // odd calls succeed, even calls fail
        Alternate,
    }

    struct Recorder {
        latency: Duration,
        behaviour: Behaviour,
        calls: Mutex<Vec<(String, Instant)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Recorder {
        fn new(latency: Duration, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                latency,
                behaviour,
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn keys(&self) -> Vec<String> {
            lock(&self.calls).iter().map(|(k, _)| k.clone()).collect()
        }

        fn times(&self) -> Vec<Instant> {
            lock(&self.calls).iter().map(|(_, t)| *t).collect()
        }
    }

    #[async_trait]
    impl Downstream for Recorder {
        async fn call(&self, key: &str) -> Result<CallOutcome, DownstreamError> {
            let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

            let index = {
                let mut calls = lock(&self.calls);
                calls.push((key.to_string(), Instant::now()));
                calls.len()
            };
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match self.behaviour {
                Behaviour::Succeed => Ok(CallOutcome::Success),
                Behaviour::Fail => Err(DownstreamError::Request("boom".to_string())),
                Behaviour::Alternate if index % 2 == 1 => Ok(CallOutcome::Success),
                Behaviour::Alternate => Err(DownstreamError::Request("boom".to_string())),
            }
        }
    }

    fn queue(keys: &[&str], quota: u32, batch_size: usize, downstream: Arc<Recorder>) -> DispatchQueue {
        let keys = keys.iter().map(|s| s.to_string()).collect();
        let pool = KeyPool::new(keys, quota).unwrap();
        DispatchQueue::new(
            pool,
            downstream,
            QueueConfig {
                batch_size,
                capacity: None,
            },
        )
    }

    async fn submit_all(queue: &DispatchQueue, n: usize) -> Vec<CallOutcome> {
        let tickets: Vec<Ticket> = (0..n).map(|_| queue.submit().unwrap()).collect();
        join_all(tickets)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    async fn wait_idle(queue: &DispatchQueue) {
        while queue.stats().draining {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_acquisition_per_key_authorizes_a_batch() {
        let recorder = Recorder::new(Duration::ZERO, Behaviour::Succeed);
        let queue = queue(&["k1", "k2", "k3"], 1, 10, recorder.clone());

        let results = submit_all(&queue, 25).await;
        wait_idle(&queue).await;

        assert_eq!(results, vec![CallOutcome::Success; 25]);
        let stats = queue.stats();
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.key_waits, 0);
        assert_eq!(stats.dispatched, 25);
        assert!(queue.key_usage().iter().all(|usage| usage.usage_count == 1));

        let keys = recorder.keys();
        assert_eq!(keys.iter().filter(|k| *k == "k1").count(), 10);
        assert_eq!(keys.iter().filter(|k| *k == "k2").count(), 10);
        assert_eq!(keys.iter().filter(|k| *k == "k3").count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_key_waits_for_window_reset() {
        let t0 = Instant::now();
        let recorder = Recorder::new(Duration::ZERO, Behaviour::Succeed);
        let queue = queue(&["only"], 2, 1, recorder.clone());

        let results = submit_all(&queue, 5).await;
        assert_eq!(results.len(), 5);

        let offsets: Vec<Duration> = recorder.times().iter().map(|t| *t - t0).collect();
        assert_eq!(offsets.len(), 5);
        let tolerance = Duration::from_secs(1);
        assert!(offsets[0] < tolerance);
        assert!(offsets[1] < tolerance);
        for offset in &offsets[2..4] {
            assert!(*offset >= DEFAULT_WINDOW && *offset < DEFAULT_WINDOW + tolerance);
        }
        assert!(offsets[4] >= DEFAULT_WINDOW * 2 && offsets[4] < DEFAULT_WINDOW * 2 + tolerance);

        let stats = queue.stats();
        assert_eq!(stats.batches, 5);
        assert!(stats.key_waits >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_resolve_with_error_marker() {
        let recorder = Recorder::new(Duration::from_millis(5), Behaviour::Fail);
        let queue = queue(&["k1"], 100, 4, recorder);

        let results = submit_all(&queue, 10).await;
        wait_idle(&queue).await;

        assert_eq!(results, vec![CallOutcome::Error; 10]);
        let stats = queue.stats();
        assert_eq!(stats.failures, 10);
        assert_eq!(stats.backlog, 0);
        assert!(!stats.draining);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_submissions_never_selects_a_key() {
        let recorder = Recorder::new(Duration::ZERO, Behaviour::Succeed);
        let queue = queue(&["k1"], 1, 10, recorder.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;

        let stats = queue.stats();
        assert!(!stats.draining);
        assert_eq!(stats.key_selections, 0);
        assert!(recorder.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_follow_arrival_order() {
        let recorder = Recorder::new(Duration::from_millis(1), Behaviour::Alternate);
        let queue = queue(&["k1", "k2"], 1000, 1, recorder);

        let results = submit_all(&queue, 6).await;

        use CallOutcome::{Error, Success};
        assert_eq!(results, vec![Success, Error, Success, Error, Success, Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_waits_for_every_call() {
        let recorder = Recorder::new(Duration::from_millis(20), Behaviour::Succeed);
        let queue = queue(&["k1"], 1000, 3, recorder.clone());

        submit_all(&queue, 7).await;

        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 3);
        let times = recorder.times();
        // three batches, each starting after the previous one completed
        assert_eq!(times[0], times[2]);
        assert!(times[3] - times[0] >= Duration::from_millis(20));
        assert!(times[6] - times[3] >= Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_restarts_after_going_idle() {
        let recorder = Recorder::new(Duration::ZERO, Behaviour::Succeed);
        let queue = queue(&["k1"], 1000, 10, recorder.clone());

        submit_all(&queue, 3).await;
        wait_idle(&queue).await;
        assert_eq!(queue.stats().batches, 1);

        submit_all(&queue, 2).await;
        wait_idle(&queue).await;
        assert_eq!(queue.stats().batches, 2);
        assert_eq!(recorder.keys().len(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_drain_loop_under_parallel_submits() {
        let recorder = Recorder::new(Duration::from_millis(1), Behaviour::Succeed);
        let queue = queue(&["k1", "k2", "k3"], 10_000, 10, recorder.clone());

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { submit_all(&queue, 250).await })
            })
            .collect();

        let mut resolved = 0;
        for producer in producers {
            let results = producer.await.unwrap();
            assert!(results.iter().all(|r| *r == CallOutcome::Success));
            resolved += results.len();
        }

        assert_eq!(resolved, 1000);
        assert_eq!(recorder.keys().len(), 1000);
        assert!(recorder.max_in_flight.load(Ordering::SeqCst) <= 10);
        let stats = queue.stats();
        assert_eq!(stats.dispatched, 1000);
        assert!(stats.batches * 10 >= 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_backlog_rejects_when_full() {
        let pool = KeyPool::new(vec!["k1".to_string()], 0).unwrap();
        let queue = DispatchQueue::new(
            pool,
            Recorder::new(Duration::ZERO, Behaviour::Succeed),
            QueueConfig {
                batch_size: 1,
                capacity: Some(2),
            },
        );

        let _first = queue.submit().unwrap();
        let _second = queue.submit().unwrap();
        assert_eq!(queue.submit().unwrap_err(), QueueError::Full { max: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_starved_tickets() {
        let recorder = Recorder::new(Duration::ZERO, Behaviour::Succeed);
        let queue = queue(&["k1"], 0, 5, recorder.clone());

        let mut ticket = queue.submit().unwrap();
        let pending = tokio::time::timeout(Duration::from_secs(300), &mut ticket).await;
        assert!(pending.is_err());
        assert!(queue.stats().key_waits >= 1);

        queue.shutdown();
        assert_eq!(ticket.await, Err(QueueError::Closed));
        assert_eq!(queue.submit().unwrap_err(), QueueError::Closed);

        wait_idle(&queue).await;
        assert!(recorder.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_many_is_all_or_nothing() {
        let pool = KeyPool::new(vec!["k1".to_string()], 0).unwrap();
        let queue = DispatchQueue::new(
            pool,
            Recorder::new(Duration::ZERO, Behaviour::Succeed),
            QueueConfig {
                batch_size: 1,
                capacity: Some(5),
            },
        );

        let first = queue.submit_many(3).unwrap();
        assert_eq!(first.len(), 3);

        assert_eq!(queue.submit_many(3).unwrap_err(), QueueError::Full { max: 5 });
        let stats = queue.stats();
        assert_eq!(stats.backlog, 3);
        assert_eq!(stats.submitted, 3);

        assert_eq!(queue.submit_many(2).unwrap().len(), 2);
        assert_eq!(queue.stats().backlog, 5);
        assert!(queue.submit_many(0).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_in_flight_batch() {
        let recorder = Recorder::new(Duration::from_secs(600), Behaviour::Succeed);
        let queue = queue(&["k1"], 1000, 3, recorder.clone());

        let tickets = queue.submit_many(5).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let stats = queue.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.dispatched, 3);
        assert_eq!(stats.backlog, 2);
        assert_eq!(recorder.keys().len(), 3);

        queue.shutdown();

        for result in join_all(tickets).await {
            assert_eq!(result, Err(QueueError::Closed));
        }
        wait_idle(&queue).await;
        let stats = queue.stats();
        assert!(!stats.draining);
        assert_eq!(stats.batches, 1);
        assert_eq!(recorder.keys().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_key_charged_only_for_non_empty_batches() {
        for _ in 0..200 {
            let recorder = Recorder::new(Duration::ZERO, Behaviour::Succeed);
            let queue = queue(&["k1", "k2"], 10_000, 10, recorder);

            let closer = {
                let queue = queue.clone();
                tokio::spawn(async move { queue.shutdown() })
            };
            let _ = queue.submit_many(1);
            closer.await.unwrap();
            wait_idle(&queue).await;

            let stats = queue.stats();
            let charged: u64 = queue
                .key_usage()
                .iter()
                .map(|usage| u64::from(usage.usage_count))
                .sum();
            assert_eq!(charged, stats.batches);
            assert!(stats.batches <= stats.dispatched);
        }
    }
}
