//! Request deduplication and opportunistic batching
//!
//! At most one in-flight request exists per key. Callers asking for a key
//! that is already in flight subscribe to it instead of starting another
//! execution. New keys wait out a short debounce window, during which other
//! compatible keys (same batch group) may join the same executor call.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Batching window and size limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Debounce delay before a new batch closes
    pub window: Duration,
    /// A batch closes early once it holds this many keys
    pub max_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(25),
            max_batch_size: 20,
        }
    }
}

/// Executes every request of one closed batch in a single call.
#[async_trait]
pub trait BatchExecutor<R, T>: Send + Sync {
    /// An outer error fails every subscriber of the batch; inner results
    /// are delivered per key.
    async fn execute_batch(&self, requests: Vec<(String, R)>)
        -> Result<HashMap<String, Result<T>>>;
}

type Reply<T> = oneshot::Sender<Result<T>>;

struct InFlight<T> {
    subscribers: Vec<(Uuid, Reply<T>)>,
    created_at: Instant,
    closed: bool,
}

struct OpenBatch<R, T> {
    id: Uuid,
    requests: Vec<(String, R)>,
    executor: Arc<dyn BatchExecutor<R, T>>,
    full: Arc<Notify>,
}

struct Registry<R, T> {
    in_flight: HashMap<String, InFlight<T>>,
    /// batch group -> batch still accepting keys
    open: HashMap<String, OpenBatch<R, T>>,
    /// batches that hit max size and wait for their timer task to pick them up
    sealed: HashMap<Uuid, OpenBatch<R, T>>,
}

impl<R, T> Registry<R, T> {
    fn take_batch(&mut self, group: &str, id: Uuid) -> Option<OpenBatch<R, T>> {
        if self.open.get(group).is_some_and(|b| b.id == id) {
            return self.open.remove(group);
        }
        self.sealed.remove(&id)
    }

    fn close(&mut self, keys: &[String]) {
        for key in keys {
            if let Some(in_flight) = self.in_flight.get_mut(key) {
                in_flight.closed = true;
            }
        }
    }
}

#[derive(Default)]
struct CoordinatorStats {
    executions: AtomicU64,
    deduplicated: AtomicU64,
    merged: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatsSnapshot {
    /// Executor calls started
    pub executions: u64,
    /// Callers that joined an existing in-flight request
    pub deduplicated: u64,
    /// Keys that joined another key's open batch
    pub merged: u64,
    pub in_flight: usize,
}

/// Dedup and batching front of the execution layer.
pub struct BatchCoordinator<R, T> {
    config: BatchConfig,
    registry: Arc<Mutex<Registry<R, T>>>,
    stats: Arc<CoordinatorStats>,
}

impl<R, T> Clone for BatchCoordinator<R, T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config,
            registry: Arc::clone(&self.registry),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<R, T> BatchCoordinator<R, T>
where
    R: Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Mutex::new(Registry {
                in_flight: HashMap::new(),
                open: HashMap::new(),
                sealed: HashMap::new(),
            })),
            stats: Arc::new(CoordinatorStats::default()),
        }
    }

    pub fn config(&self) -> BatchConfig {
        self.config
    }

    /// Run `executor` for `key` once, shared by every concurrent caller.
    ///
    /// The executor starts after the debounce window and runs to completion
    /// even if every caller has gone away by then.
    pub async fn schedule<F, Fut>(&self, key: &str, executor: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (subscription, rx, leader) = {
            let mut registry = self.registry.lock();
            let (id, rx, leader) = self.subscribe(&mut registry, key);
            (self.subscription(key, id), rx, leader)
        };

        if leader {
            let registry = Arc::clone(&self.registry);
            let stats = Arc::clone(&self.stats);
            let window = self.config.window;
            let keys = vec![key.to_string()];
            tokio::spawn(async move {
                let mut guard = SettleGuard::new(Arc::clone(&registry), keys.clone());
                tokio::time::sleep(window).await;
                registry.lock().close(&keys);

                stats.executions.fetch_add(1, Ordering::Relaxed);
                let result = executor().await;
                guard.disarm();
                settle(&registry, &keys[0], result);
            });
        }

        subscription.wait(rx).await
    }

    /// Run `request` for `key` through a batch shared with other keys of
    /// the same `group`.
    ///
    /// `executor` is used only when this call opens a new batch; later
    /// joiners ride on the executor of the batch they join.
    pub async fn schedule_batch(
        &self,
        group: &str,
        key: &str,
        request: R,
        executor: Arc<dyn BatchExecutor<R, T>>,
    ) -> Result<T> {
        let (subscription, rx) = {
            let mut registry = self.registry.lock();
            let (id, rx, leader) = self.subscribe(&mut registry, key);
            if leader {
                self.enqueue(&mut registry, group, key, request, executor);
            }
            (self.subscription(key, id), rx)
        };

        subscription.wait(rx).await
    }

    fn subscribe(
        &self,
        registry: &mut Registry<R, T>,
        key: &str,
    ) -> (Uuid, oneshot::Receiver<Result<T>>, bool) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        if let Some(in_flight) = registry.in_flight.get_mut(key) {
            in_flight.subscribers.push((id, tx));
            self.stats.deduplicated.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %key,
                subscribers = in_flight.subscribers.len(),
                age_ms = in_flight.created_at.elapsed().as_millis() as u64,
                "Joined in-flight request"
            );
            return (id, rx, false);
        }

        registry.in_flight.insert(
            key.to_string(),
            InFlight {
                subscribers: vec![(id, tx)],
                created_at: Instant::now(),
                closed: false,
            },
        );
        (id, rx, true)
    }

    fn enqueue(
        &self,
        registry: &mut Registry<R, T>,
        group: &str,
        key: &str,
        request: R,
        executor: Arc<dyn BatchExecutor<R, T>>,
    ) {
        let max = self.config.max_batch_size.max(1);

        if let Some(batch) = registry.open.get_mut(group) {
            batch.requests.push((key.to_string(), request));
            self.stats.merged.fetch_add(1, Ordering::Relaxed);
            debug!(group = %group, key = %key, size = batch.requests.len(), "Merged into open batch");
            if batch.requests.len() >= max {
                if let Some(batch) = registry.open.remove(group) {
                    batch.full.notify_one();
                    registry.sealed.insert(batch.id, batch);
                }
            }
            return;
        }

        let id = Uuid::new_v4();
        let full = Arc::new(Notify::new());
        let batch = OpenBatch {
            id,
            requests: vec![(key.to_string(), request)],
            executor,
            full: Arc::clone(&full),
        };
        if max == 1 {
            full.notify_one();
            registry.sealed.insert(id, batch);
        } else {
            registry.open.insert(group.to_string(), batch);
        }
        debug!(group = %group, batch_id = %id, "Opened batch");

        let registry = Arc::clone(&self.registry);
        let stats = Arc::clone(&self.stats);
        let window = self.config.window;
        let group = group.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(window) => {}
                _ = full.notified() => {}
            }

            let batch = {
                let mut registry = registry.lock();
                let batch = registry.take_batch(&group, id);
                if let Some(batch) = &batch {
                    let keys: Vec<String> = batch.requests.iter().map(|(k, _)| k.clone()).collect();
                    registry.close(&keys);
                }
                batch
            };
            let Some(batch) = batch else {
                warn!(group = %group, batch_id = %id, "Batch vanished before closing");
                return;
            };

            let keys: Vec<String> = batch.requests.iter().map(|(k, _)| k.clone()).collect();
            let mut guard = SettleGuard::new(Arc::clone(&registry), keys.clone());
            debug!(group = %group, batch_id = %id, size = keys.len(), "Closing batch");

            stats.executions.fetch_add(1, Ordering::Relaxed);
            let outcome = batch.executor.execute_batch(batch.requests).await;
            guard.disarm();

            match outcome {
                Ok(mut results) => {
                    for key in &keys {
                        let result = results.remove(key).unwrap_or_else(|| {
                            Err(AppError::InternalError(format!(
                                "batch returned no result for '{}'",
                                key
                            )))
                        });
                        settle(&registry, key, result);
                    }
                }
                Err(e) => {
                    for key in &keys {
                        settle(&registry, key, Err(e.clone()));
                    }
                }
            }
        });
    }

    fn subscription(&self, key: &str, id: Uuid) -> Subscription<R, T> {
        Subscription {
            registry: Arc::clone(&self.registry),
            key: key.to_string(),
            id,
            settled: false,
        }
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.registry.lock().in_flight.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.registry.lock().in_flight.len()
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.registry
            .lock()
            .in_flight
            .get(key)
            .map_or(0, |f| f.subscribers.len())
    }

    pub fn stats(&self) -> CoordinatorStatsSnapshot {
        CoordinatorStatsSnapshot {
            executions: self.stats.executions.load(Ordering::Relaxed),
            deduplicated: self.stats.deduplicated.load(Ordering::Relaxed),
            merged: self.stats.merged.load(Ordering::Relaxed),
            in_flight: self.in_flight_count(),
        }
    }
}

/// Remove the in-flight record for `key` and deliver `result` to its subscribers.
fn settle<R, T: Clone>(registry: &Mutex<Registry<R, T>>, key: &str, result: Result<T>) {
    let in_flight = registry.lock().in_flight.remove(key);
    let Some(in_flight) = in_flight else {
        return;
    };
    for (_, reply) in in_flight.subscribers {
        let _ = reply.send(result.clone());
    }
}

/// A caller's place in an in-flight request. Dropping it before settlement
/// removes the caller from the subscriber list.
struct Subscription<R, T> {
    registry: Arc<Mutex<Registry<R, T>>>,
    key: String,
    id: Uuid,
    settled: bool,
}

impl<R, T> Subscription<R, T> {
    async fn wait(mut self, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        let result = rx.await.unwrap_or_else(|_| {
            Err(AppError::InternalError(
                "in-flight request dropped without a result".into(),
            ))
        });
        self.settled = true;
        result
    }
}

impl<R, T> Drop for Subscription<R, T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut registry = self.registry.lock();
        if let Some(in_flight) = registry.in_flight.get_mut(&self.key) {
            in_flight.subscribers.retain(|(id, _)| *id != self.id);
            debug!(
                key = %self.key,
                remaining = in_flight.subscribers.len(),
                closed = in_flight.closed,
                "Subscriber cancelled"
            );
        }
    }
}

/// Fails the batch's subscribers if its task dies before settling them.
struct SettleGuard<R, T: Clone> {
    registry: Arc<Mutex<Registry<R, T>>>,
    keys: Vec<String>,
    armed: bool,
}

impl<R, T: Clone> SettleGuard<R, T> {
    fn new(registry: Arc<Mutex<Registry<R, T>>>, keys: Vec<String>) -> Self {
        Self {
            registry,
            keys,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<R, T: Clone> Drop for SettleGuard<R, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for key in &self.keys {
            settle(
                &self.registry,
                key,
                Err(AppError::InternalError("batch execution aborted".into())),
            );
        }
    }
}
