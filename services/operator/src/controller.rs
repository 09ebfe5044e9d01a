//! Controller runtime: a keyed work queue drained by a bounded worker pool.
//!
//! - The same key is never reconciled by two workers at once
//! - A key added while it is being reconciled runs again afterwards
//! - Duplicate adds of a queued key collapse into one
//! - Failed reconciles are retried with exponential backoff per key

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use gamefleet_api::ObjectKey;
use gamefleet_reconcile::{Action, BackoffPolicy, RetryTracker, DEFAULT_RETRY_WINDOW};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::ReconcileError;

/// Reconciles one object per call.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Name for logging.
    fn name(&self) -> &str;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,

    /// Keys in `queue`.
    queued: HashSet<ObjectKey>,

    /// Keys handed to a worker and not yet done.
    processing: HashSet<ObjectKey>,

    /// Keys added while processing.
    dirty: HashSet<ObjectKey>,

    shutting_down: bool,
}

/// De-duplicating queue of object keys with single-flight per key.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: ObjectKey) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }

        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }

        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The caller must call [`WorkQueue::done`] with the key when finished.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` finished; requeue it if it was added meanwhile.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.processing.remove(key);

        if state.dirty.remove(key) && !state.shutting_down && state.queued.insert(key.clone()) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self, key: &ObjectKey) -> bool {
        self.lock().processing.contains(key)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves once shutdown is signalled or the sender is gone.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Runs a reconciler over a work queue.
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    backoff: BackoffPolicy,
    retries: Mutex<RetryTracker>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>) -> Self {
        Self {
            reconciler,
            queue: Arc::new(WorkQueue::new()),
            backoff: BackoffPolicy::default(),
            retries: Mutex::new(RetryTracker::new(DEFAULT_RETRY_WINDOW)),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    pub fn reconciler(&self) -> &Arc<R> {
        &self.reconciler
    }

    /// Run `concurrency` workers until shutdown. An in-flight reconcile is
    /// abandoned when shutdown fires.
    pub async fn run(self: Arc<Self>, concurrency: usize, shutdown: watch::Receiver<bool>) {
        let concurrency = concurrency.max(1);
        info!(
            controller = self.reconciler.name(),
            concurrency, "Starting controller"
        );

        let mut workers = JoinSet::new();
        for worker in 0..concurrency {
            let controller = Arc::clone(&self);
            let shutdown = shutdown.clone();
            workers.spawn(async move { controller.work(worker, shutdown).await });
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(controller = self.reconciler.name(), error = %e, "Worker panicked");
            }
        }

        self.queue.shutdown();
        info!(controller = self.reconciler.name(), "Controller stopped");
    }

    async fn work(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            let key = tokio::select! {
                key = self.queue.get() => match key {
                    Some(key) => key,
                    None => break,
                },
                _ = shutdown_signalled(&mut shutdown) => break,
            };

            let outcome = tokio::select! {
                result = self.reconciler.reconcile(&key) => Some(result),
                _ = shutdown_signalled(&mut shutdown) => None,
            };
            self.queue.done(&key);

            match outcome {
                Some(result) => self.handle(key, result),
                None => {
                    debug!(worker, key = %key, "Reconcile abandoned on shutdown");
                    break;
                }
            }
        }
    }

    fn handle(&self, key: ObjectKey, result: Result<Action, ReconcileError>) {
        let name = key.to_string();
        match result {
            Ok(action) => {
                self.retries().clear(&name);
                match action {
                    Action::Done => {}
                    Action::Requeue => self.queue.add(key),
                    Action::RequeueAfter(delay) => self.queue.add_after(key, delay),
                }
            }
            Err(e) => {
                let attempt = self.retries().record_failure(&name);
                let delay = self.backoff.delay(attempt);
                if e.is_retryable() {
                    warn!(
                        controller = self.reconciler.name(),
                        key = %name,
                        error = %e,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Reconcile failed, will retry"
                    );
                } else {
                    error!(
                        controller = self.reconciler.name(),
                        key = %name,
                        error = %e,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Reconcile failed"
                    );
                }
                self.queue.add_after(key, delay);
            }
        }
    }

    fn retries(&self) -> MutexGuard<'_, RetryTracker> {
        self.retries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("games", name)
    }

    #[tokio::test]
    async fn test_queue_dedups_queued_keys() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("b"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("b")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_key_added_while_processing_is_deferred() {
        let queue = WorkQueue::new();
        queue.add(key("a"));

        let first = queue.get().await.unwrap();
        assert!(queue.is_processing(&first));

        queue.add(key("a"));
        queue.add(key("a"));
        assert!(queue.is_empty());

        queue.done(&first);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key("a")));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.get().await }
        });

        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add(key("a"));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_after(key("a"), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);
    }

    struct Counting {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl Reconciler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn reconcile(&self, _key: &ObjectKey) -> Result<Action, ReconcileError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(crate::store::StoreError::Internal("boom".to_string()).into());
            }
            Ok(Action::Done)
        }
    }

    #[tokio::test]
    async fn test_failed_reconcile_is_retried() {
        let reconciler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        });
        let controller = Arc::new(Controller::new(Arc::clone(&reconciler)).with_backoff(
            BackoffPolicy {
                base: Duration::from_millis(1),
                max: Duration::from_millis(5),
                jitter: 0.0,
            },
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(Arc::clone(&controller).run(2, shutdown_rx));

        controller.queue().add(key("a"));
        for _ in 0..200 {
            if reconciler.calls.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 3);

        shutdown_tx.send(true).unwrap();
        run.await.unwrap();
    }
}
