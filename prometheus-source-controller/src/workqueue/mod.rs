//! Deduplicating, rate limited work queue of [`ObjectKey`]s.
//!
//! A key is in at most one of two places at any time: pending (waiting in the
//! queue) or processing (handed out by [`WorkQueue::get`] and not yet marked
//! [`WorkQueue::done`]). A key added while it is processing is remembered as
//! dirty and queued again once the current attempt is done, so no update is
//! lost and no key is ever processed by two workers at the same time.
//!
//! Delayed adds keep at most one timer per key, armed for the earliest
//! requested deadline.

mod rate_limiter;

pub use rate_limiter::{
    BucketRateLimiter, DefaultRateLimiter, ItemExponentialRateLimiter, RateLimiter,
};

use crate::{key::ObjectKey, utils::metric_name};

use log::{debug, trace};
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{Instant, sleep_until},
};

const WORKQUEUE: &'static str = "workqueue";

struct QueueState {
    /// Keys ready to be processed, in insertion order.
    queue: VecDeque<ObjectKey>,
    /// Keys which need processing, that is every key in `queue` plus the keys
    /// re-added while they were processing.
    dirty: HashSet<ObjectKey>,
    /// Keys currently handed out to a worker.
    processing: HashSet<ObjectKey>,
    /// Pending delayed adds: deadline and the timer which fires it.
    waiting: HashMap<ObjectKey, (Instant, JoinHandle<()>)>,
    shutting_down: bool,
    rate_limiter: Box<dyn RateLimiter>,
}

pub struct WorkQueue {
    name: String,
    state: Mutex<QueueState>,
    /// Signalled whenever a key becomes pending or the queue shuts down.
    ready: Notify,
    /// Signalled whenever the last processing key is done.
    idle: Notify,
    adds: Counter<u64>,
    retries: Counter<u64>,
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, (_, timer)) in state.waiting.drain() {
            timer.abort();
        }
    }
}

impl WorkQueue {
    pub fn new(name: &str, rate_limiter: impl RateLimiter + 'static) -> Arc<Self> {
        let meter = global::meter(WORKQUEUE);
        let adds = meter
            .u64_counter(metric_name("workqueue_adds"))
            .with_description("Count of keys added to the work queue")
            .build();
        let retries = meter
            .u64_counter(metric_name("workqueue_retries"))
            .with_description("Count of rate limited retries")
            .build();
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(QueueState {
                queue: Default::default(),
                dirty: Default::default(),
                processing: Default::default(),
                waiting: Default::default(),
                shutting_down: false,
                rate_limiter: Box::new(rate_limiter),
            }),
            ready: Notify::new(),
            idle: Notify::new(),
            adds,
            retries,
        })
    }

    /// A panic while holding the lock cannot leave the sets half updated, as
    /// every operation completes its mutation before it can panic.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark `key` as needing processing.
    ///
    /// Adding a key which is already pending is a no-op. Adding a key which
    /// is processing defers it until [`WorkQueue::done`] is called for it.
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.lock();
        if state.shutting_down {
            trace!("{}: ignoring {} as the queue is shutting down", self.name, key);
            return;
        }
        if !state.dirty.insert(key.clone()) {
            return;
        }
        self.adds.add(1, &[KeyValue::new("name", self.name.clone())]);
        if state.processing.contains(&key) {
            debug!("{}: {} changed while processing, requeue when done", self.name, key);
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.ready.notify_one();
    }

    /// Add `key` once `delay` has elapsed, without blocking the caller.
    ///
    /// If a delayed add for `key` is already pending, the earlier of both
    /// deadlines is kept.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay;
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if let Some((pending, timer)) = state.waiting.get(&key) {
            if *pending <= deadline {
                trace!("{}: {} already scheduled earlier", self.name, key);
                return;
            }
            timer.abort();
        }
        let queue: Weak<Self> = Arc::downgrade(self);
        let timer = {
            let key = key.clone();
            tokio::spawn(async move {
                sleep_until(deadline).await;
                if let Some(queue) = queue.upgrade() {
                    queue.fire(key, deadline);
                }
            })
        };
        state.waiting.insert(key, (deadline, timer));
    }

    fn fire(&self, key: ObjectKey, deadline: Instant) {
        {
            let mut state = self.lock();
            // Superseded by an earlier deadline.
            if state.waiting.get(&key).map(|(pending, _)| *pending) != Some(deadline) {
                return;
            }
            state.waiting.remove(&key);
        }
        self.add(key);
    }

    /// Add `key` after the backoff delay computed by the rate limiter.
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) {
        let delay = self.lock().rate_limiter.when(&key);
        self.retries
            .add(1, &[KeyValue::new("name", self.name.clone())]);
        debug!("{}: retry {} in {:?}", self.name, key, delay);
        self.add_after(key, delay);
    }

    /// Reset the backoff state of `key`.
    pub fn forget(&self, key: &ObjectKey) {
        self.lock().rate_limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.lock().rate_limiter.num_requeues(key)
    }

    /// Wait for the next pending key and mark it as processing.
    ///
    /// Returns `None` once the queue is shutting down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as no longer processing, queueing it again if it was added
    /// in the meantime.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        let requeue = state.dirty.contains(key) && !state.shutting_down;
        if requeue {
            state.queue.push_back(key.clone());
        }
        let idle = state.processing.is_empty();
        drop(state);
        if requeue {
            self.ready.notify_one();
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Number of pending keys.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Stop handing out keys: all current and future [`WorkQueue::get`] calls
    /// return `None` and further adds are ignored.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            for (_, (_, timer)) in state.waiting.drain() {
                timer.abort();
            }
        }
        debug!("{}: shutting down", self.name);
        self.ready.notify_waiters();
    }

    /// Wait until no key is processing anymore.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn key(s: &str) -> ObjectKey {
        s.parse().unwrap()
    }

    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new(
            "test",
            ItemExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn adds_before_get_collapse() {
        let q = queue();
        q.add(key("ns/a"));
        q.add(key("ns/a"));
        q.add(key("ns/a"));
        assert_eq!(1, q.len());
        let k = q.get().await.unwrap();
        assert_eq!(key("ns/a"), k);
        q.done(&k);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_while_processing_requeues_once_on_done() {
        let q = queue();
        q.add(key("ns/a"));
        let k = q.get().await.unwrap();
        q.add(key("ns/a"));
        q.add(key("ns/a"));
        // Not pending while processing.
        assert!(q.is_empty());
        q.done(&k);
        assert_eq!(1, q.len());
        assert_eq!(Some(key("ns/a")), q.get().await);
        q.done(&k);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn keys_are_delivered_in_order() {
        let q = queue();
        q.add(key("ns/a"));
        q.add(key("ns/b"));
        q.add(key("ns/a"));
        q.add(key("ns/c"));
        assert_eq!(Some(key("ns/a")), q.get().await);
        assert_eq!(Some(key("ns/b")), q.get().await);
        assert_eq!(Some(key("ns/c")), q.get().await);
    }

    #[tokio::test]
    async fn get_waits_for_add() {
        let q = queue();
        let getter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add(key("ns/a"));
        assert_eq!(Some(key("ns/a")), getter.await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_getters_never_share_a_key() {
        let q = queue();
        q.add(key("ns/a"));
        let first = q.get().await.unwrap();
        q.add(key("ns/a"));
        // The re-added key must not be handed out while it is processing.
        assert!(timeout(Duration::from_millis(50), q.get()).await.is_err());
        q.done(&first);
        let second = timeout(Duration::from_secs(1), q.get()).await.unwrap();
        assert_eq!(Some(key("ns/a")), second);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_one_holder_per_key_under_contention() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let q = queue();
        let active = Arc::new(Mutex::new(HashSet::<ObjectKey>::new()));
        let deliveries = Arc::new(AtomicUsize::new(0));
        let mut workers = vec![];
        for _ in 0..4 {
            let q = q.clone();
            let active = active.clone();
            let deliveries = deliveries.clone();
            workers.push(tokio::spawn(async move {
                while let Some(k) = q.get().await {
                    assert!(active.lock().unwrap().insert(k.clone()), "{} processed twice", k);
                    deliveries.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    active.lock().unwrap().remove(&k);
                    q.done(&k);
                }
            }));
        }
        let mut adds = 0;
        for i in 0..200 {
            q.add(key(&format!("ns/k{}", i % 5)));
            adds += 1;
            if i % 10 == 0 {
                tokio::task::yield_now().await;
            }
        }
        // Wait until everything added was processed.
        timeout(Duration::from_secs(5), async {
            loop {
                if q.is_empty() {
                    q.drain().await;
                    if q.is_empty() {
                        break;
                    }
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        q.shut_down();
        for w in workers {
            w.await.unwrap();
        }
        let deliveries = deliveries.load(Ordering::SeqCst);
        assert!(deliveries >= 5);
        assert!(deliveries <= adds);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_waits_for_backoff() {
        let q = queue();
        let k = key("ns/a");
        let mut previous = Duration::ZERO;
        for _ in 0..4 {
            let start = Instant::now();
            q.add_rate_limited(k.clone());
            assert!(q.is_empty());
            let got = q.get().await.unwrap();
            let waited = start.elapsed();
            assert!(waited > previous, "{:?} <= {:?}", waited, previous);
            previous = waited;
            q.done(&got);
        }
        assert!(previous >= Duration::from_millis(40));
        assert!(previous < Duration::from_millis(80));
        assert_eq!(4, q.num_requeues(&k));

        q.forget(&k);
        assert_eq!(0, q.num_requeues(&k));
        let start = Instant::now();
        q.add_rate_limited(k.clone());
        q.get().await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(5) && waited < Duration::from_millis(10));
    }

    async fn count_deliveries(q: &Arc<WorkQueue>, k: &ObjectKey, first: Duration) -> usize {
        let start = Instant::now();
        let mut deliveries = 0;
        while let Ok(Some(got)) = timeout(Duration::from_secs(600), q.get()).await {
            assert_eq!(k, &got);
            if deliveries == 0 {
                let waited = start.elapsed();
                assert!(waited >= first && waited < first + Duration::from_secs(1), "{:?}", waited);
            }
            deliveries += 1;
            q.done(&got);
        }
        deliveries
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_adds_of_a_key_collapse() {
        let q = queue();
        let k = key("ns/a");
        for minutes in 1..=5 {
            q.add_after(k.clone(), Duration::from_secs(60 * minutes));
        }
        assert_eq!(1, q.lock().waiting.len());
        assert_eq!(1, count_deliveries(&q, &k, Duration::from_secs(60)).await);
        assert!(q.lock().waiting.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_delay_pulls_deadline_forward() {
        let q = queue();
        let k = key("ns/a");
        for minutes in (1..=5).rev() {
            q.add_after(k.clone(), Duration::from_secs(60 * minutes));
        }
        assert_eq!(1, count_deliveries(&q, &k, Duration::from_secs(60)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_add_after_firing_is_scheduled_again() {
        let q = queue();
        let k = key("ns/a");
        q.add_after(k.clone(), Duration::from_secs(10));
        assert_eq!(1, count_deliveries(&q, &k, Duration::from_secs(10)).await);
        q.add_after(k.clone(), Duration::from_secs(20));
        assert_eq!(1, count_deliveries(&q, &k, Duration::from_secs(20)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn shut_down_cancels_delayed_adds() {
        let q = queue();
        q.add_after(key("ns/a"), Duration::from_secs(10));
        q.shut_down();
        assert!(q.lock().waiting.is_empty());
        q.add_after(key("ns/b"), Duration::from_secs(10));
        assert!(q.lock().waiting.is_empty());
    }

    #[tokio::test]
    async fn shut_down_releases_getters_and_ignores_adds() {
        let q = queue();
        let getter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(None, getter.await.unwrap());
        q.add(key("ns/a"));
        assert!(q.is_empty());
        assert_eq!(None, q.get().await);
    }

    #[tokio::test]
    async fn drain_waits_for_processing_keys() {
        let q = queue();
        q.add(key("ns/a"));
        let k = q.get().await.unwrap();
        q.shut_down();
        assert!(timeout(Duration::from_millis(20), q.drain()).await.is_err());
        q.done(&k);
        timeout(Duration::from_secs(1), q.drain()).await.unwrap();
    }
}
