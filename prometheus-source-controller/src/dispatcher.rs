use crate::{errors::ControllerError, key::ObjectKey, utils::metric_name, workqueue::WorkQueue};

use futures::{
    FutureExt,
    future::{BoxFuture, join_all},
};
use log::{debug, error, info, trace, warn};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::time::Instant;

const DISPATCHER: &'static str = "dispatcher";

/// Result of a successful reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile the object again after `duration`, even if nothing changed.
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Do nothing until the object (or one of its owned objects) changes.
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

struct DispatcherMetrics {
    reconcile_count: Counter<u64>,
    reconcile_duration: Histogram<u64>,
}

impl DispatcherMetrics {
    fn new() -> Self {
        let meter: Meter = global::meter(DISPATCHER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of reconcile invocations by outcome")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration in milliseconds")
            .with_unit("ms")
            .build();
        Self {
            reconcile_count,
            reconcile_duration,
        }
    }
}

/// Drains a [`WorkQueue`] with a fixed number of concurrent workers, invoking
/// the reconcile function for every key and feeding its outcome back into the
/// queue.
pub struct Dispatcher {
    queue: Arc<WorkQueue>,
    workers: usize,
    shutdown: Option<BoxFuture<'static, ()>>,
}

impl Dispatcher {
    pub fn new(queue: Arc<WorkQueue>, workers: usize) -> Self {
        Self {
            queue,
            workers: workers.max(1),
            shutdown: None,
        }
    }

    /// Shut the queue down once `trigger` completes. Workers finish the key
    /// they are processing and then stop.
    pub fn graceful_shutdown_on(mut self, trigger: impl Future<Output = ()> + Send + 'static) -> Self {
        self.shutdown = Some(trigger.boxed());
        self
    }

    /// Run all workers until the queue is shut down.
    pub async fn run<F, Fut, C>(self, reconcile: F, ctx: Arc<C>)
    where
        F: Fn(ObjectKey, Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Action, ControllerError>> + Send + 'static,
        C: Send + Sync + 'static,
    {
        let queue = self.queue;
        let shutdown = self.shutdown.map(|trigger| {
            let queue = queue.clone();
            tokio::spawn(async move {
                trigger.await;
                info!("{}: shutdown requested", queue.name());
                queue.shut_down();
            })
        });
        let reconcile = Arc::new(reconcile);
        let metrics = Arc::new(DispatcherMetrics::new());
        info!("{}: starting {} worker(s)", queue.name(), self.workers);
        let workers = (0..self.workers).map(|id| {
            tokio::spawn(worker(
                id,
                queue.clone(),
                reconcile.clone(),
                ctx.clone(),
                metrics.clone(),
            ))
        });
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!("{}: worker terminated abnormally: {}", queue.name(), e);
            }
        }
        if let Some(shutdown) = shutdown {
            shutdown.abort();
        }
        queue.drain().await;
        info!("{}: all workers stopped", queue.name());
    }
}

async fn worker<F, Fut, C>(
    id: usize,
    queue: Arc<WorkQueue>,
    reconcile: Arc<F>,
    ctx: Arc<C>,
    metrics: Arc<DispatcherMetrics>,
) where
    F: Fn(ObjectKey, Arc<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Action, ControllerError>> + Send + 'static,
    C: Send + Sync + 'static,
{
    while let Some(key) = queue.get().await {
        trace!("{}: worker {} processing {}", queue.name(), id, key);
        process(&queue, &key, reconcile.as_ref(), ctx.clone(), &metrics).await;
        queue.done(&key);
    }
    debug!("{}: worker {} stopped", queue.name(), id);
}

/// Reconcile one key and translate the outcome into queue operations. Errors
/// never escape: temporary ones are retried with backoff, all others are
/// logged and the key is forgotten until it is added again.
async fn process<F, Fut, C>(
    queue: &Arc<WorkQueue>,
    key: &ObjectKey,
    reconcile: &F,
    ctx: Arc<C>,
    metrics: &DispatcherMetrics,
) where
    F: Fn(ObjectKey, Arc<C>) -> Fut,
    Fut: Future<Output = Result<Action, ControllerError>>,
{
    let start = Instant::now();
    let result = AssertUnwindSafe(async { reconcile(key.clone(), ctx).await })
        .catch_unwind()
        .await;
    let outcome = match result {
        Ok(Ok(action)) => {
            queue.forget(key);
            if let Some(delay) = action.requeue_after() {
                queue.add_after(key.clone(), delay);
            }
            debug!("reconciled {}", key);
            "success"
        }
        Ok(Err(e)) if e.is_temporary() => {
            warn!(
                "reconcile of {} failed (attempt {}), will retry: {}",
                key,
                queue.num_requeues(key) + 1,
                e
            );
            queue.add_rate_limited(key.clone());
            "retry"
        }
        Ok(Err(e)) => {
            error!("reconcile of {} failed permanently: {}", key, e);
            queue.forget(key);
            "failure"
        }
        Err(_) => {
            error!("reconcile of {} panicked, will retry", key);
            queue.add_rate_limited(key.clone());
            "panic"
        }
    };
    let labels = &[
        KeyValue::new("queue", queue.name().to_string()),
        KeyValue::new("outcome", outcome),
    ];
    metrics.reconcile_count.add(1, labels);
    metrics
        .reconcile_duration
        .record(start.elapsed().as_millis() as u64, labels);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{enqueuer::Enqueuer, workqueue::ItemExponentialRateLimiter};
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use tokio::{
        sync::{Barrier, mpsc, oneshot},
        time::{sleep, timeout},
    };

    struct Ctx {
        calls: AtomicUsize,
        seen: mpsc::UnboundedSender<(ObjectKey, Instant)>,
    }

    fn setup() -> (
        Arc<WorkQueue>,
        Arc<Ctx>,
        mpsc::UnboundedReceiver<(ObjectKey, Instant)>,
    ) {
        let queue = WorkQueue::new(
            "test",
            ItemExponentialRateLimiter::new(Duration::from_millis(10), Duration::from_secs(10)),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(Ctx {
            calls: AtomicUsize::new(0),
            seen: tx,
        });
        (queue, ctx, rx)
    }

    fn dispatcher(queue: &Arc<WorkQueue>, workers: usize) -> (Dispatcher, oneshot::Sender<()>) {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let dispatcher = Dispatcher::new(queue.clone(), workers).graceful_shutdown_on(async move {
            let _ = stop_rx.await;
        });
        (dispatcher, stop_tx)
    }

    fn key() -> ObjectKey {
        ObjectKey::new("ns", "a")
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_back_off_until_success() {
        let (queue, ctx, mut seen) = setup();
        let (dispatcher, stop) = dispatcher(&queue, 1);
        queue.add(key());
        let handle = tokio::spawn(dispatcher.run(
            |key, ctx: Arc<Ctx>| async move {
                let n = ctx.calls.fetch_add(1, Ordering::SeqCst);
                ctx.seen.send((key, Instant::now())).unwrap();
                if n < 3 {
                    Err(ControllerError::SinkNotResolved("not yet".to_string()))
                } else {
                    Ok(Action::await_change())
                }
            },
            ctx.clone(),
        ));
        let mut times = vec![];
        for _ in 0..4 {
            let (k, t) = seen.recv().await.unwrap();
            assert_eq!(key(), k);
            times.push(t);
        }
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_millis(10));
        assert!(gaps[0] < gaps[1] && gaps[1] < gaps[2], "{:?}", gaps);

        stop.send(()).unwrap();
        handle.await.unwrap();
        // A success resets the backoff.
        assert_eq!(0, queue.num_requeues(&key()));
        assert_eq!(4, ctx.calls.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_are_not_retried() {
        let (queue, ctx, mut seen) = setup();
        let (dispatcher, stop) = dispatcher(&queue, 1);
        queue.add(key());
        let handle = tokio::spawn(dispatcher.run(
            |key, ctx: Arc<Ctx>| async move {
                ctx.calls.fetch_add(1, Ordering::SeqCst);
                ctx.seen.send((key, Instant::now())).unwrap();
                Err(ControllerError::InvalidSpec("missing sink".to_string()))
            },
            ctx.clone(),
        ));
        seen.recv().await.unwrap();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(1, ctx.calls.load(Ordering::SeqCst));
        assert_eq!(0, queue.num_requeues(&key()));

        // The next change re-adds the key.
        queue.add(key());
        seen.recv().await.unwrap();
        assert_eq!(2, ctx.calls.load(Ordering::SeqCst));
        stop.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn panics_are_retried() {
        let (queue, ctx, mut seen) = setup();
        let (dispatcher, stop) = dispatcher(&queue, 1);
        queue.add(key());
        let handle = tokio::spawn(dispatcher.run(
            |key, ctx: Arc<Ctx>| async move {
                let n = ctx.calls.fetch_add(1, Ordering::SeqCst);
                ctx.seen.send((key, Instant::now())).unwrap();
                if n == 0 {
                    panic!("boom");
                }
                Ok(Action::await_change())
            },
            ctx.clone(),
        ));
        seen.recv().await.unwrap();
        seen.recv().await.unwrap();
        stop.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(2, ctx.calls.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn success_may_request_a_resync() {
        let (queue, ctx, mut seen) = setup();
        let (dispatcher, stop) = dispatcher(&queue, 1);
        queue.add(key());
        let handle = tokio::spawn(dispatcher.run(
            |key, ctx: Arc<Ctx>| async move {
                let n = ctx.calls.fetch_add(1, Ordering::SeqCst);
                ctx.seen.send((key, Instant::now())).unwrap();
                if n == 0 {
                    Ok(Action::requeue(Duration::from_secs(60)))
                } else {
                    Ok(Action::await_change())
                }
            },
            ctx.clone(),
        ));
        let (_, first) = seen.recv().await.unwrap();
        let (_, second) = seen.recv().await.unwrap();
        assert!(second - first >= Duration::from_secs(60));
        stop.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn change_during_reconcile_is_processed_afterwards() {
        let (queue, ctx, mut seen) = setup();
        let (dispatcher, stop) = dispatcher(&queue, 2);
        let enqueuer = Enqueuer::new(&queue);
        let in_flight = Arc::new(Mutex::new(0usize));
        queue.add(key());
        let handle = tokio::spawn(dispatcher.run(
            move |key, ctx: Arc<Ctx>| {
                let enqueuer = enqueuer.clone();
                let in_flight = in_flight.clone();
                async move {
                    {
                        let mut n = in_flight.lock().unwrap();
                        *n += 1;
                        assert_eq!(1, *n);
                    }
                    let call = ctx.calls.fetch_add(1, Ordering::SeqCst);
                    if call == 0 {
                        // Another change arrives while we are still busy.
                        enqueuer.enqueue_key(key.clone());
                        sleep(Duration::from_millis(20)).await;
                    }
                    *in_flight.lock().unwrap() -= 1;
                    ctx.seen.send((key, Instant::now())).unwrap();
                    Ok(Action::await_change())
                }
            },
            ctx.clone(),
        ));
        seen.recv().await.unwrap();
        timeout(Duration::from_secs(1), seen.recv())
            .await
            .unwrap()
            .unwrap();
        stop.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(2, ctx.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn workers_run_concurrently_and_stop_on_shutdown() {
        let (queue, ctx, mut seen) = setup();
        let (dispatcher, stop) = dispatcher(&queue, 2);
        let barrier = Arc::new(Barrier::new(2));
        queue.add(ObjectKey::new("ns", "a"));
        queue.add(ObjectKey::new("ns", "b"));
        let handle = tokio::spawn(dispatcher.run(
            move |key, ctx: Arc<Ctx>| {
                let barrier = barrier.clone();
                async move {
                    // Only passes if both keys are processed at the same time.
                    barrier.wait().await;
                    ctx.seen.send((key, Instant::now())).unwrap();
                    Ok(Action::await_change())
                }
            },
            ctx.clone(),
        ));
        let mut keys = vec![];
        for _ in 0..2 {
            let (k, _) = timeout(Duration::from_secs(1), seen.recv())
                .await
                .unwrap()
                .unwrap();
            keys.push(k.name);
        }
        keys.sort();
        assert_eq!(vec!["a".to_string(), "b".to_string()], keys);
        stop.send(()).unwrap();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(queue.is_shutting_down());
    }
}
