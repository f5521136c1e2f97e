//! Size- and time-triggered batching with whole-batch retry.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::lock::mutex_lock;
use crate::sink::{
    Category, METRIC_BATCH_FAILURE, METRIC_BATCH_FLUSH_SIZE, METRIC_BATCH_PROCESS_MS,
    METRIC_BATCH_RETRY, MetricEvent, MetricsSink,
};

use super::options::BatchOptions;

const SOURCE: &str = "batch";

/// Why an item added to a [`BatchProcessor`] did not get a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError<E> {
    /// Every attempt failed; carries the last error.
    #[error("batch processing failed: {0}")]
    Failed(E),
    #[error("batch function returned {actual} results for {expected} inputs")]
    ResultCount { expected: usize, actual: usize },
    #[error("batch processor shut down before the item was processed")]
    Shutdown,
    /// The flush carrying the item was cancelled before settling it.
    #[error("batch item dropped before it was settled")]
    Dropped,
}

type ProcessBatch<T, R, E> =
    Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<Vec<R>, E>> + Send + Sync>;
type Receipt<R, E> = oneshot::Receiver<Result<R, BatchError<E>>>;
type Reply<R, E> = oneshot::Sender<Result<R, BatchError<E>>>;

struct BatchItem<T, R, E> {
    input: T,
    reply: Reply<R, E>,
}

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Inner<T, R, E> {
    queue: Mutex<VecDeque<BatchItem<T, R, E>>>,
    processing: AtomicBool,
    closed: AtomicBool,
    timer: Mutex<Option<ArmedTimer>>,
    next_timer: AtomicU64,
    process_batch: ProcessBatch<T, R, E>,
    options: BatchOptions,
    sink: Arc<dyn MetricsSink>,
}

/// Clears the processing flag when a flush ends, cancelled or not.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Merges individual inputs into calls of a batch function.
///
/// A flush happens as soon as `max_batch_size` items are queued, or
/// `max_wait` after the first item of a quiet period. At most one flush runs
/// at a time and it keeps draining until the queue is empty. The batch
/// function must return one result per input, in input order; any failure
/// applies to the whole batch.
///
/// `add`, `flush` and the timers spawn onto the ambient Tokio runtime.
pub struct BatchProcessor<T, R, E> {
    inner: Arc<Inner<T, R, E>>,
}

impl<T, R, E> Clone for BatchProcessor<T, R, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, R, E> BatchProcessor<T, R, E>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Clone + fmt::Debug + Send + 'static,
{
    pub fn new<F, Fut>(process_batch: F, options: BatchOptions, sink: Arc<dyn MetricsSink>) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<R>, E>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                processing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                timer: Mutex::new(None),
                next_timer: AtomicU64::new(0),
                process_batch: Arc::new(move |items| process_batch(items).boxed()),
                options,
                sink,
            }),
        }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.inner.options
    }

    /// Items waiting for a flush.
    pub fn queued(&self) -> usize {
        mutex_lock(&self.inner.queue, SOURCE, "queued").len()
    }

    /// Queues `input` and returns a future for its result.
    ///
    /// The item is queued when `add` is called, not when the returned future
    /// is first polled.
    pub fn add(
        &self,
        input: T,
    ) -> impl Future<Output = Result<R, BatchError<E>>> + Send + use<T, R, E> {
        let queued = self.enqueue(input);
        async move {
            match queued {
                Ok(reply) => reply.await.unwrap_or(Err(BatchError::Dropped)),
                Err(err) => Err(err),
            }
        }
    }

    /// Processes queued items until the queue is empty. A no-op while
    /// another flush is running; that flush picks the items up.
    #[instrument(skip(self), fields(queued = self.queued()))]
    pub async fn flush(&self) {
        loop {
            let Some(guard) = ProcessingGuard::acquire(&self.inner.processing) else {
                debug!("Batch flush already in progress");
                return;
            };
            self.disarm_timer();

            let batch = {
                let mut queue = mutex_lock(&self.inner.queue, SOURCE, "drain");
                let take = queue.len().min(self.inner.options.batch_size());
                queue.drain(..take).collect::<Vec<_>>()
            };
            if batch.is_empty() {
                return;
            }

            self.process(batch).await;
            drop(guard);

            if self.queued() == 0 {
                return;
            }
        }
    }

    /// Stops timers and rejects every queued item with
    /// [`BatchError::Shutdown`]. A batch already being processed still
    /// settles normally; later `add` calls are rejected immediately.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.disarm_timer();

        let rejected: Vec<_> = mutex_lock(&self.inner.queue, SOURCE, "shutdown")
            .drain(..)
            .collect();
        if !rejected.is_empty() {
            warn!(rejected = rejected.len(), "Batch processor shut down with queued items");
        }
        for item in rejected {
            let _ = item.reply.send(Err(BatchError::Shutdown));
        }
    }

    fn enqueue(&self, input: T) -> Result<Receipt<R, E>, BatchError<E>> {
        let (reply, receiver) = oneshot::channel();
        let queued = {
            let mut queue = mutex_lock(&self.inner.queue, SOURCE, "enqueue");
            // Checked under the queue lock so shutdown cannot miss the item.
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(BatchError::Shutdown);
            }
            queue.push_back(BatchItem { input, reply });
            queue.len()
        };

        if queued >= self.inner.options.batch_size() {
            let processor = self.clone();
            tokio::spawn(async move { processor.flush().await });
        } else {
            self.arm_timer();
        }
        Ok(receiver)
    }

    fn arm_timer(&self) {
        let mut timer = mutex_lock(&self.inner.timer, SOURCE, "arm_timer");
        if timer.is_some() {
            return;
        }

        let generation = self.inner.next_timer.fetch_add(1, Ordering::Relaxed);
        let processor = self.clone();
        let wait = self.inner.options.max_wait();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if processor.disarm_timer_generation(generation) {
                processor.flush().await;
            }
        });
        *timer = Some(ArmedTimer { generation, handle });
    }

    fn disarm_timer(&self) {
        if let Some(armed) = mutex_lock(&self.inner.timer, SOURCE, "disarm_timer").take() {
            armed.handle.abort();
        }
    }

    /// Clears the slot only if it still holds `generation`, so an expired
    /// timer never flushes on behalf of a newer one.
    fn disarm_timer_generation(&self, generation: u64) -> bool {
        let mut timer = mutex_lock(&self.inner.timer, SOURCE, "fire_timer");
        match timer.as_ref() {
            Some(armed) if armed.generation == generation => {
                *timer = None;
                true
            }
            _ => false,
        }
    }

    async fn process(&self, batch: Vec<BatchItem<T, R, E>>) {
        let (inputs, replies): (Vec<T>, Vec<Reply<R, E>>) =
            batch.into_iter().map(|item| (item.input, item.reply)).unzip();
        let size = inputs.len();

        debug!(size, "Flushing batch");
        self.inner.sink.report(
            MetricEvent::new(METRIC_BATCH_FLUSH_SIZE, Category::Performance).value(size as f64),
        );

        let started = Instant::now();
        let outcome = self.run_with_retry(inputs).await;
        self.inner.sink.report(
            MetricEvent::new(METRIC_BATCH_PROCESS_MS, Category::Performance)
                .value(started.elapsed().as_secs_f64() * 1000.0)
                .meta("size", size),
        );

        let failure = match outcome {
            Ok(results) if results.len() == size => {
                for (reply, result) in replies.into_iter().zip(results) {
                    let _ = reply.send(Ok(result));
                }
                return;
            }
            Ok(results) => BatchError::ResultCount {
                expected: size,
                actual: results.len(),
            },
            Err(err) => BatchError::Failed(err),
        };

        warn!(size, error = ?failure, "Batch failed; rejecting every item");
        self.inner.sink.report(
            MetricEvent::new(METRIC_BATCH_FAILURE, Category::Error).meta("size", size),
        );
        for reply in replies {
            let _ = reply.send(Err(failure.clone()));
        }
    }

    async fn run_with_retry(&self, inputs: Vec<T>) -> Result<Vec<R>, E> {
        let attempts = self.inner.options.attempts();
        let mut attempt = 1;
        loop {
            match (self.inner.process_batch)(inputs.clone()).await {
                Ok(results) => return Ok(results),
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    let delay = self.inner.options.backoff(attempt);
                    warn!(
                        attempt,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = ?err,
                        "Batch attempt failed; retrying"
                    );
                    self.inner.sink.report(
                        MetricEvent::new(METRIC_BATCH_RETRY, Category::Performance)
                            .meta("attempt", attempt),
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures::future::join_all;

    use super::*;
    use crate::sink::MemorySink;

    /// Records the size of every call and doubles each input.
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<usize>>>,
    }

    impl Recorder {
        fn sizes(&self) -> Vec<usize> {
            self.calls.lock().expect("calls").clone()
        }
    }

    fn doubling(
        options: BatchOptions,
    ) -> (Recorder, Arc<MemorySink>, BatchProcessor<u32, u32, String>) {
        let recorder = Recorder::default();
        let sink = Arc::new(MemorySink::new());
        let calls = recorder.calls.clone();
        let processor = BatchProcessor::new(
            move |items: Vec<u32>| {
                let calls = calls.clone();
                async move {
                    calls.lock().expect("calls").push(items.len());
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(items.into_iter().map(|item| item * 2).collect())
                }
            },
            options,
            sink.clone(),
        );
        (recorder, sink, processor)
    }

    fn options(max_batch_size: usize) -> BatchOptions {
        BatchOptions {
            max_batch_size,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_flushes_without_waiting() {
        let (recorder, sink, processor) = doubling(options(3));
        let started = Instant::now();

        let results = join_all((1..=3).map(|n| processor.add(n))).await;

        assert_eq!(results, vec![Ok(2), Ok(4), Ok(6)]);
        assert_eq!(recorder.sizes(), vec![3]);
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(sink.count(METRIC_BATCH_FLUSH_SIZE), 1);

        // The timer armed by the first item is gone and never fires a flush.
        assert!(mutex_lock(&processor.inner.timer, SOURCE, "test").is_none());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(recorder.sizes(), vec![3]);
        assert_eq!(sink.count(METRIC_BATCH_FLUSH_SIZE), 1);
        assert_eq!(processor.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lone_item_flushes_after_max_wait() {
        let (recorder, _, processor) = doubling(options(10));
        let started = Instant::now();

        assert_eq!(processor.add(21).await, Ok(42));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(recorder.sizes(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_drains_itself_in_fifo_batches() {
        let (recorder, _, processor) = doubling(options(2));

        let results = join_all((1..=5).map(|n| processor.add(n))).await;

        assert_eq!(results, vec![Ok(2), Ok(4), Ok(6), Ok(8), Ok(10)]);
        assert_eq!(recorder.sizes(), vec![2, 2, 1]);
        assert_eq!(processor.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_flush_runs_at_a_time() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let processor = {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            BatchProcessor::new(
                move |items: Vec<u32>| {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, String>(items)
                    }
                },
                options(1),
                Arc::new(MemorySink::new()),
            )
        };

        let results = join_all((0..4).map(|n| processor.add(n))).await;
        assert_eq!(results, vec![Ok(0), Ok(1), Ok(2), Ok(3)]);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_linear_backoff_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(MemorySink::new());
        let processor = {
            let calls = calls.clone();
            BatchProcessor::new(
                move |items: Vec<u32>| {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if attempt < 3 {
                            Err(format!("attempt {attempt} failed"))
                        } else {
                            Ok(items)
                        }
                    }
                },
                options(2),
                sink.clone(),
            )
        };
        let started = Instant::now();

        let results = join_all([processor.add(1), processor.add(2)]).await;

        assert_eq!(results, vec![Ok(1), Ok(2)]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(sink.count(METRIC_BATCH_RETRY), 2);
        assert_eq!(sink.count(METRIC_BATCH_FAILURE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_reject_every_item_with_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(MemorySink::new());
        let processor = {
            let calls = calls.clone();
            BatchProcessor::new(
                move |_items: Vec<u32>| {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Err::<Vec<u32>, _>(format!("attempt {attempt} failed")) }
                },
                options(2),
                sink.clone(),
            )
        };

        let results = join_all([processor.add(1), processor.add(2)]).await;

        let expected = Err(BatchError::Failed("attempt 3 failed".to_string()));
        assert_eq!(results, vec![expected.clone(), expected]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.count(METRIC_BATCH_FAILURE), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_result_count_rejects_the_batch() {
        let processor = BatchProcessor::new(
            |_items: Vec<u32>| async { Ok::<Vec<u32>, String>(vec![1]) },
            options(2),
            Arc::new(MemorySink::new()),
        );

        let results = join_all([processor.add(1), processor.add(2)]).await;

        let expected = Err(BatchError::ResultCount {
            expected: 2,
            actual: 1,
        });
        assert_eq!(results, vec![expected.clone(), expected]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_queued_and_later_items() {
        let (recorder, _, processor) = doubling(options(10));

        let first = processor.add(1);
        let second = processor.add(2);
        processor.shutdown();

        assert_eq!(first.await, Err(BatchError::Shutdown));
        assert_eq!(second.await, Err(BatchError::Shutdown));
        assert_eq!(processor.add(3).await, Err(BatchError::Shutdown));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(recorder.sizes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_flush_skips_the_timer() {
        let (recorder, _, processor) = doubling(options(10));
        let started = Instant::now();

        let pending = processor.add(4);
        processor.flush().await;

        assert_eq!(pending.await, Ok(8));
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(recorder.sizes(), vec![1]);
    }
}
