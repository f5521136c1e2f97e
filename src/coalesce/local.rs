//! In-process request coalescing.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, instrument};

use crate::clock::{Clock, millis};
use crate::sink::{
    Category, METRIC_COALESCE_DISPATCH, METRIC_COALESCE_JOIN, MetricEvent, MetricsSink,
};

use super::config::{CoalesceConfig, CoalesceOptions};

type SharedOutcome<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

struct PendingRequest<T, E> {
    id: u64,
    outcome: SharedOutcome<T, E>,
    started_at: u64,
    ref_count: u32,
}

impl<T, E> PendingRequest<T, E> {
    fn joinable(&self, now: u64, options: &CoalesceOptions) -> bool {
        now.saturating_sub(self.started_at) < millis(options.timeout)
            && self.ref_count < options.max_ref_count
    }
}

struct Inner<T, E> {
    pending: DashMap<String, PendingRequest<T, E>>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
    window: Duration,
    cleanup_delay: Duration,
}

/// Deduplicates concurrent requests for the same key within one process.
///
/// Callers that find a young, non-saturated pending request share its
/// outcome; everyone else waits out the coalescing window and then either
/// joins whatever was registered meanwhile or dispatches fresh work. The
/// pending table is owned by this instance; clones share it.
pub struct Coalescer<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Coalescer<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Coalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(clock: Arc<dyn Clock>, sink: Arc<dyn MetricsSink>, config: &CoalesceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: DashMap::new(),
                next_id: AtomicU64::new(0),
                clock,
                sink,
                window: config.window(),
                cleanup_delay: config.cleanup_delay(),
            }),
        }
    }

    /// Runs `work` at most once per key among concurrent callers.
    ///
    /// Every caller sharing a request receives a clone of the same `Ok` or
    /// `Err`. `options.timeout` only bounds how long a request stays joinable;
    /// the work itself is never aborted. `work` is invoked on the first poll
    /// of the registered request, never while the pending table is locked,
    /// so it may call back into this coalescer.
    #[instrument(skip(self, work, options))]
    pub async fn coalesce<F, Fut>(
        &self,
        key: &str,
        work: F,
        options: &CoalesceOptions,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if let Some(outcome) = self.try_join(key, options) {
            return outcome.await;
        }

        tokio::time::sleep(self.inner.window).await;
        self.join_or_dispatch(key, work, options).await
    }

    /// Number of keys with a pending (or recently settled) request.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }

    fn try_join(&self, key: &str, options: &CoalesceOptions) -> Option<SharedOutcome<T, E>> {
        let now = self.inner.clock.now_millis();
        let mut request = self.inner.pending.get_mut(key)?;
        if !request.joinable(now, options) {
            return None;
        }
        request.ref_count += 1;
        let ref_count = request.ref_count;
        let outcome = request.outcome.clone();
        drop(request);

        self.report_join(key, ref_count);
        Some(outcome)
    }

    fn join_or_dispatch<F, Fut>(
        &self,
        key: &str,
        work: F,
        options: &CoalesceOptions,
    ) -> SharedOutcome<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let now = self.inner.clock.now_millis();
        let (outcome, id, reason) = match self.inner.pending.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().joinable(now, options) => {
                let request = occupied.get_mut();
                request.ref_count += 1;
                let ref_count = request.ref_count;
                let outcome = request.outcome.clone();
                drop(occupied);

                self.report_join(key, ref_count);
                return outcome;
            }
            Entry::Occupied(mut occupied) => {
                let reason = if occupied.get().ref_count >= options.max_ref_count {
                    "saturated"
                } else {
                    "expired"
                };
                let request = self.register(work, now);
                let (outcome, id) = (request.outcome.clone(), request.id);
                occupied.insert(request);
                (outcome, id, reason)
            }
            Entry::Vacant(vacant) => {
                let request = self.register(work, now);
                let (outcome, id) = (request.outcome.clone(), request.id);
                vacant.insert(request);
                (outcome, id, "vacant")
            }
        };

        debug!(key, request_id = id, reason, "Coalescer dispatching fresh work");
        self.inner.sink.report(
            MetricEvent::new(METRIC_COALESCE_DISPATCH, Category::Performance)
                .label(key)
                .meta("reason", reason),
        );
        self.schedule_cleanup(key.to_string(), id, outcome.clone());
        outcome
    }

    fn register<F, Fut>(&self, work: F, now: u64) -> PendingRequest<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        PendingRequest {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            outcome: async move { work().await }.boxed().shared(),
            started_at: now,
            ref_count: 1,
        }
    }

    /// Drives the request to completion even if every caller goes away, then
    /// drops it from the table once the cleanup delay has passed. A newer
    /// request registered under the same key is left alone.
    fn schedule_cleanup(&self, key: String, id: u64, outcome: SharedOutcome<T, E>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _ = outcome.await;
            tokio::time::sleep(inner.cleanup_delay).await;
            if inner
                .pending
                .remove_if(&key, |_, request| request.id == id)
                .is_some()
            {
                debug!(key, request_id = id, "Coalescer released settled request");
            }
        });
    }

    fn report_join(&self, key: &str, ref_count: u32) {
        debug!(key, ref_count, "Coalescer joined pending request");
        self.inner.sink.report(
            MetricEvent::new(METRIC_COALESCE_JOIN, Category::Performance)
                .label(key)
                .meta("ref_count", ref_count),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::future::join_all;

    use super::*;
    use crate::clock::ManualClock;
    use crate::sink::MemorySink;

    fn coalescer() -> (Arc<ManualClock>, Arc<MemorySink>, Coalescer<u32, String>) {
        let clock = Arc::new(ManualClock::new(0));
        let sink = Arc::new(MemorySink::new());
        let coalescer = Coalescer::new(clock.clone(), sink.clone(), &CoalesceConfig::default());
        (clock, sink, coalescer)
    }

    fn counted(
        calls: &Arc<AtomicUsize>,
        result: Result<u32, String>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<u32, String>> + use<> {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                result
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_invocation() {
        let (_, sink, coalescer) = coalescer();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = CoalesceOptions::default();

        let results = join_all(
            (0..5).map(|_| coalescer.coalesce("k", counted(&calls, Ok(42)), &options)),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|result| result == &Ok(42)));
        assert_eq!(sink.count(METRIC_COALESCE_DISPATCH), 1);
        assert_eq!(sink.count(METRIC_COALESCE_JOIN), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_shared_with_every_caller() {
        let (_, _, coalescer) = coalescer();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = CoalesceOptions::default();

        let results = join_all((0..3).map(|_| {
            coalescer.coalesce("k", counted(&calls, Err("db down".to_string())), &options)
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(
            results
                .iter()
                .all(|result| result == &Err("db down".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_requests_dispatch_fresh_work() {
        let (_, _, coalescer) = coalescer();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = CoalesceOptions {
            max_ref_count: 2,
            ..Default::default()
        };

        let results = join_all(
            (0..5).map(|_| coalescer.coalesce("k", counted(&calls, Ok(1)), &options)),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(results.iter().all(|result| result == &Ok(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_do_not_coalesce() {
        let (_, _, coalescer) = coalescer();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = CoalesceOptions::default();

        let (a, b) = tokio::join!(
            coalescer.coalesce("a", counted(&calls, Ok(1)), &options),
            coalescer.coalesce("b", counted(&calls, Ok(2)), &options),
        );

        assert_eq!((a, b), (Ok(1), Ok(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_older_than_timeout_are_not_joined() {
        let (clock, _, coalescer) = coalescer();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = CoalesceOptions {
            timeout: Duration::from_millis(500),
            ..Default::default()
        };

        let hung = {
            let calls = Arc::clone(&calls);
            move || {
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::future::pending::<Result<u32, String>>().await
                }
                .boxed()
            }
        };
        let first = tokio::spawn({
            let coalescer = coalescer.clone();
            async move { coalescer.coalesce("k", hung, &options).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_millis(500));
        let second = coalescer
            .coalesce("k", counted(&calls, Ok(9)), &options)
            .await;

        assert_eq!(second, Ok(9));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        first.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn settled_requests_are_removed_after_cleanup_delay() {
        let (_, _, coalescer) = coalescer();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = CoalesceOptions::default();

        assert_eq!(
            coalescer.coalesce("k", counted(&calls, Ok(1)), &options).await,
            Ok(1)
        );
        assert_eq!(coalescer.pending_len(), 1);

        // Inside the cleanup delay the settled outcome is still shared.
        assert_eq!(
            coalescer.coalesce("k", counted(&calls, Ok(2)), &options).await,
            Ok(1)
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(coalescer.pending_len(), 0);

        assert_eq!(
            coalescer.coalesce("k", counted(&calls, Ok(3)), &options).await,
            Ok(3)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn work_may_inspect_its_own_coalescer() {
        let (_, _, coalescer) = coalescer();
        let observed = Arc::new(AtomicUsize::new(usize::MAX));
        let options = CoalesceOptions::default();

        let work = {
            let coalescer = coalescer.clone();
            let observed = Arc::clone(&observed);
            move || {
                observed.store(coalescer.pending_len(), Ordering::SeqCst);
                async { Ok::<u32, String>(11) }.boxed()
            }
        };

        assert_eq!(coalescer.coalesce("k", work, &options).await, Ok(11));
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn joined_callers_never_invoke_their_work() {
        let (_, _, coalescer) = coalescer();
        let invoked = Arc::new(AtomicUsize::new(0));
        let options = CoalesceOptions::default();

        let results = join_all((0..4).map(|_| {
            let invoked = Arc::clone(&invoked);
            coalescer.coalesce(
                "k",
                move || {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<u32, String>(3) }.boxed()
                },
                &options,
            )
        }))
        .await;

        assert!(results.iter().all(|result| result == &Ok(3)));
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn work_completes_even_if_callers_drop() {
        let (_, _, coalescer) = coalescer();
        let calls = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let options = CoalesceOptions::default();

        let work = {
            let calls = Arc::clone(&calls);
            let finished = Arc::clone(&finished);
            move || {
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok::<u32, String>(5)
                }
                .boxed()
            }
        };

        let caller = tokio::spawn({
            let coalescer = coalescer.clone();
            async move { coalescer.coalesce("k", work, &options).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
