//! The bulk operation manager.
//!
//! Callers submit intents and get handles back; a background dispatcher task
//! decides which kinds may flush, claims their queued entries and runs each
//! claimed set as a batch task. The dispatcher wakes on explicit requests
//! (size trigger, flush, batch completion) and on a periodic tick that drives
//! the age trigger.
//!
//! Intents whose references were held back (see [`crate::deferred`]) are
//! parked after their batch and restored by the dispatcher once nothing they
//! point at is pending creation.
//!
//! Locking: the coordination lock is taken before any queue lock, queue locks
//! before the parked list, and no lock is held across transport I/O. `submit`
//! only takes the lock of its kind.

use crate::cache::ResponseCache;
use crate::clock::{Clock, TokioClock};
use crate::config::BulkConfig;
use crate::dag::{DependencyDag, KindSpec};
use crate::deferred::{self, Clearing, Deferral};
use crate::error::{BulkError, Result};
use crate::executor::{BatchReport, Executor};
use crate::handle::IntentHandle;
use crate::intent::{Intent, Op};
use crate::payload::Payload;
use crate::queue::{IntentQueue, PushOutcome, QueuedIntent};
use crate::retry::RetryPolicy;
use crate::scheduler::{self, KindView, Pass};
use crate::transport::Transport;
use crate::verify::{lookup, ReadOutcome, SnapshotReader};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Work completed while a flush was running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Bulk requests sent
    pub batches: usize,
    /// Queue entries applied
    pub succeeded: usize,
    /// Queue entries that failed
    pub failed: usize,
}

impl FlushSummary {
    fn since(self, earlier: FlushSummary) -> FlushSummary {
        FlushSummary {
            batches: self.batches - earlier.batches,
            succeeded: self.succeeded - earlier.succeeded,
            failed: self.failed - earlier.failed,
        }
    }
}

/// What `close` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseSummary {
    /// Batches that were running when close started
    pub in_flight_batches: usize,
    /// Batches abandoned at the shutdown deadline
    pub aborted_batches: usize,
    /// Queued handles completed as cancelled
    pub cancelled_intents: usize,
}

#[derive(Debug, Clone)]
struct InFlight {
    upserts: bool,
    /// Names the batch is creating
    creates: HashSet<String>,
}

impl InFlight {
    fn restore() -> Self {
        Self {
            upserts: true,
            creates: HashSet::new(),
        }
    }
}

/// A written intent waiting for its held-back references to be restored.
struct Parked {
    index: usize,
    intent: QueuedIntent,
    deferral: Deferral,
}

#[derive(Debug)]
struct SchedState {
    /// Running batch per kind, by topological index
    in_flight: Vec<Option<InFlight>>,
    /// Number of flush calls waiting for the queues to drain
    draining: usize,
}

struct Inner {
    config: BulkConfig,
    dag: Arc<DependencyDag>,
    /// Per-kind queues, by topological index
    queues: Vec<Mutex<IntentQueue>>,
    parked: Mutex<Vec<Parked>>,
    cache: Arc<ResponseCache>,
    executor: Executor,
    reader: SnapshotReader,
    clock: Arc<dyn Clock>,
    seq: AtomicU64,
    sched: Mutex<SchedState>,
    totals: Mutex<FlushSummary>,
    wake: Arc<Notify>,
    /// Bumped whenever the set of pending work shrinks
    progress: watch::Sender<u64>,
    shutdown: CancellationToken,
    abort: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Batches per-resource intents into dependency-ordered bulk requests.
///
/// Cloning is cheap; clones share the same queues, cache and dispatcher.
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct BulkOperationManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BulkOperationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkOperationManager")
            .field("mode", &self.inner.config.mode)
            .field("kinds", &self.inner.dag.len())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl BulkOperationManager {
    /// Creates a manager over the built-in catalog.
    pub fn new(config: BulkConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let dag = DependencyDag::builtin(config.mode)?;
        Self::with_parts(config, dag, transport, Arc::new(TokioClock))
    }

    /// Creates a manager over a custom catalog and clock.
    ///
    /// Kinds of `dag` that are not active in the configured mode are dropped.
    /// Batch ages, recent-write windows and snapshot freshness are all read
    /// from `clock`; tokio time only paces the dispatcher's poll tick, so
    /// with a [`ManualClock`](crate::ManualClock) nothing ages until the clock
    /// is advanced.
    pub fn with_parts(
        config: BulkConfig,
        dag: DependencyDag,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| BulkError::config("the manager must be created inside a tokio runtime"))?;

        let dag = Arc::new(dag.for_mode(config.mode)?);
        let policy = RetryPolicy::from_config(&config);
        let cache = Arc::new(ResponseCache::new(clock.clone(), config.recent_ops_ttl()));
        let executor = Executor::new(
            transport.clone(),
            cache.clone(),
            policy.clone(),
            config.max_batch_size,
            config.max_delete_batch_size,
        );
        let reader = SnapshotReader::new(transport, cache.clone(), policy, config.snapshot_ttl());
        let queues = dag
            .kinds()
            .map(|k| Mutex::new(IntentQueue::new(k.name.clone())))
            .collect();
        let (progress, _) = watch::channel(0);

        let inner = Arc::new(Inner {
            sched: Mutex::new(SchedState {
                in_flight: vec![None; dag.len()],
                draining: 0,
            }),
            config,
            dag,
            queues,
            parked: Mutex::new(Vec::new()),
            cache,
            executor,
            reader,
            clock,
            seq: AtomicU64::new(0),
            totals: Mutex::new(FlushSummary::default()),
            wake: Arc::new(Notify::new()),
            progress,
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
        });
        Inner::spawn_dispatcher(&inner, &runtime);

        info!(
            mode = %inner.config.mode,
            kinds = inner.dag.len(),
            max_batch_size = inner.config.max_batch_size,
            "Bulk operation manager started"
        );
        Ok(Self { inner })
    }

    /// Active dependency graph.
    pub fn dag(&self) -> &DependencyDag {
        &self.inner.dag
    }

    /// Effective configuration.
    pub fn config(&self) -> &BulkConfig {
        &self.inner.config
    }

    /// Queues an intent and returns its handle without waiting.
    pub fn submit(&self, intent: Intent) -> Result<IntentHandle> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(BulkError::Closed);
        }
        intent.validate()?;
        let index = inner
            .dag
            .topo_index(&intent.kind)
            .ok_or_else(|| BulkError::UnknownKind(intent.kind.clone()))?;
        let spec = inner.dag.kind_at(index);
        if !spec.supports(intent.op) {
            return Err(BulkError::UnsupportedOperation {
                kind: intent.kind,
                op: intent.op,
            });
        }

        let (kind, name, op) = (spec.name.clone(), intent.name.clone(), intent.op);
        let (handle, outcome, queued) = {
            let mut queue = inner.queues[index].lock();
            // Checked under the queue lock so close() cannot miss this entry.
            if inner.closed.load(Ordering::SeqCst) {
                return Err(BulkError::Closed);
            }
            let seq = inner.seq.fetch_add(1, Ordering::SeqCst);
            let (handle, outcome) = queue.push(seq, intent, inner.clock.now())?;
            (handle, outcome, queue.len())
        };
        debug!(kind = %kind, name = %name, op = %op, ?outcome, queued, "Intent submitted");

        if outcome == PushOutcome::Cancelled {
            inner.bump_progress();
        }
        if queued >= inner.config.max_batch_size || inner.sched.lock().draining > 0 {
            inner.wake.notify_one();
        }
        Ok(handle)
    }

    /// Queues a create.
    pub fn create(&self, kind: &str, name: &str, payload: Payload) -> Result<IntentHandle> {
        self.submit(Intent::create(kind, name, payload))
    }

    /// Queues an update.
    pub fn update(&self, kind: &str, name: &str, payload: Payload) -> Result<IntentHandle> {
        self.submit(Intent::update(kind, name, payload))
    }

    /// Queues a delete.
    pub fn delete(&self, kind: &str, name: &str) -> Result<IntentHandle> {
        self.submit(Intent::delete(kind, name))
    }

    /// Waits for a handle to reach a terminal state.
    ///
    /// On deadline the intent keeps going; only the wait is abandoned.
    pub async fn await_intent(&self, handle: &IntentHandle, deadline: Option<Duration>) -> Result<()> {
        handle.wait_timeout(deadline).await
    }

    /// Drains every queue in dependency order.
    ///
    /// Upserts go out in topological order, deletes afterwards in reverse
    /// order. On deadline the remaining intents stay queued.
    pub async fn flush(&self, deadline: Option<Duration>) -> Result<FlushSummary> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(BulkError::Closed);
        }
        let before = *inner.totals.lock();
        let mut progress = inner.progress.subscribe();
        let _drain = DrainGuard::new(inner);
        inner.wake.notify_one();
        info!(pending = self.total_pending(), "Flushing bulk operation queues");

        let drained = async {
            while !inner.is_idle() {
                if progress.changed().await.is_err() {
                    break;
                }
            }
        };
        match deadline {
            None => drained.await,
            Some(limit) => tokio::time::timeout(limit, drained).await.map_err(|_| {
                warn!(pending = self.total_pending(), "Flush deadline exceeded");
                BulkError::deadline("flush")
            })?,
        }

        let summary = inner.totals.lock().since(before);
        info!(
            batches = summary.batches,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Flush complete"
        );
        Ok(summary)
    }

    /// True if the kind has queued or in-flight intents, or a live recent write.
    pub fn has_pending_or_recent(&self, kind: &str) -> bool {
        let inner = &self.inner;
        let Some(index) = inner.dag.topo_index(kind) else {
            return false;
        };
        // Separate statements: never hold a queue lock while taking the
        // coordination lock.
        let running = inner.sched.lock().in_flight[index].is_some();
        let queued = !inner.queues[index].lock().is_empty();
        let parked = inner.parked.lock().iter().any(|p| p.index == index);
        queued || running || parked || inner.cache.has_recent(kind)
    }

    /// Object echoed by the last successful write of `(kind, name)`.
    pub fn get_cached_object(&self, kind: &str, name: &str) -> Option<Value> {
        self.inner.cache.written_object(kind, name)
    }

    /// Drops the `Get(kind)` snapshot so the next read fetches again.
    pub fn invalidate_cache(&self, kind: &str) {
        self.inner.cache.invalidate(kind);
    }

    /// Verification read of one object.
    pub async fn read(&self, kind: &str, name: &str) -> Result<ReadOutcome> {
        let spec = self
            .inner
            .dag
            .kind(kind)
            .cloned()
            .ok_or_else(|| BulkError::UnknownKind(kind.to_string()))?;
        if self.has_pending_or_recent(kind) {
            debug!(kind = %kind, name = %name, "Trusting recent write");
            return Ok(ReadOutcome::TrustWrite(self.get_cached_object(kind, name)));
        }
        let objects = self.inner.reader.snapshot(&spec).await?;
        lookup(kind, &objects, name)
    }

    /// Number of queued (unclaimed) entries of a kind.
    pub fn pending_count(&self, kind: &str) -> usize {
        self.inner
            .dag
            .topo_index(kind)
            .map(|i| self.inner.queues[i].lock().len())
            .unwrap_or(0)
    }

    /// Queued entries of every kind in topological order, for debugging.
    pub fn dump_pending(&self) -> Vec<String> {
        self.inner
            .queues
            .iter()
            .flat_map(|q| q.lock().dump())
            .collect()
    }

    /// Stops the manager.
    ///
    /// New submissions are refused, running batches get up to the shutdown
    /// deadline to finish, and every handle still queued is cancelled.
    pub async fn close(&self) -> CloseSummary {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return CloseSummary::default();
        }
        let in_flight_batches = inner.running_batches();
        info!(in_flight_batches, "Closing bulk operation manager");

        inner.shutdown.cancel();
        inner.tracker.close();
        let deadline = inner.config.shutdown_deadline();
        let mut aborted_batches = 0;
        if tokio::time::timeout(deadline, inner.tracker.wait()).await.is_err() {
            aborted_batches = inner.running_batches();
            warn!(
                aborted_batches,
                deadline_ms = deadline.as_millis() as u64,
                "Shutdown deadline reached; abandoning running batches"
            );
            inner.abort.cancel();
            inner.tracker.wait().await;
        }

        let mut cancelled_intents: usize =
            inner.queues.iter().map(|q| q.lock().cancel_all()).sum();
        // Written, but the held references were never restored.
        let parked = std::mem::take(&mut *inner.parked.lock());
        for parked in parked {
            parked.intent.complete(&Err(BulkError::Cancelled));
            cancelled_intents += parked.intent.waiters.len();
        }
        inner.bump_progress();
        info!(cancelled_intents, "Bulk operation manager closed");
        CloseSummary {
            in_flight_batches,
            aborted_batches,
            cancelled_intents,
        }
    }

    fn total_pending(&self) -> usize {
        self.inner.queues.iter().map(|q| q.lock().len()).sum()
    }
}

impl Inner {
    fn spawn_dispatcher(inner: &Arc<Inner>, runtime: &tokio::runtime::Handle) {
        let weak: Weak<Inner> = Arc::downgrade(inner);
        let wake = inner.wake.clone();
        let shutdown = inner.shutdown.clone();
        let period = inner.config.tick_interval();

        inner.tracker.spawn_on(
            async move {
                let mut tick = tokio::time::interval(period);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = wake.notified() => {}
                        _ = tick.tick() => {}
                    }
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.dispatch();
                }
                debug!("Dispatcher stopped");
            },
            runtime,
        );
    }

    /// One scheduling round: select eligible kinds and start their batches.
    fn dispatch(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut sched = self.sched.lock();
        // All queue locks for a consistent snapshot; claims below must not
        // pick up intents submitted after the selection was made.
        let mut queues: Vec<MutexGuard<'_, IntentQueue>> =
            self.queues.iter().map(|q| q.lock()).collect();

        self.release_parked(&mut sched, &queues);
        self.cache.prune_expired();

        let now = self.clock.now();
        let views: Vec<KindView> = queues
            .iter()
            .zip(&sched.in_flight)
            .map(|(queue, running)| self.view(queue, running.as_ref(), now))
            .collect();
        let pass = if sched.draining > 0 {
            Pass::Drain
        } else {
            Pass::Trigger
        };

        for selection in scheduler::select(&self.dag, &views, pass) {
            let index = selection.index;
            let mut intents = queues[index].claim(selection.upserts, selection.deletes);
            if intents.is_empty() {
                continue;
            }
            let kind = self.dag.kind_at(index).clone();
            let held = deferred::hold_back(&kind, &mut intents, |references, name| {
                self.creation_pending(&sched, &queues, references, name)
            });
            let clearings = self.clearings(index, &intents, &queues);
            sched.in_flight[index] = Some(InFlight {
                upserts: intents.iter().any(|i| i.op.is_upsert()),
                creates: intents
                    .iter()
                    .filter(|i| i.op == Op::Create)
                    .map(|i| i.name.clone())
                    .collect(),
            });

            debug!(
                kind = %kind.name,
                count = intents.len(),
                held = held.len(),
                ?pass,
                "Starting batch"
            );
            let inner = Arc::clone(self);
            self.tracker.spawn(async move {
                let work = async {
                    let mut cleared = 0;
                    for clearing in &clearings {
                        cleared += inner.executor.clear_references(clearing).await;
                    }
                    let (mut report, waiting) =
                        inner.executor.run_holding(&kind, intents, held).await;
                    report.requests += cleared;
                    (report, waiting)
                };
                let (report, waiting) = tokio::select! {
                    done = work => done,
                    _ = inner.abort.cancelled() => {
                        warn!(kind = %kind.name, "Batch abandoned at shutdown");
                        (BatchReport::default(), Vec::new())
                    }
                };
                inner.park(index, waiting);
                inner.finish_batch(index, report);
            });
        }
    }

    /// True if a create of `(kind, name)` is queued or in flight.
    fn creation_pending(
        &self,
        sched: &SchedState,
        queues: &[MutexGuard<'_, IntentQueue>],
        kind: &str,
        name: &str,
    ) -> bool {
        let Some(index) = self.dag.topo_index(kind) else {
            return false;
        };
        queues[index].get(name).is_some_and(|e| e.op == Op::Create)
            || sched.in_flight[index]
                .as_ref()
                .is_some_and(|b| b.creates.contains(name))
    }

    /// References to clear before the deletes of kind `index` are sent.
    fn clearings(
        &self,
        index: usize,
        intents: &[QueuedIntent],
        queues: &[MutexGuard<'_, IntentQueue>],
    ) -> Vec<Clearing> {
        let target_kind = &self.dag.kind_at(index).name;
        let targets: HashSet<String> = intents
            .iter()
            .filter(|i| i.op.is_delete())
            .map(|i| i.name.clone())
            .collect();
        if targets.is_empty() {
            return Vec::new();
        }
        let mut clearings = Vec::new();
        for (holder, kind) in self.dag.kinds().enumerate() {
            for field in kind.deferred.iter().filter(|d| &d.references == target_kind) {
                let names = queues[holder].names_where(Op::is_delete);
                if names.is_empty() {
                    continue;
                }
                clearings.push(Clearing {
                    kind: Arc::clone(kind),
                    field: field.clone(),
                    names,
                    targets: targets.clone(),
                });
            }
        }
        clearings
    }

    fn park(&self, index: usize, waiting: Vec<(QueuedIntent, Deferral)>) {
        if waiting.is_empty() {
            return;
        }
        debug!(kind = %self.dag.kind_at(index).name, count = waiting.len(), "Parking intents with held references");
        self.parked.lock().extend(
            waiting
                .into_iter()
                .map(|(intent, deferral)| Parked {
                    index,
                    intent,
                    deferral,
                }),
        );
    }

    /// Starts a restore batch for every kind with parked intents whose
    /// references no longer point at pending creates.
    fn release_parked(self: &Arc<Self>, sched: &mut SchedState, queues: &[MutexGuard<'_, IntentQueue>]) {
        let mut ready: BTreeMap<usize, Vec<(QueuedIntent, Deferral)>> = BTreeMap::new();
        {
            let mut parked = self.parked.lock();
            if parked.is_empty() {
                return;
            }
            let mut waiting = Vec::with_capacity(parked.len());
            for entry in parked.drain(..) {
                let blocked = sched.in_flight[entry.index].is_some()
                    || entry
                        .deferral
                        .waits_on
                        .iter()
                        .any(|(kind, name)| self.creation_pending(sched, queues, kind, name));
                if blocked {
                    waiting.push(entry);
                } else {
                    ready
                        .entry(entry.index)
                        .or_default()
                        .push((entry.intent, entry.deferral));
                }
            }
            *parked = waiting;
        }

        for (index, held) in ready {
            sched.in_flight[index] = Some(InFlight::restore());
            let kind: Arc<KindSpec> = self.dag.kind_at(index).clone();
            debug!(kind = %kind.name, count = held.len(), "Starting restore batch");
            let inner = Arc::clone(self);
            self.tracker.spawn(async move {
                let report = tokio::select! {
                    report = inner.executor.restore(&kind, held) => report,
                    _ = inner.abort.cancelled() => {
                        warn!(kind = %kind.name, "Restore abandoned at shutdown");
                        BatchReport::default()
                    }
                };
                inner.finish_batch(index, report);
            });
        }
    }

    fn view(&self, queue: &IntentQueue, running: Option<&InFlight>, now: Instant) -> KindView {
        let max_age = self.config.max_batch_age();
        KindView {
            oldest_queued_upsert: queue.oldest_seq_where(Op::is_upsert),
            oldest_queued_delete: queue.oldest_seq_where(Op::is_delete),
            last_enqueue: queue.last_enqueue_seq(),
            in_flight: running.is_some(),
            in_flight_upserts: running.is_some_and(|b| b.upserts),
            triggered: queue.len() >= self.config.max_batch_size
                || queue
                    .oldest_submitted_at()
                    .is_some_and(|t| now.duration_since(t) >= max_age),
        }
    }

    fn finish_batch(&self, index: usize, report: BatchReport) {
        self.sched.lock().in_flight[index] = None;
        {
            let mut totals = self.totals.lock();
            totals.batches += report.requests;
            totals.succeeded += report.succeeded;
            totals.failed += report.failed;
        }
        self.bump_progress();
        self.wake.notify_one();
    }

    fn is_idle(&self) -> bool {
        let sched = self.sched.lock();
        sched.in_flight.iter().all(Option::is_none)
            && self.queues.iter().all(|q| q.lock().is_empty())
            && self.parked.lock().is_empty()
    }

    fn running_batches(&self) -> usize {
        self.sched.lock().in_flight.iter().filter(|b| b.is_some()).count()
    }

    fn bump_progress(&self) {
        self.progress.send_modify(|n| *n = n.wrapping_add(1));
    }
}

/// Keeps the dispatcher in drain mode while a flush is waiting.
struct DrainGuard<'a> {
    inner: &'a Inner,
}

impl<'a> DrainGuard<'a> {
    fn new(inner: &'a Inner) -> Self {
        inner.sched.lock().draining += 1;
        Self { inner }
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        let mut sched = self.inner.sched.lock();
        sched.draining = sched.draining.saturating_sub(1);
    }
}
