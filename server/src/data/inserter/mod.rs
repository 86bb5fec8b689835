//! Generic batched insertion engine
//!
//! One `QueueInserter` per persisted entity kind. Producers `submit`
//! precursors without blocking; a single flush task per engine periodically
//! drains the buffer and runs the partition → insert → emit cycle:
//!
//! 1. **Partition** — one batched lookup resolves every item's foreign-key
//!    dependency. Resolved items become insertable; unresolved items are
//!    postponed with a decremented retry allowance, or discarded once the
//!    allowance is spent. Every item lands in exactly one bucket.
//! 2. **Insert** — one multi-row conflict-aware statement commits all
//!    insertable items and returns the affected row ids.
//! 3. **Emit** — one change event per processed batch, published only after
//!    the commit succeeded.
//!
//! A database error fails the whole cycle: transient errors re-buffer the
//! batch through the same bounded retry allowance, anything else drops it
//! with an error log. A bad cycle never stops the next one.

mod annotations;
mod spans;

pub use annotations::{
    AnnotationData, DocumentAnnotationInsertion, DocumentAnnotationPrecursor,
    DocumentAnnotationRow, SpanAnnotationInsertion, SpanAnnotationPrecursor, SpanAnnotationRow,
    TraceAnnotationInsertion, TraceAnnotationPrecursor, TraceAnnotationRow,
};
pub use spans::{SpanInsertion, SpanPrecursor, SpanRow};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use super::events::{ChangeEvent, ChangeEventBus, EntityKind};
use super::{DataError, Db};
use crate::core::config::IngestConfig;

/// Tuning knobs for one engine instance
#[derive(Debug, Clone)]
pub struct InserterConfig {
    pub flush_interval: Duration,
    pub retry_budget: u32,
    pub batch_threshold: usize,
}

impl From<&IngestConfig> for InserterConfig {
    fn from(config: &IngestConfig) -> Self {
        Self {
            flush_interval: config.flush_interval,
            retry_budget: config.retry_budget,
            batch_threshold: config.batch_threshold,
        }
    }
}

/// A buffered precursor with its arrival timestamp and remaining retry
/// allowance. Newly received items carry the full budget; each postponement
/// spends one.
#[derive(Debug)]
pub struct Received<P> {
    pub precursor: P,
    pub received_at: DateTime<Utc>,
    pub retries_left: u32,
}

/// Strategy for one persisted entity kind: the batched dependency lookup and
/// the conflict-aware insert. The engine owns all buffering, retry
/// bookkeeping, and event emission.
#[async_trait]
pub trait InsertionKind: Send + Sync + 'static {
    /// Candidate row still awaiting its foreign-key lookup
    type Precursor: Send + 'static;
    /// Row whose dependencies are resolved, ready for the insert statement
    type Insertable: Send + 'static;

    fn entity(&self) -> EntityKind;

    /// Resolve dependencies for the whole batch in one query. The result is
    /// positional: `None` means the item's dependency is not yet available.
    async fn resolve(
        &self,
        db: &Db,
        precursors: &[Self::Precursor],
    ) -> Result<Vec<Option<Self::Insertable>>, DataError>;

    /// Commit all items in one batched statement; returns affected row ids
    async fn insert(
        &self,
        db: &Db,
        items: Vec<Self::Insertable>,
    ) -> Result<Vec<i64>, DataError>;
}

/// Outcome of one flush cycle. On a clean cycle
/// `inserted + postponed + discarded` equals the batch size.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    pub inserted: usize,
    pub postponed: usize,
    pub discarded: usize,
}

/// Batching, retry-capable inserter for one entity kind
pub struct QueueInserter<K: InsertionKind> {
    kind: K,
    db: Db,
    events: Arc<ChangeEventBus>,
    config: InserterConfig,
    buffer: Mutex<Vec<Received<K::Precursor>>>,
    flush_now: Notify,
}

impl<K: InsertionKind> QueueInserter<K> {
    pub fn new(kind: K, db: Db, events: Arc<ChangeEventBus>, config: InserterConfig) -> Arc<Self> {
        Arc::new(Self {
            kind,
            db,
            events,
            config,
            buffer: Mutex::new(Vec::new()),
            flush_now: Notify::new(),
        })
    }

    /// Queue one precursor; never blocks and never fails. The row becomes
    /// visible in the store after a flush cycle at the earliest.
    pub fn submit(&self, precursor: K::Precursor) {
        let len = {
            let mut buffer = self.buffer.lock();
            buffer.push(Received {
                precursor,
                received_at: Utc::now(),
                retries_left: self.config.retry_budget,
            });
            buffer.len()
        };
        if len >= self.config.batch_threshold {
            self.flush_now.notify_one();
        }
    }

    /// Number of items currently buffered (received + postponed)
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Start the flush task. Flushes happen on the configured interval, when
    /// the buffer reaches the batch threshold, and once more on shutdown.
    /// The single task is the only flush executor, so cycles never overlap.
    pub fn start(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let inserter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(inserter.config.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            // Final drain so accepted items are not lost on a
                            // clean shutdown
                            inserter.flush_once().await;
                            tracing::debug!(
                                entity = inserter.kind.entity().as_str(),
                                "QueueInserter shutting down"
                            );
                            break;
                        }
                    }
                    _ = inserter.flush_now.notified() => {
                        inserter.flush_once().await;
                    }
                    _ = interval.tick() => {
                        inserter.flush_once().await;
                    }
                }
            }
        })
    }

    /// Run one partition → insert → emit cycle over the buffered batch.
    ///
    /// Public so tests drive cycles explicitly instead of sleeping.
    pub async fn flush_once(&self) -> FlushOutcome {
        let batch: Vec<Received<K::Precursor>> = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return FlushOutcome::default();
        }
        let total = batch.len();
        let entity = self.kind.entity();

        let mut metas = Vec::with_capacity(total);
        let mut precursors = Vec::with_capacity(total);
        for received in batch {
            metas.push((received.received_at, received.retries_left));
            precursors.push(received.precursor);
        }

        // Partition: one batched dependency lookup for the whole batch
        let resolved = match self.kind.resolve(&self.db, &precursors).await {
            Ok(resolved) => resolved,
            Err(e) => {
                let items = precursors
                    .into_iter()
                    .zip(metas)
                    .map(|(precursor, (received_at, retries_left))| Received {
                        precursor,
                        received_at,
                        retries_left,
                    })
                    .collect();
                return self.handle_cycle_error("dependency resolution", e, items);
            }
        };
        debug_assert_eq!(resolved.len(), total, "resolve() must be positional");

        let mut insertables = Vec::new();
        let mut insertable_sources = Vec::new();
        let mut postponed = Vec::new();
        let mut discarded = 0usize;

        for ((slot, precursor), (received_at, retries_left)) in
            resolved.into_iter().zip(precursors).zip(metas)
        {
            match slot {
                Some(insertable) => {
                    insertables.push(insertable);
                    insertable_sources.push(Received {
                        precursor,
                        received_at,
                        retries_left,
                    });
                }
                None if retries_left > 0 => {
                    postponed.push(Received {
                        precursor,
                        received_at,
                        retries_left: retries_left - 1,
                    });
                }
                None => discarded += 1,
            }
        }

        if discarded > 0 {
            // Data-loss event: the referenced rows never appeared
            tracing::warn!(
                entity = entity.as_str(),
                discarded,
                "Discarding items whose dependencies never resolved"
            );
        }

        let mut outcome = FlushOutcome {
            inserted: 0,
            postponed: postponed.len(),
            discarded,
        };

        // Insert: one conflict-aware statement for every insertable item
        if insertables.is_empty() {
            self.events.publish(ChangeEvent {
                entity,
                row_ids: Vec::new(),
            });
        } else {
            let committed = insertable_sources.len();
            match self.kind.insert(&self.db, insertables).await {
                Ok(row_ids) => {
                    outcome.inserted = committed;
                    tracing::debug!(
                        entity = entity.as_str(),
                        inserted = committed,
                        postponed = outcome.postponed,
                        discarded = outcome.discarded,
                        "Flush cycle committed"
                    );
                    // Emit only after the transaction committed
                    self.events.publish(ChangeEvent { entity, row_ids });
                }
                Err(e) => {
                    let failed = self.handle_cycle_error("insert", e, insertable_sources);
                    outcome.postponed += failed.postponed;
                    outcome.discarded += failed.discarded;
                }
            }
        }

        // Postponed items re-enter the buffer behind anything submitted in
        // the meantime; they are retried on a later cycle
        if !postponed.is_empty() {
            self.buffer.lock().extend(postponed);
        }

        outcome
    }

    /// A database error fails the whole cycle. Transient errors re-buffer the
    /// affected items through their remaining retry allowance so a brief
    /// outage behaves like an unresolved dependency; anything else drops the
    /// batch (at-most-once for the in-memory buffer).
    fn handle_cycle_error(
        &self,
        stage: &str,
        error: DataError,
        items: Vec<Received<K::Precursor>>,
    ) -> FlushOutcome {
        let entity = self.kind.entity();
        if error.is_transient() {
            let mut postponed = 0usize;
            let mut discarded = 0usize;
            let mut requeue = Vec::with_capacity(items.len());
            for mut item in items {
                if item.retries_left > 0 {
                    item.retries_left -= 1;
                    requeue.push(item);
                    postponed += 1;
                } else {
                    discarded += 1;
                }
            }
            tracing::warn!(
                entity = entity.as_str(),
                stage,
                error = %error,
                requeued = postponed,
                discarded,
                "Transient database error during flush; re-buffering batch"
            );
            if !requeue.is_empty() {
                self.buffer.lock().extend(requeue);
            }
            FlushOutcome {
                inserted: 0,
                postponed,
                discarded,
            }
        } else {
            let dropped = items.len();
            tracing::error!(
                entity = entity.as_str(),
                stage,
                error = %error,
                dropped,
                "Flush cycle failed; dropping batch"
            );
            FlushOutcome {
                inserted: 0,
                postponed: 0,
                discarded: dropped,
            }
        }
    }
}

/// The full set of engines the server runs, one per entity kind
pub struct Inserters {
    pub spans: Arc<QueueInserter<SpanInsertion>>,
    pub trace_annotations: Arc<QueueInserter<TraceAnnotationInsertion>>,
    pub span_annotations: Arc<QueueInserter<SpanAnnotationInsertion>>,
    pub document_annotations: Arc<QueueInserter<DocumentAnnotationInsertion>>,
}

impl Inserters {
    pub fn new(db: Db, events: Arc<ChangeEventBus>, config: InserterConfig) -> Arc<Self> {
        Arc::new(Self {
            spans: QueueInserter::new(
                SpanInsertion,
                db.clone(),
                Arc::clone(&events),
                config.clone(),
            ),
            trace_annotations: QueueInserter::new(
                TraceAnnotationInsertion,
                db.clone(),
                Arc::clone(&events),
                config.clone(),
            ),
            span_annotations: QueueInserter::new(
                SpanAnnotationInsertion,
                db.clone(),
                Arc::clone(&events),
                config.clone(),
            ),
            document_annotations: QueueInserter::new(
                DocumentAnnotationInsertion,
                db,
                events,
                config,
            ),
        })
    }

    /// Start every flush task; the handles are registered for shutdown
    pub fn start_all(&self, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.spans.start(shutdown_rx.clone()),
            self.trace_annotations.start(shutdown_rx.clone()),
            self.span_annotations.start(shutdown_rx.clone()),
            self.document_annotations.start(shutdown_rx),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TransactionalService;
    use parking_lot::RwLock;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Test strategy: resolvability and insert failures are scripted
    struct StubKind {
        resolvable: Arc<RwLock<HashSet<String>>>,
        fail_insert: Arc<AtomicBool>,
        fail_transient: bool,
        insert_calls: Arc<AtomicUsize>,
        inserted: Arc<Mutex<Vec<String>>>,
    }

    impl StubKind {
        fn new() -> Self {
            Self {
                resolvable: Arc::new(RwLock::new(HashSet::new())),
                fail_insert: Arc::new(AtomicBool::new(false)),
                fail_transient: false,
                insert_calls: Arc::new(AtomicUsize::new(0)),
                inserted: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl InsertionKind for StubKind {
        type Precursor = String;
        type Insertable = String;

        fn entity(&self) -> EntityKind {
            EntityKind::TraceAnnotation
        }

        async fn resolve(
            &self,
            _db: &Db,
            precursors: &[String],
        ) -> Result<Vec<Option<String>>, DataError> {
            let resolvable = self.resolvable.read();
            Ok(precursors
                .iter()
                .map(|p| resolvable.contains(p).then(|| p.clone()))
                .collect())
        }

        async fn insert(&self, _db: &Db, items: Vec<String>) -> Result<Vec<i64>, DataError> {
            self.insert_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_insert.load(Ordering::SeqCst) {
                let error = if self.fail_transient {
                    sqlx::Error::PoolTimedOut
                } else {
                    sqlx::Error::RowNotFound
                };
                return Err(DataError::from_sqlite(error));
            }
            let ids = (1..=items.len() as i64).collect();
            self.inserted.lock().extend(items);
            Ok(ids)
        }
    }

    fn test_config(retry_budget: u32) -> InserterConfig {
        InserterConfig {
            flush_interval: Duration::from_secs(3600),
            retry_budget,
            batch_threshold: 1000,
        }
    }

    async fn make_inserter(
        kind: StubKind,
        retry_budget: u32,
    ) -> (Arc<QueueInserter<StubKind>>, Arc<ChangeEventBus>) {
        let service = TransactionalService::init_in_memory().await.unwrap();
        let events = Arc::new(ChangeEventBus::default());
        let inserter = QueueInserter::new(
            kind,
            service.db(),
            Arc::clone(&events),
            test_config(retry_budget),
        );
        (inserter, events)
    }

    #[tokio::test]
    async fn test_partition_completeness() {
        let kind = StubKind::new();
        kind.resolvable.write().extend(["a".to_string(), "b".to_string()]);
        let (inserter, _) = make_inserter(kind, 3).await;

        for item in ["a", "b", "c", "d", "e"] {
            inserter.submit(item.to_string());
        }
        let outcome = inserter.flush_once().await;

        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.postponed, 3);
        assert_eq!(outcome.discarded, 0);
        assert_eq!(outcome.inserted + outcome.postponed + outcome.discarded, 5);
        assert_eq!(inserter.buffered(), 3);
    }

    #[tokio::test]
    async fn test_postponed_item_resolves_on_later_cycle() {
        let kind = StubKind::new();
        let resolvable = Arc::clone(&kind.resolvable);
        let inserted = Arc::clone(&kind.inserted);
        let (inserter, _) = make_inserter(kind, 5).await;

        inserter.submit("late".to_string());
        let first = inserter.flush_once().await;
        assert_eq!(first.postponed, 1);

        // Dependency appears between cycles
        resolvable.write().insert("late".to_string());
        let second = inserter.flush_once().await;
        assert_eq!(second.inserted, 1);
        assert_eq!(inserter.buffered(), 0);
        assert_eq!(inserted.lock().as_slice(), ["late".to_string()]);
    }

    #[tokio::test]
    async fn test_bounded_retry_discard_by_cycle_count() {
        let kind = StubKind::new();
        let (inserter, _) = make_inserter(kind, 2).await;

        inserter.submit("never".to_string());

        // Budget of 2 buys exactly 2 postponements
        assert_eq!(inserter.flush_once().await.postponed, 1);
        assert_eq!(inserter.flush_once().await.postponed, 1);
        let last = inserter.flush_once().await;
        assert_eq!(last.discarded, 1);
        assert_eq!(last.postponed, 0);
        assert_eq!(inserter.buffered(), 0);

        // Nothing left for later cycles
        assert_eq!(inserter.flush_once().await, FlushOutcome::default());
    }

    #[tokio::test]
    async fn test_change_event_emitted_after_commit() {
        let kind = StubKind::new();
        kind.resolvable.write().insert("a".to_string());
        let (inserter, events) = make_inserter(kind, 1).await;
        let mut rx = events.subscribe(EntityKind::TraceAnnotation);

        inserter.submit("a".to_string());
        inserter.flush_once().await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.entity, EntityKind::TraceAnnotation);
        assert_eq!(event.row_ids, vec![1]);
    }

    #[tokio::test]
    async fn test_empty_event_when_batch_produced_no_inserts() {
        let kind = StubKind::new();
        let (inserter, events) = make_inserter(kind, 1).await;
        let mut rx = events.subscribe(EntityKind::TraceAnnotation);

        inserter.submit("unresolved".to_string());
        inserter.flush_once().await;

        let event = rx.recv().await.unwrap();
        assert!(event.row_ids.is_empty());
    }

    #[tokio::test]
    async fn test_non_transient_insert_failure_drops_batch_and_emits_nothing() {
        let kind = StubKind::new();
        kind.resolvable.write().insert("a".to_string());
        let fail = Arc::clone(&kind.fail_insert);
        let calls = Arc::clone(&kind.insert_calls);
        let (inserter, events) = make_inserter(kind, 3).await;
        let mut rx = events.subscribe(EntityKind::TraceAnnotation);

        fail.store(true, Ordering::SeqCst);
        inserter.submit("a".to_string());
        let outcome = inserter.flush_once().await;

        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.discarded, 1);
        assert_eq!(inserter.buffered(), 0);
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));

        // A failed cycle must not stop the next one
        fail.store(false, Ordering::SeqCst);
        inserter.submit("a".to_string());
        let next = inserter.flush_once().await;
        assert_eq!(next.inserted, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transient_insert_failure_rebuffers_with_decremented_budget() {
        let mut kind = StubKind::new();
        kind.fail_transient = true;
        kind.resolvable.write().insert("a".to_string());
        let fail = Arc::clone(&kind.fail_insert);
        let inserted = Arc::clone(&kind.inserted);
        let (inserter, _) = make_inserter(kind, 2).await;

        fail.store(true, Ordering::SeqCst);
        inserter.submit("a".to_string());
        let outcome = inserter.flush_once().await;
        assert_eq!(outcome.postponed, 1);
        assert_eq!(inserter.buffered(), 1);

        // Outage ends; the re-buffered item commits on the next cycle
        fail.store(false, Ordering::SeqCst);
        let next = inserter.flush_once().await;
        assert_eq!(next.inserted, 1);
        assert_eq!(inserted.lock().as_slice(), ["a".to_string()]);
    }

    #[tokio::test]
    async fn test_batch_threshold_triggers_immediate_flush() {
        let kind = StubKind::new();
        kind.resolvable.write().extend(["a".to_string(), "b".to_string()]);
        let inserted = Arc::clone(&kind.inserted);

        let service = TransactionalService::init_in_memory().await.unwrap();
        let events = Arc::new(ChangeEventBus::default());
        let inserter = QueueInserter::new(
            kind,
            service.db(),
            events,
            InserterConfig {
                flush_interval: Duration::from_secs(3600),
                retry_budget: 1,
                batch_threshold: 2,
            },
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = inserter.start(shutdown_rx);

        inserter.submit("a".to_string());
        inserter.submit("b".to_string());

        // The threshold wakes the flush task well before the hour-long timer
        for _ in 0..200 {
            if inserted.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(inserted.lock().len(), 2);

        let _ = shutdown_tx.send(true);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_buffer() {
        let kind = StubKind::new();
        kind.resolvable.write().insert("a".to_string());
        let inserted = Arc::clone(&kind.inserted);
        let (inserter, _) = make_inserter(kind, 1).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = inserter.start(shutdown_rx);

        inserter.submit("a".to_string());
        let _ = shutdown_tx.send(true);
        handle.await.unwrap();

        assert_eq!(inserted.lock().as_slice(), ["a".to_string()]);
    }
}
