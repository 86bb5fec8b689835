//! Trace buffer / dispatcher
//!
//! Decouples the collector endpoints from per-project state mutation. `put`
//! never blocks: items land on one of two unbounded queues (spans,
//! evaluations) and are drained by one consumer task each. The consumer
//! resolves the target project under the registry lock, then forwards the
//! item to that project's own worker task, so a slow project cannot stall
//! unrelated projects.
//!
//! Ordering: FIFO per (project, item type). No ordering across projects or
//! across item types.
//!
//! Lifecycle is explicit: `Traces::start()` spawns the consumers,
//! `Traces::stop()` closes the queues and joins every task, so no task
//! outlives the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::project::Project;
use crate::core::constants::DEFAULT_PROJECT_NAME;
use crate::domain::telemetry::{Evaluation, Span, TelemetryItem};

struct Queued<T> {
    item: T,
    project_name: Option<String>,
}

struct ProjectEntry {
    project: Arc<Project>,
    tx: mpsc::UnboundedSender<TelemetryItem>,
    worker: JoinHandle<()>,
}

/// Registry of per-project state, guarded by one coarse lock held only for
/// the lookup-or-create step
#[derive(Default)]
struct ProjectRegistry {
    entries: RwLock<HashMap<String, ProjectEntry>>,
}

impl ProjectRegistry {
    fn get(&self, name: &str) -> Option<Arc<Project>> {
        self.entries.read().get(name).map(|e| Arc::clone(&e.project))
    }

    /// Get or lazily create a project and its worker task
    fn get_or_create(&self, name: &str) -> mpsc::UnboundedSender<TelemetryItem> {
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(name) {
                return entry.tx.clone();
            }
        }

        let mut entries = self.entries.write();
        // Double-check after acquiring write lock
        if let Some(entry) = entries.get(name) {
            return entry.tx.clone();
        }

        let project = Arc::new(Project::new(name));
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_project_worker(Arc::clone(&project), rx));
        tracing::debug!(project = name, "Created project");

        let sender = tx.clone();
        entries.insert(
            name.to_string(),
            ProjectEntry {
                project,
                tx,
                worker,
            },
        );
        sender
    }

    /// Close all project mailboxes and return the worker handles
    fn shutdown_workers(&self) -> Vec<JoinHandle<()>> {
        let mut entries = self.entries.write();
        entries
            .values_mut()
            .map(|entry| {
                // Replace the sender with a closed one so the worker's
                // receiver sees end-of-stream
                let (closed_tx, _) = mpsc::unbounded_channel();
                entry.tx = closed_tx;
                std::mem::replace(&mut entry.worker, tokio::spawn(async {}))
            })
            .collect()
    }
}

/// Per-project worker: applies items to project state in mailbox order
async fn run_project_worker(
    project: Arc<Project>,
    mut rx: mpsc::UnboundedReceiver<TelemetryItem>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            TelemetryItem::Span(span) => project.add_span(span),
            TelemetryItem::Evaluation(evaluation) => project.add_evaluation(evaluation),
        }
    }
    tracing::trace!(project = project.name(), "Project worker stopped");
}

struct Senders {
    span_tx: mpsc::UnboundedSender<Queued<Span>>,
    eval_tx: mpsc::UnboundedSender<Queued<Evaluation>>,
}

/// Process-wide trace buffer and dispatcher
pub struct Traces {
    registry: Arc<ProjectRegistry>,
    senders: RwLock<Option<Senders>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl Traces {
    /// Start the dispatcher: one consumer task per queue
    pub fn start() -> Arc<Self> {
        let registry = Arc::new(ProjectRegistry::default());
        let (span_tx, span_rx) = mpsc::unbounded_channel();
        let (eval_tx, eval_rx) = mpsc::unbounded_channel();

        let span_consumer = tokio::spawn(run_queue_consumer(
            Arc::clone(&registry),
            span_rx,
            TelemetryItem::Span,
        ));
        let eval_consumer = tokio::spawn(run_queue_consumer(
            Arc::clone(&registry),
            eval_rx,
            TelemetryItem::Evaluation,
        ));

        Arc::new(Self {
            registry,
            senders: RwLock::new(Some(Senders { span_tx, eval_tx })),
            consumers: Mutex::new(vec![span_consumer, eval_consumer]),
        })
    }

    /// Enqueue one item; queue choice is by item type. Never blocks.
    ///
    /// `project_name` overrides the project the item is applied to; without
    /// it, a span carries its project resolution from the collector and an
    /// evaluation lands in the default project.
    pub fn put(&self, item: TelemetryItem, project_name: Option<String>) {
        let senders = self.senders.read();
        let Some(senders) = senders.as_ref() else {
            tracing::warn!("Dispatcher stopped, dropping item");
            return;
        };
        let closed = match item {
            TelemetryItem::Span(span) => senders
                .span_tx
                .send(Queued {
                    item: span,
                    project_name,
                })
                .is_err(),
            TelemetryItem::Evaluation(evaluation) => senders
                .eval_tx
                .send(Queued {
                    item: evaluation,
                    project_name,
                })
                .is_err(),
        };
        if closed {
            tracing::warn!("Dispatcher queue closed, dropping item");
        }
    }

    /// Thread-safe project lookup; `None` until the project has received data
    pub fn get_project(&self, name: &str) -> Option<Arc<Project>> {
        self.registry.get(name)
    }

    /// Pre-create a project (used by tests to install hooks before dispatch)
    #[cfg(test)]
    pub(crate) fn create_project(&self, name: &str) -> Arc<Project> {
        self.registry.get_or_create(name);
        self.registry.get(name).expect("project just created")
    }

    /// Stop the dispatcher: close both queues, join the consumers, then join
    /// every project worker. Items already enqueued are applied first.
    pub async fn stop(&self) {
        // Dropping the senders closes the queues; consumers drain and exit
        let senders = self.senders.write().take();
        drop(senders);

        let consumers = std::mem::take(&mut *self.consumers.lock());
        for handle in consumers {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Dispatcher consumer panicked");
            }
        }

        for handle in self.registry.shutdown_workers() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Project worker panicked");
            }
        }
        tracing::debug!("Dispatcher stopped");
    }
}

/// Queue consumer: resolve (or create) the target project under the registry
/// lock, release it, then forward the item to the project's worker
async fn run_queue_consumer<T: Send + 'static>(
    registry: Arc<ProjectRegistry>,
    mut rx: mpsc::UnboundedReceiver<Queued<T>>,
    wrap: fn(T) -> TelemetryItem,
) {
    while let Some(queued) = rx.recv().await {
        let name = queued
            .project_name
            .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string());
        let tx = registry.get_or_create(&name);
        if tx.send(wrap(queued.item)).is_err() {
            tracing::warn!(project = %name, "Project worker gone, dropping item");
        }
    }
    tracing::debug!("Queue consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::DEFAULT_PROJECT_NAME;
    use crate::domain::telemetry::{AnnotatorKind, EvaluationSubject, SpanStatus};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::time::Duration;

    fn make_span(span_id: &str, name: &str) -> Span {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Span {
            span_id: span_id.to_string(),
            trace_id: "t1".to_string(),
            parent_span_id: None,
            name: name.to_string(),
            kind: Default::default(),
            start_time: start,
            end_time: start,
            status: SpanStatus::default(),
            attributes: json!({}),
            events: vec![],
            session_id: None,
            cumulative_error_count: 0,
            cumulative_llm_token_count_prompt: 0,
            cumulative_llm_token_count_completion: 0,
        }
    }

    fn make_eval(name: &str, score: f64) -> Evaluation {
        Evaluation {
            subject: EvaluationSubject::Trace("t1".into()),
            name: name.to_string(),
            annotator_kind: AnnotatorKind::Code,
            label: None,
            score: Some(score),
            explanation: None,
            metadata: json!({}),
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within timeout");
    }

    #[tokio::test]
    async fn test_put_routes_to_resolved_projects() {
        let traces = Traces::start();

        traces.put(TelemetryItem::Span(make_span("s1", "x")), None);
        traces.put(TelemetryItem::Span(make_span("s2", "y")), None);
        traces.put(
            TelemetryItem::Span(make_span("s3", "z")),
            Some("proj1".to_string()),
        );

        wait_for(|| {
            traces
                .get_project("proj1")
                .is_some_and(|p| p.span_count() == 1)
        })
        .await;
        wait_for(|| {
            traces
                .get_project(DEFAULT_PROJECT_NAME)
                .is_some_and(|p| p.span_count() == 2)
        })
        .await;

        let default = traces.get_project(DEFAULT_PROJECT_NAME).unwrap();
        let mut names = default.span_names();
        names.sort();
        assert_eq!(names, vec!["x", "y"]);
        assert_eq!(traces.get_project("proj1").unwrap().span_names(), vec!["z"]);
        assert!(traces.get_project("unknown").is_none());

        traces.stop().await;
    }

    #[tokio::test]
    async fn test_fifo_order_within_project() {
        let traces = Traces::start();

        for i in 0..10 {
            traces.put(
                TelemetryItem::Span(make_span(&format!("s{}", i), &format!("span-{}", i))),
                Some("p".to_string()),
            );
        }
        traces.stop().await;

        let project = traces.get_project("p").unwrap();
        let expected: Vec<String> = (0..10).map(|i| format!("span-{}", i)).collect();
        assert_eq!(project.span_names(), expected);
    }

    #[tokio::test]
    async fn test_evaluations_use_their_own_queue() {
        let traces = Traces::start();

        traces.put(TelemetryItem::Evaluation(make_eval("correctness", 0.4)), None);
        traces.put(TelemetryItem::Evaluation(make_eval("correctness", 0.8)), None);

        wait_for(|| {
            traces.get_project(DEFAULT_PROJECT_NAME).is_some_and(|p| {
                p.get_evaluation(&EvaluationSubject::Trace("t1".into()), "correctness")
                    .and_then(|e| e.score)
                    == Some(0.8)
            })
        })
        .await;

        let project = traces.get_project(DEFAULT_PROJECT_NAME).unwrap();
        assert_eq!(project.evaluation_count(), 1);
        let stored = project
            .get_evaluation(&EvaluationSubject::Trace("t1".into()), "correctness")
            .unwrap();
        // FIFO within the evaluation queue: the later write wins
        assert_eq!(stored.score, Some(0.8));

        traces.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_project_does_not_delay_other_projects() {
        let traces = Traces::start();

        let slow = traces.create_project("slow");
        slow.set_add_delay(Duration::from_millis(150));

        for i in 0..5 {
            traces.put(
                TelemetryItem::Span(make_span(&format!("a{}", i), "a")),
                Some("slow".to_string()),
            );
        }
        traces.put(
            TelemetryItem::Span(make_span("b0", "b")),
            Some("fast".to_string()),
        );

        // The fast project's span must land while the slow project is still
        // grinding through its mailbox
        tokio::time::timeout(Duration::from_millis(100), async {
            wait_for(|| {
                traces
                    .get_project("fast")
                    .is_some_and(|p| p.span_count() == 1)
            })
            .await;
        })
        .await
        .expect("fast project was delayed by slow project");

        assert!(traces.get_project("slow").unwrap().span_count() < 5);
        traces.stop().await;
    }

    #[tokio::test]
    async fn test_stop_applies_enqueued_items_and_put_after_stop_is_dropped() {
        let traces = Traces::start();

        for i in 0..20 {
            traces.put(
                TelemetryItem::Span(make_span(&format!("s{}", i), "n")),
                Some("p".to_string()),
            );
        }
        traces.stop().await;
        assert_eq!(traces.get_project("p").unwrap().span_count(), 20);

        // After stop, put is a no-op rather than a panic
        traces.put(TelemetryItem::Span(make_span("late", "late")), None);
        assert_eq!(traces.get_project("p").unwrap().span_count(), 20);
    }
}
