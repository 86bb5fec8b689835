//! Change-event bus
//!
//! Publishes a lightweight event after each committed insertion batch so
//! downstream caches can invalidate stale entries. Events are keyed by
//! entity kind; consumers subscribe to one kind and receive the row ids the
//! batch affected. Emission happens only after the batch's transaction has
//! committed.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::core::constants::CHANGE_EVENT_CAPACITY;

/// Persisted entity kinds the insertion engines cover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Span,
    TraceAnnotation,
    SpanAnnotation,
    DocumentAnnotation,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Span => "span",
            Self::TraceAnnotation => "trace_annotation",
            Self::SpanAnnotation => "span_annotation",
            Self::DocumentAnnotation => "document_annotation",
        }
    }
}

/// One committed batch: the affected row ids (possibly empty)
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub entity: EntityKind,
    pub row_ids: Vec<i64>,
}

/// Per-kind broadcast channels, created lazily on first use
pub struct ChangeEventBus {
    channels: RwLock<HashMap<EntityKind, broadcast::Sender<ChangeEvent>>>,
    capacity: usize,
}

impl Default for ChangeEventBus {
    fn default() -> Self {
        Self::new(CHANGE_EVENT_CAPACITY)
    }
}

impl ChangeEventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    fn get_or_create(&self, entity: EntityKind) -> broadcast::Sender<ChangeEvent> {
        {
            let channels = self.channels.read();
            if let Some(sender) = channels.get(&entity) {
                return sender.clone();
            }
        }

        let mut channels = self.channels.write();
        // Double-check after acquiring write lock
        if let Some(sender) = channels.get(&entity) {
            return sender.clone();
        }

        let (sender, _) = broadcast::channel(self.capacity);
        channels.insert(entity, sender.clone());
        sender
    }

    /// Publish one change event. Returns the number of receivers that got it;
    /// zero subscribers is not an error.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let sender = self.get_or_create(event.entity);
        tracing::trace!(
            entity = event.entity.as_str(),
            rows = event.row_ids.len(),
            "Publishing change event"
        );
        sender.send(event).unwrap_or(0)
    }

    /// Subscribe to one entity kind
    pub fn subscribe(&self, entity: EntityKind) -> broadcast::Receiver<ChangeEvent> {
        self.get_or_create(entity).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber_of_same_kind() {
        let bus = ChangeEventBus::default();
        let mut rx = bus.subscribe(EntityKind::TraceAnnotation);

        let delivered = bus.publish(ChangeEvent {
            entity: EntityKind::TraceAnnotation,
            row_ids: vec![1, 2, 3],
        });
        assert_eq!(delivered, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.entity, EntityKind::TraceAnnotation);
        assert_eq!(event.row_ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_kinds_are_isolated() {
        let bus = ChangeEventBus::default();
        let mut span_rx = bus.subscribe(EntityKind::Span);

        bus.publish(ChangeEvent {
            entity: EntityKind::SpanAnnotation,
            row_ids: vec![7],
        });

        // Nothing delivered on the span channel
        assert!(matches!(
            span_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = ChangeEventBus::default();
        let delivered = bus.publish(ChangeEvent {
            entity: EntityKind::DocumentAnnotation,
            row_ids: vec![],
        });
        assert_eq!(delivered, 0);
    }
}
