//! Event Publisher Adapter
//!
//! Implements the `EventPublisher` port with various backends.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::domain::events::QueueEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Logging-based event publisher.
///
/// Publishes queue events to the tracing/logging system.
/// Default publisher of a registry without a real queue.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    /// Whether to log events at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingEventPublisher {
    /// Create a new logging event publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a publisher that logs at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    /// Create a publisher that logs at debug level.
    pub fn debug_level() -> Self {
        Self { info_level: false }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, channel: &str, event: QueueEvent) -> Result<()> {
        let event_type = event.event_type();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        if self.info_level {
            info!(channel = %channel, event_type = %event_type, event = %json, "Queue event");
        } else {
            debug!(channel = %channel, event_type = %event_type, event = %json, "Queue event");
        }

        Ok(())
    }
}

/// In-memory event collector for testing.
///
/// Collects `(channel, event)` pairs for later inspection; also serves as
/// the lazy queue in tests and the demo.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<(String, QueueEvent)>>,
}

impl InMemoryEventCollector {
    /// Create a new in-memory event collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events with their channels.
    pub fn events(&self) -> Vec<(String, QueueEvent)> {
        self.events.read().clone()
    }

    /// Get the count of collected events.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Check if there are no events.
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clear all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Get events published to a channel.
    pub fn events_on(&self, channel: &str) -> Vec<QueueEvent> {
        self.events
            .read()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Get events of a specific type.
    pub fn events_of_type(&self, event_type: &str) -> Vec<QueueEvent> {
        self.events
            .read()
            .iter()
            .filter(|(_, e)| e.event_type() == event_type)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Remove and return the events of a channel, oldest first.
    pub fn drain_channel(&self, channel: &str) -> Vec<QueueEvent> {
        let mut events = self.events.write();
        let (drained, kept): (Vec<_>, Vec<_>) =
            events.drain(..).partition(|(c, _)| c == channel);
        *events = kept;
        drained.into_iter().map(|(_, e)| e).collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, channel: &str, event: QueueEvent) -> Result<()> {
        self.events.write().push((channel.to_string(), event));
        Ok(())
    }

    async fn publish_all(&self, channel: &str, events: Vec<QueueEvent>) -> Result<()> {
        self.events
            .write()
            .extend(events.into_iter().map(|e| (channel.to_string(), e)));
        Ok(())
    }
}

/// Composite event publisher that publishes to multiple backends.
#[derive(Default)]
pub struct CompositeEventPublisher {
    publishers: Vec<Box<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    /// Create a new composite publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a publisher to the composite.
    pub fn with_publisher<P: EventPublisher + 'static>(mut self, publisher: P) -> Self {
        self.publishers.push(Box::new(publisher));
        self
    }
}

impl std::fmt::Debug for CompositeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventPublisher")
            .field("publisher_count", &self.publishers.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for CompositeEventPublisher {
    async fn publish(&self, channel: &str, event: QueueEvent) -> Result<()> {
        for publisher in &self.publishers {
            publisher.publish(channel, event.clone()).await?;
        }
        Ok(())
    }

    async fn publish_all(&self, channel: &str, events: Vec<QueueEvent>) -> Result<()> {
        for publisher in &self.publishers {
            publisher.publish_all(channel, events.clone()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::FlushAction;

    #[tokio::test]
    async fn test_logging_publisher() {
        let publisher = LoggingEventPublisher::info_level();
        let event = QueueEvent::dirty("User", 1, FlushAction::Insert, vec![]);

        // Should not panic
        publisher.publish("user_changed", event).await.unwrap();
    }

    #[tokio::test]
    async fn test_in_memory_collector() {
        let collector = InMemoryEventCollector::new();

        assert!(collector.is_empty());

        let event1 = QueueEvent::dirty("User", 1, FlushAction::Insert, vec!["Name".into()]);
        let event2 = QueueEvent::dirty("User", 2, FlushAction::Delete, vec![]);

        collector.publish("a", event1).await.unwrap();
        collector.publish("b", event2).await.unwrap();

        assert_eq!(collector.len(), 2);
        assert_eq!(collector.events_of_type("Dirty").len(), 2);
        assert_eq!(collector.events_on("a").len(), 1);

        let drained = collector.drain_channel("b");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id(), Some(2));
        assert_eq!(collector.len(), 1);

        collector.clear();
        assert!(collector.is_empty());
    }

    #[tokio::test]
    async fn test_composite_publisher() {
        let composite =
            CompositeEventPublisher::new().with_publisher(LoggingEventPublisher::debug_level());

        let event = QueueEvent::dirty("User", 3, FlushAction::Update, vec!["Age".into()]);
        composite.publish("user_changed", event).await.unwrap();
    }
}
