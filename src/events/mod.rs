//! Event system for real-time state notifications
//!
//! Provides a global event bus for broadcasting pipeline state, statistics
//! and rendered frames to the control surface and other subscribers.

pub mod types;

pub use types::{ControlEvent, PipelineKind};

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Global event bus for broadcasting control events
///
/// Uses tokio's broadcast channel to distribute events to multiple
/// subscribers. Publishing is fire-and-forget: with no subscribers the
/// event is dropped.
///
/// # Example
///
/// ```no_run
/// use camstream::events::{ControlEvent, EventBus, PipelineKind};
///
/// let bus = EventBus::new();
///
/// bus.publish(ControlEvent::StatusChanged {
///     pipeline: PipelineKind::Preview,
///     state: "running".to_string(),
///     message: None,
/// });
///
/// let mut rx = bus.subscribe();
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("{:?}", event);
///     }
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<ControlEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers.
    ///
    /// With no active subscribers the event is silently dropped; events are
    /// fire-and-forget notifications.
    pub fn publish(&self, event: ControlEvent) {
        // send returns Err when there are no subscribers, which is normal
        let _ = self.tx.send(event);
    }

    /// Subscribe to all future events.
    ///
    /// The receiver uses a ring buffer; a subscriber that falls too far
    /// behind gets a `Lagged` error and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(ControlEvent::StatusChanged {
            pipeline: PipelineKind::Streaming,
            state: "starting".to_string(),
            message: None,
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ControlEvent::StatusChanged { .. }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(ControlEvent::ErrorOccurred {
            module: "capture".to_string(),
            message: "test".to_string(),
        });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            ControlEvent::ErrorOccurred { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            ControlEvent::ErrorOccurred { .. }
        ));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);

        // Must not panic
        bus.publish(ControlEvent::DeviceList {
            cameras: Vec::new(),
        });
    }
}
