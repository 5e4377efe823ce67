//! In-process event bus
//!
//! Telemetry readers publish here instead of touching the state store, so the
//! feed tasks never take the state lock themselves. Each topic delivers events
//! to its subscribers one publish at a time, in publish order.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::trace;

use crate::device::{Claim, Device};

/// Handler for events of type `E`
#[async_trait]
pub trait Subscriber<E>: Send + Sync {
    /// Handle one event
    async fn handle(&self, event: &E);
}

/// A typed topic with its registered subscribers
pub struct Topic<E> {
    name: &'static str,
    subscribers: RwLock<Vec<Arc<dyn Subscriber<E>>>>,
    /// Held for the whole delivery of one event
    delivery: Mutex<()>,
}

impl<E: Send + Sync> Topic<E> {
    /// Create an empty topic
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: RwLock::new(Vec::new()),
            delivery: Mutex::new(()),
        }
    }

    /// Topic name, used in logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register a subscriber; it receives every event published afterwards
    pub async fn subscribe(&self, subscriber: Arc<dyn Subscriber<E>>) {
        self.subscribers.write().await.push(subscriber);
    }

    /// Number of registered subscribers
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Deliver an event to every subscriber, in registration order
    pub async fn publish(&self, event: E) {
        let _delivery = self.delivery.lock().await;
        let subscribers = self.subscribers.read().await.clone();

        trace!(
            topic = self.name,
            subscribers = subscribers.len(),
            "Publishing event"
        );

        for subscriber in subscribers {
            subscriber.handle(&event).await;
        }
    }
}

/// The daemon's event bus
pub struct EventBus {
    /// Fresh metrics for a device
    pub device_updated: Topic<Device>,
    /// A process (or the absence of one) observed on a device
    pub claim_observed: Topic<Claim>,
}

impl EventBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        Self {
            device_updated: Topic::new("dmon:update"),
            claim_observed: Topic::new("pmon:claim"),
        }
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

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Subscriber<Device> for Recorder {
        async fn handle(&self, event: &Device) {
            // Yield so that a concurrent publisher gets a chance to interleave.
            tokio::task::yield_now().await;
            self.seen.lock().await.push(event.utilization);
        }
    }

    fn sample(utilization: u32) -> Device {
        let mut device = Device::new(0, "GPU-0", "GPU 0");
        device.utilization = utilization;
        device
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        bus.device_updated.subscribe(first.clone()).await;
        bus.device_updated.subscribe(second.clone()).await;

        bus.device_updated.publish(sample(10)).await;

        assert_eq!(*first.seen.lock().await, vec![10]);
        assert_eq!(*second.seen.lock().await, vec![10]);
        assert_eq!(bus.device_updated.subscriber_count().await, 2);
    }

    #[tokio::test]
    async fn test_publish_order_preserved() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.device_updated.subscribe(recorder.clone()).await;

        for utilization in 0..50 {
            bus.device_updated.publish(sample(utilization)).await;
        }

        let seen = recorder.seen.lock().await.clone();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.claim_observed
            .publish(Claim {
                device_number: 0,
                pid: 0,
            })
            .await;
        assert_eq!(bus.claim_observed.name(), "pmon:claim");
    }
}
