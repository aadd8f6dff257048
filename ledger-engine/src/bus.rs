//! In-process event bus
//!
//! Delivery is at-least-once and in sequence order per subscriber. A
//! subscriber's position advances only after its handler returns `Ok`;
//! a subscriber that failed or fell behind is skipped by `publish` and
//! brought forward from the event store by `catch_up`.

use crate::{event::Event, event_store::EventStore, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Consumer of the ordered event stream
///
/// Handlers must be idempotent: the same event can be delivered more than
/// once after a failure or restart.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Stable identifier used to track the read position
    fn id(&self) -> &str;

    /// Handle one event
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Result of one `publish`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that accepted the event
    pub delivered: usize,
    /// Subscribers whose handler failed
    pub failed: usize,
    /// Subscribers behind the event, waiting for catch-up
    pub lagging: usize,
}

/// Fan-out to registered subscribers
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
    positions: DashMap<String, u64>,
}

impl EventBus {
    /// Empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber starting from the beginning of the log
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribe_from(subscriber, 0);
    }

    /// Register a subscriber that has already seen everything up to `position`
    pub fn subscribe_from(&self, subscriber: Arc<dyn EventSubscriber>, position: u64) {
        let id = subscriber.id().to_string();
        self.positions.insert(id.clone(), position);
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|existing| existing.id() != id);
        subscribers.push(subscriber);
        tracing::info!(subscriber = %id, position, "Subscriber registered");
    }

    /// Last sequence delivered to a subscriber
    pub fn position(&self, id: &str) -> Option<u64> {
        self.positions.get(id).map(|p| *p)
    }

    /// Number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn snapshot_subscribers(&self) -> Vec<Arc<dyn EventSubscriber>> {
        self.subscribers.read().clone()
    }

    async fn deliver(&self, subscriber: &dyn EventSubscriber, event: &Event) -> Result<()> {
        subscriber.handle(event).await?;
        self.positions
            .insert(subscriber.id().to_string(), event.sequence);
        Ok(())
    }

    /// Deliver an event to every subscriber positioned right before it
    pub async fn publish(&self, event: &Event) -> PublishReport {
        let mut report = PublishReport::default();

        for subscriber in self.snapshot_subscribers() {
            let position = self.position(subscriber.id()).unwrap_or(0);
            if position >= event.sequence {
                continue;
            }
            if position + 1 < event.sequence {
                report.lagging += 1;
                continue;
            }

            match self.deliver(subscriber.as_ref(), event).await {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        subscriber = subscriber.id(),
                        event_id = %event.id,
                        sequence = event.sequence,
                        error = %err,
                        "Subscriber failed to handle event"
                    );
                }
            }
        }

        report
    }

    /// Redeliver from each subscriber's position up to the end of the store
    ///
    /// Returns the number of events delivered. A subscriber that fails is
    /// left at its last good position.
    pub async fn catch_up(&self, store: &dyn EventStore) -> Result<usize> {
        self.catch_up_until(store, u64::MAX).await
    }

    /// Like [`catch_up`](Self::catch_up) but stops after sequence `until`
    pub async fn catch_up_until(&self, store: &dyn EventStore, until: u64) -> Result<usize> {
        let mut delivered = 0;

        for subscriber in self.snapshot_subscribers() {
            let mut position = self.position(subscriber.id()).unwrap_or(0);

            'pages: while position < until {
                let page = store.load(position, 0)?;
                if page.is_empty() {
                    break;
                }
                for event in &page {
                    if event.sequence > until {
                        break 'pages;
                    }
                    if let Err(err) = self.deliver(subscriber.as_ref(), event).await {
                        tracing::warn!(
                            subscriber = subscriber.id(),
                            sequence = event.sequence,
                            error = %err,
                            "Catch-up stopped for subscriber"
                        );
                        break 'pages;
                    }
                    position = event.sequence;
                    delivered += 1;
                }
            }
        }

        Ok(delivered)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
