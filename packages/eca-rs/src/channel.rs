//! Topic-keyed publish/subscribe channel with delayed delivery.
//!
//! # Guarantees
//!
//! - **Synchronous delivery**: subscribers run on the publishing thread, in
//!   subscription order. For a fixed subscriber, publish order is delivery order.
//! - **No lock held during delivery**: the subscriber list is snapshotted under
//!   the lock and invoked after releasing it, so a callback may itself subscribe
//!   or unsubscribe without deadlocking the channel.
//! - **Late resolution for delays**: a delayed publish resolves its subscribers
//!   when the timer expires, not when it was scheduled. A subscriber that leaves
//!   during the delay receives nothing.
//!
//! Subscribers are expected to be cheap (the context subscriber only enqueues),
//! because a slow callback blocks the publisher.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::trace;

use crate::error::{EcaError, Result};
use crate::event::Event;

/// Topic used when none is given.
pub const DEFAULT_TOPIC: &str = "message";

/// Topic contexts listen on for rule events.
pub const EVENT_TOPIC: &str = "event";

/// Topic contexts publish `emit` envelopes on.
pub const EMIT_TOPIC: &str = "emit";

/// Callback invoked with `(topic, event)`.
pub type Subscriber = Arc<dyn Fn(&str, &Event) + Send + Sync>;

/// Handle returned by `subscribe`, needed to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct ChannelInner {
    subscriptions: Mutex<HashMap<String, Vec<(SubscriptionId, Subscriber)>>>,
    next_id: AtomicU64,
}

/// Thread-safe publish/subscribe hub.
///
/// Cloning is cheap; clones share subscriptions. Delayed publishes run as
/// timer tasks on the given tokio runtime handle.
#[derive(Clone)]
pub struct PubSubChannel {
    inner: Arc<ChannelInner>,
    timers: Handle,
}

impl PubSubChannel {
    /// Create an empty channel whose delayed publishes run on `timers`.
    pub fn new(timers: Handle) -> Self {
        Self {
            inner: Arc::new(ChannelInner::default()),
            timers,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(SubscriptionId, Subscriber)>>> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe a callback to a topic.
    pub fn subscribe<F>(&self, topic: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber: Subscriber = Arc::new(callback);
        self.lock()
            .entry(topic.into())
            .or_default()
            .push((id, subscriber));
        id
    }

    /// Remove a subscription.
    ///
    /// Fails with [`EcaError::NotSubscribed`] if the subscription is not
    /// registered on this topic.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<()> {
        let mut subscriptions = self.lock();
        let not_subscribed = || EcaError::NotSubscribed {
            topic: topic.to_string(),
        };

        let list = subscriptions.get_mut(topic).ok_or_else(not_subscribed)?;
        let position = list
            .iter()
            .position(|(sub, _)| *sub == id)
            .ok_or_else(not_subscribed)?;
        list.remove(position);
        if list.is_empty() {
            subscriptions.remove(topic);
        }
        Ok(())
    }

    /// Publish an event to every current subscriber of the topic.
    ///
    /// Returns the number of subscribers invoked.
    pub fn publish(&self, topic: &str, event: &Event) -> usize {
        let targets: Vec<Subscriber> = match self.lock().get(topic) {
            Some(list) => list.iter().map(|(_, sub)| sub.clone()).collect(),
            None => Vec::new(),
        };

        trace!(topic, event = %event.name(), subscribers = targets.len(), "publishing");
        for target in &targets {
            target(topic, event);
        }
        targets.len()
    }

    /// Publish after `delay`, resolving subscribers at expiry.
    pub fn publish_after(&self, topic: impl Into<String>, event: Event, delay: Duration) {
        let channel = self.clone();
        let topic = topic.into();
        self.timers.spawn(async move {
            tokio::time::sleep(delay).await;
            channel.publish(&topic, &event);
        });
    }

    /// Publish now when `delay` is `None`, otherwise after the delay.
    pub fn publish_maybe_delayed(&self, topic: &str, event: Event, delay: Option<Duration>) {
        match delay {
            Some(delay) => self.publish_after(topic, event, delay),
            None => {
                self.publish(topic, &event);
            }
        }
    }

    /// Number of subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().get(topic).map_or(0, Vec::len)
    }
}

impl fmt::Debug for PubSubChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics: Vec<String> = self.lock().keys().cloned().collect();
        f.debug_struct("PubSubChannel")
            .field("topics", &topics)
            .finish_non_exhaustive()
    }
}
