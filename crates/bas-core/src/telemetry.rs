// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Telemetry Hub: in-process pub/sub for execution and page events.
//!
//! Publishing fans an event out synchronously to every matching subscriber
//! while holding the subscriber list's read lock, so events for one
//! execution reach each subscriber in publish order. Each queue subscriber
//! owns a bounded queue; when it is full the oldest event is dropped and the
//! subscriber's `lagged` counter increments. Sink subscribers are plain
//! callbacks; a panicking sink is isolated and does not affect delivery to
//! others.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use tokio::sync::Notify;
use tracing::warn;

/// Default per-subscriber queue bound.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Telemetry event types.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    StepStarted,
    StepCompleted,
    StepFailed,
    ExecutionStatusChanged,
    PageCreated,
    PageNavigated,
    PageClosed,
    PageSwitched,
    RecordingAction,
}

/// One event as delivered to subscribers and WebSocket clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Execution id, or the recording session id for record-mode events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

impl TelemetryEvent {
    /// Event stamped now.
    pub fn new(event_type: EventType, execution_id: Option<String>, payload: Value) -> Self {
        Self {
            event_type,
            execution_id,
            payload,
            ts: Utc::now(),
        }
    }
}

/// Which events a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SubscriptionFilter {
    /// Every event.
    #[default]
    All,
    /// Only events whose `execution_id` matches.
    Execution(String),
}

impl SubscriptionFilter {
    fn matches(&self, event: &TelemetryEvent) -> bool {
        match self {
            Self::All => true,
            Self::Execution(id) => event.execution_id.as_deref() == Some(id.as_str()),
        }
    }
}

impl From<Option<String>> for SubscriptionFilter {
    fn from(id: Option<String>) -> Self {
        match id {
            Some(id) if !id.is_empty() => Self::Execution(id),
            _ => Self::All,
        }
    }
}

/// Callback subscriber.
pub type EventSink = Arc<dyn Fn(&TelemetryEvent) + Send + Sync>;

struct SubscriberQueue {
    events: Mutex<VecDeque<TelemetryEvent>>,
    capacity: usize,
    lagged: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl SubscriberQueue {
    fn push(&self, event: TelemetryEvent) {
        {
            let mut events = match self.events.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if events.len() >= self.capacity {
                events.pop_front();
                self.lagged.fetch_add(1, Ordering::Relaxed);
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<TelemetryEvent> {
        match self.events.lock() {
            Ok(mut guard) => guard.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

enum Subscriber {
    Queue(Arc<SubscriberQueue>),
    Sink(EventSink),
}

struct Entry {
    filter: SubscriptionFilter,
    subscriber: Subscriber,
}

struct HubInner {
    subscribers: RwLock<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    published: AtomicU64,
    sink_panics: AtomicU64,
    capacity: usize,
}

/// Process-wide telemetry hub. Cheap to clone.
#[derive(Clone)]
pub struct TelemetryHub {
    inner: Arc<HubInner>,
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryHub {
    /// Hub with the default queue bound.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Hub with a custom per-subscriber queue bound.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                sink_panics: AtomicU64::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Subscribe with a bounded queue.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            events: Mutex::new(VecDeque::new()),
            capacity: self.inner.capacity,
            lagged: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        });
        let id = self.insert(filter, Subscriber::Queue(queue.clone()));
        Subscription {
            id,
            queue,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe a callback. Returns an id for [`TelemetryHub::unsubscribe`].
    pub fn subscribe_sink(&self, filter: SubscriptionFilter, sink: EventSink) -> u64 {
        self.insert(filter, Subscriber::Sink(sink))
    }

    /// Remove a subscriber.
    pub fn unsubscribe(&self, id: u64) {
        remove_subscriber(&self.inner, id);
    }

    fn insert(&self, filter: SubscriptionFilter, subscriber: Subscriber) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = match self.inner.subscribers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.insert(id, Entry { filter, subscriber });
        id
    }

    /// Deliver an event to every matching subscriber.
    pub fn publish(&self, event: TelemetryEvent) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        let subscribers = match self.inner.subscribers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (id, entry) in subscribers.iter() {
            if !entry.filter.matches(&event) {
                continue;
            }
            match &entry.subscriber {
                Subscriber::Queue(queue) => queue.push(event.clone()),
                Subscriber::Sink(sink) => {
                    if catch_unwind(AssertUnwindSafe(|| sink(&event))).is_err() {
                        self.inner.sink_panics.fetch_add(1, Ordering::Relaxed);
                        warn!(subscriber = id, event_type = %event.event_type, "Telemetry sink panicked");
                    }
                }
            }
        }
    }

    /// Convenience wrapper around [`TelemetryHub::publish`].
    pub fn emit(&self, event_type: EventType, execution_id: Option<String>, payload: Value) {
        self.publish(TelemetryEvent::new(event_type, execution_id, payload));
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .map(|s| s.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    /// Total events published.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Total sink deliveries that panicked.
    pub fn sink_panic_count(&self) -> u64 {
        self.inner.sink_panics.load(Ordering::Relaxed)
    }
}

fn remove_subscriber(inner: &HubInner, id: u64) {
    let removed = match inner.subscribers.write() {
        Ok(mut guard) => guard.remove(&id),
        Err(poisoned) => poisoned.into_inner().remove(&id),
    };
    if let Some(Entry {
        subscriber: Subscriber::Queue(queue),
        ..
    }) = removed
    {
        queue.close();
    }
}

/// A queue subscription. Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    hub: Weak<HubInner>,
}

impl Subscription {
    /// Subscriber id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event; `None` once unsubscribed and drained.
    pub async fn recv(&self) -> Option<TelemetryEvent> {
        loop {
            let notified = self.queue.notify.notified();
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    /// Next event if one is queued.
    pub fn try_recv(&self) -> Option<TelemetryEvent> {
        self.queue.pop()
    }

    /// Events dropped because the queue was full.
    pub fn lagged(&self) -> u64 {
        self.queue.lagged.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            remove_subscriber(&inner, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn event(execution: &str, n: u64) -> TelemetryEvent {
        TelemetryEvent::new(
            EventType::StepCompleted,
            Some(execution.to_string()),
            json!({"n": n}),
        )
    }

    fn n(event: &TelemetryEvent) -> u64 {
        event.payload["n"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_delivery_preserves_order() {
        let hub = TelemetryHub::new();
        let sub = hub.subscribe(SubscriptionFilter::All);
        for i in 0..10 {
            hub.publish(event("e1", i));
        }
        for i in 0..10 {
            assert_eq!(n(&sub.recv().await.unwrap()), i);
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_filter_by_execution() {
        let hub = TelemetryHub::new();
        let only_a = hub.subscribe(SubscriptionFilter::Execution("a".to_string()));
        let global = hub.subscribe(None.into());

        hub.publish(event("a", 1));
        hub.publish(event("b", 2));

        assert_eq!(n(&only_a.recv().await.unwrap()), 1);
        assert!(only_a.try_recv().is_none());
        assert_eq!(n(&global.recv().await.unwrap()), 1);
        assert_eq!(n(&global.recv().await.unwrap()), 2);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let hub = TelemetryHub::with_capacity(3);
        let sub = hub.subscribe(SubscriptionFilter::All);
        for i in 0..5 {
            hub.publish(event("e", i));
        }
        assert_eq!(sub.lagged(), 2);
        let delivered: Vec<u64> = std::iter::from_fn(|| sub.try_recv()).map(|e| n(&e)).collect();
        assert_eq!(delivered, vec![2, 3, 4]);
    }

    #[test]
    fn test_sink_panic_is_isolated() {
        let hub = TelemetryHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        hub.subscribe_sink(
            SubscriptionFilter::All,
            Arc::new(|_event: &TelemetryEvent| panic!("bad subscriber")),
        );
        let seen_clone = seen.clone();
        hub.subscribe_sink(
            SubscriptionFilter::All,
            Arc::new(move |event: &TelemetryEvent| {
                seen_clone.lock().unwrap().push(n(event));
            }),
        );

        hub.publish(event("e", 1));
        hub.publish(event("e", 2));

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(hub.sink_panic_count(), 2);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let hub = TelemetryHub::new();
        let sub = hub.subscribe(SubscriptionFilter::All);
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let hub = TelemetryHub::new();
        let sub = hub.subscribe(SubscriptionFilter::All);
        let publisher = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(event("e", 7));
        });
        let received = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n(&received), 7);
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_unsubscribe() {
        let hub = TelemetryHub::new();
        let sub = hub.subscribe(SubscriptionFilter::All);
        hub.publish(event("e", 1));
        hub.unsubscribe(sub.id());
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_event_wire_shape() {
        let value = serde_json::to_value(event("e1", 1)).unwrap();
        assert_eq!(value["type"], json!("step_completed"));
        assert_eq!(value["execution_id"], json!("e1"));
        assert!(value.get("ts").is_some());
    }
}
