//! In-process publish/subscribe router
//!
//! Every subscriber owns a bounded queue. Publishing never waits: when a
//! queue is full its oldest event is discarded and counted. Events are
//! enqueued for all matching subscribers under one lock, so subscribers of
//! the same session observe the same relative order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{Event, EventKind};

/// Default per-subscriber queue size
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Callback invoked for every delivered event
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

// ============================================================================
// Filters
// ============================================================================

/// Which events a subscription receives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// `None` matches every session
    pub session_id: Option<String>,
    /// `None` matches every kind
    pub kind: Option<EventKind>,
}

impl Filter {
    /// Everything, from every session
    pub fn all() -> Self {
        Self::default()
    }

    /// Every event of one session
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            kind: None,
        }
    }

    /// Narrow to a single kind
    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    fn matches(&self, event: &Event) -> bool {
        self.session_id
            .as_deref()
            .map_or(true, |id| id == event.session_id)
            && self.kind.map_or(true, |kind| kind == event.kind())
    }
}

// ============================================================================
// Queues
// ============================================================================

struct QueueState {
    events: VecDeque<Event>,
    closed: bool,
}

struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    dropped: AtomicU64,
    capacity: usize,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            capacity,
        }
    }

    /// Enqueue, evicting the oldest event when full. Returns true on eviction.
    fn push(&self, event: Event) -> bool {
        let evicted = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            let evicted = if state.events.len() >= self.capacity {
                state.events.pop_front();
                true
            } else {
                false
            };
            state.events.push_back(event);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }
}

struct Slot {
    id: u64,
    filter: Filter,
    queue: Arc<SubscriberQueue>,
}

struct BusInner {
    slots: Mutex<Vec<Slot>>,
    next_id: AtomicU64,
    dropped_total: AtomicU64,
    capacity: usize,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().drain(..) {
            slot.queue.close();
        }
    }
}

impl BusInner {
    fn remove(&self, id: u64) {
        let mut slots = self.slots.lock();
        if let Some(pos) = slots.iter().position(|slot| slot.id == id) {
            let slot = slots.swap_remove(pos);
            slot.queue.close();
        }
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Multi-subscriber event router keyed by session id and event kind
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a bus whose subscribers buffer at most `capacity` events each
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                slots: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                dropped_total: AtomicU64::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Deliver an event to every matching subscriber without waiting
    pub fn publish(&self, event: Event) {
        let slots = self.inner.slots.lock();
        let mut matched = 0usize;
        for slot in slots.iter().filter(|slot| slot.filter.matches(&event)) {
            matched += 1;
            if slot.queue.push(event.clone()) {
                self.inner.dropped_total.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    session_id = %event.session_id,
                    subscriber = slot.id,
                    "Subscriber queue full, dropped oldest event"
                );
            }
        }
        tracing::trace!(
            session_id = %event.session_id,
            kind = %event.kind(),
            subscribers = matched,
            "Published event"
        );
    }

    /// Pull-style subscription; unsubscribes when dropped
    pub fn stream(&self, filter: Filter) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(self.inner.capacity));
        self.inner.slots.lock().push(Slot {
            id,
            filter,
            queue: queue.clone(),
        });
        Subscription {
            id,
            queue,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Invoke `callback` for every event of `kind` in `session_id`
    pub fn subscribe(
        &self,
        kind: EventKind,
        session_id: &str,
        callback: EventCallback,
    ) -> CallbackSubscription {
        self.spawn_delivery(Filter::session(session_id).kind(kind), callback)
    }

    /// Invoke `callback` for every event in `session_id`
    pub fn subscribe_all(&self, session_id: &str, callback: EventCallback) -> CallbackSubscription {
        self.spawn_delivery(Filter::session(session_id), callback)
    }

    fn spawn_delivery(&self, filter: Filter, callback: EventCallback) -> CallbackSubscription {
        let mut subscription = self.stream(filter);
        let id = subscription.id;
        let queue = subscription.queue.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                callback(event);
            }
        });
        CallbackSubscription {
            id,
            queue,
            bus: Arc::downgrade(&self.inner),
            task: Some(task),
        }
    }

    /// End every subscription bound to `session_id`.
    ///
    /// Receivers drain what is already queued and then yield `None`.
    pub fn close_session(&self, session_id: &str) {
        let mut slots = self.inner.slots.lock();
        slots.retain(|slot| {
            let bound = slot.filter.session_id.as_deref() == Some(session_id);
            if bound {
                slot.queue.close();
            }
            !bound
        });
    }

    /// Events discarded across all subscribers since creation
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.slots.lock().len()
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Receiving end of a subscription
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Next event, or `None` once the subscription is closed and drained
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            {
                let mut state = self.queue.state.lock();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Next queued event without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        self.queue.state.lock().events.pop_front()
    }

    /// Events this subscriber lost to overflow
    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

/// Handle for a callback subscription; unsubscribes when dropped
pub struct CallbackSubscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    bus: Weak<BusInner>,
    task: Option<JoinHandle<()>>,
}

impl CallbackSubscription {
    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Stop receiving events; already queued events are still delivered
    pub fn unsubscribe(self) {}

    /// Unsubscribe and wait until every queued event has been delivered
    pub async fn finish(mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CallbackSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}
