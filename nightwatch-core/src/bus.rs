//! In-process event bus: many-producer / many-consumer, lossy with policy.
//!
//! Topic-based subscription over per-subscriber bounded inboxes. Publish is
//! non-blocking and never fails; when a subscriber's inbox is full the
//! OLDEST entry is dropped and that subscriber's `dropped` counter is
//! incremented (surfaced through health). Delivery order per publisher is
//! preserved. No persistence, no replay.
//!
//! The bus owns the inboxes (rather than handing out broadcast receivers)
//! because overflow accounting is per subscriber: a slow stream-endpoint
//! client must not cost the alert engine a single message.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::events::{Alert, ControlRequest, Event, FusedSignal};

/// Default per-subscriber inbox capacity.
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

/// Bus topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Events,
    Channels,
    Alerts,
    Control,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Events => "events",
            Topic::Channels => "channels",
            Topic::Alerts => "alerts",
            Topic::Control => "control",
        }
    }
}

/// Everything that travels on the bus.
#[derive(Debug, Clone)]
pub enum Message {
    Event(Event),
    Channel(FusedSignal),
    Alert(Alert),
    Control(ControlRequest),
}

struct Inbox {
    buf: Mutex<VecDeque<Message>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Inbox {
    fn push(&self, message: Message) {
        {
            let mut buf = self.buf.lock();
            if buf.len() >= self.capacity {
                buf.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buf.push_back(message);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

struct Entry {
    id: u64,
    topic: Topic,
    label: String,
    inbox: Arc<Inbox>,
}

struct Inner {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

/// The broker. Cheap to clone; all clones share one subscriber registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Deliver `message` to every current subscriber of `topic`.
    ///
    /// Never blocks and never fails; full inboxes drop their oldest entry.
    pub fn publish(&self, topic: Topic, message: Message) {
        let entries = self.inner.entries.lock();
        let mut targets = entries.iter().filter(|e| e.topic == topic).peekable();
        while let Some(entry) = targets.next() {
            if targets.peek().is_some() {
                entry.inbox.push(message.clone());
            } else {
                // Last target takes the original.
                entry.inbox.push(message);
                return;
            }
        }
    }

    /// Open a bounded inbox on `topic`. `label` identifies the subscriber in
    /// health output.
    pub fn subscribe(&self, topic: Topic, label: &str) -> Subscription {
        self.subscribe_with_capacity(topic, label, DEFAULT_INBOX_CAPACITY)
    }

    pub fn subscribe_with_capacity(
        &self,
        topic: Topic,
        label: &str,
        capacity: usize,
    ) -> Subscription {
        let inbox = Arc::new(Inbox {
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.entries.lock().push(Entry {
            id,
            topic,
            label: label.to_string(),
            inbox: Arc::clone(&inbox),
        });
        Subscription {
            inner: Arc::clone(&self.inner),
            inbox,
            id,
        }
    }

    /// Per-subscriber dropped counters, as `(label, dropped)` pairs.
    pub fn dropped_counts(&self) -> Vec<(String, u64)> {
        self.inner
            .entries
            .lock()
            .iter()
            .map(|e| (e.label.clone(), e.inbox.dropped.load(Ordering::Relaxed)))
            .collect()
    }

    /// Close every inbox. Receivers drain what is queued, then see `None`.
    pub fn close(&self) {
        for entry in self.inner.entries.lock().iter() {
            entry.inbox.close();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber handle. Dropping it unsubscribes and drains the inbox.
pub struct Subscription {
    inner: Arc<Inner>,
    inbox: Arc<Inbox>,
    id: u64,
}

impl Subscription {
    /// Receive the next message, waiting if the inbox is empty.
    ///
    /// Returns `None` once the bus is closed and the inbox is drained.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            if let Some(message) = self.inbox.buf.lock().pop_front() {
                return Some(message);
            }
            if self.inbox.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inbox.notify.notified().await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.inbox.buf.lock().pop_front()
    }

    /// Messages this subscriber lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.inbox.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inbox.close();
        let mut entries = self.inner.entries.lock();
        entries.retain(|e| e.id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DetectorId;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn event(sequence: u64) -> Message {
        Message::Event(Event {
            detector: DetectorId::Radar,
            timestamp: sequence as f64,
            sequence,
            session_id: 0,
            state: crate::events::DetectorState::Normal,
            confidence: 1.0,
            values: BTreeMap::new(),
        })
    }

    fn sequence_of(message: &Message) -> u64 {
        match message {
            Message::Event(e) => e.sequence,
            _ => panic!("expected event"),
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Topic::Events, "test");
        for i in 0..5 {
            bus.publish(Topic::Events, event(i));
        }
        for i in 0..5 {
            let got = sub.recv().await.expect("message");
            assert_eq!(sequence_of(&got), i);
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_with_capacity(Topic::Events, "slow", 3);
        for i in 0..7 {
            bus.publish(Topic::Events, event(i));
        }
        assert_eq!(sub.dropped(), 4);
        // Oldest were dropped; the survivors are 4, 5, 6.
        for expected in 4..7 {
            assert_eq!(sequence_of(&sub.recv().await.unwrap()), expected);
        }
        assert_eq!(bus.dropped_counts(), vec![("slow".to_string(), 4)]);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish(Topic::Alerts, event(0));
        // Subscribing afterwards sees nothing (no replay).
        let mut sub = bus.subscribe(Topic::Alerts, "late");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::new();
        let mut events = bus.subscribe(Topic::Events, "ev");
        let mut alerts = bus.subscribe(Topic::Alerts, "al");
        bus.publish(Topic::Events, event(1));
        assert_eq!(sequence_of(&events.recv().await.unwrap()), 1);
        assert!(alerts.try_recv().is_none());
    }

    #[tokio::test]
    async fn close_wakes_pending_receiver_with_none() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Topic::Events, "test");
        let handle = tokio::spawn(async move { sub.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.close();
        let got = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("receiver woke")
            .expect("task join");
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn dropped_subscription_leaves_registry() {
        let bus = EventBus::new();
        let sub = bus.subscribe(Topic::Events, "gone");
        drop(sub);
        assert!(bus.dropped_counts().is_empty());
        // Publishing after unsubscribe must not panic.
        bus.publish(Topic::Events, event(0));
    }
}
