//! Process-local, non-blocking event fan-out. Subscribers are invoked in
//! registration order through bounded per-subscriber ring buffers; a slow
//! subscriber loses its oldest buffered event on overflow rather than stall
//! delivery for everyone else.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::trace;

const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
    WorkerStarted,
    WorkerStopped,
    ScalingCompleted,
    ScheduleError,
    Started,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub execution_id: Option<String>,
    pub payload: Value,
}

impl Event {
    pub fn new(kind: EventKind, execution_id: impl Into<Option<String>>, payload: Value) -> Self {
        Self {
            kind,
            execution_id: execution_id.into(),
            payload,
        }
    }
}

struct Mailbox {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
    capacity: usize,
    closed: Mutex<bool>,
}

impl Mailbox {
    fn push(&self, event: Event) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("subscriber buffer full, dropped oldest event");
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }
}

/// A handle returned to a subscriber for receiving events and observing its
/// own overflow counter.
pub struct Subscription {
    mailbox: Arc<Mailbox>,
}

impl Subscription {
    pub fn dropped_count(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }

    /// Waits for the next event, or `None` once the bus is closed and the
    /// mailbox has drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            {
                let mut queue = self.mailbox.queue.lock();
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
                if *self.mailbox.closed.lock() {
                    return None;
                }
            }
            self.mailbox.notify.notified().await;
        }
    }
}

/// Fan-out bus. Registration order is preserved; emission never blocks on a
/// slow subscriber because each subscriber owns a bounded ring buffer.
pub struct EventBus {
    subscribers: Mutex<Vec<Arc<Mailbox>>>,
    buffer_size: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            buffer_size,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let mailbox = Arc::new(Mailbox {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            capacity: self.buffer_size,
            closed: Mutex::new(false),
        });
        self.subscribers.lock().push(mailbox.clone());
        Subscription { mailbox }
    }

    /// Delivers to every subscriber in registration order.
    pub fn emit(&self, event: Event) {
        let subscribers = self.subscribers.lock();
        for mailbox in subscribers.iter() {
            mailbox.push(event.clone());
        }
    }

    /// Closes every subscriber mailbox; `Subscription::recv` drains
    /// remaining events then returns `None`.
    pub fn close(&self) {
        let subscribers = self.subscribers.lock();
        for mailbox in subscribers.iter() {
            *mailbox.closed.lock() = true;
            mailbox.notify.notify_waiters();
        }
    }

    pub fn execution_started(&self, execution_id: impl Into<String>, payload: Value) {
        self.emit(Event::new(EventKind::ExecutionStarted, execution_id.into(), payload));
    }

    pub fn execution_completed(&self, execution_id: impl Into<String>, payload: Value) {
        self.emit(Event::new(EventKind::ExecutionCompleted, execution_id.into(), payload));
    }

    pub fn execution_failed(&self, execution_id: impl Into<String>, payload: Value) {
        self.emit(Event::new(EventKind::ExecutionFailed, execution_id.into(), payload));
    }

    pub fn execution_cancelled(&self, execution_id: impl Into<String>, payload: Value) {
        self.emit(Event::new(EventKind::ExecutionCancelled, execution_id.into(), payload));
    }

    pub fn worker_started(&self, worker_id: impl Into<String>) {
        self.emit(Event::new(
            EventKind::WorkerStarted,
            None,
            serde_json::json!({"workerId": worker_id.into()}),
        ));
    }

    pub fn worker_stopped(&self, worker_id: impl Into<String>) {
        self.emit(Event::new(
            EventKind::WorkerStopped,
            None,
            serde_json::json!({"workerId": worker_id.into()}),
        ));
    }

    pub fn scaling_completed(&self, payload: Value) {
        self.emit(Event::new(EventKind::ScalingCompleted, None, payload));
    }

    pub fn schedule_error(&self, schedule_id: impl Into<String>, message: impl Into<String>) {
        self.emit(Event::new(
            EventKind::ScheduleError,
            None,
            serde_json::json!({"scheduleId": schedule_id.into(), "message": message.into()}),
        ));
    }

    pub fn started(&self) {
        self.emit(Event::new(EventKind::Started, None, Value::Null));
    }

    pub fn stopped(&self) {
        self.emit(Event::new(EventKind::Stopped, None, Value::Null));
    }
}

pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe();
        bus.execution_started("exec-1", serde_json::json!({}));
        bus.execution_completed("exec-1", serde_json::json!({}));
        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::ExecutionStarted);
        assert_eq!(second.kind, EventKind::ExecutionCompleted);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_increments_counter() {
        let bus = EventBus::new(1);
        let mut sub = bus.subscribe();
        bus.execution_started("exec-1", serde_json::json!({}));
        bus.execution_started("exec-2", serde_json::json!({}));
        assert_eq!(sub.dropped_count(), 1);
        let remaining = sub.recv().await.unwrap();
        assert_eq!(remaining.execution_id.as_deref(), Some("exec-2"));
    }

    #[tokio::test]
    async fn close_drains_then_ends_stream() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe();
        bus.execution_started("exec-1", serde_json::json!({}));
        bus.close();
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(8);
        bus.execution_started("exec-1", serde_json::json!({}));
    }
}
