//! Named inbound message queues.
//!
//! The receive loop pushes every message onto the queue named by its
//! `target_qname`; application code drains them through [`MessageQueue`]
//! handles. Queues are created on first access and never removed.

use crate::message::Message;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct QueueInner {
    messages: Mutex<VecDeque<Message>>,
    notify: Notify,
}

/// Handle to an unbounded FIFO of received messages.
///
/// Clones refer to the same queue.
#[derive(Debug, Clone, Default)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and wake one waiting consumer.
    pub fn push(&self, message: Message) {
        self.inner
            .messages
            .lock()
            .expect("queue lock poisoned")
            .push_back(message);
        self.inner.notify.notify_one();
    }

    /// Take the oldest message without waiting.
    pub fn try_recv(&self) -> Option<Message> {
        self.inner
            .messages
            .lock()
            .expect("queue lock poisoned")
            .pop_front()
    }

    /// Wait for the next message.
    pub async fn recv(&self) -> Message {
        loop {
            if let Some(message) = self.try_recv() {
                return message;
            }
            // A push between try_recv and here leaves a stored permit, so
            // this does not miss it.
            self.inner.notify.notified().await;
        }
    }

    /// Wait up to `timeout` for the next message.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.recv()).await.ok()
    }

    pub fn len(&self) -> usize {
        self.inner.messages.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether two handles refer to the same queue.
    pub fn same_queue(&self, other: &MessageQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Lazily populated map of queue name to queue.
#[derive(Debug, Default)]
pub struct QueueTable {
    queues: Mutex<HashMap<String, MessageQueue>>,
}

impl QueueTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the queue called `name`, creating it on first use.
    pub fn get(&self, name: &str) -> MessageQueue {
        let mut queues = self.queues.lock().expect("queue table lock poisoned");
        queues.entry(name.to_string()).or_default().clone()
    }

    /// Deliver a message to the queue named by its `target_qname`.
    pub fn deliver(&self, message: Message) {
        let queue = self.get(&message.target_qname);
        queue.push(message);
    }
}
