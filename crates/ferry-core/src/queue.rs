//! Bounded FIFO for messages sent before the worker confirms startup.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::Message;

/// Default capacity for the pre-ready queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// What to do with a send that would overflow the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the incoming message.
    #[default]
    Reject,
    /// Evict the oldest queued message to make room.
    DropOldest,
}

/// Queue for messages sent before spawn confirmation.
#[derive(Debug)]
pub struct SendQueue {
    queue: VecDeque<Message>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl SendQueue {
    /// Create an empty queue.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
            policy,
        }
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Attempt to enqueue a message.
    ///
    /// At capacity, `Reject` refuses the message with [`Error::QueueFull`];
    /// `DropOldest` evicts the front of the queue to make room.
    pub fn try_enqueue(&mut self, message: Message) -> Result<()> {
        if self.queue.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Reject => {
                    warn!(capacity = self.capacity, "pre-ready queue full, rejecting message");
                    return Err(Error::QueueFull);
                }
                OverflowPolicy::DropOldest => {
                    warn!(
                        capacity = self.capacity,
                        "pre-ready queue full, dropping oldest message"
                    );
                    self.queue.pop_front();
                }
            }
        }
        debug!(queued = self.queue.len() + 1, "queuing message until worker is ready");
        self.queue.push_back(message);
        Ok(())
    }

    /// Drain all queued messages in FIFO order.
    pub fn drain(&mut self) -> impl Iterator<Item = Message> + '_ {
        self.queue.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(i: usize) -> Message {
        Message::new(json!(i))
    }

    #[test]
    fn drain_preserves_order() {
        let mut queue = SendQueue::new(8, OverflowPolicy::Reject);
        for i in 0..5 {
            queue.try_enqueue(message(i)).unwrap();
        }

        let drained: Vec<_> = queue.drain().map(|m| m.data).collect();
        assert_eq!(drained, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn reject_policy_refuses_overflow() {
        let mut queue = SendQueue::new(2, OverflowPolicy::Reject);
        queue.try_enqueue(message(0)).unwrap();
        queue.try_enqueue(message(1)).unwrap();

        assert!(matches!(queue.try_enqueue(message(2)), Err(Error::QueueFull)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drop_oldest_policy_evicts_front() {
        let mut queue = SendQueue::new(2, OverflowPolicy::DropOldest);
        queue.try_enqueue(message(0)).unwrap();
        queue.try_enqueue(message(1)).unwrap();
        queue.try_enqueue(message(2)).unwrap();

        let drained: Vec<_> = queue.drain().map(|m| m.data).collect();
        assert_eq!(drained, vec![json!(1), json!(2)]);
    }
}
