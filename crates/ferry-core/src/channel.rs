//! Duplex message channel connecting two endpoints.
//!
//! [`pair`] creates two connected endpoints. Each endpoint can send to its
//! peer, subscribe to inbound messages, and start delivery. Messages that
//! arrive before [`Endpoint::start`] are held by the transport and delivered,
//! in send order, once delivery begins. Delivery is FIFO per direction; no
//! ordering is guaranteed across directions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::Message;

/// Capacity of the per-endpoint subscriber fan-out.
const FANOUT_CAPACITY: usize = 1024;

struct Inner {
    /// Writes into the peer's inbox.
    to_peer: mpsc::UnboundedSender<Message>,
    /// Own inbox; consumed by the delivery pump on `start()`.
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    /// Fan-out of delivered messages to subscribers.
    fanout: broadcast::Sender<Message>,
    /// Set once delivery has begun.
    started: AtomicBool,
}

/// One side of a duplex channel.
///
/// Cloning yields another handle to the same endpoint, not a new endpoint;
/// an endpoint cannot be rebound to a different channel.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

/// Create a connected endpoint pair.
pub fn pair() -> (Endpoint, Endpoint) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    let (fan_a, _) = broadcast::channel(FANOUT_CAPACITY);
    let (fan_b, _) = broadcast::channel(FANOUT_CAPACITY);

    let a = Endpoint {
        inner: Arc::new(Inner {
            to_peer: tx_b,
            inbox: Mutex::new(Some(rx_a)),
            fanout: fan_a,
            started: AtomicBool::new(false),
        }),
    };
    let b = Endpoint {
        inner: Arc::new(Inner {
            to_peer: tx_a,
            inbox: Mutex::new(Some(rx_b)),
            fanout: fan_b,
            started: AtomicBool::new(false),
        }),
    };
    (a, b)
}

impl Endpoint {
    /// Send a message to the peer endpoint. Fire-and-forget: there is no
    /// acknowledgment, and delivery depends on the peer starting.
    pub fn send(&self, message: Message) -> Result<()> {
        self.inner
            .to_peer
            .send(message)
            .map_err(|_| Error::ChannelClosed)
    }

    /// Subscribe to inbound messages. Only messages delivered after
    /// [`Endpoint::start`] reach subscribers.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inner.fanout.subscribe()
    }

    /// Begin delivering inbound messages to subscribers.
    ///
    /// Idempotent. Messages the peer sent before this call are delivered
    /// first, in send order.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let rx = self.inner.inbox.lock().unwrap().take();
        let Some(mut rx) = rx else { return };

        let fanout = self.inner.fanout.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                trace!(token = ?message.token, "delivering channel message");
                // A send with no live subscribers is dropped, like any
                // fire-and-forget delivery.
                let _ = fanout.send(message);
            }
        });
    }

    /// Detach the raw inbound queue, bypassing subscriber fan-out.
    ///
    /// Used by transport bridges that need loss-free single-consumer
    /// delivery. The endpoint counts as started afterwards; `start()`
    /// becomes a no-op. Returns `None` if delivery has already begun.
    pub fn take_inbox(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.inner.inbox.lock().unwrap().take()
    }

    /// Whether delivery has begun on this endpoint.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let (a, b) = pair();
        let mut rx = b.subscribe();
        b.start();

        for i in 0..50 {
            a.send(Message::new(json!(i))).unwrap();
        }
        for i in 0..50 {
            let message = rx.recv().await.unwrap();
            assert_eq!(message.data, json!(i));
        }
    }

    #[tokio::test]
    async fn holds_messages_until_started() {
        let (a, b) = pair();

        a.send(Message::new(json!("early-1"))).unwrap();
        a.send(Message::new(json!("early-2"))).unwrap();

        let mut rx = b.subscribe();
        assert!(!b.is_started());
        b.start();

        assert_eq!(rx.recv().await.unwrap().data, json!("early-1"));
        assert_eq!(rx.recv().await.unwrap().data, json!("early-2"));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (a, b) = pair();
        let mut rx = b.subscribe();
        b.start();
        b.start();

        a.send(Message::new(json!("once"))).unwrap();
        assert_eq!(rx.recv().await.unwrap().data, json!("once"));
    }

    #[tokio::test]
    async fn both_directions_are_independent() {
        let (a, b) = pair();
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();
        a.start();
        b.start();

        a.send(Message::new(json!("to-b"))).unwrap();
        b.send(Message::new(json!("to-a"))).unwrap();

        assert_eq!(rx_b.recv().await.unwrap().data, json!("to-b"));
        assert_eq!(rx_a.recv().await.unwrap().data, json!("to-a"));
    }

    #[tokio::test]
    async fn send_fails_once_peer_inbox_is_gone() {
        let (a, b) = pair();
        let rx = b.take_inbox().unwrap();
        drop(rx);

        assert!(matches!(
            a.send(Message::new(json!(1))),
            Err(Error::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn take_inbox_consumes_buffered_messages() {
        let (a, b) = pair();
        a.send(Message::new(json!(1))).unwrap();
        a.send(Message::new(json!(2))).unwrap();

        let mut rx = b.take_inbox().unwrap();
        assert_eq!(rx.recv().await.unwrap().data, json!(1));
        assert_eq!(rx.recv().await.unwrap().data, json!(2));
        assert!(b.take_inbox().is_none());
    }
}
