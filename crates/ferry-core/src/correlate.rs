//! Token-based request/response correlation over a shared message stream.
//!
//! Where a single event stream multiplexes many logically distinct requests,
//! [`CorrelationBus`] filters listeners by correlation token. Listener
//! semantics differ deliberately:
//!
//! - [`CorrelationBus::on`] ignores non-matching messages.
//! - [`CorrelationBus::once`] re-arms itself on a non-match without
//!   consuming or forwarding the message.
//! - [`CorrelationBus::invoke`] waiters consume a non-matching message but
//!   rebroadcast it so another waiter can claim it; the spent waiter's
//!   caller stays pending.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::Message;

type OnFn = Box<dyn FnMut(Message) + Send>;
type OnceFn = Box<dyn FnOnce(Message) + Send>;

enum Listener {
    /// Fires on every token match.
    Persistent { token: u64, callback: OnFn },
    /// Fires once on a token match; re-arms at the back of the list on a
    /// non-match.
    Once { token: u64, callback: OnceFn },
    /// One-shot invoke waiter.
    Waiter {
        token: u64,
        id: u64,
        resolver: oneshot::Sender<Value>,
    },
}

#[derive(Default)]
struct BusState {
    events: HashMap<String, Vec<Listener>>,
    next_waiter_id: u64,
    /// Spent waiters that consumed a non-matching message. Their callers'
    /// futures stay pending, so the senders are parked rather than dropped.
    #[allow(dead_code)]
    orphans: Vec<oneshot::Sender<Value>>,
}

/// Token-filtered fan-out bus over named events.
#[derive(Clone, Default)]
pub struct CorrelationBus {
    state: Arc<Mutex<BusState>>,
}

impl CorrelationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broadcast a message to every listener registered on `event`.
    pub fn send(&self, event: &str, message: Message) {
        self.deliver(event, message, None);
    }

    /// Register a persistent listener for messages whose token matches.
    /// Non-matching messages are ignored, not re-queued.
    pub fn on<F>(&self, event: impl Into<String>, token: u64, listener: F)
    where
        F: FnMut(Message) + Send + 'static,
    {
        let mut state = self.state.lock().unwrap();
        state
            .events
            .entry(event.into())
            .or_default()
            .push(Listener::Persistent {
                token,
                callback: Box::new(listener),
            });
    }

    /// Register a one-shot listener for the first message whose token
    /// matches. A non-matching message re-arms the listener instead of
    /// consuming it.
    pub fn once<F>(&self, event: impl Into<String>, token: u64, listener: F)
    where
        F: FnOnce(Message) + Send + 'static,
    {
        let mut state = self.state.lock().unwrap();
        state
            .events
            .entry(event.into())
            .or_default()
            .push(Listener::Once {
                token,
                callback: Box::new(listener),
            });
    }

    /// Send `message` on `event` and wait for the reply carrying `token`.
    ///
    /// The initiating broadcast is not delivered to this call's own waiter,
    /// so a request carrying its own correlation token cannot resolve
    /// itself. There is no timeout; a reply that never arrives leaves the
    /// caller pending.
    pub async fn invoke(&self, event: &str, token: u64, message: Message) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state
                .events
                .entry(event.to_string())
                .or_default()
                .push(Listener::Waiter {
                    token,
                    id,
                    resolver: tx,
                });
            id
        };

        self.deliver(event, message, Some(id));

        rx.await.map_err(|_| Error::ChannelClosed)
    }

    fn deliver(&self, event: &str, message: Message, skip_waiter: Option<u64>) {
        let mut passes: VecDeque<Message> = VecDeque::from([message]);
        while let Some(message) = passes.pop_front() {
            // Snapshot the listener list so callbacks run without the lock;
            // listeners registered during the pass are merged back after.
            let listeners = {
                let mut state = self.state.lock().unwrap();
                state.events.remove(event).unwrap_or_default()
            };

            let mut kept: Vec<Listener> = Vec::with_capacity(listeners.len());
            let mut rearmed: Vec<Listener> = Vec::new();
            let mut rebroadcast = false;

            for listener in listeners {
                match listener {
                    Listener::Persistent { token, mut callback } => {
                        if message.token == Some(token) {
                            callback(message.clone());
                        }
                        kept.push(Listener::Persistent { token, callback });
                    }
                    Listener::Once { token, callback } => {
                        if message.token == Some(token) {
                            callback(message.clone());
                        } else {
                            rearmed.push(Listener::Once { token, callback });
                        }
                    }
                    Listener::Waiter { token, id, resolver } => {
                        if skip_waiter == Some(id) {
                            kept.push(Listener::Waiter { token, id, resolver });
                        } else if message.token == Some(token) {
                            let _ = resolver.send(message.data.clone());
                        } else {
                            // Spent without a match: rebroadcast so another
                            // waiter can claim the message.
                            rebroadcast = true;
                            self.state.lock().unwrap().orphans.push(resolver);
                        }
                    }
                }
            }

            {
                let mut state = self.state.lock().unwrap();
                let registered_meanwhile = state.events.remove(event).unwrap_or_default();
                kept.extend(rearmed);
                kept.extend(registered_meanwhile);
                if !kept.is_empty() {
                    state.events.insert(event.to_string(), kept);
                }
            }

            if rebroadcast {
                trace!(event, "rebroadcasting unclaimed message");
                passes.push_back(message);
            }
        }
    }
}
