//! Events published by connections and by the client, and the
//! publish/subscribe bus that carries them.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connection::ConnectionId;
use crate::error::Error;
use crate::irc::Message;

/// Events the client publishes to its subscribers (bots, UIs, mixins).
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A connection started its connect sequence.
    Connecting,
    /// A connection established its transport.
    Connect,
    /// A connection completed login.
    Ready,
    /// A connection closed and its channels were resubmitted.
    Reconnect { connection_id: ConnectionId },
    Error(Error),
    /// Terminal. `Some` when the client was destroyed by an error.
    Close(Option<Error>),
    /// Inbound protocol line. `WHISPER` is only forwarded from one connection.
    Message(Arc<Message>),
    /// Outbound line as written to a connection.
    RawCommand(String),
}

/// Events one connection publishes.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connecting,
    Connect,
    Ready,
    Error(Error),
    /// Terminal; published exactly once. `Some` when closed due to an error.
    Close(Option<Error>),
    Message(Arc<Message>),
    RawCommand(String),
}

impl ConnectionEvent {
    pub fn had_error(&self) -> bool {
        matches!(self, ConnectionEvent::Close(Some(_)))
    }
}

/// Ordered, lossless fan-out to any number of subscribers.
///
/// Each subscriber owns an unbounded queue, so a slow reader never makes
/// another miss events. Dropping a [`Subscription`] unsubscribes it;
/// [`EventBus::close_with`] ends every subscription after the events already
/// queued.
pub struct EventBus<E> {
    inner: Mutex<BusState<E>>,
}

struct BusState<E> {
    subscribers: Vec<mpsc::UnboundedSender<E>>,
    closed: bool,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusState {
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        // On a closed bus `tx` is dropped here and the subscription ends at once.
        if !state.closed {
            state.subscribers.push(tx);
        }
        Subscription { rx }
    }

    pub fn publish(&self, event: E) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Publish a final event, then drop every subscriber.
    pub fn close_with(&self, event: E) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        for tx in state.subscribers.drain(..) {
            let _ = tx.send(event.clone());
        }
        state.closed = true;
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of an [`EventBus`] subscription.
pub struct Subscription<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    /// Next event, or `None` once the bus closed and the queue drained.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }
}
