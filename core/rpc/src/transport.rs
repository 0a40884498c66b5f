// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Transport boundary
//!
//! A transport moves opaque byte frames in both directions. It is consumed
//! by the dispatcher through two capabilities: a fire-and-forget `send`
//! and a subscription to its notifications (connected, message, error,
//! closed). Concrete transports live outside the runtime; `memory` holds
//! the in-process loop used by tests and embedders.

pub mod memory;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::errors::TransportError;

/// Notification emitted by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Message(Bytes),
    Error(String),
    Closed,
}

impl TransportEvent {
    /// Error and Closed end the event sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportEvent::Error(_) | TransportEvent::Closed)
    }
}

pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub trait Transport: Send + Sync + 'static {
    /// Send one frame. Returns once the frame is handed to the transport;
    /// delivery is not acknowledged.
    fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the transport. Closing twice is a no-op.
    fn close(&self);

    /// Register a new subscriber for the transport notifications.
    fn subscribe(&self) -> TransportEventReceiver;

    fn is_connected(&self) -> bool;
}

#[derive(Default)]
struct EventsInner {
    subscribers: Vec<mpsc::UnboundedSender<TransportEvent>>,
    /// events emitted while nobody was listening
    backlog: Vec<TransportEvent>,
    /// terminal event, replayed to late subscribers
    terminal: Option<TransportEvent>,
}

/// Subscription list helper for transport implementations.
///
/// Events emitted before the first subscriber registers are kept and
/// replayed to it, so a transport can be created (and even receive frames)
/// before anyone attaches to it.
#[derive(Default)]
pub struct TransportEvents {
    inner: Mutex<EventsInner>,
}

impl TransportEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> TransportEventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();

        for event in inner.backlog.drain(..) {
            let _ = tx.send(event);
        }

        match &inner.terminal {
            Some(terminal) => {
                let _ = tx.send(terminal.clone());
            }
            None => inner.subscribers.push(tx),
        }

        rx
    }

    pub fn emit(&self, event: TransportEvent) {
        let mut inner = self.inner.lock();
        if inner.terminal.is_some() {
            tracing::trace!(?event, "dropping transport event after termination");
            return;
        }

        if event.is_terminal() {
            inner.terminal = Some(event.clone());
        }

        if inner.subscribers.is_empty() {
            if !event.is_terminal() {
                inner.backlog.push(event);
            }
            return;
        }

        inner
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());

        if inner.terminal.is_some() {
            // dropping the senders ends every subscription
            inner.subscribers.clear();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}
