// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! In-process transport.
//!
//! Frames are handed to the peer's subscription list without any
//! serialization of their own. Both ends start connected; closing either
//! end closes both.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;

use crate::errors::TransportError;
use crate::transport::{Transport, TransportEvent, TransportEventReceiver, TransportEvents};

struct Endpoint {
    events: TransportEvents,
    closed: AtomicBool,
    sent: AtomicU64,
}

impl Endpoint {
    fn new() -> Arc<Self> {
        let endpoint = Arc::new(Endpoint {
            events: TransportEvents::new(),
            closed: AtomicBool::new(false),
            sent: AtomicU64::new(0),
        });
        endpoint.events.emit(TransportEvent::Connected);
        endpoint
    }
}

pub struct MemoryTransport {
    local: Arc<Endpoint>,
    peer: Arc<Endpoint>,
}

impl MemoryTransport {
    /// Create a connected pair of in-process transports.
    ///
    /// Returns (A, B) where frames sent on A are received on B and vice versa.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Endpoint::new();
        let b = Endpoint::new();

        (
            Arc::new(MemoryTransport {
                local: a.clone(),
                peer: b.clone(),
            }),
            Arc::new(MemoryTransport { local: b, peer: a }),
        )
    }

    /// Number of frames sent from this end.
    pub fn frames_sent(&self) -> u64 {
        self.local.sent.load(Ordering::Acquire)
    }

    /// Simulate a transport failure observed by both ends.
    pub fn fail(&self, cause: &str) {
        if self.local.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.peer.closed.store(true, Ordering::Release);

        tracing::debug!(%cause, "memory transport failed");
        self.local
            .events
            .emit(TransportEvent::Error(cause.to_string()));
        self.peer
            .events
            .emit(TransportEvent::Error(cause.to_string()));
    }
}

impl Transport for MemoryTransport {
    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.local.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        self.local.sent.fetch_add(1, Ordering::AcqRel);
        self.peer.events.emit(TransportEvent::Message(frame));
        Ok(())
    }

    fn close(&self) {
        if self.local.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.peer.closed.store(true, Ordering::Release);

        self.local.events.emit(TransportEvent::Closed);
        self.peer.events.emit(TransportEvent::Closed);
    }

    fn subscribe(&self) -> TransportEventReceiver {
        self.local.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        !self.local.closed.load(Ordering::Acquire)
    }
}
