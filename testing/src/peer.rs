// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! A peer that speaks raw frames over one end of a memory transport, for
//! checking exactly what goes over the wire.

use std::sync::Arc;
use std::time::Duration;

use portrpc::protocol::{Frame, decode_frame, encode_frame};
use portrpc::{MemoryTransport, Transport, TransportEvent, TransportEventReceiver};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RawPeer {
    transport: Arc<MemoryTransport>,
    events: TransportEventReceiver,
}

impl RawPeer {
    /// Returns the peer and the transport end it talks to.
    pub fn pair() -> (Self, Arc<MemoryTransport>) {
        let (local, remote) = MemoryTransport::pair();
        let events = local.subscribe();
        (
            RawPeer {
                transport: local,
                events,
            },
            remote,
        )
    }

    pub fn transport(&self) -> &Arc<MemoryTransport> {
        &self.transport
    }

    /// Send `frame` stamped with message number `number`.
    pub fn send(&self, frame: impl Into<Frame>, number: u32) {
        let frame: Frame = frame.into();
        let frame = frame.stamped(number);
        if let Err(err) = self.transport.send(encode_frame(&frame)) {
            panic!("raw peer send failed: {}", err);
        }
    }

    /// Next frame from the other side. Panics on timeout or when the
    /// transport ends.
    pub async fn recv(&mut self) -> Frame {
        match self.try_recv_within(RECV_TIMEOUT).await {
            Some(frame) => frame,
            None => panic!("no frame received"),
        }
    }

    /// Next frame, or None if nothing arrives within `timeout`.
    pub async fn try_recv_within(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .ok()??;
            match event {
                TransportEvent::Message(bytes) => match decode_frame(&bytes) {
                    Ok(frame) => return Some(frame),
                    Err(err) => panic!("raw peer received an invalid frame: {}", err),
                },
                TransportEvent::Connected => continue,
                TransportEvent::Error(_) | TransportEvent::Closed => return None,
            }
        }
    }

    pub fn close(&self) {
        self.transport.close();
    }
}
