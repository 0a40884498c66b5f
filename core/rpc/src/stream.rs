// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Acknowledged streams
//!
//! A stream is a sequence of payload frames sharing one message number.
//! Sequence id 0 is the offer; elements are numbered from 1. The producer
//! sends element k+1 only after the consumer acknowledged k, so at most one
//! element is in flight. Either side ends the stream with a Closed frame
//! carrying the last sequence id it saw.
//!
//! ```text
//!   producer                         consumer
//!      │ ── offer (seq 0) ───────────► │   Offer
//!      │ ◄──────────── ack (seq 0) ─── │   AckWait -> Streaming
//!      │ ── element (seq 1) ─────────► │
//!      │ ◄──────────── ack (seq 1) ─── │
//!      │            ...                │
//!      │ ── closed (seq n) ──────────► │   Closed
//! ```

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{MessageDispatcher, StreamRoute, StreamWaiter};
use crate::errors::{Result, RpcError};
use crate::protocol::{Frame, StreamMessage};

/// Outbound payload source driven by a producer.
pub type PayloadStream = BoxStream<'static, Result<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// The offer is outstanding; nothing was acknowledged yet.
    Offer,
    /// Ready to acknowledge and request the next element.
    AckWait,
    /// An ack is out and the next frame is awaited.
    Streaming,
    Closed,
}

/// Receiving half of a stream.
///
/// Polling requests elements one by one: the ack for the previous element
/// is sent only when the next one is asked for. Dropping the consumer
/// closes the stream unless the remote side already did.
pub struct StreamConsumer {
    dispatcher: MessageDispatcher,
    route: StreamRoute,
    port_id: u32,
    state: StreamState,
    last_sequence: u32,
    remote_closed: bool,
}

impl StreamConsumer {
    /// Consumer for a stream whose offer is still to come.
    pub fn awaiting_offer(dispatcher: MessageDispatcher, route: StreamRoute, port_id: u32) -> Self {
        Self::with_state(dispatcher, route, port_id, StreamState::Offer)
    }

    /// Consumer for a stream already offered, e.g. by the number embedded
    /// in a Request.
    pub fn offered(dispatcher: MessageDispatcher, route: StreamRoute, port_id: u32) -> Self {
        Self::with_state(dispatcher, route, port_id, StreamState::AckWait)
    }

    fn with_state(
        dispatcher: MessageDispatcher,
        route: StreamRoute,
        port_id: u32,
        state: StreamState,
    ) -> Self {
        StreamConsumer {
            dispatcher,
            route,
            port_id,
            state,
            last_sequence: 0,
            remote_closed: false,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn message_number(&self) -> u32 {
        self.route.number()
    }

    pub fn port_id(&self) -> u32 {
        self.port_id
    }

    fn fail(&mut self, err: RpcError) -> Poll<Option<Result<Bytes>>> {
        self.state = StreamState::Closed;
        Poll::Ready(Some(Err(err)))
    }

    fn send_close(&self, sequence_id: u32) {
        let close = StreamMessage::close(self.port_id, self.route.number(), sequence_id);
        if let Err(err) = self.dispatcher.send_frame(&Frame::from(close)) {
            tracing::debug!(
                message_number = self.route.number(),
                error = %err,
                "failed to close stream"
            );
        }
    }
}

impl Stream for StreamConsumer {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            match this.state {
                StreamState::Closed => return Poll::Ready(None),
                StreamState::AckWait => {
                    let ack = StreamMessage::ack(this.port_id, this.route.number(), this.last_sequence);
                    if let Err(err) = this.dispatcher.send_frame(&Frame::from(ack)) {
                        this.remote_closed = true;
                        return this.fail(err);
                    }
                    tracing::trace!(
                        message_number = this.route.number(),
                        sequence_id = this.last_sequence,
                        "stream ack sent"
                    );
                    this.state = StreamState::Streaming;
                }
                StreamState::Offer | StreamState::Streaming => {
                    let msg = match ready!(this.route.poll_recv(cx)) {
                        Some(Ok(msg)) => msg,
                        Some(Err(err)) => {
                            this.remote_closed = true;
                            return this.fail(err);
                        }
                        None => {
                            this.remote_closed = true;
                            this.state = StreamState::Closed;
                            return Poll::Ready(None);
                        }
                    };

                    if msg.closed {
                        tracing::trace!(
                            message_number = this.route.number(),
                            sequence_id = msg.sequence_id,
                            "stream closed by producer"
                        );
                        this.remote_closed = true;
                        this.state = StreamState::Closed;
                        return Poll::Ready(None);
                    }

                    if this.state == StreamState::Offer {
                        if msg.sequence_id != 0 {
                            return this.fail(RpcError::Protocol(format!(
                                "expected stream offer, got sequence id {}",
                                msg.sequence_id
                            )));
                        }
                        this.state = StreamState::AckWait;
                        continue;
                    }

                    let expected = this.last_sequence.wrapping_add(1);
                    if msg.ack || msg.sequence_id != expected {
                        return this.fail(RpcError::Protocol(format!(
                            "expected stream element {}, got sequence id {}",
                            expected, msg.sequence_id
                        )));
                    }

                    this.last_sequence = expected;
                    this.state = StreamState::AckWait;
                    return Poll::Ready(Some(Ok(msg.payload)));
                }
            }
        }
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        if self.remote_closed {
            self.route.close(None);
            return;
        }

        if self.state == StreamState::Offer {
            // the offer may already be queued on the route
            match self.route.try_recv() {
                Some(Ok(msg)) if !msg.closed => {
                    self.send_close(msg.sequence_id);
                    self.route.close(None);
                }
                Some(_) => self.route.close(None),
                None => {
                    tracing::debug!(
                        message_number = self.route.number(),
                        "stream refused before offer"
                    );
                    self.route.close(Some(self.port_id));
                }
            }
            return;
        }

        self.send_close(self.last_sequence);
        self.route.close(None);
    }
}

/// How a producer finished.
#[derive(Debug, Clone, PartialEq)]
pub enum ProducerOutcome {
    /// The source was exhausted and the stream closed after `sent` elements.
    Completed { sent: u32 },
    /// The consumer closed the stream.
    ClosedByConsumer { sequence_id: u32 },
    /// The source or the transport failed. No frame was sent for it.
    Failed { error: RpcError, sequence_id: u32 },
    Cancelled,
}

/// Sending half of a stream.
pub struct StreamProducer {
    dispatcher: MessageDispatcher,
    port_id: u32,
    number: u32,
    first_ack: Option<StreamWaiter>,
}

impl StreamProducer {
    /// Producer that sends its own offer when run.
    pub fn new(dispatcher: MessageDispatcher, port_id: u32, number: u32) -> Self {
        StreamProducer {
            dispatcher,
            port_id,
            number,
            first_ack: None,
        }
    }

    /// Producer whose offer travelled inside another frame. `first_ack`
    /// must be registered before that frame was sent.
    pub fn offered(
        dispatcher: MessageDispatcher,
        port_id: u32,
        number: u32,
        first_ack: StreamWaiter,
    ) -> Self {
        StreamProducer {
            dispatcher,
            port_id,
            number,
            first_ack: Some(first_ack),
        }
    }

    pub fn message_number(&self) -> u32 {
        self.number
    }

    fn close(&self, sequence_id: u32) {
        let close = StreamMessage::close(self.port_id, self.number, sequence_id);
        if let Err(err) = self.dispatcher.send_frame(&Frame::from(close)) {
            tracing::debug!(message_number = self.number, error = %err, "failed to close stream");
        }
    }

    fn send_element(&self, sequence_id: u32, payload: Bytes) -> Result<StreamWaiter> {
        let waiter = self.dispatcher.register_stream_waiter(self.number, sequence_id)?;
        let element = StreamMessage::element(self.port_id, self.number, sequence_id, payload);
        self.dispatcher.send_frame(&Frame::from(element))?;
        Ok(waiter)
    }

    /// Drive `source` through the ack protocol until it ends, the consumer
    /// closes, something fails or `cancel` fires.
    pub async fn run(mut self, mut source: PayloadStream, cancel: CancellationToken) -> ProducerOutcome {
        let mut sequence_id = 0;

        let mut waiter = match self.first_ack.take() {
            Some(waiter) => waiter,
            None => match self.send_element(0, Bytes::new()) {
                Ok(waiter) => waiter,
                Err(error) => return ProducerOutcome::Failed { error, sequence_id },
            },
        };

        loop {
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.close(sequence_id);
                    return ProducerOutcome::Cancelled;
                }
                reply = waiter.wait() => reply,
            };

            match reply {
                Err(error) => return ProducerOutcome::Failed { error, sequence_id },
                Ok(msg) if msg.closed => {
                    tracing::debug!(
                        message_number = self.number,
                        sequence_id = msg.sequence_id,
                        "stream closed by consumer"
                    );
                    return ProducerOutcome::ClosedByConsumer {
                        sequence_id: msg.sequence_id,
                    };
                }
                Ok(_) => {}
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.close(sequence_id);
                    return ProducerOutcome::Cancelled;
                }
                next = source.next() => next,
            };

            match next {
                None => {
                    self.close(sequence_id);
                    tracing::trace!(message_number = self.number, sent = sequence_id, "stream completed");
                    return ProducerOutcome::Completed { sent: sequence_id };
                }
                Some(Err(error)) => return ProducerOutcome::Failed { error, sequence_id },
                Some(Ok(payload)) => {
                    sequence_id += 1;
                    waiter = match self.send_element(sequence_id, payload) {
                        Ok(waiter) => waiter,
                        Err(error) => return ProducerOutcome::Failed { error, sequence_id },
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream;

    use super::*;
    use crate::config::DispatcherConfig;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::{Transport, TransportEvent};

    const PORT: u32 = 1;
    const NUMBER: u32 = 7;

    fn dispatchers() -> (MessageDispatcher, MessageDispatcher) {
        let (a, b) = MemoryTransport::pair();
        (
            MessageDispatcher::new(a, DispatcherConfig::default()),
            MessageDispatcher::new(b, DispatcherConfig::default()),
        )
    }

    fn source(items: &[&'static str]) -> PayloadStream {
        let items: Vec<Result<Bytes>> = items.iter().copied().map(|s| Ok(Bytes::from(s))).collect();
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_elements_delivered_in_order() {
        let (producer_side, consumer_side) = dispatchers();
        let route = consumer_side.open_stream_route(NUMBER).unwrap();
        let consumer = StreamConsumer::awaiting_offer(consumer_side, route, PORT);

        let producer = StreamProducer::new(producer_side, PORT, NUMBER);
        let handle = tokio::spawn(producer.run(source(&["a", "b", "c", "d", "e"]), CancellationToken::new()));

        let received: Vec<Bytes> = consumer.map(|item| item.unwrap()).collect().await;
        assert_eq!(received, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(handle.await.unwrap(), ProducerOutcome::Completed { sent: 5 });
    }

    #[tokio::test]
    async fn test_empty_elements_are_not_skipped() {
        let (producer_side, consumer_side) = dispatchers();
        let route = consumer_side.open_stream_route(NUMBER).unwrap();
        let consumer = StreamConsumer::awaiting_offer(consumer_side, route, PORT);

        let producer = StreamProducer::new(producer_side, PORT, NUMBER);
        tokio::spawn(producer.run(source(&["", "x", ""]), CancellationToken::new()));

        let received: Vec<Bytes> = consumer.map(|item| item.unwrap()).collect().await;
        assert_eq!(received.len(), 3);
        assert!(received[0].is_empty());
    }

    #[tokio::test]
    async fn test_no_element_without_ack() {
        let (a, b) = MemoryTransport::pair();
        let producer_side = MessageDispatcher::new(a, DispatcherConfig::default());
        let mut raw = b.subscribe();

        let producer = StreamProducer::new(producer_side, PORT, NUMBER);
        tokio::spawn(producer.run(source(&["a", "b"]), CancellationToken::new()));

        assert_eq!(raw.recv().await, Some(TransportEvent::Connected));
        let offer = match raw.recv().await {
            Some(TransportEvent::Message(bytes)) => Frame::decode(&bytes).unwrap(),
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(offer, Frame::from(StreamMessage::offer(PORT, NUMBER)));

        // nothing else arrives until the offer is acknowledged
        let next = tokio::time::timeout(Duration::from_millis(50), raw.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_consumer_refuses_before_offer() {
        let (producer_side, consumer_side) = dispatchers();
        let route = consumer_side.open_stream_route(NUMBER).unwrap();
        // the refused route lives in the dispatcher, which must outlive the consumer
        let consumer = StreamConsumer::awaiting_offer(consumer_side.clone(), route, PORT);
        drop(consumer);

        let producer = StreamProducer::new(producer_side, PORT, NUMBER);
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            producer.run(source(&["a"]), CancellationToken::new()),
        )
        .await
        .expect("late offer was not answered");
        assert_eq!(outcome, ProducerOutcome::ClosedByConsumer { sequence_id: 0 });
        drop(consumer_side);
    }

    #[tokio::test]
    async fn test_offered_consumer_refuses() {
        let (producer_side, consumer_side) = dispatchers();
        let first_ack = producer_side.register_stream_waiter(NUMBER, 0).unwrap();
        let route = consumer_side.open_stream_route(NUMBER).unwrap();

        let producer = StreamProducer::offered(producer_side, PORT, NUMBER, first_ack);
        let consumer = StreamConsumer::offered(consumer_side, route, PORT);
        assert_eq!(consumer.state(), StreamState::AckWait);
        drop(consumer);

        let outcome = producer.run(source(&["a", "b"]), CancellationToken::new()).await;
        assert_eq!(outcome, ProducerOutcome::ClosedByConsumer { sequence_id: 0 });
    }

    #[tokio::test]
    async fn test_consumer_closes_mid_stream() {
        let (producer_side, consumer_side) = dispatchers();
        let route = consumer_side.open_stream_route(NUMBER).unwrap();
        let mut consumer = StreamConsumer::awaiting_offer(consumer_side, route, PORT);

        let producer = StreamProducer::new(producer_side, PORT, NUMBER);
        let handle = tokio::spawn(producer.run(source(&["a", "b", "c", "d"]), CancellationToken::new()));

        assert_eq!(consumer.next().await, Some(Ok(Bytes::from_static(b"a"))));
        assert_eq!(consumer.next().await, Some(Ok(Bytes::from_static(b"b"))));
        drop(consumer);

        assert_eq!(
            handle.await.unwrap(),
            ProducerOutcome::ClosedByConsumer { sequence_id: 2 }
        );
    }

    #[tokio::test]
    async fn test_sequence_gap_is_a_protocol_error() {
        let (a, b) = MemoryTransport::pair();
        let consumer_side = MessageDispatcher::new(a, DispatcherConfig::default());
        let route = consumer_side.open_stream_route(NUMBER).unwrap();
        let mut consumer = StreamConsumer::awaiting_offer(consumer_side, route, PORT);

        b.send(Frame::from(StreamMessage::offer(PORT, NUMBER)).encode())
            .unwrap();
        b.send(
            Frame::from(StreamMessage::element(PORT, NUMBER, 2, Bytes::from_static(b"x"))).encode(),
        )
        .unwrap();

        assert!(matches!(consumer.next().await, Some(Err(RpcError::Protocol(_)))));
        assert_eq!(consumer.state(), StreamState::Closed);
        assert_eq!(consumer.next().await, None);
    }

    #[tokio::test]
    async fn test_cancel_closes_stream() {
        let (producer_side, consumer_side) = dispatchers();
        let route = consumer_side.open_stream_route(NUMBER).unwrap();
        let mut consumer = StreamConsumer::awaiting_offer(consumer_side, route, PORT);

        let cancel = CancellationToken::new();
        let producer = StreamProducer::new(producer_side, PORT, NUMBER);
        let handle = tokio::spawn(producer.run(stream::pending().boxed(), cancel.clone()));

        let next = tokio::time::timeout(Duration::from_millis(50), consumer.next()).await;
        assert!(next.is_err());

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), ProducerOutcome::Cancelled);
        assert_eq!(consumer.next().await, None);
    }

    #[tokio::test]
    async fn test_transport_close_ends_both_sides() {
        let (a, b) = MemoryTransport::pair();
        let producer_side = MessageDispatcher::new(a.clone(), DispatcherConfig::default());
        let consumer_side = MessageDispatcher::new(b, DispatcherConfig::default());
        let route = consumer_side.open_stream_route(NUMBER).unwrap();
        let mut consumer = StreamConsumer::awaiting_offer(consumer_side, route, PORT);

        let producer = StreamProducer::new(producer_side, PORT, NUMBER);
        let handle = tokio::spawn(producer.run(stream::pending().boxed(), CancellationToken::new()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        a.close();

        assert_eq!(consumer.next().await, Some(Err(RpcError::TransportClosed)));
        assert!(matches!(
            handle.await.unwrap(),
            ProducerOutcome::Failed { .. } | ProducerOutcome::Cancelled
        ));
    }
}
