// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Message dispatcher
//!
//! One dispatcher owns one transport attachment. A background task reads
//! the transport notifications, decodes each frame and routes it:
//!
//! ```text
//!   transport ──► read loop ──► pending response?   (keyed by number)
//!                     │    └──► stream waiter?      (keyed by number, sequence)
//!                     │    └──► stream route?       (keyed by number)
//!                     └────────► inbound subscribers (requests, port commands)
//! ```
//!
//! Every table entry is resolved at most once. When the transport closes
//! or fails, every entry is failed with the transport error and the tables
//! are cleared.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::DispatcherConfig;
use crate::errors::{Result, RpcError};
use crate::protocol::{Frame, MESSAGE_NUMBER_MASK, MessageKind, StreamMessage};
use crate::transport::{Transport, TransportEvent, TransportEventReceiver};

/// A decoded inbound frame published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub kind: MessageKind,
    pub message_number: u32,
    pub frame: Frame,
}

impl From<Frame> for ParsedMessage {
    fn from(frame: Frame) -> Self {
        ParsedMessage {
            kind: frame.kind(),
            message_number: frame.message_number(),
            frame,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed,
}

type StreamItem = Result<StreamMessage>;

enum RouteEntry {
    Consumer(mpsc::UnboundedSender<StreamItem>),
    /// The local consumer went away before the offer arrived. The late
    /// offer is answered with a Closed frame.
    Refused { port_id: u32 },
}

struct StreamWaiterEntry {
    sequence_id: u32,
    tx: oneshot::Sender<StreamItem>,
}

struct Tables {
    next_number: u32,
    responses: HashMap<u32, oneshot::Sender<Result<Frame>>>,
    /// at most one outstanding ack per stream number
    waiters: HashMap<u32, StreamWaiterEntry>,
    routes: HashMap<u32, RouteEntry>,
    reserved: HashSet<u32>,
    /// refused routes, oldest first
    refused: VecDeque<u32>,
    subscribers: Vec<mpsc::UnboundedSender<ParsedMessage>>,
    closed: Option<RpcError>,
}

impl Tables {
    fn new() -> Self {
        Tables {
            next_number: 1,
            responses: HashMap::new(),
            waiters: HashMap::new(),
            routes: HashMap::new(),
            reserved: HashSet::new(),
            refused: VecDeque::new(),
            subscribers: Vec::new(),
            closed: None,
        }
    }

    fn in_use(&self, number: u32) -> bool {
        self.responses.contains_key(&number)
            || self.routes.contains_key(&number)
            || self.reserved.contains(&number)
    }

    fn outstanding(&self) -> usize {
        self.responses.len() + self.waiters.len()
    }

    fn check_open(&self) -> Result<()> {
        match &self.closed {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn check_capacity(&self, max: usize) -> Result<()> {
        if self.outstanding() >= max {
            tracing::warn!(
                outstanding = self.outstanding(),
                max_pending = max,
                "too many pending calls; refusing new call"
            );
            return Err(RpcError::ResourceExhausted(max));
        }
        Ok(())
    }

    /// Answer a later offer for `number` with a Closed frame. At most
    /// `max` refusals are kept; the oldest are forgotten first.
    fn refuse(&mut self, number: u32, port_id: u32, max: usize) {
        self.refused.retain(|n| *n != number);
        self.routes.insert(number, RouteEntry::Refused { port_id });
        self.refused.push_back(number);

        while self.refused.len() > max {
            let Some(oldest) = self.refused.pop_front() else {
                break;
            };
            if matches!(self.routes.get(&oldest), Some(RouteEntry::Refused { .. })) {
                self.routes.remove(&oldest);
                tracing::debug!(message_number = oldest, "forgetting refused stream");
            }
        }
    }

    /// Next free message number in `1..=wrap`.
    fn allocate(&mut self, wrap: u32) -> Result<u32> {
        for _ in 0..wrap {
            let number = self.next_number;
            self.next_number = if number >= wrap { 1 } else { number + 1 };
            if !self.in_use(number) {
                return Ok(number);
            }
        }
        Err(RpcError::ResourceExhausted(self.outstanding()))
    }
}

struct DispatcherInner {
    transport: Arc<dyn Transport>,
    config: DispatcherConfig,
    tables: Mutex<Tables>,
    state: watch::Sender<ConnectionState>,
}

impl DispatcherInner {
    fn send(&self, frame: &Frame) -> Result<()> {
        // nothing leaves a disposed or swept dispatcher
        self.tables.lock().check_open()?;

        tracing::trace!(
            kind = ?frame.kind(),
            message_number = frame.message_number(),
            "sending frame"
        );
        self.transport.send(frame.encode()).map_err(RpcError::from)
    }

    fn handle_bytes(&self, bytes: &[u8]) {
        match Frame::decode(bytes) {
            Ok(frame) => self.route(frame),
            Err(err) => {
                tracing::warn!(error = %err, len = bytes.len(), "dropping undecodable frame");
            }
        }
    }

    fn route(&self, frame: Frame) {
        let number = frame.message_number();

        match frame {
            Frame::StreamMessage(msg) => self.route_stream_message(msg),
            Frame::RemoteErrorResponse(remote) => {
                let err = RpcError::remote(remote.error_code, remote.error_message.clone());
                let mut tables = self.tables.lock();

                if let Some(tx) = tables.responses.remove(&number) {
                    let _ = tx.send(Err(err));
                    return;
                }
                if let Some(RouteEntry::Consumer(tx)) = tables.routes.remove(&number) {
                    let _ = tx.send(Err(err));
                    return;
                }
                if let Some(waiter) = tables.waiters.remove(&number) {
                    let _ = waiter.tx.send(Err(err));
                    return;
                }

                let frame = Frame::RemoteErrorResponse(remote);
                Self::publish(&mut tables, frame);
            }
            Frame::Response(_) | Frame::CreatePortResponse(_) | Frame::RequestModuleResponse(_) => {
                let tx = self.tables.lock().responses.remove(&number);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(Ok(frame));
                    }
                    None => {
                        tracing::debug!(
                            kind = ?frame.kind(),
                            message_number = number,
                            "dropping response without pending call"
                        );
                    }
                }
            }
            Frame::CreatePort(_) | Frame::DestroyPort(_) | Frame::RequestModule(_) | Frame::Request(_) => {
                Self::publish(&mut self.tables.lock(), frame);
            }
        }
    }

    fn route_stream_message(&self, msg: StreamMessage) {
        let number = msg.message_number();
        let mut tables = self.tables.lock();

        // acks and closes answer a producer waiting on this number
        if msg.ack || msg.closed {
            let matches = tables
                .waiters
                .get(&number)
                .is_some_and(|w| w.sequence_id == msg.sequence_id || msg.closed);
            if matches {
                if let Some(waiter) = tables.waiters.remove(&number) {
                    let _ = waiter.tx.send(Ok(msg));
                }
                return;
            }
        }

        match tables.routes.remove(&number) {
            Some(RouteEntry::Consumer(tx)) => {
                let closed = msg.closed;
                if tx.send(Ok(msg)).is_ok() && !closed {
                    tables.routes.insert(number, RouteEntry::Consumer(tx));
                }
            }
            Some(RouteEntry::Refused { port_id }) => {
                tables.refused.retain(|n| *n != number);
                drop(tables);
                if !msg.closed {
                    tracing::debug!(
                        message_number = number,
                        sequence_id = msg.sequence_id,
                        "answering offer for a refused stream"
                    );
                    let close = StreamMessage::close(port_id, number, msg.sequence_id);
                    if let Err(err) = self.send(&Frame::from(close)) {
                        tracing::debug!(error = %err, "failed to refuse stream");
                    }
                }
            }
            None => Self::publish(&mut tables, Frame::StreamMessage(msg)),
        }
    }

    fn publish(tables: &mut Tables, frame: Frame) {
        if tables.subscribers.is_empty() {
            tracing::debug!(
                kind = ?frame.kind(),
                message_number = frame.message_number(),
                "no subscriber for inbound frame; dropping"
            );
            return;
        }

        let message = ParsedMessage::from(frame);
        tables
            .subscribers
            .retain(|subscriber| subscriber.send(message.clone()).is_ok());
    }

    /// Fail every pending entry with `err` and mark the dispatcher closed.
    fn sweep(&self, err: RpcError) {
        let mut tables = self.tables.lock();
        if tables.closed.is_some() {
            return;
        }

        let failed = tables.outstanding() + tables.routes.len();
        tables.closed = Some(err.clone());

        for (_, tx) in tables.responses.drain() {
            let _ = tx.send(Err(err.clone()));
        }
        for (_, waiter) in tables.waiters.drain() {
            let _ = waiter.tx.send(Err(err.clone()));
        }
        for (_, route) in tables.routes.drain() {
            if let RouteEntry::Consumer(tx) = route {
                let _ = tx.send(Err(err.clone()));
            }
        }
        tables.reserved.clear();
        tables.refused.clear();
        tables.subscribers.clear();
        drop(tables);

        self.state.send_replace(ConnectionState::Closed);
        tracing::debug!(error = %err, failed, "dispatcher closed");
    }
}

async fn read_loop(inner: Weak<DispatcherInner>, mut events: TransportEventReceiver) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match event {
            TransportEvent::Connected => {
                inner.state.send_replace(ConnectionState::Connected);
            }
            TransportEvent::Message(bytes) => inner.handle_bytes(&bytes),
            TransportEvent::Error(cause) => {
                tracing::warn!(%cause, "transport failed");
                inner.sweep(RpcError::TransportFailure(cause));
                return;
            }
            TransportEvent::Closed => {
                inner.sweep(RpcError::TransportClosed);
                return;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.sweep(RpcError::TransportClosed);
    }
}

/// Correlates frames on one transport attachment.
///
/// Cloning is cheap; all clones share the same tables.
#[derive(Clone)]
pub struct MessageDispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl MessageDispatcher {
    /// Attach to `transport` and start the read loop.
    ///
    /// Must be called from within a tokio runtime. A message number wrap
    /// outside `1..=MESSAGE_NUMBER_MASK` is clamped into that range.
    pub fn new(transport: Arc<dyn Transport>, mut config: DispatcherConfig) -> Self {
        let wrap = config.message_number_wrap.clamp(1, MESSAGE_NUMBER_MASK);
        if wrap != config.message_number_wrap {
            tracing::warn!(
                configured = config.message_number_wrap,
                wrap,
                "message number wrap out of range; clamping"
            );
            config.message_number_wrap = wrap;
        }

        let initial = if transport.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Connecting
        };
        let (state, _) = watch::channel(initial);
        let events = transport.subscribe();

        let inner = Arc::new(DispatcherInner {
            transport,
            config,
            tables: Mutex::new(Tables::new()),
            state,
        });

        tokio::spawn(read_loop(Arc::downgrade(&inner), events));

        MessageDispatcher { inner }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Wait until the transport reports it is connected.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let state = *rx
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map_err(|_| RpcError::TransportClosed)?;

        match state {
            ConnectionState::Connected => Ok(()),
            _ => Err(self
                .inner
                .tables
                .lock()
                .closed
                .clone()
                .unwrap_or(RpcError::TransportClosed)),
        }
    }

    /// Number of outstanding responses and stream acks.
    pub fn pending_calls(&self) -> usize {
        self.inner.tables.lock().outstanding()
    }

    /// Subscribe to inbound frames not claimed by a pending entry.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ParsedMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tables = self.inner.tables.lock();
        // a closed dispatcher hands out an already finished subscription
        if tables.closed.is_none() {
            tables.subscribers.push(tx);
        }
        rx
    }

    /// Send a frame whose identifier is already stamped.
    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.inner.send(frame)
    }

    /// Stamp the next message number on `frame` and send it.
    pub fn send_and_forget(&self, frame: impl Into<Frame>) -> Result<u32> {
        let number = {
            let mut tables = self.inner.tables.lock();
            tables.check_open()?;
            tables.allocate(self.inner.config.message_number_wrap)?
        };

        let frame = frame.into().stamped(number);
        self.inner.send(&frame)?;
        Ok(number)
    }

    /// Allocate a message number and register a pending response for it.
    ///
    /// The caller sends the frame stamped with `PendingResponse::number`.
    pub fn register_response(&self) -> Result<PendingResponse> {
        let mut tables = self.inner.tables.lock();
        tables.check_open()?;
        tables.check_capacity(self.inner.config.max_pending_calls)?;

        let number = tables.allocate(self.inner.config.message_number_wrap)?;
        let (tx, rx) = oneshot::channel();
        tables.responses.insert(number, tx);

        tracing::trace!(message_number = number, "registered pending response");

        Ok(PendingResponse {
            number,
            rx: Some(rx),
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Send `frame` and wait for the frame answering it.
    ///
    /// A RemoteErrorResponse fails the call with `RpcError::Remote`, a frame
    /// of any other kind than `expected` with `RpcError::UnexpectedResponse`.
    pub async fn send_and_wait_for_response(
        &self,
        frame: impl Into<Frame>,
        expected: MessageKind,
    ) -> Result<Frame> {
        let pending = self.register_response()?;
        let frame = frame.into().stamped(pending.number());
        self.inner.send(&frame)?;

        let response = pending.wait().await?;
        if response.kind() != expected {
            return Err(RpcError::UnexpectedResponse {
                expected,
                actual: response.kind(),
            });
        }
        Ok(response)
    }

    /// Register the waiter for the ack or close answering
    /// `(number, sequence_id)`.
    pub fn register_stream_waiter(&self, number: u32, sequence_id: u32) -> Result<StreamWaiter> {
        let mut tables = self.inner.tables.lock();
        tables.check_open()?;
        tables.check_capacity(self.inner.config.max_pending_calls)?;

        let (tx, rx) = oneshot::channel();
        if let Some(previous) = tables
            .waiters
            .insert(number, StreamWaiterEntry { sequence_id, tx })
        {
            let _ = previous.tx.send(Err(RpcError::Protocol(format!(
                "stream {} has more than one frame in flight",
                number
            ))));
        }

        Ok(StreamWaiter {
            number,
            rx: Some(rx),
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Send a stream frame and wait for the matching ack or close.
    pub async fn send_stream_message(&self, msg: StreamMessage) -> Result<StreamMessage> {
        let waiter = self.register_stream_waiter(msg.message_number(), msg.sequence_id)?;
        self.inner.send(&Frame::from(msg))?;
        waiter.wait().await
    }

    /// Route every inbound stream frame for `number` to the returned
    /// receiver.
    pub fn open_stream_route(&self, number: u32) -> Result<StreamRoute> {
        let mut tables = self.inner.tables.lock();
        tables.check_open()?;

        let (tx, rx) = mpsc::unbounded_channel();
        tables.routes.insert(number, RouteEntry::Consumer(tx));

        Ok(StreamRoute {
            number,
            rx: Some(rx),
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Allocate a message number and open a route for it in one step.
    pub fn allocate_stream_route(&self) -> Result<StreamRoute> {
        let number = {
            let mut tables = self.inner.tables.lock();
            tables.check_open()?;
            let number = tables.allocate(self.inner.config.message_number_wrap)?;
            // hold the number while the route is being created
            tables.reserved.insert(number);
            number
        };

        let route = self.open_stream_route(number);
        self.inner.tables.lock().reserved.remove(&number);
        route
    }

    /// Reserve a message number for an outbound stream.
    pub fn reserve_number(&self) -> Result<NumberReservation> {
        let mut tables = self.inner.tables.lock();
        tables.check_open()?;

        let number = tables.allocate(self.inner.config.message_number_wrap)?;
        tables.reserved.insert(number);

        Ok(NumberReservation {
            number,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Fail every pending call with `err` without sending any frame.
    ///
    /// The dispatcher refuses new calls afterwards. Calling it twice is a
    /// no-op.
    pub fn dispose(&self, err: RpcError) {
        self.inner.sweep(err);
    }

    /// Close the underlying transport.
    pub fn close(&self) {
        self.inner.transport.close();
    }
}

/// A registered response slot.
///
/// Dropping it before the response arrives removes the entry.
pub struct PendingResponse {
    number: u32,
    rx: Option<oneshot::Receiver<Result<Frame>>>,
    inner: Weak<DispatcherInner>,
}

impl PendingResponse {
    pub fn number(&self) -> u32 {
        self.number
    }

    pub async fn wait(mut self) -> Result<Frame> {
        let rx = self.rx.take().ok_or(RpcError::TransportClosed)?;
        rx.await.unwrap_or(Err(RpcError::TransportClosed))
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        drop(self.rx.take());
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        let mut tables = inner.tables.lock();
        if tables
            .responses
            .get(&self.number)
            .is_some_and(|tx| tx.is_closed())
        {
            tables.responses.remove(&self.number);
            tracing::debug!(
                message_number = self.number,
                "call dropped: removed pending response"
            );
        }
    }
}

/// Waits for the ack or close answering one stream frame.
pub struct StreamWaiter {
    number: u32,
    rx: Option<oneshot::Receiver<StreamItem>>,
    inner: Weak<DispatcherInner>,
}

impl StreamWaiter {
    pub async fn wait(mut self) -> Result<StreamMessage> {
        let rx = self.rx.take().ok_or(RpcError::TransportClosed)?;
        rx.await.unwrap_or(Err(RpcError::TransportClosed))
    }
}

impl Drop for StreamWaiter {
    fn drop(&mut self) {
        drop(self.rx.take());
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        let mut tables = inner.tables.lock();
        if tables
            .waiters
            .get(&self.number)
            .is_some_and(|w| w.tx.is_closed())
        {
            tables.waiters.remove(&self.number);
        }
    }
}

/// Receiving end of a stream route.
pub struct StreamRoute {
    number: u32,
    rx: Option<mpsc::UnboundedReceiver<StreamItem>>,
    inner: Weak<DispatcherInner>,
}

impl StreamRoute {
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<StreamItem>> {
        match self.rx.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamItem> {
        std::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Take an already queued frame, if any.
    pub fn try_recv(&mut self) -> Option<StreamItem> {
        self.rx.as_mut()?.try_recv().ok()
    }

    /// Close the route. With `refuse_as`, an offer arriving later is
    /// answered with a Closed frame for that port.
    pub fn close(&mut self, refuse_as: Option<u32>) {
        drop(self.rx.take());
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        let mut tables = inner.tables.lock();
        let consumer_gone = matches!(
            tables.routes.get(&self.number),
            Some(RouteEntry::Consumer(tx)) if tx.is_closed()
        );
        if !consumer_gone {
            return;
        }

        match refuse_as {
            Some(port_id) => {
                let max = inner.config.max_pending_calls;
                tables.refuse(self.number, port_id, max);
            }
            None => {
                tables.routes.remove(&self.number);
            }
        }
    }
}

impl Drop for StreamRoute {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.close(None);
        }
    }
}

/// Keeps a message number out of allocation until dropped.
pub struct NumberReservation {
    number: u32,
    inner: Weak<DispatcherInner>,
}

impl NumberReservation {
    pub fn number(&self) -> u32 {
        self.number
    }
}

impl Drop for NumberReservation {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.tables.lock().reserved.remove(&self.number);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::protocol::{CreatePort, CreatePortResponse, RemoteError, Response};
    use crate::transport::memory::MemoryTransport;

    async fn next_frame(rx: &mut TransportEventReceiver) -> Frame {
        loop {
            match rx.recv().await {
                Some(TransportEvent::Message(bytes)) => return Frame::decode(&bytes).unwrap(),
                Some(TransportEvent::Connected) => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    fn setup(config: DispatcherConfig) -> (MessageDispatcher, Arc<MemoryTransport>) {
        let (local, remote) = MemoryTransport::pair();
        (MessageDispatcher::new(local, config), remote)
    }

    #[tokio::test]
    async fn test_numbers_wrap_and_skip_pending() {
        let config = DispatcherConfig::default().with_message_number_wrap(3);
        let (dispatcher, _remote) = setup(config);

        let first = dispatcher.register_response().unwrap();
        assert_eq!(first.number(), 1);
        assert_eq!(dispatcher.send_and_forget(CreatePort::default()).unwrap(), 2);
        assert_eq!(dispatcher.send_and_forget(CreatePort::default()).unwrap(), 3);

        // 1 is still pending
        assert_eq!(dispatcher.send_and_forget(CreatePort::default()).unwrap(), 2);

        drop(first);
        assert_eq!(dispatcher.pending_calls(), 0);
        assert_eq!(dispatcher.send_and_forget(CreatePort::default()).unwrap(), 3);
        assert_eq!(dispatcher.send_and_forget(CreatePort::default()).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_response_resolves_pending_call() {
        let (dispatcher, remote) = setup(DispatcherConfig::default());
        let mut remote_rx = remote.subscribe();

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .send_and_wait_for_response(
                        CreatePort {
                            message_identifier: 0,
                            port_name: "my-port".to_string(),
                        },
                        MessageKind::CreatePortResponse,
                    )
                    .await
            }
        });

        let request = next_frame(&mut remote_rx).await;
        assert_eq!(request.kind(), MessageKind::CreatePort);

        let reply = Frame::from(CreatePortResponse {
            message_identifier: 0,
            port_id: 1,
        })
        .stamped(request.message_number());
        remote.send(reply.encode()).unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(response, reply);
        assert_eq!(dispatcher.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_and_wrong_kind() {
        let (dispatcher, remote) = setup(DispatcherConfig::default());
        let mut remote_rx = remote.subscribe();

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .send_and_wait_for_response(CreatePort::default(), MessageKind::CreatePortResponse)
                    .await
            }
        });
        let request = next_frame(&mut remote_rx).await;
        let error = Frame::from(RemoteError {
            message_identifier: 0,
            error_code: 7,
            error_message: "denied".to_string(),
        })
        .stamped(request.message_number());
        remote.send(error.encode()).unwrap();
        assert_eq!(
            call.await.unwrap(),
            Err(RpcError::remote(7, "denied"))
        );

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .send_and_wait_for_response(CreatePort::default(), MessageKind::CreatePortResponse)
                    .await
            }
        });
        let request = next_frame(&mut remote_rx).await;
        let wrong = Frame::from(Response::default()).stamped(request.message_number());
        remote.send(wrong.encode()).unwrap();
        assert_eq!(
            call.await.unwrap(),
            Err(RpcError::UnexpectedResponse {
                expected: MessageKind::CreatePortResponse,
                actual: MessageKind::Response,
            })
        );
    }

    #[tokio::test]
    async fn test_transport_close_fails_everything() {
        let (dispatcher, remote) = setup(DispatcherConfig::default());

        let pending = dispatcher.register_response().unwrap();
        let waiter = dispatcher.register_stream_waiter(40, 0).unwrap();
        let mut route = dispatcher.open_stream_route(41).unwrap();
        let mut inbound = dispatcher.subscribe();

        remote.close();

        assert_eq!(pending.wait().await, Err(RpcError::TransportClosed));
        assert_eq!(waiter.wait().await, Err(RpcError::TransportClosed));
        assert_eq!(route.recv().await, Some(Err(RpcError::TransportClosed)));
        assert_eq!(inbound.recv().await, None);
        assert_eq!(dispatcher.state(), ConnectionState::Closed);

        // closed dispatchers refuse new calls
        assert_eq!(
            dispatcher.register_response().err(),
            Some(RpcError::TransportClosed)
        );
        assert_eq!(
            dispatcher.wait_connected().await,
            Err(RpcError::TransportClosed)
        );
    }

    #[tokio::test]
    async fn test_transport_error_is_reported() {
        let (dispatcher, remote) = setup(DispatcherConfig::default());
        let pending = dispatcher.register_response().unwrap();

        remote.fail("reset by peer");
        assert_eq!(
            pending.wait().await,
            Err(RpcError::TransportFailure("reset by peer".to_string()))
        );
    }

    #[tokio::test]
    async fn test_bad_frame_is_dropped_alone() {
        let (dispatcher, remote) = setup(DispatcherConfig::default());
        let mut inbound = dispatcher.subscribe();

        remote.send(Bytes::from_static(&[0xFF, 0xFF, 0xFF])).unwrap();
        let create = Frame::from(CreatePort {
            message_identifier: 0,
            port_name: "p".to_string(),
        })
        .stamped(9);
        remote.send(create.encode()).unwrap();

        let message = inbound.recv().await.unwrap();
        assert_eq!(message.kind, MessageKind::CreatePort);
        assert_eq!(message.message_number, 9);
        assert_eq!(message.frame, create);
    }

    #[tokio::test]
    async fn test_pending_cap() {
        let config = DispatcherConfig::default().with_max_pending_calls(2);
        let (dispatcher, _remote) = setup(config);

        let _a = dispatcher.register_response().unwrap();
        let _b = dispatcher.register_stream_waiter(100, 0).unwrap();
        assert_eq!(
            dispatcher.register_response().err(),
            Some(RpcError::ResourceExhausted(2))
        );
    }

    #[tokio::test]
    async fn test_stream_frames_routed_by_flag() {
        let (dispatcher, remote) = setup(DispatcherConfig::default());
        let mut route = dispatcher.open_stream_route(5).unwrap();
        let waiter = dispatcher.register_stream_waiter(6, 2).unwrap();

        // payload for the consumer
        let element = StreamMessage::element(1, 5, 1, Bytes::from_static(b"x"));
        remote.send(Frame::from(element.clone()).encode()).unwrap();
        assert_eq!(route.recv().await, Some(Ok(element)));

        // ack for the producer
        let ack = StreamMessage::ack(1, 6, 2);
        remote.send(Frame::from(ack.clone()).encode()).unwrap();
        assert_eq!(waiter.wait().await, Ok(ack));

        // close ends the route
        let close = StreamMessage::close(1, 5, 1);
        remote.send(Frame::from(close.clone()).encode()).unwrap();
        assert_eq!(route.recv().await, Some(Ok(close)));
        assert_eq!(route.recv().await, None);
    }

    #[tokio::test]
    async fn test_refused_route_answers_offer() {
        let (dispatcher, remote) = setup(DispatcherConfig::default());
        let mut remote_rx = remote.subscribe();

        let mut route = dispatcher.open_stream_route(12).unwrap();
        route.close(Some(3));

        remote
            .send(Frame::from(StreamMessage::offer(3, 12)).encode())
            .unwrap();

        let answer = tokio::time::timeout(Duration::from_secs(1), next_frame(&mut remote_rx))
            .await
            .unwrap();
        assert_eq!(answer, Frame::from(StreamMessage::close(3, 12, 0)));

        // answered once, then forgotten
        let tables = dispatcher.inner.tables.lock();
        assert!(!tables.routes.contains_key(&12));
        assert!(tables.refused.is_empty());
    }

    #[tokio::test]
    async fn test_refused_routes_are_bounded() {
        let config = DispatcherConfig::default().with_max_pending_calls(2);
        let (dispatcher, _remote) = setup(config);

        for number in [20, 21, 22] {
            let mut route = dispatcher.open_stream_route(number).unwrap();
            route.close(Some(1));
        }

        let tables = dispatcher.inner.tables.lock();
        assert!(!tables.in_use(20));
        assert!(tables.in_use(21));
        assert!(tables.in_use(22));
        assert_eq!(tables.refused, VecDeque::from([21, 22]));
    }

    #[tokio::test]
    async fn test_send_stream_message_waits_for_ack_or_close() {
        let (dispatcher, remote) = setup(DispatcherConfig::default());
        let mut remote_rx = remote.subscribe();

        let element = StreamMessage::element(1, 30, 1, Bytes::from_static(b"a"));
        let send = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let element = element.clone();
            async move { dispatcher.send_stream_message(element).await }
        });
        assert_eq!(next_frame(&mut remote_rx).await, Frame::from(element));
        let ack = StreamMessage::ack(1, 30, 1);
        remote.send(Frame::from(ack.clone()).encode()).unwrap();
        assert_eq!(send.await.unwrap(), Ok(ack));

        let element = StreamMessage::element(1, 30, 2, Bytes::from_static(b"b"));
        let send = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let element = element.clone();
            async move { dispatcher.send_stream_message(element).await }
        });
        assert_eq!(next_frame(&mut remote_rx).await, Frame::from(element));
        let close = StreamMessage::close(1, 30, 1);
        remote.send(Frame::from(close.clone()).encode()).unwrap();

        let reply = send.await.unwrap().unwrap();
        assert!(reply.closed);
        assert_eq!(reply, close);
        assert_eq!(dispatcher.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_disposed_dispatcher_sends_nothing() {
        let (dispatcher, remote) = setup(DispatcherConfig::default());
        let mut remote_rx = remote.subscribe();

        dispatcher.dispose(RpcError::Disposed);
        dispatcher.dispose(RpcError::Cancelled);

        let close = Frame::from(StreamMessage::close(1, 5, 3));
        assert_eq!(dispatcher.send_frame(&close), Err(RpcError::Disposed));
        assert_eq!(
            dispatcher.send_and_forget(CreatePort::default()),
            Err(RpcError::Disposed)
        );

        let next = tokio::time::timeout(Duration::from_millis(50), next_frame(&mut remote_rx)).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_out_of_range_wrap_is_clamped() {
        let config = DispatcherConfig::default().with_message_number_wrap(MESSAGE_NUMBER_MASK + 5);
        let (dispatcher, _remote) = setup(config);
        assert_eq!(dispatcher.config().message_number_wrap, MESSAGE_NUMBER_MASK);

        let config = DispatcherConfig::default().with_message_number_wrap(0);
        let (dispatcher, _remote) = setup(config);
        assert_eq!(dispatcher.config().message_number_wrap, 1);
        assert_eq!(dispatcher.send_and_forget(CreatePort::default()).unwrap(), 1);
        assert_eq!(dispatcher.send_and_forget(CreatePort::default()).unwrap(), 1);
    }
}
