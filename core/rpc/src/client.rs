// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Client-side RPC handling implementation
//!
//! An `RpcClient` owns one transport. Ports are created over it by name,
//! modules are loaded per port, and calls are issued through the loaded
//! module by procedure name.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::future::{BoxFuture, Shared};
use futures::stream::{Stream, StreamExt};
use futures::{Future, FutureExt};
use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, DropGuard};

use portrpc_config::component::configuration::Configuration;

use crate::codec::{Decoder, Encoder};
use crate::config::ClientConfig;
use crate::dispatcher::{MessageDispatcher, NumberReservation};
use crate::errors::{Result, RpcError};
use crate::protocol::{
    CreatePort, DestroyPort, Frame, MessageKind, ModuleProcedure, Request, RequestModule,
    StreamMessage,
};
use crate::stream::{ProducerOutcome, StreamConsumer, StreamProducer};
use crate::transport::Transport;

type PortCreation = Shared<BoxFuture<'static, Result<RpcClientPort>>>;

struct ClientInner {
    dispatcher: MessageDispatcher,
    config: ClientConfig,
    /// port creations by name
    ports: Mutex<HashMap<String, PortCreation>>,
    disposed: AtomicBool,
}

impl ClientInner {
    fn check_usable(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(RpcError::Disposed);
        }
        Ok(())
    }

    async fn with_timeout<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match self.config.call_timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| RpcError::Timeout)?,
            None => call.await,
        }
    }
}

/// RPC Client
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("dispatcher", &self.inner.dispatcher)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl RpcClient {
    /// Attach to `transport` and wait until it reports being connected.
    ///
    /// Fails with `RpcError::InvalidConfiguration` before touching the
    /// transport when `config` does not validate.
    pub async fn connect(transport: Arc<dyn Transport>, config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let dispatcher = MessageDispatcher::new(transport, config.dispatcher.clone());

        match config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, dispatcher.wait_connected())
                .await
                .map_err(|_| RpcError::ConnectTimeout)??,
            None => dispatcher.wait_connected().await?,
        }

        tracing::debug!("rpc client connected");

        Ok(RpcClient {
            inner: Arc::new(ClientInner {
                dispatcher,
                config,
                ports: Mutex::new(HashMap::new()),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.inner.dispatcher
    }

    /// Outstanding responses and stream acks.
    pub fn pending_calls(&self) -> usize {
        self.inner.dispatcher.pending_calls()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Create the port `name`, or return the one already created.
    pub async fn create_port(&self, name: &str) -> Result<RpcClientPort> {
        self.inner.check_usable()?;

        let creation = {
            let mut ports = self.inner.ports.lock();
            match ports.get(name) {
                Some(creation) => creation.clone(),
                None => {
                    let client = self.inner.clone();
                    let port_name = name.to_string();
                    let creation = async move { request_port(client, port_name).await }
                        .boxed()
                        .shared();
                    ports.insert(name.to_string(), creation.clone());
                    creation
                }
            }
        };

        let result = creation.await;
        if result.is_err() {
            // let a later call retry
            let mut ports = self.inner.ports.lock();
            if ports
                .get(name)
                .is_some_and(|c| matches!(c.peek(), Some(Err(_))))
            {
                ports.remove(name);
            }
        }
        result
    }

    /// Fail every pending call and forget every port, without notifying
    /// the server. Disposing twice is a no-op.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.ports.lock().clear();
        self.inner.dispatcher.dispose(RpcError::Disposed);

        tracing::info!("rpc client disposed");
    }
}

async fn request_port(client: Arc<ClientInner>, port_name: String) -> Result<RpcClientPort> {
    let request = CreatePort {
        message_identifier: 0,
        port_name: port_name.clone(),
    };

    let response = client
        .with_timeout(
            client
                .dispatcher
                .send_and_wait_for_response(request, MessageKind::CreatePortResponse),
        )
        .await?;

    let Frame::CreatePortResponse(response) = response else {
        return Err(RpcError::UnexpectedResponse {
            expected: MessageKind::CreatePortResponse,
            actual: response.kind(),
        });
    };

    tracing::debug!(port_id = response.port_id, %port_name, "port created");

    Ok(RpcClientPort {
        inner: Arc::new(ClientPortInner {
            port_id: response.port_id,
            port_name,
            client: Arc::downgrade(&client),
            dispatcher: client.dispatcher.clone(),
            closed: AtomicBool::new(false),
        }),
    })
}

struct ClientPortInner {
    port_id: u32,
    port_name: String,
    client: Weak<ClientInner>,
    dispatcher: MessageDispatcher,
    closed: AtomicBool,
}

/// Client-side mirror of a server port.
#[derive(Clone)]
pub struct RpcClientPort {
    inner: Arc<ClientPortInner>,
}

impl std::fmt::Debug for RpcClientPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClientPort")
            .field("port_id", &self.inner.port_id)
            .field("port_name", &self.inner.port_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcClientPort {
    pub fn port_id(&self) -> u32 {
        self.inner.port_id
    }

    pub fn port_name(&self) -> &str {
        &self.inner.port_name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn client(&self) -> Result<Arc<ClientInner>> {
        if self.is_closed() {
            return Err(RpcError::PortClosed(self.inner.port_id));
        }
        let client = self.inner.client.upgrade().ok_or(RpcError::Disposed)?;
        client.check_usable()?;
        Ok(client)
    }

    /// Load a module and its procedure table.
    pub async fn load_module(&self, name: &str) -> Result<RpcClientModule> {
        let client = self.client()?;

        let request = RequestModule {
            message_identifier: 0,
            port_id: self.inner.port_id,
            module_name: name.to_string(),
        };
        let response = client
            .with_timeout(
                self.inner
                    .dispatcher
                    .send_and_wait_for_response(request, MessageKind::RequestModuleResponse),
            )
            .await?;

        let Frame::RequestModuleResponse(response) = response else {
            return Err(RpcError::UnexpectedResponse {
                expected: MessageKind::RequestModuleResponse,
                actual: response.kind(),
            });
        };

        tracing::debug!(
            port_id = self.inner.port_id,
            module = name,
            procedures = response.procedures.len(),
            "module loaded"
        );

        Ok(RpcClientModule::new(self.clone(), name, response.procedures))
    }

    /// Send DestroyPort without waiting and forget the port.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let Some(client) = self.inner.client.upgrade() else {
            return;
        };

        {
            let mut ports = client.ports.lock();
            let owned = ports.get(&self.inner.port_name).is_some_and(|creation| {
                matches!(creation.peek(), Some(Ok(port)) if Arc::ptr_eq(&port.inner, &self.inner))
            });
            if owned {
                ports.remove(&self.inner.port_name);
            }
        }

        if client.check_usable().is_err() {
            return;
        }

        let destroy = DestroyPort {
            message_identifier: 0,
            port_id: self.inner.port_id,
        };
        if let Err(err) = self.inner.dispatcher.send_and_forget(destroy) {
            tracing::debug!(port_id = self.inner.port_id, error = %err, "failed to send DestroyPort");
        }
    }
}

/// A module loaded on a client port.
#[derive(Clone)]
pub struct RpcClientModule {
    port: RpcClientPort,
    name: String,
    procedures: Vec<ModuleProcedure>,
    ids: HashMap<String, u32>,
}

impl std::fmt::Debug for RpcClientModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClientModule")
            .field("port_id", &self.port.port_id())
            .field("name", &self.name)
            .field("procedures", &self.procedures)
            .finish()
    }
}

impl RpcClientModule {
    fn new(port: RpcClientPort, name: &str, procedures: Vec<ModuleProcedure>) -> Self {
        let ids = procedures
            .iter()
            .map(|p| (p.procedure_name.clone(), p.procedure_id))
            .collect();

        RpcClientModule {
            port,
            name: name.to_string(),
            procedures,
            ids,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> &RpcClientPort {
        &self.port
    }

    /// Procedures as declared by the server.
    pub fn procedures(&self) -> &[ModuleProcedure] {
        &self.procedures
    }

    pub fn procedure_names(&self) -> Vec<&str> {
        self.procedures
            .iter()
            .map(|p| p.procedure_name.as_str())
            .collect()
    }

    pub fn procedure_id(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    fn resolve(&self, name: &str) -> Result<(Arc<ClientInner>, u32)> {
        let client = self.port.client()?;
        let procedure_id = self
            .procedure_id(name)
            .ok_or_else(|| RpcError::UnknownProcedure(format!("{}.{}", self.name, name)))?;
        Ok((client, procedure_id))
    }

    fn request(&self, procedure_id: u32, payload: bytes::Bytes, client_stream: Option<u32>) -> Request {
        Request {
            message_identifier: 0,
            port_id: self.port.port_id(),
            procedure_id,
            payload,
            client_stream,
        }
    }

    /// Make a unary call
    pub async fn call_unary<Req, Res>(&self, name: &str, request: Req) -> Result<Res>
    where
        Req: Encoder,
        Res: Decoder,
    {
        let (client, procedure_id) = self.resolve(name)?;
        let request = self.request(procedure_id, request.encode()?, None);

        tracing::debug!(port_id = self.port.port_id(), procedure = name, "unary call");

        let response = client
            .with_timeout(
                client
                    .dispatcher
                    .send_and_wait_for_response(request, MessageKind::Response),
            )
            .await?;

        match response {
            Frame::Response(response) => Res::decode(&response.payload),
            other => Err(RpcError::UnexpectedResponse {
                expected: MessageKind::Response,
                actual: other.kind(),
            }),
        }
    }

    /// Make a server-stream call
    ///
    /// The request is sent right away; elements are requested from the
    /// server as the returned stream is polled.
    pub fn call_server_stream<Req, Res>(&self, name: &str, request: Req) -> Result<ResponseStream<Res>>
    where
        Req: Encoder,
        Res: Decoder,
    {
        let (client, procedure_id) = self.resolve(name)?;
        let payload = request.encode()?;

        let route = client.dispatcher.allocate_stream_route()?;
        let request = Frame::from(self.request(procedure_id, payload, None)).stamped(route.number());
        client.dispatcher.send_frame(&request)?;

        tracing::debug!(
            port_id = self.port.port_id(),
            procedure = name,
            message_number = route.number(),
            "server stream call"
        );

        let consumer = StreamConsumer::awaiting_offer(client.dispatcher.clone(), route, self.port.port_id());
        Ok(ResponseStream::new(consumer, None))
    }

    /// Make a client-stream call
    ///
    /// `requests` is pumped as the server acknowledges each element; the
    /// call completes with the server's single response.
    pub async fn call_client_stream<Req, Res, S>(&self, name: &str, requests: S) -> Result<Res>
    where
        Req: Encoder + Send + 'static,
        Res: Decoder,
        S: Stream<Item = Req> + Send + 'static,
    {
        let (client, procedure_id) = self.resolve(name)?;

        let pending = client.dispatcher.register_response()?;
        let reservation = client.dispatcher.reserve_number()?;
        let stream_number = reservation.number();
        let first_ack = client.dispatcher.register_stream_waiter(stream_number, 0)?;

        let request = Frame::from(self.request(procedure_id, bytes::Bytes::new(), Some(stream_number)))
            .stamped(pending.number());
        client.dispatcher.send_frame(&request)?;

        tracing::debug!(
            port_id = self.port.port_id(),
            procedure = name,
            message_number = pending.number(),
            stream_number,
            "client stream call"
        );

        let producer = StreamProducer::offered(
            client.dispatcher.clone(),
            self.port.port_id(),
            stream_number,
            first_ack,
        );
        let cancel = CancellationToken::new();
        // cancels the pump once the call is done or dropped
        let _pump_guard = cancel.clone().drop_guard();
        let port_id = self.port.port_id();
        let mut pump_task = tokio::spawn(pump(
            producer,
            client.dispatcher.clone(),
            port_id,
            requests,
            reservation,
            cancel,
        ));

        let call = async {
            let response = pending.wait();
            tokio::pin!(response);

            let mut pumping = true;
            loop {
                tokio::select! {
                    response = &mut response => break response,
                    result = &mut pump_task, if pumping => {
                        pumping = false;
                        result.map_err(|_| RpcError::Cancelled)??;
                    }
                }
            }
        };

        match client.with_timeout(call).await? {
            Frame::Response(response) => Res::decode(&response.payload),
            other => Err(RpcError::UnexpectedResponse {
                expected: MessageKind::Response,
                actual: other.kind(),
            }),
        }
    }

    /// Make a bidirectional-stream call
    ///
    /// `requests` is pumped in the background while the returned stream
    /// yields the server's elements. Dropping the returned stream stops
    /// the pump.
    pub fn call_bidirectional_stream<Req, Res, S>(
        &self,
        name: &str,
        requests: S,
    ) -> Result<ResponseStream<Res>>
    where
        Req: Encoder + Send + 'static,
        Res: Decoder,
        S: Stream<Item = Req> + Send + 'static,
    {
        let (client, procedure_id) = self.resolve(name)?;

        let route = client.dispatcher.allocate_stream_route()?;
        let reservation = client.dispatcher.reserve_number()?;
        let stream_number = reservation.number();
        let first_ack = client.dispatcher.register_stream_waiter(stream_number, 0)?;

        let request = Frame::from(self.request(procedure_id, bytes::Bytes::new(), Some(stream_number)))
            .stamped(route.number());
        client.dispatcher.send_frame(&request)?;

        tracing::debug!(
            port_id = self.port.port_id(),
            procedure = name,
            message_number = route.number(),
            stream_number,
            "bidirectional stream call"
        );

        let producer = StreamProducer::offered(
            client.dispatcher.clone(),
            self.port.port_id(),
            stream_number,
            first_ack,
        );
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let port_id = self.port.port_id();
        let dispatcher = client.dispatcher.clone();
        tokio::spawn(async move {
            if let Err(err) = pump(producer, dispatcher, port_id, requests, reservation, cancel).await {
                tracing::debug!(port_id, stream_number, error = %err, "request stream failed");
            }
        });

        let consumer = StreamConsumer::awaiting_offer(client.dispatcher.clone(), route, port_id);
        Ok(ResponseStream::new(consumer, Some(guard)))
    }
}

/// Drive an outbound request stream. A local failure closes the stream
/// towards the server.
async fn pump<Req, S>(
    producer: StreamProducer,
    dispatcher: MessageDispatcher,
    port_id: u32,
    requests: S,
    reservation: NumberReservation,
    cancel: CancellationToken,
) -> Result<()>
where
    Req: Encoder + Send + 'static,
    S: Stream<Item = Req> + Send + 'static,
{
    let stream_number = producer.message_number();
    let source = requests.map(|request| request.encode()).boxed();

    let outcome = producer.run(source, cancel).await;
    drop(reservation);

    match outcome {
        ProducerOutcome::Completed { .. }
        | ProducerOutcome::ClosedByConsumer { .. }
        | ProducerOutcome::Cancelled => Ok(()),
        ProducerOutcome::Failed { error, sequence_id } => {
            if !error.is_transport() && error != RpcError::Disposed {
                let close = StreamMessage::close(port_id, stream_number, sequence_id);
                let _ = dispatcher.send_frame(&Frame::from(close));
            }
            Err(error)
        }
    }
}

/// Typed stream of response elements.
pub struct ResponseStream<T> {
    consumer: StreamConsumer,
    _pump: Option<DropGuard>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ResponseStream<T> {
    fn new(consumer: StreamConsumer, pump: Option<DropGuard>) -> Self {
        ResponseStream {
            consumer,
            _pump: pump,
            _marker: PhantomData,
        }
    }

    pub fn message_number(&self) -> u32 {
        self.consumer.message_number()
    }
}

impl<T: Decoder> Stream for ResponseStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.consumer
            .poll_next_unpin(cx)
            .map(|item| item.map(|payload| payload.and_then(|bytes| T::decode(&bytes))))
    }
}
