// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Server-side RPC handling implementation
//!
//! An `RpcServer` owns the ports created by its clients. Each attached
//! transport gets its own dispatcher and serve loop; port commands are
//! handled in arrival order on that loop while requests run as separate
//! tasks tracked for graceful disposal.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::Future;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use portrpc_config::component::configuration::Configuration;

use crate::config::ServerConfig;
use crate::context::RequestContext;
use crate::dispatcher::{MessageDispatcher, ParsedMessage};
use crate::errors::{Result, RpcError};
use crate::module::Procedure;
use crate::port::RpcServerPort;
use crate::protocol::{
    CreatePortResponse, Frame, RemoteError, Request, RequestModuleResponse, Response,
};
use crate::stream::{ProducerOutcome, StreamConsumer, StreamProducer};
use crate::transport::Transport;

/// Called for every new port, typically to register its modules.
#[async_trait]
pub trait PortHandler<C: Send + Sync + 'static>: Send + Sync + 'static {
    async fn on_port_created(&self, port: RpcServerPort<C>, context: Arc<C>) -> Result<()>;
}

#[async_trait]
impl<C, F, Fut> PortHandler<C> for F
where
    C: Send + Sync + 'static,
    F: Fn(RpcServerPort<C>, Arc<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn on_port_created(&self, port: RpcServerPort<C>, context: Arc<C>) -> Result<()> {
        self(port, context).await
    }
}

struct PortEntry<C> {
    port: RpcServerPort<C>,
    attachment: u64,
}

/// Internal server state shared across clones
struct ServerInner<C> {
    config: ServerConfig,
    handler: RwLock<Option<Arc<dyn PortHandler<C>>>>,
    /// port ids are never reused within the server lifetime
    next_port_id: AtomicU32,
    ports: RwLock<HashMap<u32, PortEntry<C>>>,
    next_attachment: AtomicU64,
    attachments: RwLock<HashMap<u64, MessageDispatcher>>,
    /// Cancellation token for shutdown
    cancellation_token: CancellationToken,
    /// Drain signal for graceful shutdown
    drain_signal: Mutex<Option<drain::Signal>>,
    /// Drain watch for request handlers
    drain_watch: RwLock<Option<drain::Watch>>,
    disposed: AtomicBool,
}

/// RPC Server
///
/// `C` is the per-transport context handed to the port handler and to
/// every procedure.
pub struct RpcServer<C> {
    inner: Arc<ServerInner<C>>,
}

impl<C> Clone for RpcServer<C> {
    fn clone(&self) -> Self {
        RpcServer {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> Default for RpcServer<C> {
    fn default() -> Self {
        Self::with_config(ServerConfig::default())
    }
}

impl<C: Send + Sync + 'static> RpcServer<C> {
    /// Create a server, validating `config` first.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_config(config))
    }

    fn with_config(config: ServerConfig) -> Self {
        let (drain_signal, drain_watch) = drain::channel();

        RpcServer {
            inner: Arc::new(ServerInner {
                config,
                handler: RwLock::new(None),
                next_port_id: AtomicU32::new(1),
                ports: RwLock::new(HashMap::new()),
                next_attachment: AtomicU64::new(1),
                attachments: RwLock::new(HashMap::new()),
                cancellation_token: CancellationToken::new(),
                drain_signal: Mutex::new(Some(drain_signal)),
                drain_watch: RwLock::new(Some(drain_watch)),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Set the handler invoked for every new port.
    pub fn set_handler(&self, handler: impl PortHandler<C>) {
        *self.inner.handler.write() = Some(Arc::new(handler));
    }

    /// Serve a new transport. `context` is shared by every port created
    /// over it.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>, context: Arc<C>) -> Result<()> {
        if self.is_disposed() {
            return Err(RpcError::Disposed);
        }

        let dispatcher = MessageDispatcher::new(transport, self.inner.config.dispatcher.clone());
        let inbound = dispatcher.subscribe();
        let attachment = self.inner.next_attachment.fetch_add(1, Ordering::Relaxed);
        self.inner
            .attachments
            .write()
            .insert(attachment, dispatcher.clone());

        tracing::debug!(attachment, "transport attached");

        let server = self.clone();
        tokio::spawn(async move {
            server.serve(attachment, dispatcher, inbound, context).await;
        });

        Ok(())
    }

    /// Ids of the live ports, sorted.
    pub fn port_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.inner.ports.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn port(&self, port_id: u32) -> Option<RpcServerPort<C>> {
        self.inner
            .ports
            .read()
            .get(&port_id)
            .map(|entry| entry.port.clone())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Destroy a port: cancel its in-flight handlers and drop its modules.
    pub fn destroy_port(&self, port_id: u32) -> Result<()> {
        let entry = self
            .inner
            .ports
            .write()
            .remove(&port_id)
            .ok_or(RpcError::UnknownPort(port_id))?;

        entry.port.close();
        Ok(())
    }

    /// Dispose the server gracefully
    ///
    /// Cancels every port, waits for in-flight handlers to drain (bounded
    /// by the configured drain timeout) and closes all attached transports.
    /// Disposing twice is a no-op.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::info!("disposing rpc server");

        // serve loops detach themselves once cancelled
        let attachments: Vec<MessageDispatcher> =
            self.inner.attachments.read().values().cloned().collect();

        self.inner.cancellation_token.cancel();

        let ports: Vec<RpcServerPort<C>> = self
            .inner
            .ports
            .write()
            .drain()
            .map(|(_, entry)| entry.port)
            .collect();
        for port in ports {
            port.close();
        }

        // Take the drain signal and drop our watch to complete the drain
        let drain_signal = self.inner.drain_signal.lock().take();
        drop(self.inner.drain_watch.write().take());

        if let Some(signal) = drain_signal {
            tracing::debug!("draining active requests");
            match tokio::time::timeout(self.inner.config.drain_timeout, signal.drain()).await {
                Ok(()) => tracing::debug!("all requests drained"),
                Err(_) => tracing::warn!(
                    timeout = ?self.inner.config.drain_timeout,
                    "timed out draining requests"
                ),
            }
        }

        self.inner.attachments.write().clear();
        for dispatcher in attachments {
            dispatcher.close();
        }

        tracing::info!("rpc server disposed");
    }

    async fn serve(
        self,
        attachment: u64,
        dispatcher: MessageDispatcher,
        mut inbound: mpsc::UnboundedReceiver<ParsedMessage>,
        context: Arc<C>,
    ) {
        loop {
            let message = tokio::select! {
                _ = self.inner.cancellation_token.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            self.handle_message(attachment, &dispatcher, &context, message)
                .await;
        }

        self.detach(attachment);
    }

    /// Drop the ports created over a transport that went away.
    fn detach(&self, attachment: u64) {
        self.inner.attachments.write().remove(&attachment);

        let ports: Vec<RpcServerPort<C>> = {
            let mut ports = self.inner.ports.write();
            let ids: Vec<u32> = ports
                .iter()
                .filter(|(_, entry)| entry.attachment == attachment)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| ports.remove(&id))
                .map(|entry| entry.port)
                .collect()
        };

        for port in &ports {
            port.close();
        }

        tracing::debug!(attachment, closed_ports = ports.len(), "transport detached");
    }

    async fn handle_message(
        &self,
        attachment: u64,
        dispatcher: &MessageDispatcher,
        context: &Arc<C>,
        message: ParsedMessage,
    ) {
        let number = message.message_number;

        match message.frame {
            Frame::CreatePort(create) => {
                self.create_port(attachment, dispatcher, context, &create.port_name, number)
                    .await
            }
            Frame::RequestModule(request) => {
                let Some(port) = self.port(request.port_id) else {
                    tracing::error!(
                        port_id = request.port_id,
                        module = %request.module_name,
                        "module requested on unknown port"
                    );
                    return;
                };

                let reply = match port.load_module(&request.module_name).await {
                    Ok(declaration) => Frame::from(RequestModuleResponse {
                        message_identifier: 0,
                        port_id: port.port_id(),
                        procedures: declaration.procedures,
                    }),
                    Err(err) => {
                        tracing::debug!(
                            port_id = request.port_id,
                            module = %request.module_name,
                            error = %err,
                            "module load failed"
                        );
                        error_frame(&err)
                    }
                };

                send_reply(dispatcher, reply.stamped(number));
            }
            Frame::DestroyPort(destroy) => {
                if let Err(err) = self.destroy_port(destroy.port_id) {
                    tracing::error!(port_id = destroy.port_id, error = %err, "cannot destroy port");
                } else {
                    tracing::debug!(port_id = destroy.port_id, "port destroyed");
                }
            }
            Frame::Request(request) => self.spawn_request(dispatcher, request, number),
            other => {
                tracing::debug!(
                    kind = ?other.kind(),
                    message_number = number,
                    "ignoring unsolicited frame"
                );
            }
        }
    }

    async fn create_port(
        &self,
        attachment: u64,
        dispatcher: &MessageDispatcher,
        context: &Arc<C>,
        port_name: &str,
        number: u32,
    ) {
        let port_id = self.inner.next_port_id.fetch_add(1, Ordering::Relaxed);
        let port = RpcServerPort::new(
            port_id,
            port_name,
            context.clone(),
            self.inner.cancellation_token.child_token(),
        );
        self.inner.ports.write().insert(
            port_id,
            PortEntry {
                port: port.clone(),
                attachment,
            },
        );

        let handler = self.inner.handler.read().clone();
        let result = match handler {
            Some(handler) => handler.on_port_created(port.clone(), context.clone()).await,
            None => {
                tracing::warn!(port_id, port_name, "no port handler set; port has no modules");
                Ok(())
            }
        };

        let reply = match result {
            Ok(()) => {
                tracing::debug!(port_id, port_name, "port created");
                Frame::from(CreatePortResponse {
                    message_identifier: 0,
                    port_id,
                })
            }
            Err(err) => {
                tracing::error!(port_id, port_name, error = %err, "port handler failed");
                self.inner.ports.write().remove(&port_id);
                port.close();
                error_frame(&err)
            }
        };

        send_reply(dispatcher, reply.stamped(number));
    }

    fn spawn_request(&self, dispatcher: &MessageDispatcher, request: Request, number: u32) {
        let Some(port) = self.port(request.port_id) else {
            tracing::error!(
                port_id = request.port_id,
                message_number = number,
                "request for unknown port"
            );
            return;
        };

        let Some(procedure) = port.procedure(request.procedure_id) else {
            tracing::error!(
                port_id = request.port_id,
                procedure_id = request.procedure_id,
                message_number = number,
                "request for unknown procedure"
            );
            return;
        };

        if procedure.takes_stream() && request.client_stream.is_none() {
            tracing::error!(
                port_id = request.port_id,
                procedure_id = request.procedure_id,
                "stream procedure called without a client stream"
            );
            return;
        }

        // Get a drain watch handle for this request
        let Some(drain_watch) = self.inner.drain_watch.read().clone() else {
            tracing::debug!(message_number = number, "server disposing; request dropped");
            return;
        };

        let ctx = RequestContext::new(
            port.context().clone(),
            port.port_id(),
            port.shared_name(),
            request.procedure_id,
            port.cancellation_token().clone(),
        );
        let dispatcher = dispatcher.clone();

        tokio::spawn(async move {
            let _drain_watch = drain_watch;
            let cancellation = ctx.cancellation_token().clone();

            let result = tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(RpcError::Cancelled),
                result = execute(&dispatcher, procedure, request, number, ctx) => result,
            };

            if let Err(err) = result {
                if err.is_transport() {
                    tracing::debug!(message_number = number, error = %err, "request aborted");
                    return;
                }
                tracing::debug!(message_number = number, error = %err, "request failed");
                send_reply(&dispatcher, error_frame(&err).stamped(number));
            }
        });
    }
}

/// Run one request to completion, replying for unary and client-stream
/// procedures. Errors are reported by the caller.
async fn execute<C: Send + Sync + 'static>(
    dispatcher: &MessageDispatcher,
    procedure: Procedure<C>,
    request: Request,
    number: u32,
    ctx: RequestContext<C>,
) -> Result<()> {
    let port_id = request.port_id;

    let client_stream = || -> Result<StreamConsumer> {
        let stream_number = request
            .client_stream
            .ok_or_else(|| RpcError::Protocol("missing client stream".to_string()))?;
        let route = dispatcher.open_stream_route(stream_number)?;
        Ok(StreamConsumer::offered(dispatcher.clone(), route, port_id))
    };

    match &procedure {
        Procedure::Unary(handler) => {
            let payload = handler(request.payload.clone(), ctx).await?;
            respond(dispatcher, payload, number)
        }
        Procedure::ClientStream(handler) => {
            let input = client_stream()?;
            let payload = handler(input.boxed(), ctx).await?;
            respond(dispatcher, payload, number)
        }
        Procedure::ServerStream(handler) => {
            let cancellation = ctx.cancellation_token().clone();
            let output = handler(request.payload.clone(), ctx).await?;
            let producer = StreamProducer::new(dispatcher.clone(), port_id, number);
            producer_result(producer.run(output, cancellation).await)
        }
        Procedure::BidirectionalStream(handler) => {
            let input = client_stream()?;
            let cancellation = ctx.cancellation_token().clone();
            let output = handler(input.boxed(), ctx).await?;
            let producer = StreamProducer::new(dispatcher.clone(), port_id, number);
            producer_result(producer.run(output, cancellation).await)
        }
    }
}

fn respond(dispatcher: &MessageDispatcher, payload: bytes::Bytes, number: u32) -> Result<()> {
    let response = Frame::from(Response {
        message_identifier: 0,
        payload,
    })
    .stamped(number);
    dispatcher.send_frame(&response)
}

fn producer_result(outcome: ProducerOutcome) -> Result<()> {
    match outcome {
        ProducerOutcome::Completed { .. } | ProducerOutcome::ClosedByConsumer { .. } => Ok(()),
        ProducerOutcome::Failed { error, .. } => Err(error),
        ProducerOutcome::Cancelled => Err(RpcError::Cancelled),
    }
}

fn error_frame(err: &RpcError) -> Frame {
    let error_message = match err {
        RpcError::Remote { message, .. } => message.clone(),
        other => other.to_string(),
    };

    Frame::from(RemoteError {
        message_identifier: 0,
        error_code: err.code(),
        error_message,
    })
}

fn send_reply(dispatcher: &MessageDispatcher, frame: Frame) {
    if let Err(err) = dispatcher.send_frame(&frame) {
        tracing::debug!(
            kind = ?frame.kind(),
            message_number = frame.message_number(),
            error = %err,
            "failed to send reply"
        );
    }
}
