// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Service modules
//!
//! A module is a named group of procedures. Handlers are registered typed
//! and stored behind one byte-level signature per call shape, so a port
//! keeps a single procedure table indexed by procedure id.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{Stream, StreamExt};
use futures::{Future, FutureExt};

use crate::codec::{Decoder, Encoder};
use crate::context::RequestContext;
use crate::errors::Result;
use crate::protocol::ModuleProcedure;
use crate::stream::PayloadStream;

/// Typed inbound stream handed to client-stream and bidirectional handlers.
pub type RequestStream<T> = futures::stream::BoxStream<'static, Result<T>>;

pub type UnaryHandler<C> =
    Arc<dyn Fn(Bytes, RequestContext<C>) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

pub type ServerStreamHandler<C> = Arc<
    dyn Fn(Bytes, RequestContext<C>) -> BoxFuture<'static, Result<PayloadStream>> + Send + Sync,
>;

pub type ClientStreamHandler<C> = Arc<
    dyn Fn(PayloadStream, RequestContext<C>) -> BoxFuture<'static, Result<Bytes>> + Send + Sync,
>;

pub type BidirectionalStreamHandler<C> = Arc<
    dyn Fn(PayloadStream, RequestContext<C>) -> BoxFuture<'static, Result<PayloadStream>>
        + Send
        + Sync,
>;

/// Call shape of a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    Unary,
    ServerStream,
    ClientStream,
    BidirectionalStream,
}

/// A registered procedure, tagged by call shape.
pub enum Procedure<C> {
    Unary(UnaryHandler<C>),
    ServerStream(ServerStreamHandler<C>),
    ClientStream(ClientStreamHandler<C>),
    BidirectionalStream(BidirectionalStreamHandler<C>),
}

impl<C> Clone for Procedure<C> {
    fn clone(&self) -> Self {
        match self {
            Procedure::Unary(h) => Procedure::Unary(h.clone()),
            Procedure::ServerStream(h) => Procedure::ServerStream(h.clone()),
            Procedure::ClientStream(h) => Procedure::ClientStream(h.clone()),
            Procedure::BidirectionalStream(h) => Procedure::BidirectionalStream(h.clone()),
        }
    }
}

impl<C> std::fmt::Debug for Procedure<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Procedure::{:?}", self.kind())
    }
}

impl<C> Procedure<C> {
    pub fn kind(&self) -> ProcedureKind {
        match self {
            Procedure::Unary(_) => ProcedureKind::Unary,
            Procedure::ServerStream(_) => ProcedureKind::ServerStream,
            Procedure::ClientStream(_) => ProcedureKind::ClientStream,
            Procedure::BidirectionalStream(_) => ProcedureKind::BidirectionalStream,
        }
    }

    /// True when the request carries a client stream number.
    pub fn takes_stream(&self) -> bool {
        matches!(
            self,
            Procedure::ClientStream(_) | Procedure::BidirectionalStream(_)
        )
    }
}

/// Procedures exposed by a loaded module, with the ids assigned on its port.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDeclaration {
    pub name: String,
    pub procedures: Vec<ModuleProcedure>,
}

impl ModuleDeclaration {
    pub fn procedure_id(&self, name: &str) -> Option<u32> {
        self.procedures
            .iter()
            .find(|p| p.procedure_name == name)
            .map(|p| p.procedure_id)
    }
}

fn decode_stream<Req: Decoder + Send + 'static>(stream: PayloadStream) -> RequestStream<Req> {
    stream
        .map(|item| item.and_then(|bytes| Req::decode(&bytes)))
        .boxed()
}

fn encode_stream<Res, S>(stream: S) -> PayloadStream
where
    Res: Encoder + Send + 'static,
    S: Stream<Item = Result<Res>> + Send + 'static,
{
    stream.map(|item| item.and_then(|res| res.encode())).boxed()
}

/// Builder for the procedures of one module.
///
/// Procedure ids are assigned at load time: unary procedures first, then
/// server-stream, client-stream and bidirectional ones, each in
/// registration order.
pub struct ServiceModule<C> {
    unary: Vec<(String, Procedure<C>)>,
    server_streams: Vec<(String, Procedure<C>)>,
    client_streams: Vec<(String, Procedure<C>)>,
    bidirectional_streams: Vec<(String, Procedure<C>)>,
}

impl<C> Default for ServiceModule<C> {
    fn default() -> Self {
        ServiceModule {
            unary: Vec::new(),
            server_streams: Vec::new(),
            client_streams: Vec::new(),
            bidirectional_streams: Vec::new(),
        }
    }
}

impl<C: Send + Sync + 'static> ServiceModule<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unary procedure
    pub fn unary<F, Req, Res, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Req, RequestContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res>> + Send + 'static,
        Req: Decoder + Send + 'static,
        Res: Encoder + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapper: UnaryHandler<C> = Arc::new(move |bytes: Bytes, ctx: RequestContext<C>| {
            let handler = Arc::clone(&handler);
            async move {
                let request = Req::decode(&bytes)?;
                let response = handler(request, ctx).await?;
                response.encode()
            }
            .boxed()
        });

        self.unary.push((name.to_string(), Procedure::Unary(wrapper)));
        self
    }

    /// Register a server-stream procedure
    pub fn server_stream<F, Req, Res, S, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Req, RequestContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S>> + Send + 'static,
        S: Stream<Item = Result<Res>> + Send + 'static,
        Req: Decoder + Send + 'static,
        Res: Encoder + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapper: ServerStreamHandler<C> =
            Arc::new(move |bytes: Bytes, ctx: RequestContext<C>| {
                let handler = Arc::clone(&handler);
                async move {
                    let request = Req::decode(&bytes)?;
                    let responses = handler(request, ctx).await?;
                    Ok(encode_stream(responses))
                }
                .boxed()
            });

        self.server_streams
            .push((name.to_string(), Procedure::ServerStream(wrapper)));
        self
    }

    /// Register a client-stream procedure
    pub fn client_stream<F, Req, Res, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(RequestStream<Req>, RequestContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res>> + Send + 'static,
        Req: Decoder + Send + 'static,
        Res: Encoder + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapper: ClientStreamHandler<C> =
            Arc::new(move |stream: PayloadStream, ctx: RequestContext<C>| {
                let handler = Arc::clone(&handler);
                async move {
                    let response = handler(decode_stream(stream), ctx).await?;
                    response.encode()
                }
                .boxed()
            });

        self.client_streams
            .push((name.to_string(), Procedure::ClientStream(wrapper)));
        self
    }

    /// Register a bidirectional-stream procedure
    pub fn bidirectional_stream<F, Req, Res, S, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(RequestStream<Req>, RequestContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S>> + Send + 'static,
        S: Stream<Item = Result<Res>> + Send + 'static,
        Req: Decoder + Send + 'static,
        Res: Encoder + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapper: BidirectionalStreamHandler<C> =
            Arc::new(move |stream: PayloadStream, ctx: RequestContext<C>| {
                let handler = Arc::clone(&handler);
                async move {
                    let responses = handler(decode_stream(stream), ctx).await?;
                    Ok(encode_stream(responses))
                }
                .boxed()
            });

        self.bidirectional_streams
            .push((name.to_string(), Procedure::BidirectionalStream(wrapper)));
        self
    }

    pub fn len(&self) -> usize {
        self.unary.len()
            + self.server_streams.len()
            + self.client_streams.len()
            + self.bidirectional_streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Procedure names in id assignment order.
    pub fn procedure_names(&self) -> Vec<&str> {
        self.ordered().map(|(name, _)| name.as_str()).collect()
    }

    fn ordered(&self) -> impl Iterator<Item = &(String, Procedure<C>)> {
        self.unary
            .iter()
            .chain(self.server_streams.iter())
            .chain(self.client_streams.iter())
            .chain(self.bidirectional_streams.iter())
    }

    pub(crate) fn into_procedures(self) -> impl Iterator<Item = (String, Procedure<C>)> {
        self.unary
            .into_iter()
            .chain(self.server_streams)
            .chain(self.client_streams)
            .chain(self.bidirectional_streams)
    }
}
