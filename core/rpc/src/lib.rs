// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod module;
pub mod port;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod transport;

pub use client::{ResponseStream, RpcClient, RpcClientModule, RpcClientPort};
pub use codec::{Codec, Decoder, Encoder};
pub use config::{ClientConfig, ConfigurationError, DispatcherConfig, ServerConfig};
pub use context::RequestContext;
pub use dispatcher::{ConnectionState, MessageDispatcher, ParsedMessage};
pub use errors::{Result, RpcError, TransportError};
pub use module::{ModuleDeclaration, ProcedureKind, RequestStream, ServiceModule};
pub use port::RpcServerPort;
pub use protocol::{Frame, MessageKind};
pub use server::{PortHandler, RpcServer};
pub use stream::{ProducerOutcome, StreamConsumer, StreamProducer, StreamState};
pub use transport::memory::MemoryTransport;
pub use transport::{Transport, TransportEvent, TransportEventReceiver, TransportEvents};
