// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol
//!
//! Every frame is a protobuf message whose first field is a fixed32
//! message identifier packing the message kind (4 bits) and the sender's
//! message number (27 bits). The remaining fields depend on the kind.

use bytes::Bytes;
use prost::Message;

use crate::errors::{Result, RpcError};

/// Position of the kind tag inside the identifier
pub const KIND_SHIFT: u32 = 27;

/// Mask applied to the kind tag before packing
pub const KIND_MASK: u32 = 0xF;

/// Mask selecting the message number bits of the identifier
pub const MESSAGE_NUMBER_MASK: u32 = 0x07FF_FFFF;

/// Catalogue of message kinds. Value 6 and 12..=15 are unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    Request = 1,
    RequestModule = 2,
    RequestModuleResponse = 3,
    Response = 4,
    StreamMessage = 5,
    CreatePort = 7,
    CreatePortResponse = 8,
    RemoteErrorResponse = 9,
    DestroyPort = 10,
    /// Reserved for a future server handshake, never produced.
    ServerReady = 11,
}

impl MessageKind {
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = RpcError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(MessageKind::Request),
            2 => Ok(MessageKind::RequestModule),
            3 => Ok(MessageKind::RequestModuleResponse),
            4 => Ok(MessageKind::Response),
            5 => Ok(MessageKind::StreamMessage),
            7 => Ok(MessageKind::CreatePort),
            8 => Ok(MessageKind::CreatePortResponse),
            9 => Ok(MessageKind::RemoteErrorResponse),
            10 => Ok(MessageKind::DestroyPort),
            11 => Ok(MessageKind::ServerReady),
            other => Err(RpcError::UnknownMessageKind(other)),
        }
    }
}

pub fn pack_identifier(kind: MessageKind, number: u32) -> u32 {
    ((kind.as_u32() & KIND_MASK) << KIND_SHIFT) | (number & MESSAGE_NUMBER_MASK)
}

/// Split an identifier into its raw kind tag and message number.
pub fn split_identifier(identifier: u32) -> (u32, u32) {
    (
        (identifier >> KIND_SHIFT) & KIND_MASK,
        identifier & MESSAGE_NUMBER_MASK,
    )
}

pub fn unpack_identifier(identifier: u32) -> Result<(MessageKind, u32)> {
    let (kind, number) = split_identifier(identifier);
    Ok((MessageKind::try_from(kind)?, number))
}

/// Only the identifier, used to peek at a frame before decoding its body.
#[derive(Clone, PartialEq, Message)]
struct FrameHeader {
    #[prost(fixed32, tag = "1")]
    message_identifier: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct CreatePort {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(string, tag = "2")]
    pub port_name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct CreatePortResponse {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(fixed32, tag = "2")]
    pub port_id: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct DestroyPort {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(fixed32, tag = "2")]
    pub port_id: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct RequestModule {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(fixed32, tag = "2")]
    pub port_id: u32,
    #[prost(string, tag = "3")]
    pub module_name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ModuleProcedure {
    #[prost(fixed32, tag = "1")]
    pub procedure_id: u32,
    #[prost(string, tag = "2")]
    pub procedure_name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct RequestModuleResponse {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(fixed32, tag = "2")]
    pub port_id: u32,
    #[prost(message, repeated, tag = "5")]
    pub procedures: Vec<ModuleProcedure>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Request {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(fixed32, tag = "2")]
    pub port_id: u32,
    #[prost(fixed32, tag = "4")]
    pub procedure_id: u32,
    #[prost(bytes = "bytes", tag = "6")]
    pub payload: Bytes,
    /// Message number of the client stream offered with this request
    #[prost(fixed32, optional, tag = "7")]
    pub client_stream: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Response {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
}

#[derive(Clone, PartialEq, Message)]
pub struct StreamMessage {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(fixed32, tag = "2")]
    pub port_id: u32,
    #[prost(fixed32, tag = "3")]
    pub sequence_id: u32,
    #[prost(bytes = "bytes", tag = "4")]
    pub payload: Bytes,
    #[prost(bool, tag = "5")]
    pub closed: bool,
    #[prost(bool, tag = "6")]
    pub ack: bool,
}

impl StreamMessage {
    fn with(port_id: u32, message_number: u32, sequence_id: u32) -> Self {
        StreamMessage {
            message_identifier: pack_identifier(MessageKind::StreamMessage, message_number),
            port_id,
            sequence_id,
            payload: Bytes::new(),
            closed: false,
            ack: false,
        }
    }

    /// Offer frame: sequence 0, no payload, not closed.
    pub fn offer(port_id: u32, message_number: u32) -> Self {
        Self::with(port_id, message_number, 0)
    }

    pub fn element(port_id: u32, message_number: u32, sequence_id: u32, payload: Bytes) -> Self {
        StreamMessage {
            payload,
            ..Self::with(port_id, message_number, sequence_id)
        }
    }

    pub fn ack(port_id: u32, message_number: u32, sequence_id: u32) -> Self {
        StreamMessage {
            ack: true,
            ..Self::with(port_id, message_number, sequence_id)
        }
    }

    pub fn close(port_id: u32, message_number: u32, sequence_id: u32) -> Self {
        StreamMessage {
            closed: true,
            ..Self::with(port_id, message_number, sequence_id)
        }
    }

    pub fn message_number(&self) -> u32 {
        split_identifier(self.message_identifier).1
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct RemoteError {
    #[prost(fixed32, tag = "1")]
    pub message_identifier: u32,
    #[prost(fixed32, tag = "2")]
    pub error_code: u32,
    #[prost(string, tag = "3")]
    pub error_message: String,
}

/// A decoded frame, tagged by message kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    CreatePort(CreatePort),
    CreatePortResponse(CreatePortResponse),
    DestroyPort(DestroyPort),
    RequestModule(RequestModule),
    RequestModuleResponse(RequestModuleResponse),
    Request(Request),
    Response(Response),
    StreamMessage(StreamMessage),
    RemoteErrorResponse(RemoteError),
}

impl Frame {
    pub fn kind(&self) -> MessageKind {
        match self {
            Frame::CreatePort(_) => MessageKind::CreatePort,
            Frame::CreatePortResponse(_) => MessageKind::CreatePortResponse,
            Frame::DestroyPort(_) => MessageKind::DestroyPort,
            Frame::RequestModule(_) => MessageKind::RequestModule,
            Frame::RequestModuleResponse(_) => MessageKind::RequestModuleResponse,
            Frame::Request(_) => MessageKind::Request,
            Frame::Response(_) => MessageKind::Response,
            Frame::StreamMessage(_) => MessageKind::StreamMessage,
            Frame::RemoteErrorResponse(_) => MessageKind::RemoteErrorResponse,
        }
    }

    fn identifier_mut(&mut self) -> &mut u32 {
        match self {
            Frame::CreatePort(m) => &mut m.message_identifier,
            Frame::CreatePortResponse(m) => &mut m.message_identifier,
            Frame::DestroyPort(m) => &mut m.message_identifier,
            Frame::RequestModule(m) => &mut m.message_identifier,
            Frame::RequestModuleResponse(m) => &mut m.message_identifier,
            Frame::Request(m) => &mut m.message_identifier,
            Frame::Response(m) => &mut m.message_identifier,
            Frame::StreamMessage(m) => &mut m.message_identifier,
            Frame::RemoteErrorResponse(m) => &mut m.message_identifier,
        }
    }

    pub fn message_identifier(&self) -> u32 {
        match self {
            Frame::CreatePort(m) => m.message_identifier,
            Frame::CreatePortResponse(m) => m.message_identifier,
            Frame::DestroyPort(m) => m.message_identifier,
            Frame::RequestModule(m) => m.message_identifier,
            Frame::RequestModuleResponse(m) => m.message_identifier,
            Frame::Request(m) => m.message_identifier,
            Frame::Response(m) => m.message_identifier,
            Frame::StreamMessage(m) => m.message_identifier,
            Frame::RemoteErrorResponse(m) => m.message_identifier,
        }
    }

    pub fn message_number(&self) -> u32 {
        split_identifier(self.message_identifier()).1
    }

    /// Write the identifier for this frame's kind and the given number.
    pub fn stamp(&mut self, message_number: u32) {
        let identifier = pack_identifier(self.kind(), message_number);
        *self.identifier_mut() = identifier;
    }

    pub fn stamped(mut self, message_number: u32) -> Self {
        self.stamp(message_number);
        self
    }

    pub fn encode(&self) -> Bytes {
        let buf = match self {
            Frame::CreatePort(m) => m.encode_to_vec(),
            Frame::CreatePortResponse(m) => m.encode_to_vec(),
            Frame::DestroyPort(m) => m.encode_to_vec(),
            Frame::RequestModule(m) => m.encode_to_vec(),
            Frame::RequestModuleResponse(m) => m.encode_to_vec(),
            Frame::Request(m) => m.encode_to_vec(),
            Frame::Response(m) => m.encode_to_vec(),
            Frame::StreamMessage(m) => m.encode_to_vec(),
            Frame::RemoteErrorResponse(m) => m.encode_to_vec(),
        };
        Bytes::from(buf)
    }

    /// Decode a frame, rejecting unknown or reserved kinds.
    pub fn decode(buf: &[u8]) -> Result<Frame> {
        let header = FrameHeader::decode(buf)?;
        let (kind, _) = unpack_identifier(header.message_identifier)?;

        let frame = match kind {
            MessageKind::CreatePort => Frame::CreatePort(CreatePort::decode(buf)?),
            MessageKind::CreatePortResponse => {
                Frame::CreatePortResponse(CreatePortResponse::decode(buf)?)
            }
            MessageKind::DestroyPort => Frame::DestroyPort(DestroyPort::decode(buf)?),
            MessageKind::RequestModule => Frame::RequestModule(RequestModule::decode(buf)?),
            MessageKind::RequestModuleResponse => {
                Frame::RequestModuleResponse(RequestModuleResponse::decode(buf)?)
            }
            MessageKind::Request => Frame::Request(Request::decode(buf)?),
            MessageKind::Response => Frame::Response(Response::decode(buf)?),
            MessageKind::StreamMessage => Frame::StreamMessage(StreamMessage::decode(buf)?),
            MessageKind::RemoteErrorResponse => {
                Frame::RemoteErrorResponse(RemoteError::decode(buf)?)
            }
            MessageKind::ServerReady => {
                return Err(RpcError::Protocol(
                    "reserved message kind ServerReady".to_string(),
                ));
            }
        };

        Ok(frame)
    }
}

pub fn encode_frame(frame: &Frame) -> Bytes {
    frame.encode()
}

pub fn decode_frame(buf: &[u8]) -> Result<Frame> {
    Frame::decode(buf)
}

macro_rules! impl_from_body {
    ($($body:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$body> for Frame {
                fn from(body: $body) -> Self {
                    Frame::$variant(body)
                }
            }
        )*
    };
}

impl_from_body! {
    CreatePort => CreatePort,
    CreatePortResponse => CreatePortResponse,
    DestroyPort => DestroyPort,
    RequestModule => RequestModule,
    RequestModuleResponse => RequestModuleResponse,
    Request => Request,
    Response => Response,
    StreamMessage => StreamMessage,
    RemoteError => RemoteErrorResponse,
}
