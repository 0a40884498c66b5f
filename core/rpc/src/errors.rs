// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::protocol::MessageKind;

/// Error code carried by RemoteErrorResponse frames when nothing more
/// specific applies.
pub const REMOTE_ERROR_UNKNOWN: u32 = 0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport failure: {0}")]
    Failure(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    // Transport
    #[error("transport closed")]
    TransportClosed,
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("timed out waiting for transport to connect")]
    ConnectTimeout,

    // Wire
    #[error("error decoding frame: {0}")]
    Decode(String),
    #[error("error encoding frame: {0}")]
    Encode(String),
    #[error("unknown message kind: {0}")]
    UnknownMessageKind(u32),
    #[error("unexpected response: expected {expected:?}, got {actual:?}")]
    UnexpectedResponse {
        expected: MessageKind,
        actual: MessageKind,
    },
    #[error("protocol violation: {0}")]
    Protocol(String),

    // Registry
    #[error("unknown port: {0}")]
    UnknownPort(u32),
    #[error("unknown module: {0}")]
    UnknownModule(String),
    #[error("module already registered: {0}")]
    ModuleAlreadyRegistered(String),
    #[error("unknown procedure: {0}")]
    UnknownProcedure(String),
    #[error("port closed: {0}")]
    PortClosed(u32),

    // Calls
    #[error("remote error (code={code}): {message}")]
    Remote { code: u32, message: String },
    #[error("codec error: {0}")]
    Codec(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("instance disposed")]
    Disposed,
    #[error("operation timed out")]
    Timeout,
    #[error("too many pending calls: {0}")]
    ResourceExhausted(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl RpcError {
    pub fn remote(code: u32, message: impl Into<String>) -> Self {
        RpcError::Remote {
            code,
            message: message.into(),
        }
    }

    /// Code reported to the peer when this error terminates a request.
    pub fn code(&self) -> u32 {
        match self {
            RpcError::Remote { code, .. } => *code,
            RpcError::Cancelled => 1,
            RpcError::Codec(_) | RpcError::Decode(_) => 3,
            RpcError::Timeout => 4,
            RpcError::UnknownModule(_)
            | RpcError::UnknownProcedure(_)
            | RpcError::UnknownPort(_) => 5,
            RpcError::ResourceExhausted(_) => 8,
            RpcError::PortClosed(_) | RpcError::Disposed => 14,
            _ => REMOTE_ERROR_UNKNOWN,
        }
    }

    /// True for failures caused by the transport going away.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::TransportClosed | RpcError::TransportFailure(_)
        )
    }
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => RpcError::TransportClosed,
            TransportError::Failure(cause) => RpcError::TransportFailure(cause),
        }
    }
}

impl From<ConfigurationError> for RpcError {
    fn from(err: ConfigurationError) -> Self {
        RpcError::InvalidConfiguration(err.to_string())
    }
}

impl From<prost::DecodeError> for RpcError {
    fn from(err: prost::DecodeError) -> Self {
        RpcError::Decode(err.to_string())
    }
}

impl From<prost::EncodeError> for RpcError {
    fn from(err: prost::EncodeError) -> Self {
        RpcError::Encode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_conversion() {
        assert_eq!(RpcError::from(TransportError::Closed), RpcError::TransportClosed);
        let err = RpcError::from(TransportError::Failure("reset".to_string()));
        assert!(err.is_transport());
        assert_eq!(err.to_string(), "transport failure: reset");
    }

    #[test]
    fn test_codes() {
        assert_eq!(RpcError::remote(42, "boom").code(), 42);
        assert_eq!(RpcError::Cancelled.code(), 1);
        assert_eq!(RpcError::Codec("bad".to_string()).code(), 3);
        assert_eq!(RpcError::TransportClosed.code(), REMOTE_ERROR_UNKNOWN);
        assert!(!RpcError::Cancelled.is_transport());
    }

    #[test]
    fn test_configuration_error_conversion() {
        let err = RpcError::from(ConfigurationError::InvalidMaxPendingCalls);
        assert_eq!(
            err,
            RpcError::InvalidConfiguration(
                "max pending calls must be greater than zero".to_string()
            )
        );
        assert_eq!(err.code(), REMOTE_ERROR_UNKNOWN);
    }
}
