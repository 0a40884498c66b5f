// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Codec traits for payload serialization and deserialization
//!
//! The runtime moves payloads as opaque bytes. These traits let procedures
//! and calls be written against typed messages; they are typically
//! implemented by generated code or by the application's schema codec.

use bytes::Bytes;

use crate::errors::RpcError;

/// Trait for encoding messages to bytes
pub trait Encoder {
    /// Encode a message to bytes
    fn encode(&self) -> Result<Bytes, RpcError>;
}

/// Trait for decoding messages from bytes
pub trait Decoder: Default {
    /// Decode a message from bytes
    fn decode(buf: &[u8]) -> Result<Self, RpcError>;
}

/// Combined codec trait for types that can be both encoded and decoded
pub trait Codec: Encoder + Decoder {}

// Blanket implementation
impl<T: Encoder + Decoder> Codec for T {}

impl Encoder for Bytes {
    fn encode(&self) -> Result<Bytes, RpcError> {
        Ok(self.clone())
    }
}

impl Decoder for Bytes {
    fn decode(buf: &[u8]) -> Result<Self, RpcError> {
        Ok(Bytes::copy_from_slice(buf))
    }
}

impl Encoder for Vec<u8> {
    fn encode(&self) -> Result<Bytes, RpcError> {
        Ok(Bytes::copy_from_slice(self))
    }
}

impl Decoder for Vec<u8> {
    fn decode(buf: &[u8]) -> Result<Self, RpcError> {
        Ok(buf.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Simple test message type for codec tests
    #[derive(Debug, Clone, Default, PartialEq)]
    struct Counter {
        value: u32,
    }

    impl Encoder for Counter {
        fn encode(&self) -> Result<Bytes, RpcError> {
            Ok(Bytes::copy_from_slice(&self.value.to_be_bytes()))
        }
    }

    impl Decoder for Counter {
        fn decode(buf: &[u8]) -> Result<Self, RpcError> {
            let raw: [u8; 4] = buf
                .try_into()
                .map_err(|_| RpcError::Codec(format!("expected 4 bytes, got {}", buf.len())))?;
            Ok(Counter {
                value: u32::from_be_bytes(raw),
            })
        }
    }

    #[test]
    fn test_identity_codecs() {
        let raw = Bytes::from_static(&[1, 2, 3, 4]);
        assert_eq!(raw.encode().unwrap(), raw);
        assert_eq!(Bytes::decode(&raw).unwrap(), raw);
        assert_eq!(Vec::<u8>::decode(&[9, 8]).unwrap(), vec![9, 8]);
    }

    #[test]
    fn test_typed_codec() {
        let encoded = Counter { value: 7 }.encode().unwrap();
        assert_eq!(Counter::decode(&encoded).unwrap(), Counter { value: 7 });
        assert!(matches!(Counter::decode(&[1]), Err(RpcError::Codec(_))));
    }
}
