//! Codec for encoding/decoding call frames

use crate::messages::CallFrame;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Call frame codec
///
/// The transports underneath preserve message boundaries (one WebSocket
/// message or one length-delimited chunk per frame), so a frame is just its
/// bincode encoding.
pub struct CallCodec;

impl CallCodec {
    /// Encode a frame to bytes
    pub fn encode(frame: &CallFrame) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(frame)?;

        if payload.len() > crate::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        Ok(Bytes::from(payload))
    }

    /// Decode a frame from bytes
    pub fn decode(buf: &[u8]) -> Result<CallFrame, CodecError> {
        if buf.len() > crate::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(buf.len()));
        }

        Ok(bincode::deserialize(buf)?)
    }

    /// Encode a typed call argument or result
    pub fn encode_value<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(bincode::serialize(value)?))
    }

    /// Decode a typed call argument or result
    pub fn decode_value<T: DeserializeOwned>(buf: &[u8]) -> Result<T, CodecError> {
        Ok(bincode::deserialize(buf)?)
    }
}
