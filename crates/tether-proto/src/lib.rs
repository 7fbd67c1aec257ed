//! Tether Protocol Definitions
//!
//! This crate defines the wire types shared by the relay and its agents:
//! the call frames carried over a duplex connection, the method catalogue,
//! and the codec that turns a whole HTTP exchange into a call payload.

pub mod codec;
pub mod http_codec;
pub mod messages;

pub use codec::{CallCodec, CodecError};
pub use http_codec::{
    decode_request, decode_response, decode_response_for, encode_request, encode_response,
    encode_response_for, is_bodiless, HttpCodecError,
};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Method names understood by an agent endpoint
pub mod methods {
    /// Tunneled HTTP exchange: raw request bytes in, raw response bytes out
    pub const HANDLE: &str = "Handle";
    /// Liveness probe: caller timestamp in, callee timestamp out
    pub const HEARTBEAT: &str = "Heartbeat";
    /// Identity query: caller id in, [`crate::AgentMetadata`] out
    pub const METADATA: &str = "Metadata";
}
