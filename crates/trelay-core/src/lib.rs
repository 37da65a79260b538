//! trelay-core: shared protocol library for the TLS relay.
//!
//! Provides the request/reply handshake types, length-prefixed CBOR framing,
//! version compatibility, and the error type used by both server and client.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, frame_encode, read_frame, write_frame};
pub use error::{RelayError, RelayResult};
pub use messages::{
    is_version_compatible, read_reply, read_request, write_reply, write_request, AppKind,
    RelayReply, RelayRequest, CROSS_CONNECT_PREFIX, GO_AHEAD, PROTOCOL_VERSION,
};
