//! webterm-protocol: Wire definitions for browser terminal sessions
//!
//! Every message is a single ASCII tag character followed by its payload.
//! There is no length prefix: one transport frame carries exactly one
//! message, so these types must only be used over a message-oriented
//! transport such as WebSocket.

pub mod codec;
pub mod encoding;
pub mod messages;

// Re-export main types at crate root
pub use codec::{decode_frame, encode_frame, ClientCodec, CodecError, ServerCodec};
pub use encoding::PayloadEncoding;
pub use messages::{
    ClientMessage, ClientTag, InitMessage, ResizeTerminal, ServerMessage, ServerTag,
};

/// Subprotocol name announced during the WebSocket upgrade
pub const PROTOCOL_NAME: &str = "webtty";
