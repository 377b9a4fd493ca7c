//! Client-side transport abstraction
//!
//! A session sees the browser connection as a stream of inbound frames and a
//! sink of outbound [`MasterFrame`]s. The WebSocket adapter lives in
//! `crate::ws`; tests plug in in-memory channels.

use std::pin::Pin;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Sink, Stream, StreamExt};

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Policy violation, used when the client must re-authenticate
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Close reason shown when the server ends a session
pub const REASON_SERVER_CLOSED: &str = "server closed";

/// Close reason that makes the browser clear its credential and re-prompt
pub const REASON_AUTH_REQUIRED: &str = "authentication required";

/// Transport error
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// Outbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterFrame {
    /// One encoded protocol message
    Data(Bytes),
    /// Transport-level liveness probe
    Keepalive,
    /// Close the connection with a code and reason
    Close { code: u16, reason: String },
}

impl MasterFrame {
    pub fn close_normal() -> Self {
        Self::Close {
            code: CLOSE_NORMAL,
            reason: REASON_SERVER_CLOSED.into(),
        }
    }

    pub fn close_auth_required() -> Self {
        Self::Close {
            code: CLOSE_POLICY_VIOLATION,
            reason: REASON_AUTH_REQUIRED.into(),
        }
    }
}

pub type MasterStream = BoxStream<'static, Result<Bytes, TransportError>>;
pub type MasterSink = Pin<Box<dyn Sink<MasterFrame, Error = TransportError> + Send>>;

/// Both halves of a client connection
pub struct MasterTransport {
    pub stream: MasterStream,
    pub sink: MasterSink,
}

impl MasterTransport {
    pub fn new<St, Si>(stream: St, sink: Si) -> Self
    where
        St: Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
        Si: Sink<MasterFrame, Error = TransportError> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
            sink: Box::pin(sink),
        }
    }
}

impl std::fmt::Debug for MasterTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterTransport").finish_non_exhaustive()
    }
}
