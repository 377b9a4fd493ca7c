//! WebSocket adapter for the session transport

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::future::ready;
use futures::{SinkExt, StreamExt};

use crate::session::{MasterFrame, MasterTransport, TransportError};

/// Split an upgraded socket into the session's master transport
///
/// Both text and binary frames carry protocol messages. Control frames are
/// answered by axum and never reach the session; a close frame ends the
/// stream.
pub fn split_websocket(socket: WebSocket) -> MasterTransport {
    let (sink, stream) = socket.split();

    let stream = stream
        .take_while(|message| ready(!matches!(message, Ok(Message::Close(_)))))
        .filter_map(|message| {
            ready(match message {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(Message::Text(text)) => Some(Ok(Bytes::copy_from_slice(text.as_str().as_bytes()))),
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
            })
        });

    let sink = sink
        .sink_map_err(|e| TransportError::WebSocket(e.to_string()))
        .with(|frame: MasterFrame| ready(Ok::<_, TransportError>(into_message(frame))));

    MasterTransport::new(stream, sink)
}

fn into_message(frame: MasterFrame) -> Message {
    match frame {
        MasterFrame::Data(data) => Message::Binary(data),
        MasterFrame::Keepalive => Message::Ping(Bytes::new()),
        MasterFrame::Close { code, reason } => Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })),
    }
}
