//! Message codec for tagged frames
//!
//! A frame is one tag byte followed by the payload. Frame boundaries come
//! from the transport, so there is deliberately no `Decoder` implementation
//! here: decoding always operates on one complete frame.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::Encoder;

use crate::messages::{ClientMessage, ClientTag, ServerMessage, ServerTag};

/// Protocol codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("empty frame")]
    Malformed,

    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),

    #[error("invalid JSON payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("payload is not valid UTF-8")]
    InvalidText,

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Prepend `tag` to `payload`
pub fn encode_frame(tag: u8, payload: &[u8]) -> Bytes {
    let mut dst = BytesMut::with_capacity(1 + payload.len());
    dst.put_u8(tag);
    dst.put_slice(payload);
    dst.freeze()
}

/// Split a frame into its tag byte and payload
pub fn decode_frame(frame: Bytes) -> Result<(u8, Bytes), CodecError> {
    if frame.is_empty() {
        return Err(CodecError::Malformed);
    }
    let tag = frame[0];
    Ok((tag, frame.slice(1..)))
}

fn text(payload: Bytes) -> Result<String, CodecError> {
    String::from_utf8(payload.to_vec()).map_err(|_| CodecError::InvalidText)
}

impl ClientMessage {
    /// Decode one complete frame
    pub fn decode(frame: Bytes) -> Result<Self, CodecError> {
        let (tag, payload) = decode_frame(frame)?;
        let tag = ClientTag::from_byte(tag).ok_or(CodecError::UnknownTag(tag))?;

        Ok(match tag {
            ClientTag::Unknown => ClientMessage::Unknown(payload),
            ClientTag::Input => ClientMessage::Input(payload),
            ClientTag::Ping => ClientMessage::Ping,
            ClientTag::ResizeTerminal => {
                ClientMessage::ResizeTerminal(serde_json::from_slice(&payload)?)
            }
            ClientTag::SetEncoding => ClientMessage::SetEncoding(text(payload)?),
        })
    }

    /// Encode into a single frame
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut dst = BytesMut::new();
        ClientCodec.encode(self.clone(), &mut dst)?;
        Ok(dst.freeze())
    }
}

impl ServerMessage {
    /// Decode one complete frame
    pub fn decode(frame: Bytes) -> Result<Self, CodecError> {
        let (tag, payload) = decode_frame(frame)?;
        let tag = ServerTag::from_byte(tag).ok_or(CodecError::UnknownTag(tag))?;

        Ok(match tag {
            ServerTag::Unknown => ServerMessage::Unknown(payload),
            ServerTag::Output => ServerMessage::Output(payload),
            ServerTag::Pong => ServerMessage::Pong,
            ServerTag::SetWindowTitle => ServerMessage::SetWindowTitle(text(payload)?),
            ServerTag::SetPreferences => {
                ServerMessage::SetPreferences(serde_json::from_slice(&payload)?)
            }
            ServerTag::SetReconnect => ServerMessage::SetReconnect(serde_json::from_slice(&payload)?),
            ServerTag::SetBufferSize => {
                ServerMessage::SetBufferSize(serde_json::from_slice(&payload)?)
            }
        })
    }

    /// Encode into a single frame
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut dst = BytesMut::new();
        ServerCodec.encode(self.clone(), &mut dst)?;
        Ok(dst.freeze())
    }
}

/// Encodes `ClientMessage` frames, used by browser-side tooling and tests
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientCodec;

impl Encoder<ClientMessage> for ClientCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ClientMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(item.tag().as_byte());
        match item {
            ClientMessage::Unknown(payload) | ClientMessage::Input(payload) => {
                dst.put_slice(&payload)
            }
            ClientMessage::Ping => {}
            ClientMessage::ResizeTerminal(size) => {
                let json = serde_json::to_vec(&size)?;
                dst.put_slice(&json);
            }
            ClientMessage::SetEncoding(name) => dst.put_slice(name.as_bytes()),
        }
        Ok(())
    }
}

/// Encodes `ServerMessage` frames
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerCodec;

impl Encoder<ServerMessage> for ServerCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ServerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(item.tag().as_byte());
        match item {
            ServerMessage::Unknown(payload) | ServerMessage::Output(payload) => {
                dst.put_slice(&payload)
            }
            ServerMessage::Pong => {}
            ServerMessage::SetWindowTitle(title) => dst.put_slice(title.as_bytes()),
            ServerMessage::SetPreferences(prefs) => {
                let json = serde_json::to_vec(&prefs)?;
                dst.put_slice(&json);
            }
            ServerMessage::SetReconnect(secs) => dst.put_slice(secs.to_string().as_bytes()),
            ServerMessage::SetBufferSize(size) => dst.put_slice(size.to_string().as_bytes()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ResizeTerminal;
    use serde_json::json;

    #[test]
    fn test_encode_frame_prepends_tag() {
        let frame = encode_frame(b'1', b"hello");
        assert_eq!(&frame[..], b"1hello");
    }

    #[test]
    fn test_decode_frame_splits_tag() {
        let (tag, payload) = decode_frame(Bytes::from_static(b"3{}")).unwrap();
        assert_eq!(tag, b'3');
        assert_eq!(&payload[..], b"{}");
    }

    #[test]
    fn test_frame_roundtrip_for_every_tag() {
        let payload = b"\x00binary\xff payload";
        let tags = ClientTag::ALL
            .iter()
            .map(|t| t.as_byte())
            .chain(ServerTag::ALL.iter().map(|t| t.as_byte()));
        for tag in tags {
            let (decoded_tag, decoded) = decode_frame(encode_frame(tag, payload)).unwrap();
            assert_eq!(decoded_tag, tag);
            assert_eq!(&decoded[..], payload);
        }
    }

    #[test]
    fn test_decode_empty_is_malformed() {
        assert!(matches!(decode_frame(Bytes::new()), Err(CodecError::Malformed)));
        assert!(matches!(
            ClientMessage::decode(Bytes::new()),
            Err(CodecError::Malformed)
        ));
        assert!(matches!(
            ServerMessage::decode(Bytes::new()),
            Err(CodecError::Malformed)
        ));
    }

    #[test]
    fn test_tag_only_frame_has_empty_payload() {
        let (tag, payload) = decode_frame(Bytes::from_static(b"2")).unwrap();
        assert_eq!(tag, b'2');
        assert!(payload.is_empty());
    }

    #[test]
    fn test_unknown_tag_is_error() {
        let err = ClientMessage::decode(Bytes::from_static(b"9oops")).unwrap_err();
        assert!(matches!(err, CodecError::UnknownTag(b'9')));

        // Server-only tag is not valid client->server
        let err = ClientMessage::decode(Bytes::from_static(b"6")).unwrap_err();
        assert!(matches!(err, CodecError::UnknownTag(b'6')));
    }

    #[test]
    fn test_reserved_unknown_tag_decodes() {
        let msg = ClientMessage::decode(Bytes::from_static(b"0whatever")).unwrap();
        assert_eq!(msg, ClientMessage::Unknown(Bytes::from_static(b"whatever")));
    }

    #[test]
    fn test_input_passes_bytes_through() {
        let msg = ClientMessage::decode(Bytes::from_static(b"1ls\n\x03")).unwrap();
        assert_eq!(msg, ClientMessage::Input(Bytes::from_static(b"ls\n\x03")));
    }

    #[test]
    fn test_decode_resize() {
        let msg = ClientMessage::decode(Bytes::from_static(br#"3{"columns":80,"rows":24}"#))
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::ResizeTerminal(ResizeTerminal { columns: 80, rows: 24 })
        );
    }

    #[test]
    fn test_decode_resize_bad_json() {
        let err = ClientMessage::decode(Bytes::from_static(b"3{columns:80")).unwrap_err();
        assert!(matches!(err, CodecError::InvalidPayload(_)));
    }

    #[test]
    fn test_decode_set_encoding_invalid_utf8() {
        let err = ClientMessage::decode(Bytes::from_static(b"4\xff\xfe")).unwrap_err();
        assert!(matches!(err, CodecError::InvalidText));
    }

    #[test]
    fn test_encode_server_messages() {
        assert_eq!(&ServerMessage::Pong.encode().unwrap()[..], b"2");
        assert_eq!(
            &ServerMessage::SetWindowTitle("bash@host".into()).encode().unwrap()[..],
            b"3bash@host"
        );
        assert_eq!(&ServerMessage::SetReconnect(10).encode().unwrap()[..], b"510");
        assert_eq!(&ServerMessage::SetBufferSize(0).encode().unwrap()[..], b"60");
    }

    #[test]
    fn test_encode_preferences_compact_json() {
        let prefs = json!({"font-size": 14}).as_object().cloned().unwrap();
        let frame = ServerMessage::SetPreferences(prefs).encode().unwrap();
        assert_eq!(&frame[..], br#"4{"font-size":14}"#);
    }

    #[test]
    fn test_server_message_decode_matches_encode() {
        let prefs = json!({"enable-bold": true}).as_object().cloned().unwrap();
        let messages = vec![
            ServerMessage::Output(Bytes::from_static(b"total 0\r\n")),
            ServerMessage::Pong,
            ServerMessage::SetWindowTitle("title".into()),
            ServerMessage::SetPreferences(prefs),
            ServerMessage::SetReconnect(5),
            ServerMessage::SetBufferSize(4096),
        ];
        for msg in messages {
            let frame = msg.encode().unwrap();
            assert_eq!(ServerMessage::decode(frame).unwrap(), msg);
        }
    }

    #[test]
    fn test_client_codec_encodes_resize() {
        let mut codec = ClientCodec;
        let mut dst = BytesMut::new();
        codec
            .encode(
                ClientMessage::ResizeTerminal(ResizeTerminal { columns: 100, rows: 30 }),
                &mut dst,
            )
            .unwrap();
        assert_eq!(&dst[..], br#"3{"columns":100,"rows":30}"#);
    }

    #[test]
    fn test_codec_error_accepts_io_errors() {
        fn assert_encoder<E: Encoder<M>, M>(_: &E)
        where
            E::Error: From<std::io::Error>,
        {
        }
        assert_encoder::<_, ClientMessage>(&ClientCodec);
        assert_encoder::<_, ServerMessage>(&ServerCodec);

        let err = CodecError::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(err, CodecError::Io(_)));
        assert!(err.to_string().contains("gone"));
    }
}
