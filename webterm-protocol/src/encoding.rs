//! Payload encodings selectable with `SetEncoding`

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;

use crate::codec::CodecError;

/// How `Input` and `Output` payloads are represented on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadEncoding {
    /// Raw bytes, passed through untouched
    #[default]
    Null,
    /// Standard base64 with padding
    Base64,
}

impl PayloadEncoding {
    /// Look up an encoding by the name the client sends
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "null" | "" => Some(Self::Null),
            "base64" => Some(Self::Base64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Base64 => "base64",
        }
    }

    /// Encode outgoing process output
    pub fn encode(self, data: &[u8]) -> Bytes {
        match self {
            Self::Null => Bytes::copy_from_slice(data),
            Self::Base64 => Bytes::from(STANDARD.encode(data)),
        }
    }

    /// Decode an incoming payload
    pub fn decode(self, data: Bytes) -> Result<Bytes, CodecError> {
        match self {
            Self::Null => Ok(data),
            Self::Base64 => STANDARD
                .decode(&data)
                .map(Bytes::from)
                .map_err(|e| CodecError::InvalidBase64(e.to_string())),
        }
    }
}

impl std::fmt::Display for PayloadEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
