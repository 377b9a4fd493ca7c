//! Client-server message types

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Tags for messages sent from client to server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientTag {
    Unknown = b'0',
    Input = b'1',
    Ping = b'2',
    ResizeTerminal = b'3',
    SetEncoding = b'4',
}

impl ClientTag {
    pub const ALL: [ClientTag; 5] = [
        ClientTag::Unknown,
        ClientTag::Input,
        ClientTag::Ping,
        ClientTag::ResizeTerminal,
        ClientTag::SetEncoding,
    ];

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| *tag as u8 == byte)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Tags for messages sent from server to client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerTag {
    Unknown = b'0',
    Output = b'1',
    Pong = b'2',
    SetWindowTitle = b'3',
    SetPreferences = b'4',
    SetReconnect = b'5',
    SetBufferSize = b'6',
}

impl ServerTag {
    pub const ALL: [ServerTag; 7] = [
        ServerTag::Unknown,
        ServerTag::Output,
        ServerTag::Pong,
        ServerTag::SetWindowTitle,
        ServerTag::SetPreferences,
        ServerTag::SetReconnect,
        ServerTag::SetBufferSize,
    ];

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| *tag as u8 == byte)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Terminal dimensions requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeTerminal {
    pub columns: u16,
    pub rows: u16,
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Reserved placeholder, carries whatever followed the tag
    Unknown(Bytes),

    /// Keystrokes destined for the process
    Input(Bytes),

    /// Keepalive request, answered with `Pong`
    Ping,

    /// Client terminal was resized
    ResizeTerminal(ResizeTerminal),

    /// Switch payload encoding for subsequent traffic
    SetEncoding(String),
}

impl ClientMessage {
    pub fn tag(&self) -> ClientTag {
        match self {
            ClientMessage::Unknown(_) => ClientTag::Unknown,
            ClientMessage::Input(_) => ClientTag::Input,
            ClientMessage::Ping => ClientTag::Ping,
            ClientMessage::ResizeTerminal(_) => ClientTag::ResizeTerminal,
            ClientMessage::SetEncoding(_) => ClientTag::SetEncoding,
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Reserved placeholder
    Unknown(Bytes),

    /// Process output
    Output(Bytes),

    /// Reply to `Ping`
    Pong,

    /// Window title, sent once at session start
    SetWindowTitle(String),

    /// Terminal preferences forwarded to the browser widget
    SetPreferences(serde_json::Map<String, serde_json::Value>),

    /// Seconds the client waits before reconnecting
    SetReconnect(u64),

    /// Output bytes produced so far in this session
    SetBufferSize(u64),
}

impl ServerMessage {
    pub fn tag(&self) -> ServerTag {
        match self {
            ServerMessage::Unknown(_) => ServerTag::Unknown,
            ServerMessage::Output(_) => ServerTag::Output,
            ServerMessage::Pong => ServerTag::Pong,
            ServerMessage::SetWindowTitle(_) => ServerTag::SetWindowTitle,
            ServerMessage::SetPreferences(_) => ServerTag::SetPreferences,
            ServerMessage::SetReconnect(_) => ServerTag::SetReconnect,
            ServerMessage::SetBufferSize(_) => ServerTag::SetBufferSize,
        }
    }
}

/// First frame sent by the client, before any tagged message
///
/// Field names follow the browser client's JSON keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitMessage {
    /// Base64-encoded `user:password`, empty when auth is disabled
    #[serde(rename = "AuthToken", default)]
    pub auth_token: String,

    /// URL query string such as `?arg=foo&arg=bar`
    #[serde(rename = "Arguments", default)]
    pub arguments: String,
}

impl InitMessage {
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
