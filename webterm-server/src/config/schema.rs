//! Configuration schema structs

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::AdmissionPolicy;

/// Default window title template
pub const DEFAULT_TITLE_FORMAT: &str = "{{ .command }}@{{ .hostname }}";

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub address: String,
    /// Port to listen on
    pub port: u16,
    /// URL prefix all routes are served under
    pub path: String,

    /// Forward client keystrokes to the process
    pub permit_write: bool,
    /// Require HTTP basic authentication
    pub enable_basic_auth: bool,
    /// Credential as `user:password`
    pub credential: String,

    /// Ask clients to reconnect after a disconnect
    pub enable_reconnect: bool,
    /// Seconds a client waits before reconnecting
    pub reconnect_time: u64,

    /// Maximum concurrent clients, 0 means unlimited
    pub max_connection: usize,
    /// Accept a single client, then exit once it disconnects
    pub once: bool,
    /// Exit after this many seconds without clients, 0 disables
    pub timeout: u64,

    /// Let clients append `arg` query parameters to the command
    pub permit_arguments: bool,
    /// Export request headers to the process environment
    pub pass_headers: bool,

    /// Fixed terminal width, 0 follows the client
    pub width: u16,
    /// Fixed terminal height, 0 follows the client
    pub height: u16,

    /// Window title template
    pub title_format: String,
    /// Extra query string appended by the browser to the WebSocket URL
    pub ws_query_args: String,
    /// Terminal preferences sent to the browser widget
    pub preferences: serde_json::Map<String, serde_json::Value>,

    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".into(),
            port: 8080,
            path: "/".into(),
            permit_write: false,
            enable_basic_auth: false,
            credential: String::new(),
            enable_reconnect: false,
            reconnect_time: 10,
            max_connection: 0,
            once: false,
            timeout: 0,
            permit_arguments: false,
            pass_headers: false,
            width: 0,
            height: 0,
            title_format: DEFAULT_TITLE_FORMAT.into(),
            ws_query_args: String::new(),
            preferences: serde_json::Map::new(),
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// `address:port` for binding
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Credential to check, if basic auth is enabled
    pub fn credential(&self) -> Option<&str> {
        self.enable_basic_auth.then_some(self.credential.as_str())
    }

    /// Reconnect interval sent to clients, if enabled
    pub fn reconnect(&self) -> Option<u64> {
        self.enable_reconnect.then_some(self.reconnect_time)
    }

    pub fn fixed_columns(&self) -> Option<u16> {
        (self.width > 0).then_some(self.width)
    }

    pub fn fixed_rows(&self) -> Option<u16> {
        (self.height > 0).then_some(self.height)
    }

    /// Admission limits derived from this configuration
    pub fn admission_policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            max_connections: self.max_connection,
            once: self.once,
            idle_timeout: (self.timeout > 0).then(|| Duration::from_secs(self.timeout)),
        }
    }

    /// Route prefix normalized to start with `/` and not end with one
    pub fn base_path(&self) -> String {
        let trimmed = self.path.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{}", trimmed)
        }
    }
}

/// Per-session tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Largest `Output` payload sent in one frame
    pub max_output_chunk: usize,
    /// Process output buffered for a slow client before the oldest is dropped
    pub output_backlog: usize,
    /// Seconds between transport pings, 0 disables
    pub keepalive_interval_secs: u64,
    /// Close clients silent for this many seconds, 0 disables
    pub keepalive_timeout_secs: u64,
    /// Seconds to wait for the init message after upgrade
    pub handshake_timeout_secs: u64,
    /// Seconds allowed for flushing and closing the client on teardown
    pub close_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_output_chunk: 16 * 1024,
            output_backlog: 1024 * 1024,
            keepalive_interval_secs: 30,
            keepalive_timeout_secs: 0,
            handshake_timeout_secs: 10,
            close_timeout_secs: 10,
        }
    }
}

impl SessionConfig {
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0)
            .then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    pub fn keepalive_timeout(&self) -> Option<Duration> {
        (self.keepalive_timeout_secs > 0)
            .then(|| Duration::from_secs(self.keepalive_timeout_secs))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }
}
