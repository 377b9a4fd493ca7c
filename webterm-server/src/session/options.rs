//! Per-session options

use std::time::Duration;

use webterm_utils::{Result, WebtermError};

use crate::config::ServerConfig;

/// Smallest `Output` payload bound; one base64 quantum is four bytes
pub const MIN_OUTPUT_CHUNK: usize = 4;

/// Upper bound on session teardown
///
/// The writer may spend `close_timeout` each on flushing queued output,
/// sending the close frame and closing the sink.
pub fn teardown_grace(close_timeout: Duration) -> Duration {
    close_timeout * 3 + Duration::from_secs(1)
}

/// Options resolved once when a session is created
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Title sent with `SetWindowTitle` at session start
    pub window_title: String,
    /// Forward `Input` to the process
    pub permit_write: bool,
    /// Seconds the client should wait before reconnecting
    pub reconnect: Option<u64>,
    /// Column count that overrides client resize requests
    pub fixed_columns: Option<u16>,
    /// Row count that overrides client resize requests
    pub fixed_rows: Option<u16>,
    /// Sent with `SetPreferences` at session start
    pub preferences: Option<serde_json::Map<String, serde_json::Value>>,
    /// Largest `Output` payload per frame
    pub max_output_chunk: usize,
    /// Output bytes held for a slow client before the oldest are dropped
    pub output_backlog: usize,
    pub keepalive_interval: Option<Duration>,
    /// Close the session when the client is silent this long
    pub keepalive_timeout: Option<Duration>,
    /// Time allowed to flush and close the client on teardown
    pub close_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            window_title: String::new(),
            permit_write: false,
            reconnect: None,
            fixed_columns: None,
            fixed_rows: None,
            preferences: None,
            max_output_chunk: 16 * 1024,
            output_backlog: 1024 * 1024,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: None,
            close_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionOptions {
    /// Resolve options from server configuration
    pub fn from_config(config: &ServerConfig, window_title: String) -> Self {
        Self {
            window_title,
            permit_write: config.permit_write,
            reconnect: config.reconnect(),
            fixed_columns: config.fixed_columns(),
            fixed_rows: config.fixed_rows(),
            preferences: (!config.preferences.is_empty()).then(|| config.preferences.clone()),
            max_output_chunk: config.session.max_output_chunk,
            output_backlog: config.session.output_backlog,
            keepalive_interval: config.session.keepalive_interval(),
            keepalive_timeout: config.session.keepalive_timeout(),
            close_timeout: config.session.close_timeout(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.window_title = title.into();
        self
    }

    pub fn with_permit_write(mut self, permit: bool) -> Self {
        self.permit_write = permit;
        self
    }

    pub fn with_reconnect(mut self, secs: u64) -> Self {
        self.reconnect = Some(secs);
        self
    }

    pub fn with_fixed_columns(mut self, columns: u16) -> Self {
        self.fixed_columns = Some(columns);
        self
    }

    pub fn with_fixed_rows(mut self, rows: u16) -> Self {
        self.fixed_rows = Some(rows);
        self
    }

    pub fn with_preferences(mut self, prefs: serde_json::Map<String, serde_json::Value>) -> Self {
        self.preferences = Some(prefs);
        self
    }

    pub fn with_max_output_chunk(mut self, bytes: usize) -> Self {
        self.max_output_chunk = bytes;
        self
    }

    pub fn with_output_backlog(mut self, bytes: usize) -> Self {
        self.output_backlog = bytes;
        self
    }

    pub fn with_keepalive(mut self, interval: Option<Duration>, timeout: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Both dimensions fixed, so resize requests are ignored entirely
    pub fn size_is_fixed(&self) -> bool {
        self.fixed_columns.is_some() && self.fixed_rows.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_output_chunk < MIN_OUTPUT_CHUNK {
            return Err(WebtermError::config(format!(
                "max_output_chunk must be at least {}",
                MIN_OUTPUT_CHUNK
            )));
        }
        if self.output_backlog < self.max_output_chunk {
            return Err(WebtermError::config(
                "output_backlog must be at least max_output_chunk",
            ));
        }
        if self.fixed_columns == Some(0) || self.fixed_rows == Some(0) {
            return Err(WebtermError::config("fixed terminal size must be non-zero"));
        }
        if self.keepalive_interval == Some(Duration::ZERO) {
            return Err(WebtermError::config("keepalive interval must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = SessionOptions::default();
        assert!(options.validate().is_ok());
        assert!(!options.permit_write);
        assert!(!options.size_is_fixed());
    }

    #[test]
    fn test_from_config() {
        let mut config = ServerConfig {
            permit_write: true,
            enable_reconnect: true,
            reconnect_time: 3,
            width: 132,
            height: 43,
            ..Default::default()
        };
        config
            .preferences
            .insert("font-size".into(), serde_json::json!(12));

        let options = SessionOptions::from_config(&config, "bash@host".into());
        assert_eq!(options.window_title, "bash@host");
        assert!(options.permit_write);
        assert_eq!(options.reconnect, Some(3));
        assert!(options.size_is_fixed());
        assert!(options.preferences.is_some());
    }

    #[test]
    fn test_empty_preferences_not_sent() {
        let options = SessionOptions::from_config(&ServerConfig::default(), String::new());
        assert!(options.preferences.is_none());
        assert_eq!(options.reconnect, None);
    }

    #[test]
    fn test_single_fixed_dimension_is_not_fixed_size() {
        let options = SessionOptions::default().with_fixed_columns(80);
        assert!(!options.size_is_fixed());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(SessionOptions::default()
            .with_max_output_chunk(0)
            .validate()
            .is_err());
        assert!(SessionOptions::default()
            .with_max_output_chunk(MIN_OUTPUT_CHUNK - 1)
            .validate()
            .is_err());
        assert!(SessionOptions::default()
            .with_max_output_chunk(MIN_OUTPUT_CHUNK)
            .with_output_backlog(MIN_OUTPUT_CHUNK)
            .validate()
            .is_ok());
        assert!(SessionOptions::default()
            .with_max_output_chunk(1024)
            .with_output_backlog(512)
            .validate()
            .is_err());
        assert!(SessionOptions::default()
            .with_fixed_rows(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_teardown_grace_covers_writer_steps() {
        let close_timeout = Duration::from_secs(10);
        assert!(teardown_grace(close_timeout) > close_timeout * 3);
    }
}
