//! Configuration loader

use std::path::Path;

use webterm_utils::{config_file, Result, WebtermError};

use super::ServerConfig;
use crate::session::options::MIN_OUTPUT_CHUNK;
use crate::title::TitleTemplate;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from the default location, or defaults if absent
    pub fn load() -> Result<ServerConfig> {
        let path = config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(ServerConfig::default())
        }
    }

    /// Load configuration from a specific path, which must exist
    pub fn load_from_path(path: &Path) -> Result<ServerConfig> {
        if !path.exists() {
            return Err(WebtermError::ConfigNotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|e| WebtermError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<ServerConfig> {
        toml::from_str(content).map_err(|e| WebtermError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &ServerConfig) -> Result<()> {
        if config.enable_basic_auth && !config.credential.contains(':') {
            return Err(WebtermError::config(
                "credential must be in the form user:password when basic auth is enabled",
            ));
        }

        if config.session.max_output_chunk < MIN_OUTPUT_CHUNK {
            return Err(WebtermError::config(format!(
                "max_output_chunk must be at least {}",
                MIN_OUTPUT_CHUNK
            )));
        }

        if config.session.output_backlog < config.session.max_output_chunk {
            return Err(WebtermError::config(
                "output_backlog must be at least max_output_chunk",
            ));
        }

        if config.enable_reconnect && config.reconnect_time == 0 {
            return Err(WebtermError::config("reconnect_time must be at least 1"));
        }

        TitleTemplate::parse(&config.title_format)?;

        Ok(())
    }
}
