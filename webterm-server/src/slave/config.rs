//! PTY spawn configuration

use std::collections::HashMap;
use std::path::PathBuf;

use axum::http::HeaderMap;

use webterm_utils::{Result, WebtermError};

/// Default initial size when the server does not fix one
pub const DEFAULT_SIZE: (u16, u16) = (80, 24);

/// Configuration for spawning a command in a PTY
#[derive(Debug, Clone)]
pub struct PtyConfig {
    /// Program to execute
    pub command: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Environment variables to set
    pub env: HashMap<String, String>,
    /// Initial terminal size (cols, rows)
    pub size: (u16, u16),
}

impl PtyConfig {
    /// Create config for a specific command
    pub fn command(cmd: impl Into<String>) -> Self {
        Self {
            command: cmd.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::from([("TERM".to_string(), "xterm-256color".to_string())]),
            size: DEFAULT_SIZE,
        }
    }

    /// Build from a full argv, program first
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| WebtermError::config("no command given"))?;
        Ok(Self::command(program.clone()).with_args(args.iter().cloned()))
    }

    /// Set working directory
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Export request headers as `HTTP_<NAME>` variables
    pub fn with_headers(mut self, headers: &HeaderMap) -> Self {
        for (name, value) in headers {
            let Ok(value) = value.to_str() else {
                continue;
            };
            let key = format!("HTTP_{}", name.as_str().to_uppercase().replace('-', "_"));
            self = self.with_env(key, value);
        }
        self
    }

    /// Set initial size
    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.size = (cols, rows);
        self
    }

    /// Add argument
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add several arguments
    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    /// Full argv, program first
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}
