//! Process-side transports
//!
//! A [`Slave`] is the process end of a session. Its I/O is blocking and is
//! driven from `spawn_blocking`; `close` must unblock a pending `read`.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use axum::http::HeaderMap;

use webterm_utils::Result;

mod config;
mod pty;

pub use config::PtyConfig;
pub use pty::LocalCommandFactory;

/// Query parameters parsed from the init message's argument string
pub type QueryParams = HashMap<String, Vec<String>>;

/// Process end of a session
pub trait Slave: Send + Sync {
    /// Read process output, returning 0 at end of stream
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data` to the process input
    fn write(&self, data: &[u8]) -> io::Result<()>;

    /// Resize the terminal
    fn resize(&self, columns: u16, rows: u16) -> Result<()>;

    /// Terminate the process. Idempotent.
    fn close(&self) -> Result<()>;

    /// Variables exposed to the window title template
    fn window_title_variables(&self) -> HashMap<String, String>;
}

/// Creates a [`Slave`] for each new session
pub trait SlaveFactory: Send + Sync {
    /// Name used when logging sessions ended by the process
    fn name(&self) -> &str;

    fn create(&self, params: &QueryParams, headers: Option<&HeaderMap>) -> Result<Arc<dyn Slave>>;
}
