//! PTY-backed local command

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::HeaderMap;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tracing::{debug, info};

use webterm_utils::{Result, WebtermError};

use super::{PtyConfig, QueryParams, Slave, SlaveFactory};

/// Reading the master after the last slave fd closes fails with EIO
const EIO: i32 = 5;

/// A command running in a PTY
pub struct PtySlave {
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    reader: Mutex<Box<dyn Read + Send>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    closed: AtomicBool,
    pid: Option<u32>,
    argv: Vec<String>,
}

impl PtySlave {
    /// Spawn `config.command` in a new PTY
    pub fn spawn(config: &PtyConfig) -> Result<Self> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: config.size.1,
                cols: config.size.0,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| WebtermError::pty(format!("Failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&config.command);
        cmd.args(&config.args);
        if let Some(cwd) = &config.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| WebtermError::ProcessSpawn(format!("{}: {}", config.command, e)))?;
        // Only the child keeps the slave side open, so reads see EOF when it exits
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| WebtermError::pty(format!("Failed to clone reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| WebtermError::pty(format!("Failed to get writer: {}", e)))?;

        let pid = child.process_id();

        Ok(Self {
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            pid,
            argv: config.argv(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Slave for PtySlave {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock();
        match reader.read(buf) {
            Err(e) if e.raw_os_error() == Some(EIO) => Ok(0),
            other => other,
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock();
        match writer.as_mut() {
            Some(writer) => {
                writer.write_all(data)?;
                writer.flush()
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "pty closed")),
        }
    }

    fn resize(&self, columns: u16, rows: u16) -> Result<()> {
        let master = self.master.lock();
        master
            .resize(PtySize {
                rows,
                cols: columns,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| WebtermError::pty(format!("Resize failed: {}", e)))
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = {
            let mut child = self.child.lock();
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(pid = ?self.pid, exit_code = status.exit_code(), "Process already exited");
                    Ok(())
                }
                _ => child
                    .kill()
                    .map(|()| {
                        // Reap so the child does not linger as a zombie
                        let _ = child.wait();
                        debug!(pid = ?self.pid, "Process killed");
                    })
                    .map_err(|e| WebtermError::pty(format!("Kill failed: {}", e))),
            }
        };

        // A write blocked on a full PTY holds the lock; it fails once the child is gone
        if let Some(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        result
    }

    fn window_title_variables(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert(
            "command".into(),
            self.argv.first().cloned().unwrap_or_default(),
        );
        vars.insert(
            "argv".into(),
            self.argv.iter().skip(1).cloned().collect::<Vec<_>>().join(" "),
        );
        vars.insert(
            "pid".into(),
            self.pid.map(|p| p.to_string()).unwrap_or_default(),
        );
        vars
    }
}

impl Drop for PtySlave {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for PtySlave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySlave")
            .field("pid", &self.pid)
            .field("argv", &self.argv)
            .finish_non_exhaustive()
    }
}

/// Spawns the configured command for every session
#[derive(Debug, Clone)]
pub struct LocalCommandFactory {
    base: PtyConfig,
}

impl LocalCommandFactory {
    pub fn new(base: PtyConfig) -> Self {
        Self { base }
    }
}

impl SlaveFactory for LocalCommandFactory {
    fn name(&self) -> &str {
        "local command"
    }

    fn create(&self, params: &QueryParams, headers: Option<&HeaderMap>) -> Result<Arc<dyn Slave>> {
        let mut config = self.base.clone();
        if let Some(args) = params.get("arg") {
            config = config.with_args(args.iter().cloned());
        }
        if let Some(headers) = headers {
            config = config.with_headers(headers);
        }

        let slave = PtySlave::spawn(&config)?;
        info!(pid = ?slave.pid(), argv = ?config.argv(), "Spawned process");
        Ok(Arc::new(slave))
    }
}
