//! webterm: share a terminal command with remote browsers
//!
//! Runs one command per browser connection in a PTY and bridges it to the
//! browser over a WebSocket.

mod admission;
mod config;
mod handshake;
mod server;
mod session;
mod slave;
mod title;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use webterm_utils::{init_logging_with_config, LogConfig, Result};

use crate::config::{ConfigLoader, ServerConfig};
use crate::server::WebtermServer;
use crate::slave::{LocalCommandFactory, PtyConfig};

/// Share your terminal as a web application
#[derive(Debug, Parser)]
#[command(name = "webterm", version, about)]
struct Args {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, env = "WEBTERM_CONFIG")]
    config: Option<PathBuf>,

    /// IP address to listen on
    #[arg(short, long, env = "WEBTERM_ADDRESS")]
    address: Option<String>,

    /// Port number to listen on
    #[arg(short, long, env = "WEBTERM_PORT")]
    port: Option<u16>,

    /// URL path all routes are served under
    #[arg(long, env = "WEBTERM_PATH")]
    path: Option<String>,

    /// Permit clients to write to the terminal
    #[arg(short = 'w', long)]
    permit_write: bool,

    /// Credential for basic authentication, as user:password
    #[arg(short, long, env = "WEBTERM_CREDENTIAL")]
    credential: Option<String>,

    /// Ask clients to reconnect after a disconnect
    #[arg(short, long)]
    reconnect: bool,

    /// Seconds clients wait before reconnecting
    #[arg(long)]
    reconnect_time: Option<u64>,

    /// Maximum concurrent clients, 0 disables the limit
    #[arg(long)]
    max_connection: Option<usize>,

    /// Accept only one client and exit when it disconnects
    #[arg(long)]
    once: bool,

    /// Exit after this many seconds with no client, 0 disables
    #[arg(long)]
    timeout: Option<u64>,

    /// Let clients append command-line arguments with ?arg=...
    #[arg(long)]
    permit_arguments: bool,

    /// Export request headers to the command environment
    #[arg(long)]
    pass_headers: bool,

    /// Fixed terminal width, 0 follows the client
    #[arg(long)]
    width: Option<u16>,

    /// Fixed terminal height, 0 follows the client
    #[arg(long)]
    height: Option<u16>,

    /// Window title template
    #[arg(long)]
    title_format: Option<String>,

    /// Query string the browser appends to the WebSocket URL
    #[arg(long)]
    ws_query_args: Option<String>,

    /// Write logs to the state directory instead of stderr
    #[arg(long, conflicts_with = "verbose")]
    log_file: bool,

    /// Verbose logging with source locations
    #[arg(short, long)]
    verbose: bool,

    /// Command to run for each client
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Args {
    fn log_config(&self) -> LogConfig {
        if self.log_file {
            LogConfig::daemon()
        } else if self.verbose {
            LogConfig::development()
        } else {
            LogConfig::server()
        }
    }

    /// Flags given on the command line win over the file
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(address) = &self.address {
            config.address = address.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(path) = &self.path {
            config.path = path.clone();
        }
        if let Some(credential) = &self.credential {
            config.enable_basic_auth = true;
            config.credential = credential.clone();
        }
        if let Some(secs) = self.reconnect_time {
            config.reconnect_time = secs;
        }
        if let Some(max) = self.max_connection {
            config.max_connection = max;
        }
        if let Some(secs) = self.timeout {
            config.timeout = secs;
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(format) = &self.title_format {
            config.title_format = format.clone();
        }
        if let Some(args) = &self.ws_query_args {
            config.ws_query_args = args.clone();
        }

        config.permit_write |= self.permit_write;
        config.enable_reconnect |= self.reconnect;
        config.once |= self.once;
        config.permit_arguments |= self.permit_arguments;
        config.pass_headers |= self.pass_headers;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging_with_config(args.log_config())?;

    let mut config = match &args.config {
        Some(path) => ConfigLoader::load_from_path(path)?,
        None => ConfigLoader::load()?,
    };
    args.apply(&mut config);

    let mut pty = PtyConfig::from_argv(&args.command)?;
    let (columns, rows) = pty.size;
    pty = pty.with_size(
        config.fixed_columns().unwrap_or(columns),
        config.fixed_rows().unwrap_or(rows),
    );

    let server_vars = title::server_variables(&args.command);
    let server = WebtermServer::new(config, Arc::new(LocalCommandFactory::new(pty)), server_vars)?;

    if !server.config().permit_write {
        info!("Clients are read-only; pass --permit-write to allow input");
    }

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                shutdown.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
        }
    });

    server.run().await
}
