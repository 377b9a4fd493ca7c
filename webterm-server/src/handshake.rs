//! Connection handshake
//!
//! Turns an upgraded client connection into a ready-to-run [`Session`]:
//! read the init message, check its auth token, spawn the process with the
//! permitted arguments, and render the window title. Nothing is spawned
//! until the credential check passes, and a process is closed again if any
//! later step fails.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use webterm_protocol::InitMessage;
use webterm_utils::{Result, WebtermError};

use crate::config::ServerConfig;
use crate::session::{MasterFrame, MasterStream, MasterTransport, Session, SessionOptions};
use crate::slave::{QueryParams, Slave, SlaveFactory};
use crate::title::{TitleTemplate, TitleVariables};

/// Per-connection facts captured before the upgrade
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub remote_addr: SocketAddr,
    pub headers: HeaderMap,
}

/// Builds sessions for upgraded connections
pub struct SessionFactory {
    config: Arc<ServerConfig>,
    slave_factory: Arc<dyn SlaveFactory>,
    title: TitleTemplate,
    server_vars: HashMap<String, String>,
}

impl SessionFactory {
    pub fn new(
        config: Arc<ServerConfig>,
        slave_factory: Arc<dyn SlaveFactory>,
        server_vars: HashMap<String, String>,
    ) -> Result<Self> {
        let title = TitleTemplate::parse(&config.title_format)?;
        Ok(Self {
            config,
            slave_factory,
            title,
            server_vars,
        })
    }

    /// Name of the process backend, used when logging why a session ended
    pub fn slave_name(&self) -> &str {
        self.slave_factory.name()
    }

    /// Complete the handshake on `master`
    ///
    /// On failure the client is sent a close frame: `authentication
    /// required` for a bad credential, `server closed` otherwise.
    pub async fn create(&self, mut master: MasterTransport, conn: &ConnectionInfo) -> Result<Session> {
        let (slave, options) = match self.prepare(&mut master.stream, conn).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.reject(master, &e).await;
                return Err(e);
            }
        };

        Session::new(master, Arc::clone(&slave), options).inspect_err(|_| {
            if let Err(e) = slave.close() {
                warn!(error = %e, "Failed to close process after session setup failed");
            }
        })
    }

    async fn prepare(
        &self,
        stream: &mut MasterStream,
        conn: &ConnectionInfo,
    ) -> Result<(Arc<dyn Slave>, SessionOptions)> {
        let init = self.read_init(stream).await?;
        self.authenticate(&init)?;

        let params = self.query_params(&init);
        let headers = self.config.pass_headers.then(|| conn.headers.clone());
        debug!(remote_addr = %conn.remote_addr, ?params, "Handshake accepted");

        let factory = Arc::clone(&self.slave_factory);
        let slave = tokio::task::spawn_blocking(move || factory.create(&params, headers.as_ref()))
            .await
            .map_err(|e| WebtermError::internal(format!("process spawn task failed: {}", e)))??;

        let title = match self.render_title(slave.as_ref(), conn) {
            Ok(title) => title,
            Err(e) => {
                if let Err(close_err) = slave.close() {
                    warn!(error = %close_err, "Failed to close process after title error");
                }
                return Err(e);
            }
        };

        Ok((slave, SessionOptions::from_config(&self.config, title)))
    }

    async fn read_init(&self, stream: &mut MasterStream) -> Result<InitMessage> {
        let timeout = self.config.session.handshake_timeout();
        let frame = match tokio::time::timeout(timeout, stream.next()).await {
            Err(_) => return Err(WebtermError::handshake("timed out waiting for init message")),
            Ok(None) => {
                return Err(WebtermError::handshake(
                    "client closed before sending init message",
                ))
            }
            Ok(Some(Err(e))) => return Err(WebtermError::handshake(e.to_string())),
            Ok(Some(Ok(frame))) => frame,
        };

        InitMessage::from_json(&frame)
            .map_err(|e| WebtermError::handshake(format!("invalid init message: {}", e)))
    }

    fn authenticate(&self, init: &InitMessage) -> Result<()> {
        let Some(expected) = self.config.credential() else {
            return Ok(());
        };

        let decoded = BASE64
            .decode(init.auth_token.trim())
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok());
        match decoded {
            Some(credential) if credential == expected => Ok(()),
            _ => Err(WebtermError::AuthenticationFailed),
        }
    }

    /// Arguments are ignored unless the server permits them
    fn query_params(&self, init: &InitMessage) -> QueryParams {
        let mut params = QueryParams::new();
        if !self.config.permit_arguments {
            return params;
        }

        let query = init.arguments.trim_start_matches('?');
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params
                .entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
        params
    }

    fn render_title(&self, slave: &dyn Slave, conn: &ConnectionInfo) -> Result<String> {
        let master_vars = HashMap::from([("remote_addr".to_string(), conn.remote_addr.to_string())]);
        let vars = TitleVariables::new()
            .with_group("server", self.server_vars.clone())
            .with_group("master", master_vars)
            .with_group("slave", slave.window_title_variables());
        self.title.render(&vars)
    }

    async fn reject(&self, mut master: MasterTransport, error: &WebtermError) {
        let frame = if error.is_auth_failure() {
            MasterFrame::close_auth_required()
        } else {
            MasterFrame::close_normal()
        };
        info!(error = %error, "Handshake failed");

        let timeout = self.config.session.close_timeout();
        let closing = async {
            master.sink.send(frame).await?;
            master.sink.close().await
        };
        match tokio::time::timeout(timeout, closing).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Failed to close client after handshake error"),
            Err(_) => debug!("Timed out closing client after handshake error"),
        }
    }
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("slave", &self.slave_factory.name())
            .field("title", &self.title.source())
            .finish_non_exhaustive()
    }
}
