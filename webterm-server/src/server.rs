//! HTTP and WebSocket server
//!
//! Routes, relative to the configured base path:
//!
//! - `GET /ws`: upgrade to a terminal session
//! - `GET /config.js`, `GET /auth_token.js`: settings for the browser client
//! - `POST /api/auth/verify`: check a basic-auth credential
//!
//! Every route except the WebSocket endpoint and the verify endpoint sits
//! behind basic auth when it is enabled. The WebSocket endpoint checks the
//! credential itself so browsers can pass it as `?auth=`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, RawQuery, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use webterm_protocol::PROTOCOL_NAME;
use webterm_utils::Result;

use crate::admission::{AdmissionController, AdmissionTicket, REASON_ONCE};
use crate::config::{ConfigLoader, ServerConfig};
use crate::handshake::{ConnectionInfo, SessionFactory};
use crate::session::{teardown_grace, CloseReason};
use crate::slave::SlaveFactory;
use crate::ws::split_websocket;

/// Shared state accessible from axum handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub admission: Arc<AdmissionController>,
    pub factory: Arc<SessionFactory>,
    /// Running sessions, awaited on shutdown
    pub sessions: TaskTracker,
}

/// Build the router with all routes
pub fn build_router(state: AppState) -> Router {
    let guarded = Router::new()
        .route("/config.js", get(config_js))
        .route("/auth_token.js", get(auth_token_js))
        .route_layer(middleware::from_fn_with_state(state.clone(), basic_auth));

    let routes = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/auth/verify", post(verify_handler))
        .merge(guarded)
        .with_state(state.clone());

    let base = state.config.base_path();
    if base.is_empty() {
        routes
    } else {
        Router::new().nest(&base, routes)
    }
}

/// The webterm server
pub struct WebtermServer {
    state: AppState,
    shutdown: CancellationToken,
}

impl WebtermServer {
    /// Validate `config` and wire up admission and session creation
    pub fn new(
        config: ServerConfig,
        slave_factory: Arc<dyn SlaveFactory>,
        server_vars: HashMap<String, String>,
    ) -> Result<Self> {
        ConfigLoader::validate(&config)?;
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();

        let admission = Arc::new(AdmissionController::new(
            config.admission_policy(),
            shutdown.clone(),
        ));
        let factory = Arc::new(SessionFactory::new(
            Arc::clone(&config),
            slave_factory,
            server_vars,
        )?);

        Ok(Self {
            state: AppState {
                config,
                admission,
                factory,
                sessions: TaskTracker::new(),
            },
            shutdown,
        })
    }

    /// Cancelling this token stops the server and every session
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.state.admission
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.state.config.listen_addr()).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            path = %self.state.config.base_path(),
            permit_write = self.state.config.permit_write,
            "Webterm server listening"
        );

        tokio::spawn(Arc::clone(&self.state.admission).run_idle_timer());

        let shutdown = self.shutdown.clone();
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        // Sessions observe the same token and finish teardown within this bound
        let sessions = &self.state.sessions;
        sessions.close();
        let grace = teardown_grace(self.state.config.session.close_timeout());
        if tokio::time::timeout(grace, sessions.wait()).await.is_err() {
            warn!(remaining = sessions.len(), "Sessions still running at exit");
        }

        info!("Webterm server stopped");
        Ok(())
    }
}

/// GET /ws
async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Some(expected) = state.config.credential() {
        if !websocket_authorized(query.as_deref(), &headers, expected) {
            warn!(remote_addr = %remote_addr, "Unauthorized WebSocket request");
            return unauthorized();
        }
    }

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    if !state.admission.try_admit() {
        info!(remote_addr = %remote_addr, reason = REASON_ONCE, "Connection rejected");
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response();
    }

    let ticket = match state.admission.admit() {
        Ok(ticket) => ticket,
        Err(e) => {
            warn!(
                remote_addr = %remote_addr,
                max = state.config.max_connection,
                error = %e,
                "Connection rejected"
            );
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    info!(
        remote_addr = %remote_addr,
        active = ticket.count(),
        max = state.config.max_connection,
        "New client connected"
    );

    let conn = ConnectionInfo {
        remote_addr,
        headers,
    };
    let sessions = state.sessions.clone();
    upgrade
        .protocols([PROTOCOL_NAME])
        .on_upgrade(move |socket| sessions.track_future(serve_socket(state, socket, conn, ticket)))
}

/// Handshake and run one session, holding its admission ticket throughout
async fn serve_socket(
    state: AppState,
    socket: WebSocket,
    conn: ConnectionInfo,
    ticket: AdmissionTicket,
) {
    let master = split_websocket(socket);

    let close_reason = match state.factory.create(master, &conn).await {
        Ok(session) => {
            let session_id = session.id();
            debug!(session_id = %session_id, remote_addr = %conn.remote_addr, "Session created");
            match session.run(state.admission.shutdown_token()).await {
                CloseReason::SlaveClosed => state.factory.slave_name().to_string(),
                reason => {
                    if reason.is_protocol_error() {
                        warn!(
                            session_id = %session_id,
                            remote_addr = %conn.remote_addr,
                            reason = %reason,
                            "Client broke the protocol"
                        );
                    }
                    reason.to_string()
                }
            }
        }
        Err(e) if e.is_session_local() => {
            debug!(remote_addr = %conn.remote_addr, error = %e, "Client left during handshake");
            format!("an error: {}", e)
        }
        Err(e) => format!("an error: {}", e),
    };

    drop(ticket);
    info!(
        remote_addr = %conn.remote_addr,
        reason = %close_reason,
        active = state.admission.active(),
        max = state.config.max_connection,
        "Connection closed"
    );
}

/// GET /config.js
async fn config_js(State(state): State<AppState>) -> impl IntoResponse {
    let body = format!(
        "var gotty_term = 'xterm';\nvar gotty_ws_query_args = '{}';\nvar gotty_enable_auth = {};",
        js_string(&state.config.ws_query_args),
        state.config.enable_basic_auth
    );
    ([(header::CONTENT_TYPE, "application/javascript")], body)
}

/// GET /auth_token.js
async fn auth_token_js(State(state): State<AppState>) -> impl IntoResponse {
    let body = format!(
        "var gotty_auth_token = '{}';",
        js_string(state.config.credential().unwrap_or_default())
    );
    ([(header::CONTENT_TYPE, "application/javascript")], body)
}

/// POST /api/auth/verify
async fn verify_handler(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let Some(expected) = state.config.credential() else {
        return verify_response(StatusCode::OK, true, "Authentication not required");
    };

    let Some(encoded) = basic_token(&headers) else {
        return verify_response(StatusCode::UNAUTHORIZED, false, "Invalid authorization header");
    };
    let Some(credential) = decode_credential(encoded) else {
        return verify_response(StatusCode::UNAUTHORIZED, false, "Invalid credentials");
    };
    if credential != expected {
        return verify_response(StatusCode::UNAUTHORIZED, false, "Authentication failed");
    }

    info!(remote_addr = %remote_addr, "Authentication succeeded");
    verify_response(StatusCode::OK, true, "Authentication successful")
}

fn verify_response(status: StatusCode, success: bool, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "success": success, "message": message })),
    )
        .into_response()
}

/// Basic-auth guard for the non-WebSocket routes
async fn basic_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.config.credential() else {
        return next.run(request).await;
    };

    let presented = basic_token(request.headers()).and_then(decode_credential);
    if presented.as_deref() == Some(expected) {
        next.run(request).await
    } else {
        unauthorized()
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"webterm\"")],
        "Unauthorized",
    )
        .into_response()
}

/// `?auth=` wins over the `Authorization` header when present
fn websocket_authorized(query: Option<&str>, headers: &HeaderMap, expected: &str) -> bool {
    let from_query = query.and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, value)| key == "auth" && !value.is_empty())
            .map(|(_, value)| value.into_owned())
    });

    let presented = match from_query {
        Some(token) => decode_credential(&token),
        None => basic_token(headers).and_then(decode_credential),
    };
    presented.as_deref() == Some(expected)
}

/// Encoded part of an `Authorization: Basic ...` header
fn basic_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("basic").then(|| token.trim())
}

fn decode_credential(encoded: &str) -> Option<String> {
    let raw = BASE64.decode(encoded.trim()).ok()?;
    String::from_utf8(raw).ok()
}

/// Escape a value for a single-quoted JavaScript string literal
fn js_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '<' => out.push_str("\\x3c"),
            c => out.push(c),
        }
    }
    out
}
