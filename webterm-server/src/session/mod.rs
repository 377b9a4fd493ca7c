//! Session engine
//!
//! A [`Session`] bridges one client connection (the master) and one process
//! (the slave). Running a session spawns five cooperating tasks that share a
//! child cancellation token:
//!
//! - master reader: decodes client frames and dispatches them
//! - master writer: the only owner of the client sink
//! - output relay: process output to `Output` frames
//! - slave writer: keystrokes and resizes to the process
//! - keepalive: transport pings and optional idle detection
//!
//! The first task to finish decides the [`CloseReason`]. Teardown then
//! cancels the others, closes the process once, and waits for every task so
//! that both transports are closed exactly once before `run` returns.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use webterm_protocol::{ClientMessage, CodecError, PayloadEncoding, ServerMessage};
use webterm_utils::{Result, WebtermError};

use crate::slave::Slave;

pub mod options;
mod output;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport;

pub use options::{teardown_grace, SessionOptions};
pub use output::OutputCounters;
pub use transport::{
    MasterFrame, MasterSink, MasterStream, MasterTransport, TransportError, CLOSE_POLICY_VIOLATION,
};

use output::OutputRelay;

/// Pong and keepalive frames waiting for the writer
const CONTROL_QUEUE: usize = 32;

/// Output frames waiting for the writer; the relay keeps its own backlog
const OUTPUT_QUEUE: usize = 16;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Running,
    Closing,
    Closed,
}

/// Why a session ended
#[derive(Debug)]
pub enum CloseReason {
    /// The process exited or its I/O failed
    SlaveClosed,
    /// The client disconnected or went silent
    MasterClosed,
    /// The server is shutting down
    Cancelled,
    /// The client sent a frame that could not be decoded
    Malformed(CodecError),
}

impl CloseReason {
    /// Whether the client violated the protocol
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, CloseReason::Malformed(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::SlaveClosed => write!(f, "process"),
            CloseReason::MasterClosed => write!(f, "client"),
            CloseReason::Cancelled => write!(f, "cancellation"),
            CloseReason::Malformed(e) => write!(f, "malformed message: {}", e),
        }
    }
}

impl From<CloseReason> for WebtermError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::SlaveClosed => WebtermError::ProcessTransportClosed,
            CloseReason::MasterClosed => WebtermError::ClientTransportClosed,
            CloseReason::Cancelled => WebtermError::Cancelled,
            CloseReason::Malformed(e) => WebtermError::malformed(e.to_string()),
        }
    }
}

/// Work for the slave writer
#[derive(Debug)]
enum SlaveCommand {
    Write(Bytes),
    Resize { columns: u16, rows: u16 },
}

/// Time of the last inbound client frame
#[derive(Debug)]
struct Activity(Mutex<Instant>);

impl Activity {
    fn new() -> Self {
        Self(Mutex::new(Instant::now()))
    }

    fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.0.lock().elapsed()
    }
}

/// One client connected to one process
pub struct Session {
    id: Uuid,
    master: MasterTransport,
    slave: Arc<dyn Slave>,
    options: SessionOptions,
    state: watch::Sender<SessionState>,
    counters: Arc<OutputCounters>,
}

impl Session {
    pub fn new(master: MasterTransport, slave: Arc<dyn Slave>, options: SessionOptions) -> Result<Self> {
        options.validate()?;
        let (state, _) = watch::channel(SessionState::Initializing);

        Ok(Self {
            id: Uuid::new_v4(),
            master,
            slave,
            options,
            state,
            counters: Arc::new(OutputCounters::default()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions, including after `run` consumed the session
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Run until either side ends or `cancel` fires
    ///
    /// Both transports are closed exactly once before this returns.
    pub async fn run(self, cancel: CancellationToken) -> CloseReason {
        let Session {
            id,
            master,
            slave,
            options,
            state,
            counters,
        } = self;
        let MasterTransport { stream, sink } = master;

        let token = cancel.child_token();
        let (control_tx, control_rx) = mpsc::channel::<MasterFrame>(CONTROL_QUEUE);
        let (output_tx, output_rx) = mpsc::channel::<MasterFrame>(OUTPUT_QUEUE);
        let (slave_tx, slave_rx) = mpsc::unbounded_channel::<SlaveCommand>();
        let (encoding_tx, encoding_rx) = watch::channel(PayloadEncoding::default());
        let activity = Arc::new(Activity::new());

        for message in initial_messages(&options, counters.forwarded()) {
            if let Some(frame) = data_frame(id, &message) {
                if control_tx.try_send(frame).is_err() {
                    warn!(session_id = %id, tag = ?message.tag(), "Dropped initial message");
                }
            }
        }

        let mut tasks: JoinSet<CloseReason> = JoinSet::new();

        tasks.spawn(write_master(
            id,
            sink,
            control_rx,
            output_rx,
            token.clone(),
            options.close_timeout,
        ));

        tasks.spawn(
            MasterReader {
                session_id: id,
                stream,
                control_tx: control_tx.clone(),
                slave_tx,
                encoding: encoding_tx,
                activity: Arc::clone(&activity),
                permit_write: options.permit_write,
                size_is_fixed: options.size_is_fixed(),
                fixed_columns: options.fixed_columns,
                fixed_rows: options.fixed_rows,
                token: token.clone(),
            }
            .run(),
        );

        tasks.spawn(
            OutputRelay::new(
                id,
                Arc::clone(&slave),
                output_tx,
                encoding_rx,
                Arc::clone(&counters),
                options.max_output_chunk,
                options.output_backlog,
                options.close_timeout,
                token.clone(),
            )
            .run(),
        );

        tasks.spawn(write_slave(id, Arc::clone(&slave), slave_rx, token.clone()));

        tasks.spawn(keepalive(
            id,
            control_tx,
            activity,
            options.keepalive_interval,
            options.keepalive_timeout,
            token.clone(),
        ));

        state.send_replace(SessionState::Running);
        info!(
            session_id = %id,
            permit_write = options.permit_write,
            title = %options.window_title,
            "Session started"
        );

        let reason = match tasks.join_next().await {
            Some(Ok(reason)) => reason,
            Some(Err(e)) => {
                error!(session_id = %id, error = %e, "Session task failed");
                CloseReason::Cancelled
            }
            None => CloseReason::Cancelled,
        };

        state.send_replace(SessionState::Closing);
        debug!(session_id = %id, reason = %reason, "Session closing");
        token.cancel();

        let closer = Arc::clone(&slave);
        match tokio::task::spawn_blocking(move || closer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session_id = %id, error = %e, "Failed to close process"),
            Err(e) => warn!(session_id = %id, error = %e, "Process close task failed"),
        }

        let grace = teardown_grace(options.close_timeout);
        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!(session_id = %id, error = %e, "Session task panicked");
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(session_id = %id, "Session tasks did not stop in time, aborting");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        state.send_replace(SessionState::Closed);
        info!(
            session_id = %id,
            reason = %reason,
            forwarded = counters.forwarded(),
            dropped = counters.dropped(),
            "Session closed"
        );
        reason
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Messages queued before any output, in order
fn initial_messages(options: &SessionOptions, buffered: u64) -> Vec<ServerMessage> {
    let mut messages = vec![ServerMessage::SetWindowTitle(options.window_title.clone())];
    if let Some(preferences) = &options.preferences {
        messages.push(ServerMessage::SetPreferences(preferences.clone()));
    }
    if let Some(secs) = options.reconnect {
        messages.push(ServerMessage::SetReconnect(secs));
    }
    messages.push(ServerMessage::SetBufferSize(buffered));
    messages
}

fn data_frame(session_id: Uuid, message: &ServerMessage) -> Option<MasterFrame> {
    match message.encode() {
        Ok(frame) => Some(MasterFrame::Data(frame)),
        Err(e) => {
            error!(session_id = %session_id, tag = ?message.tag(), error = %e, "Failed to encode message");
            None
        }
    }
}

/// Completes `grace` after `token` is cancelled
async fn drain_deadline(token: CancellationToken, grace: Duration) {
    token.cancelled().await;
    tokio::time::sleep(grace).await;
}

/// Sole owner of the client sink
///
/// Control frames go first. After cancellation, frames already queued are
/// still flushed until the drain deadline, then a close frame is sent and the
/// sink is closed.
async fn write_master(
    session_id: Uuid,
    mut sink: MasterSink,
    mut control_rx: mpsc::Receiver<MasterFrame>,
    mut output_rx: mpsc::Receiver<MasterFrame>,
    token: CancellationToken,
    close_timeout: Duration,
) -> CloseReason {
    let deadline = drain_deadline(token.clone(), close_timeout);
    tokio::pin!(deadline);

    let reason = loop {
        let frame = tokio::select! {
            biased;

            Some(frame) = control_rx.recv() => frame,
            Some(frame) = output_rx.recv() => frame,
            _ = token.cancelled() => break CloseReason::Cancelled,
        };

        let sent = tokio::select! {
            result = sink.send(frame) => result,
            _ = &mut deadline => {
                debug!(session_id = %session_id, "Client did not drain in time");
                break CloseReason::Cancelled;
            }
        };
        if let Err(e) = sent {
            debug!(session_id = %session_id, error = %e, "Client write failed");
            break CloseReason::MasterClosed;
        }
    };

    if !matches!(reason, CloseReason::MasterClosed) {
        match tokio::time::timeout(close_timeout, sink.send(MasterFrame::close_normal())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => trace!(session_id = %session_id, error = %e, "Close frame not sent"),
            Err(_) => debug!(session_id = %session_id, "Timed out sending close frame"),
        }
    }
    match tokio::time::timeout(close_timeout, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!(session_id = %session_id, error = %e, "Client close failed"),
        Err(_) => debug!(session_id = %session_id, "Timed out closing client"),
    }

    reason
}

/// Decodes client frames and dispatches them
struct MasterReader {
    session_id: Uuid,
    stream: MasterStream,
    control_tx: mpsc::Sender<MasterFrame>,
    slave_tx: mpsc::UnboundedSender<SlaveCommand>,
    encoding: watch::Sender<PayloadEncoding>,
    activity: Arc<Activity>,
    permit_write: bool,
    size_is_fixed: bool,
    fixed_columns: Option<u16>,
    fixed_rows: Option<u16>,
    token: CancellationToken,
}

impl MasterReader {
    async fn run(mut self) -> CloseReason {
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => return CloseReason::Cancelled,
                next = self.stream.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!(session_id = %self.session_id, error = %e, "Client read failed");
                    return CloseReason::MasterClosed;
                }
                None => {
                    debug!(session_id = %self.session_id, "Client disconnected");
                    return CloseReason::MasterClosed;
                }
            };
            self.activity.touch();

            let message = match ClientMessage::decode(frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "Malformed client message");
                    return CloseReason::Malformed(e);
                }
            };

            if let Some(reason) = self.dispatch(message).await {
                return reason;
            }
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Option<CloseReason> {
        match message {
            ClientMessage::Input(data) => {
                if !self.permit_write {
                    trace!(session_id = %self.session_id, len = data.len(), "Input ignored, writes not permitted");
                    return None;
                }
                let encoding = *self.encoding.borrow();
                let data = match encoding.decode(data) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(session_id = %self.session_id, error = %e, "Undecodable input");
                        return Some(CloseReason::Malformed(e));
                    }
                };
                if self.slave_tx.send(SlaveCommand::Write(data)).is_err() {
                    return Some(CloseReason::SlaveClosed);
                }
            }

            ClientMessage::Ping => {
                let frame = data_frame(self.session_id, &ServerMessage::Pong)?;
                tokio::select! {
                    _ = self.token.cancelled() => return Some(CloseReason::Cancelled),
                    result = self.control_tx.send(frame) => {
                        if result.is_err() {
                            return Some(CloseReason::MasterClosed);
                        }
                    }
                }
            }

            ClientMessage::ResizeTerminal(size) => {
                if self.size_is_fixed {
                    trace!(session_id = %self.session_id, "Resize ignored, size is fixed");
                    return None;
                }
                if size.columns == 0 || size.rows == 0 {
                    debug!(session_id = %self.session_id, ?size, "Ignoring empty resize");
                    return None;
                }
                let command = SlaveCommand::Resize {
                    columns: self.fixed_columns.unwrap_or(size.columns),
                    rows: self.fixed_rows.unwrap_or(size.rows),
                };
                if self.slave_tx.send(command).is_err() {
                    return Some(CloseReason::SlaveClosed);
                }
            }

            ClientMessage::SetEncoding(name) => match PayloadEncoding::from_name(&name) {
                Some(encoding) => {
                    debug!(session_id = %self.session_id, encoding = %encoding, "Payload encoding changed");
                    self.encoding.send_replace(encoding);
                }
                None => {
                    warn!(session_id = %self.session_id, encoding = %name, "Unsupported encoding requested");
                }
            },

            ClientMessage::Unknown(_) => {
                debug!(session_id = %self.session_id, "Ignoring unknown message");
            }
        }
        None
    }
}

/// Applies client input and resizes to the process
async fn write_slave(
    session_id: Uuid,
    slave: Arc<dyn Slave>,
    mut commands: mpsc::UnboundedReceiver<SlaveCommand>,
    token: CancellationToken,
) -> CloseReason {
    loop {
        let command = tokio::select! {
            _ = token.cancelled() => return CloseReason::Cancelled,
            command = commands.recv() => command,
        };

        // The reader is gone; let another task decide the outcome
        let Some(command) = command else {
            token.cancelled().await;
            return CloseReason::Cancelled;
        };

        let is_write = matches!(command, SlaveCommand::Write(_));
        let target = Arc::clone(&slave);
        let handle = tokio::task::spawn_blocking(move || match command {
            SlaveCommand::Write(data) => target.write(&data).map_err(WebtermError::from),
            SlaveCommand::Resize { columns, rows } => target.resize(columns, rows),
        });

        let result = tokio::select! {
            _ = token.cancelled() => return CloseReason::Cancelled,
            result = handle => result,
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) if is_write => {
                debug!(session_id = %session_id, error = %e, "Process write failed");
                return CloseReason::SlaveClosed;
            }
            Ok(Err(e)) => warn!(session_id = %session_id, error = %e, "Process resize failed"),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Process write task failed");
                return CloseReason::SlaveClosed;
            }
        }
    }
}

/// Periodic transport pings and idle detection
async fn keepalive(
    session_id: Uuid,
    control_tx: mpsc::Sender<MasterFrame>,
    activity: Arc<Activity>,
    interval: Option<Duration>,
    idle_timeout: Option<Duration>,
    token: CancellationToken,
) -> CloseReason {
    let Some(period) = interval.or(idle_timeout) else {
        token.cancelled().await;
        return CloseReason::Cancelled;
    };

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => return CloseReason::Cancelled,
            _ = ticker.tick() => {
                if let Some(limit) = idle_timeout {
                    let idle = activity.idle_for();
                    if idle >= limit {
                        info!(session_id = %session_id, idle_secs = idle.as_secs(), "Client idle, closing session");
                        return CloseReason::MasterClosed;
                    }
                }
                if interval.is_some() {
                    match control_tx.try_send(MasterFrame::Keepalive) {
                        Ok(()) => trace!(session_id = %session_id, "Keepalive queued"),
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            trace!(session_id = %session_id, "Writer busy, skipping keepalive");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            token.cancelled().await;
                            return CloseReason::Cancelled;
                        }
                    }
                }
            }
        }
    }
}
