//! Connection admission control
//!
//! One [`AdmissionController`] exists per server. It counts active sessions,
//! enforces the connection limit and single-shot mode, and cancels the whole
//! server once no session has been active for the configured idle timeout.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webterm_utils::{Result, WebtermError};

/// Rejection reason when the connection limit is reached
pub const REASON_MAX_CONNECTIONS: &str = "exceeding max number of connections";

/// Rejection reason once the single-shot slot has been used
pub const REASON_ONCE: &str = "server is not accepting further clients";

/// Admission policy, resolved once from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionPolicy {
    /// Maximum concurrent sessions, 0 means unlimited
    pub max_connections: usize,
    /// Admit at most one session for the server's lifetime
    pub once: bool,
    /// Shut down after this long with no active session
    pub idle_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdleTimer {
    Armed(Instant),
    Disarmed,
}

/// Process-wide session counter and shutdown trigger
#[derive(Debug)]
pub struct AdmissionController {
    policy: AdmissionPolicy,
    active: AtomicUsize,
    admitted: AtomicBool,
    timer: watch::Sender<IdleTimer>,
    shutdown: CancellationToken,
}

impl AdmissionController {
    /// Create a controller that cancels `shutdown` on idle timeout or after
    /// the single-shot session ends.
    ///
    /// The idle timer starts armed: a server nobody connects to also times out.
    pub fn new(policy: AdmissionPolicy, shutdown: CancellationToken) -> Self {
        let initial = match policy.idle_timeout {
            Some(timeout) => IdleTimer::Armed(Instant::now() + timeout),
            None => IdleTimer::Disarmed,
        };
        let (timer, _) = watch::channel(initial);

        Self {
            policy,
            active: AtomicUsize::new(0),
            admitted: AtomicBool::new(false),
            timer,
            shutdown,
        }
    }

    /// Number of sessions currently admitted
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Token cancelled when the whole server must stop
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Claim the single-shot slot. Always succeeds outside once mode.
    pub fn try_admit(&self) -> bool {
        if !self.policy.once {
            return true;
        }
        self.admitted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Count a new session, returning the new active count
    ///
    /// The increment only happens when it stays within the limit.
    pub fn enter(&self) -> Result<usize> {
        let max = self.policy.max_connections;
        let previous = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if max > 0 && n >= max {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .map_err(|_| WebtermError::rejected(REASON_MAX_CONNECTIONS))?;

        if self.policy.idle_timeout.is_some() {
            self.timer.send_replace(IdleTimer::Disarmed);
        }

        Ok(previous + 1)
    }

    /// Uncount a session, returning the new active count
    pub fn leave(&self) -> usize {
        let remaining = match self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => {
                warn!("leave() called with no active sessions");
                0
            }
        };

        if remaining == 0 {
            if let Some(timeout) = self.policy.idle_timeout {
                self.timer
                    .send_replace(IdleTimer::Armed(Instant::now() + timeout));
            }
        }

        if self.policy.once {
            info!("Single-shot session finished, shutting down");
            self.shutdown.cancel();
        }

        remaining
    }

    /// Enter and return a guard that leaves on drop
    pub fn admit(self: &Arc<Self>) -> Result<AdmissionTicket> {
        let count = self.enter()?;
        Ok(AdmissionTicket {
            controller: Arc::clone(self),
            count,
        })
    }

    /// Drive the idle timer until it fires or the server shuts down
    ///
    /// Cancels the shutdown token at most once, and only if no session is
    /// active when the deadline passes.
    pub async fn run_idle_timer(self: Arc<Self>) {
        let Some(timeout) = self.policy.idle_timeout else {
            return;
        };
        let mut rx = self.timer.subscribe();

        loop {
            let state = *rx.borrow_and_update();
            match state {
                IdleTimer::Disarmed => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
                IdleTimer::Armed(deadline) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep_until(deadline) => {
                            if self.active() == 0 {
                                info!(
                                    timeout_secs = timeout.as_secs(),
                                    "No active sessions before timeout, shutting down"
                                );
                                self.shutdown.cancel();
                                return;
                            }
                            debug!("Idle deadline passed with active sessions, disarming");
                            self.timer.send_if_modified(|timer| {
                                if *timer == IdleTimer::Armed(deadline) {
                                    *timer = IdleTimer::Disarmed;
                                    true
                                } else {
                                    false
                                }
                            });
                        }
                    }
                }
            }
        }
    }
}

/// RAII admission; calls [`AdmissionController::leave`] exactly once on drop
#[derive(Debug)]
pub struct AdmissionTicket {
    controller: Arc<AdmissionController>,
    count: usize,
}

impl AdmissionTicket {
    /// Active count right after this session entered
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.controller.leave();
    }
}
