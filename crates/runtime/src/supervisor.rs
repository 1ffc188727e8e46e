//! Connection lifecycle.
//!
//! The supervisor is a plain state machine: it never sleeps or spawns. The
//! session asks it what to do and schedules timers itself, reporting back
//! with the attempt's generation so late reports from an old connection can
//! be told apart from current ones.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    /// The server closed the stream cleanly; a reconnect is scheduled.
    Draining,
    /// The stream failed or was aborted; a reconnect is scheduled.
    Reconnecting,
    /// Credentials were rejected. Nothing happens until re-authentication.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Draining => "draining",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Reconnect timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay after the server closes the stream cleanly.
    pub clean_close_delay: Duration,
    /// Delay after an error or abort.
    pub retry_delay: Duration,
    /// Period of the supervisory `ensure_connected` tick.
    pub ensure_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            clean_close_delay: Duration::ZERO,
            retry_delay: Duration::from_millis(500),
            ensure_interval: Duration::from_secs(1),
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// The server ended the stream.
    Clean,
    /// We cancelled it.
    Aborted,
    Network(String),
    Unauthorized,
}

/// A connection attempt the caller should now make.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub generation: u64,
    /// Cancelled when the attempt is aborted or torn down.
    pub cancel: CancellationToken,
}

/// What the caller should do after a disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Call [`ReconnectSupervisor::retry_due`] with `generation` after `after`.
    Retry { generation: u64, after: Duration },
    /// Stop reconnecting; credentials must be renewed.
    Halt,
    /// Stale or duplicate report.
    Ignore,
}

/// Owns every [`ConnectionState`] transition.
#[derive(Debug)]
pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
    state: ConnectionState,
    generation: u64,
    cancel: Option<CancellationToken>,
    torn_down: bool,
}

impl ReconnectSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Idle,
            generation: 0,
            cancel: None,
            torn_down: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether events from attempt `generation` should still be consumed.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.state == ConnectionState::Open
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Start an attempt if, and only if, nothing is connected, connecting or
    /// scheduled. Safe to call as often as you like.
    pub fn ensure_connected(&mut self) -> Option<Attempt> {
        if self.torn_down || self.state != ConnectionState::Idle {
            return None;
        }
        Some(self.begin())
    }

    /// The attempt `generation` has an open stream.
    pub fn on_open(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Open;
        info!(generation, "stream open");
        true
    }

    pub fn on_disconnect(&mut self, generation: u64, reason: Disconnect) -> Directive {
        let live = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        );
        if generation != self.generation || !live {
            debug!(generation, current = self.generation, ?reason, "ignoring stale disconnect");
            return Directive::Ignore;
        }
        self.cancel = None;

        let after = match reason {
            Disconnect::Clean => {
                self.state = ConnectionState::Draining;
                self.policy.clean_close_delay
            }
            Disconnect::Aborted => {
                self.state = ConnectionState::Reconnecting;
                self.policy.retry_delay
            }
            Disconnect::Network(ref error) => {
                warn!(generation, %error, "stream failed");
                self.state = ConnectionState::Reconnecting;
                self.policy.retry_delay
            }
            Disconnect::Unauthorized => {
                self.fail_auth();
                return Directive::Halt;
            }
        };
        debug!(generation, state = %self.state, ?after, "reconnect scheduled");
        Directive::Retry { generation, after }
    }

    /// A scheduled reconnect is due. Starts the next attempt unless the
    /// schedule was superseded.
    pub fn retry_due(&mut self, generation: u64) -> Option<Attempt> {
        let waiting = matches!(
            self.state,
            ConnectionState::Draining | ConnectionState::Reconnecting
        );
        if self.torn_down || generation != self.generation || !waiting {
            return None;
        }
        Some(self.begin())
    }

    /// Cancel the live attempt. The reader reports [`Disconnect::Aborted`],
    /// which schedules the usual retry. Returns `false` if nothing was live.
    pub fn abort(&mut self) -> bool {
        match self.cancel.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Any call was rejected with 401: drop the connection and stop.
    pub fn fail_auth(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.generation += 1;
        self.state = ConnectionState::Failed;
        warn!("credentials rejected, reconnection halted");
    }

    /// Cancel everything and never reconnect on our own again.
    pub fn teardown(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.generation += 1;
        self.torn_down = true;
        self.state = ConnectionState::Idle;
    }

    /// New credentials: leave `Failed` so `ensure_connected` works again.
    pub fn reauthenticate(&mut self) {
        if self.state == ConnectionState::Failed {
            self.state = ConnectionState::Idle;
        }
    }

    fn begin(&mut self) -> Attempt {
        self.generation += 1;
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        self.state = ConnectionState::Connecting;
        debug!(generation = self.generation, "connecting");
        Attempt {
            generation: self.generation,
            cancel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (ReconnectSupervisor, Attempt) {
        let mut supervisor = ReconnectSupervisor::new(ReconnectPolicy::default());
        let attempt = supervisor.ensure_connected().unwrap();
        assert!(supervisor.on_open(attempt.generation));
        (supervisor, attempt)
    }

    #[test]
    fn ensure_connected_is_idempotent() {
        let mut supervisor = ReconnectSupervisor::new(ReconnectPolicy::default());
        assert_eq!(supervisor.state(), ConnectionState::Idle);
        assert!(supervisor.ensure_connected().is_some());
        assert_eq!(supervisor.state(), ConnectionState::Connecting);
        assert!(supervisor.ensure_connected().is_none());
        assert!(supervisor.on_open(1));
        assert!(supervisor.ensure_connected().is_none());
    }

    #[test]
    fn abort_schedules_exactly_one_reconnect() {
        let (mut supervisor, attempt) = open();

        assert!(supervisor.abort());
        assert!(attempt.cancel.is_cancelled());
        let directive = supervisor.on_disconnect(attempt.generation, Disconnect::Aborted);
        assert_eq!(
            directive,
            Directive::Retry {
                generation: attempt.generation,
                after: Duration::from_millis(500)
            }
        );
        assert_eq!(supervisor.state(), ConnectionState::Reconnecting);

        // Nothing live to abort, and a duplicate report changes nothing.
        assert!(!supervisor.abort());
        assert_eq!(
            supervisor.on_disconnect(attempt.generation, Disconnect::Aborted),
            Directive::Ignore
        );
        assert!(supervisor.ensure_connected().is_none());

        let next = supervisor.retry_due(attempt.generation).unwrap();
        assert_eq!(next.generation, attempt.generation + 1);
        assert!(supervisor.retry_due(attempt.generation).is_none());
    }

    #[test]
    fn clean_close_reconnects_immediately() {
        let (mut supervisor, attempt) = open();
        let directive = supervisor.on_disconnect(attempt.generation, Disconnect::Clean);
        assert_eq!(
            directive,
            Directive::Retry {
                generation: attempt.generation,
                after: Duration::ZERO
            }
        );
        assert_eq!(supervisor.state(), ConnectionState::Draining);
        assert!(supervisor.retry_due(attempt.generation).is_some());
        assert_eq!(supervisor.state(), ConnectionState::Connecting);
    }

    #[test]
    fn network_error_before_open_retries() {
        let mut supervisor = ReconnectSupervisor::new(ReconnectPolicy::default());
        let attempt = supervisor.ensure_connected().unwrap();
        let directive =
            supervisor.on_disconnect(attempt.generation, Disconnect::Network("refused".into()));
        assert!(matches!(directive, Directive::Retry { .. }));
        assert_eq!(supervisor.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn unauthorized_halts_until_reauthenticated() {
        let (mut supervisor, attempt) = open();
        assert_eq!(
            supervisor.on_disconnect(attempt.generation, Disconnect::Unauthorized),
            Directive::Halt
        );
        assert_eq!(supervisor.state(), ConnectionState::Failed);
        assert!(supervisor.ensure_connected().is_none());
        assert!(supervisor.retry_due(attempt.generation).is_none());

        supervisor.reauthenticate();
        assert_eq!(supervisor.state(), ConnectionState::Idle);
        assert!(supervisor.ensure_connected().is_some());
    }

    #[test]
    fn stale_generation_is_ignored() {
        let (mut supervisor, first) = open();
        supervisor.on_disconnect(first.generation, Disconnect::Clean);
        let second = supervisor.retry_due(first.generation).unwrap();

        assert_eq!(
            supervisor.on_disconnect(first.generation, Disconnect::Network("late".into())),
            Directive::Ignore
        );
        assert!(!supervisor.on_open(first.generation));
        assert!(supervisor.on_open(second.generation));
        assert!(!supervisor.is_current(first.generation));
        assert!(supervisor.is_current(second.generation));
    }

    #[test]
    fn teardown_cancels_and_suppresses_reconnect() {
        let (mut supervisor, attempt) = open();
        supervisor.teardown();
        assert!(attempt.cancel.is_cancelled());
        assert_eq!(
            supervisor.on_disconnect(attempt.generation, Disconnect::Aborted),
            Directive::Ignore
        );
        assert!(supervisor.ensure_connected().is_none());
    }

    #[test]
    fn teardown_supersedes_pending_retry() {
        let (mut supervisor, attempt) = open();
        supervisor.on_disconnect(attempt.generation, Disconnect::Network("reset".into()));
        supervisor.teardown();
        assert!(supervisor.retry_due(attempt.generation).is_none());
    }
}
