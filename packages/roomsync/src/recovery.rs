//! Recovery Coordinator
//!
//! Connection-driven state machine that re-establishes the session view after
//! a reconnect, plus the room-creation gate that holds `start()` calls until
//! recovery and the follow-up orphan cleanup are both done.
//!
//! ```text
//! Idle -> Connecting -> Connected                  (first connect, or no handle)
//!                    -> Recovering -> Recovered    (reconnect with a handle)
//!                                  -> Lost         (expired / not found / no ack)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::existence::ExistenceCheck;
use crate::registry::{RecoverySnapshot, RoomRegistry};
use crate::session::{SessionCode, SessionHandle, SessionManager};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Recovering,
    Recovered,
    Lost,
}

/// What blocks room creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateState {
    pub recovering: bool,
    /// Epoch whose orphan cleanup has not run yet.
    pub cleanup_pending: Option<u64>,
}

impl GateState {
    pub fn is_open(&self) -> bool {
        !self.recovering && self.cleanup_pending.is_none()
    }
}

/// Follow-up work the client owes a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnectAction {
    Nothing,
    /// First connect with a restored host handle: re-announce it.
    Reclaim(SessionHandle),
    /// First connect with a restored participant handle: join again.
    Rejoin(SessionHandle),
    /// Reconnect with a handle: run recovery for this epoch.
    Recover { epoch: u64 },
}

#[derive(Debug, Clone)]
pub(crate) enum RecoveryOutcome {
    Recovered {
        code: SessionCode,
        epoch: u64,
        snapshot: Arc<RecoverySnapshot>,
    },
    Lost {
        code: SessionCode,
        reason: SyncError,
    },
    /// No handle by the time the attempt ran.
    Skipped,
    /// The connection changed underneath the attempt; its result was dropped.
    Stale,
}

/// Everything a recovery attempt reads or writes.
pub(crate) struct RecoveryContext<'a> {
    pub transport: &'a Transport,
    pub sessions: &'a SessionManager,
    pub registry: &'a RoomRegistry,
    pub existence: &'a dyn ExistenceCheck,
    pub rejoin_timeout: Duration,
}

impl RecoveryContext<'_> {
    fn is_current(&self, epoch: u64) -> bool {
        let status = self.transport.status();
        status.connected && status.epoch == epoch
    }
}

pub struct RecoveryCoordinator {
    state: watch::Sender<RecoveryState>,
    gate: watch::Sender<GateState>,
    observed_disconnect: AtomicBool,
    /// Epoch of the attempt in flight, 0 when idle.
    in_flight: AtomicU64,
}

impl Default for RecoveryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryCoordinator {
    pub fn new() -> Self {
        let (state, _) = watch::channel(RecoveryState::Idle);
        let (gate, _) = watch::channel(GateState::default());
        Self {
            state,
            gate,
            observed_disconnect: AtomicBool::new(false),
            in_flight: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> RecoveryState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecoveryState> {
        self.state.subscribe()
    }

    pub fn gate(&self) -> GateState {
        *self.gate.borrow()
    }

    /// Resolve once neither recovery nor orphan cleanup is pending.
    pub async fn wait_for_gate(&self) -> Result<()> {
        let mut rx = self.gate.subscribe();
        rx.wait_for(GateState::is_open)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::Shutdown)
    }

    pub(crate) fn on_connecting(&self) {
        self.set_state(RecoveryState::Connecting);
    }

    pub(crate) fn on_disconnected(&self) {
        self.observed_disconnect.store(true, Ordering::SeqCst);
        self.set_state(RecoveryState::Connecting);
    }

    /// Decide what a new connection needs. `handle` is whatever the client
    /// holds at connect time, expired or not.
    pub(crate) fn on_connected(&self, epoch: u64, handle: Option<&SessionHandle>) -> ConnectAction {
        if !self.observed_disconnect.load(Ordering::SeqCst) {
            self.set_state(RecoveryState::Connected);
            return match handle {
                Some(h) if h.is_host => ConnectAction::Reclaim(h.clone()),
                Some(h) => ConnectAction::Rejoin(h.clone()),
                None => ConnectAction::Nothing,
            };
        }

        let Some(handle) = handle else {
            self.set_state(RecoveryState::Connected);
            self.gate.send_replace(GateState::default());
            return ConnectAction::Nothing;
        };

        if !self.try_begin(epoch) {
            debug!(epoch, "recovery already running for this connection");
            return ConnectAction::Nothing;
        }
        info!(code = %handle.code, epoch, "reconnected with a session, recovering");
        self.set_state(RecoveryState::Recovering);
        self.gate.send_modify(|g| g.recovering = true);
        ConnectAction::Recover { epoch }
    }

    fn try_begin(&self, epoch: u64) -> bool {
        self.in_flight.swap(epoch, Ordering::SeqCst) != epoch
    }

    fn finish(&self, epoch: u64) {
        let _ = self
            .in_flight
            .compare_exchange(epoch, 0, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Run one recovery attempt for `epoch` and publish its result.
    ///
    /// A lost session is torn down (handle, registry, snapshot) before the
    /// state flips to `Lost`. A stale attempt changes nothing.
    pub(crate) async fn recover(&self, ctx: &RecoveryContext<'_>, epoch: u64) -> RecoveryOutcome {
        let outcome = self.attempt(ctx, epoch).await;
        self.finish(epoch);

        match &outcome {
            RecoveryOutcome::Recovered { code, snapshot, .. } => {
                self.gate.send_replace(GateState {
                    recovering: false,
                    cleanup_pending: Some(epoch),
                });
                self.set_state(RecoveryState::Recovered);
                info!(code = %code, epoch, rooms = snapshot.len(), "session recovered");
            }
            RecoveryOutcome::Lost { code, reason } => {
                ctx.sessions.clear();
                ctx.registry.clear();
                self.gate.send_replace(GateState::default());
                self.set_state(RecoveryState::Lost);
                warn!(code = %code, epoch, error = %reason, "session lost");
            }
            RecoveryOutcome::Skipped => {
                self.gate.send_replace(GateState::default());
                self.set_state(RecoveryState::Connected);
            }
            RecoveryOutcome::Stale => {
                debug!(epoch, "connection changed during recovery, result discarded");
            }
        }
        outcome
    }

    async fn attempt(&self, ctx: &RecoveryContext<'_>, epoch: u64) -> RecoveryOutcome {
        if let Some(expired) = ctx.sessions.discard_expired() {
            return RecoveryOutcome::Lost {
                reason: SyncError::SessionExpired {
                    code: expired.code.to_string(),
                },
                code: expired.code,
            };
        }
        let Some(handle) = ctx.sessions.current() else {
            return RecoveryOutcome::Skipped;
        };
        let code = handle.code.clone();

        let exists = ctx.existence.exists(&code).await;
        if !ctx.is_current(epoch) {
            return RecoveryOutcome::Stale;
        }
        match exists {
            Ok(true) => {}
            Ok(false) => {
                return RecoveryOutcome::Lost {
                    reason: SyncError::SessionNotFound {
                        code: code.to_string(),
                    },
                    code,
                };
            }
            Err(reason) => return RecoveryOutcome::Lost { code, reason },
        }

        let joined = ctx.sessions.rejoin(&handle, ctx.rejoin_timeout).await;
        if !ctx.is_current(epoch) {
            return RecoveryOutcome::Stale;
        }
        match joined {
            Ok(reply) => RecoveryOutcome::Recovered {
                snapshot: ctx.registry.restore_from_recovery(reply.active_rooms),
                code,
                epoch,
            },
            Err(reason) => RecoveryOutcome::Lost { code, reason },
        }
    }

    /// Orphan cleanup for `epoch` is done (or skipped). Opens the gate unless
    /// a newer recovery has taken over.
    pub(crate) fn cleanup_done(&self, epoch: u64) {
        self.gate.send_if_modified(|g| {
            if g.cleanup_pending == Some(epoch) {
                g.cleanup_pending = None;
                true
            } else {
                false
            }
        });
    }

    /// Session state was dropped for a reason other than recovery.
    pub(crate) fn reset_gate(&self) {
        self.gate.send_if_modified(|g| {
            let was_closed = !g.is_open();
            *g = GateState::default();
            was_closed
        });
    }

    fn set_state(&self, next: RecoveryState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "recovery state");
        }
    }
}
