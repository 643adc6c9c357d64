//! Presence tracker — whether a live interactive session is active.
//!
//! A tiny state machine behind a single lock instead of an ad hoc shared
//! boolean. Only one session is ever active in this design, so last writer
//! wins on concurrent transitions. The dispatcher pairs `query()` with a
//! second check immediately before committing to an outbound origination
//! (see `dispatch`), which closes the check-then-act race.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::model::SessionId;

/// Current presence state. Transient, in-memory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceState {
    Idle,
    InSession(SessionId),
}

impl PresenceState {
    pub fn is_in_session(&self) -> bool {
        matches!(self, PresenceState::InSession(_))
    }
}

/// Atomic presence flag fed by session lifecycle events.
#[derive(Debug)]
pub struct PresenceTracker {
    state: Mutex<PresenceState>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PresenceState::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PresenceState> {
        // The critical sections never panic, but recover the inner state
        // rather than poison every later caller.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot the current state. Safe to call concurrently with a
    /// transition.
    pub fn query(&self) -> PresenceState {
        self.lock().clone()
    }

    /// Idle → InSession on session start. A start while already in a
    /// session replaces the tracked id (last writer wins).
    pub fn session_started(&self, session_id: SessionId) {
        let mut state = self.lock();
        if let PresenceState::InSession(ref previous) = *state {
            debug!(previous = %previous, new = %session_id, "Session replaced while active");
        }
        info!(session = %session_id, "Session started");
        *state = PresenceState::InSession(session_id);
    }

    /// InSession → Idle on session end or failure. Ends for a session we
    /// are no longer tracking are ignored, so a stale end event cannot
    /// clobber a newer session.
    pub fn session_ended(&self, session_id: &SessionId) {
        let mut state = self.lock();
        match *state {
            PresenceState::InSession(ref current) if current == session_id => {
                info!(session = %session_id, "Session ended");
                *state = PresenceState::Idle;
            }
            _ => {
                debug!(session = %session_id, "Ignoring end for untracked session");
            }
        }
    }
}
