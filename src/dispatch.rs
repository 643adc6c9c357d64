//! Delivery dispatcher: routes one due reminder to the right delivery
//! path based on presence.
//!
//! In-session reminders are injected into the live session; idle ones
//! trigger an outbound origination. Presence is re-checked immediately
//! before committing to an origination, so a session that starts between
//! the scheduler's tick and the dispatch flips the attempt to injection
//! instead of double-engaging the user.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{AgentError, GatewayError};
use crate::gateway::{ConversationalAgent, TelephonyGateway};
use crate::model::{Reminder, SessionId};
use crate::presence::{PresenceState, PresenceTracker};

/// Which path a delivery went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Announced inside an already-live session.
    Injection,
    /// A new outbound session was originated.
    Origination,
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The announcement reached the user.
    Delivered {
        path: DeliveryPath,
        session_id: SessionId,
    },
    /// Nothing was attempted or the session vanished mid-injection; the
    /// reminder stays due and is retried on a later tick.
    Deferred,
    /// An origination was attempted and failed.
    Failed { reason: String, transient: bool },
}

/// Routes due reminders to injection or origination.
pub struct Dispatcher {
    presence: Arc<PresenceTracker>,
    gateway: Arc<dyn TelephonyGateway>,
    agent: Arc<dyn ConversationalAgent>,
    /// Target phone number for originations (E.164).
    recipient: String,
    origination_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        presence: Arc<PresenceTracker>,
        gateway: Arc<dyn TelephonyGateway>,
        agent: Arc<dyn ConversationalAgent>,
        recipient: String,
        origination_timeout: Duration,
    ) -> Self {
        Self {
            presence,
            gateway,
            agent,
            recipient,
            origination_timeout,
        }
    }

    /// Attempt delivery of one due reminder.
    pub async fn deliver(&self, reminder: &Reminder) -> DeliveryOutcome {
        match self.presence.query() {
            PresenceState::InSession(session_id) => self.inject(reminder, session_id).await,
            PresenceState::Idle => self.originate(reminder).await,
        }
    }

    /// Injection path. Never originates; a vanished session defers the
    /// reminder to the next tick.
    async fn inject(&self, reminder: &Reminder, session_id: SessionId) -> DeliveryOutcome {
        match self
            .agent
            .inject_context(&session_id, &reminder.announcement())
            .await
        {
            Ok(()) => {
                info!(reminder = %reminder.id, session = %session_id, "Injected reminder");
                DeliveryOutcome::Delivered {
                    path: DeliveryPath::Injection,
                    session_id,
                }
            }
            Err(AgentError::SessionClosed { .. }) => {
                warn!(reminder = %reminder.id, session = %session_id, "Session closed before injection, deferring");
                self.presence.session_ended(&session_id);
                DeliveryOutcome::Deferred
            }
            Err(AgentError::Unavailable(reason)) => {
                warn!(reminder = %reminder.id, %reason, "Agent unavailable, deferring");
                DeliveryOutcome::Deferred
            }
        }
    }

    /// Origination path. Re-checks presence right before dialing; if a
    /// session started in the meantime, injects into it instead.
    async fn originate(&self, reminder: &Reminder) -> DeliveryOutcome {
        if let PresenceState::InSession(session_id) = self.presence.query() {
            return self.inject(reminder, session_id).await;
        }

        let announcement = reminder.announcement();
        let attempt = self
            .gateway
            .originate_session(&self.recipient, &announcement);

        match tokio::time::timeout(self.origination_timeout, attempt).await {
            Ok(Ok(session_id)) => {
                info!(reminder = %reminder.id, session = %session_id, "Delivered via outbound session");
                self.presence.session_started(session_id.clone());
                DeliveryOutcome::Delivered {
                    path: DeliveryPath::Origination,
                    session_id,
                }
            }
            Ok(Err(e)) => {
                warn!(reminder = %reminder.id, error = %e, "Origination failed");
                DeliveryOutcome::Failed {
                    reason: e.to_string(),
                    transient: e.is_transient(),
                }
            }
            Err(_) => {
                let e = GatewayError::Timeout {
                    timeout: self.origination_timeout,
                };
                warn!(reminder = %reminder.id, error = %e, "Origination timed out");
                DeliveryOutcome::Failed {
                    reason: e.to_string(),
                    transient: true,
                }
            }
        }
    }
}
