//! Outbound communication seams: telephony gateway and conversational
//! agent.
//!
//! The scheduling core never talks to Twilio directly. It goes through
//! these two traits, so the dispatcher and scheduler are testable with
//! in-process fakes and the Twilio client stays confined to one module.

pub mod twilio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AgentError, GatewayError};
use crate::model::{Medium, Participant, SessionId};

pub use twilio::{TwilioAgent, TwilioConfig, TwilioGateway};

/// Outbound side of the telephony provider.
#[async_trait]
pub trait TelephonyGateway: Send + Sync {
    /// Originate an interactive session (a call) to `target` and speak
    /// `announcement` once it connects. Resolves when the session is
    /// established, or with the reason it could not be.
    async fn originate_session(
        &self,
        target: &str,
        announcement: &str,
    ) -> Result<SessionId, GatewayError>;

    /// Deliver a one-way text on the given medium.
    async fn deliver_text(
        &self,
        target: &str,
        medium: Medium,
        body: &str,
    ) -> Result<SessionId, GatewayError>;
}

/// Injection side: pushing content into a session that is already live.
#[async_trait]
pub trait ConversationalAgent: Send + Sync {
    /// Inject `announcement` into the live session so the agent voices it
    /// in-flow. Fails with `SessionClosed` if the session has ended
    /// between the presence check and the injection.
    async fn inject_context(
        &self,
        session_id: &SessionId,
        announcement: &str,
    ) -> Result<(), AgentError>;
}

/// Session lifecycle events, fed into the presence tracker by the webhook
/// surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started { session_id: SessionId },
    Ended { session_id: SessionId },
    Failed { session_id: SessionId, reason: String },
}

/// A conversation turn observed at the edge (inbound SMS, call
/// transcription), destined for the ledger.
#[derive(Debug, Clone)]
pub struct TurnEvent {
    pub session_id: SessionId,
    pub participant: Participant,
    pub medium: Medium,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}
