//! Inbound webhook surface for the telephony provider.
//!
//! Twilio posts call status transitions and inbound messages here as form
//! payloads. Handlers do no state mutation themselves; they translate the
//! payload into an event and hand it to the session pump.

use axum::Router;
use axum::extract::{Form, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::gateway::{SessionEvent, TurnEvent};
use crate::model::{Medium, Participant, SessionId};

#[derive(Clone)]
pub struct WebhookState {
    pub lifecycle_tx: mpsc::Sender<SessionEvent>,
    pub turn_tx: mpsc::Sender<TurnEvent>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook/status", post(call_status))
        .route("/webhook/sms", post(inbound_sms))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CallStatusPayload {
    #[serde(rename = "CallSid")]
    call_sid: String,
    #[serde(rename = "CallStatus")]
    call_status: String,
}

#[derive(Debug, Deserialize)]
struct InboundSmsPayload {
    #[serde(rename = "MessageSid")]
    message_sid: String,
    #[serde(rename = "From")]
    from: String,
    #[serde(rename = "Body")]
    body: String,
}

/// Map a Twilio call status transition to a session lifecycle event.
/// Pre-connection statuses carry no presence information and map to none.
fn status_event(call_sid: &str, call_status: &str) -> Option<SessionEvent> {
    let session_id = SessionId::new(call_sid);
    match call_status {
        "in-progress" | "answered" => Some(SessionEvent::Started { session_id }),
        "completed" => Some(SessionEvent::Ended { session_id }),
        "busy" | "no-answer" | "failed" | "canceled" => Some(SessionEvent::Failed {
            session_id,
            reason: call_status.to_string(),
        }),
        _ => None,
    }
}

async fn call_status(
    State(state): State<WebhookState>,
    Form(payload): Form<CallStatusPayload>,
) -> StatusCode {
    debug!(sid = %payload.call_sid, status = %payload.call_status, "Call status webhook");
    if let Some(event) = status_event(&payload.call_sid, &payload.call_status)
        && state.lifecycle_tx.send(event).await.is_err()
    {
        warn!("Session pump is gone, dropping lifecycle event");
    }
    StatusCode::OK
}

async fn inbound_sms(
    State(state): State<WebhookState>,
    Form(payload): Form<InboundSmsPayload>,
) -> Response {
    debug!(sid = %payload.message_sid, from = %payload.from, "Inbound SMS webhook");
    let event = TurnEvent {
        session_id: SessionId::new(payload.message_sid),
        participant: Participant::User,
        medium: Medium::Sms,
        timestamp: Utc::now(),
        text: payload.body,
    };
    if state.turn_tx.send(event).await.is_err() {
        warn!("Session pump is gone, dropping inbound message");
    }

    // Twilio expects TwiML back; an empty response sends no reply message.
    (
        [(header::CONTENT_TYPE, "text/xml")],
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response></Response>",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_statuses_map_to_lifecycle_events() {
        assert_eq!(
            status_event("CA1", "in-progress"),
            Some(SessionEvent::Started {
                session_id: SessionId::new("CA1")
            })
        );
        assert_eq!(
            status_event("CA1", "completed"),
            Some(SessionEvent::Ended {
                session_id: SessionId::new("CA1")
            })
        );
    }

    #[test]
    fn failure_statuses_map_to_failed() {
        for status in ["busy", "no-answer", "failed", "canceled"] {
            match status_event("CA2", status) {
                Some(SessionEvent::Failed { session_id, reason }) => {
                    assert_eq!(session_id, SessionId::new("CA2"));
                    assert_eq!(reason, status);
                }
                other => panic!("expected Failed for {status}, got {other:?}"),
            }
        }
    }

    #[test]
    fn pre_connection_statuses_are_ignored() {
        for status in ["queued", "initiated", "ringing"] {
            assert_eq!(status_event("CA3", status), None);
        }
    }
}
