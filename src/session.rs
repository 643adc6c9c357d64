//! Session event pump: applies edge events to the presence tracker and
//! the conversation ledger.
//!
//! The webhook surface (and the gateway's own status handling) only emit
//! events into channels; this task is the single writer that turns them
//! into state. That keeps presence transitions and ledger appends off the
//! request path.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::gateway::{SessionEvent, TurnEvent};
use crate::model::ConversationTurn;
use crate::presence::PresenceTracker;
use crate::store::Store;

/// Spawn the pump. Runs until both channels close.
pub fn spawn_session_pump(
    store: Arc<dyn Store>,
    presence: Arc<PresenceTracker>,
    mut lifecycle: mpsc::Receiver<SessionEvent>,
    mut turns: mpsc::Receiver<TurnEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lifecycle_open = true;
        let mut turns_open = true;

        while lifecycle_open || turns_open {
            tokio::select! {
                event = lifecycle.recv(), if lifecycle_open => match event {
                    Some(event) => apply_lifecycle(&presence, event),
                    None => lifecycle_open = false,
                },
                event = turns.recv(), if turns_open => match event {
                    Some(event) => record_turn(store.as_ref(), event).await,
                    None => turns_open = false,
                },
            }
        }
        debug!("Session pump stopped");
    })
}

fn apply_lifecycle(presence: &PresenceTracker, event: SessionEvent) {
    match event {
        SessionEvent::Started { session_id } => presence.session_started(session_id),
        SessionEvent::Ended { session_id } => presence.session_ended(&session_id),
        SessionEvent::Failed { session_id, reason } => {
            warn!(session = %session_id, reason, "Session failed");
            presence.session_ended(&session_id);
        }
    }
}

async fn record_turn(store: &dyn Store, event: TurnEvent) {
    let turn = ConversationTurn::new(
        event.participant,
        event.medium,
        event.timestamp,
        event.session_id,
        event.text,
    );
    match store.append_turn(&turn).await {
        Ok(true) => {}
        Ok(false) => debug!(session = %turn.session_id, "Duplicate turn absorbed"),
        Err(e) => error!(session = %turn.session_id, error = %e, "Failed to record turn"),
    }
}
