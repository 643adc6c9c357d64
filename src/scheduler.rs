//! Scheduler loop: periodic ticks that find due reminders and hand them
//! to the dispatcher.
//!
//! Each tick is one pass: read the due set once, process it in
//! (scheduled_at, id) order, and stop originating after the first outbound
//! attempt so the user is never dialed twice in one tick. Reminders that
//! lost their slot to an earlier origination stay due and surface again on
//! the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::dispatch::{DeliveryOutcome, DeliveryPath, Dispatcher};
use crate::error::StoreError;
use crate::model::{ConversationTurn, Medium, Participant, Reminder, SessionId};
use crate::recurrence::{catch_up, next_occurrence};
use crate::store::Store;

/// Time source, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the loop wakes up.
    pub tick_interval: Duration,
    /// How far back a scheduled time may lie and still count as due.
    /// Covers downtime between ticks without resurrecting ancient rows.
    pub grace_window: chrono::Duration,
    /// Opt-in cap on consecutive transient failures before a reminder is
    /// flagged and taken out of rotation. `None` retries every tick
    /// without bound.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            grace_window: chrono::Duration::hours(1),
            max_consecutive_failures: None,
        }
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub due: usize,
    pub delivered: usize,
    pub deferred: usize,
    pub retried: usize,
    pub flagged: usize,
    pub rescheduled: usize,
    pub errors: usize,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            config,
        }
    }

    /// Run the loop until the task is aborted. The first interval tick
    /// fires immediately; consume it so startup does not double-deliver
    /// with a tick that follows right after.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.tick_interval);
            interval.tick().await;
            info!(
                interval_secs = self.config.tick_interval.as_secs(),
                "Reminder scheduler started"
            );
            loop {
                interval.tick().await;
                match self.tick().await {
                    Ok(summary) if summary.due > 0 || summary.rescheduled > 0 => {
                        info!(
                            due = summary.due,
                            delivered = summary.delivered,
                            deferred = summary.deferred,
                            retried = summary.retried,
                            flagged = summary.flagged,
                            rescheduled = summary.rescheduled,
                            "Tick complete"
                        );
                    }
                    Ok(_) => debug!("Tick complete, nothing due"),
                    Err(e) => error!(error = %e, "Tick failed"),
                }
            }
        })
    }

    /// One scheduling pass. Reads the due set once and processes it in
    /// order; at most one origination attempt per tick.
    pub async fn tick(&self) -> Result<TickSummary, StoreError> {
        let now = self.clock.now();
        let mut summary = TickSummary::default();

        // Recurring reminders that slept past the grace window would
        // otherwise never fire again. Skip the missed occurrences and
        // resume at the next future one.
        let cutoff = now - self.config.grace_window;
        for reminder in self.store.find_overdue_recurring(cutoff).await? {
            if let Some(next) = catch_up(&reminder.recurrence, reminder.scheduled_at, now) {
                warn!(
                    reminder = %reminder.id,
                    missed = %reminder.scheduled_at,
                    next = %next,
                    "Missed occurrence, rescheduling"
                );
                self.store.reschedule(reminder.id, next).await?;
                summary.rescheduled += 1;
            }
        }

        let due = self.store.find_due(now, self.config.grace_window).await?;
        summary.due = due.len();
        let mut origination_spent = false;

        for reminder in due {
            if origination_spent {
                summary.deferred += 1;
                continue;
            }

            match self.dispatcher.deliver(&reminder).await {
                DeliveryOutcome::Delivered { path, session_id } => {
                    if path == DeliveryPath::Origination {
                        origination_spent = true;
                    }
                    if let Err(e) = self.settle_delivered(&reminder, session_id, now).await {
                        error!(reminder = %reminder.id, error = %e, "Trigger bookkeeping failed");
                        summary.errors += 1;
                    } else {
                        summary.delivered += 1;
                    }
                }
                DeliveryOutcome::Deferred => {
                    summary.deferred += 1;
                }
                DeliveryOutcome::Failed { reason, transient } => {
                    // Any failed outcome means an origination was attempted.
                    origination_spent = true;
                    match self.settle_failed(&reminder, &reason, transient).await {
                        Ok(flagged) => {
                            if flagged {
                                summary.flagged += 1;
                            } else {
                                summary.retried += 1;
                            }
                        }
                        Err(e) => {
                            error!(reminder = %reminder.id, error = %e, "Failure bookkeeping failed");
                            summary.errors += 1;
                        }
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Commit trigger bookkeeping for a delivered occurrence and append the
    /// announcement to the ledger. The dedup token keeps a re-delivered
    /// occurrence from double-logging.
    async fn settle_delivered(
        &self,
        reminder: &Reminder,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let next = next_occurrence(&reminder.recurrence, reminder.scheduled_at);
        self.store
            .commit_trigger(reminder.id, reminder.scheduled_at, next)
            .await?;

        let turn = ConversationTurn::new(
            Participant::Assistant,
            Medium::Call,
            now,
            session_id,
            reminder.announcement(),
        )
        .with_dedup_token(occurrence_token(reminder));
        self.store.append_turn(&turn).await?;
        Ok(())
    }

    /// Record a failed attempt. Returns whether the reminder got flagged
    /// out of rotation.
    async fn settle_failed(
        &self,
        reminder: &Reminder,
        reason: &str,
        transient: bool,
    ) -> Result<bool, StoreError> {
        if !transient {
            warn!(reminder = %reminder.id, reason, "Terminal delivery failure, flagging");
            self.store.mark_failed(reminder.id).await?;
            return Ok(true);
        }

        let failures = self.store.record_failure(reminder.id).await?;
        if let Some(max) = self.config.max_consecutive_failures
            && failures >= max
        {
            warn!(
                reminder = %reminder.id,
                failures,
                "Retry budget exhausted, flagging"
            );
            self.store.mark_failed(reminder.id).await?;
            return Ok(true);
        }

        debug!(reminder = %reminder.id, failures, reason, "Transient failure, will retry");
        Ok(false)
    }
}

/// Idempotency token for the ledger entry of one delivered occurrence.
fn occurrence_token(reminder: &Reminder) -> String {
    format!(
        "reminder:{}:{}",
        reminder.id,
        reminder.scheduled_at.to_rfc3339()
    )
}
