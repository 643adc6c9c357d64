//! Unified `Store` trait — single async interface for all persistence.
//!
//! Covers the reminder store, the sibling contact/bio stores, and the
//! conversation ledger. The scheduling core only ever talks to this trait;
//! the libSQL backend is the one production implementation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    BioFact, Contact, ContactDraft, ConversationTurn, Reminder, ReminderDraft, ReminderPatch,
    TurnFilter,
};

/// Backend-agnostic persistence trait.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Reminders ───────────────────────────────────────────────────

    /// Validate and insert a new reminder. `now` anchors the
    /// not-in-the-past check.
    async fn create_reminder(
        &self,
        draft: &ReminderDraft,
        now: DateTime<Utc>,
    ) -> Result<Reminder, StoreError>;

    /// Get a reminder by id.
    async fn get_reminder(&self, id: Uuid) -> Result<Option<Reminder>, StoreError>;

    /// List reminders ascending by scheduled_at.
    async fn list_reminders(&self, active_only: bool) -> Result<Vec<Reminder>, StoreError>;

    /// Apply a partial update, re-validating any changed fields.
    /// Fails with `NotFound` if the id is absent.
    async fn update_reminder(
        &self,
        id: Uuid,
        patch: &ReminderPatch,
        now: DateTime<Utc>,
    ) -> Result<Reminder, StoreError>;

    /// Soft-delete: sets active = false.
    async fn delete_reminder(&self, id: Uuid) -> Result<(), StoreError>;

    /// Pure due-set query: active, scheduled, due at `now` within the grace
    /// window, and the current occurrence not yet triggered. Ordered by
    /// (scheduled_at, id) for deterministic processing. Calling it twice
    /// without intervening mutation returns an identical set.
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        grace_window: Duration,
    ) -> Result<Vec<Reminder>, StoreError>;

    /// Recurring reminders whose scheduled_at fell behind `cutoff` (the
    /// trailing edge of the grace window). These are no longer due and
    /// would stay dormant without a reschedule.
    async fn find_overdue_recurring(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Reminder>, StoreError>;

    /// Move a reminder's scheduled_at without touching trigger state.
    /// Fails with `NotFound` if the id is absent.
    async fn reschedule(&self, id: Uuid, next: DateTime<Utc>) -> Result<(), StoreError>;

    /// Trigger bookkeeping as one indivisible update: marks the occurrence
    /// triggered and either advances scheduled_at to `next` or, for
    /// one-shot reminders (`next` = None), deactivates with done status.
    /// Resets the consecutive-failure counter.
    async fn commit_trigger(
        &self,
        id: Uuid,
        occurrence: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Record one transient delivery failure. Returns the new consecutive
    /// failure count.
    async fn record_failure(&self, id: Uuid) -> Result<u32, StoreError>;

    /// Flag a reminder inactive with failed status. Terminal failures and
    /// retry exhaustion land here; the reminder is not retried again.
    async fn mark_failed(&self, id: Uuid) -> Result<(), StoreError>;

    // ── Contacts ────────────────────────────────────────────────────

    async fn create_contact(&self, draft: &ContactDraft) -> Result<Contact, StoreError>;

    /// List all contacts ordered by name.
    async fn list_contacts(&self) -> Result<Vec<Contact>, StoreError>;

    /// Case-insensitive partial-name lookup, first match.
    async fn find_contact(&self, name: &str) -> Result<Option<Contact>, StoreError>;

    async fn update_contact(&self, id: Uuid, draft: &ContactDraft) -> Result<Contact, StoreError>;

    async fn delete_contact(&self, id: Uuid) -> Result<(), StoreError>;

    // ── Bio facts ───────────────────────────────────────────────────

    /// Upsert a bio fact.
    async fn set_bio_fact(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn get_bio_fact(&self, key: &str) -> Result<Option<BioFact>, StoreError>;

    async fn list_bio_facts(&self) -> Result<Vec<BioFact>, StoreError>;

    // ── Conversation ledger ─────────────────────────────────────────

    /// Append a turn. Duplicates (same session/timestamp/participant/medium
    /// or same dedup token) are silently absorbed; returns whether a row
    /// was actually written.
    async fn append_turn(&self, turn: &ConversationTurn) -> Result<bool, StoreError>;

    /// Most recent turns matching `filter`, returned ascending by
    /// timestamp regardless of medium.
    async fn recent_turns(
        &self,
        filter: &TurnFilter,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, StoreError>;
}
