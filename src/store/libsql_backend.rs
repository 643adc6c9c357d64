//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are written
//! as fixed-width RFC 3339 UTC strings so that string comparison in SQL
//! matches chronological order.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    self, BioFact, Contact, ContactDraft, ConversationTurn, Medium, Participant, Recurrence,
    Reminder, ReminderDraft, ReminderPatch, ReminderStatus, SessionId, TurnFilter,
};
use crate::store::Store;
use crate::store::migrations;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp write format: microsecond precision, "+00:00"
/// offset. Fixed width, so lexicographic order equals chronological order.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
/// A column that parses as neither is corrupt and surfaces as an error.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(StoreError::Query(format!("bad stored timestamp {s:?}")))
}

fn parse_optional_datetime(s: &Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.as_deref().map(parse_datetime).transpose()
}

/// Convert `Option<&str>` to a libsql Value (NULL when absent).
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Query(format!("bad uuid {s}: {e}")))
}

fn query_err(op: &str) -> impl FnOnce(libsql::Error) -> StoreError + '_ {
    move |e| StoreError::Query(format!("{op}: {e}"))
}

// ── Row mappers ─────────────────────────────────────────────────────

const REMINDER_COLUMNS: &str = "id, title, scheduled_at, recurrence, days_of_week, active, \
     status, last_triggered_at, consecutive_failures, created_at, updated_at";

fn row_to_reminder(row: &libsql::Row) -> Result<Reminder, StoreError> {
    let id_str: String = row.get(0).map_err(query_err("reminder.id"))?;
    let title: String = row.get(1).map_err(query_err("reminder.title"))?;
    let scheduled_str: String = row.get(2).map_err(query_err("reminder.scheduled_at"))?;
    let recurrence_tag: String = row.get(3).map_err(query_err("reminder.recurrence"))?;
    let days_str: Option<String> = row.get(4).ok();
    let active: i64 = row.get(5).map_err(query_err("reminder.active"))?;
    let status_str: String = row.get(6).map_err(query_err("reminder.status"))?;
    let last_triggered_str: Option<String> = row.get(7).ok();
    let failures: i64 = row.get(8).map_err(query_err("reminder.consecutive_failures"))?;
    let created_str: String = row.get(9).map_err(query_err("reminder.created_at"))?;
    let updated_str: String = row.get(10).map_err(query_err("reminder.updated_at"))?;

    let recurrence = Recurrence::from_db(&recurrence_tag, days_str.as_deref())
        .map_err(StoreError::Query)?;

    Ok(Reminder {
        id: parse_uuid(&id_str)?,
        title,
        scheduled_at: parse_datetime(&scheduled_str)?,
        recurrence,
        active: active != 0,
        status: ReminderStatus::from_str(&status_str).unwrap_or(ReminderStatus::Scheduled),
        last_triggered_at: parse_optional_datetime(&last_triggered_str)?,
        consecutive_failures: failures.max(0) as u32,
        created_at: parse_datetime(&created_str)?,
        updated_at: parse_datetime(&updated_str)?,
    })
}

const CONTACT_COLUMNS: &str = "id, name, relation, phone, birthday, notes, created_at, updated_at";

fn row_to_contact(row: &libsql::Row) -> Result<Contact, StoreError> {
    let id_str: String = row.get(0).map_err(query_err("contact.id"))?;
    let name: String = row.get(1).map_err(query_err("contact.name"))?;
    let relation: Option<String> = row.get(2).ok();
    let phone: Option<String> = row.get(3).ok();
    let birthday_str: Option<String> = row.get(4).ok();
    let notes: Option<String> = row.get(5).ok();
    let created_str: String = row.get(6).map_err(query_err("contact.created_at"))?;
    let updated_str: String = row.get(7).map_err(query_err("contact.updated_at"))?;

    Ok(Contact {
        id: parse_uuid(&id_str)?,
        name,
        relation,
        phone,
        birthday: birthday_str.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
        notes,
        created_at: parse_datetime(&created_str)?,
        updated_at: parse_datetime(&updated_str)?,
    })
}

const TURN_COLUMNS: &str = "id, participant, medium, timestamp, session_id, text, dedup_token";

fn row_to_turn(row: &libsql::Row) -> Result<ConversationTurn, StoreError> {
    let id_str: String = row.get(0).map_err(query_err("turn.id"))?;
    let participant_str: String = row.get(1).map_err(query_err("turn.participant"))?;
    let medium_str: String = row.get(2).map_err(query_err("turn.medium"))?;
    let timestamp_str: String = row.get(3).map_err(query_err("turn.timestamp"))?;
    let session_str: String = row.get(4).map_err(query_err("turn.session_id"))?;
    let text: String = row.get(5).map_err(query_err("turn.text"))?;
    let dedup_token: Option<String> = row.get(6).ok();

    Ok(ConversationTurn {
        id: parse_uuid(&id_str)?,
        participant: Participant::from_str(&participant_str).map_err(StoreError::Query)?,
        medium: Medium::from_str(&medium_str).map_err(StoreError::Query)?,
        timestamp: parse_datetime(&timestamp_str)?,
        session_id: SessionId::new(session_str),
        text,
        dedup_token,
    })
}

async fn collect_reminders(mut rows: libsql::Rows) -> Result<Vec<Reminder>, StoreError> {
    // A truncated result is worse than an error: callers must see the full
    // set or none of it.
    let mut out = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => out.push(row_to_reminder(&row)?),
            Ok(None) => break,
            Err(e) => return Err(StoreError::Query(format!("reminder rows: {e}"))),
        }
    }
    Ok(out)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    // ── Reminders ───────────────────────────────────────────────────

    async fn create_reminder(
        &self,
        draft: &ReminderDraft,
        now: DateTime<Utc>,
    ) -> Result<Reminder, StoreError> {
        let scheduled_at = draft.validate(now)?;
        let id = Uuid::new_v4();
        let created = Utc::now();

        self.conn()
            .execute(
                "INSERT INTO reminders (id, title, scheduled_at, recurrence, days_of_week,
                    active, status, last_triggered_at, consecutive_failures, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, 'scheduled', NULL, 0, ?6, ?6)",
                params![
                    id.to_string(),
                    draft.title.clone(),
                    fmt_ts(scheduled_at),
                    draft.recurrence.type_tag(),
                    opt_text_owned(draft.recurrence.days().map(|d| d.to_string())),
                    fmt_ts(created),
                ],
            )
            .await
            .map_err(query_err("create_reminder"))?;

        debug!(id = %id, title = %draft.title, "Reminder created");
        Ok(Reminder {
            id,
            title: draft.title.clone(),
            scheduled_at,
            recurrence: draft.recurrence.clone(),
            active: true,
            status: ReminderStatus::Scheduled,
            last_triggered_at: None,
            consecutive_failures: 0,
            created_at: created,
            updated_at: created,
        })
    }

    async fn get_reminder(&self, id: Uuid) -> Result<Option<Reminder>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {REMINDER_COLUMNS} FROM reminders WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_reminder"))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_reminder(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_reminder: {e}"))),
        }
    }

    async fn list_reminders(&self, active_only: bool) -> Result<Vec<Reminder>, StoreError> {
        let sql = if active_only {
            format!(
                "SELECT {REMINDER_COLUMNS} FROM reminders WHERE active = 1 \
                 ORDER BY scheduled_at ASC, id ASC"
            )
        } else {
            format!("SELECT {REMINDER_COLUMNS} FROM reminders ORDER BY scheduled_at ASC, id ASC")
        };
        let rows = self
            .conn()
            .query(&sql, ())
            .await
            .map_err(query_err("list_reminders"))?;
        collect_reminders(rows).await
    }

    async fn update_reminder(
        &self,
        id: Uuid,
        patch: &ReminderPatch,
        now: DateTime<Utc>,
    ) -> Result<Reminder, StoreError> {
        let mut reminder = self.get_reminder(id).await?.ok_or(StoreError::NotFound {
            entity: "reminder",
            id: id.to_string(),
        })?;

        // Only changed fields are re-validated.
        if let Some(ref title) = patch.title {
            if title.trim().is_empty() {
                return Err(StoreError::validation("reminder title must not be empty"));
            }
            reminder.title = title.clone();
        }
        if let Some(ref scheduled) = patch.scheduled_at {
            let at = model::parse_timestamp(scheduled).ok_or_else(|| {
                StoreError::validation(format!("unparseable datetime: {scheduled}"))
            })?;
            if at < now {
                return Err(StoreError::validation(format!(
                    "scheduled_at {scheduled} is in the past"
                )));
            }
            reminder.scheduled_at = at;
        }
        if let Some(ref recurrence) = patch.recurrence {
            model::validate_recurrence(recurrence)?;
            reminder.recurrence = recurrence.clone();
        }
        if let Some(active) = patch.active {
            reminder.active = active;
            // Reactivation puts a flagged/consumed reminder back on schedule.
            if active {
                reminder.status = ReminderStatus::Scheduled;
            }
        }
        reminder.updated_at = Utc::now();

        self.conn()
            .execute(
                "UPDATE reminders SET title = ?2, scheduled_at = ?3, recurrence = ?4,
                    days_of_week = ?5, active = ?6, status = ?7, updated_at = ?8
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    reminder.title.clone(),
                    fmt_ts(reminder.scheduled_at),
                    reminder.recurrence.type_tag(),
                    opt_text_owned(reminder.recurrence.days().map(|d| d.to_string())),
                    reminder.active as i64,
                    reminder.status.as_str(),
                    fmt_ts(reminder.updated_at),
                ],
            )
            .await
            .map_err(query_err("update_reminder"))?;

        debug!(id = %id, "Reminder updated");
        Ok(reminder)
    }

    async fn delete_reminder(&self, id: Uuid) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE reminders SET active = 0, updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), fmt_ts(Utc::now())],
            )
            .await
            .map_err(query_err("delete_reminder"))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "reminder",
                id: id.to_string(),
            });
        }
        debug!(id = %id, "Reminder soft-deleted");
        Ok(())
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        grace_window: Duration,
    ) -> Result<Vec<Reminder>, StoreError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {REMINDER_COLUMNS} FROM reminders
                     WHERE active = 1 AND status = 'scheduled'
                       AND scheduled_at <= ?1 AND scheduled_at >= ?2
                       AND (last_triggered_at IS NULL OR last_triggered_at < scheduled_at)
                     ORDER BY scheduled_at ASC, id ASC"
                ),
                params![fmt_ts(now), fmt_ts(now - grace_window)],
            )
            .await
            .map_err(query_err("find_due"))?;
        collect_reminders(rows).await
    }

    async fn find_overdue_recurring(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Reminder>, StoreError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {REMINDER_COLUMNS} FROM reminders
                     WHERE active = 1 AND status = 'scheduled'
                       AND recurrence != 'none'
                       AND scheduled_at < ?1
                     ORDER BY scheduled_at ASC, id ASC"
                ),
                params![fmt_ts(cutoff)],
            )
            .await
            .map_err(query_err("find_overdue_recurring"))?;
        collect_reminders(rows).await
    }

    async fn reschedule(&self, id: Uuid, next: DateTime<Utc>) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE reminders SET scheduled_at = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), fmt_ts(next), fmt_ts(Utc::now())],
            )
            .await
            .map_err(query_err("reschedule"))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "reminder",
                id: id.to_string(),
            });
        }
        debug!(id = %id, next = %next, "Reminder rescheduled");
        Ok(())
    }

    async fn commit_trigger(
        &self,
        id: Uuid,
        occurrence: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        // One UPDATE per case, so mark-triggered and recurrence advance are
        // never observed half-applied.
        let affected = match next {
            Some(next) => self
                .conn()
                .execute(
                    "UPDATE reminders SET last_triggered_at = ?2, scheduled_at = ?3,
                        consecutive_failures = 0, updated_at = ?4
                     WHERE id = ?1",
                    params![
                        id.to_string(),
                        fmt_ts(occurrence),
                        fmt_ts(next),
                        fmt_ts(Utc::now()),
                    ],
                )
                .await
                .map_err(query_err("commit_trigger"))?,
            None => self
                .conn()
                .execute(
                    "UPDATE reminders SET last_triggered_at = ?2, active = 0, status = 'done',
                        consecutive_failures = 0, updated_at = ?3
                     WHERE id = ?1",
                    params![id.to_string(), fmt_ts(occurrence), fmt_ts(Utc::now())],
                )
                .await
                .map_err(query_err("commit_trigger"))?,
        };

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "reminder",
                id: id.to_string(),
            });
        }
        debug!(id = %id, occurrence = %occurrence, next = ?next, "Trigger committed");
        Ok(())
    }

    async fn record_failure(&self, id: Uuid) -> Result<u32, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "UPDATE reminders SET consecutive_failures = consecutive_failures + 1,
                    updated_at = ?2
                 WHERE id = ?1
                 RETURNING consecutive_failures",
                params![id.to_string(), fmt_ts(Utc::now())],
            )
            .await
            .map_err(query_err("record_failure"))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).map_err(query_err("record_failure"))?;
                Ok(count.max(0) as u32)
            }
            _ => Err(StoreError::NotFound {
                entity: "reminder",
                id: id.to_string(),
            }),
        }
    }

    async fn mark_failed(&self, id: Uuid) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE reminders SET active = 0, status = 'failed', updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), fmt_ts(Utc::now())],
            )
            .await
            .map_err(query_err("mark_failed"))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "reminder",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Contacts ────────────────────────────────────────────────────

    async fn create_contact(&self, draft: &ContactDraft) -> Result<Contact, StoreError> {
        draft.validate()?;
        let id = Uuid::new_v4();
        let now = Utc::now();

        self.conn()
            .execute(
                "INSERT INTO contacts (id, name, relation, phone, birthday, notes,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    id.to_string(),
                    draft.name.clone(),
                    opt_text(draft.relation.as_deref()),
                    opt_text(draft.phone.as_deref()),
                    opt_text_owned(draft.birthday.map(|d| d.to_string())),
                    opt_text(draft.notes.as_deref()),
                    fmt_ts(now),
                ],
            )
            .await
            .map_err(query_err("create_contact"))?;

        Ok(Contact {
            id,
            name: draft.name.clone(),
            relation: draft.relation.clone(),
            phone: draft.phone.clone(),
            birthday: draft.birthday,
            notes: draft.notes.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY name ASC"),
                (),
            )
            .await
            .map_err(query_err("list_contacts"))?;

        let mut out = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => out.push(row_to_contact(&row)?),
                Ok(None) => break,
                Err(e) => return Err(StoreError::Query(format!("contact rows: {e}"))),
            }
        }
        Ok(out)
    }

    async fn find_contact(&self, name: &str) -> Result<Option<Contact>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONTACT_COLUMNS} FROM contacts
                     WHERE LOWER(name) LIKE LOWER(?1)
                     ORDER BY name ASC LIMIT 1"
                ),
                params![format!("%{name}%")],
            )
            .await
            .map_err(query_err("find_contact"))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_contact(&row)?)),
            _ => Ok(None),
        }
    }

    async fn update_contact(&self, id: Uuid, draft: &ContactDraft) -> Result<Contact, StoreError> {
        draft.validate()?;
        let now = Utc::now();
        let affected = self
            .conn()
            .execute(
                "UPDATE contacts SET name = ?2, relation = ?3, phone = ?4, birthday = ?5,
                    notes = ?6, updated_at = ?7
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    draft.name.clone(),
                    opt_text(draft.relation.as_deref()),
                    opt_text(draft.phone.as_deref()),
                    opt_text_owned(draft.birthday.map(|d| d.to_string())),
                    opt_text(draft.notes.as_deref()),
                    fmt_ts(now),
                ],
            )
            .await
            .map_err(query_err("update_contact"))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "contact",
                id: id.to_string(),
            });
        }
        self.find_contact_by_id(id).await
    }

    async fn delete_contact(&self, id: Uuid) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM contacts WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err("delete_contact"))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "contact",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Bio facts ───────────────────────────────────────────────────

    async fn set_bio_fact(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO bio_facts (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, fmt_ts(Utc::now())],
            )
            .await
            .map_err(query_err("set_bio_fact"))?;
        Ok(())
    }

    async fn get_bio_fact(&self, key: &str) -> Result<Option<BioFact>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT key, value, updated_at FROM bio_facts WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(query_err("get_bio_fact"))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let key: String = row.get(0).map_err(query_err("bio.key"))?;
                let value: String = row.get(1).map_err(query_err("bio.value"))?;
                let updated_str: String = row.get(2).map_err(query_err("bio.updated_at"))?;
                Ok(Some(BioFact {
                    key,
                    value,
                    updated_at: parse_datetime(&updated_str)?,
                }))
            }
            _ => Ok(None),
        }
    }

    async fn list_bio_facts(&self) -> Result<Vec<BioFact>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT key, value, updated_at FROM bio_facts ORDER BY key ASC",
                (),
            )
            .await
            .map_err(query_err("list_bio_facts"))?;

        let mut out = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let key: String = row.get(0).map_err(query_err("bio.key"))?;
                    let value: String = row.get(1).map_err(query_err("bio.value"))?;
                    let updated_str: String = row.get(2).map_err(query_err("bio.updated_at"))?;
                    out.push(BioFact {
                        key,
                        value,
                        updated_at: parse_datetime(&updated_str)?,
                    });
                }
                Ok(None) => break,
                Err(e) => return Err(StoreError::Query(format!("bio rows: {e}"))),
            }
        }
        Ok(out)
    }

    // ── Conversation ledger ─────────────────────────────────────────

    async fn append_turn(&self, turn: &ConversationTurn) -> Result<bool, StoreError> {
        // OR IGNORE absorbs duplicates on either unique key: the natural
        // (session, timestamp, participant, medium) key or the explicit
        // dedup token.
        let affected = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO turns (id, participant, medium, timestamp,
                    session_id, text, dedup_token, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    turn.id.to_string(),
                    turn.participant.as_str(),
                    turn.medium.as_str(),
                    fmt_ts(turn.timestamp),
                    turn.session_id.as_str(),
                    turn.text.clone(),
                    opt_text(turn.dedup_token.as_deref()),
                    fmt_ts(Utc::now()),
                ],
            )
            .await
            .map_err(query_err("append_turn"))?;

        if affected == 0 {
            debug!(session = %turn.session_id, "Duplicate turn absorbed");
        }
        Ok(affected > 0)
    }

    async fn recent_turns(
        &self,
        filter: &TurnFilter,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, StoreError> {
        // Most recent `limit` rows, then reversed so callers get ascending
        // timestamp order across all media.
        let order = "ORDER BY timestamp DESC, seq DESC LIMIT";
        let limit = limit as i64;

        let rows = match (&filter.session_id, &filter.medium) {
            (Some(session), Some(medium)) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {TURN_COLUMNS} FROM turns
                             WHERE session_id = ?1 AND medium = ?2 {order} ?3"
                        ),
                        params![session.as_str(), medium.as_str(), limit],
                    )
                    .await
            }
            (Some(session), None) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {TURN_COLUMNS} FROM turns WHERE session_id = ?1 {order} ?2"
                        ),
                        params![session.as_str(), limit],
                    )
                    .await
            }
            (None, Some(medium)) => {
                self.conn()
                    .query(
                        &format!("SELECT {TURN_COLUMNS} FROM turns WHERE medium = ?1 {order} ?2"),
                        params![medium.as_str(), limit],
                    )
                    .await
            }
            (None, None) => {
                self.conn()
                    .query(&format!("SELECT {TURN_COLUMNS} FROM turns {order} ?1"), params![limit])
                    .await
            }
        }
        .map_err(query_err("recent_turns"))?;

        let mut rows = rows;
        let mut out = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => out.push(row_to_turn(&row)?),
                Ok(None) => break,
                Err(e) => return Err(StoreError::Query(format!("turn rows: {e}"))),
            }
        }
        out.reverse();
        Ok(out)
    }
}

impl LibSqlStore {
    async fn find_contact_by_id(&self, id: Uuid) -> Result<Contact, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("find_contact_by_id"))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_contact(&row),
            _ => Err(StoreError::NotFound {
                entity: "contact",
                id: id.to_string(),
            }),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DaySet;
    use chrono::{TimeZone, Weekday};

    async fn test_store() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()
    }

    fn draft(title: &str, scheduled_at: &str, recurrence: Recurrence) -> ReminderDraft {
        ReminderDraft {
            title: title.into(),
            scheduled_at: scheduled_at.into(),
            recurrence,
        }
    }

    #[tokio::test]
    async fn create_and_get_reminder() {
        let store = test_store().await;
        let created = store
            .create_reminder(
                &draft("Take pill", "2025-06-02T15:00:00Z", Recurrence::Daily),
                t0(),
            )
            .await
            .unwrap();

        let loaded = store.get_reminder(created.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Take pill");
        assert_eq!(loaded.recurrence, Recurrence::Daily);
        assert_eq!(
            loaded.scheduled_at,
            Utc.with_ymd_and_hms(2025, 6, 2, 15, 0, 0).unwrap()
        );
        assert!(loaded.active);
        assert_eq!(loaded.status, ReminderStatus::Scheduled);
        assert!(loaded.last_triggered_at.is_none());
    }

    #[tokio::test]
    async fn create_rejects_past_schedule_without_partial_write() {
        let store = test_store().await;
        let result = store
            .create_reminder(
                &draft("Too late", "2025-06-02T11:00:00Z", Recurrence::None),
                t0(),
            )
            .await;
        assert!(matches!(result, Err(StoreError::Validation { .. })));
        assert!(store.list_reminders(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn weekday_set_survives_storage() {
        let store = test_store().await;
        let rec = Recurrence::Weekly {
            days: DaySet::from_days(&[Weekday::Mon, Weekday::Wed]),
        };
        let created = store
            .create_reminder(&draft("Water plants", "2025-06-04T09:00:00Z", rec.clone()), t0())
            .await
            .unwrap();

        let loaded = store.get_reminder(created.id).await.unwrap().unwrap();
        assert_eq!(loaded.recurrence, rec);
    }

    #[tokio::test]
    async fn list_orders_by_scheduled_at() {
        let store = test_store().await;
        store
            .create_reminder(&draft("Later", "2025-06-02T18:00:00Z", Recurrence::None), t0())
            .await
            .unwrap();
        store
            .create_reminder(&draft("Sooner", "2025-06-02T13:00:00Z", Recurrence::None), t0())
            .await
            .unwrap();

        let all = store.list_reminders(true).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].title, "Sooner");
        assert_eq!(all[1].title, "Later");
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let store = test_store().await;
        let result = store
            .update_reminder(Uuid::new_v4(), &ReminderPatch::default(), t0())
            .await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn update_revalidates_changed_fields() {
        let store = test_store().await;
        let created = store
            .create_reminder(&draft("Call Anna", "2025-06-02T15:00:00Z", Recurrence::None), t0())
            .await
            .unwrap();

        // Bad datetime rejected, row untouched
        let patch = ReminderPatch {
            scheduled_at: Some("whenever".into()),
            ..Default::default()
        };
        assert!(matches!(
            store.update_reminder(created.id, &patch, t0()).await,
            Err(StoreError::Validation { .. })
        ));
        let loaded = store.get_reminder(created.id).await.unwrap().unwrap();
        assert_eq!(loaded.scheduled_at, created.scheduled_at);

        // Valid reschedule applies
        let patch = ReminderPatch {
            scheduled_at: Some("2025-06-03T15:00:00Z".into()),
            title: Some("Call Anna back".into()),
            ..Default::default()
        };
        let updated = store.update_reminder(created.id, &patch, t0()).await.unwrap();
        assert_eq!(updated.title, "Call Anna back");
        assert_eq!(
            updated.scheduled_at,
            Utc.with_ymd_and_hms(2025, 6, 3, 15, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn delete_is_soft() {
        let store = test_store().await;
        let created = store
            .create_reminder(&draft("Old", "2025-06-02T15:00:00Z", Recurrence::None), t0())
            .await
            .unwrap();

        store.delete_reminder(created.id).await.unwrap();

        let loaded = store.get_reminder(created.id).await.unwrap().unwrap();
        assert!(!loaded.active);
        assert!(store.list_reminders(true).await.unwrap().is_empty());
        assert_eq!(store.list_reminders(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_unknown_id_is_not_found() {
        let store = test_store().await;
        assert!(matches!(
            store.delete_reminder(Uuid::new_v4()).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn find_due_filters_and_orders() {
        let store = test_store().await;
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 15, 1, 0).unwrap();

        store
            .create_reminder(&draft("Due B", "2025-06-02T15:00:05Z", Recurrence::None), t0())
            .await
            .unwrap();
        store
            .create_reminder(&draft("Due A", "2025-06-02T15:00:00Z", Recurrence::None), t0())
            .await
            .unwrap();
        store
            .create_reminder(&draft("Not yet", "2025-06-02T16:00:00Z", Recurrence::None), t0())
            .await
            .unwrap();
        let deleted = store
            .create_reminder(&draft("Inactive", "2025-06-02T15:00:00Z", Recurrence::None), t0())
            .await
            .unwrap();
        store.delete_reminder(deleted.id).await.unwrap();

        let due = store.find_due(now, Duration::hours(1)).await.unwrap();
        let titles: Vec<&str> = due.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["Due A", "Due B"]);
    }

    #[tokio::test]
    async fn find_due_is_idempotent() {
        let store = test_store().await;
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 15, 1, 0).unwrap();
        store
            .create_reminder(&draft("Take pill", "2025-06-02T15:00:00Z", Recurrence::Daily), t0())
            .await
            .unwrap();

        let first = store.find_due(now, Duration::hours(1)).await.unwrap();
        let second = store.find_due(now, Duration::hours(1)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(
            first.iter().map(|r| r.id).collect::<Vec<_>>(),
            second.iter().map(|r| r.id).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn find_due_respects_grace_window() {
        let store = test_store().await;
        store
            .create_reminder(&draft("Missed", "2025-06-02T13:00:00Z", Recurrence::None), t0())
            .await
            .unwrap();

        // Two hours late with a one-hour grace window: no longer due.
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 15, 0, 0).unwrap();
        assert!(store.find_due(now, Duration::hours(1)).await.unwrap().is_empty());

        // Wider window picks it up.
        let due = store.find_due(now, Duration::hours(3)).await.unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn find_due_excludes_triggered_occurrence() {
        let store = test_store().await;
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 15, 1, 0).unwrap();
        let occurrence = Utc.with_ymd_and_hms(2025, 6, 2, 15, 0, 0).unwrap();
        let created = store
            .create_reminder(&draft("Take pill", "2025-06-02T15:00:00Z", Recurrence::Daily), t0())
            .await
            .unwrap();

        assert_eq!(store.find_due(now, Duration::hours(1)).await.unwrap().len(), 1);

        // Commit advances to tomorrow; today's occurrence is gone, and
        // tomorrow's is not yet due.
        store
            .commit_trigger(created.id, occurrence, Some(occurrence + Duration::hours(24)))
            .await
            .unwrap();
        assert!(store.find_due(now, Duration::hours(1)).await.unwrap().is_empty());

        // Next day it comes back.
        let tomorrow = now + Duration::hours(24);
        assert_eq!(
            store.find_due(tomorrow, Duration::hours(1)).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn overdue_recurring_lookup_and_reschedule() {
        let store = test_store().await;
        let stale = store
            .create_reminder(&draft("Walk", "2025-06-02T13:00:00Z", Recurrence::Daily), t0())
            .await
            .unwrap();
        // One-shot at the same time: lapsed, but not a catch-up candidate.
        store
            .create_reminder(&draft("Once", "2025-06-02T13:00:00Z", Recurrence::None), t0())
            .await
            .unwrap();
        // Recurring but still inside the window.
        store
            .create_reminder(&draft("Fresh", "2025-06-02T14:30:00Z", Recurrence::Daily), t0())
            .await
            .unwrap();

        // Cutoff at 14:00 (now 15:00, one-hour window).
        let cutoff = Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap();
        let overdue = store.find_overdue_recurring(cutoff).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, stale.id);

        let next = Utc.with_ymd_and_hms(2025, 6, 3, 13, 0, 0).unwrap();
        store.reschedule(stale.id, next).await.unwrap();

        let loaded = store.get_reminder(stale.id).await.unwrap().unwrap();
        assert_eq!(loaded.scheduled_at, next);
        assert!(loaded.last_triggered_at.is_none());
        assert!(store.find_overdue_recurring(cutoff).await.unwrap().is_empty());

        assert!(matches!(
            store.reschedule(Uuid::new_v4(), next).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn commit_trigger_one_shot_consumes() {
        let store = test_store().await;
        let occurrence = Utc.with_ymd_and_hms(2025, 6, 2, 15, 0, 0).unwrap();
        let created = store
            .create_reminder(&draft("One-off", "2025-06-02T15:00:00Z", Recurrence::None), t0())
            .await
            .unwrap();

        store.commit_trigger(created.id, occurrence, None).await.unwrap();

        let loaded = store.get_reminder(created.id).await.unwrap().unwrap();
        assert!(!loaded.active);
        assert_eq!(loaded.status, ReminderStatus::Done);
        assert_eq!(loaded.last_triggered_at, Some(occurrence));
    }

    #[tokio::test]
    async fn failure_bookkeeping() {
        let store = test_store().await;
        let created = store
            .create_reminder(&draft("Flaky", "2025-06-02T15:00:00Z", Recurrence::None), t0())
            .await
            .unwrap();

        assert_eq!(store.record_failure(created.id).await.unwrap(), 1);
        assert_eq!(store.record_failure(created.id).await.unwrap(), 2);

        // Still active and retryable
        let loaded = store.get_reminder(created.id).await.unwrap().unwrap();
        assert!(loaded.active);
        assert_eq!(loaded.consecutive_failures, 2);

        store.mark_failed(created.id).await.unwrap();
        let loaded = store.get_reminder(created.id).await.unwrap().unwrap();
        assert!(!loaded.active);
        assert_eq!(loaded.status, ReminderStatus::Failed);
    }

    #[tokio::test]
    async fn successful_trigger_resets_failure_count() {
        let store = test_store().await;
        let occurrence = Utc.with_ymd_and_hms(2025, 6, 2, 15, 0, 0).unwrap();
        let created = store
            .create_reminder(&draft("Flaky", "2025-06-02T15:00:00Z", Recurrence::Daily), t0())
            .await
            .unwrap();

        store.record_failure(created.id).await.unwrap();
        store
            .commit_trigger(created.id, occurrence, Some(occurrence + Duration::hours(24)))
            .await
            .unwrap();

        let loaded = store.get_reminder(created.id).await.unwrap().unwrap();
        assert_eq!(loaded.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn contacts_crud_and_search() {
        let store = test_store().await;
        let anna = store
            .create_contact(&ContactDraft {
                name: "Anna Kowalski".into(),
                relation: Some("Daughter".into()),
                phone: Some("+14155550100".into()),
                birthday: NaiveDate::from_ymd_opt(1980, 3, 14),
                notes: None,
            })
            .await
            .unwrap();
        store
            .create_contact(&ContactDraft {
                name: "Dr. Berg".into(),
                relation: Some("Doctor".into()),
                phone: Some("+14155550101".into()),
                birthday: None,
                notes: Some("Cardiologist".into()),
            })
            .await
            .unwrap();

        let all = store.list_contacts().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "Anna Kowalski");

        let found = store.find_contact("anna").await.unwrap().unwrap();
        assert_eq!(found.id, anna.id);
        assert_eq!(found.birthday, NaiveDate::from_ymd_opt(1980, 3, 14));
        assert!(store.find_contact("nobody").await.unwrap().is_none());

        let updated = store
            .update_contact(
                anna.id,
                &ContactDraft {
                    name: "Anna Kowalski".into(),
                    relation: Some("Daughter".into()),
                    phone: Some("+14155550199".into()),
                    birthday: NaiveDate::from_ymd_opt(1980, 3, 14),
                    notes: Some("Moved to Portland".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.phone.as_deref(), Some("+14155550199"));

        store.delete_contact(anna.id).await.unwrap();
        assert_eq!(store.list_contacts().await.unwrap().len(), 1);
        assert!(matches!(
            store.delete_contact(anna.id).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn contact_phone_must_be_e164() {
        let store = test_store().await;
        let result = store
            .create_contact(&ContactDraft {
                name: "Bad Phone".into(),
                relation: None,
                phone: Some("555-0100".into()),
                birthday: None,
                notes: None,
            })
            .await;
        assert!(matches!(result, Err(StoreError::Validation { .. })));
    }

    #[tokio::test]
    async fn bio_facts_upsert() {
        let store = test_store().await;
        store.set_bio_fact("hometown", "Gdansk").await.unwrap();
        store.set_bio_fact("hometown", "Warsaw").await.unwrap();
        store.set_bio_fact("favorite_tea", "Earl Grey").await.unwrap();

        let fact = store.get_bio_fact("hometown").await.unwrap().unwrap();
        assert_eq!(fact.value, "Warsaw");
        assert!(store.get_bio_fact("missing").await.unwrap().is_none());

        let all = store.list_bio_facts().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].key, "favorite_tea");
    }

    fn turn(
        participant: Participant,
        medium: Medium,
        ts: DateTime<Utc>,
        session: &str,
        text: &str,
    ) -> ConversationTurn {
        ConversationTurn::new(participant, medium, ts, SessionId::new(session), text)
    }

    #[tokio::test]
    async fn ledger_appends_and_orders_across_media() {
        let store = test_store().await;
        let base = t0();

        store
            .append_turn(&turn(Participant::User, Medium::Sms, base + Duration::seconds(30), "SM1", "hi"))
            .await
            .unwrap();
        store
            .append_turn(&turn(Participant::User, Medium::Call, base, "CA1", "hello?"))
            .await
            .unwrap();
        store
            .append_turn(&turn(
                Participant::Assistant,
                Medium::Call,
                base + Duration::seconds(10),
                "CA1",
                "Good afternoon!",
            ))
            .await
            .unwrap();

        let recent = store.recent_turns(&TurnFilter::default(), 10).await.unwrap();
        assert_eq!(recent.len(), 3);
        // Ascending by timestamp regardless of medium
        assert!(recent.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(recent[0].text, "hello?");
        assert_eq!(recent[2].medium, Medium::Sms);
    }

    #[tokio::test]
    async fn ledger_filters_by_session_and_medium() {
        let store = test_store().await;
        let base = t0();
        store
            .append_turn(&turn(Participant::User, Medium::Call, base, "CA1", "a"))
            .await
            .unwrap();
        store
            .append_turn(&turn(Participant::User, Medium::Call, base + Duration::seconds(5), "CA2", "b"))
            .await
            .unwrap();
        store
            .append_turn(&turn(Participant::User, Medium::Sms, base + Duration::seconds(9), "SM1", "c"))
            .await
            .unwrap();

        let filter = TurnFilter {
            session_id: Some(SessionId::new("CA1")),
            medium: None,
        };
        let by_session = store.recent_turns(&filter, 10).await.unwrap();
        assert_eq!(by_session.len(), 1);
        assert_eq!(by_session[0].text, "a");

        let filter = TurnFilter {
            session_id: None,
            medium: Some(Medium::Sms),
        };
        let by_medium = store.recent_turns(&filter, 10).await.unwrap();
        assert_eq!(by_medium.len(), 1);
        assert_eq!(by_medium[0].text, "c");
    }

    #[tokio::test]
    async fn ledger_limit_keeps_most_recent() {
        let store = test_store().await;
        let base = t0();
        for i in 0..5 {
            store
                .append_turn(&turn(
                    Participant::User,
                    Medium::Chat,
                    base + Duration::seconds(i),
                    "CH1",
                    &format!("msg {i}"),
                ))
                .await
                .unwrap();
        }

        let recent = store.recent_turns(&TurnFilter::default(), 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].text, "msg 3");
        assert_eq!(recent[1].text, "msg 4");
    }

    #[tokio::test]
    async fn ledger_absorbs_natural_key_duplicates() {
        let store = test_store().await;
        let ts = t0();
        let first = turn(Participant::Assistant, Medium::Call, ts, "CA1", "reminder");
        let retry = turn(Participant::Assistant, Medium::Call, ts, "CA1", "reminder");

        assert!(store.append_turn(&first).await.unwrap());
        assert!(!store.append_turn(&retry).await.unwrap());
        assert_eq!(store.recent_turns(&TurnFilter::default(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ledger_absorbs_dedup_token_duplicates() {
        let store = test_store().await;
        let base = t0();
        let first = turn(Participant::Assistant, Medium::Call, base, "CA1", "reminder")
            .with_dedup_token("reminder:abc:2025-06-02T15:00");
        // Different session and timestamp, same token: still a duplicate.
        let retry = turn(
            Participant::Assistant,
            Medium::Call,
            base + Duration::seconds(90),
            "CA2",
            "reminder",
        )
        .with_dedup_token("reminder:abc:2025-06-02T15:00");

        assert!(store.append_turn(&first).await.unwrap());
        assert!(!store.append_turn(&retry).await.unwrap());
    }

    #[tokio::test]
    async fn corrupted_timestamp_surfaces_as_error() {
        let store = test_store().await;
        store
            .create_reminder(&draft("Fine", "2025-06-02T14:00:00Z", Recurrence::None), t0())
            .await
            .unwrap();
        let broken = store
            .create_reminder(&draft("Broken", "2025-06-02T15:00:00Z", Recurrence::None), t0())
            .await
            .unwrap();

        store
            .conn()
            .execute(
                "UPDATE reminders SET scheduled_at = 'garbage' WHERE id = ?1",
                params![broken.id.to_string()],
            )
            .await
            .unwrap();

        assert!(matches!(
            store.get_reminder(broken.id).await,
            Err(StoreError::Query(_))
        ));
        // The error propagates out of list iteration instead of a silently
        // truncated (or mis-sorted) result set.
        assert!(matches!(
            store.list_reminders(true).await,
            Err(StoreError::Query(_))
        ));
    }

    #[tokio::test]
    async fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carecall.db");

        {
            let store = LibSqlStore::new_local(&path).await.unwrap();
            store
                .create_reminder(&draft("Persist me", "2025-06-02T15:00:00Z", Recurrence::Daily), t0())
                .await
                .unwrap();
        }

        let store = LibSqlStore::new_local(&path).await.unwrap();
        let all = store.list_reminders(true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "Persist me");
    }
}
