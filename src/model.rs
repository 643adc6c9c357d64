//! Core domain types: reminders, recurrence, contacts, bio facts, and
//! conversation turns.
//!
//! Recurrence is a closed tagged enum so that invalid recurrence states
//! (e.g. a weekday set on a daily reminder) are unrepresentable instead of
//! validated ad hoc.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

// ── Session identity ────────────────────────────────────────────────

/// Identifier of a real-time session (a call SID, or a message SID for
/// text media).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        SessionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Conversation turns ──────────────────────────────────────────────

/// Who spoke a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Participant {
    User,
    Assistant,
}

impl Participant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Participant::User => "user",
            Participant::Assistant => "assistant",
        }
    }
}

impl FromStr for Participant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Participant::User),
            "assistant" => Ok(Participant::Assistant),
            other => Err(format!("unknown participant: {other}")),
        }
    }
}

/// Communication medium a turn happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Medium {
    Call,
    Sms,
    Chat,
}

impl Medium {
    pub fn as_str(&self) -> &'static str {
        match self {
            Medium::Call => "call",
            Medium::Sms => "sms",
            Medium::Chat => "chat",
        }
    }
}

impl FromStr for Medium {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" => Ok(Medium::Call),
            "sms" => Ok(Medium::Sms),
            "chat" => Ok(Medium::Chat),
            other => Err(format!("unknown medium: {other}")),
        }
    }
}

/// One immutable entry in the cross-medium conversation ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub participant: Participant,
    pub medium: Medium,
    pub timestamp: DateTime<Utc>,
    pub session_id: SessionId,
    pub text: String,
    /// Explicit idempotency token. Turns written by the dispatcher carry
    /// one keyed on (reminder, occurrence) so a retried delivery attempt
    /// cannot double-log.
    pub dedup_token: Option<String>,
}

impl ConversationTurn {
    pub fn new(
        participant: Participant,
        medium: Medium,
        timestamp: DateTime<Utc>,
        session_id: SessionId,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            participant,
            medium,
            timestamp,
            session_id,
            text: text.into(),
            dedup_token: None,
        }
    }

    pub fn with_dedup_token(mut self, token: impl Into<String>) -> Self {
        self.dedup_token = Some(token.into());
        self
    }
}

/// Filter for ledger reads. Empty filter returns turns from all sessions
/// and media.
#[derive(Debug, Clone, Default)]
pub struct TurnFilter {
    pub session_id: Option<SessionId>,
    pub medium: Option<Medium>,
}

// ── Weekday sets ────────────────────────────────────────────────────

/// A set of weekdays, stored as a bitmask (bit 0 = Monday).
///
/// Serialized as the original database did: a comma-separated list of
/// lowercase day names ("monday,wednesday").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DaySet(u8);

impl DaySet {
    pub fn empty() -> Self {
        DaySet(0)
    }

    pub fn from_days(days: &[Weekday]) -> Self {
        let mut set = DaySet::empty();
        for day in days {
            set.insert(*day);
        }
        set
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_monday();
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        ALL_DAYS.iter().copied().filter(|d| self.contains(*d))
    }
}

const ALL_DAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

fn parse_day(s: &str) -> Result<Weekday, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "monday" | "mon" => Ok(Weekday::Mon),
        "tuesday" | "tue" => Ok(Weekday::Tue),
        "wednesday" | "wed" => Ok(Weekday::Wed),
        "thursday" | "thu" => Ok(Weekday::Thu),
        "friday" | "fri" => Ok(Weekday::Fri),
        "saturday" | "sat" => Ok(Weekday::Sat),
        "sunday" | "sun" => Ok(Weekday::Sun),
        other => Err(format!("unknown weekday: {other}")),
    }
}

impl fmt::Display for DaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(day_name).collect();
        f.write_str(&names.join(","))
    }
}

impl FromStr for DaySet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = DaySet::empty();
        for part in s.split(',').filter(|p| !p.trim().is_empty()) {
            set.insert(parse_day(part)?);
        }
        Ok(set)
    }
}

impl TryFrom<String> for DaySet {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DaySet> for String {
    fn from(set: DaySet) -> String {
        set.to_string()
    }
}

// ── Recurrence ──────────────────────────────────────────────────────

/// How a reminder repeats.
///
/// `Custom` patterns beyond a weekday set were underspecified upstream and
/// are treated as an explicit weekday set, same as `Weekly`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recurrence {
    None,
    Daily,
    Weekly { days: DaySet },
    Custom { days: DaySet },
}

impl Recurrence {
    /// The string tag stored in the DB recurrence column.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Recurrence::None => "none",
            Recurrence::Daily => "daily",
            Recurrence::Weekly { .. } => "weekly",
            Recurrence::Custom { .. } => "custom",
        }
    }

    /// The weekday set, if this recurrence kind carries one.
    pub fn days(&self) -> Option<DaySet> {
        match self {
            Recurrence::Weekly { days } | Recurrence::Custom { days } => Some(*days),
            _ => None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Recurrence::None)
    }

    /// Parse a recurrence from its DB representation.
    pub fn from_db(tag: &str, days: Option<&str>) -> Result<Self, String> {
        match tag {
            "none" => Ok(Recurrence::None),
            "daily" => Ok(Recurrence::Daily),
            "weekly" => Ok(Recurrence::Weekly {
                days: days.unwrap_or_default().parse()?,
            }),
            "custom" => Ok(Recurrence::Custom {
                days: days.unwrap_or_default().parse()?,
            }),
            other => Err(format!("unknown recurrence type: {other}")),
        }
    }
}

// ── Reminders ───────────────────────────────────────────────────────

/// Lifecycle status of a reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    /// Waiting for its next occurrence.
    Scheduled,
    /// One-shot reminder that has been delivered.
    Done,
    /// Flagged after a terminal delivery failure or retry exhaustion.
    Failed,
}

impl ReminderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderStatus::Scheduled => "scheduled",
            ReminderStatus::Done => "done",
            ReminderStatus::Failed => "failed",
        }
    }
}

impl FromStr for ReminderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(ReminderStatus::Scheduled),
            "done" => Ok(ReminderStatus::Done),
            "failed" => Ok(ReminderStatus::Failed),
            other => Err(format!("unknown reminder status: {other}")),
        }
    }
}

/// A persisted reminder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: Uuid,
    pub title: String,
    pub scheduled_at: DateTime<Utc>,
    pub recurrence: Recurrence,
    pub active: bool,
    pub status: ReminderStatus,
    /// Start of the most recently delivered occurrence. Never ahead of the
    /// occurrence it marks; a given occurrence is never marked twice.
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reminder {
    /// The announcement text handed to the session on delivery.
    pub fn announcement(&self) -> String {
        format!("You have a reminder: {}", self.title)
    }
}

/// Fields for creating a reminder. `scheduled_at` arrives as text from the
/// command surface and is validated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderDraft {
    pub title: String,
    pub scheduled_at: String,
    #[serde(default = "default_recurrence")]
    pub recurrence: Recurrence,
}

fn default_recurrence() -> Recurrence {
    Recurrence::None
}

impl ReminderDraft {
    /// Validate the draft against `now`. Returns the parsed schedule time.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, StoreError> {
        if self.title.trim().is_empty() {
            return Err(StoreError::validation("reminder title must not be empty"));
        }
        let scheduled_at = parse_timestamp(&self.scheduled_at).ok_or_else(|| {
            StoreError::validation(format!("unparseable datetime: {}", self.scheduled_at))
        })?;
        if scheduled_at < now {
            return Err(StoreError::validation(format!(
                "scheduled_at {} is in the past",
                self.scheduled_at
            )));
        }
        validate_recurrence(&self.recurrence)?;
        Ok(scheduled_at)
    }
}

/// Partial update for an existing reminder. `None` fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReminderPatch {
    pub title: Option<String>,
    pub scheduled_at: Option<String>,
    pub recurrence: Option<Recurrence>,
    pub active: Option<bool>,
}

pub(crate) fn validate_recurrence(recurrence: &Recurrence) -> Result<(), StoreError> {
    if let Some(days) = recurrence.days()
        && days.is_empty()
    {
        return Err(StoreError::validation(format!(
            "{} recurrence requires a non-empty weekday set",
            recurrence.type_tag()
        )));
    }
    Ok(())
}

/// Parse a user-supplied timestamp: RFC 3339, or a naive local-less
/// datetime taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(ndt.and_utc());
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(ndt.and_utc());
    }
    None
}

// ── Contacts ────────────────────────────────────────────────────────

/// A stored contact. Read-only to the scheduling core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub name: String,
    pub relation: Option<String>,
    pub phone: Option<String>,
    pub birthday: Option<NaiveDate>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating or replacing a contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactDraft {
    pub name: String,
    pub relation: Option<String>,
    pub phone: Option<String>,
    pub birthday: Option<NaiveDate>,
    pub notes: Option<String>,
}

impl ContactDraft {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.name.trim().is_empty() {
            return Err(StoreError::validation("contact name must not be empty"));
        }
        if let Some(ref phone) = self.phone {
            validate_phone(phone)?;
        }
        Ok(())
    }
}

static E164: OnceLock<Regex> = OnceLock::new();

/// Validate an E.164 phone number ("+" followed by up to 15 digits).
pub fn validate_phone(phone: &str) -> Result<(), StoreError> {
    let re = E164.get_or_init(|| Regex::new(r"^\+[1-9]\d{1,14}$").unwrap());
    if re.is_match(phone) {
        Ok(())
    } else {
        Err(StoreError::validation(format!(
            "phone number {phone} is not E.164"
        )))
    }
}

// ── Bio facts ───────────────────────────────────────────────────────

/// One key/value fact about the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BioFact {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}
