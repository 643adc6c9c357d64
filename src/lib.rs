//! CareCall: reminder scheduling and delivery for a phone-based care
//! companion.
//!
//! A periodic scheduler finds due reminders and delivers each one through
//! the dispatcher, which either injects the announcement into a live call
//! or originates a new outbound call, depending on presence. Reminders,
//! contacts, bio facts, and the cross-medium conversation ledger live in a
//! local libSQL database.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod model;
pub mod presence;
pub mod recurrence;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod webhooks;

pub use error::{Error, Result};
