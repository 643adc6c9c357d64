//! Persistence layer — libSQL-backed storage for reminders, contacts, bio
//! facts, and the conversation ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::Store;
