//! Persistent State
//!
//! SQLite-backed conversation store. The database is the system's only
//! durable artefact; in-flight cognition does not survive a restart.

mod database;
mod handle;
mod schema;

pub use database::{derive_budget_status, now_rfc3339, ConversationStore, StateFilter};
pub use handle::StoreHandle;
pub use schema::{CREATE_TABLES, MIGRATION_V2, SCHEMA_VERSION};
