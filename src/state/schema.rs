//! Store Schema
//!
//! Base tables plus additive migrations. Schema evolution only ever adds
//! columns; every ALTER is tolerated when the column already exists.

pub const SCHEMA_VERSION: i64 = 2;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL UNIQUE,
    input_message TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    total_energy_consumed REAL NOT NULL DEFAULT 0,
    sleep_cycles INTEGER NOT NULL DEFAULT 0,
    ended INTEGER NOT NULL DEFAULT 0,
    ended_reason TEXT,
    snooze_until TEXT,
    snooze_duration REAL,
    energy_budget REAL
);

CREATE TABLE IF NOT EXISTS responses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id),
    timestamp TEXT NOT NULL,
    content TEXT NOT NULL,
    energy_level REAL NOT NULL DEFAULT 0,
    model_used TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_request_id ON conversations(request_id);
CREATE INDEX IF NOT EXISTS idx_responses_conversation_id ON responses(conversation_id);
"#;

/// v2: approval workflow columns on the responses table.
pub const MIGRATION_V2: &[&str] = &[
    "ALTER TABLE responses ADD COLUMN status TEXT",
    "ALTER TABLE responses ADD COLUMN feedback TEXT",
    "ALTER TABLE responses ADD COLUMN approval_timestamp TEXT",
    "ALTER TABLE responses ADD COLUMN is_approval_request INTEGER NOT NULL DEFAULT 0",
];
