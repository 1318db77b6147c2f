//! Conversation Store
//!
//! SQLite-backed durable record of user requests, agent responses,
//! approvals, budgets, and lifecycle flags. Single-writer, synchronous
//! access through rusqlite; the async world wraps this in a handle.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;

use crate::types::{
    ApprovalRecord, ApprovalStatus, BudgetStatus, ConversationRecord, ConversationSummary,
    PendingMessage, ResponseRecord, StoreStats,
};

use super::schema::{CREATE_TABLES, MIGRATION_V2, SCHEMA_VERSION};

/// Snooze minutes substituted when a caller passes a negative duration.
const SNOOZE_FALLBACK_MINUTES: f64 = 5.0;

/// Characters of response text kept in the short listing projections.
const PROJECTION_CHARS: usize = 200;

/// RFC-3339 UTC with fixed millisecond precision, so stored timestamps
/// compare correctly as text.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Derive the soft-budget state from a budget and the energy consumed so far.
pub fn derive_budget_status(budget: Option<f64>, consumed: f64) -> Option<BudgetStatus> {
    match budget {
        None => None,
        Some(b) if b == 0.0 => Some(BudgetStatus::Depleted),
        Some(b) if consumed >= b => Some(BudgetStatus::Exceeded),
        Some(_) => Some(BudgetStatus::Within),
    }
}

/// Filterable conversation states for the listing endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateFilter {
    Pending,
    Active,
    Ended,
    Snoozed,
}

impl StateFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StateFilter::Pending),
            "active" => Some(StateFilter::Active),
            "ended" => Some(StateFilter::Ended),
            "snoozed" => Some(StateFilter::Snoozed),
            _ => None,
        }
    }
}

/// The conversation store handle. Owns the only connection to the file.
pub struct ConversationStore {
    conn: Connection,
}

impl ConversationStore {
    /// Open (or create) the store at `db_path` and apply migrations.
    pub fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create db directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database: {db_path}"))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory store (tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_TABLES)
            .context("failed to create tables")?;

        let current_version: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 2 {
            for stmt in MIGRATION_V2 {
                if let Err(e) = self.conn.execute(stmt, []) {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") {
                        return Err(anyhow::anyhow!("migration v2 failed: {msg}"));
                    }
                }
            }
        }

        if current_version < SCHEMA_VERSION {
            self.conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, now_rfc3339()],
            )?;
        }

        Ok(())
    }

    // ─── Requests ────────────────────────────────────────────────

    /// Create the conversation row if absent. An existing row keeps its
    /// user text; only a row stored with empty text picks one up here.
    pub fn upsert_request(
        &self,
        request_id: &str,
        user_text: &str,
        budget: Option<f64>,
    ) -> Result<()> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO conversations (request_id, input_message, created_at, energy_budget)
             VALUES (?1, ?2, ?3, ?4)",
            params![request_id, user_text, now_rfc3339(), budget],
        )?;

        if inserted == 0 && !user_text.is_empty() {
            self.conn.execute(
                "UPDATE conversations SET input_message = ?1
                 WHERE request_id = ?2 AND input_message = ''",
                params![user_text, request_id],
            )?;
        }
        Ok(())
    }

    // ─── Responses & Approvals ───────────────────────────────────

    /// Insert a response, bump cumulative energy (never downward), and
    /// tick the bookkeeping cycle counter.
    pub fn append_response(
        &self,
        request_id: &str,
        user_text: Option<&str>,
        content: &str,
        energy_at_write: f64,
        model_tier: &str,
    ) -> Result<()> {
        let conv_id = self.conversation_rowid(request_id)?;

        if let Some(text) = user_text {
            if !text.is_empty() {
                self.conn.execute(
                    "UPDATE conversations SET input_message = ?1
                     WHERE id = ?2 AND input_message = ''",
                    params![text, conv_id],
                )?;
            }
        }

        self.conn.execute(
            "INSERT INTO responses (conversation_id, timestamp, content, energy_level, model_used, is_approval_request)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![conv_id, now_rfc3339(), content, energy_at_write, model_tier],
        )?;

        self.conn.execute(
            "UPDATE conversations
             SET total_energy_consumed = total_energy_consumed + MAX(0, ?1),
                 sleep_cycles = sleep_cycles + 1
             WHERE id = ?2",
            params![energy_at_write, conv_id],
        )?;
        Ok(())
    }

    /// Insert an approval request in state `pending`. An accompanying
    /// budget, when given, is written onto the conversation.
    pub fn append_approval(
        &self,
        request_id: &str,
        content: &str,
        energy_at_write: f64,
        model_tier: &str,
        budget: Option<f64>,
    ) -> Result<()> {
        let conv_id = self.conversation_rowid(request_id)?;

        self.conn.execute(
            "INSERT INTO responses (conversation_id, timestamp, content, energy_level, model_used, status, is_approval_request)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 1)",
            params![conv_id, now_rfc3339(), content, energy_at_write, model_tier],
        )?;

        if let Some(b) = budget {
            self.conn.execute(
                "UPDATE conversations SET energy_budget = ?1 WHERE id = ?2",
                params![b, conv_id],
            )?;
        }
        Ok(())
    }

    /// Transition one approval out of `pending`. `approval_id` of `None`
    /// targets the newest pending approval of the conversation. The only
    /// legal edges are pending -> approved and pending -> rejected;
    /// anything else leaves the row untouched. Returns whether a row moved.
    pub fn set_approval_status(
        &self,
        request_id: &str,
        approval_id: Option<i64>,
        status: ApprovalStatus,
        feedback: Option<&str>,
    ) -> Result<bool> {
        if status == ApprovalStatus::Pending {
            return Ok(false);
        }
        let conv_id = self.conversation_rowid(request_id)?;
        let status_str = match status {
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Pending => unreachable!(),
        };

        let target_id: Option<i64> = match approval_id {
            Some(id) => Some(id),
            None => self
                .conn
                .query_row(
                    "SELECT id FROM responses
                     WHERE conversation_id = ?1 AND is_approval_request = 1 AND status = 'pending'
                     ORDER BY id DESC LIMIT 1",
                    params![conv_id],
                    |row| row.get(0),
                )
                .optional()?,
        };

        let Some(id) = target_id else { return Ok(false) };

        let changed = self.conn.execute(
            "UPDATE responses
             SET status = ?1, feedback = ?2, approval_timestamp = ?3
             WHERE id = ?4 AND conversation_id = ?5
               AND is_approval_request = 1 AND status = 'pending'",
            params![status_str, feedback, now_rfc3339(), id, conv_id],
        )?;
        Ok(changed > 0)
    }

    pub fn approvals(&self, request_id: &str) -> Result<Vec<ApprovalRecord>> {
        let conv_id = self.conversation_rowid(request_id)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, content, energy_level, model_used, status, feedback, approval_timestamp
             FROM responses
             WHERE conversation_id = ?1 AND is_approval_request = 1
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![conv_id], |row| Ok(Self::deserialize_approval(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Budgets & Consumption ───────────────────────────────────

    pub fn set_budget(&self, request_id: &str, value: f64) -> Result<()> {
        self.conn.execute(
            "UPDATE conversations SET energy_budget = ?1 WHERE request_id = ?2",
            params![value, request_id],
        )?;
        Ok(())
    }

    /// Shift the budget by `delta`, clamping at zero. A conversation with
    /// no budget starts from zero.
    pub fn adjust_budget(&self, request_id: &str, delta: f64) -> Result<()> {
        self.conn.execute(
            "UPDATE conversations
             SET energy_budget = MAX(0, COALESCE(energy_budget, 0) + ?1)
             WHERE request_id = ?2",
            params![delta, request_id],
        )?;
        Ok(())
    }

    /// Charge energy to a conversation without appending a response.
    /// Negative amounts contribute nothing; cumulative energy only grows.
    pub fn add_consumption(&self, request_id: &str, amount: f64) -> Result<()> {
        self.conn.execute(
            "UPDATE conversations
             SET total_energy_consumed = total_energy_consumed + MAX(0, ?1)
             WHERE request_id = ?2",
            params![amount, request_id],
        )?;
        Ok(())
    }

    // ─── Lifecycle ───────────────────────────────────────────────

    /// Mark a conversation ended. Idempotent; an earlier reason is kept.
    pub fn end(&self, request_id: &str, reason: Option<&str>) -> Result<()> {
        self.conn.execute(
            "UPDATE conversations
             SET ended = 1, ended_reason = COALESCE(ended_reason, ?1)
             WHERE request_id = ?2",
            params![reason, request_id],
        )?;
        Ok(())
    }

    /// Hide a conversation from selection until `minutes` from now.
    /// Negative durations coerce to the fallback; zero is a no-op.
    pub fn snooze(&self, request_id: &str, minutes: f64) -> Result<()> {
        let minutes = if minutes < 0.0 { SNOOZE_FALLBACK_MINUTES } else { minutes };
        if minutes == 0.0 {
            return Ok(());
        }
        let until = Utc::now() + ChronoDuration::milliseconds((minutes * 60_000.0) as i64);
        self.conn.execute(
            "UPDATE conversations SET snooze_until = ?1, snooze_duration = ?2
             WHERE request_id = ?3",
            params![
                until.to_rfc3339_opts(SecondsFormat::Millis, true),
                minutes,
                request_id
            ],
        )?;
        Ok(())
    }

    // ─── Derived Views ───────────────────────────────────────────

    pub fn get(&self, request_id: &str) -> Result<Option<ConversationRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, request_id, input_message, created_at, total_energy_consumed,
                        sleep_cycles, ended, ended_reason, snooze_until, snooze_duration, energy_budget
                 FROM conversations WHERE request_id = ?1",
                params![request_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)? != 0,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, Option<f64>>(9)?,
                        row.get::<_, Option<f64>>(10)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            conv_id,
            request_id,
            input_message,
            created_at,
            total_energy_consumed,
            sleep_cycles,
            ended,
            ended_reason,
            snooze_until,
            snooze_duration_minutes,
            energy_budget,
        )) = row
        else {
            return Ok(None);
        };

        let mut responses = Vec::new();
        let mut approvals = Vec::new();
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, content, energy_level, model_used, status, feedback,
                    approval_timestamp, is_approval_request
             FROM responses WHERE conversation_id = ?1 ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![conv_id])?;
        while let Some(row) = rows.next()? {
            let is_approval: i64 = row.get(8)?;
            if is_approval != 0 {
                approvals.push(Self::deserialize_approval(row));
            } else {
                responses.push(ResponseRecord {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    content: row.get(2)?,
                    energy_level: row.get(3)?,
                    model_used: row.get(4)?,
                });
            }
        }

        Ok(Some(ConversationRecord {
            budget_status: derive_budget_status(energy_budget, total_energy_consumed),
            request_id,
            input_message,
            created_at,
            responses,
            approvals,
            total_energy_consumed,
            sleep_cycles,
            ended,
            ended_reason,
            snooze_until,
            snooze_duration_minutes,
            energy_budget,
        }))
    }

    /// Conversations awaiting a first answer: non-empty user text, no
    /// non-approval responses, not ended, no active snooze. Oldest first.
    pub fn pending(&self) -> Result<Vec<PendingMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.request_id, c.input_message, c.created_at, c.energy_budget
             FROM conversations c
             WHERE c.input_message != ''
               AND c.ended = 0
               AND (c.snooze_until IS NULL OR c.snooze_until <= ?1)
               AND NOT EXISTS (
                   SELECT 1 FROM responses r
                   WHERE r.conversation_id = c.id AND r.is_approval_request = 0
               )
             ORDER BY c.created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![now_rfc3339()], |row| {
                Ok(PendingMessage {
                    request_id: row.get(0)?,
                    content: row.get(1)?,
                    created_at: row.get(2)?,
                    energy_budget: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recent conversations still open (not ended, not snoozed),
    /// newest first, with a short projection of their latest response.
    pub fn recent_open(&self, limit: i64) -> Result<Vec<ConversationSummary>> {
        self.summaries(
            "WHERE c.ended = 0 AND (c.snooze_until IS NULL OR c.snooze_until <= ?1)",
            limit,
        )
    }

    /// Answered conversations eligible for review: at least one response,
    /// not ended, not snoozed. Newest first.
    pub fn recent_completed(&self, limit: i64) -> Result<Vec<ConversationSummary>> {
        self.summaries(
            "WHERE c.ended = 0 AND (c.snooze_until IS NULL OR c.snooze_until <= ?1)
             AND EXISTS (
                 SELECT 1 FROM responses r
                 WHERE r.conversation_id = c.id AND r.is_approval_request = 0
             )",
            limit,
        )
    }

    fn summaries(&self, where_clause: &str, limit: i64) -> Result<Vec<ConversationSummary>> {
        let sql = format!(
            "SELECT c.request_id, c.input_message, c.created_at, c.total_energy_consumed,
                    c.ended, c.energy_budget,
                    (SELECT COUNT(*) FROM responses r
                     WHERE r.conversation_id = c.id AND r.is_approval_request = 0),
                    (SELECT r.content FROM responses r
                     WHERE r.conversation_id = c.id AND r.is_approval_request = 0
                     ORDER BY r.id DESC LIMIT 1)
             FROM conversations c
             {where_clause}
             ORDER BY c.created_at DESC
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![now_rfc3339(), limit], |row| {
                Ok(Self::deserialize_summary(row))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Filtered listing for the HTTP surface. Budget filtering is over the
    /// derived status, so it happens after the rows load.
    pub fn list(
        &self,
        state: Option<StateFilter>,
        budget: Option<BudgetStatus>,
        limit: i64,
    ) -> Result<Vec<ConversationSummary>> {
        let now = now_rfc3339();
        let mut stmt = self.conn.prepare(
            "SELECT c.request_id, c.input_message, c.created_at, c.total_energy_consumed,
                    c.ended, c.energy_budget,
                    (SELECT COUNT(*) FROM responses r
                     WHERE r.conversation_id = c.id AND r.is_approval_request = 0),
                    (SELECT r.content FROM responses r
                     WHERE r.conversation_id = c.id AND r.is_approval_request = 0
                     ORDER BY r.id DESC LIMIT 1),
                    c.snooze_until
             FROM conversations c
             ORDER BY c.created_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let summary = Self::deserialize_summary(row);
                let snooze_until: Option<String> = row.get(8).unwrap_or(None);
                Ok((summary, snooze_until))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let selected = rows
            .into_iter()
            .filter(|(s, snooze_until)| {
                let snoozed = snooze_until.as_deref().map(|t| t > now.as_str()).unwrap_or(false);
                let state_ok = match state {
                    None => true,
                    Some(StateFilter::Pending) => {
                        !s.ended && !snoozed && s.response_count == 0 && !s.input_message.is_empty()
                    }
                    Some(StateFilter::Active) => !s.ended && !snoozed && s.response_count > 0,
                    Some(StateFilter::Ended) => s.ended,
                    Some(StateFilter::Snoozed) => snoozed,
                };
                let budget_ok = match budget {
                    None => true,
                    Some(wanted) => s.budget_status == Some(wanted),
                };
                state_ok && budget_ok
            })
            .map(|(s, _)| s)
            .take(limit.max(0) as usize)
            .collect();
        Ok(selected)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let (total_conversations, total_energy_consumed): (i64, f64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(total_energy_consumed), 0) FROM conversations",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let (total_responses, average_energy_level): (i64, f64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(AVG(energy_level), 0)
             FROM responses WHERE is_approval_request = 0",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let urgent_count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM conversations c
             WHERE (SELECT r.energy_level FROM responses r
                    WHERE r.conversation_id = c.id AND r.is_approval_request = 0
                    ORDER BY r.id DESC LIMIT 1) < 0",
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            total_conversations,
            total_responses,
            total_energy_consumed,
            average_energy_level,
            urgent_count,
        })
    }

    /// Explicitly close the underlying connection.
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| anyhow::anyhow!("failed to close database: {e}"))?;
        Ok(())
    }

    // ─── Internals ───────────────────────────────────────────────

    fn conversation_rowid(&self, request_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT id FROM conversations WHERE request_id = ?1",
                params![request_id],
                |row| row.get(0),
            )
            .optional()?
            .with_context(|| format!("no conversation with request id {request_id}"))
    }

    fn deserialize_approval(row: &rusqlite::Row<'_>) -> ApprovalRecord {
        let status_str: String = row.get(5).unwrap_or_else(|_| "pending".to_string());
        let status = match status_str.as_str() {
            "approved" => ApprovalStatus::Approved,
            "rejected" => ApprovalStatus::Rejected,
            _ => ApprovalStatus::Pending,
        };
        ApprovalRecord {
            id: row.get(0).unwrap_or_default(),
            timestamp: row.get(1).unwrap_or_default(),
            content: row.get(2).unwrap_or_default(),
            energy_level: row.get(3).unwrap_or(0.0),
            model_used: row.get(4).unwrap_or_default(),
            status,
            feedback: row.get(6).unwrap_or(None),
            approval_timestamp: row.get(7).unwrap_or(None),
        }
    }

    fn deserialize_summary(row: &rusqlite::Row<'_>) -> ConversationSummary {
        let total_energy_consumed: f64 = row.get(3).unwrap_or(0.0);
        let energy_budget: Option<f64> = row.get(5).unwrap_or(None);
        let last_response: Option<String> = row.get::<_, Option<String>>(7).unwrap_or(None).map(
            |content| {
                if content.chars().count() > PROJECTION_CHARS {
                    content.chars().take(PROJECTION_CHARS).collect()
                } else {
                    content
                }
            },
        );
        ConversationSummary {
            request_id: row.get(0).unwrap_or_default(),
            input_message: row.get(1).unwrap_or_default(),
            created_at: row.get(2).unwrap_or_default(),
            response_count: row.get(6).unwrap_or(0),
            last_response,
            total_energy_consumed,
            ended: row.get::<_, i64>(4).unwrap_or(0) != 0,
            energy_budget,
            budget_status: derive_budget_status(energy_budget, total_energy_consumed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConversationStore {
        ConversationStore::open_in_memory().unwrap()
    }

    fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Push a conversation's snooze deadline into the past.
    fn expire_snooze(store: &ConversationStore, request_id: &str) {
        let past = (Utc::now() - ChronoDuration::seconds(60))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        store
            .conn
            .execute(
                "UPDATE conversations SET snooze_until = ?1 WHERE request_id = ?2",
                params![past, request_id],
            )
            .unwrap();
    }

    #[test]
    fn test_upsert_does_not_overwrite_user_text() {
        let s = store();
        let id = new_id();
        s.upsert_request(&id, "original", None).unwrap();
        s.upsert_request(&id, "changed", None).unwrap();
        assert_eq!(s.get(&id).unwrap().unwrap().input_message, "original");
    }

    #[test]
    fn test_append_response_answers_pending() {
        let s = store();
        let id = new_id();
        s.upsert_request(&id, "hello", None).unwrap();
        assert_eq!(s.pending().unwrap().len(), 1);

        s.append_response(&id, None, "hi there", 42.0, "small").unwrap();
        assert!(s.pending().unwrap().is_empty());

        let record = s.get(&id).unwrap().unwrap();
        assert_eq!(record.responses.len(), 1);
        assert_eq!(record.responses[0].energy_level, 42.0);
        assert_eq!(record.responses[0].model_used, "small");
        assert_eq!(record.total_energy_consumed, 42.0);
        assert_eq!(record.sleep_cycles, 1);
    }

    #[test]
    fn test_cumulative_energy_never_decreases() {
        let s = store();
        let id = new_id();
        s.upsert_request(&id, "hello", None).unwrap();
        s.append_response(&id, None, "a", 10.0, "small").unwrap();
        s.append_response(&id, None, "b", -3.0, "small").unwrap();
        s.add_consumption(&id, -8.0).unwrap();
        let record = s.get(&id).unwrap().unwrap();
        assert_eq!(record.total_energy_consumed, 10.0);
        assert_eq!(record.responses[1].energy_level, -3.0);
    }

    #[test]
    fn test_add_consumption_without_response() {
        let s = store();
        let id = new_id();
        s.upsert_request(&id, "hello", None).unwrap();
        s.add_consumption(&id, 4.0).unwrap();
        s.add_consumption(&id, 4.0).unwrap();
        let record = s.get(&id).unwrap().unwrap();
        assert_eq!(record.total_energy_consumed, 8.0);
        assert!(record.responses.is_empty());
        // Still pending: consumption alone does not answer.
        assert_eq!(s.pending().unwrap().len(), 1);
    }

    #[test]
    fn test_budget_round_trip_and_adjust_clamp() {
        let s = store();
        let id = new_id();
        s.upsert_request(&id, "hello", None).unwrap();

        s.set_budget(&id, 12.5).unwrap();
        assert_eq!(s.get(&id).unwrap().unwrap().energy_budget, Some(12.5));

        s.adjust_budget(&id, -100.0).unwrap();
        assert_eq!(s.get(&id).unwrap().unwrap().energy_budget, Some(0.0));

        s.adjust_budget(&id, 7.0).unwrap();
        assert_eq!(s.get(&id).unwrap().unwrap().energy_budget, Some(7.0));
    }

    #[test]
    fn test_budget_status_derivation() {
        assert_eq!(derive_budget_status(None, 50.0), None);
        assert_eq!(derive_budget_status(Some(0.0), 0.0), Some(BudgetStatus::Depleted));
        assert_eq!(derive_budget_status(Some(3.0), 3.0), Some(BudgetStatus::Exceeded));
        assert_eq!(derive_budget_status(Some(3.0), 8.0), Some(BudgetStatus::Exceeded));
        assert_eq!(derive_budget_status(Some(10.0), 2.0), Some(BudgetStatus::Within));
    }

    #[test]
    fn test_approval_keeps_conversation_pending() {
        let s = store();
        let id = new_id();
        s.upsert_request(&id, "may I?", None).unwrap();
        s.append_approval(&id, "requesting approval", 60.0, "medium", Some(5.0))
            .unwrap();

        // Approval rows do not count as answers.
        assert_eq!(s.pending().unwrap().len(), 1);
        let record = s.get(&id).unwrap().unwrap();
        assert_eq!(record.approvals.len(), 1);
        assert_eq!(record.approvals[0].status, ApprovalStatus::Pending);
        assert_eq!(record.energy_budget, Some(5.0));
    }

    #[test]
    fn test_approval_transitions_are_monotonic() {
        let s = store();
        let id = new_id();
        s.upsert_request(&id, "may I?", None).unwrap();
        s.append_approval(&id, "first", 60.0, "medium", None).unwrap();

        let moved = s
            .set_approval_status(&id, None, ApprovalStatus::Approved, Some("go ahead"))
            .unwrap();
        assert!(moved);

        // Already approved; no edge back to pending or across to rejected.
        let moved_again = s
            .set_approval_status(&id, None, ApprovalStatus::Rejected, None)
            .unwrap();
        assert!(!moved_again);

        let approvals = s.approvals(&id).unwrap();
        assert_eq!(approvals[0].status, ApprovalStatus::Approved);
        assert_eq!(approvals[0].feedback.as_deref(), Some("go ahead"));
        assert!(approvals[0].approval_timestamp.is_some());
    }

    #[test]
    fn test_latest_targets_newest_pending_approval() {
        let s = store();
        let id = new_id();
        s.upsert_request(&id, "may I?", None).unwrap();
        s.append_approval(&id, "first", 60.0, "medium", None).unwrap();
        s.append_approval(&id, "second", 55.0, "medium", None).unwrap();

        s.set_approval_status(&id, None, ApprovalStatus::Rejected, None).unwrap();

        let approvals = s.approvals(&id).unwrap();
        assert_eq!(approvals[0].status, ApprovalStatus::Pending);
        assert_eq!(approvals[1].status, ApprovalStatus::Rejected);
    }

    #[test]
    fn test_end_is_idempotent_and_excludes_from_selection() {
        let s = store();
        let id = new_id();
        s.upsert_request(&id, "bye", None).unwrap();
        s.append_response(&id, None, "farewell", 30.0, "small").unwrap();

        s.end(&id, Some("done")).unwrap();
        s.end(&id, Some("done again")).unwrap();

        let record = s.get(&id).unwrap().unwrap();
        assert!(record.ended);
        assert_eq!(record.ended_reason.as_deref(), Some("done"));
        assert!(s.pending().unwrap().is_empty());
        assert!(s.recent_completed(10).unwrap().is_empty());
        assert!(s.recent_open(10).unwrap().is_empty());
    }

    #[test]
    fn test_response_into_ended_conversation_is_permitted() {
        let s = store();
        let id = new_id();
        s.upsert_request(&id, "closing", None).unwrap();
        s.end(&id, None).unwrap();
        s.append_response(&id, None, "final word", 25.0, "small").unwrap();
        let record = s.get(&id).unwrap().unwrap();
        assert_eq!(record.responses.len(), 1);
        // But selection still excludes it.
        assert!(s.recent_completed(10).unwrap().is_empty());
    }

    #[test]
    fn test_snooze_hides_then_reappears() {
        let s = store();
        let id = new_id();
        s.upsert_request(&id, "later please", None).unwrap();

        s.snooze(&id, 5.0).unwrap();
        assert!(s.pending().unwrap().is_empty());
        assert!(s.recent_open(10).unwrap().is_empty());

        expire_snooze(&s, &id);
        assert_eq!(s.pending().unwrap().len(), 1);
        assert_eq!(s.recent_open(10).unwrap().len(), 1);
    }

    #[test]
    fn test_snooze_negative_coerces_and_zero_noops() {
        let s = store();
        let id = new_id();
        s.upsert_request(&id, "hmm", None).unwrap();

        s.snooze(&id, 0.0).unwrap();
        assert!(s.get(&id).unwrap().unwrap().snooze_until.is_none());

        s.snooze(&id, -5.0).unwrap();
        let record = s.get(&id).unwrap().unwrap();
        assert_eq!(record.snooze_duration_minutes, Some(SNOOZE_FALLBACK_MINUTES));
        assert!(record.snooze_until.is_some());
        assert!(s.pending().unwrap().is_empty());
    }

    #[test]
    fn test_pending_is_oldest_first() {
        let s = store();
        let first = new_id();
        let second = new_id();
        s.upsert_request(&first, "first", None).unwrap();
        s.upsert_request(&second, "second", None).unwrap();
        // created_at has millisecond precision; force distinct ordering.
        s.conn
            .execute(
                "UPDATE conversations SET created_at = ?1 WHERE request_id = ?2",
                params!["2020-01-01T00:00:00.000Z", first],
            )
            .unwrap();
        let pending = s.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].request_id, first);
        assert_eq!(pending[1].request_id, second);
    }

    #[test]
    fn test_recent_completed_requires_a_response() {
        let s = store();
        let answered = new_id();
        let unanswered = new_id();
        s.upsert_request(&answered, "q1", None).unwrap();
        s.upsert_request(&unanswered, "q2", None).unwrap();
        s.append_response(&answered, None, "a1", 50.0, "medium").unwrap();

        let completed = s.recent_completed(10).unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].request_id, answered);
        assert_eq!(completed[0].response_count, 1);
        assert_eq!(completed[0].last_response.as_deref(), Some("a1"));
    }

    #[test]
    fn test_list_filters() {
        let s = store();
        let pending = new_id();
        let active = new_id();
        let ended = new_id();
        s.upsert_request(&pending, "waiting", None).unwrap();
        s.upsert_request(&active, "answered", Some(0.0)).unwrap();
        s.upsert_request(&ended, "closed", None).unwrap();
        s.append_response(&active, None, "done", 40.0, "small").unwrap();
        s.end(&ended, None).unwrap();

        let got = s.list(Some(StateFilter::Pending), None, 50).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].request_id, pending);

        let got = s.list(Some(StateFilter::Active), None, 50).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].request_id, active);

        let got = s.list(Some(StateFilter::Ended), None, 50).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].request_id, ended);

        let got = s.list(None, Some(BudgetStatus::Depleted), 50).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].request_id, active);
    }

    #[test]
    fn test_stats() {
        let s = store();
        let calm = new_id();
        let urgent = new_id();
        s.upsert_request(&calm, "a", None).unwrap();
        s.upsert_request(&urgent, "b", None).unwrap();
        s.append_response(&calm, None, "r1", 80.0, "large").unwrap();
        s.append_response(&urgent, None, "r2", -10.0, "small").unwrap();

        let stats = s.stats().unwrap();
        assert_eq!(stats.total_conversations, 2);
        assert_eq!(stats.total_responses, 2);
        assert_eq!(stats.total_energy_consumed, 80.0);
        assert_eq!(stats.average_energy_level, 35.0);
        assert_eq!(stats.urgent_count, 1);
    }

    #[test]
    fn test_migration_is_reentrant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversations.db");
        let path_str = path.to_string_lossy().to_string();
        {
            let s = ConversationStore::open(&path_str).unwrap();
            let id = new_id();
            s.upsert_request(&id, "persisted", None).unwrap();
            s.close().unwrap();
        }
        // Reopen: migrations re-run, approval columns tolerated, data kept.
        let s = ConversationStore::open(&path_str).unwrap();
        assert_eq!(s.stats().unwrap().total_conversations, 1);
    }
}
