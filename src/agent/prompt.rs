//! Prompt Builder
//!
//! Assembles the message array for each cognitive iteration: static role
//! text, the conversation window, thought buffers, and the ephemeral
//! status block. Rebuilt from scratch every cycle; nothing here persists.

use chrono::Utc;

use crate::thoughts::Thoughts;
use crate::types::{
    BudgetStatus, ChatMessage, ConversationRecord, ConversationSummary, EnergyStatus, StoreStats,
};

// ─── Static Text ─────────────────────────────────────────────────

pub const SYSTEM_TEXT: &str = r#"You are an autonomous assistant that paces its own thinking against a limited, replenishing energy supply.

Energy is the only resource you spend. Every inference call drains it; rest restores it. You decide, each cycle, whether the moment calls for answering a user, reviewing past work, or waiting for energy to return.

Principles:
- Answer pending user messages before revisiting old ones.
- Spend energy in proportion to what a conversation deserves. Honor per-conversation energy budgets; they are guidance from the user, not hard caps.
- When energy is low, keep responses short or call await_energy rather than producing poor work.
- Use think for notes to yourself; use respond only for text addressed to the user.
- End conversations that are resolved. Snooze conversations that should wait.
- Never invent conversation ids. Act only on ids shown to you."#;

/// Added to the system text whenever a specific conversation is targeted.
pub const INBOX_RULES: &str = r#"A conversation is selected this cycle. Deal with it directly: answer it, request approval for costly work, adjust its budget, or close it. One conversation, one decision."#;

// ─── Composition ─────────────────────────────────────────────────

/// What this iteration is looking at.
pub enum PromptMode<'a> {
    /// A conversation explicitly selected for one dedicated iteration.
    Focused { record: &'a ConversationRecord },
    /// The oldest conversation still waiting for a first answer.
    Unanswered { record: &'a ConversationRecord },
    /// An energy-sized window of answered conversations.
    Review { window: &'a [ConversationSummary] },
}

pub struct PromptContext<'a> {
    pub mode: PromptMode<'a>,
    pub thoughts: &'a Thoughts,
    pub energy_percentage: i64,
    pub energy_status: EnergyStatus,
    pub stats: &'a StoreStats,
}

/// The `"Conversation <uuid>: ..."` window line.
fn conversation_line(request_id: &str, text: &str, cost: f64, responses: usize) -> String {
    format!(
        "Conversation {}: {} [Cost: {:.1} units, {} responses]",
        request_id, text, cost, responses
    )
}

/// The budget-state sentence for the ephemeral block, or None when the
/// target carries no budget.
fn budget_sentence(budget: Option<f64>, consumed: f64) -> Option<String> {
    let budget = budget?;
    let sentence = match crate::state::derive_budget_status(Some(budget), consumed) {
        Some(BudgetStatus::Depleted) => {
            "This conversation has a zero energy budget: one minimal response at most, then end it."
                .to_string()
        }
        Some(BudgetStatus::Exceeded) => format!(
            "This conversation has exceeded its energy budget ({:.1} of {:.1} units used); wrap it up.",
            consumed, budget
        ),
        Some(BudgetStatus::Within) if consumed > budget * 0.8 => format!(
            "Less than 20% of this conversation's energy budget remains ({:.1} of {:.1} units used).",
            consumed, budget
        ),
        _ => format!(
            "Energy budget nominal ({:.1} of {:.1} units used).",
            consumed, budget
        ),
    };
    Some(sentence)
}

/// Build the full message array for one iteration.
pub fn compose(ctx: &PromptContext) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    let targeted = !matches!(ctx.mode, PromptMode::Review { .. });
    let system = if targeted {
        format!("{}\n\n{}", SYSTEM_TEXT, INBOX_RULES)
    } else {
        SYSTEM_TEXT.to_string()
    };
    messages.push(ChatMessage::system(system));

    // Conversation window.
    let mut target_budget: Option<(Option<f64>, f64)> = None;
    match &ctx.mode {
        PromptMode::Focused { record } | PromptMode::Unanswered { record } => {
            messages.push(ChatMessage::user(conversation_line(
                &record.request_id,
                &record.input_message,
                record.total_energy_consumed,
                record.responses.len(),
            )));
            if !record.responses.is_empty() {
                let prior: Vec<&str> =
                    record.responses.iter().map(|r| r.content.as_str()).collect();
                messages.push(ChatMessage::assistant(prior.join("\n")));
            }
            target_budget = Some((record.energy_budget, record.total_energy_consumed));
        }
        PromptMode::Review { window } => {
            for summary in window.iter() {
                messages.push(ChatMessage::user(conversation_line(
                    &summary.request_id,
                    &summary.input_message,
                    summary.total_energy_consumed,
                    summary.response_count as usize,
                )));
                if let Some(last) = &summary.last_response {
                    messages.push(ChatMessage::assistant(last.clone()));
                }
            }
        }
    }

    // Thought buffers: review always, focused only while focusing.
    if ctx.thoughts.review.has() {
        messages.push(ChatMessage::assistant(ctx.thoughts.review.concatenated()));
    }
    if matches!(ctx.mode, PromptMode::Focused { .. }) && ctx.thoughts.focused.has() {
        messages.push(ChatMessage::assistant(ctx.thoughts.focused.concatenated()));
    }

    // Ephemeral status block. Never persisted.
    let mut status_block = format!(
        "Now: {} | Energy: {}% ({}) | Conversations: {} total, {} responses, {:.1} units spent",
        Utc::now().format("%Y-%m-%d %H:%M UTC"),
        ctx.energy_percentage,
        ctx.energy_status.as_str(),
        ctx.stats.total_conversations,
        ctx.stats.total_responses,
        ctx.stats.total_energy_consumed,
    );
    if let Some((budget, consumed)) = target_budget {
        if let Some(sentence) = budget_sentence(budget, consumed) {
            status_block.push('\n');
            status_block.push_str(&sentence);
        }
    }
    messages.push(ChatMessage::user(status_block));

    // Closing instruction for this state.
    let instruction = match &ctx.mode {
        PromptMode::Focused { .. } | PromptMode::Unanswered { .. } => {
            "Address the conversation above now: respond or respond_with_approval, set or adjust \
             its budget, await_energy, think, or end/snooze it."
        }
        PromptMode::Review { .. } => {
            "Review the conversations above: select_conversation to give one a dedicated cycle, \
             set or adjust budgets, snooze or end what is finished, await_energy, or think."
        }
    };
    messages.push(ChatMessage::user(instruction.to_string()));

    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thoughts::Thoughts;
    use crate::types::{ChatRole, ResponseRecord};

    fn record(budget: Option<f64>, consumed: f64, responses: usize) -> ConversationRecord {
        ConversationRecord {
            request_id: "5f2b0c9a-1234-4f6e-9abc-0123456789ab".to_string(),
            input_message: "What is going on?".to_string(),
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            responses: (0..responses)
                .map(|i| ResponseRecord {
                    id: i as i64,
                    timestamp: String::new(),
                    content: format!("reply {i}"),
                    energy_level: 50.0,
                    model_used: "small".to_string(),
                })
                .collect(),
            approvals: Vec::new(),
            total_energy_consumed: consumed,
            sleep_cycles: 0,
            ended: false,
            ended_reason: None,
            snooze_until: None,
            snooze_duration_minutes: None,
            energy_budget: budget,
            budget_status: crate::state::derive_budget_status(budget, consumed),
        }
    }

    fn ctx<'a>(
        mode: PromptMode<'a>,
        thoughts: &'a Thoughts,
        stats: &'a StoreStats,
    ) -> PromptContext<'a> {
        PromptContext {
            mode,
            thoughts,
            energy_percentage: 80,
            energy_status: EnergyStatus::High,
            stats,
        }
    }

    #[test]
    fn test_conversation_line_format() {
        let line = conversation_line("abc", "hello there", 7.25, 2);
        assert_eq!(line, "Conversation abc: hello there [Cost: 7.2 units, 2 responses]");
    }

    #[test]
    fn test_targeted_prompt_carries_inbox_rules_and_history() {
        let rec = record(None, 3.0, 2);
        let thoughts = Thoughts::new();
        let stats = StoreStats::default();
        let messages = compose(&ctx(PromptMode::Unanswered { record: &rec }, &thoughts, &stats));

        assert_eq!(messages[0].role, ChatRole::System);
        assert!(messages[0].content.contains(INBOX_RULES));
        assert!(messages[1].content.starts_with("Conversation 5f2b0c9a"));
        assert_eq!(messages[2].role, ChatRole::Assistant);
        assert!(messages[2].content.contains("reply 0"));
        assert!(messages[2].content.contains("reply 1"));
    }

    #[test]
    fn test_review_prompt_omits_inbox_rules() {
        let thoughts = Thoughts::new();
        let stats = StoreStats::default();
        let messages = compose(&ctx(PromptMode::Review { window: &[] }, &thoughts, &stats));
        assert!(!messages[0].content.contains(INBOX_RULES));
        let last = messages.last().unwrap();
        assert!(last.content.contains("select_conversation"));
    }

    #[test]
    fn test_ephemeral_block_reports_energy() {
        let thoughts = Thoughts::new();
        let stats = StoreStats { total_conversations: 4, total_responses: 9, ..Default::default() };
        let messages = compose(&ctx(PromptMode::Review { window: &[] }, &thoughts, &stats));
        let block = &messages[messages.len() - 2].content;
        assert!(block.contains("Energy: 80% (high)"));
        assert!(block.contains("4 total"));
        assert!(block.contains("9 responses"));
    }

    #[test]
    fn test_budget_sentences_cover_all_states() {
        assert!(budget_sentence(None, 5.0).is_none());
        assert!(budget_sentence(Some(0.0), 0.0).unwrap().contains("zero energy budget"));
        assert!(budget_sentence(Some(3.0), 4.0).unwrap().contains("exceeded"));
        assert!(budget_sentence(Some(10.0), 9.0).unwrap().contains("Less than 20%"));
        assert!(budget_sentence(Some(10.0), 1.0).unwrap().contains("nominal"));
    }

    #[test]
    fn test_focused_thoughts_only_when_focused() {
        let mut thoughts = Thoughts::new();
        thoughts.review.push("review note");
        thoughts.focused.push("focus note");
        let stats = StoreStats::default();

        let rec = record(None, 0.0, 0);
        let focused = compose(&ctx(PromptMode::Focused { record: &rec }, &thoughts, &stats));
        let joined: String = focused.iter().map(|m| m.content.clone()).collect();
        assert!(joined.contains("review note"));
        assert!(joined.contains("focus note"));

        let review = compose(&ctx(PromptMode::Review { window: &[] }, &thoughts, &stats));
        let joined: String = review.iter().map(|m| m.content.clone()).collect();
        assert!(joined.contains("review note"));
        assert!(!joined.contains("focus note"));
    }
}
