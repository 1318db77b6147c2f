//! Tool Registry & Dispatcher
//!
//! Declares the core tools, narrows what the model may call in each loop
//! state, and routes tool calls to their effects. Nothing in here is
//! fatal: bad JSON, missing ids, and unknown names are logged, skipped,
//! and surfaced back to the agent as diagnostic thoughts.

use std::sync::Arc;

use regex::Regex;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::energy::EnergyRegulator;
use crate::events::EventPublisher;
use crate::state::StoreHandle;
use crate::thoughts::Thoughts;
use crate::types::{Event, ExternalTool, ExternalToolSource, ToolCallRequest};

/// A core tool offered to the model.
#[derive(Clone, Debug)]
pub struct CoreTool {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

/// All core tools. Names are protocol surface; changing one is a breaking
/// change for any model prompt that mentions it.
pub fn core_tools() -> Vec<CoreTool> {
    vec![
        CoreTool {
            name: "respond",
            description: "Send a response to the user of a conversation. Removes it from the pending set.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "requestId": { "type": "string", "description": "Conversation id (UUID)" },
                    "content": { "type": "string", "description": "The response text" }
                },
                "required": ["requestId", "content"]
            }),
        },
        CoreTool {
            name: "respond_with_approval",
            description: "Propose a response that needs the user's explicit approval before further work. The conversation stays pending.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "requestId": { "type": "string", "description": "Conversation id (UUID)" },
                    "content": { "type": "string", "description": "The proposal text" },
                    "energyBudget": { "type": "number", "description": "Optional energy budget to set" }
                },
                "required": ["requestId", "content"]
            }),
        },
        CoreTool {
            name: "think",
            description: "Record a private thought. Not shown to any user.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "thought": { "type": "string", "description": "The thought to keep" }
                },
                "required": ["thought"]
            }),
        },
        CoreTool {
            name: "await_energy",
            description: "Pause until energy recovers to the given level.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "level": { "type": "number", "description": "Target energy level" }
                },
                "required": ["level"]
            }),
        },
        CoreTool {
            name: "end_conversation",
            description: "Mark a conversation finished. It will not be selected again.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "requestId": { "type": "string", "description": "Conversation id (UUID)" },
                    "reason": { "type": "string", "description": "Why it is finished" }
                },
                "required": ["requestId"]
            }),
        },
        CoreTool {
            name: "snooze_conversation",
            description: "Hide a conversation from selection for a number of minutes.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "requestId": { "type": "string", "description": "Conversation id (UUID)" },
                    "minutes": { "type": "number", "description": "Minutes to snooze" }
                },
                "required": ["requestId", "minutes"]
            }),
        },
        CoreTool {
            name: "select_conversation",
            description: "Dedicate the next cycle to one conversation.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "requestId": { "type": "string", "description": "Conversation id (UUID)" }
                },
                "required": ["requestId"]
            }),
        },
        CoreTool {
            name: "set_budget",
            description: "Set a conversation's energy budget.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "requestId": { "type": "string", "description": "Conversation id (UUID)" },
                    "budget": { "type": "number", "description": "Budget in energy units" }
                },
                "required": ["requestId", "budget"]
            }),
        },
        CoreTool {
            name: "adjust_budget",
            description: "Shift a conversation's energy budget by a delta. Budgets never go below zero.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "requestId": { "type": "string", "description": "Conversation id (UUID)" },
                    "delta": { "type": "number", "description": "Amount to add (or remove, if negative)" }
                },
                "required": ["requestId", "delta"]
            }),
        },
    ]
}

/// Tool names offered while a conversation is targeted.
const FOCUSED_NAMES: &[&str] = &[
    "respond",
    "respond_with_approval",
    "set_budget",
    "adjust_budget",
    "await_energy",
    "think",
    "end_conversation",
    "snooze_conversation",
];

/// Tool names offered while reviewing completed conversations.
const REVIEW_NAMES: &[&str] = &[
    "select_conversation",
    "set_budget",
    "adjust_budget",
    "await_energy",
    "think",
    "end_conversation",
    "snooze_conversation",
];

fn to_definition(name: &str, description: &str, parameters: &Value) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters,
        }
    })
}

fn definitions_for(allowed: &[&str], external: &[ExternalTool]) -> Vec<Value> {
    let mut defs: Vec<Value> = core_tools()
        .iter()
        .filter(|t| allowed.contains(&t.name))
        .map(|t| to_definition(t.name, t.description, &t.parameters))
        .collect();
    for tool in external {
        defs.push(to_definition(&tool.name, &tool.description, &tool.parameters));
    }
    defs
}

/// Definitions for a focused or unanswered-target iteration.
pub fn focused_tool_definitions(external: &[ExternalTool]) -> Vec<Value> {
    definitions_for(FOCUSED_NAMES, external)
}

/// Definitions for a review iteration.
pub fn review_tool_definitions(external: &[ExternalTool]) -> Vec<Value> {
    definitions_for(REVIEW_NAMES, external)
}

/// Pull a canonical UUID out of a tool argument. Models like to hand back
/// `"Conversation <uuid>: ..."`; only the uuid matters.
pub fn extract_request_id(args: &Value, raw: &str) -> Option<String> {
    let pattern =
        Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
            .ok()?;
    if let Some(field) = args.get("requestId").and_then(|v| v.as_str()) {
        if let Some(m) = pattern.find(field) {
            return Some(m.as_str().to_lowercase());
        }
    }
    // Fall back to scanning the raw argument string.
    pattern.find(raw).map(|m| m.as_str().to_lowercase())
}

/// Everything a tool call may touch during one iteration.
pub struct ToolEffects<'a> {
    pub store: &'a StoreHandle,
    pub regulator: &'a EnergyRegulator,
    pub events: &'a EventPublisher,
    pub thoughts: &'a mut Thoughts,
    pub focus: &'a mut Option<String>,
    /// Whether this iteration is a focused one (routes `think`).
    pub focused_mode: bool,
    /// Energy level observed when the reply was produced.
    pub energy_at_write: f64,
    pub model_tier: &'a str,
    pub external: Option<Arc<dyn ExternalToolSource>>,
    pub external_names: &'a [String],
}

impl ToolEffects<'_> {
    fn diagnose(&mut self, text: String) {
        warn!("{text}");
        self.thoughts.active_mut(self.focused_mode).push(text);
    }
}

/// Execute one tool call from the model. Never fails: every failure mode
/// degrades to a log line and, where the agent should know, a diagnostic
/// thought.
pub async fn dispatch(call: &ToolCallRequest, fx: &mut ToolEffects<'_>) {
    let is_core = core_tools().iter().any(|t| t.name == call.name);
    let is_external = fx.external_names.iter().any(|n| n == &call.name);
    if !is_core && !is_external {
        warn!(tool = %call.name, "unknown tool name; ignoring call");
        return;
    }

    let args: Value = match serde_json::from_str(&call.arguments) {
        Ok(v) => v,
        Err(e) => {
            fx.diagnose(format!(
                "Tool call {} arrived with malformed JSON arguments ({e}); skipped it.",
                call.name
            ));
            return;
        }
    };

    info!(tool = %call.name, "dispatching tool call");

    if is_external {
        dispatch_external(call, &args, fx).await;
        return;
    }

    // Tools without a conversation target.
    match call.name.as_str() {
        "think" => {
            let Some(thought) = args.get("thought").and_then(|v| v.as_str()) else {
                fx.diagnose("Tool call think was missing its thought argument; skipped it.".into());
                return;
            };
            fx.events.publish(Event::ToolInvocation { name: call.name.clone(), request_id: None });
            fx.thoughts.active_mut(fx.focused_mode).push(thought.to_string());
            return;
        }
        "await_energy" => {
            let Some(level) = args.get("level").and_then(|v| v.as_f64()) else {
                fx.diagnose("Tool call await_energy was missing its level argument; skipped it.".into());
                return;
            };
            fx.events.publish(Event::ToolInvocation { name: call.name.clone(), request_id: None });
            fx.regulator.await_level(level).await;
            return;
        }
        _ => {}
    }

    // Everything below needs a resolvable conversation.
    let Some(request_id) = extract_request_id(&args, &call.arguments) else {
        fx.diagnose(format!(
            "Tool call {} did not contain a parseable conversation id; skipped it.",
            call.name
        ));
        return;
    };

    if fx.store.get(&request_id).is_none() {
        fx.diagnose(format!(
            "Tool call {} targeted conversation {}, which does not exist.",
            call.name, request_id
        ));
        return;
    }

    fx.events.publish(Event::ToolInvocation {
        name: call.name.clone(),
        request_id: Some(request_id.clone()),
    });

    match call.name.as_str() {
        "respond" => {
            let Some(content) = args.get("content").and_then(|v| v.as_str()) else {
                fx.diagnose("Tool call respond was missing its content argument; skipped it.".into());
                return;
            };
            fx.store.append_response(
                &request_id,
                None,
                content,
                fx.energy_at_write,
                fx.model_tier,
            );
            fx.events.publish(Event::MessageAdded {
                request_id: request_id.clone(),
                model: fx.model_tier.to_string(),
            });
        }
        "respond_with_approval" => {
            let Some(content) = args.get("content").and_then(|v| v.as_str()) else {
                fx.diagnose(
                    "Tool call respond_with_approval was missing its content argument; skipped it."
                        .into(),
                );
                return;
            };
            let budget = args.get("energyBudget").and_then(|v| v.as_f64());
            fx.store.append_approval(
                &request_id,
                content,
                fx.energy_at_write,
                fx.model_tier,
                budget,
            );
        }
        "end_conversation" => {
            let reason = args.get("reason").and_then(|v| v.as_str());
            fx.store.end(&request_id, reason);
            if fx.focus.as_deref() == Some(request_id.as_str()) {
                *fx.focus = None;
            }
            fx.events.publish(Event::ConversationStateChanged {
                request_id: request_id.clone(),
                state: "ended".to_string(),
            });
        }
        "snooze_conversation" => {
            let Some(minutes) = args.get("minutes").and_then(|v| v.as_f64()) else {
                fx.diagnose(
                    "Tool call snooze_conversation was missing its minutes argument; skipped it."
                        .into(),
                );
                return;
            };
            fx.store.snooze(&request_id, minutes);
            fx.events.publish(Event::ConversationStateChanged {
                request_id: request_id.clone(),
                state: "snoozed".to_string(),
            });
        }
        "select_conversation" => {
            *fx.focus = Some(request_id.clone());
        }
        "set_budget" => {
            let Some(budget) = args.get("budget").and_then(|v| v.as_f64()) else {
                fx.diagnose("Tool call set_budget was missing its budget argument; skipped it.".into());
                return;
            };
            fx.store.set_budget(&request_id, budget);
        }
        "adjust_budget" => {
            let Some(delta) = args.get("delta").and_then(|v| v.as_f64()) else {
                fx.diagnose("Tool call adjust_budget was missing its delta argument; skipped it.".into());
                return;
            };
            fx.store.adjust_budget(&request_id, delta);
        }
        other => {
            warn!(tool = other, "core tool fell through dispatch");
        }
    }
}

async fn dispatch_external(call: &ToolCallRequest, args: &Value, fx: &mut ToolEffects<'_>) {
    let Some(source) = fx.external.clone() else {
        fx.diagnose(format!(
            "Tool call {} targets an external source, but none is configured.",
            call.name
        ));
        return;
    };
    fx.events.publish(Event::ToolInvocation { name: call.name.clone(), request_id: None });
    match source.call_tool(&call.name, args).await {
        Ok(result) => {
            let preview: String = result.chars().take(400).collect();
            fx.thoughts
                .active_mut(fx.focused_mode)
                .push(format!("Tool {} returned: {}", call.name, preview));
        }
        Err(e) => {
            fx.diagnose(format!("External tool {} failed: {e:#}", call.name));
        }
    }
}
