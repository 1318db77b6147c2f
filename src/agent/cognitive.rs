//! The Cognitive Loop
//!
//! One cooperative cycle: wait for energy, drain what the world sent,
//! pick something to think about, think, act on the reply, pay for it.
//! Everything the agent does flows through here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::energy::EnergyRegulator;
use crate::events::EventPublisher;
use crate::gateway::ModelGateway;
use crate::state::StoreHandle;
use crate::subagent::SubAgentHandle;
use crate::thoughts::Thoughts;
use crate::types::{
    Event, GatewayReply, LoopSignal, SubAgentMessage, ToolCallRequest, ENERGY_MAX,
};

use super::prompt::{self, PromptContext, PromptMode};
use super::tools::{self, ToolEffects};

/// Review window size for a given energy percentage: 1 at empty, 20 at full.
pub fn review_window_size(percentage: i64) -> i64 {
    (1.0 + 19.0 * percentage as f64 / 100.0).round() as i64
}

pub struct CognitiveLoopOptions {
    pub store: StoreHandle,
    pub regulator: Arc<EnergyRegulator>,
    pub gateway: Arc<ModelGateway>,
    pub events: EventPublisher,
    pub signals: mpsc::UnboundedReceiver<LoopSignal>,
    pub subagent: Option<SubAgentHandle>,
    pub running: Arc<AtomicBool>,
}

pub struct CognitiveLoop {
    store: StoreHandle,
    regulator: Arc<EnergyRegulator>,
    gateway: Arc<ModelGateway>,
    events: EventPublisher,
    signals: mpsc::UnboundedReceiver<LoopSignal>,
    subagent: Option<SubAgentHandle>,
    running: Arc<AtomicBool>,
    thoughts: Thoughts,
    focus: Option<String>,
}

impl CognitiveLoop {
    pub fn new(options: CognitiveLoopOptions) -> Self {
        Self {
            store: options.store,
            regulator: options.regulator,
            gateway: options.gateway,
            events: options.events,
            signals: options.signals,
            subagent: options.subagent,
            running: options.running,
            thoughts: Thoughts::new(),
            focus: None,
        }
    }

    /// Run until the stop flag clears. An iteration that errors backs the
    /// loop off to full recovery instead of crashing it.
    pub async fn run(mut self) {
        info!("cognitive loop starting");
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.run_iteration().await {
                error!("iteration failed: {e:#}; awaiting full recovery");
                self.regulator.await_level(ENERGY_MAX).await;
            }
        }
        info!("cognitive loop stopped");
    }

    /// One full cycle.
    async fn run_iteration(&mut self) -> Result<()> {
        // Gate on energy for the call we are about to make.
        let estimate = self.gateway.estimate_next_cost();
        if self.regulator.current() < estimate {
            let deficit = estimate - self.regulator.current();
            self.events.publish(Event::SleepStart {
                seconds: (deficit / self.regulator.replenish_rate()).ceil(),
            });
            self.regulator.await_level(estimate).await;
            self.events.publish(Event::SleepEnd { energy: self.regulator.current() });
        }

        self.drain_signals();
        self.poll_subagent();

        if let Some(request_id) = self.focus.take() {
            // Focus is cleared up front: one dedicated cycle, whatever happens.
            self.targeted_iteration(request_id, true).await;
        } else if let Some(oldest) = self.store.pending().into_iter().next() {
            self.targeted_iteration(oldest.request_id, false).await;
        } else {
            self.review_iteration().await;
        }
        Ok(())
    }

    /// Pull in everything ingress pushed since the last cycle.
    fn drain_signals(&mut self) {
        while let Ok(signal) = self.signals.try_recv() {
            match signal {
                LoopSignal::NewMessage(request_id) => {
                    debug!(%request_id, "new message signalled");
                }
                LoopSignal::Focus(request_id) => {
                    self.focus = Some(request_id);
                }
                LoopSignal::Reflect => {
                    debug!("reflection requested");
                }
            }
        }
    }

    /// Drain sub-agent traffic and pay for the work it reports.
    fn poll_subagent(&mut self) {
        let Some(handle) = &self.subagent else { return };
        for message in handle.drain_messages() {
            match &message {
                SubAgentMessage::Completion { request_id, data } => {
                    self.thoughts
                        .review
                        .push(format!("Background task {request_id} completed: {data}"));
                }
                SubAgentMessage::Error { request_id, data } => {
                    self.thoughts
                        .review
                        .push(format!("Background task {request_id} failed: {data}"));
                }
                SubAgentMessage::StatusUpdate { request_id, .. }
                | SubAgentMessage::Log { request_id, .. } => {
                    debug!(%request_id, "sub-agent traffic");
                }
            }
        }
        let used = handle.energy_consumed_since_last_poll();
        if used > 0.0 {
            self.regulator.consume(used);
        }
    }

    /// One iteration dedicated to a single conversation, either freshly
    /// pending or explicitly selected.
    async fn targeted_iteration(&mut self, request_id: String, is_focused: bool) {
        let Some(record) = self.store.get(&request_id) else {
            self.thoughts
                .review
                .push(format!("Conversation {request_id} no longer exists; moving on."));
            return;
        };

        let stats = self.store.stats();
        let mode = if is_focused {
            PromptMode::Focused { record: &record }
        } else {
            PromptMode::Unanswered { record: &record }
        };
        let messages = prompt::compose(&PromptContext {
            mode,
            thoughts: &self.thoughts,
            energy_percentage: self.regulator.percentage(),
            energy_status: self.regulator.status(),
            stats: &stats,
        });

        let external = self
            .subagent
            .as_ref()
            .map(|h| h.external_tools())
            .unwrap_or_default();
        let definitions = tools::focused_tool_definitions(&external);
        let urgent = self.regulator.current() < 0.0;

        let reply = self.gateway.invoke(messages, definitions, urgent).await;
        self.regulator.consume(reply.energy_consumed);
        if is_focused {
            // Focused thinking is attributed to the conversation itself.
            self.store.add_consumption(&request_id, reply.energy_consumed);
        }
        self.handle_reply(reply, is_focused).await;
    }

    /// One iteration over an energy-sized window of answered conversations.
    async fn review_iteration(&mut self) {
        let window_size = review_window_size(self.regulator.percentage());
        let window = self.store.recent_completed(window_size);
        let stats = self.store.stats();
        let messages = prompt::compose(&PromptContext {
            mode: PromptMode::Review { window: &window },
            thoughts: &self.thoughts,
            energy_percentage: self.regulator.percentage(),
            energy_status: self.regulator.status(),
            stats: &stats,
        });

        let external = self
            .subagent
            .as_ref()
            .map(|h| h.external_tools())
            .unwrap_or_default();
        let definitions = tools::review_tool_definitions(&external);
        let urgent = self.regulator.current() < 0.0;

        let reply = self.gateway.invoke(messages, definitions, urgent).await;
        self.regulator.consume(reply.energy_consumed);
        self.handle_reply(reply, false).await;
    }

    /// Act on the model's reply: native tool calls first, a JSON tool
    /// invocation in the content second, otherwise keep it as a thought.
    async fn handle_reply(&mut self, reply: GatewayReply, is_focused: bool) {
        let energy_at_write = self.regulator.current();
        let external_names: Vec<String> = self
            .subagent
            .as_ref()
            .map(|h| h.external_tools().into_iter().map(|t| t.name).collect())
            .unwrap_or_default();
        let external_source = self.subagent.as_ref().map(|h| h.source());

        let calls: Vec<ToolCallRequest> = if !reply.tool_calls.is_empty() {
            reply.tool_calls.clone()
        } else if let Some(call) = parse_inline_tool_call(&reply.content) {
            vec![call]
        } else {
            if !reply.content.trim().is_empty() {
                self.thoughts.active_mut(is_focused).push(reply.content.clone());
            }
            return;
        };

        for call in &calls {
            let mut fx = ToolEffects {
                store: &self.store,
                regulator: self.regulator.as_ref(),
                events: &self.events,
                thoughts: &mut self.thoughts,
                focus: &mut self.focus,
                focused_mode: is_focused,
                energy_at_write,
                model_tier: &reply.model_tier,
                external: external_source.clone(),
                external_names: &external_names,
            };
            tools::dispatch(call, &mut fx).await;
        }
    }
}

/// Models without native tool support sometimes answer with a JSON object
/// describing the call. Accept `{"tool": ..., "arguments": ...}` and the
/// `"name"` spelling of the same.
fn parse_inline_tool_call(content: &str) -> Option<ToolCallRequest> {
    let value: serde_json::Value = serde_json::from_str(content.trim()).ok()?;
    let name = value
        .get("tool")
        .or_else(|| value.get("name"))
        .and_then(|v| v.as_str())?
        .to_string();
    let arguments = match value.get("arguments") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "{}".to_string(),
    };
    Some(ToolCallRequest { id: format!("inline_{}", uuid::Uuid::new_v4()), name, arguments })
}
