//! Model Gateway
//!
//! Selects a model tier from the current energy level, invokes the chat
//! provider with retry, and reports the net energy cost of each call.
//! The tier table is data; adding a tier is appending a row.

mod client;

pub use client::HttpChatProvider;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{error, warn};

use crate::energy::EnergyRegulator;
use crate::events::EventPublisher;
use crate::types::{ChatMessage, ChatOptions, ChatProvider, ChatRole, Event, GatewayReply};

/// Attempts per invocation before giving up on the provider.
const MAX_ATTEMPTS: u32 = 3;

/// Per-request transport timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const MAX_TOKENS: u32 = 1024;
const URGENT_MAX_TOKENS: u32 = 256;
const TEMPERATURE: f64 = 0.7;
const URGENT_TEMPERATURE: f64 = 0.3;

/// Substituted system text when the caller flags the call urgent.
const URGENT_SYSTEM_TEXT: &str = "Energy is critically low. Answer in as few words as possible. \
No preamble, no elaboration. If a tool call resolves the situation, make exactly that call and stop.";

/// Reply surfaced when every transport attempt fails. The loop treats it
/// like any other content; the caller is still charged the nominal cost.
const FALLBACK_CONTENT: &str =
    "I could not reach my reasoning model just now. I will retry on a later cycle.";

/// One row of the tier table.
#[derive(Clone, Debug)]
pub struct TierSpec {
    /// Lowest energy at which this tier may be chosen.
    pub min_energy: f64,
    pub tier: String,
    /// Nominal energy cost of one call on this tier.
    pub nominal_cost: f64,
}

/// Tier table ordered most expensive first.
pub fn default_tiers() -> Vec<TierSpec> {
    vec![
        TierSpec { min_energy: 60.0, tier: "large".to_string(), nominal_cost: 10.0 },
        TierSpec { min_energy: 25.0, tier: "medium".to_string(), nominal_cost: 5.0 },
        TierSpec { min_energy: 0.0, tier: "small".to_string(), nominal_cost: 2.5 },
    ]
}

/// The most expensive tier affordable at `energy`; the smallest tier when
/// none qualify.
pub fn select_tier(tiers: &[TierSpec], energy: f64) -> &TierSpec {
    tiers
        .iter()
        .find(|t| t.min_energy <= energy)
        .unwrap_or_else(|| tiers.last().expect("tier table is never empty"))
}

/// Resolve a tier to a concrete model id for the configured provider.
pub fn model_for_tier(provider: &str, tier: &str, model_override: Option<&str>) -> String {
    if let Some(model) = model_override {
        return model.to_string();
    }
    let model = match (provider, tier) {
        ("ollama", "small") => "llama3.2:1b",
        ("ollama", "medium") => "llama3.2:3b",
        ("ollama", _) => "llama3.1:8b",
        ("openrouter", "small") => "openai/gpt-4o-mini",
        ("openrouter", "medium") => "openai/gpt-4o",
        ("openrouter", _) => "anthropic/claude-sonnet-4-5",
        (_, "small") => "gpt-4o-mini",
        (_, "medium") => "gpt-4o",
        _ => "gpt-4.1",
    };
    model.to_string()
}

pub struct ModelGateway {
    provider: Arc<dyn ChatProvider>,
    regulator: Arc<EnergyRegulator>,
    events: EventPublisher,
    tiers: Vec<TierSpec>,
    provider_tag: String,
    model_override: Option<String>,
    last_tier: Mutex<Option<String>>,
}

impl ModelGateway {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        regulator: Arc<EnergyRegulator>,
        events: EventPublisher,
        provider_tag: String,
        model_override: Option<String>,
    ) -> Self {
        Self {
            provider,
            regulator,
            events,
            tiers: default_tiers(),
            provider_tag,
            model_override,
            last_tier: Mutex::new(None),
        }
    }

    /// Nominal cost of the call the loop is about to make, at the current
    /// energy level. Used to size `await_level`.
    pub fn estimate_next_cost(&self) -> f64 {
        select_tier(&self.tiers, self.regulator.current()).nominal_cost
    }

    /// One inference. Never returns an error: transport failures retry
    /// with exponential backoff and exhaustion degrades to a fallback
    /// reply carrying the full nominal charge.
    pub async fn invoke(
        &self,
        mut messages: Vec<ChatMessage>,
        tools: Vec<Value>,
        urgent: bool,
    ) -> GatewayReply {
        let tier = select_tier(&self.tiers, self.regulator.current()).clone();

        {
            let mut last = self.last_tier.lock().unwrap();
            if let Some(prev) = last.as_ref() {
                if *prev != tier.tier {
                    self.events.publish(Event::ModelSwitched {
                        from: prev.clone(),
                        to: tier.tier.clone(),
                    });
                }
            }
            *last = Some(tier.tier.clone());
        }

        if urgent {
            if let Some(first) = messages.first_mut() {
                if first.role == ChatRole::System {
                    first.content = URGENT_SYSTEM_TEXT.to_string();
                }
            }
        }

        let options = ChatOptions {
            model: model_for_tier(&self.provider_tag, &tier.tier, self.model_override.as_deref()),
            max_tokens: if urgent { URGENT_MAX_TOKENS } else { MAX_TOKENS },
            temperature: if urgent { URGENT_TEMPERATURE } else { TEMPERATURE },
            tools,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        };

        let start = std::time::Instant::now();
        for attempt in 0..MAX_ATTEMPTS {
            match self.provider.chat(&messages, &options).await {
                Ok(completion) => {
                    let elapsed = start.elapsed().as_secs_f64();
                    return GatewayReply {
                        content: completion.content,
                        // Net cost; goes negative for very fast calls.
                        energy_consumed: tier.nominal_cost - elapsed,
                        model_tier: tier.tier,
                        tool_calls: completion.tool_calls,
                    };
                }
                Err(e) => {
                    warn!(attempt, "chat attempt failed: {e:#}");
                    if attempt + 1 < MAX_ATTEMPTS {
                        let backoff = Duration::from_millis(2u64.pow(attempt) * 1000);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        error!("all {MAX_ATTEMPTS} chat attempts failed; returning fallback reply");
        GatewayReply {
            content: FALLBACK_CONTENT.to_string(),
            energy_consumed: tier.nominal_cost,
            model_tier: tier.tier,
            tool_calls: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatCompletion, TokenUsage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted provider: fails `failures` times, then echoes back.
    struct ScriptedProvider {
        failures: u32,
        calls: AtomicU32,
        captured: Mutex<Vec<(Vec<ChatMessage>, ChatOptions)>>,
    }

    impl ScriptedProvider {
        fn new(failures: u32) -> Self {
            Self { failures, calls: AtomicU32::new(0), captured: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        async fn chat(
            &self,
            messages: &[ChatMessage],
            options: &ChatOptions,
        ) -> anyhow::Result<ChatCompletion> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.captured
                .lock()
                .unwrap()
                .push((messages.to_vec(), options.clone()));
            if call < self.failures {
                anyhow::bail!("transport down");
            }
            Ok(ChatCompletion {
                content: "ok".to_string(),
                model: options.model.clone(),
                tool_calls: Vec::new(),
                usage: TokenUsage::default(),
            })
        }
    }

    fn gateway_with(provider: Arc<ScriptedProvider>, regulator: Arc<EnergyRegulator>) -> ModelGateway {
        ModelGateway::new(
            provider,
            regulator,
            EventPublisher::new(),
            "openai".to_string(),
            None,
        )
    }

    #[test]
    fn test_tier_selection_is_table_driven() {
        let tiers = default_tiers();
        assert_eq!(select_tier(&tiers, 100.0).tier, "large");
        assert_eq!(select_tier(&tiers, 60.0).tier, "large");
        assert_eq!(select_tier(&tiers, 59.9).tier, "medium");
        assert_eq!(select_tier(&tiers, 25.0).tier, "medium");
        assert_eq!(select_tier(&tiers, 10.0).tier, "small");
        assert_eq!(select_tier(&tiers, 0.0).tier, "small");
        // Nothing qualifies below zero; fall back to the smallest.
        assert_eq!(select_tier(&tiers, -20.0).tier, "small");
    }

    #[test]
    fn test_model_override_wins() {
        assert_eq!(model_for_tier("openai", "large", Some("my-model")), "my-model");
        assert_eq!(model_for_tier("openai", "small", None), "gpt-4o-mini");
        assert_eq!(model_for_tier("ollama", "medium", None), "llama3.2:3b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_reports_net_cost() {
        let provider = Arc::new(ScriptedProvider::new(0));
        let regulator = Arc::new(EnergyRegulator::new(10.0));
        let gateway = gateway_with(Arc::clone(&provider), regulator);

        let reply = gateway
            .invoke(vec![ChatMessage::system("rules"), ChatMessage::user("hi")], Vec::new(), false)
            .await;

        assert_eq!(reply.content, "ok");
        assert_eq!(reply.model_tier, "large");
        // Elapsed wall time is near zero here, so the net cost is close
        // to the nominal charge.
        assert!((reply.energy_consumed - 10.0).abs() < 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let provider = Arc::new(ScriptedProvider::new(2));
        let regulator = Arc::new(EnergyRegulator::new(10.0));
        let gateway = gateway_with(Arc::clone(&provider), regulator);

        let reply = gateway.invoke(vec![ChatMessage::user("hi")], Vec::new(), false).await;
        assert_eq!(reply.content, "ok");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_degrades_to_fallback() {
        let provider = Arc::new(ScriptedProvider::new(u32::MAX));
        let regulator = Arc::new(EnergyRegulator::new(10.0));
        regulator.consume(60.0); // 40 left -> medium tier
        let gateway = gateway_with(Arc::clone(&provider), regulator);

        let reply = gateway.invoke(vec![ChatMessage::user("hi")], Vec::new(), false).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
        assert_eq!(reply.content, FALLBACK_CONTENT);
        assert_eq!(reply.model_tier, "medium");
        // Full nominal charge even though nothing came back.
        assert_eq!(reply.energy_consumed, 5.0);
        assert!(reply.tool_calls.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_urgency_rewrites_system_and_shrinks_output() {
        let provider = Arc::new(ScriptedProvider::new(0));
        let regulator = Arc::new(EnergyRegulator::new(10.0));
        let gateway = gateway_with(Arc::clone(&provider), regulator);

        gateway
            .invoke(vec![ChatMessage::system("calm rules"), ChatMessage::user("hi")], Vec::new(), true)
            .await;

        let captured = provider.captured.lock().unwrap();
        let (messages, options) = &captured[0];
        assert_eq!(messages[0].content, URGENT_SYSTEM_TEXT);
        assert_eq!(options.max_tokens, URGENT_MAX_TOKENS);
        assert!(options.temperature < TEMPERATURE);
    }
}
