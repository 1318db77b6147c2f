//! Vigil - Type Definitions
//!
//! Shared types for the energy-regulated agent runtime: chat wire shapes,
//! conversation records, energy tags, events, and the sub-agent protocol.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ─── Energy ──────────────────────────────────────────────────────

/// Floor of the energy scale. Deep deficit; the regulator never goes below.
pub const ENERGY_MIN: f64 = -50.0;

/// Ceiling of the energy scale. A full bucket.
pub const ENERGY_MAX: f64 = 100.0;

/// Five-valued tag derived from the current energy level.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnergyStatus {
    High,
    Medium,
    Low,
    Depleted,
    Urgent,
}

impl EnergyStatus {
    /// The status word used in prompts and HTTP payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnergyStatus::High => "high",
            EnergyStatus::Medium => "medium",
            EnergyStatus::Low => "low",
            EnergyStatus::Depleted => "depleted",
            EnergyStatus::Urgent => "urgent",
        }
    }
}

// ─── Configuration ───────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VigilConfig {
    pub port: u16,
    pub max_message_length: usize,
    pub provider_base_url: String,
    pub provider_api_key: String,
    /// Provider tag selecting the tier-to-model table (`openai`, `openrouter`, `ollama`).
    pub provider: String,
    /// When set, every tier resolves to this single model id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    /// Energy units regained per second of sleep.
    pub replenish_rate: f64,
    /// Optional wall-clock bound on the whole run, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    pub debug: bool,
    pub db_path: String,
    pub rate_limit_per_minute: u32,
}

/// Defaults for every field a caller does not override.
pub fn default_config() -> VigilConfig {
    VigilConfig {
        port: 6740,
        max_message_length: 10_000,
        provider_base_url: "https://api.openai.com".to_string(),
        provider_api_key: String::new(),
        provider: "openai".to_string(),
        model_override: None,
        replenish_rate: 1.0,
        duration_secs: None,
        debug: false,
        db_path: "~/.vigil/conversations.db".to_string(),
        rate_limit_per_minute: 100,
    }
}

// ─── Chat Wire Shapes ────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// Per-call options handed to a [`ChatProvider`].
#[derive(Clone, Debug)]
pub struct ChatOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Tool definitions in the provider's function-calling format.
    pub tools: Vec<serde_json::Value>,
    pub timeout_secs: u64,
}

/// A tool invocation requested by the model. Arguments stay a raw JSON
/// string until the dispatcher validates them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A completed chat call as returned by the provider.
#[derive(Clone, Debug)]
pub struct ChatCompletion {
    pub content: String,
    pub model: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: TokenUsage,
}

/// Transport abstraction over an OpenAI-compatible chat endpoint.
/// The gateway owns retry, tiering, and energy accounting; implementations
/// only move messages.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> anyhow::Result<ChatCompletion>;
}

/// What the gateway hands back to the loop for one inference.
#[derive(Clone, Debug)]
pub struct GatewayReply {
    pub content: String,
    /// Net energy cost: nominal tier cost minus wall seconds. May be
    /// negative for very fast calls; consumers pass it to the regulator
    /// unmodified.
    pub energy_consumed: f64,
    pub model_tier: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

// ─── Conversation Records ────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatus {
    Depleted,
    Exceeded,
    Within,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub id: i64,
    pub timestamp: String,
    pub content: String,
    /// Energy level observed when the response was produced.
    pub energy_level: f64,
    pub model_used: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub id: i64,
    pub timestamp: String,
    pub content: String,
    pub energy_level: f64,
    pub model_used: String,
    pub status: ApprovalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_timestamp: Option<String>,
}

/// Full projection of one conversation, including derived budget state.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub request_id: String,
    pub input_message: String,
    pub created_at: String,
    pub responses: Vec<ResponseRecord>,
    pub approvals: Vec<ApprovalRecord>,
    pub total_energy_consumed: f64,
    pub sleep_cycles: i64,
    pub ended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snooze_until: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snooze_duration_minutes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_budget: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_status: Option<BudgetStatus>,
}

/// Derived view: a conversation waiting for its first answer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    pub request_id: String,
    pub content: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_budget: Option<f64>,
}

/// Short projection used by the review selection and listing endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub request_id: String,
    pub input_message: String,
    pub created_at: String,
    pub response_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_response: Option<String>,
    pub total_energy_consumed: f64,
    pub ended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_budget: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_status: Option<BudgetStatus>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_conversations: i64,
    pub total_responses: i64,
    pub total_energy_consumed: f64,
    pub average_energy_level: f64,
    /// Conversations whose latest response was produced in deficit.
    pub urgent_count: i64,
}

// ─── Loop Signals ────────────────────────────────────────────────

/// What ingress (and the admin endpoints) push at the cognitive loop.
#[derive(Clone, Debug)]
pub enum LoopSignal {
    /// A new user message was stored under this request id.
    NewMessage(String),
    /// Focus the next iteration on this conversation.
    Focus(String),
    /// Force a review iteration now.
    Reflect,
}

// ─── Events ──────────────────────────────────────────────────────

/// Lifecycle events published on every material state change.
/// Publishing is best-effort and never affects correctness.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    EnergyUpdate { energy: f64, percentage: i64, status: EnergyStatus },
    ConversationCreated { request_id: String },
    MessageAdded { request_id: String, model: String },
    ConversationStateChanged { request_id: String, state: String },
    ModelSwitched { from: String, to: String },
    SleepStart { seconds: f64 },
    SleepEnd { energy: f64 },
    ToolInvocation { name: String, request_id: Option<String> },
}

// ─── Sub-Agent Protocol ──────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// Lifecycle operation on the external tool source.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ToolSourceAction {
    Add { name: String, endpoint: String },
    Remove { name: String },
    Test { name: String },
    List,
    Search { query: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentRequest {
    pub id: String,
    pub priority: Priority,
    #[serde(flatten)]
    pub action: ToolSourceAction,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    pub state: RequestState,
    /// 0-100.
    pub progress: u8,
}

/// Outbound messages the sub-agent publishes for the main loop to drain.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubAgentMessage {
    StatusUpdate { request_id: String, data: serde_json::Value },
    Completion { request_id: String, data: serde_json::Value },
    Error { request_id: String, data: serde_json::Value },
    Log { request_id: String, data: serde_json::Value },
}

/// A tool offered by an external source, in provider function format.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub source: String,
}

/// Generic external tool source. Everything beyond this thin contract
/// (federation, transport, auth) is out of scope.
#[async_trait]
pub trait ExternalToolSource: Send + Sync {
    async fn add_source(&self, name: &str, endpoint: &str) -> anyhow::Result<Vec<ExternalTool>>;
    async fn remove_source(&self, name: &str) -> anyhow::Result<()>;
    async fn test_source(&self, name: &str) -> anyhow::Result<bool>;
    async fn list_tools(&self) -> anyhow::Result<Vec<ExternalTool>>;
    async fn search_tools(&self, query: &str) -> anyhow::Result<Vec<ExternalTool>>;
    async fn call_tool(&self, name: &str, arguments: &serde_json::Value) -> anyhow::Result<String>;
}
