//! Chat Transport
//!
//! HTTP client for an OpenAI-compatible /v1/chat/completions endpoint.
//! Pure transport: the gateway above it owns tiering, retry, and energy
//! accounting.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::types::{ChatCompletion, ChatMessage, ChatOptions, ChatProvider, TokenUsage, ToolCallRequest};

pub struct HttpChatProvider {
    base_url: String,
    api_key: String,
    http: Client,
}

impl HttpChatProvider {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http: Client::new(),
        }
    }
}

#[async_trait]
impl ChatProvider for HttpChatProvider {
    async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatCompletion> {
        // Newer OpenAI models take max_completion_tokens instead of max_tokens.
        let uses_completion_tokens = regex::Regex::new(r"^(o[1-9]|gpt-5|gpt-4\.1)")
            .map(|re| re.is_match(&options.model))
            .unwrap_or(false);

        let mut body = serde_json::json!({
            "model": options.model,
            "messages": messages,
            "stream": false,
            "temperature": options.temperature,
        });

        if uses_completion_tokens {
            body["max_completion_tokens"] = serde_json::json!(options.max_tokens);
        } else {
            body["max_tokens"] = serde_json::json!(options.max_tokens);
        }

        if !options.tools.is_empty() {
            body["tools"] = serde_json::json!(options.tools);
            body["tool_choice"] = serde_json::json!("auto");
        }

        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut request = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(options.timeout_secs))
            .header("Content-Type", "application/json")
            .json(&body);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let resp = request.send().await.context("chat request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("chat error: {}: {}", status.as_u16(), text);
        }

        let data: Value = resp.json().await.context("failed to parse chat response")?;

        let choice = data["choices"]
            .get(0)
            .ok_or_else(|| anyhow::anyhow!("no completion choice returned"))?;
        let message = &choice["message"];

        let tool_calls: Vec<ToolCallRequest> = message["tool_calls"]
            .as_array()
            .map(|tcs| {
                tcs.iter()
                    .map(|tc| ToolCallRequest {
                        id: tc["id"].as_str().unwrap_or("").to_string(),
                        name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                        arguments: tc["function"]["arguments"].as_str().unwrap_or("{}").to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let usage = TokenUsage {
            prompt_tokens: data["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: data["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: data["usage"]["total_tokens"].as_u64().unwrap_or(0),
        };

        Ok(ChatCompletion {
            content: message["content"].as_str().unwrap_or("").to_string(),
            model: data["model"].as_str().unwrap_or(&options.model).to_string(),
            tool_calls,
            usage,
        })
    }
}
