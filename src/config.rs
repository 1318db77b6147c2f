//! Configuration
//!
//! Environment-driven configuration with CLI overrides layered on top by
//! the binary. Bad values here are fatal: the process must refuse to
//! start rather than run misconfigured.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::types::{default_config, VigilConfig};

/// Load configuration from process environment variables.
pub fn load_from_env() -> Result<VigilConfig> {
    apply(default_config(), |key| env::var(key).ok())
}

/// Merge recognized variables from `get` over `config`.
fn apply<F>(mut config: VigilConfig, get: F) -> Result<VigilConfig>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get("PORT") {
        let port: u32 = raw.parse().with_context(|| format!("invalid PORT: {raw}"))?;
        if !(1..=65_535).contains(&port) {
            anyhow::bail!("PORT out of range (1-65535): {port}");
        }
        config.port = port as u16;
    }

    if let Some(raw) = get("MAX_MESSAGE_LENGTH") {
        config.max_message_length = raw
            .parse()
            .with_context(|| format!("invalid MAX_MESSAGE_LENGTH: {raw}"))?;
    }

    if let Some(url) = get("PROVIDER_BASE_URL") {
        config.provider_base_url = url;
    }
    if let Some(key) = get("PROVIDER_API_KEY") {
        config.provider_api_key = key;
    }
    if let Some(provider) = get("AI_PROVIDER") {
        config.provider = provider;
    }
    if let Some(model) = get("AI_MODEL") {
        if !model.is_empty() {
            config.model_override = Some(model);
        }
    }

    if let Some(raw) = get("REPLENISH_RATE") {
        let rate: f64 = raw
            .parse()
            .with_context(|| format!("invalid REPLENISH_RATE: {raw}"))?;
        if rate <= 0.0 {
            anyhow::bail!("REPLENISH_RATE must be positive: {rate}");
        }
        config.replenish_rate = rate;
    }

    if let Some(raw) = get("DURATION") {
        let secs: u64 = raw.parse().with_context(|| format!("invalid DURATION: {raw}"))?;
        config.duration_secs = Some(secs);
    }

    if let Some(raw) = get("DEBUG") {
        config.debug = matches!(raw.as_str(), "1" | "true" | "yes");
    }

    if let Some(path) = get("DB_PATH") {
        config.db_path = path;
    }

    Ok(config)
}

/// Resolve a path that may start with `~` to an absolute path.
pub fn resolve_path(p: &str) -> String {
    if let Some(rest) = p.strip_prefix('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        home.join(rest).to_string_lossy().to_string()
    } else {
        p.to_string()
    }
}
