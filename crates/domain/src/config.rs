//! Environment-derived configuration, read once at startup and immutable
//! thereafter. No REST-configurable surface — a missing required field is a
//! `FatalConfigurationError` that aborts startup before the listener binds.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub store: StoreConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct SttConfig {
    pub url: String,
    pub api_key: String,
    /// Max connection attempts before giving up and closing the session.
    pub max_reconnect_attempts: u32,
    pub reconnect_gap_ms: u64,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: String,
    pub cost_table: HashMap<String, ModelPricing>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenAiCompat,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" => Ok(ProviderKind::Anthropic),
            "openai" | "openai_compat" | "openai-compat" => Ok(ProviderKind::OpenAiCompat),
            other => Err(Error::Config(format!(
                "unknown LLM provider '{other}': expected 'anthropic' or 'openai'"
            ))),
        }
    }
}

/// Four-rate pricing table: regular input, cache-write input, cache-read
/// input, and output, each in dollars per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1m: f64,
    pub cache_write_per_1m: f64,
    pub cache_read_per_1m: f64,
    pub output_per_1m: f64,
}

impl ModelPricing {
    pub fn estimate_cost(&self, usage: &crate::stream::Usage) -> f64 {
        (usage.input_tokens as f64 / 1_000_000.0) * self.input_per_1m
            + (usage.cache_write_tokens as f64 / 1_000_000.0) * self.cache_write_per_1m
            + (usage.cache_read_tokens as f64 / 1_000_000.0) * self.cache_read_per_1m
            + (usage.output_tokens as f64 / 1_000_000.0) * self.output_per_1m
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: std::path::PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct AgentConfig {
    /// History messages loaded per invocation (spec: k ≈ 2–5).
    pub history_window: usize,
    /// Tool-calling loop cap (spec: typically 3).
    pub max_iterations: u32,
    pub turn_timeout_ms: u64,
    /// Transcript length above which an in-flight turn is interrupted.
    pub interrupt_threshold_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            history_window: 4,
            max_iterations: 3,
            turn_timeout_ms: 30_000,
            interrupt_threshold_chars: 5,
        }
    }
}

fn env_var(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| Error::Config(format!("missing required env var {name}")))
}

fn env_var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from the process environment. Fails fast with a
    /// `Config` error (mapped to `FatalConfigurationError` by the caller)
    /// when a required variable is absent.
    pub fn from_env() -> Result<Self> {
        let server = ServerConfig {
            host: env_var_or("VA_HOST", "0.0.0.0"),
            port: env_var_or("VA_PORT", "8080")
                .parse()
                .map_err(|e| Error::Config(format!("VA_PORT: {e}")))?,
        };

        let stt = SttConfig {
            url: env_var("VA_STT_URL")?,
            api_key: env_var("VA_STT_API_KEY")?,
            max_reconnect_attempts: 3,
            reconnect_gap_ms: 500,
        };

        let provider = ProviderKind::parse(&env_var_or("VA_LLM_PROVIDER", "anthropic"))?;
        let llm = LlmConfig {
            provider,
            api_key: env_var("VA_LLM_API_KEY")?,
            base_url: std::env::var("VA_LLM_BASE_URL").ok(),
            model: env_var_or("VA_LLM_MODEL", default_model(provider)),
            cost_table: load_cost_table(std::env::var("VA_COST_TABLE_PATH").ok())?,
        };

        let store = StoreConfig {
            db_path: env_var_or("VA_DB_PATH", "./data").into(),
        };

        Ok(Config {
            server,
            stt,
            llm,
            store,
            agent: AgentConfig::default(),
        })
    }
}

fn default_model(provider: ProviderKind) -> &'static str {
    match provider {
        ProviderKind::Anthropic => "claude-sonnet-4-5-20250929",
        ProviderKind::OpenAiCompat => "gpt-4o",
    }
}

fn load_cost_table(path: Option<String>) -> Result<HashMap<String, ModelPricing>> {
    let mut table = default_cost_table();
    if let Some(path) = path {
        let text = std::fs::read_to_string(&path)?;
        let overrides: HashMap<String, ModelPricing> = serde_json::from_str(&text)?;
        table.extend(overrides);
    }
    Ok(table)
}

fn default_cost_table() -> HashMap<String, ModelPricing> {
    let mut m = HashMap::new();
    m.insert(
        "claude-sonnet-4-5-20250929".to_string(),
        ModelPricing {
            input_per_1m: 3.0,
            cache_write_per_1m: 3.75,
            cache_read_per_1m: 0.3,
            output_per_1m: 15.0,
        },
    );
    m.insert(
        "gpt-4o".to_string(),
        ModelPricing {
            input_per_1m: 2.5,
            cache_write_per_1m: 2.5,
            cache_read_per_1m: 1.25,
            output_per_1m: 10.0,
        },
    );
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_cost_weights_all_four_rates() {
        let pricing = ModelPricing {
            input_per_1m: 1.0,
            cache_write_per_1m: 2.0,
            cache_read_per_1m: 0.5,
            output_per_1m: 4.0,
        };
        let usage = crate::stream::Usage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            cache_read_tokens: 1_000_000,
            cache_write_tokens: 1_000_000,
        };
        let cost = pricing.estimate_cost(&usage);
        assert!((cost - 7.5).abs() < 1e-9);
    }

    #[test]
    fn provider_kind_parses_known_aliases() {
        assert_eq!(ProviderKind::parse("anthropic").unwrap(), ProviderKind::Anthropic);
        assert_eq!(ProviderKind::parse("openai").unwrap(), ProviderKind::OpenAiCompat);
        assert_eq!(ProviderKind::parse("OPENAI-COMPAT").unwrap(), ProviderKind::OpenAiCompat);
    }

    #[test]
    fn provider_kind_rejects_unknown() {
        assert!(ProviderKind::parse("bedrock").is_err());
    }

    #[test]
    fn default_cost_table_has_entries_for_default_models() {
        let table = default_cost_table();
        assert!(table.contains_key("claude-sonnet-4-5-20250929"));
        assert!(table.contains_key("gpt-4o"));
    }
}
