//! Provider selection.
//!
//! Exactly one active provider, chosen at startup from [`LlmConfig`]. There
//! is no role system and no multi-provider fallback: callers only ever talk
//! to one adapter.

use std::sync::Arc;

use va_domain::config::{LlmConfig, ProviderKind};
use va_domain::error::Result;

use crate::anthropic::AnthropicProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

/// Build the configured provider adapter.
pub fn build_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match config.provider {
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(
            config.api_key.clone(),
            config.base_url.clone(),
            config.model.clone(),
        )?),
        ProviderKind::OpenAiCompat => Arc::new(OpenAiCompatProvider::new(
            config.api_key.clone(),
            config.base_url.clone(),
            config.model.clone(),
        )?),
    };

    tracing::info!(provider = provider.provider_id(), model = %config.model, "llm provider initialized");

    Ok(provider)
}
