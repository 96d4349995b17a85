//! Cross-module behavior: `build_provider` selects and constructs the
//! right adapter from `LlmConfig` alone, exercising `registry.rs` together
//! with both concrete adapters and the shared `LlmProvider` trait.

use std::collections::HashMap;

use va_domain::capability::ToolSupport;
use va_domain::config::{LlmConfig, ProviderKind};
use va_providers::LlmProvider;

fn base_config(provider: ProviderKind) -> LlmConfig {
    LlmConfig {
        provider,
        api_key: "test-key".to_string(),
        base_url: None,
        model: "test-model".to_string(),
        cost_table: HashMap::new(),
    }
}

#[test]
fn build_provider_selects_anthropic() {
    let config = base_config(ProviderKind::Anthropic);
    let provider = va_providers::build_provider(&config).expect("anthropic provider builds");

    assert_eq!(provider.provider_id(), "anthropic");
    assert_eq!(provider.capabilities().supports_tools, ToolSupport::StrictJson);
    assert!(provider.capabilities().supports_streaming);
}

#[test]
fn build_provider_selects_openai_compat() {
    let config = base_config(ProviderKind::OpenAiCompat);
    let provider = va_providers::build_provider(&config).expect("openai_compat provider builds");

    assert_eq!(provider.provider_id(), "openai_compat");
    assert!(provider.capabilities().supports_json_mode);
}

#[test]
fn build_provider_respects_custom_base_url() {
    let mut config = base_config(ProviderKind::OpenAiCompat);
    config.base_url = Some("http://localhost:11434/v1/".to_string());
    let provider = va_providers::build_provider(&config).expect("provider builds with custom base url");

    assert_eq!(provider.provider_id(), "openai_compat");
}
