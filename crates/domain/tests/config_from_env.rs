//! Cross-module behavior: `Config::from_env` reads every sub-config
//! (server/stt/llm/store) from the process environment in one pass and
//! fails fast when a required variable is missing.

use std::sync::Mutex;

use va_domain::config::{Config, ProviderKind};

// `std::env` is process-global; serialize the tests in this file so one
// test's vars can't bleed into another's assertions.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_va_vars() {
    for key in [
        "VA_HOST",
        "VA_PORT",
        "VA_STT_URL",
        "VA_STT_API_KEY",
        "VA_LLM_PROVIDER",
        "VA_LLM_API_KEY",
        "VA_LLM_BASE_URL",
        "VA_LLM_MODEL",
        "VA_COST_TABLE_PATH",
        "VA_DB_PATH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn from_env_builds_full_config_with_defaults_filled_in() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_va_vars();

    std::env::set_var("VA_STT_URL", "wss://stt.example.com/v1/listen");
    std::env::set_var("VA_STT_API_KEY", "stt-secret");
    std::env::set_var("VA_LLM_API_KEY", "llm-secret");

    let config = Config::from_env().expect("required vars are set");

    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.server.port, 8080);
    assert_eq!(config.stt.url, "wss://stt.example.com/v1/listen");
    assert_eq!(config.llm.provider, ProviderKind::Anthropic);
    assert_eq!(config.llm.model, "claude-sonnet-4-5-20250929");
    assert!(config.llm.cost_table.contains_key(&config.llm.model));

    clear_va_vars();
}

#[test]
fn from_env_honors_explicit_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_va_vars();

    std::env::set_var("VA_HOST", "127.0.0.1");
    std::env::set_var("VA_PORT", "9000");
    std::env::set_var("VA_STT_URL", "wss://stt.example.com/v1/listen");
    std::env::set_var("VA_STT_API_KEY", "stt-secret");
    std::env::set_var("VA_LLM_PROVIDER", "openai");
    std::env::set_var("VA_LLM_API_KEY", "llm-secret");
    std::env::set_var("VA_LLM_MODEL", "gpt-4o-mini");

    let config = Config::from_env().expect("required vars are set");

    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 9000);
    assert_eq!(config.llm.provider, ProviderKind::OpenAiCompat);
    assert_eq!(config.llm.model, "gpt-4o-mini");

    clear_va_vars();
}

#[test]
fn from_env_fails_fast_when_stt_url_missing() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_va_vars();

    std::env::set_var("VA_STT_API_KEY", "stt-secret");
    std::env::set_var("VA_LLM_API_KEY", "llm-secret");

    let result = Config::from_env();
    assert!(result.is_err());

    clear_va_vars();
}

#[test]
fn from_env_rejects_unknown_llm_provider() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_va_vars();

    std::env::set_var("VA_STT_URL", "wss://stt.example.com/v1/listen");
    std::env::set_var("VA_STT_API_KEY", "stt-secret");
    std::env::set_var("VA_LLM_PROVIDER", "bedrock");
    std::env::set_var("VA_LLM_API_KEY", "llm-secret");

    let result = Config::from_env();
    assert!(result.is_err());

    clear_va_vars();
}
