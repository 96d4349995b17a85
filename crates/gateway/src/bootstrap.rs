//! Process startup: load configuration, open the stores, build the LLM
//! provider. A failure here is a `FatalConfigurationError` — the process
//! refuses to start rather than serve with a broken dependency.

use std::sync::Arc;

use va_domain::config::Config;
use va_store::{HistoryStore, TaskStore};

use crate::runtime::CancelMap;
use crate::state::AppState;

pub fn build_app_state() -> anyhow::Result<AppState> {
    let config = Config::from_env()?;
    tracing::info!(host = %config.server.host, port = config.server.port, provider = ?config.llm.provider, "configuration loaded");

    let llm = va_providers::build_provider(&config.llm)?;
    let task_store = TaskStore::open(&config.store.db_path)?;
    let history_store = HistoryStore::open(&config.store.db_path)?;

    Ok(AppState {
        config: Arc::new(config),
        llm,
        task_store: Arc::new(task_store),
        history_store: Arc::new(history_store),
        cancel_map: Arc::new(CancelMap::new()),
    })
}
