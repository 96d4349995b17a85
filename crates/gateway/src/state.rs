//! Process-wide shared state handed to every axum handler.

use std::sync::Arc;

use va_domain::config::Config;
use va_providers::LlmProvider;
use va_store::{HistoryStore, TaskStore};

use crate::runtime::CancelMap;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub llm: Arc<dyn LlmProvider>,
    pub task_store: Arc<TaskStore>,
    pub history_store: Arc<HistoryStore>,
    pub cancel_map: Arc<CancelMap>,
}
