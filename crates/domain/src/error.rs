/// Shared error type used across the voice assistant crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("tool validation: {0}")]
    ToolValidation(String),

    #[error("tool execution: {0}")]
    ToolExecution(String),

    #[error("conversation history corrupted: {0}")]
    CorruptedHistory(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether retrying the same operation once more is worthwhile.
    ///
    /// Matches the Agent Loop's single-retry-then-surface policy: transient
    /// network/provider hiccups are retriable, everything else is not.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Http(_) | Error::Provider { .. }
        )
    }
}
