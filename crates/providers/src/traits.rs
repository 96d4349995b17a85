use va_domain::capability::LlmCapabilities;
use va_domain::error::Result;
use va_domain::stream::{BoxStream, StreamEvent};
use va_domain::tool::{Message, ToolDefinition};

/// A provider-agnostic streaming chat request.
///
/// Mirrors the Adapter's uniform interface: messages, the tool enumeration,
/// a separate `system` field (providers that want it inline fold it into
/// the first message themselves), and a response length cap.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub system: Option<String>,
    pub max_output_tokens: Option<u32>,
    /// Model identifier override. `None` uses the provider's configured default.
    pub model: Option<String>,
}

/// Trait every LLM adapter implements. Streaming-only: the Agent Loop never
/// needs a non-streaming round trip, and a provider-agnostic caller must
/// never branch on which adapter it holds.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    fn capabilities(&self) -> &LlmCapabilities;

    fn provider_id(&self) -> &str;
}
