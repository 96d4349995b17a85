//! The Agent Loop: turns one user query into a streamed, tool-using
//! conversation with the LLM Adapter, persisting the result to History.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use va_domain::config::{AgentConfig, ModelPricing};
use va_domain::error::{Error, Result};
use va_domain::history::{ConversationMessage, MessageRole, ToolResultRecord};
use va_domain::stream::{StreamEvent, Usage};
use va_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
use va_providers::{ChatRequest, LlmProvider};
use va_store::history_store::validate_turn_sequence;
use va_store::{HistoryStore, TaskStore};

use super::cancel::CancelToken;
use super::tools::{build_tool_definitions, dispatch_tool};

/// Events forwarded to the Session Orchestrator as the loop progresses.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Text { text: String },
    ToolUseStart { name: String },
    ToolUse { name: String, args: Value },
    ToolResult { name: String, envelope: Value },
    UiCommand(Value),
    Done { cost_usd: f64 },
    Error { message: String },
}

struct IterationOutcome {
    tool_calls: Vec<ToolCall>,
    tool_results: Vec<ToolResultRecord>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    cancelled: bool,
    error: Option<Error>,
}

pub struct AgentLoop {
    pub llm: Arc<dyn LlmProvider>,
    pub task_store: Arc<TaskStore>,
    pub history_store: Arc<HistoryStore>,
    pub agent_config: AgentConfig,
    pub cost_table: HashMap<String, ModelPricing>,
    pub model: String,
}

impl AgentLoop {
    pub async fn run(&self, user_query: String, cancel: CancelToken, emit: mpsc::UnboundedSender<AgentEvent>) -> Result<()> {
        let mut tail = self.history_store.tail(self.agent_config.history_window);
        if !validate_turn_sequence(&tail) {
            tracing::warn!("history window failed structural validation, clearing");
            self.history_store.clear()?;
            tail = Vec::new();
        }

        self.history_store.append(MessageRole::User, user_query.clone(), None, None)?;

        let tool_defs = build_tool_definitions();
        let system_prompt = build_system_prompt(Utc::now(), &tool_defs);

        let mut messages: Vec<Message> = tail.iter().map(history_message_to_llm).collect();
        messages.push(Message::user(user_query));

        let mut assistant_text = String::new();
        let mut all_tool_calls: Vec<ToolCall> = Vec::new();
        let mut all_tool_results: Vec<ToolResultRecord> = Vec::new();
        let mut total_usage = Usage::default();

        for _ in 0..self.agent_config.max_iterations {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let req = ChatRequest {
                messages: messages.clone(),
                tools: tool_defs.clone(),
                system: Some(system_prompt.clone()),
                max_output_tokens: None,
                model: Some(self.model.clone()),
            };

            let outcome = match self.stream_with_retry(&req, &cancel, &emit, &mut assistant_text).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let _ = emit.send(AgentEvent::Error { message: e.to_string() });
                    self.history_store.clear()?;
                    return Err(e);
                }
            };

            if outcome.cancelled {
                return Ok(());
            }

            if let Some(usage) = outcome.usage {
                total_usage.merge(&usage);
            }

            all_tool_calls.extend(outcome.tool_calls.clone());
            all_tool_results.extend(outcome.tool_results.clone());

            if !outcome.tool_calls.is_empty() {
                messages.push(Message {
                    role: Role::Assistant,
                    content: MessageContent::Parts(
                        outcome
                            .tool_calls
                            .iter()
                            .map(|c| ContentPart::ToolUse {
                                id: c.call_id.clone(),
                                name: c.tool_name.clone(),
                                input: c.arguments.clone(),
                            })
                            .collect(),
                    ),
                });
                messages.push(Message {
                    role: Role::Tool,
                    content: MessageContent::Parts(
                        outcome
                            .tool_results
                            .iter()
                            .map(|r| ContentPart::ToolResult {
                                tool_use_id: r.call_id.clone(),
                                content: r.result.to_string(),
                                is_error: false,
                            })
                            .collect(),
                    ),
                });
            }

            if outcome.finish_reason.as_deref() != Some("tool_use") {
                break;
            }
        }

        if !assistant_text.is_empty() || !all_tool_calls.is_empty() {
            let tool_calls = if all_tool_calls.is_empty() { None } else { Some(all_tool_calls) };
            self.history_store.append(MessageRole::Assistant, assistant_text, tool_calls, None)?;
        }
        if !all_tool_results.is_empty() {
            self.history_store.append(MessageRole::User, String::new(), None, Some(all_tool_results))?;
        }

        let cost_usd = self
            .cost_table
            .get(&self.model)
            .map(|pricing| pricing.estimate_cost(&total_usage))
            .unwrap_or(0.0);
        let _ = emit.send(AgentEvent::Done { cost_usd });

        Ok(())
    }

    /// Runs one iteration's stream to completion, retrying once (reusing
    /// the same message list) on a transport/provider failure. A second
    /// failure is surfaced to the caller.
    async fn stream_with_retry(
        &self,
        req: &ChatRequest,
        cancel: &CancelToken,
        emit: &mpsc::UnboundedSender<AgentEvent>,
        assistant_text: &mut String,
    ) -> Result<IterationOutcome> {
        let mut last_err = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            match self.run_iteration(req, cancel, emit, assistant_text).await {
                Ok(outcome) if outcome.error.is_none() => return Ok(outcome),
                Ok(outcome) => {
                    last_err = outcome.error;
                }
                Err(e) => {
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(Error::Other("llm stream failed with no error detail".into())))
    }

    async fn run_iteration(
        &self,
        req: &ChatRequest,
        cancel: &CancelToken,
        emit: &mpsc::UnboundedSender<AgentEvent>,
        assistant_text: &mut String,
    ) -> Result<IterationOutcome> {
        let mut stream = self.llm.chat_stream(req).await?;

        let mut tool_calls = Vec::new();
        let mut tool_results = Vec::new();
        let mut finish_reason = None;
        let mut usage = None;
        let mut error = None;

        while let Some(event) = stream.next().await {
            if cancel.is_cancelled() {
                return Ok(IterationOutcome { tool_calls, tool_results, finish_reason, usage, cancelled: true, error: None });
            }

            match event {
                Ok(StreamEvent::Token { text }) => {
                    assistant_text.push_str(&text);
                    let _ = emit.send(AgentEvent::Text { text });
                }
                Ok(StreamEvent::ToolCallStarted { tool_name, .. }) => {
                    let _ = emit.send(AgentEvent::ToolUseStart { name: tool_name });
                }
                Ok(StreamEvent::ToolCallDelta { .. }) => {}
                Ok(StreamEvent::ToolCallFinished { call_id, tool_name, arguments }) => {
                    let _ = emit.send(AgentEvent::ToolUse { name: tool_name.clone(), args: arguments.clone() });

                    let envelope = dispatch_tool(&tool_name, &arguments, &self.task_store, &self.history_store);

                    if let Some(cmd) = envelope.get("ui_command").cloned() {
                        let _ = emit.send(AgentEvent::UiCommand(cmd));
                    }
                    let _ = emit.send(AgentEvent::ToolResult { name: tool_name.clone(), envelope: envelope.clone() });

                    tool_calls.push(ToolCall { call_id: call_id.clone(), tool_name: tool_name.clone(), arguments: arguments.clone() });
                    tool_results.push(ToolResultRecord { call_id, tool_name, arguments, result: envelope });
                }
                Ok(StreamEvent::Done { usage: u, finish_reason: fr }) => {
                    usage = u;
                    finish_reason = fr;
                }
                Ok(StreamEvent::Error { message }) => {
                    error = Some(Error::Provider { provider: self.llm.provider_id().to_string(), message });
                }
                Err(e) => {
                    error = Some(e);
                }
            }
        }

        Ok(IterationOutcome { tool_calls, tool_results, finish_reason, usage, cancelled: false, error })
    }
}

fn history_message_to_llm(msg: &ConversationMessage) -> Message {
    if let Some(tool_results) = &msg.tool_results {
        let parts = tool_results
            .iter()
            .map(|r| ContentPart::ToolResult {
                tool_use_id: r.call_id.clone(),
                content: r.result.to_string(),
                is_error: !r.result.get("success").and_then(|v| v.as_bool()).unwrap_or(true),
            })
            .collect();
        return Message { role: Role::Tool, content: MessageContent::Parts(parts) };
    }

    if let Some(tool_calls) = &msg.tool_calls {
        let mut parts = Vec::new();
        if !msg.content.is_empty() {
            parts.push(ContentPart::Text { text: msg.content.clone() });
        }
        parts.extend(tool_calls.iter().map(|c| ContentPart::ToolUse {
            id: c.call_id.clone(),
            name: c.tool_name.clone(),
            input: c.arguments.clone(),
        }));
        return Message { role: Role::Assistant, content: MessageContent::Parts(parts) };
    }

    match msg.role {
        MessageRole::User => Message::user(msg.content.clone()),
        MessageRole::Assistant => Message::assistant(msg.content.clone()),
    }
}

fn build_system_prompt(now: chrono::DateTime<Utc>, tools: &[ToolDefinition]) -> String {
    let tool_names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    format!(
        "The current time is {}. Use it to resolve relative dates like \"tomorrow\" or \"next week\".\n\
         Available tools: {}.\n\
         Reply concisely. When the user asks to see, filter, or search their tasks, call the \
         appropriate tool so the UI view updates instead of just describing the tasks in text.",
        now.to_rfc3339(),
        tool_names.join(", "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_message_without_tool_fields_maps_by_role() {
        let msg = ConversationMessage {
            id: 0,
            role: MessageRole::User,
            content: "hello".into(),
            tool_calls: None,
            tool_results: None,
            created_at: Utc::now(),
        };
        let llm_msg = history_message_to_llm(&msg);
        assert_eq!(llm_msg.role, Role::User);
        assert_eq!(llm_msg.content.extract_all_text(), "hello");
    }

    #[test]
    fn history_message_with_tool_calls_becomes_assistant_parts() {
        let msg = ConversationMessage {
            id: 0,
            role: MessageRole::Assistant,
            content: "checking...".into(),
            tool_calls: Some(vec![ToolCall {
                call_id: "c1".into(),
                tool_name: "list_tasks".into(),
                arguments: serde_json::json!({}),
            }]),
            tool_results: None,
            created_at: Utc::now(),
        };
        let llm_msg = history_message_to_llm(&msg);
        assert_eq!(llm_msg.role, Role::Assistant);
        match llm_msg.content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 2),
            other => panic!("expected Parts, got {other:?}"),
        }
    }

    #[test]
    fn history_message_with_tool_results_becomes_tool_role() {
        let msg = ConversationMessage {
            id: 0,
            role: MessageRole::User,
            content: String::new(),
            tool_calls: None,
            tool_results: Some(vec![ToolResultRecord {
                call_id: "c1".into(),
                tool_name: "list_tasks".into(),
                arguments: serde_json::json!({}),
                result: serde_json::json!({"success": true}),
            }]),
            created_at: Utc::now(),
        };
        let llm_msg = history_message_to_llm(&msg);
        assert_eq!(llm_msg.role, Role::Tool);
    }

    #[test]
    fn system_prompt_lists_every_tool_name() {
        let tools = build_tool_definitions();
        let prompt = build_system_prompt(Utc::now(), &tools);
        for tool in &tools {
            assert!(prompt.contains(&tool.name), "missing {} in system prompt", tool.name);
        }
    }
}

#[cfg(test)]
mod run_tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use va_domain::capability::LlmCapabilities;
    use va_domain::stream::BoxStream;

    use super::*;

    /// A scripted [`LlmProvider`]: each call to `chat_stream` pops the next
    /// queued turn and replays it as a stream. Queuing fewer turns than
    /// `run` ends up calling is a test bug, not a runtime one — it panics.
    struct MockProvider {
        turns: StdMutex<VecDeque<Vec<Result<StreamEvent>>>>,
        capabilities: LlmCapabilities,
    }

    impl MockProvider {
        fn new(turns: Vec<Vec<Result<StreamEvent>>>) -> Self {
            Self {
                turns: StdMutex::new(turns.into_iter().collect()),
                capabilities: LlmCapabilities {
                    supports_streaming: true,
                    ..LlmCapabilities::default()
                },
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for MockProvider {
        async fn chat_stream(&self, _req: &ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            let events = self
                .turns
                .lock()
                .unwrap()
                .pop_front()
                .expect("mock provider ran out of scripted turns");
            Ok(Box::pin(futures_util::stream::iter(events)))
        }

        fn capabilities(&self) -> &LlmCapabilities {
            &self.capabilities
        }

        fn provider_id(&self) -> &str {
            "mock"
        }
    }

    fn build_agent_loop(provider: MockProvider) -> (tempfile::TempDir, AgentLoop) {
        let dir = tempfile::tempdir().unwrap();
        let task_store = TaskStore::open(dir.path()).unwrap();
        let history_store = HistoryStore::open(dir.path()).unwrap();
        let agent_loop = AgentLoop {
            llm: Arc::new(provider),
            task_store: Arc::new(task_store),
            history_store: Arc::new(history_store),
            agent_config: AgentConfig::default(),
            cost_table: HashMap::new(),
            model: "test-model".into(),
        };
        (dir, agent_loop)
    }

    fn stop_turn(text: &str) -> Vec<Result<StreamEvent>> {
        vec![
            Ok(StreamEvent::Token { text: text.to_string() }),
            Ok(StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) }),
        ]
    }

    #[tokio::test]
    async fn cancelled_turn_persists_the_user_message_but_skips_the_assistant_reply() {
        let (_dir, agent_loop) = build_agent_loop(MockProvider::new(Vec::new()));
        let cancel = CancelToken::new();
        cancel.cancel();
        let (tx, mut rx) = mpsc::unbounded_channel();

        agent_loop.run("hello".into(), cancel, tx).await.unwrap();

        let tail = agent_loop.history_store.tail(10);
        assert_eq!(tail.len(), 1, "only the user turn should be persisted");
        assert_eq!(tail[0].role, MessageRole::User);
        assert_eq!(tail[0].content, "hello");

        assert!(rx.try_recv().is_err(), "a cancelled turn must not emit Done or any other event");
    }

    #[tokio::test]
    async fn corrupted_history_is_cleared_before_the_next_turn_runs() {
        let (_dir, agent_loop) = build_agent_loop(MockProvider::new(vec![stop_turn("hi there")]));

        agent_loop
            .history_store
            .append(
                MessageRole::Assistant,
                "looking that up".into(),
                Some(vec![ToolCall {
                    call_id: "c1".into(),
                    tool_name: "list_tasks".into(),
                    arguments: serde_json::json!({}),
                }]),
                None,
            )
            .unwrap();

        let cancel = CancelToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        agent_loop.run("what's next".into(), cancel, tx).await.unwrap();

        let tail = agent_loop.history_store.tail(10);
        assert_eq!(tail.len(), 2, "the unanswered tool call must be cleared, not carried forward");
        assert_eq!(tail[0].role, MessageRole::User);
        assert_eq!(tail[0].content, "what's next");
        assert_eq!(tail[1].role, MessageRole::Assistant);
        assert_eq!(tail[1].content, "hi there");

        let mut saw_done = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, AgentEvent::Done { .. }) {
                saw_done = true;
            }
        }
        assert!(saw_done, "a completed turn must emit Done");
    }

    #[tokio::test]
    async fn tool_use_turn_dispatches_the_tool_and_continues_to_a_final_reply() {
        let tool_call_turn = vec![
            Ok(StreamEvent::ToolCallStarted { call_id: "c1".into(), tool_name: "list_tasks".into() }),
            Ok(StreamEvent::ToolCallFinished {
                call_id: "c1".into(),
                tool_name: "list_tasks".into(),
                arguments: serde_json::json!({}),
            }),
            Ok(StreamEvent::Done { usage: None, finish_reason: Some("tool_use".into()) }),
        ];
        let (_dir, agent_loop) = build_agent_loop(MockProvider::new(vec![tool_call_turn, stop_turn("done")]));

        let cancel = CancelToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        agent_loop.run("list my tasks".into(), cancel, tx).await.unwrap();

        let mut saw_tool_result = false;
        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::ToolResult { name, .. } = event {
                assert_eq!(name, "list_tasks");
                saw_tool_result = true;
            }
        }
        assert!(saw_tool_result, "the finished tool call must be dispatched and its result emitted");

        let tail = agent_loop.history_store.tail(10);
        assert_eq!(tail.last().unwrap().content, "done");
    }

    #[tokio::test]
    async fn max_iterations_caps_a_provider_that_always_asks_for_another_tool_call() {
        let endless_tool_use = vec![
            Ok(StreamEvent::ToolCallFinished {
                call_id: "c1".into(),
                tool_name: "list_tasks".into(),
                arguments: serde_json::json!({}),
            }),
            Ok(StreamEvent::Done { usage: None, finish_reason: Some("tool_use".into()) }),
        ];
        let turns: Vec<_> = std::iter::repeat(endless_tool_use).take(AgentConfig::default().max_iterations as usize).collect();
        let (_dir, agent_loop) = build_agent_loop(MockProvider::new(turns));

        let cancel = CancelToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = agent_loop.run("keep going".into(), cancel, tx).await;
        assert!(result.is_ok(), "hitting the iteration cap must stop the loop, not error");
    }
}
