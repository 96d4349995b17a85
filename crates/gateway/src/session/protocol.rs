//! Wire types for the client WebSocket. Text frames from the server are
//! JSON envelopes with a top-level `type`; see `ClientFrame`.

use serde::Serialize;
use serde_json::Value;

use crate::runtime::AgentEvent;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "flux_event")]
    FluxEvent { data: Value },
    #[serde(rename = "agent_start")]
    AgentStart,
    #[serde(rename = "agent_event")]
    AgentEvent { data: AgentEventFrame },
    #[serde(rename = "agent_error")]
    AgentError { error: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum AgentEventFrame {
    #[serde(rename = "thinking")]
    Thinking { text: String },
    #[serde(rename = "tool_use_start")]
    ToolUseStart { tool: String },
    #[serde(rename = "tool_use")]
    ToolUse { tool: String, input: Value },
    #[serde(rename = "tool_result")]
    ToolResult { tool: String, result: Value },
    #[serde(rename = "text")]
    Text { content: String },
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "error")]
    Error { message: String },
}

/// Translate one internal Agent Loop event into zero or more outbound client
/// frames. A `UiCommand` carried inside a tool result is not a frame of its
/// own; it rides inside the `tool_result` envelope.
pub fn agent_event_to_frames(event: AgentEvent) -> Vec<ClientFrame> {
    match event {
        AgentEvent::Text { text } => vec![ClientFrame::AgentEvent { data: AgentEventFrame::Text { content: text } }],
        AgentEvent::ToolUseStart { name } => {
            vec![ClientFrame::AgentEvent { data: AgentEventFrame::ToolUseStart { tool: name } }]
        }
        AgentEvent::ToolUse { name, args } => {
            vec![ClientFrame::AgentEvent { data: AgentEventFrame::ToolUse { tool: name, input: args } }]
        }
        AgentEvent::ToolResult { name, envelope } => {
            vec![ClientFrame::AgentEvent { data: AgentEventFrame::ToolResult { tool: name, result: envelope } }]
        }
        // Forwarded as part of the preceding tool_result envelope already;
        // the dispatcher embeds `ui_command` inside it. Nothing further to
        // emit here.
        AgentEvent::UiCommand(_) => vec![],
        AgentEvent::Done { .. } => vec![ClientFrame::AgentEvent { data: AgentEventFrame::Done }],
        AgentEvent::Error { message } => vec![ClientFrame::AgentEvent { data: AgentEventFrame::Error { message } }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_event_becomes_one_text_frame() {
        let frames = agent_event_to_frames(AgentEvent::Text { text: "hi".into() });
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            ClientFrame::AgentEvent { data: AgentEventFrame::Text { content } } => assert_eq!(content, "hi"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn ui_command_event_produces_no_frame() {
        let frames = agent_event_to_frames(AgentEvent::UiCommand(serde_json::json!({"type": "change_view"})));
        assert!(frames.is_empty());
    }

    #[test]
    fn done_event_becomes_done_frame() {
        let frames = agent_event_to_frames(AgentEvent::Done { cost_usd: 0.01 });
        assert!(matches!(frames[0], ClientFrame::AgentEvent { data: AgentEventFrame::Done }));
    }
}
