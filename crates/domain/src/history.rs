use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A recorded tool invocation and its normalized result, as carried on a
/// synthetic user turn so the model sees its own prior tool outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultRecord {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub result: serde_json::Value,
}

/// An append-only conversation record.
///
/// Ordering invariant: chronological by `id` and `created_at`. Tool-result
/// messages carry role `User` by convention so the provider protocol
/// accepts them as input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: u64,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<ToolResultRecord>>,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    /// A message is structurally invalid if it carries tool calls with no
    /// corresponding tool-result message following it, or tool results with
    /// no preceding tool call they answer — checked by the loader's forward
    /// scan, not by this type alone (the invariant spans the whole log).
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }

    pub fn has_tool_results(&self) -> bool {
        self.tool_results.as_ref().is_some_and(|r| !r.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistorySearchHit {
    pub message: ConversationMessage,
    /// Matched tool-call records, with original args and recorded result,
    /// for callers reconstructing a prior tool's effect (e.g. restoring a
    /// deleted task from its pre-delete snapshot).
    pub matched_tool_results: Vec<ToolResultRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: u64) -> ConversationMessage {
        ConversationMessage {
            id,
            role: MessageRole::User,
            content: "hi".into(),
            tool_calls: None,
            tool_results: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn has_tool_calls_false_when_empty_vec() {
        let mut m = msg(1);
        m.tool_calls = Some(vec![]);
        assert!(!m.has_tool_calls());
    }

    #[test]
    fn has_tool_results_false_when_none() {
        let m = msg(1);
        assert!(!m.has_tool_results());
    }
}
