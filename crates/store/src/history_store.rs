//! History Store Gateway: an append-only, process-global conversation log
//! backed by a JSON-lines file. Appends hold the write lock only long enough
//! to push in-memory and append one line; `tail`/`search` never re-read the
//! file, since the full log is kept resident.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;

use va_domain::error::Result;
use va_domain::history::{ConversationMessage, HistorySearchHit, MessageRole, ToolResultRecord};
use va_domain::tool::ToolCall;

pub struct HistoryStore {
    path: PathBuf,
    inner: RwLock<HistoryState>,
}

struct HistoryState {
    messages: Vec<ConversationMessage>,
    next_id: u64,
}

impl HistoryStore {
    /// Load (or create) the log backing `<db_path>/history.jsonl`.
    pub fn open(db_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(db_path)?;
        let path = db_path.join("history.jsonl");

        let mut messages = Vec::new();
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            for line in text.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                messages.push(serde_json::from_str(line)?);
            }
        }
        let next_id = messages.iter().map(|m: &ConversationMessage| m.id).max().map(|id| id + 1).unwrap_or(0);

        Ok(Self {
            path,
            inner: RwLock::new(HistoryState { messages, next_id }),
        })
    }

    pub fn append(
        &self,
        role: MessageRole,
        content: String,
        tool_calls: Option<Vec<ToolCall>>,
        tool_results: Option<Vec<ToolResultRecord>>,
    ) -> Result<ConversationMessage> {
        let mut guard = self.inner.write();
        let message = ConversationMessage {
            id: guard.next_id,
            role,
            content,
            tool_calls,
            tool_results,
            created_at: Utc::now(),
        };
        guard.next_id += 1;

        let line = serde_json::to_string(&message)?;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")?;

        guard.messages.push(message.clone());
        Ok(message)
    }

    /// Last `n` messages, chronological order.
    pub fn tail(&self, n: usize) -> Vec<ConversationMessage> {
        let guard = self.inner.read();
        let len = guard.messages.len();
        let start = len.saturating_sub(n);
        guard.messages[start..].to_vec()
    }

    /// Recent turns whose content matches any term, or whose tool-call array
    /// names any of `tool_names`. Returns matched tool-call records with
    /// their original arguments and recorded result for each hit.
    pub fn search(
        &self,
        terms: &[String],
        tool_names: Option<&[String]>,
        limit: usize,
    ) -> Vec<HistorySearchHit> {
        let needles: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
        let guard = self.inner.read();

        let mut hits: Vec<HistorySearchHit> = guard
            .messages
            .iter()
            .rev()
            .filter_map(|m| {
                let content_match = !needles.is_empty()
                    && needles.iter().any(|n| m.content.to_lowercase().contains(n.as_str()));

                let matched_tool_results: Vec<ToolResultRecord> = m
                    .tool_results
                    .as_ref()
                    .map(|results| {
                        results
                            .iter()
                            .filter(|r| {
                                tool_names.map(|names| names.iter().any(|n| n == &r.tool_name)).unwrap_or(false)
                                    || needles.iter().any(|n| r.tool_name.to_lowercase().contains(n.as_str()))
                            })
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();

                let tool_name_match = m
                    .tool_calls
                    .as_ref()
                    .map(|calls| {
                        tool_names
                            .map(|names| calls.iter().any(|c| names.iter().any(|n| n == &c.tool_name)))
                            .unwrap_or(false)
                    })
                    .unwrap_or(false);

                if content_match || tool_name_match || !matched_tool_results.is_empty() {
                    Some(HistorySearchHit { message: m.clone(), matched_tool_results })
                } else {
                    None
                }
            })
            .take(limit)
            .collect();

        hits.reverse();
        hits
    }

    /// Wipe the entire log, in memory and on disk. Used as the
    /// corruption-recovery escape hatch.
    pub fn clear(&self) -> Result<()> {
        let mut guard = self.inner.write();
        guard.messages.clear();
        guard.next_id = 0;
        std::fs::write(&self.path, "")?;
        Ok(())
    }
}

/// A message is structurally invalid if it carries tool calls with no
/// tool-result message anywhere after it answering them (or vice versa).
/// This spans the whole loaded window, not a single message, per the
/// Agent Loop's corruption-recovery step.
pub fn validate_turn_sequence(messages: &[ConversationMessage]) -> bool {
    for (idx, message) in messages.iter().enumerate() {
        if message.has_tool_calls() {
            let answered = messages[idx + 1..].iter().any(|m| m.has_tool_results());
            if !answered {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn append_assigns_monotonic_ids() {
        let (_dir, store) = open_temp();
        let a = store.append(MessageRole::User, "hi".into(), None, None).unwrap();
        let b = store.append(MessageRole::Assistant, "hello".into(), None, None).unwrap();
        assert_eq!(a.id, 0);
        assert_eq!(b.id, 1);
    }

    #[test]
    fn tail_returns_last_n_in_chronological_order() {
        let (_dir, store) = open_temp();
        for i in 0..5 {
            store.append(MessageRole::User, format!("msg {i}"), None, None).unwrap();
        }
        let tail = store.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "msg 3");
        assert_eq!(tail[1].content, "msg 4");
    }

    #[test]
    fn tail_with_n_larger_than_log_returns_whole_log() {
        let (_dir, store) = open_temp();
        store.append(MessageRole::User, "only one".into(), None, None).unwrap();
        assert_eq!(store.tail(50).len(), 1);
    }

    #[test]
    fn search_matches_content_and_returns_in_chronological_order() {
        let (_dir, store) = open_temp();
        store.append(MessageRole::User, "remind me to call mom".into(), None, None).unwrap();
        store.append(MessageRole::Assistant, "sure thing".into(), None, None).unwrap();
        store.append(MessageRole::User, "call the dentist too".into(), None, None).unwrap();

        let hits = store.search(&["call".to_string()], None, 10);
        assert_eq!(hits.len(), 2);
        assert!(hits[0].message.content.contains("mom"));
        assert!(hits[1].message.content.contains("dentist"));
    }

    #[test]
    fn search_surfaces_matched_tool_results() {
        let (_dir, store) = open_temp();
        let result = ToolResultRecord {
            call_id: "c1".into(),
            tool_name: "delete_task".into(),
            arguments: serde_json::json!({"id": "t1"}),
            result: serde_json::json!({"success": true, "title": "buy milk"}),
        };
        store
            .append(MessageRole::User, "tool results".into(), None, Some(vec![result]))
            .unwrap();

        let hits = store.search(&[], Some(&["delete_task".to_string()]), 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].matched_tool_results[0].result["title"], "buy milk");
    }

    #[test]
    fn clear_wipes_log_and_resets_ids() {
        let (_dir, store) = open_temp();
        store.append(MessageRole::User, "x".into(), None, None).unwrap();
        store.clear().unwrap();
        assert!(store.tail(10).is_empty());
        let next = store.append(MessageRole::User, "y".into(), None, None).unwrap();
        assert_eq!(next.id, 0);
    }

    #[test]
    fn validate_detects_unanswered_tool_call() {
        let call = ToolCall { call_id: "c1".into(), tool_name: "create_task".into(), arguments: serde_json::json!({}) };
        let msgs = vec![ConversationMessage {
            id: 0,
            role: MessageRole::Assistant,
            content: String::new(),
            tool_calls: Some(vec![call]),
            tool_results: None,
            created_at: Utc::now(),
        }];
        assert!(!validate_turn_sequence(&msgs));
    }

    #[test]
    fn validate_accepts_answered_tool_call() {
        let call = ToolCall { call_id: "c1".into(), tool_name: "create_task".into(), arguments: serde_json::json!({}) };
        let result = ToolResultRecord {
            call_id: "c1".into(),
            tool_name: "create_task".into(),
            arguments: serde_json::json!({}),
            result: serde_json::json!({"success": true}),
        };
        let msgs = vec![
            ConversationMessage {
                id: 0,
                role: MessageRole::Assistant,
                content: String::new(),
                tool_calls: Some(vec![call]),
                tool_results: None,
                created_at: Utc::now(),
            },
            ConversationMessage {
                id: 1,
                role: MessageRole::User,
                content: String::new(),
                tool_calls: None,
                tool_results: Some(vec![result]),
                created_at: Utc::now(),
            },
        ];
        assert!(validate_turn_sequence(&msgs));
    }
}
