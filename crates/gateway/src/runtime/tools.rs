//! Tool Dispatcher: a registry mapping tool names to handlers, each
//! consuming validated JSON arguments plus a task/history store handle and
//! returning the normalized result envelope.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use va_domain::history::{MessageRole, ToolResultRecord};
use va_domain::task::{NewTask, Task, TaskFilter, TaskPatch};
use va_domain::tool::ToolDefinition;
use va_store::{HistoryStore, TaskStore};

/// An optional structured directive forwarded verbatim to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UiCommand {
    #[serde(rename = "change_view")]
    ChangeView {
        view_mode: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_date: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sort_by: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sort_order: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        filter_status: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        filter_priority: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        search_results: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        search_query: Option<String>,
    },
    #[serde(rename = "show_choices")]
    ShowChoices { title: String, choices: Vec<Choice> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub value: Value,
}

/// Build the envelope every handler emits: `{success, message, ...payload,
/// ui_command?}`. `payload` must serialize to a JSON object (or `Value::Null`
/// for none); its keys are merged at the top level alongside `success` and
/// `message`.
fn envelope(success: bool, message: impl Into<String>, payload: Value, ui_command: Option<UiCommand>) -> Value {
    let mut obj = json!({ "success": success, "message": message.into() });
    if let Value::Object(map) = payload {
        for (k, v) in map {
            obj[k] = v;
        }
    }
    if let Some(cmd) = ui_command {
        obj["ui_command"] = serde_json::to_value(cmd).unwrap_or(Value::Null);
    }
    obj
}

fn fail(message: impl Into<String>) -> Value {
    envelope(false, message, Value::Null, None)
}

/// The static tool enumeration advertised to the LLM Adapter every turn.
/// No per-session filtering: history is process-global.
pub fn build_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "create_task".into(),
            description: "Create a single task.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "description": {"type": "string"},
                    "notes": {"type": "string"},
                    "priority": {"type": "string", "enum": ["low", "medium", "high", "urgent"]},
                    "scheduled_date": {"type": "string", "format": "date-time"},
                    "deadline": {"type": "string", "format": "date-time"}
                },
                "required": ["title"]
            }),
        },
        ToolDefinition {
            name: "create_multiple_tasks".into(),
            description: "Create many tasks in one call.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "tasks": {"type": "array", "items": {"type": "object"}}
                },
                "required": ["tasks"]
            }),
        },
        ToolDefinition {
            name: "update_task".into(),
            description: "Patch an existing task by id, or by a search query matching exactly one task.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "query": {"type": "string", "description": "Search terms identifying the task, used when 'id' is not known."},
                    "title": {"type": "string"},
                    "description": {"type": "string"},
                    "notes": {"type": "string"},
                    "priority": {"type": "string"},
                    "status": {"type": "string"},
                    "scheduled_date": {"type": "string", "format": "date-time"},
                    "deadline": {"type": "string", "format": "date-time"},
                    "clear_deadline": {"type": "boolean"}
                }
            }),
        },
        ToolDefinition {
            name: "update_multiple_tasks".into(),
            description: "Patch several tasks, each by id, or apply one patch to every task matching a search query.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "updates": {"type": "array", "items": {"type": "object"}},
                    "query": {"type": "string", "description": "Search terms; 'patch' is applied to every matching task."},
                    "patch": {"type": "object", "description": "Fields to apply when 'query' is used instead of 'updates'."}
                }
            }),
        },
        ToolDefinition {
            name: "delete_task".into(),
            description: "Delete a task by id, or by a search query matching exactly one task. Returns its pre-delete snapshot.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "query": {"type": "string", "description": "Search terms identifying the task, used when 'id' is not known."}
                }
            }),
        },
        ToolDefinition {
            name: "delete_multiple_tasks".into(),
            description: "Delete several tasks by id, or every task matching a search query.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "ids": {"type": "array", "items": {"type": "string"}},
                    "query": {"type": "string", "description": "Search terms; every matching task is deleted."}
                }
            }),
        },
        ToolDefinition {
            name: "list_tasks".into(),
            description: "List tasks matching optional filters.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "status": {"type": "string"},
                    "priority": {"type": "string"},
                    "scheduled_after": {"type": "string", "format": "date-time"},
                    "scheduled_before": {"type": "string", "format": "date-time"},
                    "text": {"type": "string"}
                }
            }),
        },
        ToolDefinition {
            name: "search_tasks".into(),
            description: "Case-insensitive substring search across title, description, and notes.".into(),
            parameters: json!({
                "type": "object",
                "properties": {"terms": {"type": "array", "items": {"type": "string"}}},
                "required": ["terms"]
            }),
        },
        ToolDefinition {
            name: "get_task_stats".into(),
            description: "Aggregate task counts by status and priority, plus missed/upcoming-deadline counts.".into(),
            parameters: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: "change_ui_view".into(),
            description: "Change the client's view mode. No task-store side effects.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "view_mode": {"type": "string", "enum": ["daily", "weekly", "monthly", "list"]},
                    "target_date": {"type": "string", "format": "date"},
                    "sort_by": {"type": "string"},
                    "sort_order": {"type": "string"}
                },
                "required": ["view_mode"]
            }),
        },
        ToolDefinition {
            name: "show_choices".into(),
            description: "Present a read-only choice modal to the user. No side effects.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "choices": {"type": "array", "items": {"type": "object"}}
                },
                "required": ["title", "choices"]
            }),
        },
        ToolDefinition {
            name: "load_full_history".into(),
            description: "Search the conversation history to resurrect context across turns.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "terms": {"type": "array", "items": {"type": "string"}},
                    "tool_names": {"type": "array", "items": {"type": "string"}},
                    "limit": {"type": "integer"}
                }
            }),
        },
    ]
}

fn parse_new_task(args: &Value) -> Result<NewTask, String> {
    let title = args
        .get("title")
        .and_then(|v| v.as_str())
        .ok_or("missing required field 'title'")?
        .to_string();
    Ok(NewTask {
        title,
        description: str_field(args, "description"),
        notes: str_field(args, "notes"),
        priority: str_field(args, "priority"),
        scheduled_date: datetime_field(args, "scheduled_date")?,
        deadline: datetime_field(args, "deadline")?,
    })
}

fn parse_patch(args: &Value) -> Result<TaskPatch, String> {
    Ok(TaskPatch {
        title: str_field(args, "title"),
        description: str_field(args, "description"),
        notes: str_field(args, "notes"),
        priority: str_field(args, "priority"),
        status: str_field(args, "status"),
        scheduled_date: datetime_field(args, "scheduled_date")?,
        deadline: datetime_field(args, "deadline")?,
        clear_deadline: args.get("clear_deadline").and_then(|v| v.as_bool()).unwrap_or(false),
    })
}

fn str_field(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn datetime_field(args: &Value, key: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>, String> {
    match args.get(key).and_then(|v| v.as_str()) {
        None => Ok(None),
        Some(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&chrono::Utc)))
            .map_err(|e| format!("invalid datetime for '{key}': {e}")),
    }
}

/// Resolve a free-text `query` field to matching tasks via the Task Store's
/// substring search, splitting on whitespace the same way `search_tasks` does.
fn resolve_query_matches(task_store: &TaskStore, query: &str) -> Vec<Task> {
    let terms: Vec<String> = query.split_whitespace().map(String::from).collect();
    task_store.search(&terms)
}

/// Resolve the target of a single-task tool call: an explicit `id`, or a
/// `query` that must match exactly one task.
fn resolve_single_target(args: &Value, task_store: &TaskStore) -> Result<String, String> {
    if let Some(id) = args.get("id").and_then(|v| v.as_str()) {
        return Ok(id.to_string());
    }
    let query = args
        .get("query")
        .and_then(|v| v.as_str())
        .ok_or("missing required field 'id' or 'query'")?;
    match resolve_query_matches(task_store, query).as_slice() {
        [] => Err(format!("no task matches query '{query}'")),
        [only] => Ok(only.id.clone()),
        many => Err(format!(
            "query '{query}' matched {} tasks, expected exactly one: {}",
            many.len(),
            many.iter().map(|t| t.id.as_str()).collect::<Vec<_>>().join(", ")
        )),
    }
}

fn task_filter_from_args(args: &Value) -> Result<TaskFilter, String> {
    Ok(TaskFilter {
        status: str_field(args, "status"),
        priority: str_field(args, "priority"),
        scheduled_after: datetime_field(args, "scheduled_after")?,
        scheduled_before: datetime_field(args, "scheduled_before")?,
        text: str_field(args, "text"),
    })
}

/// Dispatch a single tool call. Never raises: validation and store failures
/// both collapse to `{success: false, message}` so the model can see and
/// adjust to the failure instead of the stream breaking.
pub fn dispatch_tool(name: &str, args: &Value, task_store: &TaskStore, history_store: &HistoryStore) -> Value {
    match name {
        "create_task" => match parse_new_task(args).and_then(|nt| task_store.create(nt).map_err(|e| e.to_string())) {
            Ok(task) => envelope(true, "task created", json!({"task": task}), None),
            Err(e) => fail(e),
        },

        "create_multiple_tasks" => {
            let items = match args.get("tasks").and_then(|v| v.as_array()) {
                Some(arr) => arr.clone(),
                None => return fail("missing required field 'tasks'"),
            };
            let mut created = Vec::new();
            let mut failures = Vec::new();
            for item in &items {
                match parse_new_task(item) {
                    Ok(nt) => match task_store.create(nt) {
                        Ok(task) => created.push(task),
                        Err(e) => failures.push(e.to_string()),
                    },
                    Err(e) => failures.push(e),
                }
            }
            envelope(
                failures.is_empty(),
                format!("{} created, {} failed", created.len(), failures.len()),
                json!({"tasks": created, "failures": failures}),
                None,
            )
        }

        "update_task" => {
            let id = match resolve_single_target(args, task_store) {
                Ok(id) => id,
                Err(e) => return fail(e),
            };
            match parse_patch(args).and_then(|patch| task_store.update(&id, patch).map_err(|e| e.to_string())) {
                Ok(task) => envelope(true, "task updated", json!({"task": task}), None),
                Err(e) => fail(e),
            }
        }

        "update_multiple_tasks" => {
            if let Some(query) = args.get("query").and_then(|v| v.as_str()) {
                let patch_args = args.get("patch").cloned().unwrap_or_else(|| json!({}));
                let patch = match parse_patch(&patch_args) {
                    Ok(p) => p,
                    Err(e) => return fail(e),
                };
                let matches = resolve_query_matches(task_store, query);
                if matches.is_empty() {
                    return fail(format!("no task matches query '{query}'"));
                }
                let mut updated = Vec::new();
                let mut failures = Vec::new();
                for task in matches {
                    match task_store.update(&task.id, patch.clone()) {
                        Ok(t) => updated.push(t),
                        Err(e) => failures.push(e.to_string()),
                    }
                }
                return envelope(
                    failures.is_empty(),
                    format!("{} updated, {} failed", updated.len(), failures.len()),
                    json!({"tasks": updated, "failures": failures}),
                    None,
                );
            }

            let updates = match args.get("updates").and_then(|v| v.as_array()) {
                Some(arr) => arr.clone(),
                None => return fail("missing required field 'updates' or 'query'"),
            };
            let mut updated = Vec::new();
            let mut failures = Vec::new();
            for item in &updates {
                let id = resolve_single_target(item, task_store);
                match id {
                    Err(e) => failures.push(e),
                    Ok(id) => match parse_patch(item).and_then(|p| task_store.update(&id, p).map_err(|e| e.to_string())) {
                        Ok(task) => updated.push(task),
                        Err(e) => failures.push(e),
                    },
                }
            }
            envelope(
                failures.is_empty(),
                format!("{} updated, {} failed", updated.len(), failures.len()),
                json!({"tasks": updated, "failures": failures}),
                None,
            )
        }

        "delete_task" => {
            let id = match resolve_single_target(args, task_store) {
                Ok(id) => id,
                Err(e) => return fail(e),
            };
            match task_store.delete(&id) {
                Ok(task) => envelope(true, "task deleted", json!({"deleted_task": task}), None),
                Err(e) => fail(e.to_string()),
            }
        }

        "delete_multiple_tasks" => {
            let ids: Vec<String> = if let Some(query) = args.get("query").and_then(|v| v.as_str()) {
                let matches = resolve_query_matches(task_store, query);
                if matches.is_empty() {
                    return fail(format!("no task matches query '{query}'"));
                }
                matches.into_iter().map(|t| t.id).collect()
            } else {
                match args.get("ids").and_then(|v| v.as_array()) {
                    Some(arr) => arr.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
                    None => return fail("missing required field 'ids' or 'query'"),
                }
            };
            let results = task_store.delete_many(ids);
            let mut deleted = Vec::new();
            let mut failures = Vec::new();
            for r in results {
                match r {
                    Ok(task) => deleted.push(task),
                    Err(e) => failures.push(e.to_string()),
                }
            }
            envelope(
                failures.is_empty(),
                format!("{} deleted, {} failed", deleted.len(), failures.len()),
                json!({"deleted_tasks": deleted, "failures": failures}),
                None,
            )
        }

        "list_tasks" => match task_filter_from_args(args).and_then(|f| task_store.list(&f).map_err(|e| e.to_string())) {
            Ok(tasks) => envelope(true, format!("{} tasks", tasks.len()), json!({"tasks": tasks}), None),
            Err(e) => fail(e),
        },

        "search_tasks" => {
            let terms: Vec<String> = match args.get("terms").and_then(|v| v.as_array()) {
                Some(arr) => arr.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
                None => return fail("missing required field 'terms'"),
            };
            let tasks = task_store.search(&terms);
            let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
            let ui_command = UiCommand::ChangeView {
                view_mode: "list".into(),
                target_date: None,
                sort_by: None,
                sort_order: None,
                filter_status: None,
                filter_priority: None,
                search_results: Some(ids),
                search_query: Some(terms.join(" ")),
            };
            envelope(true, format!("{} matches", tasks.len()), json!({"tasks": tasks}), Some(ui_command))
        }

        "get_task_stats" => {
            let stats = task_store.stats();
            envelope(true, "stats computed", json!({"stats": stats}), None)
        }

        "change_ui_view" => {
            let view_mode = match args.get("view_mode").and_then(|v| v.as_str()) {
                Some(v) => v.to_string(),
                None => return fail("missing required field 'view_mode'"),
            };
            let ui_command = UiCommand::ChangeView {
                view_mode,
                target_date: str_field(args, "target_date"),
                sort_by: str_field(args, "sort_by"),
                sort_order: str_field(args, "sort_order"),
                filter_status: str_field(args, "filter_status"),
                filter_priority: str_field(args, "filter_priority"),
                search_results: None,
                search_query: None,
            };
            envelope(true, "view changed", Value::Null, Some(ui_command))
        }

        "show_choices" => {
            let title = match args.get("title").and_then(|v| v.as_str()) {
                Some(t) => t.to_string(),
                None => return fail("missing required field 'title'"),
            };
            let choices: Vec<Choice> = match args.get("choices").and_then(|v| v.as_array()) {
                Some(arr) => match arr.iter().map(|c| serde_json::from_value(c.clone())).collect() {
                    Ok(choices) => choices,
                    Err(e) => return fail(format!("invalid choice entry: {e}")),
                },
                None => return fail("missing required field 'choices'"),
            };
            envelope(true, "choices presented", Value::Null, Some(UiCommand::ShowChoices { title, choices }))
        }

        "load_full_history" => {
            let terms: Vec<String> = args
                .get("terms")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            let tool_names: Option<Vec<String>> = args
                .get("tool_names")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect());
            let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
            let hits = history_store.search(&terms, tool_names.as_deref(), limit);
            envelope(true, format!("{} matching turns", hits.len()), json!({"hits": hits}), None)
        }

        other => fail(format!("unknown tool '{other}'")),
    }
}

/// Build a `ToolResultRecord` for the History Store from a dispatched
/// envelope, so later turns (and `load_full_history`) can see both what was
/// asked and what happened.
pub fn record_tool_result(call_id: String, tool_name: String, arguments: Value, result: Value) -> ToolResultRecord {
    ToolResultRecord { call_id, tool_name, arguments, result }
}

pub fn user_role() -> MessageRole {
    MessageRole::User
}
