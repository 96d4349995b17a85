use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(Error::ToolValidation(format!(
                "invalid priority '{other}': expected one of low, medium, high, urgent"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "todo" => Ok(TaskStatus::Todo),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(Error::ToolValidation(format!(
                "invalid status '{other}': expected one of todo, in_progress, completed, cancelled"
            ))),
        }
    }
}

/// A durable task record.
///
/// Invariant: `scheduled_date` is always present on a persisted task.
/// Invariant: `completed_at` is `Some` iff `status == Completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub scheduled_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Derived, never stored: past deadline and not completed.
    pub fn is_missed(&self, now: DateTime<Utc>) -> bool {
        match self.deadline {
            Some(d) => d < now && self.status != TaskStatus::Completed,
            None => false,
        }
    }
}

/// Fields accepted when creating a task. `scheduled_date` defaults to
/// "today at 12:00 local" (here: UTC, since the server has no notion of the
/// caller's locale) when omitted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub priority: Option<String>,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
}

/// A sparse patch applied to an existing task. `None` fields are left
/// untouched; `Some(None)`-shaped clears are expressed via the dedicated
/// `clear_*` flags since JSON cannot distinguish "absent" from "null" once
/// flattened through `Option<Option<T>>` in a schema-validated payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub priority: Option<String>,
    pub status: Option<String>,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clear_deadline: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub scheduled_after: Option<DateTime<Utc>>,
    pub scheduled_before: Option<DateTime<Utc>>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    pub by_status: std::collections::BTreeMap<String, usize>,
    pub by_priority: std::collections::BTreeMap<String, usize>,
    pub upcoming_deadline_count: usize,
    pub missed_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_parses_all_variants_case_insensitively() {
        assert_eq!(Priority::parse("LOW").unwrap(), Priority::Low);
        assert_eq!(Priority::parse("Medium").unwrap(), Priority::Medium);
        assert_eq!(Priority::parse("high").unwrap(), Priority::High);
        assert_eq!(Priority::parse("urgent").unwrap(), Priority::Urgent);
    }

    #[test]
    fn priority_rejects_unknown_value() {
        assert!(Priority::parse("critical").is_err());
    }

    #[test]
    fn status_rejects_unknown_value() {
        assert!(TaskStatus::parse("archived").is_err());
    }

    #[test]
    fn missed_task_requires_past_deadline_and_not_completed() {
        let now = Utc::now();
        let mut task = Task {
            id: "t1".into(),
            title: "x".into(),
            description: None,
            notes: None,
            priority: Priority::Low,
            status: TaskStatus::Todo,
            scheduled_date: now,
            deadline: Some(now - chrono::Duration::days(1)),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        assert!(task.is_missed(now));

        task.status = TaskStatus::Completed;
        task.completed_at = Some(now);
        assert!(!task.is_missed(now), "completed tasks are never missed");

        task.status = TaskStatus::Todo;
        task.completed_at = None;
        task.deadline = Some(now + chrono::Duration::days(1));
        assert!(!task.is_missed(now), "future deadline is not missed");

        task.deadline = None;
        assert!(!task.is_missed(now), "no deadline is never missed");
    }
}
