//! Task Store Gateway: an in-memory, `RwLock`-guarded map flushed to a single
//! JSON file on every mutation. The write lock spans both the in-memory
//! mutation and the flush, so no reader ever observes a torn write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use va_domain::error::{Error, Result};
use va_domain::task::{NewTask, Priority, Task, TaskFilter, TaskPatch, TaskStats, TaskStatus};

const UPCOMING_DEADLINE_WINDOW_DAYS: i64 = 7;

pub struct TaskStore {
    path: PathBuf,
    inner: RwLock<HashMap<String, Task>>,
}

impl TaskStore {
    /// Load (or create) the store backing `<db_path>/tasks.json`.
    pub fn open(db_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(db_path)?;
        let path = db_path.join("tasks.json");

        let tasks: Vec<Task> = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&text)?
            }
        } else {
            Vec::new()
        };

        let map = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        Ok(Self {
            path,
            inner: RwLock::new(map),
        })
    }

    /// Serialize the full map. Caller must hold the write lock.
    fn flush(&self, guard: &HashMap<String, Task>) -> Result<()> {
        let mut tasks: Vec<&Task> = guard.values().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let text = serde_json::to_string_pretty(&tasks)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }

    pub fn create(&self, fields: NewTask) -> Result<Task> {
        let priority = match fields.priority {
            Some(p) => Priority::parse(&p)?,
            None => Priority::Medium,
        };
        let now = Utc::now();
        let scheduled_date = fields.scheduled_date.unwrap_or_else(|| default_scheduled_date(now));

        let task = Task {
            id: Uuid::new_v4().to_string(),
            title: fields.title,
            description: fields.description,
            notes: fields.notes,
            priority,
            status: TaskStatus::Todo,
            scheduled_date,
            deadline: fields.deadline,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let mut guard = self.inner.write();
        guard.insert(task.id.clone(), task.clone());
        self.flush(&guard)?;
        Ok(task)
    }

    pub fn create_many(&self, fields: Vec<NewTask>) -> Vec<Result<Task>> {
        fields.into_iter().map(|f| self.create(f)).collect()
    }

    pub fn get(&self, id: &str) -> Result<Task> {
        self.inner
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub fn update(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        let mut guard = self.inner.write();
        let task = guard
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;

        if let Some(title) = patch.title {
            task.title = title;
        }
        if let Some(description) = patch.description {
            task.description = Some(description);
        }
        if let Some(notes) = patch.notes {
            task.notes = Some(notes);
        }
        if let Some(priority) = patch.priority {
            task.priority = Priority::parse(&priority)?;
        }
        if let Some(scheduled_date) = patch.scheduled_date {
            task.scheduled_date = scheduled_date;
        }
        if patch.clear_deadline {
            task.deadline = None;
        } else if let Some(deadline) = patch.deadline {
            task.deadline = Some(deadline);
        }
        if let Some(status) = patch.status {
            let new_status = TaskStatus::parse(&status)?;
            let now = Utc::now();
            if new_status == TaskStatus::Completed && task.status != TaskStatus::Completed {
                task.completed_at = Some(now);
            } else if new_status != TaskStatus::Completed && task.status == TaskStatus::Completed {
                task.completed_at = None;
            }
            task.status = new_status;
        }
        task.updated_at = Utc::now();

        let result = task.clone();
        self.flush(&guard)?;
        Ok(result)
    }

    pub fn update_many(&self, patches: Vec<(String, TaskPatch)>) -> Vec<Result<Task>> {
        patches
            .into_iter()
            .map(|(id, patch)| self.update(&id, patch))
            .collect()
    }

    /// Returns the pre-delete snapshot so the history log can later support
    /// "restore the task I just deleted".
    pub fn delete(&self, id: &str) -> Result<Task> {
        let mut guard = self.inner.write();
        let task = guard
            .remove(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        self.flush(&guard)?;
        Ok(task)
    }

    pub fn delete_many(&self, ids: Vec<String>) -> Vec<Result<Task>> {
        ids.iter().map(|id| self.delete(id)).collect()
    }

    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let status = filter.status.as_deref().map(TaskStatus::parse).transpose()?;
        let priority = filter.priority.as_deref().map(Priority::parse).transpose()?;
        let text = filter.text.as_deref().map(|t| t.to_lowercase());

        let guard = self.inner.read();
        let mut matches: Vec<Task> = guard
            .values()
            .filter(|t| status.map(|s| t.status == s).unwrap_or(true))
            .filter(|t| priority.map(|p| t.priority == p).unwrap_or(true))
            .filter(|t| {
                filter
                    .scheduled_after
                    .map(|after| t.scheduled_date >= after)
                    .unwrap_or(true)
            })
            .filter(|t| {
                filter
                    .scheduled_before
                    .map(|before| t.scheduled_date <= before)
                    .unwrap_or(true)
            })
            .filter(|t| text.as_deref().map(|q| task_matches_text(t, q)).unwrap_or(true))
            .cloned()
            .collect();

        matches.sort_by(|a, b| b.scheduled_date.cmp(&a.scheduled_date));
        Ok(matches)
    }

    /// Case-insensitive substring search over title/description/notes.
    /// OR across terms, ranked by match count then recency.
    pub fn search(&self, terms: &[String]) -> Vec<Task> {
        let needles: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
        let guard = self.inner.read();

        let mut scored: Vec<(usize, &Task)> = guard
            .values()
            .filter_map(|t| {
                let haystack = format!(
                    "{} {} {}",
                    t.title,
                    t.description.as_deref().unwrap_or(""),
                    t.notes.as_deref().unwrap_or("")
                )
                .to_lowercase();
                let count = needles.iter().filter(|n| haystack.contains(n.as_str())).count();
                if count > 0 {
                    Some((count, t))
                } else {
                    None
                }
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.updated_at.cmp(&a.1.updated_at)));
        scored.into_iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn stats(&self) -> TaskStats {
        let guard = self.inner.read();
        let now = Utc::now();
        let window_end = now + chrono::Duration::days(UPCOMING_DEADLINE_WINDOW_DAYS);

        let mut by_status = std::collections::BTreeMap::new();
        let mut by_priority = std::collections::BTreeMap::new();
        let mut upcoming_deadline_count = 0;
        let mut missed_count = 0;

        for task in guard.values() {
            *by_status.entry(status_label(task.status).to_string()).or_insert(0) += 1;
            *by_priority.entry(priority_label(task.priority).to_string()).or_insert(0) += 1;

            if task.is_missed(now) {
                missed_count += 1;
            }
            if let Some(deadline) = task.deadline {
                if deadline >= now && deadline <= window_end && task.status != TaskStatus::Completed {
                    upcoming_deadline_count += 1;
                }
            }
        }

        TaskStats {
            by_status,
            by_priority,
            upcoming_deadline_count,
            missed_count,
        }
    }
}

fn task_matches_text(task: &Task, needle: &str) -> bool {
    task.title.to_lowercase().contains(needle)
        || task
            .description
            .as_deref()
            .map(|d| d.to_lowercase().contains(needle))
            .unwrap_or(false)
        || task
            .notes
            .as_deref()
            .map(|n| n.to_lowercase().contains(needle))
            .unwrap_or(false)
}

fn default_scheduled_date(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year_val(), now.month_val(), now.day_val(), 12, 0, 0)
        .single()
        .unwrap_or(now)
}

// Small helpers to avoid importing the `Datelike` trait at every call site.
trait DateParts {
    fn year_val(&self) -> i32;
    fn month_val(&self) -> u32;
    fn day_val(&self) -> u32;
}

impl DateParts for DateTime<Utc> {
    fn year_val(&self) -> i32 {
        use chrono::Datelike;
        self.year()
    }
    fn month_val(&self) -> u32 {
        use chrono::Datelike;
        self.month()
    }
    fn day_val(&self) -> u32 {
        use chrono::Datelike;
        self.day()
    }
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "todo",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Completed => "completed",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Medium => "medium",
        Priority::High => "high",
        Priority::Urgent => "urgent",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn create_defaults_scheduled_date_and_priority() {
        let (_dir, store) = open_temp();
        let task = store
            .create(NewTask {
                title: "call dentist".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(task.priority, Priority::Medium);
        assert_eq!(task.status, TaskStatus::Todo);
    }

    #[test]
    fn create_rejects_unknown_priority() {
        let (_dir, store) = open_temp();
        let result = store.create(NewTask {
            title: "x".into(),
            priority: Some("urgentest".into()),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn update_to_completed_sets_completed_at_and_clearing_unsets_it() {
        let (_dir, store) = open_temp();
        let task = store
            .create(NewTask { title: "x".into(), ..Default::default() })
            .unwrap();

        let completed = store
            .update(&task.id, TaskPatch { status: Some("completed".into()), ..Default::default() })
            .unwrap();
        assert!(completed.completed_at.is_some());

        let reopened = store
            .update(&task.id, TaskPatch { status: Some("todo".into()), ..Default::default() })
            .unwrap();
        assert!(reopened.completed_at.is_none());
    }

    #[test]
    fn delete_returns_pre_delete_snapshot_and_removes_it() {
        let (_dir, store) = open_temp();
        let task = store
            .create(NewTask { title: "gone soon".into(), ..Default::default() })
            .unwrap();
        let snapshot = store.delete(&task.id).unwrap();
        assert_eq!(snapshot.title, "gone soon");
        assert!(store.get(&task.id).is_err());
    }

    #[test]
    fn search_ranks_by_match_count_then_recency() {
        let (_dir, store) = open_temp();
        store.create(NewTask { title: "buy milk".into(), ..Default::default() }).unwrap();
        store
            .create(NewTask {
                title: "buy milk and eggs".into(),
                description: Some("milk run".into()),
                ..Default::default()
            })
            .unwrap();

        let results = store.search(&["milk".to_string()]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "buy milk and eggs");
    }

    #[test]
    fn stats_counts_missed_and_upcoming() {
        let (_dir, store) = open_temp();
        let now = Utc::now();
        let missed = store
            .create(NewTask { title: "overdue".into(), deadline: Some(now - chrono::Duration::days(1)), ..Default::default() })
            .unwrap();
        store
            .create(NewTask { title: "soon".into(), deadline: Some(now + chrono::Duration::days(2)), ..Default::default() })
            .unwrap();

        let stats = store.stats();
        assert_eq!(stats.missed_count, 1);
        assert_eq!(stats.upcoming_deadline_count, 1);
        assert!(store.get(&missed.id).unwrap().is_missed(now));
    }

    #[test]
    fn bulk_delete_is_best_effort_per_item() {
        let (_dir, store) = open_temp();
        let task = store.create(NewTask { title: "x".into(), ..Default::default() }).unwrap();
        let results = store.delete_many(vec![task.id, "missing".into()]);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
