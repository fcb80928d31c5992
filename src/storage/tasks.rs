use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Params, Row};

use super::watch::{ChangeKind, LiveQuery, Table};
use super::{bool_column, enum_column, json_column, now_ms, to_json, StorageHandle};
use crate::model::{Category, Priority, Task, WeekdaySet};

const TASK_COLUMNS: &str = "id,
    title,
    description,
    date_time,
    duration,
    repeat_type,
    repeat_days,
    category,
    priority,
    is_completed,
    reminders,
    reminder_leads,
    checklist,
    tags,
    color_hex,
    emoji,
    is_anchored,
    created_at,
    updated_at";

/// Summary of the task table used to notice writes made by other processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskFingerprint {
    pub count: i64,
    pub updated_sum: i64,
}

impl StorageHandle {
    pub fn fetch_task(&self, task_id: i64) -> Result<Option<Task>> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
            conn.query_row(&sql, params![task_id], task_from_row)
                .optional()
                .with_context(|| format!("loading task {task_id}"))
        })
    }

    /// Inserts `task` and returns its id. A task that already carries an id
    /// replaces the stored row with that id.
    pub fn insert_task(&self, task: &Task) -> Result<i64> {
        let title = task.title.trim();
        if title.is_empty() {
            bail!("task title cannot be empty");
        }
        let now = now_ms();
        let created_at = if task.created_at == 0 {
            now
        } else {
            task.created_at
        };
        let id = self.with_connection(|conn| {
            let id = if task.is_persisted() { Some(task.id) } else { None };
            conn.execute(
                "INSERT OR REPLACE INTO tasks (
                    id, title, description, date_time, duration, repeat_type, repeat_days,
                    category, priority, is_completed, reminders, reminder_leads, checklist,
                    tags, color_hex, emoji, is_anchored, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                         ?14, ?15, ?16, ?17, ?18, ?19)",
                params![
                    id,
                    title,
                    task.description,
                    task.date_time,
                    task.duration,
                    task.repeat_type.to_string(),
                    task.repeat_days.bits(),
                    task.category.to_string(),
                    task.priority.rank(),
                    task.is_completed,
                    to_json(&task.reminders)?,
                    to_json(&task.reminder_leads)?,
                    to_json(&task.checklist)?,
                    to_json(&task.tags)?,
                    task.color_hex,
                    task.emoji,
                    task.is_anchored,
                    created_at,
                    now,
                ],
            )
            .context("inserting task")?;
            Ok(conn.last_insert_rowid())
        })?;
        self.publish(Table::Tasks, id, ChangeKind::Inserted);
        Ok(id)
    }

    pub fn update_task(&self, task: &Task) -> Result<()> {
        let title = task.title.trim();
        if title.is_empty() {
            bail!("task title cannot be empty");
        }
        self.with_connection(|conn| {
            let updated = conn
                .execute(
                    "UPDATE tasks SET
                        title = ?2, description = ?3, date_time = ?4, duration = ?5,
                        repeat_type = ?6, repeat_days = ?7, category = ?8, priority = ?9,
                        is_completed = ?10, reminders = ?11, reminder_leads = ?12,
                        checklist = ?13, tags = ?14, color_hex = ?15, emoji = ?16,
                        is_anchored = ?17, updated_at = ?18
                     WHERE id = ?1",
                    params![
                        task.id,
                        title,
                        task.description,
                        task.date_time,
                        task.duration,
                        task.repeat_type.to_string(),
                        task.repeat_days.bits(),
                        task.category.to_string(),
                        task.priority.rank(),
                        task.is_completed,
                        to_json(&task.reminders)?,
                        to_json(&task.reminder_leads)?,
                        to_json(&task.checklist)?,
                        to_json(&task.tags)?,
                        task.color_hex,
                        task.emoji,
                        task.is_anchored,
                        now_ms(),
                    ],
                )
                .context("updating task")?;
            if updated == 0 {
                bail!("task {} not found", task.id);
            }
            Ok(())
        })?;
        self.publish(Table::Tasks, task.id, ChangeKind::Updated);
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete_task(&self, task_id: i64) -> Result<bool> {
        let removed = self.with_connection(|conn| {
            conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])
                .context("deleting task")
        })?;
        if removed > 0 {
            self.publish(Table::Tasks, task_id, ChangeKind::Deleted);
        }
        Ok(removed > 0)
    }

    /// Returns whether the task exists.
    pub fn set_task_completed(&self, task_id: i64, completed: bool) -> Result<bool> {
        let updated = self.with_connection(|conn| {
            conn.execute(
                "UPDATE tasks SET is_completed = ?1, updated_at = ?2 WHERE id = ?3",
                params![completed, now_ms(), task_id],
            )
            .context("updating task completion")
        })?;
        if updated > 0 {
            self.publish(Table::Tasks, task_id, ChangeKind::Updated);
        }
        Ok(updated > 0)
    }

    pub fn fetch_all_tasks(&self) -> Result<Vec<Task>> {
        self.with_connection(|conn| {
            query_tasks(
                conn,
                "ORDER BY date_time ASC, priority DESC",
                [],
            )
        })
    }

    /// Tasks anchored in `[start, end)`.
    pub fn fetch_tasks_in_range(&self, start: i64, end: i64) -> Result<Vec<Task>> {
        self.with_connection(|conn| {
            query_tasks(
                conn,
                "WHERE date_time >= ?1 AND date_time < ?2 ORDER BY date_time ASC",
                params![start, end],
            )
        })
    }

    pub fn fetch_tasks_in_range_with_category(
        &self,
        start: i64,
        end: i64,
        category: Category,
    ) -> Result<Vec<Task>> {
        self.with_connection(|conn| {
            query_tasks(
                conn,
                "WHERE date_time >= ?1 AND date_time < ?2 AND category = ?3
                 ORDER BY date_time ASC",
                params![start, end, category.to_string()],
            )
        })
    }

    pub fn fetch_overdue_tasks(&self, now: i64) -> Result<Vec<Task>> {
        self.with_connection(|conn| {
            query_tasks(
                conn,
                "WHERE is_completed = 0 AND date_time < ?1 ORDER BY date_time ASC",
                params![now],
            )
        })
    }

    pub fn fetch_tasks_by_category(&self, category: Category) -> Result<Vec<Task>> {
        self.with_connection(|conn| {
            query_tasks(
                conn,
                "WHERE category = ?1 ORDER BY date_time ASC",
                params![category.to_string()],
            )
        })
    }

    pub fn task_fingerprint(&self) -> Result<TaskFingerprint> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(updated_at), 0) FROM tasks",
                [],
                |row| {
                    Ok(TaskFingerprint {
                        count: row.get(0)?,
                        updated_sum: row.get(1)?,
                    })
                },
            )
            .context("computing task fingerprint")
        })
    }

    pub fn watch_all_tasks(&self) -> Result<LiveQuery<Task>> {
        let storage = self.clone();
        LiveQuery::start(
            Table::Tasks,
            self.changes().subscribe(),
            Box::new(move || storage.fetch_all_tasks()),
        )
    }

    /// Live view of tasks in `[start, end)`, optionally narrowed to one category.
    pub fn watch_tasks_in_range(
        &self,
        start: i64,
        end: i64,
        category: Option<Category>,
    ) -> Result<LiveQuery<Task>> {
        let storage = self.clone();
        LiveQuery::start(
            Table::Tasks,
            self.changes().subscribe(),
            Box::new(move || match category {
                Some(category) => storage.fetch_tasks_in_range_with_category(start, end, category),
                None => storage.fetch_tasks_in_range(start, end),
            }),
        )
    }
}

fn query_tasks<P: Params>(conn: &Connection, tail: &str, params: P) -> Result<Vec<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks {tail}");
    let mut stmt = conn.prepare(&sql).context("preparing task query")?;
    let tasks = stmt
        .query_map(params, task_from_row)?
        .collect::<Result<Vec<_>, _>>()
        .context("querying tasks")?;
    Ok(tasks)
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        date_time: row.get(3)?,
        duration: row.get(4)?,
        repeat_type: enum_column(row, 5)?,
        repeat_days: WeekdaySet::from_bits_truncate(row.get::<_, u8>(6)?),
        category: enum_column(row, 7)?,
        priority: Priority::from_rank(row.get(8)?),
        is_completed: bool_column(row, 9)?,
        reminders: json_column(row, 10)?,
        reminder_leads: json_column(row, 11)?,
        checklist: json_column(row, 12)?,
        tags: json_column(row, 13)?,
        color_hex: row.get(14)?,
        emoji: row.get(15)?,
        is_anchored: bool_column(row, 16)?,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
    })
}
