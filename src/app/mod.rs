//! Task workflows on top of the store: every edit re-derives the task's
//! reminders, persists them and, when a scheduler is attached, re-registers
//! its alarms.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Weekday;
use indexmap::IndexMap;

use crate::clock::{self, Clock, LocalZone};
use crate::config::AppConfig;
use crate::model::{Category, Task, TaskFilter};
use crate::recurrence;
use crate::reminders::{ReminderScheduler, ScheduleReport};
use crate::storage::{LiveQuery, StorageHandle};

pub mod actions;
pub mod runtime;

pub use actions::{ActionHandler, ActionOutcome};
pub use runtime::{Reactor, UserCommand};

pub struct Planner {
    storage: StorageHandle,
    clock: Arc<dyn Clock>,
    zone: LocalZone,
    first_weekday: Weekday,
    window: usize,
    scheduler: Option<Arc<ReminderScheduler>>,
}

impl Planner {
    pub fn new(storage: StorageHandle, clock: Arc<dyn Clock>, config: &AppConfig) -> Result<Self> {
        Ok(Self {
            storage,
            clock,
            zone: config.calendar.zone()?,
            first_weekday: config.calendar.first_weekday(),
            window: config.reminders.occurrence_window.max(1),
            scheduler: None,
        })
    }

    pub fn with_scheduler(mut self, scheduler: Arc<ReminderScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    pub fn zone(&self) -> &LocalZone {
        &self.zone
    }

    pub fn scheduler(&self) -> Option<&Arc<ReminderScheduler>> {
        self.scheduler.as_ref()
    }

    fn derive(&self, task: &Task) -> Vec<i64> {
        recurrence::derive_reminders(task, &self.zone, self.clock.now_ms(), self.window)
    }

    fn reschedule(&self, task: &Task) -> ScheduleReport {
        match &self.scheduler {
            Some(scheduler) => scheduler.reschedule(task),
            None => ScheduleReport::default(),
        }
    }

    pub fn add_task(&self, mut task: Task) -> Result<Task> {
        if task.title.trim().is_empty() {
            bail!("task title cannot be empty");
        }
        task.id = 0;
        task.reminders = self.derive(&task);
        task.id = self.storage.insert_task(&task).context("saving new task")?;
        let report = self.reschedule(&task);
        tracing::info!(task_id = task.id, reminders = task.reminders.len(), ?report, "task added");
        self.reload(task)
    }

    pub fn update_task(&self, mut task: Task) -> Result<Task> {
        if !task.is_persisted() {
            bail!("cannot update a task that was never saved");
        }
        task.reminders = self.derive(&task);
        self.storage
            .update_task(&task)
            .with_context(|| format!("saving task {}", task.id))?;
        let report = self.reschedule(&task);
        tracing::info!(task_id = task.id, ?report, "task updated");
        self.reload(task)
    }

    /// Cancels the task's alarms, then removes it.
    pub fn delete_task(&self, task_id: i64) -> Result<bool> {
        if let Some(scheduler) = &self.scheduler {
            scheduler.cancel(task_id);
        }
        let removed = self.storage.delete_task(task_id)?;
        tracing::info!(task_id, removed, "task deleted");
        Ok(removed)
    }

    pub fn set_completed(&self, task_id: i64, completed: bool) -> Result<Option<Task>> {
        let Some(mut task) = self.storage.fetch_task(task_id)? else {
            return Ok(None);
        };
        task.is_completed = completed;
        self.update_task(task).map(Some)
    }

    pub fn duplicate_task(&self, task_id: i64) -> Result<Option<Task>> {
        let Some(original) = self.storage.fetch_task(task_id)? else {
            return Ok(None);
        };
        let mut copy = original.clone();
        copy.id = 0;
        copy.title = format!("{} (copy)", original.title);
        copy.is_completed = false;
        copy.created_at = 0;
        copy.updated_at = 0;
        self.add_task(copy).map(Some)
    }

    /// Moves the anchor one calendar day forward, keeping local wall-clock time.
    pub fn move_to_next_day(&self, task_id: i64) -> Result<Option<Task>> {
        let Some(mut task) = self.storage.fetch_task(task_id)? else {
            return Ok(None);
        };
        task.date_time = clock::add_days(&self.zone, task.date_time, 1);
        self.update_task(task).map(Some)
    }

    pub fn task(&self, task_id: i64) -> Result<Option<Task>> {
        self.storage.fetch_task(task_id)
    }

    pub fn tasks_for_day(&self, ms: i64) -> Result<Vec<Task>> {
        let (start, end) = clock::day_bounds(&self.zone, ms);
        self.storage.fetch_tasks_in_range(start, end)
    }

    pub fn watch_day(&self, ms: i64) -> Result<LiveQuery<Task>> {
        let (start, end) = clock::day_bounds(&self.zone, ms);
        self.storage.watch_tasks_in_range(start, end, None)
    }

    /// The week containing `ms`, keyed by each local day start in order.
    /// Days without tasks are present with an empty list.
    pub fn tasks_for_week(&self, ms: i64) -> Result<IndexMap<i64, Vec<Task>>> {
        let (start, end) = clock::week_bounds(&self.zone, ms, self.first_weekday);
        let mut week: IndexMap<i64, Vec<Task>> = IndexMap::new();
        let mut day = start;
        while day < end {
            week.insert(day, Vec::new());
            day = clock::next_day_start(&self.zone, day);
        }
        for task in self.storage.fetch_tasks_in_range(start, end)? {
            let key = clock::start_of_day(&self.zone, task.date_time);
            week.entry(key).or_default().push(task);
        }
        Ok(week)
    }

    pub fn filtered_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        let now = self.clock.now_ms();
        match filter {
            TaskFilter::All => self.storage.fetch_all_tasks(),
            TaskFilter::Personal => self.storage.fetch_tasks_by_category(Category::Personal),
            TaskFilter::Work => self.storage.fetch_tasks_by_category(Category::Work),
            TaskFilter::Leisure => self.storage.fetch_tasks_by_category(Category::Leisure),
            TaskFilter::Deadlines => self.storage.fetch_overdue_tasks(now),
        }
    }

    /// Re-derives repeating tasks whose window has moved on. Only tasks whose
    /// reminders changed are saved and rescheduled. Returns how many changed.
    pub fn refresh_rolling_windows(&self) -> Result<usize> {
        let mut changed = 0;
        for task in self.storage.fetch_all_tasks()? {
            if !task.is_repeating() {
                continue;
            }
            let derived = self.derive(&task);
            if derived == task.reminders {
                continue;
            }
            let mut task = task;
            task.reminders = derived;
            self.storage.update_task(&task)?;
            self.reschedule(&task);
            changed += 1;
        }
        if changed > 0 {
            tracing::debug!(changed, "rolled reminder windows forward");
        }
        Ok(changed)
    }

    /// Re-derives and re-registers every task. Used when `run` starts and
    /// when another process edited the store.
    pub fn resync_all(&self) -> Result<ScheduleReport> {
        let mut total = ScheduleReport::default();
        for mut task in self.storage.fetch_all_tasks()? {
            let derived = self.derive(&task);
            if derived != task.reminders {
                task.reminders = derived;
                self.storage.update_task(&task)?;
            }
            total.absorb(self.reschedule(&task));
        }
        tracing::info!(report = ?total, "reminders resynchronised");
        Ok(total)
    }

    fn reload(&self, task: Task) -> Result<Task> {
        Ok(self.storage.fetch_task(task.id)?.unwrap_or(task))
    }
}
