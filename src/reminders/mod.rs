//! Registration of task reminders with the alarm facility.
//!
//! The scheduler only registers instants it is handed; deciding which
//! instants a task should remind at belongs to [`crate::recurrence`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::model::Task;

pub mod alarm;
pub mod dispatch;
#[cfg(test)]
pub(crate) mod testing;

pub use alarm::{AlarmBackend, AlarmError, AlarmKey, AlarmPayload, AlarmService, FiredAlarm};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub registered: usize,
    pub skipped_past: usize,
    pub failed: usize,
}

impl ScheduleReport {
    pub fn absorb(&mut self, other: ScheduleReport) {
        self.registered += other.registered;
        self.skipped_past += other.skipped_past;
        self.failed += other.failed;
    }
}

pub struct ReminderScheduler {
    backend: Arc<dyn AlarmBackend>,
    clock: Arc<dyn Clock>,
    registry: Mutex<HashMap<i64, BTreeSet<AlarmKey>>>,
    task_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for ReminderScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReminderScheduler")
            .field("registry", &*self.registry.lock())
            .finish_non_exhaustive()
    }
}

impl ReminderScheduler {
    pub fn new(backend: Arc<dyn AlarmBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            registry: Mutex::new(HashMap::new()),
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Registers every future instant in `task.reminders`. Past instants are
    /// skipped and a refused registration does not stop the rest.
    pub fn schedule(&self, task: &Task) -> ScheduleReport {
        let lock = self.task_lock(task.id);
        let _guard = lock.lock();
        self.schedule_locked(task)
    }

    /// Cancels every alarm registered for `task_id`, one call per key.
    /// Returns how many keys were cancelled.
    pub fn cancel(&self, task_id: i64) -> usize {
        let lock = self.task_lock(task_id);
        let cancelled = {
            let _guard = lock.lock();
            self.cancel_matching(task_id, |_| true)
        };
        self.release_task_lock(task_id, lock);
        cancelled
    }

    /// Cancels the task's reminder keys, then registers the current set.
    /// A pending snooze in the primary slot stays registered unless the
    /// task is completed. Serialized per task id.
    pub fn reschedule(&self, task: &Task) -> ScheduleReport {
        let lock = self.task_lock(task.id);
        let completed = task.is_completed;
        let report = {
            let _guard = lock.lock();
            self.cancel_matching(task.id, |key| completed || key.is_reminder());
            self.schedule_locked(task)
        };
        self.release_task_lock(task.id, lock);
        report
    }

    /// Puts one alarm at `at` in the task's primary slot, replacing any
    /// earlier snooze. Returns `Ok(false)` when `at` is not in the future.
    pub fn schedule_snooze(
        &self,
        task_id: i64,
        title: &str,
        description: &str,
        at: i64,
    ) -> Result<bool, AlarmError> {
        let now = self.clock.now_ms();
        if at <= now {
            tracing::debug!(task_id, at, now, "snooze instant already past");
            return Ok(false);
        }
        let lock = self.task_lock(task_id);
        let _guard = lock.lock();
        let key = AlarmKey::primary(task_id);
        let payload = AlarmPayload {
            task_id,
            title: title.to_string(),
            description: description.to_string(),
        };
        self.backend.register(at, key, payload)?;
        self.registry.lock().entry(task_id).or_default().insert(key);
        tracing::info!(task_id, at, "snooze registered");
        Ok(true)
    }

    /// Forgets a key that has fired.
    pub fn mark_fired(&self, task_id: i64, key: AlarmKey) {
        let mut registry = self.registry.lock();
        if let Some(keys) = registry.get_mut(&task_id) {
            keys.remove(&key);
            if keys.is_empty() {
                registry.remove(&task_id);
            }
        }
    }

    pub fn pending_keys(&self, task_id: i64) -> Vec<AlarmKey> {
        self.registry
            .lock()
            .get(&task_id)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn tracked_tasks(&self) -> usize {
        self.registry.lock().len()
    }

    fn task_lock(&self, task_id: i64) -> Arc<Mutex<()>> {
        Arc::clone(self.task_locks.lock().entry(task_id).or_default())
    }

    /// Forgets the per-task lock once no keys remain and nobody else holds it.
    fn release_task_lock(&self, task_id: i64, lock: Arc<Mutex<()>>) {
        let mut locks = self.task_locks.lock();
        if self.registry.lock().contains_key(&task_id) {
            return;
        }
        // One reference in the map, one held here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&task_id);
        }
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.task_locks.lock().len()
    }

    fn schedule_locked(&self, task: &Task) -> ScheduleReport {
        let mut report = ScheduleReport::default();
        if !task.is_persisted() {
            tracing::warn!(title = %task.title, "refusing to schedule an unsaved task");
            return report;
        }
        let now = self.clock.now_ms();
        let mut registered = Vec::new();
        for &fire_at in &task.reminders {
            if fire_at <= now {
                report.skipped_past += 1;
                continue;
            }
            let key = AlarmKey::reminder(task.id, fire_at);
            let payload = AlarmPayload {
                task_id: task.id,
                title: task.title.clone(),
                description: task.description.clone(),
            };
            match self.backend.register(fire_at, key, payload) {
                Ok(()) => {
                    registered.push(key);
                    report.registered += 1;
                }
                Err(err) => {
                    tracing::warn!(?err, task_id = task.id, fire_at, "reminder registration refused");
                    report.failed += 1;
                }
            }
        }
        if !registered.is_empty() {
            self.registry
                .lock()
                .entry(task.id)
                .or_default()
                .extend(registered);
        }
        tracing::debug!(task_id = task.id, ?report, "reminders scheduled");
        report
    }

    fn cancel_matching(&self, task_id: i64, matches: impl Fn(AlarmKey) -> bool) -> usize {
        let keys: Vec<AlarmKey> = {
            let mut registry = self.registry.lock();
            let Some(registered) = registry.get_mut(&task_id) else {
                return 0;
            };
            let keys: Vec<AlarmKey> = registered.iter().copied().filter(|key| matches(*key)).collect();
            for key in &keys {
                registered.remove(key);
            }
            if registered.is_empty() {
                registry.remove(&task_id);
            }
            keys
        };
        for key in &keys {
            if let Err(err) = self.backend.cancel(*key) {
                tracing::warn!(?err, task_id, %key, "alarm cancel failed");
            }
        }
        keys.len()
    }
}
