use parking_lot::Mutex;

use crate::clock::{Clock, MINUTE_MS};
use crate::reminders::dispatch::{ActionKind, AlertId, NotificationAction, NotificationDispatcher};
use crate::reminders::ReminderScheduler;
use crate::storage::StorageHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Snoozed { until: i64 },
    Completed,
    MissingTask,
    Failed,
}

/// Applies Snooze and Done from a fired alert. Runs off the reactor thread
/// with no UI, so every failure is logged and reported as an outcome.
pub struct ActionHandler<'a> {
    storage: &'a StorageHandle,
    scheduler: &'a ReminderScheduler,
    dispatcher: &'a Mutex<NotificationDispatcher>,
    clock: &'a dyn Clock,
}

impl<'a> ActionHandler<'a> {
    pub fn new(
        storage: &'a StorageHandle,
        scheduler: &'a ReminderScheduler,
        dispatcher: &'a Mutex<NotificationDispatcher>,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            storage,
            scheduler,
            dispatcher,
            clock,
        }
    }

    pub fn handle(&self, action: NotificationAction) -> ActionOutcome {
        match action.kind {
            ActionKind::Snooze(minutes) => self.on_snooze(action.alert, action.task_id, minutes),
            ActionKind::Done => self.on_done(action.alert, action.task_id),
        }
    }

    /// Closes the alert and re-fires the task `minutes` from now in its
    /// primary slot. Completion is left alone.
    pub fn on_snooze(&self, alert: AlertId, task_id: i64, minutes: u32) -> ActionOutcome {
        self.dispatcher.lock().take(alert);
        let task = match self.storage.fetch_task(task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                tracing::info!(task_id, "snoozed task no longer exists");
                return ActionOutcome::MissingTask;
            }
            Err(err) => {
                tracing::warn!(?err, task_id, "loading task for snooze failed");
                return ActionOutcome::Failed;
            }
        };
        let until = self.clock.now_ms() + i64::from(minutes) * MINUTE_MS;
        match self
            .scheduler
            .schedule_snooze(task_id, &task.title, &task.description, until)
        {
            Ok(true) => ActionOutcome::Snoozed { until },
            Ok(false) => ActionOutcome::Failed,
            Err(err) => {
                tracing::warn!(?err, task_id, "snooze registration refused");
                ActionOutcome::Failed
            }
        }
    }

    /// Closes the alert and marks the task completed. No alarm is touched.
    pub fn on_done(&self, alert: AlertId, task_id: i64) -> ActionOutcome {
        self.dispatcher.lock().take(alert);
        match self.storage.set_task_completed(task_id, true) {
            Ok(true) => {
                tracing::info!(task_id, "task completed from reminder");
                ActionOutcome::Completed
            }
            Ok(false) => {
                tracing::info!(task_id, "completed task no longer exists");
                ActionOutcome::MissingTask
            }
            Err(err) => {
                tracing::warn!(?err, task_id, "marking task completed failed");
                ActionOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::model::Task;
    use crate::reminders::dispatch::tests::{fired, SharedNotifier};
    use crate::reminders::testing::{AlarmCall, RecordingAlarms};
    use crate::reminders::AlarmKey;
    use crate::storage::tests::init_storage;

    const T: i64 = 1_800_000_000_000;

    struct Fixture {
        _temp: tempfile::TempDir,
        storage: StorageHandle,
        alarms: Arc<RecordingAlarms>,
        clock: Arc<ManualClock>,
        scheduler: ReminderScheduler,
        dispatcher: Mutex<NotificationDispatcher>,
        notifier: SharedNotifier,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let (temp, storage) = init_storage()?;
            let alarms = Arc::new(RecordingAlarms::default());
            let clock = Arc::new(ManualClock::new(T));
            let scheduler = ReminderScheduler::new(alarms.clone(), clock.clone());
            let notifier = SharedNotifier::default();
            let dispatcher = Mutex::new(NotificationDispatcher::new(
                Box::new(notifier.clone()),
                vec![10, 30, 60],
            ));
            Ok(Self {
                _temp: temp,
                storage,
                alarms,
                clock,
                scheduler,
                dispatcher,
                notifier,
            })
        }

        fn handler(&self) -> ActionHandler<'_> {
            ActionHandler::new(
                &self.storage,
                &self.scheduler,
                &self.dispatcher,
                &*self.clock,
            )
        }

        fn task(&self, title: &str) -> anyhow::Result<i64> {
            self.storage.insert_task(&Task::new(title, T - MINUTE_MS))
        }
    }

    #[test]
    fn snooze_registers_one_alarm_in_the_primary_slot() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let id = fx.task("Take pills")?;
        let alert = fx.dispatcher.lock().fire(fired(id, T));

        let outcome = fx.handler().on_snooze(alert, id, 10);
        assert_eq!(outcome, ActionOutcome::Snoozed { until: T + 10 * MINUTE_MS });
        assert_eq!(
            fx.alarms.calls(),
            vec![AlarmCall::Register {
                key: AlarmKey::primary(id),
                fire_at: T + 10 * MINUTE_MS
            }]
        );
        assert!(!fx.storage.fetch_task(id)?.expect("task").is_completed);
        assert_eq!(*fx.notifier.withdrawn.lock(), vec![alert]);
        Ok(())
    }

    #[test]
    fn done_completes_without_registering() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let id = fx.task("Pay rent")?;
        let alert = fx.dispatcher.lock().fire(fired(id, T));

        assert_eq!(fx.handler().on_done(alert, id), ActionOutcome::Completed);
        assert!(fx.storage.fetch_task(id)?.expect("task").is_completed);
        assert!(fx.alarms.calls().is_empty());
        assert_eq!(fx.dispatcher.lock().live_alerts().count(), 0);
        Ok(())
    }

    #[test]
    fn done_for_missing_task_is_a_no_op() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let before = fx.storage.task_fingerprint()?;
        let events = fx.storage.changes().subscribe();
        let alert = fx.dispatcher.lock().fire(fired(404, T));

        assert_eq!(fx.handler().on_done(alert, 404), ActionOutcome::MissingTask);
        assert_eq!(fx.storage.task_fingerprint()?, before);
        assert_eq!(events.try_iter().count(), 0);
        assert!(fx.alarms.calls().is_empty());
        Ok(())
    }

    #[test]
    fn snooze_for_missing_task_registers_nothing() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let alert = fx.dispatcher.lock().fire(fired(404, T));
        assert_eq!(fx.handler().on_snooze(alert, 404, 30), ActionOutcome::MissingTask);
        assert!(fx.alarms.calls().is_empty());
        Ok(())
    }

    #[test]
    fn refused_snooze_reports_failure() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let id = fx.task("Walk dog")?;
        fx.alarms.deny(AlarmKey::primary(id));
        let alert = fx.dispatcher.lock().fire(fired(id, T));
        assert_eq!(fx.handler().on_snooze(alert, id, 60), ActionOutcome::Failed);
        assert!(fx.alarms.active().is_empty());
        Ok(())
    }

    #[test]
    fn action_only_closes_its_own_alert() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let id = fx.task("Standup")?;
        let first = fx.dispatcher.lock().fire(fired(id, T));
        let second = fx.dispatcher.lock().fire(fired(id, T + 1));
        let action = fx
            .dispatcher
            .lock()
            .resolve(first, ActionKind::Snooze(30))
            .expect("offered action");

        fx.handler().handle(action);
        assert_eq!(fx.dispatcher.lock().live_for_task(id), vec![second]);
        Ok(())
    }
}
