//! The `run` event loop: fired alarms in, user actions in, periodic refresh.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{never, select, tick, Receiver};
use parking_lot::Mutex;

use super::actions::{ActionHandler, ActionOutcome};
use super::Planner;
use crate::clock;
use crate::model::Task;
use crate::reminders::dispatch::{ActionKind, AlertId, NotificationDispatcher};
use crate::reminders::{FiredAlarm, ReminderScheduler, ScheduleReport};
use crate::storage::{LiveQuery, TaskFingerprint};

/// A line typed at the `run` prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    Act { alert: AlertId, kind: ActionKind },
    Dismiss(AlertId),
    Quit,
}

impl FromStr for UserCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let alert = |raw: &str| {
            raw.parse::<AlertId>()
                .map_err(|_| anyhow!("'{raw}' is not an alert number"))
        };
        match parts.as_slice() {
            ["snooze", id, minutes] => {
                let minutes: u32 = minutes
                    .parse()
                    .map_err(|_| anyhow!("'{minutes}' is not a number of minutes"))?;
                Ok(UserCommand::Act {
                    alert: alert(id)?,
                    kind: ActionKind::Snooze(minutes),
                })
            }
            ["done", id] => Ok(UserCommand::Act {
                alert: alert(id)?,
                kind: ActionKind::Done,
            }),
            ["dismiss", id] => Ok(UserCommand::Dismiss(alert(id)?)),
            ["quit"] | ["exit"] => Ok(UserCommand::Quit),
            _ => bail!("expected 'snooze <alert> <minutes>', 'done <alert>', 'dismiss <alert>' or 'quit'"),
        }
    }
}

pub struct Reactor {
    planner: Planner,
    scheduler: Arc<ReminderScheduler>,
    dispatcher: Mutex<NotificationDispatcher>,
    fired: Receiver<FiredAlarm>,
    commands: Receiver<UserCommand>,
    refresh: Duration,
    fingerprint: Option<TaskFingerprint>,
    today: Option<(i64, LiveQuery<Task>)>,
}

impl Reactor {
    pub fn new(
        planner: Planner,
        dispatcher: NotificationDispatcher,
        fired: Receiver<FiredAlarm>,
        commands: Receiver<UserCommand>,
        refresh: Duration,
    ) -> Result<Self> {
        let Some(scheduler) = planner.scheduler().cloned() else {
            bail!("the reminder loop needs a planner with a scheduler attached");
        };
        Ok(Self {
            planner,
            scheduler,
            dispatcher: Mutex::new(dispatcher),
            fired,
            commands,
            refresh,
            fingerprint: None,
            today: None,
        })
    }

    /// Registers every stored task's reminders and starts watching today.
    pub fn start(&mut self) -> Result<ScheduleReport> {
        let report = self.planner.resync_all()?;
        self.fingerprint = Some(self.planner.storage().task_fingerprint()?);
        self.watch_today()?;
        Ok(report)
    }

    /// Runs until `shutdown` fires, the user quits or the command source closes.
    pub fn run(&mut self, shutdown: Receiver<()>) -> Result<()> {
        let fired = self.fired.clone();
        let commands = self.commands.clone();
        let ticker = tick(self.refresh);
        loop {
            let agenda = match &self.today {
                Some((_, live)) => live.events().clone(),
                None => never(),
            };
            select! {
                recv(fired) -> msg => match msg {
                    Ok(alarm) => self.handle_fired(alarm),
                    Err(_) => {
                        tracing::warn!("alarm timer stopped, leaving reminder loop");
                        break;
                    }
                },
                recv(commands) -> msg => match msg {
                    Ok(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(agenda) -> msg => match msg {
                    Ok(_) => self.refresh_agenda(),
                    Err(_) => self.today = None,
                },
                recv(ticker) -> _ => self.tick(),
                recv(shutdown) -> _ => break,
            }
        }
        tracing::info!("reminder loop stopped");
        Ok(())
    }

    pub fn handle_fired(&mut self, alarm: FiredAlarm) {
        self.scheduler.mark_fired(alarm.payload.task_id, alarm.key);
        self.dispatcher.lock().fire(alarm);
    }

    /// Returns `false` when the loop should stop.
    pub fn handle_command(&mut self, command: UserCommand) -> bool {
        match command {
            UserCommand::Act { alert, kind } => {
                let resolved = self.dispatcher.lock().resolve(alert, kind);
                match resolved {
                    Some(action) => {
                        let outcome = self.action_handler().handle(action);
                        match outcome {
                            ActionOutcome::Snoozed { until } => tracing::info!(
                                task_id = action.task_id,
                                until = %clock::format_date_time(self.planner.zone(), until),
                                "snoozed"
                            ),
                            other => tracing::info!(task_id = action.task_id, ?other, "action applied"),
                        }
                    }
                    None => tracing::warn!(%alert, %kind, "no live alert offers that action"),
                }
                true
            }
            UserCommand::Dismiss(alert) => {
                if !self.dispatcher.lock().dismiss(alert) {
                    tracing::warn!(%alert, "no live alert with that number");
                }
                true
            }
            UserCommand::Quit => false,
        }
    }

    /// Rolls reminder windows forward, picks up edits made by other
    /// processes and follows the day boundary.
    pub fn tick(&mut self) {
        if let Err(err) = self.planner.refresh_rolling_windows() {
            tracing::warn!(?err, "refreshing reminder windows failed");
        }
        match self.planner.storage().task_fingerprint() {
            Ok(current) if self.fingerprint != Some(current) => {
                tracing::debug!(?current, "task table changed, resyncing");
                if let Err(err) = self.planner.resync_all() {
                    tracing::warn!(?err, "resync after outside edit failed");
                }
                self.fingerprint = self.planner.storage().task_fingerprint().ok();
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(?err, "reading task fingerprint failed"),
        }
        let today = clock::start_of_day(self.planner.zone(), self.planner.clock().now_ms());
        if self.today.as_ref().map(|(day, _)| *day) != Some(today) {
            if let Err(err) = self.watch_today() {
                tracing::warn!(?err, "watching today's agenda failed");
            }
        }
    }

    pub fn live_alerts(&self) -> usize {
        self.dispatcher.lock().live_alerts().count()
    }

    pub fn today_agenda(&self) -> &[Task] {
        self.today
            .as_ref()
            .map(|(_, live)| live.current())
            .unwrap_or_default()
    }

    fn refresh_agenda(&mut self) {
        let Some((_, live)) = self.today.as_mut() else {
            return;
        };
        match live.refresh() {
            Ok(()) => tracing::info!(tasks = live.current().len(), "today's agenda changed"),
            Err(err) => tracing::warn!(?err, "refreshing today's agenda failed"),
        }
    }

    fn watch_today(&mut self) -> Result<()> {
        let now = self.planner.clock().now_ms();
        let day = clock::start_of_day(self.planner.zone(), now);
        let live = self.planner.watch_day(now)?;
        tracing::info!(
            day = %clock::format_date(self.planner.zone(), day),
            tasks = live.current().len(),
            "watching today's agenda"
        );
        self.today = Some((day, live));
        Ok(())
    }

    fn action_handler(&self) -> ActionHandler<'_> {
        ActionHandler::new(
            self.planner.storage(),
            &self.scheduler,
            &self.dispatcher,
            self.planner.clock(),
        )
    }
}
