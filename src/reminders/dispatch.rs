//! Fired reminders waiting for the user.
//!
//! An alert is live from the moment its alarm fires until an action or a
//! dismissal removes it. Several alerts for the same task can be live at
//! once; each is addressed by its own [`AlertId`].

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use anyhow::{Context, Result};
use indexmap::IndexMap;

use super::alarm::{AlarmKey, AlarmPayload, FiredAlarm};
use crate::clock::{self, LocalZone};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertId(pub u32);

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AlertId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().trim_start_matches('#').parse().map(AlertId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Snooze(u32),
    Done,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Snooze(minutes) => write!(f, "snooze {minutes}"),
            ActionKind::Done => f.write_str("done"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationAction {
    pub alert: AlertId,
    pub task_id: i64,
    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub id: AlertId,
    pub key: AlarmKey,
    pub fire_at: i64,
    pub payload: AlarmPayload,
    pub actions: Vec<ActionKind>,
}

/// Surface that shows alerts to the user.
pub trait Notifier: Send {
    fn show(&mut self, alert: &Alert) -> Result<()>;
    fn withdraw(&mut self, alert: &Alert) -> Result<()>;
}

/// Writes alerts as plain text, one block per alert.
pub struct TerminalNotifier<W> {
    out: W,
    zone: LocalZone,
}

impl<W: Write + Send> TerminalNotifier<W> {
    pub fn new(out: W, zone: LocalZone) -> Self {
        Self { out, zone }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Notifier for TerminalNotifier<W> {
    fn show(&mut self, alert: &Alert) -> Result<()> {
        let when = clock::format_time(&self.zone, alert.fire_at);
        writeln!(self.out, "[{}] {} ({when})", alert.id, alert.payload.title)
            .context("writing alert")?;
        if !alert.payload.description.is_empty() {
            writeln!(self.out, "    {}", alert.payload.description).context("writing alert")?;
        }
        let actions: Vec<String> = alert
            .actions
            .iter()
            .map(|action| match action {
                ActionKind::Snooze(minutes) => format!("snooze {} {minutes}", alert.id),
                ActionKind::Done => format!("done {}", alert.id),
            })
            .collect();
        writeln!(self.out, "    {} | dismiss {}", actions.join(" | "), alert.id)
            .context("writing alert")?;
        self.out.flush().context("flushing alert")
    }

    fn withdraw(&mut self, alert: &Alert) -> Result<()> {
        writeln!(self.out, "[{}] closed", alert.id).context("writing alert")?;
        self.out.flush().context("flushing alert")
    }
}

pub struct NotificationDispatcher {
    notifier: Box<dyn Notifier>,
    snooze_minutes: Vec<u32>,
    live: IndexMap<AlertId, Alert>,
    next_id: u32,
}

impl fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("snooze_minutes", &self.snooze_minutes)
            .field("live", &self.live.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl NotificationDispatcher {
    pub fn new(notifier: Box<dyn Notifier>, snooze_minutes: Vec<u32>) -> Self {
        Self {
            notifier,
            snooze_minutes,
            live: IndexMap::new(),
            next_id: 1,
        }
    }

    /// Turns a fired alarm into a live alert and shows it.
    pub fn fire(&mut self, fired: FiredAlarm) -> AlertId {
        let id = AlertId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let mut actions: Vec<ActionKind> = self
            .snooze_minutes
            .iter()
            .map(|minutes| ActionKind::Snooze(*minutes))
            .collect();
        actions.push(ActionKind::Done);
        let alert = Alert {
            id,
            key: fired.key,
            fire_at: fired.fire_at,
            payload: fired.payload,
            actions,
        };
        if let Err(err) = self.notifier.show(&alert) {
            tracing::warn!(?err, alert = %id, "failed to show alert");
        }
        tracing::info!(alert = %id, task_id = alert.payload.task_id, "reminder fired");
        self.live.insert(id, alert);
        id
    }

    /// Builds the action the user asked for on a live alert, if that alert
    /// exists and offers it.
    pub fn resolve(&self, alert: AlertId, kind: ActionKind) -> Option<NotificationAction> {
        let live = self.live.get(&alert)?;
        if !live.actions.contains(&kind) {
            return None;
        }
        Some(NotificationAction {
            alert,
            task_id: live.payload.task_id,
            kind,
        })
    }

    /// Removes the alert because an action was taken on it.
    pub fn take(&mut self, alert: AlertId) -> Option<Alert> {
        let removed = self.live.shift_remove(&alert)?;
        if let Err(err) = self.notifier.withdraw(&removed) {
            tracing::warn!(?err, %alert, "failed to withdraw alert");
        }
        Some(removed)
    }

    /// Closes the alert without touching its task.
    pub fn dismiss(&mut self, alert: AlertId) -> bool {
        let dismissed = self.take(alert).is_some();
        if dismissed {
            tracing::debug!(%alert, "alert dismissed");
        }
        dismissed
    }

    pub fn live_alerts(&self) -> impl Iterator<Item = &Alert> {
        self.live.values()
    }

    pub fn live_for_task(&self, task_id: i64) -> Vec<AlertId> {
        self.live
            .values()
            .filter(|alert| alert.payload.task_id == task_id)
            .map(|alert| alert.id)
            .collect()
    }

    pub fn snooze_choices(&self) -> &[u32] {
        &self.snooze_minutes
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// Notifier that remembers what it showed.
    #[derive(Clone, Default)]
    pub(crate) struct SharedNotifier {
        pub(crate) shown: Arc<Mutex<Vec<AlertId>>>,
        pub(crate) withdrawn: Arc<Mutex<Vec<AlertId>>>,
    }

    impl Notifier for SharedNotifier {
        fn show(&mut self, alert: &Alert) -> Result<()> {
            self.shown.lock().push(alert.id);
            Ok(())
        }

        fn withdraw(&mut self, alert: &Alert) -> Result<()> {
            self.withdrawn.lock().push(alert.id);
            Ok(())
        }
    }

    pub(crate) fn fired(task_id: i64, fire_at: i64) -> FiredAlarm {
        FiredAlarm {
            key: AlarmKey::reminder(task_id, fire_at),
            fire_at,
            payload: AlarmPayload {
                task_id,
                title: format!("Task {task_id}"),
                description: "details".into(),
            },
        }
    }

    #[test]
    fn fired_alert_offers_configured_snoozes_and_done() {
        let notifier = SharedNotifier::default();
        let mut dispatcher =
            NotificationDispatcher::new(Box::new(notifier.clone()), vec![10, 30, 60]);
        let id = dispatcher.fire(fired(42, 1_000));
        let alert = dispatcher.live_alerts().next().expect("live alert");
        assert_eq!(
            alert.actions,
            vec![
                ActionKind::Snooze(10),
                ActionKind::Snooze(30),
                ActionKind::Snooze(60),
                ActionKind::Done
            ]
        );
        assert_eq!(*notifier.shown.lock(), vec![id]);
        assert!(dispatcher.resolve(id, ActionKind::Snooze(15)).is_none());
        assert_eq!(
            dispatcher.resolve(id, ActionKind::Done),
            Some(NotificationAction {
                alert: id,
                task_id: 42,
                kind: ActionKind::Done
            })
        );
    }

    #[test]
    fn alerts_for_one_task_are_independent() {
        let notifier = SharedNotifier::default();
        let mut dispatcher = NotificationDispatcher::new(Box::new(notifier.clone()), vec![10]);
        let first = dispatcher.fire(fired(7, 1_000));
        let second = dispatcher.fire(fired(7, 2_000));
        assert_ne!(first, second);
        assert_eq!(dispatcher.live_for_task(7), vec![first, second]);

        assert!(dispatcher.take(first).is_some());
        assert_eq!(dispatcher.live_for_task(7), vec![second]);
        assert_eq!(*notifier.withdrawn.lock(), vec![first]);
        assert!(dispatcher.resolve(first, ActionKind::Done).is_none());
    }

    #[test]
    fn dismiss_only_succeeds_once() {
        let mut dispatcher =
            NotificationDispatcher::new(Box::new(SharedNotifier::default()), vec![10]);
        let id = dispatcher.fire(fired(1, 1_000));
        assert!(dispatcher.dismiss(id));
        assert!(!dispatcher.dismiss(id));
    }

    #[test]
    fn terminal_notifier_lists_actions() -> anyhow::Result<()> {
        let zone = LocalZone::parse("utc")?;
        let mut notifier = TerminalNotifier::new(Vec::new(), zone);
        let alert = Alert {
            id: AlertId(3),
            key: AlarmKey::primary(9),
            fire_at: 0,
            payload: AlarmPayload {
                task_id: 9,
                title: "Stretch".into(),
                description: String::new(),
            },
            actions: vec![ActionKind::Snooze(10), ActionKind::Done],
        };
        notifier.show(&alert)?;
        let text = String::from_utf8(notifier.into_inner())?;
        assert!(text.starts_with("[3] Stretch (00:00)"), "{text}");
        assert!(text.contains("snooze 3 10 | done 3 | dismiss 3"), "{text}");
        Ok(())
    }
}
