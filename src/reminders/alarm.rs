//! Alarm facility: deterministic keys, the backend seam and an in-process
//! timer thread that delivers due alarms over a channel.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::clock::Clock;

const REMINDER_BIT: u64 = 1 << 63;
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
/// Longest the timer sleeps before re-reading the clock.
const MAX_IDLE: Duration = Duration::from_secs(1);

/// Identity of one registered alarm. Registering an existing key replaces
/// the earlier alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlarmKey(u64);

impl AlarmKey {
    /// The task's single primary slot, used for snoozes.
    pub fn primary(task_id: i64) -> Self {
        AlarmKey(task_id as u64 & !REMINDER_BIT)
    }

    /// Stable key for the reminder of `task_id` firing at `fire_at`.
    pub fn reminder(task_id: i64, fire_at: i64) -> Self {
        let mut hash = FNV_OFFSET;
        for byte in task_id.to_le_bytes().into_iter().chain(fire_at.to_le_bytes()) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        AlarmKey(hash | REMINDER_BIT)
    }

    pub fn is_reminder(self) -> bool {
        self.0 & REMINDER_BIT != 0
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AlarmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for AlarmKey {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s.trim(), 16).map(AlarmKey)
    }
}

/// What a firing carries back to the notification surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmPayload {
    pub task_id: i64,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredAlarm {
    pub key: AlarmKey,
    pub fire_at: i64,
    pub payload: AlarmPayload,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AlarmError {
    #[error("notification permission denied")]
    PermissionDenied,
    #[error("exact alarms are restricted on this device")]
    ExactAlarmRestricted,
    #[error("alarm facility unavailable: {0}")]
    Unavailable(String),
}

/// One-shot, wake-capable alarms keyed by [`AlarmKey`].
pub trait AlarmBackend: Send + Sync {
    fn register(&self, fire_at: i64, key: AlarmKey, payload: AlarmPayload) -> Result<(), AlarmError>;

    /// Cancelling an unknown key is not an error.
    fn cancel(&self, key: AlarmKey) -> Result<(), AlarmError>;
}

struct PendingAlarm {
    fire_at: i64,
    payload: AlarmPayload,
}

#[derive(Default)]
struct TimerState {
    pending: HashMap<AlarmKey, PendingAlarm>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    wake: Condvar,
    clock: Arc<dyn Clock>,
}

/// Timer thread backing [`AlarmBackend`] inside the `run` process.
pub struct AlarmService {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl AlarmService {
    pub fn start(clock: Arc<dyn Clock>) -> Result<(Self, Receiver<FiredAlarm>)> {
        let (tx, rx) = unbounded();
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::default()),
            wake: Condvar::new(),
            clock,
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("alarm-timer".into())
            .spawn(move || run_timer(&worker_shared, &tx))
            .context("spawning alarm timer thread")?;
        Ok((
            Self {
                shared,
                worker: Some(worker),
            },
            rx,
        ))
    }

    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn is_pending(&self, key: AlarmKey) -> bool {
        self.shared.state.lock().pending.contains_key(&key)
    }

    /// Makes the timer re-read the clock now.
    pub fn poke(&self) {
        self.shared.wake.notify_all();
    }

    pub fn shutdown(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("alarm timer thread panicked");
            }
        }
    }
}

impl Drop for AlarmService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl AlarmBackend for AlarmService {
    fn register(&self, fire_at: i64, key: AlarmKey, payload: AlarmPayload) -> Result<(), AlarmError> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(AlarmError::Unavailable("alarm timer stopped".into()));
        }
        let replaced = state
            .pending
            .insert(key, PendingAlarm { fire_at, payload })
            .is_some();
        drop(state);
        tracing::debug!(%key, fire_at, replaced, "alarm registered");
        self.shared.wake.notify_all();
        Ok(())
    }

    fn cancel(&self, key: AlarmKey) -> Result<(), AlarmError> {
        let removed = self.shared.state.lock().pending.remove(&key).is_some();
        tracing::debug!(%key, removed, "alarm cancelled");
        Ok(())
    }
}

fn run_timer(shared: &Shared, tx: &Sender<FiredAlarm>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let now = shared.clock.now_ms();
        let due: Vec<AlarmKey> = state
            .pending
            .iter()
            .filter(|(_, alarm)| alarm.fire_at <= now)
            .map(|(key, _)| *key)
            .collect();
        if !due.is_empty() {
            let mut fired: Vec<FiredAlarm> = due
                .into_iter()
                .filter_map(|key| {
                    state.pending.remove(&key).map(|alarm| FiredAlarm {
                        key,
                        fire_at: alarm.fire_at,
                        payload: alarm.payload,
                    })
                })
                .collect();
            fired.sort_by_key(|alarm| alarm.fire_at);
            for alarm in fired {
                tracing::debug!(key = %alarm.key, task_id = alarm.payload.task_id, "alarm fired");
                if tx.send(alarm).is_err() {
                    tracing::debug!("alarm receiver gone, stopping timer");
                    return;
                }
            }
            continue;
        }

        let wait = state
            .pending
            .values()
            .map(|alarm| alarm.fire_at)
            .min()
            .map(|next| Duration::from_millis((next - now).max(1) as u64).min(MAX_IDLE))
            .unwrap_or(MAX_IDLE);
        shared.wake.wait_for(&mut state, wait);
    }
}
