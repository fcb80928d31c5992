use std::collections::{BTreeMap, HashSet};

use parking_lot::Mutex;

use super::alarm::{AlarmBackend, AlarmError, AlarmKey, AlarmPayload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AlarmCall {
    Register { key: AlarmKey, fire_at: i64 },
    Cancel(AlarmKey),
}

/// In-memory alarm facility that records every call.
#[derive(Debug, Default)]
pub(crate) struct RecordingAlarms {
    calls: Mutex<Vec<AlarmCall>>,
    active: Mutex<BTreeMap<AlarmKey, (i64, AlarmPayload)>>,
    denied: Mutex<HashSet<AlarmKey>>,
}

impl RecordingAlarms {
    pub(crate) fn deny(&self, key: AlarmKey) {
        self.denied.lock().insert(key);
    }

    pub(crate) fn calls(&self) -> Vec<AlarmCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub(crate) fn registered_keys(&self) -> Vec<AlarmKey> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AlarmCall::Register { key, .. } => Some(key),
                AlarmCall::Cancel(_) => None,
            })
            .collect()
    }

    pub(crate) fn cancel_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, AlarmCall::Cancel(_)))
            .count()
    }

    /// Alarms currently registered and not cancelled, with their fire times.
    pub(crate) fn active(&self) -> Vec<(AlarmKey, i64)> {
        self.active
            .lock()
            .iter()
            .map(|(key, (fire_at, _))| (*key, *fire_at))
            .collect()
    }
}

impl AlarmBackend for RecordingAlarms {
    fn register(&self, fire_at: i64, key: AlarmKey, payload: AlarmPayload) -> Result<(), AlarmError> {
        self.calls.lock().push(AlarmCall::Register { key, fire_at });
        if self.denied.lock().contains(&key) {
            return Err(AlarmError::ExactAlarmRestricted);
        }
        self.active.lock().insert(key, (fire_at, payload));
        Ok(())
    }

    fn cancel(&self, key: AlarmKey) -> Result<(), AlarmError> {
        self.calls.lock().push(AlarmCall::Cancel(key));
        self.active.lock().remove(&key);
        Ok(())
    }
}
