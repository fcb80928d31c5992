//! Change feed and live queries over the store.
//!
//! Every successful write publishes a [`ChangeEvent`]. A [`LiveQuery`] keeps
//! the latest result of one query and re-runs it whenever a write touches
//! its table.

use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Tasks,
    Notes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: Table,
    pub id: i64,
    pub kind: ChangeKind,
}

#[derive(Debug, Default)]
pub struct ChangeFeed {
    subscribers: Mutex<Vec<Sender<ChangeEvent>>>,
}

impl ChangeFeed {
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: ChangeEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event).is_ok());
        tracing::trace!(?event, listeners = subscribers.len(), "published change");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

type QueryFn<T> = Box<dyn Fn() -> Result<Vec<T>> + Send>;

pub struct LiveQuery<T> {
    table: Table,
    events: Receiver<ChangeEvent>,
    query: QueryFn<T>,
    current: Vec<T>,
}

impl<T> LiveQuery<T> {
    pub(crate) fn start(table: Table, events: Receiver<ChangeEvent>, query: QueryFn<T>) -> Result<Self> {
        let current = query()?;
        Ok(Self {
            table,
            events,
            query,
            current,
        })
    }

    pub fn current(&self) -> &[T] {
        &self.current
    }

    pub fn events(&self) -> &Receiver<ChangeEvent> {
        &self.events
    }

    /// Applies any writes already published. Returns whether the snapshot was refreshed.
    pub fn poll(&mut self) -> Result<bool> {
        let relevant = self
            .events
            .try_iter()
            .fold(false, |seen, event| seen || event.table == self.table);
        if relevant {
            self.current = (self.query)()?;
        }
        Ok(relevant)
    }

    /// Re-runs the query and drops any queued events.
    pub fn refresh(&mut self) -> Result<()> {
        let _ = self.events.try_iter().count();
        self.current = (self.query)()?;
        Ok(())
    }

    /// Blocks until a write touches the table and returns the refreshed
    /// snapshot, or `None` once the feed is gone or `timeout` passes.
    pub fn next_update(&mut self, timeout: Duration) -> Result<Option<&[T]>> {
        loop {
            match self.events.recv_timeout(timeout) {
                Ok(event) if event.table == self.table => {
                    // Coalesce a burst of writes into one refresh.
                    let _ = self.events.try_iter().count();
                    self.current = (self.query)()?;
                    return Ok(Some(&self.current));
                }
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Ok(None)
                }
            }
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for LiveQuery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuery")
            .field("table", &self.table)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}
