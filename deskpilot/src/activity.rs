use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// Number of recent actions the daemon remembers.
pub const MAX_ACTIVITIES: usize = 10;

/// One recorded CLI action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    pub label: String,
    pub timestamp: DateTime<Local>,
}

/// Most-recent-first list of recent activity labels.
///
/// Shared between the accept loop (writer) and the event loop (reader), so
/// every access goes through the mutex. Holds at most `capacity` entries;
/// recording into a full log evicts the oldest entry.
pub struct ActivityLog {
    entries: Mutex<VecDeque<ActivityEntry>>,
    capacity: usize,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_ACTIVITIES)
    }

    /// A zero capacity is bumped to one so `record` always keeps the newest entry.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity + 1)),
            capacity,
        }
    }

    /// Records `label` as the newest entry, stamped with the current time.
    pub fn record(&self, label: impl Into<String>) {
        self.record_at(label, Local::now());
    }

    pub fn record_at(&self, label: impl Into<String>, timestamp: DateTime<Local>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push_front(ActivityEntry {
            label: label.into(),
            timestamp,
        });
        entries.truncate(self.capacity);
    }

    /// Copies the entries out under the lock, newest first.
    pub fn snapshot(&self) -> Vec<ActivityEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}
