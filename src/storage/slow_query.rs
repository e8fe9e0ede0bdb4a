//! Bounded in-memory log of slow store calls, for diagnostics.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const SLOW_QUERY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct SlowQuery {
    pub label: String,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Ring buffer: once full, each new entry evicts the oldest.
#[derive(Debug)]
pub struct SlowQueryLog {
    capacity: usize,
    entries: Mutex<VecDeque<SlowQuery>>,
}

impl Default for SlowQueryLog {
    fn default() -> Self {
        Self::new(SLOW_QUERY_CAPACITY)
    }
}

impl SlowQueryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, label: &str, elapsed: Duration) {
        let entry = SlowQuery {
            label: label.to_string(),
            duration_ms: elapsed.as_millis() as u64,
            recorded_at: Utc::now(),
        };
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if self.capacity == 0 {
            return;
        }
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<SlowQuery> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
