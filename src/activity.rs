//! Activity bookkeeping for the watcher: the recent-actions list shown to the
//! operator, trigger totals, and the trailing human-input window.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

const ACTIVITY_CAPACITY: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Local>,
    pub action: String,
    pub details: String,
}

/// Newest-first list of recent actions plus trigger counters.
#[derive(Debug, Default)]
pub struct ActivityLog {
    entries: VecDeque<ActivityEntry>,
    total_triggers: u64,
    last_triggered: Option<DateTime<Local>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, action: &str, details: &str) {
        self.entries.push_front(ActivityEntry {
            timestamp: Local::now(),
            action: action.to_string(),
            details: details.to_string(),
        });
        self.entries.truncate(ACTIVITY_CAPACITY);
    }

    /// Count one auto-continue attempt (any tier).
    pub fn mark_triggered(&mut self) {
        self.total_triggers += 1;
        self.last_triggered = Some(Local::now());
    }

    pub fn total_triggers(&self) -> u64 {
        self.total_triggers
    }

    pub fn last_triggered(&self) -> Option<DateTime<Local>> {
        self.last_triggered
    }

    #[cfg(test)]
    pub fn latest(&self) -> Option<&ActivityEntry> {
        self.entries.front()
    }

    #[cfg(test)]
    pub fn entries(&self) -> impl Iterator<Item = &ActivityEntry> {
        self.entries.iter()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Numbered log, newest first.
    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return "No recent auto-continue activity\n".to_string();
        }
        let mut out = String::from("Auto-continue activity log:\n\n");
        for (i, entry) in self.entries.iter().enumerate() {
            let _ = writeln!(
                out,
                "{}. [{}] {}: {}",
                i + 1,
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.action,
                entry.details
            );
        }
        out
    }
}

/// Trailing window since the last confirmed human-originated action.
#[derive(Debug)]
pub struct InputTracker {
    window: Duration,
    last_human_input: Option<Instant>,
}

impl InputTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_human_input: None,
        }
    }

    pub fn record_human_input(&mut self) {
        self.last_human_input = Some(Instant::now());
    }

    pub fn is_recent(&self) -> bool {
        self.last_human_input
            .is_some_and(|at| at.elapsed() < self.window)
    }

    #[cfg(test)]
    pub fn clear(&mut self) {
        self.last_human_input = None;
    }
}
