// src/task/ledger.rs

//! Retry bookkeeping: failure counts per action identity and the policy
//! that turns a count into "run", "wait then run" or "give up".

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use super::{Params, Task};
use crate::config::TaskSection;

/// What the worker should do with a task given its failure history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Execute,
    Delay(Duration),
    GiveUp,
}

/// Linear backoff with a cap and a retry ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_unit: Duration,
    pub backoff_cap: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_unit: Duration::from_secs(1),
            backoff_cap: 60,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(section: &TaskSection) -> Self {
        Self {
            max_retries: section.max_retries,
            backoff_unit: Duration::from_millis(section.backoff_unit_ms),
            backoff_cap: section.backoff_cap,
        }
    }

    /// Delay before the next attempt: `min(failcount, cap)` units,
    /// saturating at `Duration::MAX`.
    pub fn backoff(&self, failcount: u32) -> Duration {
        self.backoff_unit
            .checked_mul(failcount.min(self.backoff_cap))
            .unwrap_or(Duration::MAX)
    }

    /// `max_override` is the task's own `maxRetries`, if any.
    pub fn decide(&self, failcount: u32, max_override: Option<u32>) -> RetryDecision {
        let ceiling = max_override.unwrap_or(self.max_retries);
        if failcount >= ceiling {
            RetryDecision::GiveUp
        } else if failcount > 0 {
            RetryDecision::Delay(self.backoff(failcount))
        } else {
            RetryDecision::Execute
        }
    }
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    task: Task,
    failcount: u32,
}

/// Failure counts keyed by `action_id`.
///
/// Owned by the dispatcher's coordinating loop; lives as long as the
/// process does.
#[derive(Debug, Default)]
pub struct RetryLedger {
    entries: HashMap<String, LedgerEntry>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more failure for the task's identity and remember the
    /// failed task. Returns the new count.
    pub fn record_failure(&mut self, task: &Task) -> u32 {
        let failcount = self.failcount(task) + 1;
        debug!(action_id = %task.action_id, failcount, "recording task failure");
        self.entries.insert(
            task.action_id.clone(),
            LedgerEntry {
                task: task.clone(),
                failcount,
            },
        );
        failcount
    }

    pub fn failcount(&self, task: &Task) -> u32 {
        self.failcount_of(&task.action_id)
    }

    pub fn failcount_of(&self, action_id: &str) -> u32 {
        self.entries.get(action_id).map(|e| e.failcount).unwrap_or(0)
    }

    /// Drop the entry for the task's identity. Returns whether one existed.
    pub fn forget(&mut self, task: &Task) -> bool {
        self.entries.remove(&task.action_id).is_some()
    }

    /// Params of the last failed attempt with this identity.
    pub fn failed_params(&self, action_id: &str) -> Option<&Params> {
        self.entries.get(action_id).map(|e| &e.task.params)
    }

    pub fn contains(&self, action_id: &str) -> bool {
        self.entries.contains_key(action_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tasks currently carrying failures, for diagnostics.
    pub fn failed_tasks(&self) -> impl Iterator<Item = (&Task, u32)> {
        self.entries.values().map(|e| (&e.task, e.failcount))
    }
}
