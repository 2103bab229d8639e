// src/task/mod.rs

//! Task data model.
//!
//! A [`Task`] is one unit of work produced by a listener. Its shape is
//! fixed at creation; the dispatcher mutates only `state` and `params`.
//!
//! - [`params`] holds the open key/value bag and its well-known keys.
//! - [`ledger`] tracks failures per action identity for the retry loop.

pub mod ledger;
pub mod params;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use ledger::{RetryDecision, RetryLedger, RetryPolicy};
pub use params::Params;

/// Which listener produced a task. Decides the pool, the reporter and the
/// processed queue the result is pushed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Broker,
    Scheduler,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Broker => f.write_str("broker"),
            Origin::Scheduler => f.write_str("scheduler"),
        }
    }
}

/// `NEW -> PROCESSING -> {DONE | FAILED}`, plus `FAILED -> NEW` for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    New,
    Processing,
    Done,
    Failed,
}

impl TaskState {
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::New, TaskState::Processing)
                | (TaskState::Processing, TaskState::Done)
                | (TaskState::Processing, TaskState::Failed)
                | (TaskState::Failed, TaskState::New)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
    Backup,
    QuotaReport,
    MalwareReport,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Backup => "backup",
            Action::QuotaReport => "quota_report",
            Action::MalwareReport => "malware_report",
        }
    }

    /// `create`, `update` and `delete` go through the processing sequence.
    pub fn is_mutating(self) -> bool {
        matches!(self, Action::Create | Action::Update | Action::Delete)
    }

    /// Read-only actions answered by a resource collector.
    pub fn is_query(self) -> bool {
        matches!(self, Action::QuotaReport | Action::MalwareReport)
    }

    /// Properties a query action collects into `params.data`.
    pub fn reported_properties(self) -> &'static [&'static str] {
        match self {
            Action::QuotaReport => &["quotaUsed"],
            Action::MalwareReport => &["infectedFiles"],
            _ => &[],
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            "backup" => Ok(Action::Backup),
            "quota_report" => Ok(Action::QuotaReport),
            "malware_report" => Ok(Action::MalwareReport),
            other => Err(format!("unknown task action: {other}")),
        }
    }
}

/// The unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Correlation id used to route the result back to its origin.
    /// `None` for fire-and-forget work nobody waits on.
    pub tag: Option<String>,
    pub origin: Origin,
    pub operation_id: String,
    /// Stable identity for retry bookkeeping.
    pub action_id: String,
    pub res_type: String,
    pub action: Action,
    pub params: Params,
    pub state: TaskState,
}

impl Task {
    pub fn new(
        tag: Option<String>,
        origin: Origin,
        operation_id: impl Into<String>,
        action_id: impl Into<String>,
        res_type: impl Into<String>,
        action: Action,
        params: Params,
    ) -> Self {
        Self {
            tag,
            origin,
            operation_id: operation_id.into(),
            action_id: action_id.into(),
            res_type: res_type.into(),
            action,
            params,
            state: TaskState::New,
        }
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// Returns `false` (and leaves the state alone) for an illegal move.
    pub fn transition(&mut self, next: TaskState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            warn!(
                action_id = %self.action_id,
                from = ?self.state,
                to = ?next,
                "refusing illegal task state transition"
            );
            return false;
        }
        self.state = next;
        true
    }

    /// Put a task restored from a snapshot back at the start of the
    /// state machine. Snapshotted work never started executing.
    pub fn restart(&mut self) {
        self.state = TaskState::New;
    }

    pub fn is_done(&self) -> bool {
        self.state == TaskState::Done
    }

    pub fn is_failed(&self) -> bool {
        self.state == TaskState::Failed
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task(tag={}, origin={}, opid={}, actid={}, {}.{}, state={:?})",
            self.tag.as_deref().unwrap_or("-"),
            self.origin,
            self.operation_id,
            self.action_id,
            self.res_type,
            self.action,
            self.state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            Some("1".into()),
            Origin::Broker,
            "op",
            "act",
            "website",
            Action::Update,
            Params::new(),
        )
    }

    #[test]
    fn state_machine_is_one_directional() {
        let mut t = task();
        assert!(!t.transition(TaskState::Done));
        assert_eq!(t.state, TaskState::New);

        assert!(t.transition(TaskState::Processing));
        assert!(t.transition(TaskState::Failed));
        assert!(!t.transition(TaskState::Done));

        // retry path
        assert!(t.transition(TaskState::New));
        assert!(t.transition(TaskState::Processing));
        assert!(t.transition(TaskState::Done));
        assert!(!t.transition(TaskState::New));
    }

    #[test]
    fn action_parsing_and_classes() {
        assert_eq!("quota_report".parse::<Action>(), Ok(Action::QuotaReport));
        assert_eq!(" Delete ".parse::<Action>(), Ok(Action::Delete));
        assert!("rename".parse::<Action>().is_err());

        assert!(Action::Create.is_mutating());
        assert!(!Action::Backup.is_mutating());
        assert!(Action::MalwareReport.is_query());
        assert_eq!(Action::QuotaReport.reported_properties(), &["quotaUsed"]);
    }

    #[test]
    fn serde_shape_is_stable() {
        let json = serde_json::to_value(task()).unwrap();
        assert_eq!(json["origin"], "broker");
        assert_eq!(json["action"], "update");
        assert_eq!(json["state"], "NEW");
    }
}
