// src/report/mod.rs

//! Surfacing task outcomes.
//!
//! The reporter is picked from the task's shape, the payload is built by
//! [`build`], and delivery goes through an external [`ReportTransport`].
//! Reporting never changes a task's outcome: transport errors are logged
//! and dropped.

pub mod build;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::errors::ReportError;
use crate::task::{Origin, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterKind {
    Broker,
    Alerting,
    Http,
    Null,
}

impl ReporterKind {
    /// First matching rule wins: broker mutation, backup, query, anything else.
    pub fn select(task: &Task) -> Self {
        if task.origin == Origin::Broker && task.action.is_mutating() {
            ReporterKind::Broker
        } else if task.action == crate::task::Action::Backup {
            ReporterKind::Alerting
        } else if task.action.is_query() {
            ReporterKind::Http
        } else {
            ReporterKind::Null
        }
    }
}

/// Where a report goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportChannel {
    Broker {
        exchange: String,
        routing_key: String,
        /// Value of the `provider` message header.
        provider: String,
    },
    Http {
        path: String,
    },
    Alert,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub channel: ReportChannel,
    pub body: Value,
}

impl Report {
    /// A report whose top-level values are all falsy carries nothing worth
    /// sending.
    pub fn is_empty(&self) -> bool {
        match &self.body {
            Value::Object(map) => map.values().all(is_falsy),
            other => is_falsy(other),
        }
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f == 0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// Delivery of built reports (broker publish, HTTP POST, alerting API).
#[async_trait]
pub trait ReportTransport: Send + Sync {
    async fn send(&self, report: &Report) -> Result<(), ReportError>;
}

/// Transport that only logs; used when nothing external is wired in.
pub struct LogTransport;

#[async_trait]
impl ReportTransport for LogTransport {
    async fn send(&self, report: &Report) -> Result<(), ReportError> {
        info!(channel = ?report.channel, body = %report.body, "report (not delivered)");
        Ok(())
    }
}

pub struct Reporter {
    transport: Arc<dyn ReportTransport>,
    hostname: String,
}

impl Reporter {
    pub fn new(transport: Arc<dyn ReportTransport>, hostname: impl Into<String>) -> Self {
        Self {
            transport,
            hostname: hostname.into(),
        }
    }

    pub fn create_report(&self, task: &Task, success: bool) -> Option<Report> {
        match ReporterKind::select(task) {
            ReporterKind::Broker => Some(build::broker_report(task, success)),
            ReporterKind::Alerting => Some(build::alert_report(task, success, &self.hostname)),
            ReporterKind::Http => {
                let report = build::http_report(task);
                if report.is_none() {
                    warn!(task = %task, "no resource to report query results for");
                }
                report
            }
            ReporterKind::Null => None,
        }
    }

    /// Build and send the report for a finished task.
    pub async fn report(&self, task: &Task, success: bool) {
        let Some(report) = self.create_report(task, success) else {
            return;
        };
        if report.is_empty() {
            debug!(task = %task, body = %report.body, "discarding empty report");
            return;
        }
        info!(task = %task, channel = ?report.channel, "sending report");
        if let Err(e) = self.transport.send(&report).await {
            error!(task = %task, error = %e, "failed to send report");
        }
    }
}
