// src/exec/processor.rs

//! Processing of a single task inside a pool worker.
//!
//! Steps: stamp the start time, apply the retry policy, resolve the
//! resource (fanning out when several match), then run the processing
//! sequence, the backup or the collectors, and finally report.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{Instrument, debug, info, info_span, warn};

use super::pool::{Completion, JobFuture, Runner};
use crate::backup::BackupRunner;
use crate::collector::CollectorRegistry;
use crate::errors::{CatalogError, ProcessError};
use crate::handler::{self, HandlerRegistry};
use crate::listener::TaskSender;
use crate::report::{Reporter, ReporterKind};
use crate::resource::{Resource, ResourceGraph, Scope, SequenceBuilder};
use crate::task::params::{DATA, FAILCOUNT, INTERVAL, STARTED};
use crate::task::{Action, Origin, RetryDecision, RetryPolicy, Task, TaskState};

type ProcessFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ProcessError>> + Send + 'a>>;

/// Everything a worker needs to process tasks.
pub struct TaskProcessor {
    graph: ResourceGraph,
    handlers: Arc<HandlerRegistry>,
    collectors: Arc<CollectorRegistry>,
    backups: Arc<dyn BackupRunner>,
    reporter: Arc<Reporter>,
    policy: RetryPolicy,
    /// Catalog id of this server.
    server_id: String,
    /// Where parallel fan-out subtasks go.
    intake: TaskSender,
}

impl TaskProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: ResourceGraph,
        handlers: Arc<HandlerRegistry>,
        collectors: Arc<CollectorRegistry>,
        backups: Arc<dyn BackupRunner>,
        reporter: Arc<Reporter>,
        policy: RetryPolicy,
        server_id: impl Into<String>,
        intake: TaskSender,
    ) -> Self {
        Self {
            graph,
            handlers,
            collectors,
            backups,
            reporter,
            policy,
            server_id: server_id.into(),
            intake,
        }
    }

    /// The pool runner: "process one task".
    pub fn runner(self: &Arc<Self>) -> Runner {
        let processor = Arc::clone(self);
        Arc::new(move |task: Task| -> JobFuture {
            let processor = Arc::clone(&processor);
            Box::pin(async move { processor.process(task).await })
        })
    }

    pub async fn process(&self, mut task: Task) -> Completion {
        let span = info_span!(
            "task",
            operation_id = %task.operation_id,
            action_id = %task.action_id
        );
        let outcome = self.process_task(&mut task).instrument(span).await;
        Completion { task, outcome }
    }

    fn process_task<'a>(&'a self, task: &'a mut Task) -> ProcessFuture<'a> {
        Box::pin(async move {
            task.params
                .insert(STARTED, chrono::Local::now().to_rfc3339());

            let failcount = task.params.failcount();
            match self.policy.decide(failcount, task.params.max_retries()) {
                RetryDecision::Execute => {}
                RetryDecision::Delay(delay) => {
                    warn!(
                        failcount,
                        delay_secs = delay.as_secs_f64(),
                        "task failed before, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    warn!(failcount, "task failed too many times, giving up");
                    self.finish(task, false).await;
                    return Ok(());
                }
            }

            let resource = match task.params.resource() {
                Some(resource) => resource,
                None => {
                    let mut found = self.acquire(task).await?;
                    match found.len() {
                        0 => {
                            info!(res_type = %task.res_type, "no matching resources here");
                            self.settle_noop(task).await;
                            return Ok(());
                        }
                        1 => {
                            let resource = found.remove(0);
                            task.params.set_resource(&resource);
                            resource
                        }
                        _ => return self.fan_out(task, found).await,
                    }
                }
            };

            match task.action {
                action if action.is_mutating() => {
                    self.run_sequence(task, &resource).await?;
                }
                Action::Backup => {
                    self.backups.backup(&task.res_type, &resource).await?;
                }
                _ => {
                    let data = self.collect(task, &resource).await?;
                    task.params.insert(DATA, Value::Object(data));
                }
            }

            self.finish(task, true).await;
            Ok(())
        })
    }

    /// Resources this task applies to, when the task does not carry one.
    async fn acquire(&self, task: &Task) -> Result<Vec<Resource>, ProcessError> {
        if let Some(inline) = task.params.ovs("resource").filter(|v| v.is_object()) {
            return Ok(vec![Resource::from(inline.clone())]);
        }

        let catalog = self.graph.catalog();
        if let Some(obj_ref) = task.params.obj_ref() {
            let path = reference_path(obj_ref);
            return match catalog.fetch_by_reference(path).await {
                Ok(resource) => Ok(vec![resource]),
                Err(CatalogError::NotFound(what)) => {
                    debug!(%what, "referenced resource not found");
                    Ok(Vec::new())
                }
                Err(e) => Err(e.into()),
            };
        }

        let lenient = |result: Result<Vec<Resource>, CatalogError>| match result {
            Err(CatalogError::NotFound(_)) => Ok(Vec::new()),
            other => other,
        };

        let services = self.graph.services();
        let found = match task.res_type.as_str() {
            "unix-account" | "mailbox" => lenient(
                catalog
                    .fetch_by_type_and_scope(&task.res_type, &Scope::Server(self.server_id.clone()))
                    .await,
            )?,
            "service" => services.local_services(),
            res_type => {
                let mut found = Vec::new();
                for service in services.services_by_resource_type(res_type) {
                    let Some(service_id) = service.id() else {
                        continue;
                    };
                    found.extend(lenient(
                        catalog
                            .fetch_by_type_and_scope(
                                res_type,
                                &Scope::Service(service_id.to_string()),
                            )
                            .await,
                    )?);
                }
                found
            }
        };
        Ok(found)
    }

    /// One subtask per eligible resource. The last one inherits the parent
    /// tag so exactly one of them answers the originating message.
    pub fn create_subtasks(&self, task: &Task, resources: Vec<Resource>) -> Vec<Task> {
        let eligible: Vec<Resource> = resources
            .into_iter()
            .filter(|r| {
                let keep = r.is_switched_on() && !r.has_zero_quota();
                if !keep {
                    debug!(resource = %r, "skipping switched off or zero quota resource");
                }
                keep
            })
            .collect();

        let last = eligible.len().saturating_sub(1);
        eligible
            .into_iter()
            .enumerate()
            .map(|(idx, resource)| {
                let suffix = resource.fanout_suffix();
                let tag = if idx == last {
                    task.tag.clone()
                } else {
                    task.tag.as_ref().map(|t| format!("{t}.{suffix}"))
                };
                let mut params = task.params.clone();
                params.remove(FAILCOUNT);
                params.set_resource(&resource);
                Task::new(
                    tag,
                    task.origin,
                    task.operation_id.clone(),
                    format!("{}.{}", task.action_id, suffix),
                    task.res_type.clone(),
                    task.action,
                    params,
                )
            })
            .collect()
    }

    async fn fan_out(&self, task: &mut Task, resources: Vec<Resource>) -> Result<(), ProcessError> {
        let subtasks = self.create_subtasks(task, resources);
        if subtasks.is_empty() {
            info!(res_type = %task.res_type, "every matching resource is switched off");
            self.settle_noop(task).await;
            return Ok(());
        }

        if task.params.is_parallel() {
            info!(count = subtasks.len(), "spawning parallel subtasks");
            for subtask in subtasks {
                if let Err(e) = self.intake.send(subtask) {
                    warn!(task = %e.0, "intake queue closed, subtask dropped");
                }
            }
            // one of the subtasks answers for the parent now
            task.tag = None;
        } else {
            info!(count = subtasks.len(), "processing subtasks sequentially");
            for mut subtask in subtasks {
                subtask.transition(TaskState::Processing);
                let span = info_span!(
                    "task",
                    operation_id = %subtask.operation_id,
                    action_id = %subtask.action_id
                );
                self.process_task(&mut subtask).instrument(span).await?;
            }
        }
        task.transition(TaskState::Done);
        Ok(())
    }

    async fn run_sequence(&self, task: &Task, resource: &Resource) -> Result<(), ProcessError> {
        let sequence = SequenceBuilder::new(&self.graph)
            .build(&task.res_type, resource, task.action, &task.params)
            .await?;

        // resolve every handler before touching anything
        let mut steps = Vec::with_capacity(sequence.len());
        for entry in sequence {
            let op_resource = self
                .collectors
                .op_resource(&entry.res_type, &entry.resource)
                .await?;
            let label = format!("{}.{} {}", entry.res_type, entry.action, entry.resource);
            let handler = self.handlers.instantiate(
                &entry.res_type,
                entry.resource,
                entry.params,
                op_resource,
            )?;
            steps.push((label, entry.action, handler));
        }

        for (label, action, handler) in steps {
            debug!(step = %label, "calling handler");
            handler::invoke(handler.as_ref(), action).await?;
        }
        Ok(())
    }

    async fn collect(
        &self,
        task: &Task,
        resource: &Resource,
    ) -> Result<Map<String, Value>, ProcessError> {
        let interval = task.params.u64(INTERVAL).unwrap_or(1);
        let ttl = Duration::from_secs(interval.saturating_sub(1));
        let mut data = Map::new();
        for property in task.action.reported_properties() {
            let value = self
                .collectors
                .get_property(&task.res_type, resource, property, ttl)
                .await?;
            data.insert((*property).to_string(), value);
        }
        Ok(data)
    }

    /// Settle the task and report it. `success = false` is used for tasks
    /// given up on: reported as failed, settled as done.
    async fn finish(&self, task: &mut Task, success: bool) {
        task.transition(TaskState::Done);
        self.reporter.report(task, success).await;
        info!(task = %task, success, "done with task");
    }

    /// Nothing to do. Only a broker caller is waiting for an answer.
    async fn settle_noop(&self, task: &mut Task) {
        task.transition(TaskState::Done);
        if task.origin == Origin::Broker && ReporterKind::select(task) == ReporterKind::Broker {
            self.reporter.report(task, true).await;
        }
    }
}

/// Path part of an object reference URL; plain paths pass through.
pub fn reference_path(obj_ref: &str) -> &str {
    let without_scheme = match obj_ref.find("://") {
        Some(idx) => {
            let rest = &obj_ref[idx + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "/",
            }
        }
        None => obj_ref,
    };
    let end = without_scheme
        .find(['?', '#'])
        .unwrap_or(without_scheme.len());
    &without_scheme[..end]
}
