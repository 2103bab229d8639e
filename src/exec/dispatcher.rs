// src/exec/dispatcher.rs

//! The coordinating loop.
//!
//! Single owner of the retry ledger and the pending-completion list. It
//! never blocks on a pool: it polls the intake queue with a short timeout,
//! hands tasks to the pool matching their shape, and on every idle poll
//! sweeps finished work into the ledger and the origin's processed queue.

use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::pool::{Completion, Runner, WorkerPool};
use super::snapshot::SnapshotStore;
use super::{PoolKind, PoolSizes, StopMode};
use crate::config::ConfigFile;
use crate::listener::{ProcessedQueues, TaskReceiver};
use crate::task::{Origin, RetryLedger, Task, TaskState};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub sizes: PoolSizes,
    pub poll_interval: Duration,
    pub snapshots: SnapshotStore,
}

impl DispatcherConfig {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self {
            sizes: PoolSizes::from_config(cfg),
            poll_interval: cfg.executor.poll_interval(),
            snapshots: SnapshotStore::new(cfg.executor.dump_dir.clone()),
        }
    }
}

struct Pending {
    task: Task,
    rx: oneshot::Receiver<Completion>,
}

pub struct Dispatcher {
    /// Indexed by [`PoolKind::index`].
    pools: Vec<WorkerPool>,
    ledger: RetryLedger,
    pending: Vec<Pending>,
    intake: TaskReceiver,
    processed: ProcessedQueues,
    snapshots: SnapshotStore,
    poll_interval: Duration,
}

impl Dispatcher {
    /// Start every pool with `runner` as its unit of work.
    pub fn new(
        config: DispatcherConfig,
        runner: Runner,
        intake: TaskReceiver,
        processed: ProcessedQueues,
    ) -> Self {
        let pools = PoolKind::ALL
            .into_iter()
            .map(|kind| WorkerPool::new(kind.name(), config.sizes.of(kind), runner.clone()))
            .collect();

        Self {
            pools,
            ledger: RetryLedger::new(),
            pending: Vec::new(),
            intake,
            processed,
            snapshots: config.snapshots,
            poll_interval: config.poll_interval,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    fn pool(&self, kind: PoolKind) -> &WorkerPool {
        &self.pools[kind.index()]
    }

    /// Resubmit work left behind by an unclean shutdown, each task to the
    /// pool it was dumped from.
    pub fn restore(&mut self) {
        for kind in PoolKind::ALL {
            match self.snapshots.take(kind.name()) {
                Ok(tasks) => {
                    for mut task in tasks {
                        task.restart();
                        info!(pool = kind.name(), task = %task, "task restored");
                        self.submit(kind, task);
                    }
                }
                Err(e) => error!(pool = kind.name(), error = %e, "failed to restore tasks"),
            }
        }
    }

    /// Attach retry state, mark the task processing and hand it to its pool.
    pub fn dispatch(&mut self, task: Task) {
        let kind = PoolKind::select(&task);
        self.submit(kind, task);
    }

    fn submit(&mut self, kind: PoolKind, mut task: Task) {
        if let Some(stored) = self.ledger.failed_params(&task.action_id) {
            let stored = stored.clone();
            task.params.merge(&stored);
        }
        task.params.set_failcount(self.ledger.failcount(&task));

        if task.state != TaskState::New {
            warn!(task = %task, "dispatching task that is not NEW, restarting it");
            task.restart();
        }
        task.transition(TaskState::Processing);

        let rx = self.pool(kind).submit(task.clone());
        self.pending.push(Pending { task, rx });
    }

    /// Collect finished work.
    pub fn sweep(&mut self) {
        let mut still_pending = Vec::with_capacity(self.pending.len());
        for mut pending in self.pending.drain(..) {
            match pending.rx.try_recv() {
                Ok(completion) => settle(&mut self.ledger, &self.processed, completion),
                Err(oneshot::error::TryRecvError::Empty) => still_pending.push(pending),
                Err(oneshot::error::TryRecvError::Closed) => {
                    debug!(task = %pending.task, "pool dropped task before running it");
                }
            }
        }
        self.pending = still_pending;
    }

    /// Run until a stop is requested, then shut down.
    pub async fn run(mut self, mut stop: watch::Receiver<Option<StopMode>>) {
        let span = info_span!("dispatcher");
        async move {
            info!("dispatcher started");
            self.restore();

            let mode = loop {
                if let Some(mode) = *stop.borrow() {
                    break mode;
                }
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break StopMode::Graceful;
                        }
                    }
                    polled = timeout(self.poll_interval, self.intake.recv()) => match polled {
                        Ok(Some(task)) => self.dispatch(task),
                        Ok(None) => {
                            self.sweep();
                            if self.pending.is_empty() {
                                info!("intake closed and nothing pending");
                                break StopMode::Graceful;
                            }
                            tokio::time::sleep(self.poll_interval).await;
                        }
                        Err(_) => self.sweep(),
                    },
                }
            };

            self.shutdown(mode, stop).await;
        }
        .instrument(span)
        .await
    }

    async fn shutdown(mut self, mode: StopMode, mut stop: watch::Receiver<Option<StopMode>>) {
        let wait = mode == StopMode::Graceful;
        info!(wait, "shutting all pools down");

        let mut dumps: Vec<Vec<Task>> = self
            .pools
            .iter()
            .map(|pool| pool.drain_backlog(|t| t.origin != Origin::Broker))
            .collect();

        // intake that never reached a pool
        while let Ok(task) = self.intake.try_recv() {
            if task.origin == Origin::Broker {
                continue;
            }
            dumps[PoolKind::select(&task).index()].push(task);
        }

        for (kind, tasks) in PoolKind::ALL.into_iter().zip(&dumps) {
            if let Err(e) = self.snapshots.save(kind.name(), tasks) {
                error!(pool = kind.name(), error = %e, "failed to dump pending tasks");
            }
        }

        for pool in &self.pools {
            pool.close();
        }

        if wait {
            let join_all = async {
                for pool in &self.pools {
                    pool.join().await;
                }
            };
            let immediate = async {
                loop {
                    if *stop.borrow_and_update() == Some(StopMode::Immediate) {
                        return;
                    }
                    if stop.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            };
            tokio::select! {
                _ = join_all => {}
                _ = immediate => {
                    warn!("immediate stop requested while draining, abandoning in-flight work");
                    for pool in &self.pools {
                        pool.abort();
                    }
                }
            }
        } else {
            for pool in &self.pools {
                pool.abort();
            }
        }

        self.sweep();
        info!(abandoned = self.pending.len(), "dispatcher stopped");
    }
}

/// Fold one completion into the ledger and route it to its origin.
fn settle(ledger: &mut RetryLedger, processed: &ProcessedQueues, completion: Completion) {
    let Completion { mut task, outcome } = completion;
    match outcome {
        Err(e) => {
            task.transition(TaskState::Failed);
            task.params.set_last_exception(&e.to_string(), e.class());
            let failcount = ledger.record_failure(&task);
            warn!(task = %task, failcount, error = %e, "task failed");
        }
        Ok(()) => {
            if ledger.failcount(&task) > 0 {
                ledger.forget(&task);
                debug!(task = %task, "task succeeded after failures, ledger entry cleared");
            }
        }
    }
    if task.tag.is_some() {
        processed.push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{HandlerError, ProcessError};
    use crate::task::{Action, Params};

    #[test]
    fn settle_records_failures_and_routes_tagged_tasks() {
        let mut ledger = RetryLedger::new();
        let mut queues = ProcessedQueues::new();
        let mut rx = queues.attach(Origin::Broker);

        let mut task = Task::new(
            Some("42".into()),
            Origin::Broker,
            "op",
            "x",
            "website",
            Action::Update,
            Params::new(),
        );
        task.transition(TaskState::Processing);

        settle(
            &mut ledger,
            &queues,
            Completion {
                task: task.clone(),
                outcome: Err(ProcessError::Handler(HandlerError::Service("nginx down".into()))),
            },
        );
        let failed = rx.try_recv().unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.params.get("last_exception").unwrap()["class"], "ResourceProcessingError");
        assert_eq!(ledger.failcount_of("x"), 1);

        task.transition(TaskState::Done);
        task.tag = None;
        settle(&mut ledger, &queues, Completion { task, outcome: Ok(()) });
        assert!(ledger.is_empty());
        assert!(rx.try_recv().is_err());
    }
}
