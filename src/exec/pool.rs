// src/exec/pool.rs

//! Bounded worker pool.
//!
//! A pool is a backlog of typed work items (tasks) plus a fixed number of
//! worker loops. Each item runs in its own Tokio task so a panicking
//! handler only fails that item. Because the backlog holds tasks rather
//! than closures, undispatched work can be drained and written to disk on
//! shutdown.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, Notify, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info};

use crate::errors::ProcessError;
use crate::task::Task;

/// What a worker hands back: the task as it looks after processing and
/// how processing went.
#[derive(Debug)]
pub struct Completion {
    pub task: Task,
    pub outcome: Result<(), ProcessError>,
}

pub type JobFuture = Pin<Box<dyn Future<Output = Completion> + Send>>;

/// The unit of work every pool runs: "process one task".
pub type Runner = Arc<dyn Fn(Task) -> JobFuture + Send + Sync>;

struct Queued {
    task: Task,
    reply: oneshot::Sender<Completion>,
}

struct Shared {
    name: String,
    backlog: Mutex<VecDeque<Queued>>,
    notify: Notify,
    closed: AtomicBool,
    aborted: AtomicBool,
    /// The item each worker is running, by worker index.
    running: Mutex<Vec<Option<AbortHandle>>>,
}

impl Shared {
    fn pop(&self) -> Option<Queued> {
        self.backlog.lock().ok()?.pop_front()
    }

    fn set_running(&self, worker: usize, item: Option<AbortHandle>) {
        if let Ok(mut running) = self.running.lock() {
            running[worker] = item;
        }
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    size: usize,
    workers: AsyncMutex<Vec<JoinHandle<()>>>,
    aborts: Vec<AbortHandle>,
}

impl WorkerPool {
    /// Create the pool and start its `size` workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(name: impl Into<String>, size: usize, runner: Runner) -> Self {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            name: name.into(),
            backlog: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            running: Mutex::new((0..size).map(|_| None).collect()),
        });

        let workers: Vec<JoinHandle<()>> = (0..size)
            .map(|idx| {
                let shared = Arc::clone(&shared);
                let runner = Arc::clone(&runner);
                tokio::spawn(worker_loop(idx, shared, runner))
            })
            .collect();
        let aborts = workers.iter().map(JoinHandle::abort_handle).collect();

        debug!(pool = %shared.name, size, "worker pool started");
        Self {
            shared,
            size,
            workers: AsyncMutex::new(workers),
            aborts,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a task. The receiver resolves once a worker has processed it;
    /// it errors if the pool shut down before getting to it.
    pub fn submit(&self, task: Task) -> oneshot::Receiver<Completion> {
        let (reply, rx) = oneshot::channel();
        match self.shared.backlog.lock() {
            Ok(mut backlog) => {
                backlog.push_back(Queued { task, reply });
                debug!(
                    pool = %self.shared.name,
                    max_workers = self.size,
                    backlog = backlog.len(),
                    "task submitted to pool"
                );
            }
            Err(_) => {
                error!(pool = %self.shared.name, "pool backlog poisoned, dropping task");
                return rx;
            }
        }
        self.shared.notify.notify_one();
        rx
    }

    pub fn backlog_len(&self) -> usize {
        self.shared.backlog.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Remove every queued (not yet started) task for which `take` returns
    /// true and return them in queue order. The rest stay queued.
    pub fn drain_backlog(&self, take: impl Fn(&Task) -> bool) -> Vec<Task> {
        let Ok(mut backlog) = self.shared.backlog.lock() else {
            return Vec::new();
        };
        let (taken, kept): (VecDeque<_>, VecDeque<_>) =
            backlog.drain(..).partition(|q| take(&q.task));
        *backlog = kept;
        taken.into_iter().map(|q| q.task).collect()
    }

    /// Stop accepting work. Workers finish what is already queued, then
    /// exit.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Kill the worker loops and the items they are running. Their
    /// submitters see the reply channel close.
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
        for handle in &self.aborts {
            handle.abort();
        }
        if let Ok(running) = self.shared.running.lock() {
            for item in running.iter().flatten() {
                item.abort();
            }
        }
    }

    /// Wait for every worker loop to end.
    pub async fn join(&self) {
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(pool = %self.shared.name, error = %e, "worker ended abnormally"),
            }
        }
    }

    /// Close the pool and either wait for queued and in-flight work
    /// (`wait`) or abort it.
    pub async fn shutdown(&self, wait: bool) {
        self.close();
        if !wait {
            self.abort();
        }
        self.join().await;
        info!(pool = %self.shared.name, wait, "worker pool shut down");
    }
}

async fn worker_loop(idx: usize, shared: Arc<Shared>, runner: Runner) {
    loop {
        let notified = shared.notify.notified();

        if let Some(queued) = shared.pop() {
            let Queued { task, reply } = queued;
            let submitted = task.clone();
            let item = tokio::spawn((runner)(task));
            shared.set_running(idx, Some(item.abort_handle()));
            if shared.aborted.load(Ordering::SeqCst) {
                item.abort();
            }
            let joined = item.await;
            shared.set_running(idx, None);
            let completion = match joined {
                Ok(done) => done,
                Err(join_err) => {
                    let reason = panic_message(join_err);
                    error!(pool = %shared.name, worker = idx, task = %submitted, %reason, "task worker panicked");
                    Completion {
                        task: submitted,
                        outcome: Err(ProcessError::Panicked(reason)),
                    }
                }
            };
            if reply.send(completion).is_err() {
                debug!(pool = %shared.name, worker = idx, "nobody waiting for completed task");
            }
            continue;
        }

        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        notified.await;
    }
    debug!(pool = %shared.name, worker = idx, "worker stopped");
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::task::{Action, Origin, Params, TaskState};

    fn task(actid: &str, origin: Origin) -> Task {
        Task::new(None, origin, "op", actid, "unix-account", Action::Update, Params::new())
    }

    fn runner() -> Runner {
        Arc::new(|mut task: Task| -> JobFuture {
            Box::pin(async move {
                if task.action_id == "panic" {
                    panic!("handler blew up");
                }
                task.state = TaskState::Done;
                Completion { task, outcome: Ok(()) }
            })
        })
    }

    #[tokio::test]
    async fn completes_and_isolates_panics() {
        let pool = WorkerPool::new("command_task_pool", 2, runner());

        let ok = pool.submit(task("a", Origin::Broker)).await.unwrap();
        assert!(ok.outcome.is_ok());
        assert_eq!(ok.task.state, TaskState::Done);

        let boom = pool.submit(task("panic", Origin::Broker)).await.unwrap();
        assert!(matches!(boom.outcome, Err(ProcessError::Panicked(ref m)) if m.contains("blew up")));

        // the pool keeps working after a panic
        let again = pool.submit(task("b", Origin::Broker)).await.unwrap();
        assert!(again.outcome.is_ok());
        pool.shutdown(true).await;
    }

    /// Fires when the future holding it is dropped.
    struct DropSignal(Option<oneshot::Sender<()>>);

    impl Drop for DropSignal {
        fn drop(&mut self) {
            if let Some(tx) = self.0.take() {
                let _ = tx.send(());
            }
        }
    }

    #[tokio::test]
    async fn abort_cancels_items_in_flight() {
        let (dropped_tx, dropped_rx) = oneshot::channel();
        let signal = Arc::new(Mutex::new(Some(dropped_tx)));
        let stuck: Runner = Arc::new(move |task: Task| -> JobFuture {
            let guard = DropSignal(signal.lock().unwrap().take());
            Box::pin(async move {
                let _guard = guard;
                std::future::pending::<()>().await;
                Completion { task, outcome: Ok(()) }
            })
        });
        let pool = WorkerPool::new("long_command_task_pool", 1, stuck);
        let reply = pool.submit(task("stuck", Origin::Scheduler));
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.shutdown(false).await;

        tokio::time::timeout(Duration::from_secs(5), dropped_rx)
            .await
            .expect("in-flight item still running after abort")
            .unwrap();
        assert!(reply.await.is_err());
    }

    #[tokio::test]
    async fn drain_takes_only_matching_backlog() {
        let blocker: Runner = Arc::new(|task: Task| -> JobFuture {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Completion { task, outcome: Ok(()) }
            })
        });
        let pool = WorkerPool::new("query_task_pool", 1, blocker);
        let _busy = pool.submit(task("busy", Origin::Scheduler));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _r1 = pool.submit(task("s1", Origin::Scheduler));
        let _r2 = pool.submit(task("b1", Origin::Broker));
        let _r3 = pool.submit(task("s2", Origin::Scheduler));

        let drained = pool.drain_backlog(|t| t.origin != Origin::Broker);
        let ids: Vec<_> = drained.iter().map(|t| t.action_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        assert_eq!(pool.backlog_len(), 1);
        pool.shutdown(false).await;
    }
}
