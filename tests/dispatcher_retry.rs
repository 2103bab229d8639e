// tests/dispatcher_retry.rs

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;
use taskexec::collector::{CollectorRegistry, PropertyCache};
use taskexec::errors::{HandlerError, ProcessError};
use taskexec::exec::pool::JobFuture;
use taskexec::exec::{
    Completion, Dispatcher, DispatcherConfig, PoolSizes, Runner, SnapshotStore, TaskProcessor,
};
use taskexec::listener::{ProcessedQueues, TaskReceiver, intake_channel};
use taskexec::report::Reporter;
use taskexec::resource::ResourceGraph;
use taskexec::task::{Action, Origin, RetryPolicy, Task, TaskState};
use taskexec_test_utils::builders::{TaskBuilder, unix_account};
use taskexec_test_utils::fakes::{
    CallLog, FakeServices, InMemoryCatalog, RecordingTransport, recording_handlers,
};
use taskexec_test_utils::{init_tracing, with_timeout};

fn dispatcher(runner: Runner, dir: &std::path::Path) -> (Dispatcher, TaskReceiver) {
    let (_tx, intake) = intake_channel();
    let mut processed = ProcessedQueues::new();
    let done = processed.attach(Origin::Broker);
    let config = DispatcherConfig {
        sizes: PoolSizes::default(),
        poll_interval: Duration::from_millis(5),
        snapshots: SnapshotStore::new(dir),
    };
    (Dispatcher::new(config, runner, intake, processed), done)
}

async fn settle_all(dispatcher: &mut Dispatcher) {
    with_timeout(async {
        loop {
            dispatcher.sweep();
            if dispatcher.pending_len() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
}

/// Fails the first `failures` runs, then succeeds.
fn flaky_runner(failures: u32, runs: Arc<AtomicU32>) -> Runner {
    Arc::new(move |mut task: Task| -> JobFuture {
        let runs = Arc::clone(&runs);
        Box::pin(async move {
            let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
            if run <= failures {
                return Completion {
                    task,
                    outcome: Err(ProcessError::Handler(HandlerError::Service(format!(
                        "attempt {run} failed"
                    )))),
                };
            }
            task.transition(TaskState::Done);
            Completion { task, outcome: Ok(()) }
        })
    })
}

#[tokio::test]
async fn success_after_failures_clears_the_ledger() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicU32::new(0));
    let (mut dispatcher, mut done) = dispatcher(flaky_runner(3, Arc::clone(&runs)), dir.path());

    for attempt in 1..=3 {
        let task = TaskBuilder::new("unix-account", Action::Update)
            .tag(&format!("t{attempt}"))
            .action_id("x")
            .build();
        dispatcher.dispatch(task);
        settle_all(&mut dispatcher).await;

        assert_eq!(dispatcher.ledger().failcount_of("x"), attempt);
        let failed = done.try_recv().unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.params.u64("failcount"), Some(u64::from(attempt - 1)));
        assert_eq!(
            failed.params.get("last_exception").unwrap()["message"],
            json!(format!("operational service error: attempt {attempt} failed"))
        );
    }

    let task = TaskBuilder::new("unix-account", Action::Update)
        .tag("t4")
        .action_id("x")
        .build();
    dispatcher.dispatch(task);
    settle_all(&mut dispatcher).await;

    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert!(!dispatcher.ledger().contains("x"));
    assert_eq!(done.try_recv().unwrap().state, TaskState::Done);
}

#[tokio::test]
async fn untagged_completions_are_not_routed() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicU32::new(0));
    let (mut dispatcher, mut done) = dispatcher(flaky_runner(1, Arc::clone(&runs)), dir.path());

    let task = TaskBuilder::new("unix-account", Action::Update)
        .origin(Origin::Scheduler)
        .action_id("y")
        .build();
    dispatcher.dispatch(task);
    settle_all(&mut dispatcher).await;

    assert_eq!(dispatcher.ledger().failcount_of("y"), 1);
    assert!(done.try_recv().is_err());
}

#[tokio::test]
async fn retry_ceiling_reports_failure_and_forgets_the_task() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let log = CallLog::default();
    let transport = RecordingTransport::new();
    let (intake_tx, _intake_rx) = intake_channel();
    let processor = Arc::new(TaskProcessor::new(
        ResourceGraph::new(Arc::new(InMemoryCatalog::new()), Arc::new(FakeServices::default())),
        Arc::new(recording_handlers(&["unix-account"], &log, &["u1"])),
        Arc::new(CollectorRegistry::new(PropertyCache::new(16))),
        Arc::new(taskexec::backup::NoBackup),
        Arc::new(Reporter::new(Arc::new(transport.clone()), "web15")),
        RetryPolicy {
            max_retries: 2,
            backoff_unit: Duration::from_millis(1),
            backoff_cap: 60,
        },
        "web_server_15",
        intake_tx,
    ));
    let (mut dispatcher, mut done) = dispatcher(processor.runner(), dir.path());

    let attempt = |tag: &str| {
        TaskBuilder::new("unix-account", Action::Update)
            .tag(tag)
            .action_id("u1-update")
            .resource(unix_account("u1", "u7001"))
            .param("provider", json!("rc-user"))
            .build()
    };

    for tag in ["1", "2"] {
        dispatcher.dispatch(attempt(tag));
        settle_all(&mut dispatcher).await;
        assert_eq!(done.try_recv().unwrap().state, TaskState::Failed);
    }
    assert_eq!(log.count("unix-account.update u1"), 2);
    assert!(transport.sent().is_empty());

    dispatcher.dispatch(attempt("3"));
    settle_all(&mut dispatcher).await;

    // the handler is not run a third time
    assert_eq!(log.count("unix-account.update u1"), 2);
    let last = done.try_recv().unwrap();
    assert_eq!(last.state, TaskState::Done);
    assert!(!dispatcher.ledger().contains("u1-update"));

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body["params"]["success"], false);
}
