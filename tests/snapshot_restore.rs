// tests/snapshot_restore.rs

use std::sync::Arc;
use std::time::Duration;

use taskexec::exec::pool::JobFuture;
use taskexec::exec::{
    Completion, Dispatcher, DispatcherConfig, PoolKind, PoolSizes, Runner, SnapshotStore,
    StopMode, stop_channel,
};
use taskexec::listener::{ProcessedQueues, TaskReceiver, TaskSender, intake_channel};
use taskexec::task::{Action, Origin, Task, TaskState};
use taskexec_test_utils::builders::TaskBuilder;
use taskexec_test_utils::{init_tracing, with_timeout};

/// Never finishes `block`; everything else is done right away.
fn blocking_runner() -> Runner {
    Arc::new(|mut task: Task| -> JobFuture {
        Box::pin(async move {
            if task.action_id == "block" {
                std::future::pending::<()>().await;
            }
            task.transition(TaskState::Done);
            Completion { task, outcome: Ok(()) }
        })
    })
}

fn config(dir: &std::path::Path) -> DispatcherConfig {
    DispatcherConfig {
        sizes: PoolSizes {
            command: 1,
            long_command: 1,
            query: 1,
            backup_files: 1,
            backup_dbs: 1,
        },
        poll_interval: Duration::from_millis(5),
        snapshots: SnapshotStore::new(dir),
    }
}

fn dispatcher(dir: &std::path::Path) -> (Dispatcher, TaskSender, TaskReceiver) {
    let (tx, intake) = intake_channel();
    let mut processed = ProcessedQueues::new();
    let done = processed.attach(Origin::Scheduler);
    (
        Dispatcher::new(config(dir), blocking_runner(), intake, processed),
        tx,
        done,
    )
}

fn query(actid: &str, origin: Origin) -> Task {
    TaskBuilder::new("unix-account", Action::QuotaReport)
        .tag(actid)
        .origin(origin)
        .action_id(actid)
        .build()
}

#[tokio::test]
async fn immediate_stop_dumps_local_backlog_and_restart_resubmits_it() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(dir.path());
    let snapshot = store.path_for(PoolKind::Query.name());

    let (first, intake, _done) = dispatcher(dir.path());
    let (stop_tx, stop_rx) = stop_channel();
    let running = tokio::spawn(first.run(stop_rx));

    intake.send(query("block", Origin::Scheduler)).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    intake.send(query("q1", Origin::Scheduler)).unwrap();
    intake.send(query("b1", Origin::Broker)).unwrap();
    intake.send(query("q2", Origin::Scheduler)).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    stop_tx.send_replace(Some(StopMode::Immediate));
    with_timeout(running).await.unwrap();

    assert!(snapshot.exists());
    let dumped: Vec<Task> = serde_json::from_slice(&std::fs::read(&snapshot).unwrap()).unwrap();
    let ids: Vec<_> = dumped.iter().map(|t| t.action_id.as_str()).collect();
    assert_eq!(ids, vec!["q1", "q2"]);
    for kind in PoolKind::ALL.into_iter().filter(|k| *k != PoolKind::Query) {
        assert!(!store.path_for(kind.name()).exists());
    }

    let (mut second, _intake, mut done) = dispatcher(dir.path());
    second.restore();
    assert!(!snapshot.exists());
    assert_eq!(second.pending_len(), 2);

    with_timeout(async {
        while second.pending_len() > 0 {
            second.sweep();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;

    let mut restored = vec![done.try_recv().unwrap(), done.try_recv().unwrap()];
    restored.sort_by(|a, b| a.action_id.cmp(&b.action_id));
    assert_eq!(restored[0].action_id, "q1");
    assert_eq!(restored[1].action_id, "q2");
    assert!(restored.iter().all(|t| t.state == TaskState::Done));
}

#[tokio::test]
async fn graceful_stop_waits_for_queued_work() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, intake, mut done) = dispatcher(dir.path());
    let (stop_tx, stop_rx) = stop_channel();
    let running = tokio::spawn(dispatcher.run(stop_rx));

    intake
        .send(
            TaskBuilder::new("website", Action::Update)
                .tag("w1")
                .origin(Origin::Scheduler)
                .build(),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    stop_tx.send_replace(Some(StopMode::Graceful));
    with_timeout(running).await.unwrap();

    let finished = done.try_recv().unwrap();
    assert_eq!(finished.state, TaskState::Done);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
