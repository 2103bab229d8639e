// tests/broker_bridge.rs

use std::time::Duration;

use serde_json::json;
use taskexec::errors::BrokerError;
use taskexec::exec::{StopMode, stop_channel};
use taskexec::listener::broker::{self, BrokerBridge};
use taskexec::listener::intake_channel;
use taskexec::task::{Action, Origin, TaskState};
use taskexec_test_utils::builders::ConfigFileBuilder;
use taskexec_test_utils::fakes::{CallLog, ChannelConsumer, broker_message};
use taskexec_test_utils::{init_tracing, with_timeout};

fn body(actid: &str) -> serde_json::Value {
    json!({
        "operationIdentity": "op-9",
        "actionIdentity": actid,
        "objRef": "http://rc-user/unix-account/u1",
        "params": {"quota": 5},
    })
}

#[tokio::test]
async fn done_is_acked_and_failed_is_requeued() {
    init_tracing();
    let log = CallLog::default();
    let (intake_tx, mut intake_rx) = intake_channel();
    let (done_tx, done_rx) = intake_channel();
    let mut bridge = BrokerBridge::new(intake_tx, done_rx, Duration::from_millis(5));

    bridge
        .take_event(broker_message("1", "unix-account.update", body("a1"), &log))
        .await;
    bridge
        .take_event(broker_message("2", "unix-account.update", body("a2"), &log))
        .await;
    assert_eq!(bridge.unsettled(), 2);

    let mut first = intake_rx.try_recv().unwrap();
    let mut second = intake_rx.try_recv().unwrap();
    assert_eq!(first.tag.as_deref(), Some("1"));
    assert_eq!(first.origin, Origin::Broker);
    assert_eq!(first.action, Action::Update);

    first.transition(TaskState::Processing);
    first.transition(TaskState::Done);
    second.transition(TaskState::Processing);
    second.transition(TaskState::Failed);
    done_tx.send(first).unwrap();
    done_tx.send(second).unwrap();

    bridge.on_iteration().await;
    assert_eq!(log.entries(), vec!["ack 1", "requeue 2"]);
    assert_eq!(bridge.unsettled(), 0);
}

#[tokio::test]
async fn a_tag_is_settled_once() {
    init_tracing();
    let log = CallLog::default();
    let (intake_tx, mut intake_rx) = intake_channel();
    let (done_tx, done_rx) = intake_channel();
    let mut bridge = BrokerBridge::new(intake_tx, done_rx, Duration::from_millis(5));

    bridge
        .take_event(broker_message("7", "website.create", body("w1"), &log))
        .await;
    let mut task = intake_rx.try_recv().unwrap();
    task.transition(TaskState::Processing);
    task.transition(TaskState::Done);

    done_tx.send(task.clone()).unwrap();
    done_tx.send(task).unwrap();
    bridge.on_iteration().await;

    assert_eq!(log.count("ack 7"), 1);
    assert_eq!(log.entries().len(), 1);
}

#[tokio::test]
async fn in_flight_tasks_are_neither_acked_nor_requeued() {
    init_tracing();
    let log = CallLog::default();
    let (intake_tx, mut intake_rx) = intake_channel();
    let (done_tx, done_rx) = intake_channel();
    let mut bridge = BrokerBridge::new(intake_tx, done_rx, Duration::from_millis(5));

    bridge
        .take_event(broker_message("3", "database.delete", body("d1"), &log))
        .await;
    let mut task = intake_rx.try_recv().unwrap();
    task.transition(TaskState::Processing);
    done_tx.send(task).unwrap();
    bridge.on_iteration().await;

    assert!(log.entries().is_empty());
}

#[tokio::test]
async fn listener_binds_consumes_and_fails_when_the_consumer_closes() {
    init_tracing();
    let cfg = ConfigFileBuilder::new()
        .enable("unix-account")
        .enable("website")
        .build();
    let bindings = broker::bindings(&cfg);
    assert_eq!(bindings.len(), 6);

    let log = CallLog::default();
    let (intake_tx, mut intake_rx) = intake_channel();
    let (_done_tx, done_rx) = intake_channel();
    let bridge = BrokerBridge::new(intake_tx, done_rx, Duration::from_millis(5));
    let (feed, consumer) = ChannelConsumer::new();
    let bound = consumer.bound.clone();
    let (_stop_tx, stop_rx) = stop_channel();

    let listener = tokio::spawn(bridge.listen(Box::new(consumer), bindings, stop_rx));

    feed.send(broker_message("11", "website.update", body("w9"), &log))
        .unwrap();
    let task = with_timeout(intake_rx.recv()).await.unwrap();
    assert_eq!(task.res_type, "website");
    assert_eq!(task.tag.as_deref(), Some("11"));

    drop(feed);
    let result = with_timeout(listener).await.unwrap();
    assert!(matches!(result, Err(BrokerError::ConsumerClosed)));
    assert_eq!(bound.lock().unwrap().len(), 6);
}

#[tokio::test]
async fn listener_stops_cleanly_on_request() {
    init_tracing();
    let cfg = ConfigFileBuilder::new().enable("database").build();

    let (intake_tx, _intake_rx) = intake_channel();
    let (_done_tx, done_rx) = intake_channel();
    let bridge = BrokerBridge::new(intake_tx, done_rx, Duration::from_millis(5));
    let (_feed, consumer) = ChannelConsumer::new();
    let (stop_tx, stop_rx) = stop_channel();

    let listener = tokio::spawn(bridge.listen(Box::new(consumer), broker::bindings(&cfg), stop_rx));
    tokio::time::sleep(Duration::from_millis(10)).await;
    stop_tx.send_replace(Some(StopMode::Graceful));

    assert!(with_timeout(listener).await.unwrap().is_ok());
}
