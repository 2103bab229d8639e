// src/listener/broker.rs

//! Broker-sourced tasks.
//!
//! The transport itself is external ([`BrokerConsumer`], [`MessageHandle`]).
//! [`BrokerBridge`] turns deliveries into tasks and keeps the broker's
//! unacknowledged messages in lockstep with task outcomes: every delivery
//! tag is acknowledged (task `DONE`) or requeued (task `FAILED`) exactly
//! once.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{TaskReceiver, TaskSender};
use crate::config::ConfigFile;
use crate::errors::BrokerError;
use crate::exec::StopReceiver;
use crate::task::params::{OBJ_REF, PROVIDER};
use crate::task::{Action, Origin, Params, Task, TaskState};

/// Actions the broker delivers; one queue per enabled type and action.
pub const CONSUMED_ACTIONS: [Action; 3] = [Action::Create, Action::Update, Action::Delete];

/// Settles one delivered message.
#[async_trait]
pub trait MessageHandle: Send + Sync {
    /// Remove the message from the broker for good.
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Make the message available for redelivery.
    async fn requeue(&self) -> Result<(), BrokerError>;
}

/// One delivery.
pub struct BrokerMessage {
    pub delivery_tag: String,
    /// `<resType>.<action>`.
    pub exchange: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub handle: Box<dyn MessageHandle>,
}

impl std::fmt::Debug for BrokerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerMessage")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Queue declaration the consumer has to set up before consuming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    pub exchange_type: String,
    pub routing_key: String,
}

impl std::fmt::Display for QueueBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} <- {} ({}, key {})",
            self.queue, self.exchange, self.exchange_type, self.routing_key
        )
    }
}

/// Queue bindings for every enabled resource type.
pub fn bindings(cfg: &ConfigFile) -> Vec<QueueBinding> {
    let routing_key = cfg.consumer_routing_key();
    cfg.enabled_resources
        .iter()
        .flat_map(|res_type| {
            let routing_key = routing_key.clone();
            CONSUMED_ACTIONS.into_iter().map(move |action| QueueBinding {
                queue: format!("te.{}.{res_type}.{action}", cfg.server.hostname),
                exchange: format!("{res_type}.{action}"),
                exchange_type: cfg.amqp.exchange_type.clone(),
                routing_key: routing_key.clone(),
            })
        })
        .collect()
}

/// External broker transport.
#[async_trait]
pub trait BrokerConsumer: Send {
    async fn bind(&mut self, bindings: &[QueueBinding]) -> Result<(), BrokerError>;

    /// Next delivery; `None` once the consumer is gone for good. Must be
    /// cancel safe, the listener polls it alongside its timers.
    async fn next_message(&mut self) -> Option<Result<BrokerMessage, BrokerError>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageBody {
    operation_identity: String,
    action_identity: String,
    #[serde(default)]
    obj_ref: Option<String>,
    #[serde(default)]
    params: Map<String, Value>,
}

pub struct BrokerBridge {
    intake: TaskSender,
    processed: TaskReceiver,
    handles: HashMap<String, Box<dyn MessageHandle>>,
    iteration_interval: Duration,
}

impl BrokerBridge {
    pub fn new(intake: TaskSender, processed: TaskReceiver, iteration_interval: Duration) -> Self {
        Self {
            intake,
            processed,
            handles: HashMap::new(),
            iteration_interval,
        }
    }

    /// Number of delivered messages still waiting for an outcome.
    pub fn unsettled(&self) -> usize {
        self.handles.len()
    }

    /// Turn a delivery into a task on the intake queue.
    ///
    /// A message that cannot be decoded can never succeed, so it is
    /// acknowledged right away.
    pub async fn take_event(&mut self, message: BrokerMessage) {
        let BrokerMessage {
            delivery_tag,
            exchange,
            headers,
            body,
            handle,
        } = message;

        let task = match decode_task(&delivery_tag, &exchange, &headers, &body) {
            Ok(task) => task,
            Err(e) => {
                error!(%delivery_tag, %exchange, error = %e, "dropping undecodable message");
                if let Err(e) = handle.ack().await {
                    error!(%delivery_tag, error = %e, "failed to ack undecodable message");
                }
                return;
            }
        };

        debug!(task = %task, "message received");
        if self.handles.contains_key(&delivery_tag) {
            warn!(%delivery_tag, "duplicate delivery tag, replacing handle");
        }
        self.handles.insert(delivery_tag, handle);
        if let Err(e) = self.intake.send(task) {
            error!(task = %e.0, "intake queue closed, message stays unacknowledged");
        }
    }

    /// Settle every finished task waiting on the processed queue.
    pub async fn on_iteration(&mut self) {
        while let Ok(task) = self.processed.try_recv() {
            self.settle(task).await;
        }
    }

    async fn settle(&mut self, task: Task) {
        let Some(tag) = task.tag.as_deref() else {
            warn!(task = %task, "processed task carries no tag");
            return;
        };
        let Some(handle) = self.handles.remove(tag) else {
            warn!(task = %task, "no message waiting for this tag");
            return;
        };

        let result = match task.state {
            TaskState::Done => {
                debug!(task = %task, "acknowledging message");
                handle.ack().await
            }
            TaskState::Failed => {
                info!(task = %task, "requeueing message");
                handle.requeue().await
            }
            other => {
                warn!(task = %task, state = ?other, "processed task is neither done nor failed, dropping");
                return;
            }
        };
        if let Err(e) = result {
            error!(task = %task, error = %e, "failed to settle message");
        }
    }

    /// Bind, then consume until the stop signal or until the consumer
    /// dies. Returns an error in the latter case.
    pub async fn listen(
        mut self,
        mut consumer: Box<dyn BrokerConsumer>,
        bindings: Vec<QueueBinding>,
        mut stop: StopReceiver,
    ) -> Result<(), BrokerError> {
        let span = info_span!("broker_listener");
        async move {
            consumer.bind(&bindings).await?;
            info!(queues = bindings.len(), "broker listener started");

            let mut ticker = tokio::time::interval(self.iteration_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || stop.borrow().is_some() {
                            break;
                        }
                    }
                    _ = ticker.tick() => self.on_iteration().await,
                    next = consumer.next_message() => match next {
                        Some(Ok(message)) => self.take_event(message).await,
                        Some(Err(e)) => {
                            error!(error = %e, "broker consumer failed");
                            return Err(e);
                        }
                        None => {
                            error!("broker consumer closed");
                            return Err(BrokerError::ConsumerClosed);
                        }
                    },
                }
            }

            // whatever already finished still gets settled
            self.on_iteration().await;
            info!(unsettled = self.handles.len(), "broker listener stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }
}

fn decode_task(
    delivery_tag: &str,
    exchange: &str,
    headers: &HashMap<String, String>,
    body: &[u8],
) -> Result<Task, BrokerError> {
    let (res_type, action) = exchange
        .rsplit_once('.')
        .ok_or_else(|| BrokerError::Malformed(format!("exchange '{exchange}' is not <type>.<action>")))?;
    let action: Action = action.parse().map_err(BrokerError::Malformed)?;

    let body: MessageBody =
        serde_json::from_slice(body).map_err(|e| BrokerError::Malformed(e.to_string()))?;

    let mut params = Params::from(body.params);
    if let Some(obj_ref) = body.obj_ref {
        params.insert(OBJ_REF, obj_ref);
    }
    if let Some(provider) = headers.get(PROVIDER) {
        params.insert(PROVIDER, provider.clone());
    }

    Ok(Task::new(
        Some(delivery_tag.to_string()),
        Origin::Broker,
        body.operation_identity,
        body.action_identity,
        res_type,
        action,
        params,
    ))
}
