// src/listener/mod.rs

//! Task sources.
//!
//! A listener turns external events into [`Task`]s on the shared intake
//! queue and consumes its own "processed" queue to settle finished work:
//!
//! - [`broker`] acknowledges or requeues the originating broker message.
//! - [`scheduler`] produces periodic jobs and re-enqueues failed ones.

pub mod broker;
pub mod scheduler;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::task::{Origin, Task};

/// Producer side of the dispatcher's intake queue.
pub type TaskSender = mpsc::UnboundedSender<Task>;
pub type TaskReceiver = mpsc::UnboundedReceiver<Task>;

pub fn intake_channel() -> (TaskSender, TaskReceiver) {
    mpsc::unbounded_channel()
}

/// Per-origin output queues for finished tasks that carry a tag.
#[derive(Debug, Clone, Default)]
pub struct ProcessedQueues {
    broker: Option<TaskSender>,
    scheduler: Option<TaskSender>,
}

impl ProcessedQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the processed queue for `origin`; returns its consumer end.
    pub fn attach(&mut self, origin: Origin) -> TaskReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        match origin {
            Origin::Broker => self.broker = Some(tx),
            Origin::Scheduler => self.scheduler = Some(tx),
        }
        rx
    }

    pub fn push(&self, task: Task) {
        let queue = match task.origin {
            Origin::Broker => self.broker.as_ref(),
            Origin::Scheduler => self.scheduler.as_ref(),
        };
        match queue {
            Some(tx) => {
                if let Err(e) = tx.send(task) {
                    warn!(task = %e.0, "processed queue closed, dropping finished task");
                }
            }
            None => debug!(task = %task, "no listener attached for origin, dropping finished task"),
        }
    }
}
