// src/watchdog.rs

//! Liveness watchdog for the long-running components.
//!
//! Every component (dispatcher, listeners) runs as its own Tokio task.
//! The watchdog checks them on a fixed interval. A component that ends
//! while no stop was requested is logged; a critical one ending stops the
//! whole process with an error.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::TaskExecError;
use crate::exec::{StopMode, StopReceiver, StopSender};

/// What a component task resolves to.
pub type ComponentResult = anyhow::Result<()>;

struct Component {
    name: String,
    critical: bool,
    handle: JoinHandle<ComponentResult>,
}

pub struct Watchdog {
    interval: Duration,
    components: Vec<Component>,
    stop: Arc<StopSender>,
}

impl Watchdog {
    pub fn new(interval: Duration, stop: Arc<StopSender>) -> Self {
        Self {
            interval,
            components: Vec::new(),
            stop,
        }
    }

    /// Watch a component. A `critical` component dying takes the process
    /// down.
    pub fn watch(&mut self, name: impl Into<String>, critical: bool, handle: JoinHandle<ComponentResult>) {
        self.components.push(Component {
            name: name.into(),
            critical,
            handle,
        });
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Check until a stop is requested or a critical component dies, then
    /// wait for every component to end.
    pub async fn run(mut self, mut stop_rx: StopReceiver) -> Result<(), TaskExecError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut died: Option<String> = None;

        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || stop_rx.borrow().is_some() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(name) = self.check().await {
                        died = Some(name);
                        self.stop.send_replace(Some(StopMode::Graceful));
                        break;
                    }
                }
            }
        }

        for component in self.components.drain(..) {
            log_exit(&component.name, component.handle.await);
        }

        match died {
            Some(name) => Err(TaskExecError::ListenerDied(name)),
            None => Ok(()),
        }
    }

    /// Reap finished components. Returns the name of a dead critical one.
    async fn check(&mut self) -> Option<String> {
        let mut alive = Vec::with_capacity(self.components.len());
        let mut dead_critical = None;
        for component in self.components.drain(..) {
            if !component.handle.is_finished() {
                alive.push(component);
                continue;
            }
            error!(component = %component.name, "component ended unexpectedly");
            log_exit(&component.name, component.handle.await);
            if component.critical && dead_critical.is_none() {
                dead_critical = Some(component.name);
            }
        }
        debug!(alive = alive.len(), "watchdog check");
        self.components = alive;
        dead_critical
    }
}

fn log_exit(name: &str, joined: Result<ComponentResult, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => info!(component = %name, "component stopped"),
        Ok(Err(e)) => error!(component = %name, error = %e, "component failed"),
        Err(e) if e.is_cancelled() => warn!(component = %name, "component cancelled"),
        Err(e) => error!(component = %name, error = %e, "component panicked"),
    }
}
