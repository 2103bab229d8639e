// src/lib.rs

pub mod backup;
pub mod cli;
pub mod collector;
pub mod config;
pub mod errors;
pub mod exec;
pub mod handler;
pub mod listener;
pub mod logging;
pub mod report;
pub mod resource;
pub mod task;
pub mod watchdog;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::backup::{BackupRunner, NoBackup};
use crate::cli::CliArgs;
use crate::collector::{CollectorRegistry, PropertyCache};
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::exec::{
    Dispatcher, DispatcherConfig, PoolKind, PoolSizes, StopMode, StopSender, TaskProcessor,
    stop_channel,
};
use crate::handler::HandlerRegistry;
use crate::listener::broker::{self, BrokerBridge, BrokerConsumer};
use crate::listener::scheduler::{JobTiming, TimeListener};
use crate::listener::{ProcessedQueues, TaskSender, intake_channel};
use crate::report::{LogTransport, ReportTransport, Reporter};
use crate::resource::catalog::{NoServices, OfflineCatalog};
use crate::resource::{ResourceCatalog, ResourceGraph, ServiceDirectory};
use crate::task::{Action, Origin, Params, RetryPolicy, Task};
use crate::watchdog::Watchdog;

/// Operation identity of the re-sync requested by SIGUSR1.
pub const RESYNC_OPERATION_ID: &str = "LOCAL-RESYNC";

/// The external systems the executor talks to.
pub struct Collaborators {
    pub catalog: Arc<dyn ResourceCatalog>,
    pub services: Arc<dyn ServiceDirectory>,
    pub handlers: HandlerRegistry,
    pub collectors: CollectorRegistry,
    pub transport: Arc<dyn ReportTransport>,
    pub backups: Arc<dyn BackupRunner>,
}

impl Collaborators {
    /// Nothing wired in: no catalog, no local services, no handlers, and
    /// reports are only logged.
    pub fn offline(cfg: &ConfigFile) -> Self {
        Self {
            catalog: Arc::new(OfflineCatalog),
            services: Arc::new(NoServices),
            handlers: HandlerRegistry::new(),
            collectors: CollectorRegistry::new(PropertyCache::new(cfg.cache.max_entries)),
            transport: Arc::new(LogTransport),
            backups: Arc::new(NoBackup),
        }
    }
}

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let collaborators = Collaborators::offline(&cfg);
    run_with(cfg, collaborators, None).await
}

/// Run the executor until a stop signal, or until the broker listener
/// dies (which is an error).
///
/// This wires together:
/// - the task processor and the dispatcher with its pools
/// - the time-based listener
/// - the broker listener, when a consumer is supplied
/// - the liveness watchdog
/// - signal handling
pub async fn run_with(
    cfg: ConfigFile,
    collaborators: Collaborators,
    broker: Option<Box<dyn BrokerConsumer>>,
) -> Result<()> {
    let Collaborators {
        catalog,
        services,
        handlers,
        collectors,
        transport,
        backups,
    } = collaborators;

    let (intake_tx, intake_rx) = intake_channel();
    let mut processed = ProcessedQueues::new();
    let scheduler_done = processed.attach(Origin::Scheduler);
    let broker_done = broker.is_some().then(|| processed.attach(Origin::Broker));

    let processor = Arc::new(TaskProcessor::new(
        ResourceGraph::new(catalog, services),
        Arc::new(handlers),
        Arc::new(collectors),
        backups,
        Arc::new(Reporter::new(transport, cfg.server.hostname.clone())),
        RetryPolicy::from_config(&cfg.task),
        cfg.server.id.clone(),
        intake_tx.clone(),
    ));
    let dispatcher = Dispatcher::new(
        DispatcherConfig::from_config(&cfg),
        processor.runner(),
        intake_rx,
        processed,
    );

    let (stop_tx, stop_rx) = stop_channel();
    let stop_tx = Arc::new(stop_tx);
    let mut watchdog = Watchdog::new(
        Duration::from_secs(cfg.watchdog.interval_secs.max(1)),
        Arc::clone(&stop_tx),
    );

    let stop = stop_rx.clone();
    watchdog.watch(
        "dispatcher",
        false,
        tokio::spawn(async move {
            dispatcher.run(stop).await;
            anyhow::Ok(())
        }),
    );

    let time_listener = TimeListener::from_config(&cfg, intake_tx.clone(), scheduler_done);
    let stop = stop_rx.clone();
    watchdog.watch(
        "time_listener",
        false,
        tokio::spawn(async move {
            time_listener.run(stop).await;
            anyhow::Ok(())
        }),
    );

    match (broker, broker_done) {
        (Some(consumer), Some(done)) => {
            let bridge = BrokerBridge::new(
                intake_tx.clone(),
                done,
                Duration::from_millis(cfg.amqp.iteration_interval_ms),
            );
            let bindings = broker::bindings(&cfg);
            let stop = stop_rx.clone();
            watchdog.watch(
                "broker_listener",
                true,
                tokio::spawn(async move {
                    bridge
                        .listen(consumer, bindings, stop)
                        .await
                        .map_err(anyhow::Error::from)
                }),
            );
        }
        _ => warn!("no broker transport configured, broker listener disabled"),
    }

    spawn_signal_handler(Arc::clone(&stop_tx), intake_tx);

    info!(components = watchdog.len(), "taskexec started");
    watchdog.run(stop_rx).await?;
    info!("taskexec stopped");
    Ok(())
}

/// SIGINT/SIGTERM stop gracefully, a second one stops immediately.
/// SIGUSR1 re-syncs every local service.
fn spawn_signal_handler(stop: Arc<StopSender>, intake: TaskSender) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let (mut sigint, mut sigterm, mut sigusr1) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
            signal(SignalKind::user_defined1()),
        ) {
            (Ok(a), Ok(b), Ok(c)) => (a, b, c),
            (a, b, c) => {
                let e = [a.err(), b.err(), c.err()].into_iter().flatten().next();
                error!(error = ?e, "failed to install signal handlers");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = sigint.recv() => request_stop(&stop, "SIGINT"),
                _ = sigterm.recv() => request_stop(&stop, "SIGTERM"),
                _ = sigusr1.recv() => {
                    info!("SIGUSR1 received, re-syncing local services");
                    if intake.send(resync_task()).is_err() {
                        warn!("intake queue closed, re-sync dropped");
                    }
                }
            }
        }
    });
}

fn request_stop(stop: &StopSender, signal: &str) {
    let mode = match *stop.borrow() {
        None => StopMode::Graceful,
        Some(_) => StopMode::Immediate,
    };
    info!(signal, ?mode, "stop requested");
    stop.send_replace(Some(mode));
}

/// An `update` of every local service. No resource is attached, so the
/// processor fans out over the service directory.
pub fn resync_task() -> Task {
    Task::new(
        None,
        Origin::Scheduler,
        RESYNC_OPERATION_ID,
        "service.update",
        "service",
        Action::Update,
        Params::new(),
    )
}

/// Dry-run output: pools, schedule and broker bindings.
fn print_dry_run(cfg: &ConfigFile) {
    println!("taskexec dry-run");
    println!("  server.hostname = {}", cfg.server.hostname);
    println!("  server.id = {}", cfg.server.id);
    println!("  enabled_resources = {:?}", cfg.enabled_resources);
    println!("  executor.dump_dir = {}", cfg.executor.dump_dir.display());
    println!(
        "  task.max_retries = {} (backoff {}ms x min(failcount, {}))",
        cfg.task.max_retries, cfg.task.backoff_unit_ms, cfg.task.backoff_cap
    );
    println!();

    println!("Pools:");
    let sizes = PoolSizes::from_config(cfg);
    for kind in PoolKind::ALL {
        println!("  - {}: {} worker(s)", kind.name(), sizes.of(kind));
    }
    println!();

    println!("Schedule:");
    if cfg.schedule.is_empty() {
        println!("  (none)");
    }
    for entry in &cfg.schedule {
        let timing = JobTiming::from_entry(entry)
            .map(|t| t.to_string())
            .unwrap_or_else(|e| format!("invalid: {e}"));
        let enabled = if cfg.is_enabled(&entry.res_type) {
            ""
        } else {
            " (resource type not enabled)"
        };
        println!("  - {}.{}: {timing}{enabled}", entry.res_type, entry.action);
    }
    println!();

    println!("Broker bindings:");
    let bindings = broker::bindings(cfg);
    if bindings.is_empty() {
        println!("  (none)");
    }
    for binding in bindings {
        println!("  - {binding}");
    }
}
