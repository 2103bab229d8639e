// src/exec/mod.rs

//! Task execution.
//!
//! The [`dispatcher::Dispatcher`] owns one [`pool::WorkerPool`] per
//! [`PoolKind`] and routes every task to exactly one of them. Workers run
//! [`processor::TaskProcessor::process`]; undispatched work survives a
//! restart through [`snapshot::SnapshotStore`].

pub mod dispatcher;
pub mod pool;
pub mod processor;
pub mod snapshot;

use tokio::sync::watch;

use crate::config::ConfigFile;
use crate::task::{Action, Task};

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use pool::{Completion, Runner, WorkerPool};
pub use processor::TaskProcessor;
pub use snapshot::SnapshotStore;

/// How the dispatcher should wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Snapshot the backlog and wait for in-flight work.
    Graceful,
    /// Snapshot the backlog and abandon in-flight work.
    Immediate,
}

pub type StopSender = watch::Sender<Option<StopMode>>;
pub type StopReceiver = watch::Receiver<Option<StopMode>>;

pub fn stop_channel() -> (StopSender, StopReceiver) {
    watch::channel(None)
}

/// The pools, keyed by the shape of the work they accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Command,
    LongCommand,
    Query,
    BackupFiles,
    BackupDbs,
}

impl PoolKind {
    pub const ALL: [PoolKind; 5] = [
        PoolKind::Command,
        PoolKind::LongCommand,
        PoolKind::Query,
        PoolKind::BackupFiles,
        PoolKind::BackupDbs,
    ];

    /// Stable name; also names the pool's snapshot file.
    pub fn name(self) -> &'static str {
        match self {
            PoolKind::Command => "command_task_pool",
            PoolKind::LongCommand => "long_command_task_pool",
            PoolKind::Query => "query_task_pool",
            PoolKind::BackupFiles => "backup_files_task_pool",
            PoolKind::BackupDbs => "backup_dbs_task_pool",
        }
    }

    pub fn index(self) -> usize {
        match self {
            PoolKind::Command => 0,
            PoolKind::LongCommand => 1,
            PoolKind::Query => 2,
            PoolKind::BackupFiles => 3,
            PoolKind::BackupDbs => 4,
        }
    }

    /// First matching rule wins.
    pub fn select(task: &Task) -> PoolKind {
        match task.action {
            action if action.is_query() => PoolKind::Query,
            action if action.is_mutating() && task.params.needs_extended_timeout() => {
                PoolKind::LongCommand
            }
            action if action.is_mutating() => PoolKind::Command,
            Action::Backup if task.res_type == "database" => PoolKind::BackupDbs,
            _ => PoolKind::BackupFiles,
        }
    }
}

/// Worker count per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizes {
    pub command: usize,
    pub long_command: usize,
    pub query: usize,
    pub backup_files: usize,
    pub backup_dbs: usize,
}

impl PoolSizes {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        let workers = &cfg.max_workers;
        Self {
            command: workers.command,
            long_command: workers.long_command(),
            query: workers.query,
            backup_files: workers.backup.files,
            backup_dbs: workers.backup.dbs,
        }
    }

    pub fn of(&self, kind: PoolKind) -> usize {
        match kind {
            PoolKind::Command => self.command,
            PoolKind::LongCommand => self.long_command,
            PoolKind::Query => self.query,
            PoolKind::BackupFiles => self.backup_files,
            PoolKind::BackupDbs => self.backup_dbs,
        }
    }
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            command: 10,
            long_command: 5,
            query: 5,
            backup_files: 2,
            backup_dbs: 4,
        }
    }
}
