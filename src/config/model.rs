// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Configuration exactly as read from the TOML file, before validation.
///
/// ```toml
/// enabled_resources = ["unix-account", "website", "database", "database-user"]
///
/// [server]
/// hostname = "web15"
/// id = "web_server_15"
///
/// [max_workers]
/// command = 10
/// query = 5
///
/// [max_workers.backup]
/// files = 2
/// dbs = 4
///
/// [[schedule]]
/// action = "quota_report"
/// res_type = "unix-account"
/// interval = 300
/// ```
///
/// All sections except `[server]` are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    pub server: ServerSection,

    /// Resource types this host manages; only these get broker bindings
    /// and scheduled jobs.
    #[serde(default)]
    pub enabled_resources: Vec<String>,

    #[serde(default)]
    pub executor: ExecutorSection,

    #[serde(default)]
    pub max_workers: MaxWorkersSection,

    #[serde(default)]
    pub task: TaskSection,

    #[serde(default)]
    pub amqp: AmqpSection,

    #[serde(default)]
    pub watchdog: WatchdogSection,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
}

/// Validated configuration. Construct through `ConfigFile::try_from`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub enabled_resources: Vec<String>,
    pub executor: ExecutorSection,
    pub max_workers: MaxWorkersSection,
    pub task: TaskSection,
    pub amqp: AmqpSection,
    pub watchdog: WatchdogSection,
    pub cache: CacheSection,
    pub schedule: Vec<ScheduleEntry>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            server: raw.server,
            enabled_resources: raw.enabled_resources,
            executor: raw.executor,
            max_workers: raw.max_workers,
            task: raw.task,
            amqp: raw.amqp,
            watchdog: raw.watchdog,
            cache: raw.cache,
            schedule: raw.schedule,
        }
    }

    pub fn is_enabled(&self, res_type: &str) -> bool {
        self.enabled_resources.iter().any(|r| r == res_type)
    }

    /// Routing key used for broker bindings, `te.<hostname>` unless overridden.
    pub fn consumer_routing_key(&self) -> String {
        self.amqp
            .consumer_routing_key
            .clone()
            .unwrap_or_else(|| format!("te.{}", self.server.hostname))
    }
}

/// `[server]` section: identity of the local host in the resource catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Catalog id of this server, used to scope account/mailbox lookups.
    pub id: String,
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .and_then(|h| h.split('.').next().map(str::to_string))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// `[executor]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    /// Directory for per-pool snapshots of undispatched work.
    #[serde(default = "default_dump_dir")]
    pub dump_dir: PathBuf,

    /// How long the dispatcher waits for new intake before sweeping
    /// completed work.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_dump_dir() -> PathBuf {
    PathBuf::from("/var/cache/te")
}

fn default_poll_interval_ms() -> u64 {
    200
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            dump_dir: default_dump_dir(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ExecutorSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// `[max_workers]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct MaxWorkersSection {
    #[serde(default = "default_command_workers")]
    pub command: usize,

    #[serde(default = "default_query_workers")]
    pub query: usize,

    #[serde(default)]
    pub backup: BackupWorkersSection,
}

fn default_command_workers() -> usize {
    10
}

fn default_query_workers() -> usize {
    5
}

impl Default for MaxWorkersSection {
    fn default() -> Self {
        Self {
            command: default_command_workers(),
            query: default_query_workers(),
            backup: BackupWorkersSection::default(),
        }
    }
}

impl MaxWorkersSection {
    /// The long-running command pool gets half the command slots.
    pub fn long_command(&self) -> usize {
        (self.command / 2).max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupWorkersSection {
    #[serde(default = "default_backup_files_workers")]
    pub files: usize,

    #[serde(default = "default_backup_dbs_workers")]
    pub dbs: usize,
}

fn default_backup_files_workers() -> usize {
    2
}

fn default_backup_dbs_workers() -> usize {
    4
}

impl Default for BackupWorkersSection {
    fn default() -> Self {
        Self {
            files: default_backup_files_workers(),
            dbs: default_backup_dbs_workers(),
        }
    }
}

/// `[task]` section: retry behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// One backoff step; a task that failed N times sleeps
    /// `min(N, backoff_cap)` steps before running again.
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,

    #[serde(default = "default_backoff_cap")]
    pub backoff_cap: u32,
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_unit_ms() -> u64 {
    1000
}

fn default_backoff_cap() -> u32 {
    60
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_unit_ms: default_backoff_unit_ms(),
            backoff_cap: default_backoff_cap(),
        }
    }
}

/// `[amqp]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AmqpSection {
    #[serde(default = "default_exchange_type")]
    pub exchange_type: String,

    #[serde(default)]
    pub consumer_routing_key: Option<String>,

    /// How often processed broker tasks are turned into ack/requeue.
    #[serde(default = "default_iteration_interval_ms")]
    pub iteration_interval_ms: u64,
}

fn default_exchange_type() -> String {
    "topic".to_string()
}

fn default_iteration_interval_ms() -> u64 {
    100
}

impl Default for AmqpSection {
    fn default() -> Self {
        Self {
            exchange_type: default_exchange_type(),
            consumer_routing_key: None,
            iteration_interval_ms: default_iteration_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogSection {
    #[serde(default = "default_watchdog_interval")]
    pub interval_secs: u64,
}

fn default_watchdog_interval() -> u64 {
    5
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            interval_secs: default_watchdog_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

fn default_cache_entries() -> usize {
    4096
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
        }
    }
}

/// One `[[schedule]]` entry.
///
/// Either `interval` (seconds) or `daily = true` with `at = "HH:MM"`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEntry {
    pub action: String,
    pub res_type: String,

    #[serde(default)]
    pub interval: Option<u64>,

    #[serde(default)]
    pub daily: bool,

    #[serde(default)]
    pub at: Option<String>,

    /// Extra params copied into every task this entry produces.
    #[serde(default)]
    pub params: toml::Table,
}
