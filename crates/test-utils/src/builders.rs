#![allow(dead_code)]

use std::path::Path;

use serde_json::{json, Value};
use taskexec::config::{
    AmqpSection, CacheSection, ConfigFile, ExecutorSection, MaxWorkersSection, RawConfigFile,
    ScheduleEntry, ServerSection, TaskSection, WatchdogSection,
};
use taskexec::resource::Resource;
use taskexec::task::{Action, Origin, Params, Task};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                server: ServerSection {
                    hostname: "web15".to_string(),
                    id: "web_server_15".to_string(),
                },
                enabled_resources: vec![],
                executor: ExecutorSection::default(),
                max_workers: MaxWorkersSection::default(),
                task: TaskSection::default(),
                amqp: AmqpSection::default(),
                watchdog: WatchdogSection::default(),
                cache: CacheSection::default(),
                schedule: vec![],
            },
        }
    }

    pub fn enable(mut self, res_type: &str) -> Self {
        self.config.enabled_resources.push(res_type.to_string());
        self
    }

    pub fn dump_dir(mut self, dir: &Path) -> Self {
        self.config.executor.dump_dir = dir.to_path_buf();
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.executor.poll_interval_ms = ms;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.task.max_retries = n;
        self
    }

    /// Backoff step in milliseconds; tests keep it tiny.
    pub fn backoff_unit_ms(mut self, ms: u64) -> Self {
        self.config.task.backoff_unit_ms = ms;
        self
    }

    pub fn schedule_every(mut self, res_type: &str, action: &str, secs: u64) -> Self {
        self.config.schedule.push(ScheduleEntry {
            action: action.to_string(),
            res_type: res_type.to_string(),
            interval: Some(secs),
            daily: false,
            at: None,
            params: toml::Table::new(),
        });
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `Task`.
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(res_type: &str, action: Action) -> Self {
        Self {
            task: Task::new(
                None,
                Origin::Broker,
                "op-1",
                format!("{res_type}.{action}"),
                res_type,
                action,
                Params::new(),
            ),
        }
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.task.tag = Some(tag.to_string());
        self
    }

    pub fn origin(mut self, origin: Origin) -> Self {
        self.task.origin = origin;
        self
    }

    pub fn action_id(mut self, actid: &str) -> Self {
        self.task.action_id = actid.to_string();
        self
    }

    pub fn resource(mut self, resource: Value) -> Self {
        self.task.params.set_resource(&Resource::from(resource));
        self
    }

    pub fn param(mut self, key: &str, value: Value) -> Self {
        self.task.params.insert(key, value);
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

// Resource JSON in the shape the catalog returns.

pub fn unix_account(id: &str, name: &str) -> Value {
    json!({"id": id, "name": name, "switchedOn": true, "quota": 1_000_000})
}

pub fn ssl_certificate(id: &str, name: &str) -> Value {
    json!({"id": id, "name": name, "switchedOn": true})
}

pub fn domain(id: &str, name: &str, cert: Option<Value>) -> Value {
    json!({"id": id, "name": name, "sslCertificate": cert})
}

pub fn website(id: &str, name: &str, account: Value, domains: Vec<Value>) -> Value {
    json!({
        "id": id,
        "name": name,
        "switchedOn": true,
        "unixAccount": account,
        "domains": domains,
    })
}

pub fn database_user(id: &str, name: &str, addrs: &[&str]) -> Value {
    json!({
        "id": id,
        "name": name,
        "switchedOn": true,
        "passwordHash": "*hash",
        "allowedIPAddresses": addrs,
    })
}

pub fn database(id: &str, name: &str, users: Vec<Value>) -> Value {
    json!({"id": id, "name": name, "switchedOn": true, "databaseUsers": users})
}

/// A local service whose template is `kind` serving `resource_type`.
pub fn service(id: &str, kind: &str, resource_type: &str) -> Value {
    json!({
        "id": id,
        "name": id,
        "switchedOn": true,
        "template": {"@type": kind, "resourceType": resource_type},
    })
}
