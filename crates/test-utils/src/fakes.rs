#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use taskexec::errors::{BrokerError, CatalogError, HandlerError, ReportError};
use taskexec::handler::database::DatabaseServer;
use taskexec::handler::{HandlerContext, HandlerRegistry, ResourceHandler};
use taskexec::listener::broker::{BrokerConsumer, BrokerMessage, MessageHandle, QueueBinding};
use taskexec::report::{Report, ReportTransport};
use taskexec::resource::{Resource, ResourceCatalog, Scope, ServiceDirectory};

/// Shared, ordered call log.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

/// Catalog backed by two maps: reference path → resource and
/// `(type, scope)` → resources. Anything else is `NotFound`.
#[derive(Default)]
pub struct InMemoryCatalog {
    by_reference: HashMap<String, Value>,
    by_scope: HashMap<(String, String), Vec<Value>>,
    unreachable: bool,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reference(mut self, path: &str, resource: Value) -> Self {
        self.by_reference.insert(path.to_string(), resource);
        self
    }

    pub fn with_scoped(mut self, res_type: &str, scope: Scope, resources: Vec<Value>) -> Self {
        self.by_scope
            .insert((res_type.to_string(), scope.to_string()), resources);
        self
    }

    /// Every lookup fails with a transport error.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ResourceCatalog for InMemoryCatalog {
    async fn fetch_by_reference(&self, reference: &str) -> Result<Resource, CatalogError> {
        if self.unreachable {
            return Err(CatalogError::Transport("connection refused".to_string()));
        }
        self.by_reference
            .get(reference)
            .cloned()
            .map(Resource::from)
            .ok_or_else(|| CatalogError::NotFound(reference.to_string()))
    }

    async fn fetch_by_type_and_scope(
        &self,
        res_type: &str,
        scope: &Scope,
    ) -> Result<Vec<Resource>, CatalogError> {
        if self.unreachable {
            return Err(CatalogError::Transport("connection refused".to_string()));
        }
        self.by_scope
            .get(&(res_type.to_string(), scope.to_string()))
            .map(|found| found.iter().cloned().map(Resource::from).collect())
            .ok_or_else(|| CatalogError::NotFound(format!("{res_type} ({scope})")))
    }
}

#[derive(Default)]
pub struct FakeServices(pub Vec<Value>);

impl ServiceDirectory for FakeServices {
    fn local_services(&self) -> Vec<Resource> {
        self.0.iter().cloned().map(Resource::from).collect()
    }
}

/// Handler that logs `<type>.<action> <identity>` and fails for the
/// configured identities.
pub struct RecordingHandler {
    ctx: HandlerContext,
    log: CallLog,
    failing: Arc<BTreeSet<String>>,
}

impl RecordingHandler {
    fn record(&self, action: &str) -> Result<(), HandlerError> {
        let identity = self.ctx.resource.identity().to_string();
        self.log
            .push(format!("{}.{action} {identity}", self.ctx.res_type));
        if self.failing.contains(&identity) {
            return Err(HandlerError::Service(format!("{identity} is broken")));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceHandler for RecordingHandler {
    fn resource(&self) -> &Resource {
        &self.ctx.resource
    }

    async fn create(&self) -> Result<(), HandlerError> {
        let _guard = self.ctx.lock.acquire().await;
        self.record("create")
    }

    async fn update(&self) -> Result<(), HandlerError> {
        let _guard = self.ctx.lock.acquire().await;
        self.record("update")
    }

    async fn delete(&self) -> Result<(), HandlerError> {
        let _guard = self.ctx.lock.acquire().await;
        self.record("delete")
    }
}

/// A registry with a [`RecordingHandler`] for each of `types`.
pub fn recording_handlers(types: &[&str], log: &CallLog, failing: &[&str]) -> HandlerRegistry {
    let failing: Arc<BTreeSet<String>> =
        Arc::new(failing.iter().map(|s| s.to_string()).collect());
    let mut registry = HandlerRegistry::new();
    for res_type in types {
        let log = log.clone();
        let failing = Arc::clone(&failing);
        registry.register(*res_type, move |ctx| {
            Ok(Box::new(RecordingHandler {
                ctx,
                log: log.clone(),
                failing: Arc::clone(&failing),
            }) as Box<dyn ResourceHandler>)
        });
    }
    registry
}

#[derive(Default, Clone)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<Report>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Report> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportTransport for RecordingTransport {
    async fn send(&self, report: &Report) -> Result<(), ReportError> {
        self.sent.lock().unwrap().push(report.clone());
        Ok(())
    }
}

/// Message handle that logs `ack <tag>` / `requeue <tag>`.
pub struct RecordingMessageHandle {
    tag: String,
    log: CallLog,
}

impl RecordingMessageHandle {
    pub fn new(tag: &str, log: &CallLog) -> Self {
        Self {
            tag: tag.to_string(),
            log: log.clone(),
        }
    }
}

#[async_trait]
impl MessageHandle for RecordingMessageHandle {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.log.push(format!("ack {}", self.tag));
        Ok(())
    }

    async fn requeue(&self) -> Result<(), BrokerError> {
        self.log.push(format!("requeue {}", self.tag));
        Ok(())
    }
}

/// A broker delivery on exchange `<res_type>.<action>` with `body`.
pub fn broker_message(tag: &str, exchange: &str, body: Value, log: &CallLog) -> BrokerMessage {
    BrokerMessage {
        delivery_tag: tag.to_string(),
        exchange: exchange.to_string(),
        headers: HashMap::from([("provider".to_string(), "rc-user".to_string())]),
        body: serde_json::to_vec(&body).unwrap(),
        handle: Box::new(RecordingMessageHandle::new(tag, log)),
    }
}

/// Consumer fed from a channel; dropping the sender ends it.
pub struct ChannelConsumer {
    rx: mpsc::UnboundedReceiver<BrokerMessage>,
    pub bound: Arc<Mutex<Vec<QueueBinding>>>,
}

impl ChannelConsumer {
    pub fn new() -> (mpsc::UnboundedSender<BrokerMessage>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                rx,
                bound: Arc::default(),
            },
        )
    }
}

#[async_trait]
impl BrokerConsumer for ChannelConsumer {
    async fn bind(&mut self, bindings: &[QueueBinding]) -> Result<(), BrokerError> {
        self.bound.lock().unwrap().extend_from_slice(bindings);
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<BrokerMessage, BrokerError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// In-memory SQL server that records every mutating call.
#[derive(Default)]
pub struct FakeDatabaseServer {
    users: Mutex<HashMap<String, Value>>,
    databases: Mutex<HashMap<String, Value>>,
    pub calls: CallLog,
}

impl FakeDatabaseServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, name: &str, addrs: &[&str], databases: &[&str]) -> Self {
        self.users.lock().unwrap().insert(
            name.to_string(),
            json!({"name": name, "allowedIPAddresses": addrs, "databases": databases}),
        );
        self
    }

    pub fn with_database(self, name: &str, users: &[(&str, &[&str])]) -> Self {
        let users: Vec<Value> = users
            .iter()
            .map(|(user, addrs)| json!({"name": user, "allowedIPAddresses": addrs}))
            .collect();
        self.databases
            .lock()
            .unwrap()
            .insert(name.to_string(), json!({"name": name, "databaseUsers": users}));
        self
    }

    fn call(&self, what: String) {
        self.calls.push(what);
    }
}

fn fmt_addrs(addrs: &[String]) -> String {
    format!("[{}]", addrs.join(","))
}

#[async_trait]
impl DatabaseServer for FakeDatabaseServer {
    async fn user_state(&self, name: &str) -> Result<Option<Value>, HandlerError> {
        Ok(self.users.lock().unwrap().get(name).cloned())
    }

    async fn database_state(&self, name: &str) -> Result<Option<Value>, HandlerError> {
        Ok(self.databases.lock().unwrap().get(name).cloned())
    }

    async fn create_user(
        &self,
        name: &str,
        _password_hash: &str,
        addrs: &[String],
    ) -> Result<(), HandlerError> {
        self.call(format!("create_user {name} {}", fmt_addrs(addrs)));
        self.users.lock().unwrap().insert(
            name.to_string(),
            json!({"name": name, "allowedIPAddresses": addrs, "databases": []}),
        );
        Ok(())
    }

    async fn set_password(
        &self,
        name: &str,
        _password_hash: &str,
        addrs: &[String],
    ) -> Result<(), HandlerError> {
        self.call(format!("set_password {name} {}", fmt_addrs(addrs)));
        Ok(())
    }

    async fn drop_user(&self, name: &str, addrs: &[String]) -> Result<(), HandlerError> {
        self.call(format!("drop_user {name} {}", fmt_addrs(addrs)));
        self.users.lock().unwrap().remove(name);
        Ok(())
    }

    async fn create_database(&self, name: &str) -> Result<(), HandlerError> {
        self.call(format!("create_database {name}"));
        self.databases
            .lock()
            .unwrap()
            .insert(name.to_string(), json!({"name": name, "databaseUsers": []}));
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<(), HandlerError> {
        self.call(format!("drop_database {name}"));
        self.databases.lock().unwrap().remove(name);
        Ok(())
    }

    async fn allow_database_access(
        &self,
        database: &str,
        user: &str,
        addrs: &[String],
    ) -> Result<(), HandlerError> {
        self.call(format!(
            "allow_database_access {database} {user} {}",
            fmt_addrs(addrs)
        ));
        Ok(())
    }

    async fn deny_database_access(
        &self,
        database: &str,
        user: &str,
        addrs: &[String],
    ) -> Result<(), HandlerError> {
        self.call(format!(
            "deny_database_access {database} {user} {}",
            fmt_addrs(addrs)
        ));
        Ok(())
    }
}
