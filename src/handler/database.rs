// src/handler/database.rs

//! Reference handlers for `database-user` and `database`.
//!
//! They talk to a [`DatabaseServer`] (the operational-service adapter for
//! the local SQL server) and diff the desired resource against the live
//! state reported by the matching collectors.
//!
//! Deleting a user revokes its grants on every database it is bound to and
//! then drops it. The `database` update that follows as a side effect of
//! that deletion leaves the deleted user alone.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{HandlerContext, HandlerRegistry, ResourceHandler};
use crate::collector::{CollectorRegistry, ResourceCollector};
use crate::errors::{CollectorError, HandlerError};
use crate::resource::Resource;
use crate::task::params::CAUSED_BY;

/// Operational-service adapter for a SQL server.
///
/// `user_state` returns `{name, allowedIPAddresses, databases: [..]}` and
/// `database_state` returns `{name, databaseUsers: [{name,
/// allowedIPAddresses}]}`, or `None` when the object does not exist.
#[async_trait]
pub trait DatabaseServer: Send + Sync {
    async fn user_state(&self, name: &str) -> Result<Option<Value>, HandlerError>;
    async fn database_state(&self, name: &str) -> Result<Option<Value>, HandlerError>;

    async fn create_user(
        &self,
        name: &str,
        password_hash: &str,
        addrs: &[String],
    ) -> Result<(), HandlerError>;
    async fn set_password(
        &self,
        name: &str,
        password_hash: &str,
        addrs: &[String],
    ) -> Result<(), HandlerError>;
    async fn drop_user(&self, name: &str, addrs: &[String]) -> Result<(), HandlerError>;

    async fn create_database(&self, name: &str) -> Result<(), HandlerError>;
    async fn drop_database(&self, name: &str) -> Result<(), HandlerError>;
    async fn allow_database_access(
        &self,
        database: &str,
        user: &str,
        addrs: &[String],
    ) -> Result<(), HandlerError>;
    async fn deny_database_access(
        &self,
        database: &str,
        user: &str,
        addrs: &[String],
    ) -> Result<(), HandlerError>;
}

/// Wire the database handlers and collectors into the registries.
pub fn register(
    handlers: &mut HandlerRegistry,
    collectors: &mut CollectorRegistry,
    server: Arc<dyn DatabaseServer>,
) {
    let s = Arc::clone(&server);
    handlers.register("database-user", move |ctx| {
        Ok(Box::new(DatabaseUserHandler::new(ctx, Arc::clone(&s))?) as Box<dyn ResourceHandler>)
    });
    let s = Arc::clone(&server);
    handlers.register("database", move |ctx| {
        Ok(Box::new(DatabaseHandler::new(ctx, Arc::clone(&s))?) as Box<dyn ResourceHandler>)
    });
    collectors.register(
        "database-user",
        Arc::new(DatabaseCollector::users(Arc::clone(&server))),
    );
    collectors.register("database", Arc::new(DatabaseCollector::databases(server)));
}

fn required_name(resource: &Resource) -> Result<String, HandlerError> {
    resource
        .name()
        .map(str::to_string)
        .ok_or_else(|| HandlerError::Validation(format!("{resource} has no name")))
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn addrs_of(value: &Value) -> BTreeSet<String> {
    string_list(value.get("allowedIPAddresses")).into_iter().collect()
}

fn to_vec(set: &BTreeSet<String>) -> Vec<String> {
    set.iter().cloned().collect()
}

pub struct DatabaseUserHandler {
    ctx: HandlerContext,
    name: String,
    server: Arc<dyn DatabaseServer>,
}

impl DatabaseUserHandler {
    pub fn new(ctx: HandlerContext, server: Arc<dyn DatabaseServer>) -> Result<Self, HandlerError> {
        let name = required_name(&ctx.resource)?;
        Ok(Self { ctx, name, server })
    }

    fn password_hash(&self) -> &str {
        self.ctx.resource.str_field("passwordHash").unwrap_or_default()
    }

    fn staging_addrs(&self) -> BTreeSet<String> {
        addrs_of(self.ctx.resource.as_value())
    }

    async fn create_locked(&self) -> Result<(), HandlerError> {
        let addrs = to_vec(&self.staging_addrs());
        info!(user = %self.name, ?addrs, "creating database user");
        self.server
            .create_user(&self.name, self.password_hash(), &addrs)
            .await
    }

    async fn update_locked(&self, current: &Value) -> Result<(), HandlerError> {
        let current = addrs_of(current);
        let staging = self.staging_addrs();

        let removed: BTreeSet<_> = current.difference(&staging).cloned().collect();
        let added: BTreeSet<_> = staging.difference(&current).cloned().collect();
        let kept: BTreeSet<_> = current.intersection(&staging).cloned().collect();

        info!(user = %self.name, "updating database user");
        if !removed.is_empty() {
            self.server.drop_user(&self.name, &to_vec(&removed)).await?;
        }
        if !added.is_empty() {
            self.server
                .create_user(&self.name, self.password_hash(), &to_vec(&added))
                .await?;
        }
        if !kept.is_empty() {
            self.server
                .set_password(&self.name, self.password_hash(), &to_vec(&kept))
                .await?;
        }
        Ok(())
    }

    async fn delete_locked(&self) -> Result<(), HandlerError> {
        let Some(current) = self.ctx.op_resource.as_ref() else {
            warn!(user = %self.name, "database user not found, nothing to drop");
            return Ok(());
        };
        let addrs = to_vec(&addrs_of(current));
        for database in string_list(current.get("databases")) {
            info!(user = %self.name, database = %database, "revoking database access");
            self.server
                .deny_database_access(&database, &self.name, &addrs)
                .await?;
        }
        info!(user = %self.name, "dropping database user");
        self.server.drop_user(&self.name, &addrs).await
    }
}

#[async_trait]
impl ResourceHandler for DatabaseUserHandler {
    fn resource(&self) -> &Resource {
        &self.ctx.resource
    }

    async fn create(&self) -> Result<(), HandlerError> {
        let _guard = self.ctx.lock.acquire().await;
        match self.ctx.op_resource.as_ref() {
            None => self.create_locked().await,
            Some(current) => {
                warn!(user = %self.name, "database user already exists, updating");
                self.update_locked(current).await
            }
        }
    }

    async fn update(&self) -> Result<(), HandlerError> {
        let _guard = self.ctx.lock.acquire().await;
        if !self.ctx.resource.is_switched_on() {
            info!(user = %self.name, "database user is switched off, deleting");
            return self.delete_locked().await;
        }
        match self.ctx.op_resource.as_ref() {
            Some(current) => self.update_locked(current).await,
            None => {
                warn!(user = %self.name, "database user not found, creating");
                self.create_locked().await
            }
        }
    }

    async fn delete(&self) -> Result<(), HandlerError> {
        let _guard = self.ctx.lock.acquire().await;
        self.delete_locked().await
    }
}

pub struct DatabaseHandler {
    ctx: HandlerContext,
    name: String,
    server: Arc<dyn DatabaseServer>,
}

impl DatabaseHandler {
    pub fn new(ctx: HandlerContext, server: Arc<dyn DatabaseServer>) -> Result<Self, HandlerError> {
        let name = required_name(&ctx.resource)?;
        Ok(Self { ctx, name, server })
    }

    /// Name of the user whose deletion caused this update, if any.
    fn deleted_user(&self) -> Option<String> {
        let marker = self.ctx.params.get(CAUSED_BY)?;
        if marker.get("action").and_then(Value::as_str) != Some("delete")
            || marker.get("resType").and_then(Value::as_str) != Some("database-user")
        {
            return None;
        }
        let id = marker.get("resourceId").and_then(Value::as_str)?;
        let name = self
            .ctx
            .resource
            .children("databaseUsers")
            .into_iter()
            .find(|u| u.id() == Some(id))
            .and_then(|u| u.name().map(str::to_string));
        Some(name.unwrap_or_else(|| id.to_string()))
    }

    async fn sync_grants(&self, current: &Value) -> Result<(), HandlerError> {
        let deleted = self.deleted_user();
        let staging: Vec<Resource> = self
            .ctx
            .resource
            .children("databaseUsers")
            .into_iter()
            .filter(|u| u.is_switched_on() && u.name().map(str::to_string) != deleted)
            .collect();
        let current_users: Vec<Value> = current
            .get("databaseUsers")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let current_names: BTreeSet<&str> = current_users
            .iter()
            .filter_map(|u| u.get("name").and_then(Value::as_str))
            .collect();
        let staging_names: BTreeSet<&str> = staging.iter().filter_map(Resource::name).collect();

        for user in &staging {
            let Some(name) = user.name() else { continue };
            if !current_names.contains(name) {
                let addrs = to_vec(&addrs_of(user.as_value()));
                info!(database = %self.name, user = name, "granting database access");
                self.server
                    .allow_database_access(&self.name, name, &addrs)
                    .await?;
            }
        }

        for user in &current_users {
            let Some(name) = user.get("name").and_then(Value::as_str) else {
                continue;
            };
            if staging_names.contains(name) || deleted.as_deref() == Some(name) {
                continue;
            }
            let addrs = to_vec(&addrs_of(user));
            info!(database = %self.name, user = name, "revoking database access");
            self.server
                .deny_database_access(&self.name, name, &addrs)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceHandler for DatabaseHandler {
    fn resource(&self) -> &Resource {
        &self.ctx.resource
    }

    async fn create(&self) -> Result<(), HandlerError> {
        let _guard = self.ctx.lock.acquire().await;
        match self.ctx.op_resource.as_ref() {
            Some(current) => self.sync_grants(current).await,
            None => {
                info!(database = %self.name, "creating database");
                self.server.create_database(&self.name).await?;
                self.sync_grants(&json!({ "databaseUsers": [] })).await
            }
        }
    }

    async fn update(&self) -> Result<(), HandlerError> {
        let _guard = self.ctx.lock.acquire().await;
        match self.ctx.op_resource.as_ref() {
            Some(current) => self.sync_grants(current).await,
            None => {
                warn!(database = %self.name, "database not found, creating");
                self.server.create_database(&self.name).await?;
                self.sync_grants(&json!({ "databaseUsers": [] })).await
            }
        }
    }

    async fn delete(&self) -> Result<(), HandlerError> {
        let _guard = self.ctx.lock.acquire().await;
        let Some(current) = self.ctx.op_resource.as_ref() else {
            warn!(database = %self.name, "database not found, nothing to drop");
            return Ok(());
        };
        for user in current
            .get("databaseUsers")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(name) = user.get("name").and_then(Value::as_str) {
                self.server
                    .deny_database_access(&self.name, name, &to_vec(&addrs_of(user)))
                    .await?;
            }
        }
        info!(database = %self.name, "dropping database");
        self.server.drop_database(&self.name).await
    }
}

enum CollectedKind {
    Users,
    Databases,
}

/// Live state of users and databases, read from the server.
pub struct DatabaseCollector {
    kind: CollectedKind,
    server: Arc<dyn DatabaseServer>,
}

impl DatabaseCollector {
    pub fn users(server: Arc<dyn DatabaseServer>) -> Self {
        Self {
            kind: CollectedKind::Users,
            server,
        }
    }

    pub fn databases(server: Arc<dyn DatabaseServer>) -> Self {
        Self {
            kind: CollectedKind::Databases,
            server,
        }
    }

    async fn state(&self, resource: &Resource) -> Result<Option<Value>, CollectorError> {
        let failed = |property: &str, e: HandlerError| CollectorError::Failed {
            property: property.to_string(),
            reason: e.to_string(),
        };
        let Some(name) = resource.name() else {
            return Ok(None);
        };
        match self.kind {
            CollectedKind::Users => self
                .server
                .user_state(name)
                .await
                .map_err(|e| failed("user", e)),
            CollectedKind::Databases => self
                .server
                .database_state(name)
                .await
                .map_err(|e| failed("database", e)),
        }
    }
}

#[async_trait]
impl ResourceCollector for DatabaseCollector {
    async fn get_property(
        &self,
        resource: &Resource,
        property: &str,
    ) -> Result<Value, CollectorError> {
        let state = self.state(resource).await?.unwrap_or(Value::Null);
        state
            .get(property)
            .cloned()
            .ok_or_else(|| CollectorError::UnsupportedProperty {
                res_type: match self.kind {
                    CollectedKind::Users => "database-user".to_string(),
                    CollectedKind::Databases => "database".to_string(),
                },
                property: property.to_string(),
            })
    }

    async fn op_resource(&self, resource: &Resource) -> Result<Option<Value>, CollectorError> {
        self.state(resource).await
    }
}
