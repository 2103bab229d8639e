// src/handler/registry.rs

//! Static table from resource type to handler factory.
//!
//! Built once at startup. Every type gets exactly one [`HandlerLock`], so
//! all handler instances of that type serialize against each other while
//! handlers of different types run freely.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::{HandlerContext, HandlerLock, ResourceHandler};
use crate::errors::{HandlerError, ResolutionError};
use crate::resource::Resource;
use crate::task::Params;

pub type HandlerFactory =
    Arc<dyn Fn(HandlerContext) -> Result<Box<dyn ResourceHandler>, HandlerError> + Send + Sync>;

struct Registration {
    factory: HandlerFactory,
    lock: HandlerLock,
}

#[derive(Default)]
pub struct HandlerRegistry {
    types: BTreeMap<String, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `res_type`.
    pub fn register<F>(&mut self, res_type: impl Into<String>, factory: F)
    where
        F: Fn(HandlerContext) -> Result<Box<dyn ResourceHandler>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let res_type = res_type.into();
        if self.types.contains_key(&res_type) {
            warn!(res_type = %res_type, "handler already registered, replacing");
        }
        debug!(res_type = %res_type, "registering resource handler");
        self.types.insert(
            res_type,
            Registration {
                factory: Arc::new(factory),
                lock: HandlerLock::new(),
            },
        );
    }

    pub fn contains(&self, res_type: &str) -> bool {
        self.types.contains_key(res_type)
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn lock_for(&self, res_type: &str) -> Option<&HandlerLock> {
        self.types.get(res_type).map(|r| &r.lock)
    }

    /// Build a handler for one sequence entry.
    pub fn instantiate(
        &self,
        res_type: &str,
        resource: Resource,
        params: Params,
        op_resource: Option<Value>,
    ) -> Result<Box<dyn ResourceHandler>, ResolutionError> {
        let registration = self
            .types
            .get(res_type)
            .ok_or_else(|| ResolutionError::HandlerNotFound(res_type.to_string()))?;

        let ctx = HandlerContext {
            res_type: res_type.to_string(),
            resource,
            params,
            op_resource,
            lock: registration.lock.clone(),
        };
        (registration.factory)(ctx).map_err(|e| ResolutionError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    struct Noop(Resource, HandlerLock);

    #[async_trait]
    impl ResourceHandler for Noop {
        fn resource(&self) -> &Resource {
            &self.0
        }
        async fn create(&self) -> Result<(), HandlerError> {
            Ok(())
        }
        async fn update(&self) -> Result<(), HandlerError> {
            let _guard = self.1.acquire().await;
            Ok(())
        }
        async fn delete(&self) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn one_lock_per_type() {
        let mut registry = HandlerRegistry::new();
        for t in ["website", "redirect"] {
            registry.register(t, |ctx: HandlerContext| {
                Ok(Box::new(Noop(ctx.resource, ctx.lock)) as Box<dyn ResourceHandler>)
            });
        }

        let r = Resource::from(json!({"id": "w1"}));
        let a = registry.instantiate("website", r.clone(), Params::new(), None).unwrap();
        a.update().await.unwrap();

        let web = registry.lock_for("website").unwrap();
        let redirect = registry.lock_for("redirect").unwrap();
        assert!(web.same_as(&registry.lock_for("website").unwrap().clone()));
        assert!(!web.same_as(redirect));

        let err = registry
            .instantiate("mailbox", r, Params::new(), None)
            .err()
            .unwrap();
        assert!(matches!(err, ResolutionError::HandlerNotFound(t) if t == "mailbox"));
    }
}
