// src/handler/mod.rs

//! Resource handlers: the components that actually create, update and
//! delete one resource type.
//!
//! Concrete handlers live outside the engine except for the reference
//! database pair in [`database`]. The engine only sees the
//! [`ResourceHandler`] trait and looks factories up in the
//! [`HandlerRegistry`].

pub mod database;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

pub use registry::{HandlerFactory, HandlerRegistry};

use crate::errors::HandlerError;
use crate::resource::Resource;
use crate::task::{Action, Params};

/// Advisory lock shared by every handler instance of one resource type.
///
/// Handlers take it for the duration of a create/update/delete before
/// touching shared on-disk or service state.
#[derive(Debug, Clone, Default)]
pub struct HandlerLock(Arc<Mutex<()>>);

impl HandlerLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.0.lock().await
    }

    /// Whether both handles guard the same resource type.
    pub fn same_as(&self, other: &HandlerLock) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Everything a handler factory gets to build one handler instance.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub res_type: String,
    /// Desired state, from the catalog.
    pub resource: Resource,
    pub params: Params,
    /// Actual state as currently found on the host, if any.
    pub op_resource: Option<Value>,
    pub lock: HandlerLock,
}

#[async_trait]
pub trait ResourceHandler: Send + Sync {
    fn resource(&self) -> &Resource;

    async fn create(&self) -> Result<(), HandlerError>;

    async fn update(&self) -> Result<(), HandlerError>;

    async fn delete(&self) -> Result<(), HandlerError>;
}

/// Call the handler method named by `action`.
pub async fn invoke(handler: &dyn ResourceHandler, action: Action) -> Result<(), HandlerError> {
    match action {
        Action::Create => handler.create().await,
        Action::Update => handler.update().await,
        Action::Delete => handler.delete().await,
        other => Err(HandlerError::Validation(format!(
            "'{other}' is not a handler method"
        ))),
    }
}
