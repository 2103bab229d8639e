// src/resource/catalog.rs

//! External lookups the engine depends on.
//!
//! Both traits are implemented outside this crate (an HTTP client against
//! the platform API, a constructor that knows the local services). Tests
//! use the in-memory fakes from `taskexec-test-utils`.

use std::fmt;

use async_trait::async_trait;

use super::Resource;
use crate::errors::CatalogError;

/// Narrowing applied to a `fetch_by_type_and_scope` lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Resources hosted on a server (`serverId=`).
    Server(String),
    /// Resources served by a service (`serviceId=`).
    Service(String),
    /// Resources whose field `name` equals `value`, e.g.
    /// `sslCertificateId=<id>` or `databaseUserId=<id>`.
    Field { name: String, value: String },
}

impl Scope {
    pub fn field(name: impl Into<String>, value: impl Into<String>) -> Self {
        Scope::Field {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Query-string form as the platform API spells it.
    pub fn as_filter(&self) -> (String, String) {
        match self {
            Scope::Server(id) => ("serverId".to_string(), id.clone()),
            Scope::Service(id) => ("serviceId".to_string(), id.clone()),
            Scope::Field { name, value } => (name.clone(), value.clone()),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (k, v) = self.as_filter();
        write!(f, "{k}={v}")
    }
}

/// Client for the platform's resource catalog.
///
/// `NotFound` must be reported distinctly from a transport failure: the
/// former means "nothing to do", the latter is retried.
#[async_trait]
pub trait ResourceCatalog: Send + Sync {
    async fn fetch_by_reference(&self, reference: &str) -> Result<Resource, CatalogError>;

    async fn fetch_by_type_and_scope(
        &self,
        res_type: &str,
        scope: &Scope,
    ) -> Result<Vec<Resource>, CatalogError>;
}

/// Knowledge about the operational services running on this host.
pub trait ServiceDirectory: Send + Sync {
    /// Every service resource known to run locally.
    fn local_services(&self) -> Vec<Resource>;

    /// Local services whose template kind (`template.@type`) matches,
    /// e.g. `ApplicationServer`.
    fn services_by_template_kind(&self, kind: &str) -> Vec<Resource> {
        self.local_services()
            .into_iter()
            .filter(|s| template_kind(s).as_deref() == Some(kind))
            .collect()
    }

    /// Local services whose template serves `res_type`
    /// (`template.resourceType`, compared case-insensitively).
    fn services_by_resource_type(&self, res_type: &str) -> Vec<Resource> {
        self.local_services()
            .into_iter()
            .filter(|s| {
                template_resource_type(s)
                    .is_some_and(|t| super::to_lower_dashed(&t) == res_type)
            })
            .collect()
    }

    /// The front-end HTTP proxy, if this host runs one.
    fn http_proxy(&self) -> Option<Resource> {
        self.services_by_template_kind("HttpServer").into_iter().next()
    }
}

/// Catalog for a host with no catalog connection: nothing is ever found.
pub struct OfflineCatalog;

#[async_trait]
impl ResourceCatalog for OfflineCatalog {
    async fn fetch_by_reference(&self, reference: &str) -> Result<Resource, CatalogError> {
        Err(CatalogError::NotFound(reference.to_string()))
    }

    async fn fetch_by_type_and_scope(
        &self,
        res_type: &str,
        scope: &Scope,
    ) -> Result<Vec<Resource>, CatalogError> {
        Err(CatalogError::NotFound(format!("{res_type} ({scope})")))
    }
}

/// A host that knows of no local services.
pub struct NoServices;

impl ServiceDirectory for NoServices {
    fn local_services(&self) -> Vec<Resource> {
        Vec::new()
    }
}

/// `template.@type` of a service resource.
pub fn template_kind(service: &Resource) -> Option<String> {
    service
        .child("template")
        .and_then(|t| t.str_field("@type").map(str::to_string))
}

/// `template.resourceType` of a service resource, e.g. `WEBSITE`.
pub fn template_resource_type(service: &Resource) -> Option<String> {
    service
        .child("template")
        .and_then(|t| t.str_field("resourceType").map(str::to_string))
}
