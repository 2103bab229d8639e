// src/resource/graph.rs

//! Per-type dependency rules.
//!
//! `required_resources` answers "what has to be up to date before this
//! resource can be processed", `affected_resources` answers "what has to be
//! re-processed after it". Both consult the catalog and the local service
//! directory; neither recurses (that is [`super::sequence`]'s job).

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::catalog::{template_kind, template_resource_type};
use super::{Resource, ResourceCatalog, Scope, ServiceDirectory, to_lower_dashed};
use crate::errors::CatalogError;
use crate::task::Params;
use crate::task::params::{OVS, REQUIRED_FOR};

/// A `(resource type, resource)` pair produced by a graph rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRef {
    pub res_type: String,
    pub resource: Resource,
}

impl ResourceRef {
    pub fn new(res_type: impl Into<String>, resource: Resource) -> Self {
        Self {
            res_type: res_type.into(),
            resource,
        }
    }
}

/// Dependency rules bound to the collaborators they need.
#[derive(Clone)]
pub struct ResourceGraph {
    catalog: Arc<dyn ResourceCatalog>,
    services: Arc<dyn ServiceDirectory>,
}

impl ResourceGraph {
    pub fn new(catalog: Arc<dyn ResourceCatalog>, services: Arc<dyn ServiceDirectory>) -> Self {
        Self { catalog, services }
    }

    pub fn catalog(&self) -> &Arc<dyn ResourceCatalog> {
        &self.catalog
    }

    pub fn services(&self) -> &Arc<dyn ServiceDirectory> {
        &self.services
    }

    /// Resources that must be brought up to date before `resource`.
    ///
    /// Empty when `params.isolated` is set. Rule results are limited to
    /// switched-on resources; explicit `ovs.requiredResources` are appended
    /// as given.
    pub async fn required_resources(
        &self,
        res_type: &str,
        resource: &Resource,
        params: &Params,
    ) -> Result<Vec<ResourceRef>, CatalogError> {
        if params.is_isolated() {
            return Ok(Vec::new());
        }

        let mut required = Vec::new();
        match res_type {
            "website" => {
                debug!(resource = %resource, "website depends on unix-account and ssl-certificate");
                if let Some(account) = resource.child("unixAccount") {
                    required.push(ResourceRef::new("unix-account", account));
                }
                for domain in resource.children("domains") {
                    if let Some(cert) = domain.child("sslCertificate") {
                        required.push(ResourceRef::new("ssl-certificate", cert));
                    }
                }
            }
            "redirect" => {
                if let Some(cert) = resource
                    .child("domain")
                    .and_then(|d| d.child("sslCertificate"))
                {
                    debug!(resource = %resource, "redirect depends on ssl-certificate");
                    required.push(ResourceRef::new("ssl-certificate", cert));
                }
            }
            "service" => {
                if template_kind(resource).as_deref() == Some("HttpServer") {
                    debug!(resource = %resource, "http server depends on application servers");
                    for app in self.services.services_by_template_kind("ApplicationServer") {
                        required.push(ResourceRef::new("service", app));
                    }
                } else if let (Some(served), Some(service_id)) =
                    (template_resource_type(resource), resource.id())
                {
                    let served = to_lower_dashed(&served);
                    debug!(resource = %resource, served = %served, "service depends on its resources");
                    for r in self
                        .lenient_scope(&served, &Scope::Service(service_id.to_string()))
                        .await?
                    {
                        required.push(ResourceRef::new(served.clone(), r));
                    }
                }
            }
            "database" => {
                for user in resource.children("databaseUsers") {
                    required.push(ResourceRef::new("database-user", user));
                }
            }
            _ => {}
        }

        required.retain(|r| r.resource.is_switched_on());
        required.extend(explicit_edges(params, "requiredResources"));
        Ok(required)
    }

    /// Resources that must be re-processed after `resource`.
    ///
    /// The resource that caused this one (itself, or the one it is
    /// `requiredFor`) is never returned.
    pub async fn affected_resources(
        &self,
        res_type: &str,
        resource: &Resource,
        params: &Params,
    ) -> Result<Vec<ResourceRef>, CatalogError> {
        if params.is_isolated() {
            return Ok(Vec::new());
        }

        let mut affected = Vec::new();
        match (res_type, resource.id()) {
            ("database-user", Some(id)) => {
                for db in self
                    .lenient_scope("database", &Scope::field("databaseUserId", id))
                    .await?
                {
                    affected.push(ResourceRef::new("database", db));
                }
            }
            ("ssl-certificate", Some(id)) => {
                let domain = self
                    .lenient_scope("domain", &Scope::field("sslCertificateId", id))
                    .await?
                    .into_iter()
                    .next();
                if let Some(domain_id) = domain.as_ref().and_then(|d| d.id()) {
                    let by_domain = Scope::field("domainId", domain_id);
                    for bound_type in ["website", "redirect"] {
                        if let Some(r) = self
                            .lenient_scope(bound_type, &by_domain)
                            .await?
                            .into_iter()
                            .next()
                        {
                            affected.push(ResourceRef::new(bound_type, r));
                        }
                    }
                }
            }
            ("service", _) => {
                let serves_websites = template_resource_type(resource)
                    .is_some_and(|t| t.eq_ignore_ascii_case("WEBSITE"));
                if serves_websites {
                    if let Some(proxy) = self.services.http_proxy() {
                        affected.push(ResourceRef::new("service", proxy));
                    }
                }
            }
            _ => {}
        }

        affected.retain(|r| r.resource.is_switched_on());
        affected.extend(explicit_edges(params, "affectedResources"));

        let causer = causer_identity(resource, params);
        affected.retain(|r| r.resource.identity() != causer);
        Ok(affected)
    }

    /// Scoped lookup where "not found" means "nothing".
    async fn lenient_scope(
        &self,
        res_type: &str,
        scope: &Scope,
    ) -> Result<Vec<Resource>, CatalogError> {
        match self.catalog.fetch_by_type_and_scope(res_type, scope).await {
            Ok(found) => Ok(found),
            Err(CatalogError::NotFound(what)) => {
                debug!(res_type, %scope, %what, "no related resources");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}

/// Identity of the resource whose processing led here.
fn causer_identity<'a>(resource: &'a Resource, params: &'a Params) -> &'a str {
    params
        .get(REQUIRED_FOR)
        .and_then(|v| v.get("resourceId"))
        .and_then(Value::as_str)
        .unwrap_or_else(|| resource.identity())
}

/// `params.ovs.<key>`: extra edges, each tagged with a CamelCase `@type`.
fn explicit_edges(params: &Params, key: &str) -> Vec<ResourceRef> {
    let Some(items) = params.get(OVS).and_then(|o| o.get(key)).and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let res_type = to_lower_dashed(obj.get("@type")?.as_str()?);
            let mut body = obj.clone();
            body.remove("@type");
            Some(ResourceRef::new(res_type, Resource::new(Value::Object(body))))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn explicit_edges_strip_type_tag() {
        let params = Params::try_from(json!({
            "ovs": {"requiredResources": [
                {"@type": "SslCertificate", "id": "c9"},
                {"id": "no-type"}
            ]}
        }))
        .unwrap();

        let edges = explicit_edges(&params, "requiredResources");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].res_type, "ssl-certificate");
        assert_eq!(edges[0].resource.as_value(), &json!({"id": "c9"}));
        assert!(explicit_edges(&params, "affectedResources").is_empty());
    }

    #[test]
    fn causer_prefers_required_for() {
        let r = Resource::from(json!({"id": "db1"}));
        let mut p = Params::new();
        assert_eq!(causer_identity(&r, &p), "db1");
        p.insert(REQUIRED_FOR, json!({"resType": "website", "resourceId": "w1", "action": "update"}));
        assert_eq!(causer_identity(&r, &p), "w1");
    }
}
