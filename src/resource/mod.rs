// src/resource/mod.rs

//! Resources and the dependency graph between them.
//!
//! - [`catalog`] defines the external lookups (resource catalog, local
//!   service directory).
//! - [`graph`] knows, per resource type, what must be processed before and
//!   after a resource.
//! - [`sequence`] turns those rules into an ordered, de-duplicated list of
//!   handler invocations.

pub mod catalog;
pub mod graph;
pub mod sequence;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use catalog::{ResourceCatalog, Scope, ServiceDirectory};
pub use graph::{ResourceGraph, ResourceRef};
pub use sequence::{SequenceBuilder, SequenceEntry};

/// A managed hosting entity as delivered by the catalog.
///
/// The engine only reads a handful of well-known fields (`id`, `name`,
/// `switchedOn`, `quota`, ...); everything else is carried through to the
/// handlers untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(Value);

impl Resource {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn id(&self) -> Option<&str> {
        self.str_field("id")
    }

    pub fn name(&self) -> Option<&str> {
        self.str_field("name")
    }

    /// Something printable for logs and sequence keys: id, else name.
    pub fn identity(&self) -> &str {
        self.id().or_else(|| self.name()).unwrap_or("<anonymous>")
    }

    /// A resource without an explicit `switchedOn` flag counts as on.
    pub fn is_switched_on(&self) -> bool {
        self.0
            .get("switchedOn")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    pub fn has_zero_quota(&self) -> bool {
        self.0
            .get("quota")
            .and_then(Value::as_f64)
            .is_some_and(|q| q == 0.0)
    }

    /// Nested resource stored under `key`, if it is an object.
    pub fn child(&self, key: &str) -> Option<Resource> {
        match self.0.get(key) {
            Some(v @ Value::Object(_)) => Some(Resource(v.clone())),
            _ => None,
        }
    }

    /// Nested resources stored as an array under `key`.
    pub fn children(&self, key: &str) -> Vec<Resource> {
        self.0
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|v| v.is_object())
                    .cloned()
                    .map(Resource)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fan-out suffix: `<name>` or `<name>@<domain>` for resources that
    /// belong to a domain (mailboxes).
    pub fn fanout_suffix(&self) -> String {
        let name = self.name().unwrap_or_else(|| self.identity());
        match self.child("domain").as_ref().and_then(|d| d.name()) {
            Some(domain) => format!("{name}@{domain}"),
            None => name.to_string(),
        }
    }
}

impl From<Value> for Resource {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.identity()),
            None => f.write_str(self.identity()),
        }
    }
}

/// `SslCertificate` -> `ssl-certificate`, `WEBSITE` -> `website`,
/// `DATABASE_USER` -> `database-user`.
pub fn to_lower_dashed(name: &str) -> String {
    if name.chars().all(|c| !c.is_lowercase()) {
        return name.to_lowercase().replace('_', "-");
    }
    let mut out = String::with_capacity(name.len() + 4);
    for (idx, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if idx > 0 {
                out.push('-');
            }
            out.extend(ch.to_lowercase());
        } else if ch == '_' {
            out.push('-');
        } else {
            out.push(ch);
        }
    }
    out
}
