// src/task/params.rs

//! The open key/value bag carried by every task.
//!
//! Keys follow the wire names used by the rest of the platform
//! (camelCase); the accessors below cover the ones the engine itself
//! reads or writes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::resource::Resource;

pub const RESOURCE: &str = "resource";
pub const OBJ_REF: &str = "objRef";
pub const PROVIDER: &str = "provider";
pub const FAILCOUNT: &str = "failcount";
pub const MAX_RETRIES: &str = "maxRetries";
pub const ISOLATED: &str = "isolated";
pub const STARTED: &str = "started";
pub const LAST_EXCEPTION: &str = "last_exception";
pub const DATA: &str = "data";
pub const INTERVAL: &str = "interval";
pub const OLD_SERVER_NAME: &str = "oldServerName";
pub const EXEC_TYPE: &str = "execType";
pub const REQUIRED_FOR: &str = "requiredFor";
pub const CAUSED_BY: &str = "causedBy";
pub const PARAMS_FOR_REQUIRED: &str = "paramsForRequiredResources";
pub const PARAMS_FOR_AFFECTED: &str = "paramsForAffectedResources";
pub const OVS: &str = "ovs";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(Map<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Overlay every key of `other` onto `self`.
    pub fn merge(&mut self, other: &Params) {
        for (k, v) in other.0.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Overlay a JSON object (e.g. `paramsForRequiredResources`).
    /// Non-object values are ignored.
    pub fn merge_value(&mut self, value: Option<&Value>) {
        if let Some(Value::Object(map)) = value {
            for (k, v) in map.iter() {
                self.0.insert(k.clone(), v.clone());
            }
        }
    }

    pub fn bool_flag(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Null) | None => false,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn failcount(&self) -> u32 {
        self.u64(FAILCOUNT)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }

    pub fn set_failcount(&mut self, failcount: u32) {
        self.insert(FAILCOUNT, failcount);
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.u64(MAX_RETRIES).and_then(|n| u32::try_from(n).ok())
    }

    pub fn is_isolated(&self) -> bool {
        self.bool_flag(ISOLATED)
    }

    /// Rename-class operations need the long-running command pool.
    pub fn needs_extended_timeout(&self) -> bool {
        self.contains(OLD_SERVER_NAME)
    }

    pub fn is_parallel(&self) -> bool {
        self.str(EXEC_TYPE) == Some("parallel")
    }

    pub fn resource(&self) -> Option<Resource> {
        match self.0.get(RESOURCE) {
            Some(Value::Null) | None => None,
            Some(v) => Some(Resource::from(v.clone())),
        }
    }

    pub fn set_resource(&mut self, resource: &Resource) {
        self.insert(RESOURCE, resource.as_value().clone());
    }

    pub fn obj_ref(&self) -> Option<&str> {
        self.str(OBJ_REF)
    }

    /// Lookup into the nested `ovs` object.
    pub fn ovs(&self, key: &str) -> Option<&Value> {
        self.0.get(OVS).and_then(|ovs| ovs.get(key))
    }

    pub fn set_last_exception(&mut self, message: &str, class: &str) {
        self.insert(
            LAST_EXCEPTION,
            serde_json::json!({ "message": message, "class": class }),
        );
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Params {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(format!("params must be a JSON object, got {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn well_known_accessors() {
        let mut p = Params::try_from(json!({
            "failcount": 3,
            "isolated": true,
            "execType": "parallel",
            "ovs": {"resource": {"id": "r1"}},
            "resource": null
        }))
        .unwrap();

        assert_eq!(p.failcount(), 3);
        assert!(p.is_isolated());
        assert!(p.is_parallel());
        assert!(p.resource().is_none());
        assert_eq!(p.ovs("resource").unwrap()["id"], "r1");

        p.set_failcount(4);
        assert_eq!(p.failcount(), 4);
        p.set_last_exception("boom", "ResourceProcessingError");
        assert_eq!(p.get(LAST_EXCEPTION).unwrap()["class"], "ResourceProcessingError");
    }

    #[test]
    fn merge_overlays_keys() {
        let mut a = Params::try_from(json!({"a": 1, "b": 1})).unwrap();
        a.merge_value(Some(&json!({"b": 2, "c": 3})));
        a.merge_value(Some(&json!("not an object")));
        assert_eq!(a.get("b"), Some(&json!(2)));
        assert_eq!(a.get("c"), Some(&json!(3)));
        assert!(Params::try_from(json!([1, 2])).is_err());
    }
}
