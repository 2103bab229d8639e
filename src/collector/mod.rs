// src/collector/mod.rs

//! Resource collectors read the live state of a resource on this host.
//!
//! They answer query tasks (`quota_report`, `malware_report`) and provide
//! the `op_resource` snapshot handlers diff against. Property reads go
//! through a [`PropertyCache`] owned by the registry.

pub mod cache;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

pub use cache::PropertyCache;

use crate::errors::CollectorError;
use crate::resource::Resource;

#[async_trait]
pub trait ResourceCollector: Send + Sync {
    async fn get_property(&self, resource: &Resource, property: &str)
    -> Result<Value, CollectorError>;

    /// Live state of the resource, `None` when it does not exist here.
    async fn op_resource(&self, _resource: &Resource) -> Result<Option<Value>, CollectorError> {
        Ok(None)
    }
}

pub struct CollectorRegistry {
    collectors: HashMap<String, Arc<dyn ResourceCollector>>,
    cache: PropertyCache,
}

impl CollectorRegistry {
    pub fn new(cache: PropertyCache) -> Self {
        Self {
            collectors: HashMap::new(),
            cache,
        }
    }

    pub fn register(&mut self, res_type: impl Into<String>, collector: Arc<dyn ResourceCollector>) {
        self.collectors.insert(res_type.into(), collector);
    }

    pub fn contains(&self, res_type: &str) -> bool {
        self.collectors.contains_key(res_type)
    }

    pub fn cache(&self) -> &PropertyCache {
        &self.cache
    }

    /// Read one property, served from cache when younger than `ttl`.
    pub async fn get_property(
        &self,
        res_type: &str,
        resource: &Resource,
        property: &str,
        ttl: Duration,
    ) -> Result<Value, CollectorError> {
        let collector = self
            .collectors
            .get(res_type)
            .ok_or_else(|| CollectorError::NotRegistered(res_type.to_string()))?;

        let key = (
            res_type.to_string(),
            resource.identity().to_string(),
            property.to_string(),
        );
        if let Some(hit) = self.cache.get(&key, ttl) {
            debug!(res_type, resource = %resource, property, "property served from cache");
            return Ok(hit);
        }

        let value = collector.get_property(resource, property).await?;
        self.cache.insert(key, value.clone(), ttl);
        Ok(value)
    }

    /// `None` for types without a collector.
    pub async fn op_resource(
        &self,
        res_type: &str,
        resource: &Resource,
    ) -> Result<Option<Value>, CollectorError> {
        match self.collectors.get(res_type) {
            Some(collector) => collector.op_resource(resource).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    struct Counting(AtomicUsize);

    #[async_trait]
    impl ResourceCollector for Counting {
        async fn get_property(
            &self,
            _resource: &Resource,
            property: &str,
        ) -> Result<Value, CollectorError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "property": property }))
        }
    }

    #[tokio::test]
    async fn cached_reads_skip_the_collector() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let mut registry = CollectorRegistry::new(PropertyCache::new(16));
        registry.register("unix-account", counting.clone());

        let r = Resource::from(json!({"id": "u1"}));
        let ttl = Duration::from_secs(299);
        registry.get_property("unix-account", &r, "quotaUsed", ttl).await.unwrap();
        registry.get_property("unix-account", &r, "quotaUsed", ttl).await.unwrap();
        registry.get_property("unix-account", &r, "quotaUsed", Duration::ZERO).await.unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 2);

        assert!(matches!(
            registry.get_property("mailbox", &r, "quotaUsed", ttl).await,
            Err(CollectorError::NotRegistered(_))
        ));
        assert_eq!(registry.op_resource("mailbox", &r).await.unwrap(), None);
    }
}
