use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::config::RelayConfig;
use crate::rules::{ModelMapping, ProviderNode, RoutingSnapshot};

/// Read interface to the external mapping/rule store. The core fetches one
/// point-in-time snapshot per request and never holds configuration across
/// requests, so the store may change freely between them.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn snapshot(&self, requested_model: &str) -> Option<RoutingSnapshot>;
}

/// In-memory store, seeded from the config file. `replace` swaps the whole
/// configuration; snapshots taken before the swap stay valid.
#[derive(Debug, Default)]
pub struct InMemoryMappingStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    mappings: HashMap<String, ModelMapping>,
    providers: HashMap<String, ProviderNode>,
}

impl InMemoryMappingStore {
    pub fn new(providers: Vec<ProviderNode>, mappings: Vec<ModelMapping>) -> Self {
        let store = Self::default();
        store.replace(providers, mappings);
        store
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.providers.clone(), config.models.clone())
    }

    pub fn replace(&self, providers: Vec<ProviderNode>, mappings: Vec<ModelMapping>) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.providers = providers
            .into_iter()
            .map(|node| (node.id.clone(), node))
            .collect();
        inner.mappings = mappings
            .into_iter()
            .map(|mapping| (mapping.requested_model.clone(), mapping))
            .collect();
    }
}

#[async_trait]
impl MappingStore for InMemoryMappingStore {
    async fn snapshot(&self, requested_model: &str) -> Option<RoutingSnapshot> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mapping = inner.mappings.get(requested_model)?.clone();
        let providers = mapping
            .rules
            .iter()
            .filter_map(|rule| inner.providers.get(&rule.provider_id))
            .map(|node| (node.id.clone(), node.clone()))
            .collect();
        Some(RoutingSnapshot { mapping, providers })
    }
}
