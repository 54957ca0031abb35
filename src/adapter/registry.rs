//! Registry mapping engine types to their registered adapter.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, instrument, warn};

use super::Connector;
use crate::domain::EngineType;
use crate::error::OrkestraError;

#[derive(Debug, Clone)]
pub struct AdapterHealth {
    pub engine_type: EngineType,
    pub healthy: bool,
}

#[derive(Debug, Clone)]
pub struct AdapterHealthReport {
    pub adapters: Vec<AdapterHealth>,
    pub overall_healthy: bool,
}

/// Keyed by [`EngineType`]; each engine type maps to at most one adapter.
pub struct AdapterRegistry {
    adapters: DashMap<EngineType, Arc<dyn Connector>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: DashMap::new(),
        }
    }

    #[instrument(skip(self, adapter), fields(engine_type = %engine_type))]
    pub fn register(&self, engine_type: EngineType, adapter: Arc<dyn Connector>) {
        if self.adapters.contains_key(&engine_type) {
            warn!(%engine_type, "replacing already-registered adapter");
        }
        info!(%engine_type, "registering adapter");
        self.adapters.insert(engine_type, adapter);
    }

    pub fn unregister(&self, engine_type: &EngineType) -> Option<Arc<dyn Connector>> {
        self.adapters.remove(engine_type).map(|(_, v)| v)
    }

    pub fn get(&self, engine_type: &EngineType) -> Option<Arc<dyn Connector>> {
        self.adapters.get(engine_type).map(|entry| entry.value().clone())
    }

    #[instrument(skip(self))]
    pub fn resolve(&self, engine_type: EngineType) -> Result<Arc<dyn Connector>, OrkestraError> {
        self.get(&engine_type)
            .ok_or_else(|| OrkestraError::no_adapter_registered(engine_type))
    }

    pub fn registered_engine_types(&self) -> Vec<EngineType> {
        self.adapters.iter().map(|e| *e.key()).collect()
    }

    pub async fn health_check_all(&self) -> AdapterHealthReport {
        let entries: Vec<(EngineType, Arc<dyn Connector>)> = self
            .adapters
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut adapters = Vec::with_capacity(entries.len());
        let mut overall_healthy = true;
        for (engine_type, adapter) in entries {
            let healthy = adapter.test_connection().await;
            overall_healthy &= healthy;
            adapters.push(AdapterHealth { engine_type, healthy });
        }
        AdapterHealthReport {
            adapters,
            overall_healthy,
        }
    }
}
