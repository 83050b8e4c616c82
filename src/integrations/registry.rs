//! Service registry
//!
//! In-memory registry of adapter factories and integration descriptors, plus the
//! auth-type index learned from the catalog at boot.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::integrations::{AuthType, Integration, Service};

/// Builds a fresh adapter instance for one stage of a run.
pub type ServiceFactory = Arc<dyn Fn() -> Box<dyn Service> + Send + Sync>;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("integration '{id}' not found")]
    IntegrationNotFound { id: String },
    #[error("no adapter registered for service '{id}'")]
    AdapterNotFound { id: String },
}

/// Registry that stores adapter factories and integration metadata
pub struct ServiceRegistry {
    factories: HashMap<String, ServiceFactory>,
    integrations: BTreeMap<String, Integration>,
    auth_types: RwLock<HashMap<String, AuthType>>,
}

impl ServiceRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            integrations: BTreeMap::new(),
            auth_types: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry seeded with a catalog and learn its auth types
    pub fn with_catalog(catalog: Vec<Integration>) -> Self {
        let mut registry = Self::new();
        for integration in catalog {
            registry.add_integration(integration);
        }
        registry.learn_auth_types();
        registry
    }

    pub fn add_integration(&mut self, integration: Integration) {
        self.integrations.insert(integration.id.clone(), integration);
    }

    /// Register the adapter factory for a service
    pub fn register(&mut self, service_id: impl Into<String>, factory: ServiceFactory) {
        let service_id = service_id.into();
        if !self.integrations.contains_key(&service_id) {
            warn!(service_id = %service_id, "Registering adapter without integration descriptor");
        }
        self.factories.insert(service_id, factory);
    }

    /// Rebuild the service -> auth type index from the registered integrations
    pub fn learn_auth_types(&self) {
        let mut index = self
            .auth_types
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        index.clear();
        for integration in self.integrations.values() {
            index.insert(integration.id.clone(), integration.auth_type);
        }
        debug!(count = index.len(), "Learned integration auth types");
    }

    pub fn auth_type(&self, service_id: &str) -> Option<AuthType> {
        self.auth_types
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(service_id)
            .copied()
    }

    /// Build a new adapter instance for a service
    pub fn create(&self, service_id: &str) -> Result<Box<dyn Service>, RegistryError> {
        self.factories
            .get(service_id)
            .map(|factory| factory())
            .ok_or_else(|| RegistryError::AdapterNotFound {
                id: service_id.to_string(),
            })
    }

    pub fn has_adapter(&self, service_id: &str) -> bool {
        self.factories.contains_key(service_id)
    }

    pub fn integration(&self, service_id: &str) -> Result<&Integration, RegistryError> {
        self.integrations
            .get(service_id)
            .ok_or_else(|| RegistryError::IntegrationNotFound {
                id: service_id.to_string(),
            })
    }

    /// All integrations, sorted by id for stable ordering
    pub fn integrations(&self) -> impl Iterator<Item = &Integration> {
        self.integrations.values()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
