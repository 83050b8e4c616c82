//! External-service integrations
//!
//! Uniform adapter contract for third-party project-management services, the static
//! integration catalog and the registry that selects an adapter by service identifier.

pub mod metadata;
pub mod registry;
pub mod service;

pub use metadata::{AuthType, CatalogError, Integration, IntegrationPipe, load_catalog};
pub use registry::{RegistryError, ServiceFactory, ServiceRegistry};
pub use service::{Service, ServiceError};
