//! Inventory store clients.
//!
//! The inventory is the single source of truth for the status, metadata and
//! relationships of every tracked resource. Each entity type lives in its own
//! [`Collection`]; an [`Inventory`] bundles one collection per type. An
//! in-memory implementation is provided for testing and an HTTP client for
//! the remote store.

mod http;
mod memory;

pub use http::HttpCollection;
pub use memory::MemoryCollection;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::config::EndpointConfig;
use crate::context::CallerContext;
use crate::error::{FactoryError, FactoryResult};
use crate::model::{
    ApiVersion, Component, Entity, Group, Implementation, ImplementationVersion, Library,
    LibraryApiVersion, Pipeline, SourceRepository,
};
use crate::types::ResourceId;

/// Filter criteria for listing entities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Filter by owning resource.
    pub owner: Option<ResourceId>,
    /// Filter by name.
    pub name: Option<String>,
    /// Filter by path.
    pub path: Option<String>,
}

impl Filter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            owner: None,
            name: None,
            path: None,
        }
    }

    /// Filter by owner.
    #[must_use]
    pub fn with_owner(mut self, owner: ResourceId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Filter by name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Filter by path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// True if `entity` satisfies every criterion.
    pub fn matches<E: Entity>(&self, entity: &E) -> bool {
        if let Some(ref owner) = self.owner {
            if entity.owner() != Some(owner) {
                return false;
            }
        }
        if let Some(ref name) = self.name {
            if entity.name() != name {
                return false;
            }
        }
        if let Some(ref path) = self.path {
            if entity.path() != Some(path.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Storage for one entity type.
#[async_trait]
pub trait Collection<E: Entity>: Send + Sync {
    /// Register a new entity. The store assigns its identity.
    ///
    /// Returns the stored entity.
    async fn insert(&self, ctx: &CallerContext, entity: E) -> FactoryResult<E>;

    /// Get an entity by ID.
    ///
    /// Returns `None` if the entity does not exist.
    async fn get(&self, ctx: &CallerContext, id: &ResourceId) -> FactoryResult<Option<E>>;

    /// List entities matching the filter, oldest first.
    async fn list(&self, ctx: &CallerContext, filter: &Filter) -> FactoryResult<Vec<E>>;

    /// Apply a partial update and return the updated entity.
    async fn patch(&self, ctx: &CallerContext, id: &ResourceId, patch: &E::Patch)
        -> FactoryResult<E>;

    /// Delete an entity record.
    async fn delete(&self, ctx: &CallerContext, id: &ResourceId) -> FactoryResult<()>;
}

/// One collection per entity type.
#[derive(Clone)]
pub struct Inventory {
    /// Groups.
    pub groups: Arc<dyn Collection<Group>>,
    /// Components.
    pub components: Arc<dyn Collection<Component>>,
    /// Libraries.
    pub libraries: Arc<dyn Collection<Library>>,
    /// Source repositories.
    pub repositories: Arc<dyn Collection<SourceRepository>>,
    /// Pipelines.
    pub pipelines: Arc<dyn Collection<Pipeline>>,
    /// Implementations.
    pub implementations: Arc<dyn Collection<Implementation>>,
    /// Implementation versions.
    pub implementation_versions: Arc<dyn Collection<ImplementationVersion>>,
    /// API versions.
    pub api_versions: Arc<dyn Collection<ApiVersion>>,
    /// Library API versions.
    pub library_api_versions: Arc<dyn Collection<LibraryApiVersion>>,
}

impl Inventory {
    /// In-memory inventory.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            groups: Arc::new(MemoryCollection::new()),
            components: Arc::new(MemoryCollection::new()),
            libraries: Arc::new(MemoryCollection::new()),
            repositories: Arc::new(MemoryCollection::new()),
            pipelines: Arc::new(MemoryCollection::new()),
            implementations: Arc::new(MemoryCollection::new()),
            implementation_versions: Arc::new(MemoryCollection::new()),
            api_versions: Arc::new(MemoryCollection::new()),
            library_api_versions: Arc::new(MemoryCollection::new()),
        }
    }

    /// Inventory backed by the remote store at `config.url`.
    pub fn http(config: &EndpointConfig) -> FactoryResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(FactoryError::Http)?;
        let base_url = config.url.as_str();

        Ok(Self {
            groups: Arc::new(HttpCollection::new(client.clone(), base_url)),
            components: Arc::new(HttpCollection::new(client.clone(), base_url)),
            libraries: Arc::new(HttpCollection::new(client.clone(), base_url)),
            repositories: Arc::new(HttpCollection::new(client.clone(), base_url)),
            pipelines: Arc::new(HttpCollection::new(client.clone(), base_url)),
            implementations: Arc::new(HttpCollection::new(client.clone(), base_url)),
            implementation_versions: Arc::new(HttpCollection::new(client.clone(), base_url)),
            api_versions: Arc::new(HttpCollection::new(client.clone(), base_url)),
            library_api_versions: Arc::new(HttpCollection::new(client, base_url)),
        })
    }
}

impl std::fmt::Debug for Inventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inventory").finish_non_exhaustive()
    }
}
