//! Wiring of backends and orchestrators.

use std::sync::Arc;

use tracing::info;

use crate::api_version::{ApiVersionOrchestrator, LibraryApiVersionOrchestrator};
use crate::backend::{
    CodeGenerator, ContinuousIntegration, HttpCodeGenerator, HttpContinuousIntegration,
    HttpVersionControl, MemoryCi, MemoryGenerator, MemoryVersionControl, VersionControl,
};
use crate::component::ComponentOrchestrator;
use crate::config::{BackendKind, FactoryConfig};
use crate::error::FactoryResult;
use crate::group::GroupService;
use crate::implementation::ImplementationOrchestrator;
use crate::inventory::Inventory;
use crate::library::LibraryOrchestrator;
use crate::pipeline::PipelineProvisioner;
use crate::query::QueryService;
use crate::repository::{RepositoryLayout, RepositoryProvisioner};
use crate::version::VersionBuilder;

/// The four backends the engine talks to.
#[derive(Clone)]
pub struct Backends {
    /// Inventory store.
    pub inventory: Inventory,
    /// Version-control backend.
    pub vcs: Arc<dyn VersionControl>,
    /// CI backend.
    pub ci: Arc<dyn ContinuousIntegration>,
    /// Code generator.
    pub generator: Arc<dyn CodeGenerator>,
}

impl Backends {
    /// In-process backends.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            inventory: Inventory::memory(),
            vcs: Arc::new(MemoryVersionControl::new()),
            ci: Arc::new(MemoryCi::new()),
            generator: Arc::new(MemoryGenerator::new()),
        }
    }

    /// HTTP clients for the configured endpoints.
    pub fn http(config: &FactoryConfig) -> FactoryResult<Self> {
        Ok(Self {
            inventory: Inventory::http(&config.inventory)?,
            vcs: Arc::new(HttpVersionControl::new(&config.version_control)?),
            ci: Arc::new(HttpContinuousIntegration::new(&config.ci)?),
            generator: Arc::new(HttpCodeGenerator::new(&config.generator)?),
        })
    }

    /// Backends selected by `config.backend.kind`.
    pub fn from_config(config: &FactoryConfig) -> FactoryResult<Self> {
        let backends = match config.backend.kind {
            BackendKind::Http => Self::http(config)?,
            BackendKind::Memory => Self::memory(),
        };
        info!(backend = ?config.backend.kind, "backends configured");
        Ok(backends)
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

/// Entry point to the provisioning engine.
///
/// Every create operation returns the PENDING record together with the
/// handle of the task finishing it; the outcome is observed by reading the
/// record again.
#[derive(Clone)]
pub struct Factory {
    backends: Backends,
    groups: GroupService,
    components: ComponentOrchestrator,
    libraries: LibraryOrchestrator,
    implementations: ImplementationOrchestrator,
    api_versions: ApiVersionOrchestrator,
    library_api_versions: LibraryApiVersionOrchestrator,
    repositories: RepositoryProvisioner,
    pipelines: PipelineProvisioner,
    queries: QueryService,
}

impl Factory {
    /// Build a factory with the backends selected by `config`.
    pub fn from_config(config: &FactoryConfig) -> FactoryResult<Self> {
        Ok(Self::new(config, Backends::from_config(config)?))
    }

    /// Start building a factory from explicit backends.
    #[must_use]
    pub fn builder() -> FactoryBuilder {
        FactoryBuilder::default()
    }

    /// Wire every orchestrator over `backends`.
    #[must_use]
    pub fn new(config: &FactoryConfig, backends: Backends) -> Self {
        let inventory = backends.inventory.clone();
        let layout = RepositoryLayout::new(&config.repository);
        let default_group = config.artifacts.default_group.clone();

        let repositories = RepositoryProvisioner::new(inventory.clone(), Arc::clone(&backends.vcs));
        let pipelines =
            PipelineProvisioner::new(inventory.clone(), Arc::clone(&backends.ci), &config.build);
        let versions = VersionBuilder::new(
            inventory.clone(),
            repositories.clone(),
            pipelines.clone(),
            Arc::clone(&backends.generator),
            layout.clone(),
            default_group.clone(),
        );
        let libraries = LibraryOrchestrator::new(
            inventory.clone(),
            repositories.clone(),
            pipelines.clone(),
            layout.clone(),
        );
        let implementations = ImplementationOrchestrator::new(
            inventory.clone(),
            repositories.clone(),
            pipelines.clone(),
            versions.clone(),
            Arc::clone(&backends.generator),
            layout.clone(),
        );
        let api_versions = ApiVersionOrchestrator::new(
            inventory.clone(),
            repositories.clone(),
            versions.clone(),
            layout.clone(),
        );
        let library_api_versions = LibraryApiVersionOrchestrator::new(inventory.clone(), versions);
        let components = ComponentOrchestrator::new(
            inventory.clone(),
            repositories.clone(),
            libraries.clone(),
            implementations.clone(),
            api_versions.clone(),
            layout,
            config.matrix.clone(),
            default_group,
        );
        let queries = QueryService::new(inventory.clone(), repositories.clone(), pipelines.clone());

        Self {
            groups: GroupService::new(inventory),
            components,
            libraries,
            implementations,
            api_versions,
            library_api_versions,
            repositories,
            pipelines,
            queries,
            backends,
        }
    }

    /// Inventory store.
    #[must_use]
    pub fn inventory(&self) -> &Inventory {
        &self.backends.inventory
    }

    /// Backends in use.
    #[must_use]
    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Groups.
    #[must_use]
    pub fn groups(&self) -> &GroupService {
        &self.groups
    }

    /// Components.
    #[must_use]
    pub fn components(&self) -> &ComponentOrchestrator {
        &self.components
    }

    /// Libraries.
    #[must_use]
    pub fn libraries(&self) -> &LibraryOrchestrator {
        &self.libraries
    }

    /// Implementations and their versions.
    #[must_use]
    pub fn implementations(&self) -> &ImplementationOrchestrator {
        &self.implementations
    }

    /// API versions.
    #[must_use]
    pub fn api_versions(&self) -> &ApiVersionOrchestrator {
        &self.api_versions
    }

    /// Library API versions.
    #[must_use]
    pub fn library_api_versions(&self) -> &LibraryApiVersionOrchestrator {
        &self.library_api_versions
    }

    /// Repositories.
    #[must_use]
    pub fn repositories(&self) -> &RepositoryProvisioner {
        &self.repositories
    }

    /// Pipelines and builds.
    #[must_use]
    pub fn pipelines(&self) -> &PipelineProvisioner {
        &self.pipelines
    }

    /// Branch, commit and build queries.
    #[must_use]
    pub fn queries(&self) -> &QueryService {
        &self.queries
    }
}

impl std::fmt::Debug for Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory")
            .field("components", &self.components)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Factory`] over explicit backends.
///
/// Backends that are not set default to the in-process ones.
#[derive(Default)]
pub struct FactoryBuilder {
    config: Option<FactoryConfig>,
    inventory: Option<Inventory>,
    vcs: Option<Arc<dyn VersionControl>>,
    ci: Option<Arc<dyn ContinuousIntegration>>,
    generator: Option<Arc<dyn CodeGenerator>>,
}

impl FactoryBuilder {
    /// Use `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: FactoryConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use `inventory`.
    #[must_use]
    pub fn inventory(mut self, inventory: Inventory) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Use `vcs`.
    #[must_use]
    pub fn version_control(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    /// Use `ci`.
    #[must_use]
    pub fn ci(mut self, ci: Arc<dyn ContinuousIntegration>) -> Self {
        self.ci = Some(ci);
        self
    }

    /// Use `generator`.
    #[must_use]
    pub fn generator(mut self, generator: Arc<dyn CodeGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Wire the factory.
    #[must_use]
    pub fn build(self) -> Factory {
        let config = self.config.unwrap_or_default();
        let backends = Backends {
            inventory: self.inventory.unwrap_or_else(Inventory::memory),
            vcs: self
                .vcs
                .unwrap_or_else(|| Arc::new(MemoryVersionControl::new())),
            ci: self.ci.unwrap_or_else(|| Arc::new(MemoryCi::new())),
            generator: self
                .generator
                .unwrap_or_else(|| Arc::new(MemoryGenerator::new())),
        };
        Factory::new(&config, backends)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;

    #[test]
    fn memory_backends_from_config() {
        let mut config = FactoryConfig::default();
        config.backend.kind = BackendKind::Memory;
        let factory = Factory::from_config(&config).unwrap();
        assert!(format!("{factory:?}").contains("Factory"));
    }

    #[test]
    fn http_backends_reject_bad_urls() {
        let mut config = FactoryConfig::default();
        config.version_control = EndpointConfig::new("not a url");
        assert!(Factory::from_config(&config).is_err());

        let config = FactoryConfig::default();
        assert!(Factory::from_config(&config).is_ok());
    }
}
