//! API versions and the library bindings generated from them.

use tracing::{debug, info};

use crate::context::CallerContext;
use crate::error::{FactoryError, FactoryResult};
use crate::inventory::Inventory;
use crate::model::{ApiVersion, Component, Header, Library, LibraryApiVersion, ResourceKind};
use crate::repository::{RepositoryLayout, RepositoryProvisioner};
use crate::resource::Resource;
use crate::task::{detach, settle_all, Callback, Provisioning};
use crate::types::{ResourceId, SemanticVersion, Status};
use crate::version::VersionBuilder;

/// Publishes tagged snapshots of a component's API spec.
#[derive(Clone)]
pub struct ApiVersionOrchestrator {
    inventory: Inventory,
    repositories: RepositoryProvisioner,
    versions: VersionBuilder,
    layout: RepositoryLayout,
}

impl ApiVersionOrchestrator {
    /// Create an orchestrator.
    pub fn new(
        inventory: Inventory,
        repositories: RepositoryProvisioner,
        versions: VersionBuilder,
        layout: RepositoryLayout,
    ) -> Self {
        Self {
            inventory,
            repositories,
            versions,
            layout,
        }
    }

    /// Commit `spec` to the component's API repository tagged `version`.
    pub async fn create(
        &self,
        ctx: &CallerContext,
        component: &Component,
        version: &str,
        spec: &str,
        on_ready: Callback,
    ) -> FactoryResult<Provisioning<ApiVersion>> {
        component.ensure_ready()?;
        SemanticVersion::parse(version)?;
        if spec.trim().is_empty() {
            return Err(FactoryError::validation("api spec must not be empty"));
        }

        let existing: Vec<ApiVersion> = self.inventory.owned(ctx, component.id()).await?;
        if existing.iter().any(|v| v.version == version) {
            return Err(FactoryError::already_exists(
                ResourceKind::ApiVersion,
                format!("{}@{version}", component.name),
            ));
        }

        let repository = self
            .repositories
            .find_by_owner(ctx, component.id())
            .await?
            .ok_or_else(|| {
                FactoryError::not_found(ResourceKind::SourceRepository, component.id())
            })?;
        repository.ensure_ready()?;

        let record = self
            .inventory
            .api_versions
            .insert(
                ctx,
                ApiVersion {
                    header: Header::pending(),
                    component_id: component.id().clone(),
                    version: version.to_owned(),
                },
            )
            .await?;

        info!(
            api_version_id = %record.id(),
            component = %component.name,
            version,
            "api version registered"
        );

        let this = self.clone();
        let task_ctx = ctx.clone();
        let id = record.id().clone();
        let version = version.to_owned();
        let spec = spec.to_owned();
        let task = detach(ctx, "publish_api_version", record.id(), async move {
            let published = this
                .repositories
                .commit_file_and_tag(
                    &task_ctx,
                    &repository,
                    this.layout.default_branch(),
                    this.layout.api_spec_file(),
                    &spec,
                    Some(&version),
                )
                .await;
            let outcome = match published {
                Ok(()) => this
                    .inventory
                    .update_status::<ApiVersion>(&task_ctx, &id, Status::Ready)
                    .await
                    .map(|_| ()),
                Err(err) => Err(err),
            };
            match outcome {
                Ok(()) => info!(api_version_id = %id, "api version ready"),
                Err(err) => this.inventory.manage_error::<ApiVersion>(&task_ctx, &id, &err).await,
            }
            on_ready.fire().await;
        });

        Ok(Provisioning {
            resource: record,
            task,
        })
    }

    /// API versions of a component.
    pub async fn list(
        &self,
        ctx: &CallerContext,
        component_id: &ResourceId,
    ) -> FactoryResult<Vec<ApiVersion>> {
        self.inventory.owned(ctx, component_id).await
    }

    /// Get an API version.
    pub async fn get(&self, ctx: &CallerContext, id: &ResourceId) -> FactoryResult<ApiVersion> {
        self.inventory.require(ctx, id).await
    }

    /// Delete an API version and its library bindings.
    pub async fn delete(&self, ctx: &CallerContext, id: &ResourceId) -> FactoryResult<()> {
        let Some(api_version) = self.inventory.deletable::<ApiVersion>(ctx, id).await? else {
            debug!(api_version_id = %id, "api version already deleted");
            return Ok(());
        };

        let bindings: Vec<LibraryApiVersion> = self.inventory.owned(ctx, id).await?;
        settle_all(
            bindings
                .iter()
                .map(|binding| self.versions.delete_library_version(ctx, binding.id())),
        )
        .await?;

        self.inventory.retire::<ApiVersion>(ctx, id).await?;
        info!(api_version_id = %id, version = %api_version.version, "api version deleted");
        Ok(())
    }
}

/// Generates library bindings for API versions.
#[derive(Clone)]
pub struct LibraryApiVersionOrchestrator {
    inventory: Inventory,
    versions: VersionBuilder,
}

impl LibraryApiVersionOrchestrator {
    /// Create an orchestrator.
    pub fn new(inventory: Inventory, versions: VersionBuilder) -> Self {
        Self { inventory, versions }
    }

    /// Generate and build the binding of a library for an API version.
    pub async fn create(
        &self,
        ctx: &CallerContext,
        api_version_id: &ResourceId,
        library_id: &ResourceId,
        on_ready: Callback,
    ) -> FactoryResult<Provisioning<LibraryApiVersion>> {
        let api_version: ApiVersion = self.inventory.require(ctx, api_version_id).await?;
        let library: Library = self.inventory.require(ctx, library_id).await?;
        self.versions
            .create_library_version(ctx, &api_version, &library, on_ready)
            .await
    }

    /// Bindings generated for an API version.
    pub async fn list(
        &self,
        ctx: &CallerContext,
        api_version_id: &ResourceId,
    ) -> FactoryResult<Vec<LibraryApiVersion>> {
        self.inventory.owned(ctx, api_version_id).await
    }

    /// Get a binding.
    pub async fn get(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
    ) -> FactoryResult<LibraryApiVersion> {
        self.inventory.require(ctx, id).await
    }

    /// Delete a binding.
    pub async fn delete(&self, ctx: &CallerContext, id: &ResourceId) -> FactoryResult<()> {
        self.versions.delete_library_version(ctx, id).await
    }
}
