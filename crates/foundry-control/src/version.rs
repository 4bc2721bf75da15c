//! Generate, commit and build versions.
//!
//! Implementation versions and library API versions follow the same flow:
//! fetch the API spec at the API version's tag, generate sources from it,
//! commit and tag them into the target repository, then build the tag and
//! record the outcome. Library API versions track the commit and the build
//! as separate sub-statuses and become READY once both are.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{CodeGenerator, GenerationRequest, GenerationTarget};
use crate::context::CallerContext;
use crate::error::{FactoryError, FactoryResult};
use crate::inventory::{Filter, Inventory};
use crate::model::{
    ApiVersion, Component, Header, Implementation, ImplementationVersion, Library,
    LibraryApiVersion, LibraryApiVersionPatch, Pipeline, ResourceKind, SourceRepository,
    StatusPatch,
};
use crate::pipeline::{ensure_buildable, OnBuildFinished, PipelineProvisioner};
use crate::repository::{RepositoryLayout, RepositoryProvisioner};
use crate::resource::Resource;
use crate::rollup::RollupLocks;
use crate::task::{detach, Callback, OnceCallback, Provisioning};
use crate::types::{
    artifact_name, keys, BuildNumber, BuildStatus, Language, ResourceId, SemanticVersion, Status,
};

/// Build arguments passed to every version build.
pub mod args {
    /// Version being built.
    pub const VERSION: &str = "VERSION";
    /// Artifact name.
    pub const ARTIFACT_NAME: &str = "ARTIFACT_NAME";
    /// Artifact group.
    pub const ARTIFACT_GROUP_ID: &str = "ARTIFACT_GROUP_ID";
    /// Target language.
    pub const LANGUAGE: &str = "LANGUAGE";
}

/// Everything one generate-commit-build run needs, resolved up front.
#[derive(Debug, Clone)]
struct Generation {
    api_repository: SourceRepository,
    api_tag: String,
    repository: SourceRepository,
    pipeline: Pipeline,
    language: Language,
    target: GenerationTarget,
    artifact_name: String,
    artifact_group: String,
    version: String,
}

/// Creates implementation versions and library API versions.
#[derive(Clone)]
pub struct VersionBuilder {
    inventory: Inventory,
    repositories: RepositoryProvisioner,
    pipelines: PipelineProvisioner,
    generator: Arc<dyn CodeGenerator>,
    layout: RepositoryLayout,
    locks: RollupLocks,
    default_group: String,
}

impl VersionBuilder {
    /// Create a builder.
    pub fn new(
        inventory: Inventory,
        repositories: RepositoryProvisioner,
        pipelines: PipelineProvisioner,
        generator: Arc<dyn CodeGenerator>,
        layout: RepositoryLayout,
        default_group: impl Into<String>,
    ) -> Self {
        Self {
            inventory,
            repositories,
            pipelines,
            generator,
            layout,
            locks: RollupLocks::new(),
            default_group: default_group.into(),
        }
    }

    // =========================================================================
    // Implementation versions
    // =========================================================================

    /// Build `version` of a READY implementation.
    pub async fn create_implementation_version(
        &self,
        ctx: &CallerContext,
        implementation: &Implementation,
        version: &str,
        on_ready: Callback,
    ) -> FactoryResult<Provisioning<ImplementationVersion>> {
        implementation.ensure_ready()?;
        self.start_implementation_version(ctx, implementation, version, on_ready)
            .await
    }

    /// Build `version` of an implementation that may still be provisioning.
    ///
    /// Its repository and pipeline must already be READY.
    pub(crate) async fn start_implementation_version(
        &self,
        ctx: &CallerContext,
        implementation: &Implementation,
        version: &str,
        on_ready: Callback,
    ) -> FactoryResult<Provisioning<ImplementationVersion>> {
        implementation.ensure_not_errored()?;
        SemanticVersion::parse(version)?;

        let existing: Vec<ImplementationVersion> =
            self.inventory.owned(ctx, implementation.id()).await?;
        if existing.iter().any(|v| v.version == version) {
            return Err(FactoryError::already_exists(
                ResourceKind::ImplementationVersion,
                format!("{}@{version}", implementation.name),
            ));
        }

        let repository = self.ready_repository(ctx, implementation.id()).await?;
        let pipeline = self.ready_pipeline(ctx, implementation.id()).await?;
        let api_version: ApiVersion = self
            .inventory
            .require(ctx, &implementation.api_version_id)
            .await?;
        api_version.ensure_ready()?;
        let api_repository = self
            .ready_repository(ctx, &implementation.component_id)
            .await?;

        let generation = Generation {
            api_repository,
            api_tag: api_version.version.clone(),
            repository,
            pipeline,
            language: implementation.language,
            target: GenerationTarget::Service,
            artifact_name: implementation
                .metadata_value(keys::ARTIFACT_NAME)
                .map_or_else(|| artifact_name(&implementation.name), ToOwned::to_owned),
            artifact_group: implementation
                .metadata_value(keys::ARTIFACT_GROUP_ID)
                .unwrap_or(&self.default_group)
                .to_owned(),
            version: version.to_owned(),
        };

        let record = self
            .inventory
            .implementation_versions
            .insert(
                ctx,
                ImplementationVersion {
                    header: Header::pending(),
                    implementation_id: implementation.id().clone(),
                    version: version.to_owned(),
                },
            )
            .await?;

        info!(
            version_id = %record.id(),
            implementation = %implementation.name,
            version,
            "implementation version registered"
        );

        let this = self.clone();
        let task_ctx = ctx.clone();
        let id = record.id().clone();
        let task = detach(ctx, "build_implementation_version", record.id(), async move {
            let on_ready = OnceCallback::new(on_ready);
            if let Err(err) = this
                .run_implementation_version(&task_ctx, &id, &generation, &on_ready)
                .await
            {
                this.inventory
                    .manage_error::<ImplementationVersion>(&task_ctx, &id, &err)
                    .await;
                on_ready.fire().await;
            }
        });

        Ok(Provisioning {
            resource: record,
            task,
        })
    }

    async fn run_implementation_version(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        generation: &Generation,
        on_ready: &OnceCallback,
    ) -> FactoryResult<()> {
        self.generate_and_commit(ctx, generation).await?;

        let this = self.clone();
        let watch_ctx = ctx.clone();
        let version_id = id.clone();
        let notify = on_ready.clone();
        let on_finished = OnBuildFinished::new(move |number, status| async move {
            this.finish_implementation_version(&watch_ctx, &version_id, number, status)
                .await;
            notify.fire().await;
        });

        self.build(ctx, generation, on_finished).await?;
        Ok(())
    }

    async fn finish_implementation_version(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        number: BuildNumber,
        status: BuildStatus,
    ) {
        let outcome = match build_outcome(number, status) {
            Ok(()) => self
                .inventory
                .patch::<ImplementationVersion>(
                    ctx,
                    id,
                    StatusPatch::status(Status::Ready)
                        .with_metadata(keys::BUILD_NUMBER, number.to_string()),
                )
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => info!(version_id = %id, build = %number, "implementation version ready"),
            Err(err) => {
                self.inventory
                    .manage_error::<ImplementationVersion>(ctx, id, &err)
                    .await;
            }
        }
    }

    /// Versions of an implementation.
    pub async fn implementation_versions(
        &self,
        ctx: &CallerContext,
        implementation_id: &ResourceId,
    ) -> FactoryResult<Vec<ImplementationVersion>> {
        self.inventory.owned(ctx, implementation_id).await
    }

    /// Delete an implementation version record.
    pub async fn delete_implementation_version(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
    ) -> FactoryResult<()> {
        if self
            .inventory
            .deletable::<ImplementationVersion>(ctx, id)
            .await?
            .is_none()
        {
            return Ok(());
        }
        self.inventory.retire::<ImplementationVersion>(ctx, id).await
    }

    // =========================================================================
    // Library API versions
    // =========================================================================

    /// Generate the binding of `library` for `api_version`.
    ///
    /// At most one binding exists per pair.
    pub async fn create_library_version(
        &self,
        ctx: &CallerContext,
        api_version: &ApiVersion,
        library: &Library,
        on_ready: Callback,
    ) -> FactoryResult<Provisioning<LibraryApiVersion>> {
        api_version.ensure_ready()?;
        library.ensure_ready()?;
        if api_version.component_id != library.component_id {
            return Err(FactoryError::validation(format!(
                "library {} does not belong to the component of api version {}",
                library.name, api_version.version
            )));
        }

        let existing: Vec<LibraryApiVersion> = self
            .inventory
            .library_api_versions
            .list(ctx, &Filter::new().with_owner(api_version.id().clone()))
            .await?;
        if existing.iter().any(|v| v.library_id == *library.id()) {
            return Err(FactoryError::already_exists(
                ResourceKind::LibraryApiVersion,
                format!("{}@{}", library.name, api_version.version),
            ));
        }

        let repository = self.ready_repository(ctx, library.id()).await?;
        let pipeline = self.ready_pipeline(ctx, library.id()).await?;
        let component: Component = self.inventory.require(ctx, &library.component_id).await?;
        let api_repository = self.ready_repository(ctx, component.id()).await?;

        let generation = Generation {
            api_repository,
            api_tag: api_version.version.clone(),
            repository,
            pipeline,
            language: library.language,
            target: GenerationTarget::Library(library.kind),
            artifact_name: artifact_name(&library.name),
            artifact_group: component
                .metadata_value(keys::API_GROUP_ID)
                .unwrap_or(&self.default_group)
                .to_owned(),
            version: api_version.version.clone(),
        };

        let record = self
            .inventory
            .library_api_versions
            .insert(
                ctx,
                LibraryApiVersion {
                    header: Header::pending(),
                    api_version_id: api_version.id().clone(),
                    library_id: library.id().clone(),
                    version: api_version.version.clone(),
                    api_repository_status: Status::Pending,
                    pipeline_status: Status::Pending,
                },
            )
            .await?;

        info!(
            binding_id = %record.id(),
            library = %library.name,
            version = %api_version.version,
            "library api version registered"
        );

        let this = self.clone();
        let task_ctx = ctx.clone();
        let id = record.id().clone();
        let task = detach(ctx, "build_library_api_version", record.id(), async move {
            let on_ready = OnceCallback::new(on_ready);
            if let Err(err) = this
                .run_library_version(&task_ctx, &id, &generation, &on_ready)
                .await
            {
                this.inventory
                    .manage_error::<LibraryApiVersion>(&task_ctx, &id, &err)
                    .await;
                on_ready.fire().await;
            }
        });

        Ok(Provisioning {
            resource: record,
            task,
        })
    }

    async fn run_library_version(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        generation: &Generation,
        on_ready: &OnceCallback,
    ) -> FactoryResult<()> {
        if let Err(err) = self.generate_and_commit(ctx, generation).await {
            self.set_part_statuses(ctx, id, Some(Status::Error), None).await?;
            return Err(err);
        }
        self.set_part_statuses(ctx, id, Some(Status::Ready), None).await?;
        self.promote(ctx, id, on_ready).await?;

        let this = self.clone();
        let watch_ctx = ctx.clone();
        let binding_id = id.clone();
        let notify = on_ready.clone();
        let on_finished = OnBuildFinished::new(move |number, status| async move {
            if let Err(err) = this
                .finish_library_version(&watch_ctx, &binding_id, number, status, &notify)
                .await
            {
                this.inventory
                    .manage_error::<LibraryApiVersion>(&watch_ctx, &binding_id, &err)
                    .await;
                notify.fire().await;
            }
        });

        if let Err(err) = self.build(ctx, generation, on_finished).await {
            self.set_part_statuses(ctx, id, None, Some(Status::Error)).await?;
            return Err(err);
        }
        Ok(())
    }

    async fn set_part_statuses(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        api_repository_status: Option<Status>,
        pipeline_status: Option<Status>,
    ) -> FactoryResult<()> {
        self.inventory
            .patch::<LibraryApiVersion>(
                ctx,
                id,
                LibraryApiVersionPatch {
                    api_repository_status,
                    pipeline_status,
                    ..LibraryApiVersionPatch::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn finish_library_version(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        number: BuildNumber,
        status: BuildStatus,
        on_ready: &OnceCallback,
    ) -> FactoryResult<()> {
        let pipeline_status = match build_outcome(number, status) {
            Ok(()) => Status::Ready,
            Err(err) => {
                self.set_part_statuses(ctx, id, None, Some(Status::Error)).await?;
                return Err(err);
            }
        };

        self.inventory
            .patch::<LibraryApiVersion>(
                ctx,
                id,
                LibraryApiVersionPatch {
                    common: StatusPatch::metadata(keys::BUILD_NUMBER, number.to_string()),
                    pipeline_status: Some(pipeline_status),
                    ..LibraryApiVersionPatch::default()
                },
            )
            .await?;
        self.promote(ctx, id, on_ready).await?;
        Ok(())
    }

    /// Mark a library API version READY once both of its parts are.
    async fn promote(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        on_ready: &OnceCallback,
    ) -> FactoryResult<bool> {
        let _guard = self.locks.acquire(id).await;

        let binding: LibraryApiVersion = self.inventory.require(ctx, id).await?;
        if binding.is_ready() {
            return Ok(true);
        }
        if !binding.parts_ready() {
            debug!(
                binding_id = %id,
                api_repository = %binding.api_repository_status,
                pipeline = %binding.pipeline_status,
                "library api version not ready"
            );
            return Ok(false);
        }

        self.inventory
            .update_status::<LibraryApiVersion>(ctx, id, Status::Ready)
            .await?;
        info!(binding_id = %id, "library api version ready");
        on_ready.fire().await;
        Ok(true)
    }

    /// Delete a library API version record.
    pub async fn delete_library_version(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
    ) -> FactoryResult<()> {
        if self
            .inventory
            .deletable::<LibraryApiVersion>(ctx, id)
            .await?
            .is_none()
        {
            return Ok(());
        }
        self.inventory.retire::<LibraryApiVersion>(ctx, id).await?;
        self.locks.forget(id);
        Ok(())
    }

    // =========================================================================
    // Shared steps
    // =========================================================================

    async fn generate_and_commit(
        &self,
        ctx: &CallerContext,
        generation: &Generation,
    ) -> FactoryResult<()> {
        let spec = self
            .repositories
            .get_file(
                ctx,
                &generation.api_repository,
                self.layout.api_spec_file(),
                &generation.api_tag,
            )
            .await?;

        let archive = self
            .generator
            .generate(
                ctx,
                &GenerationRequest {
                    spec,
                    language: generation.language,
                    target: generation.target,
                    artifact_name: generation.artifact_name.clone(),
                    artifact_group: generation.artifact_group.clone(),
                    version: generation.version.clone(),
                },
            )
            .await?;

        self.repositories
            .commit_archive_and_tag(
                ctx,
                &generation.repository,
                self.layout.default_branch(),
                archive,
                Some(&generation.version),
            )
            .await
    }

    async fn build(
        &self,
        ctx: &CallerContext,
        generation: &Generation,
        on_finished: OnBuildFinished,
    ) -> FactoryResult<BuildNumber> {
        let args = BTreeMap::from([
            (args::VERSION.to_owned(), generation.version.clone()),
            (args::ARTIFACT_NAME.to_owned(), generation.artifact_name.clone()),
            (args::ARTIFACT_GROUP_ID.to_owned(), generation.artifact_group.clone()),
            (args::LANGUAGE.to_owned(), generation.language.as_str().to_owned()),
        ]);

        self.pipelines
            .build(
                ctx,
                &generation.pipeline,
                &generation.version,
                args,
                Some(on_finished),
            )
            .await
    }

    async fn ready_repository(
        &self,
        ctx: &CallerContext,
        owner: &ResourceId,
    ) -> FactoryResult<SourceRepository> {
        let repository = self
            .repositories
            .find_by_owner(ctx, owner)
            .await?
            .ok_or_else(|| FactoryError::not_found(ResourceKind::SourceRepository, owner))?;
        repository.ensure_ready()?;
        Ok(repository)
    }

    async fn ready_pipeline(
        &self,
        ctx: &CallerContext,
        owner: &ResourceId,
    ) -> FactoryResult<Pipeline> {
        let pipeline = self
            .pipelines
            .find_by_owner(ctx, owner)
            .await?
            .ok_or_else(|| FactoryError::not_found(ResourceKind::Pipeline, owner))?;
        ensure_buildable(&pipeline)?;
        Ok(pipeline)
    }
}

/// Map a terminal build status onto the version's outcome.
fn build_outcome(number: BuildNumber, status: BuildStatus) -> FactoryResult<()> {
    match status {
        BuildStatus::Success => Ok(()),
        BuildStatus::Failed => Err(FactoryError::BuildFailed { number: number.0 }),
        other => Err(FactoryError::UnexpectedBuildStatus(other)),
    }
}
