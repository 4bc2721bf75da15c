//! Implementation orchestration.
//!
//! An implementation is provisioned as a strict chain: repository, then a
//! scaffold commit and the pipeline, then the first version. Each stage
//! starts from the previous stage's callback and a failing stage records
//! ERROR on the implementation without starting the next one.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::CodeGenerator;
use crate::context::CallerContext;
use crate::error::{FactoryError, FactoryResult};
use crate::inventory::{Filter, Inventory};
use crate::model::{
    ApiVersion, Component, Header, Implementation, ImplementationVersion, ResourceKind,
};
use crate::pipeline::{PipelineProvisioner, PipelineSpec};
use crate::repository::{RepositoryLayout, RepositoryProvisioner};
use crate::resource::Resource;
use crate::task::{detach, settle_all, Callback, OnceCallback, Provisioning};
use crate::types::{
    artifact_name, keys, validate_name, Language, Metadata, ResourceId, SemanticVersion, Status,
    Template,
};
use crate::version::{args, VersionBuilder};

/// Provisions service implementations of component APIs.
#[derive(Clone)]
pub struct ImplementationOrchestrator {
    inventory: Inventory,
    repositories: RepositoryProvisioner,
    pipelines: PipelineProvisioner,
    versions: VersionBuilder,
    generator: Arc<dyn CodeGenerator>,
    layout: RepositoryLayout,
}

impl ImplementationOrchestrator {
    /// Create an orchestrator.
    pub fn new(
        inventory: Inventory,
        repositories: RepositoryProvisioner,
        pipelines: PipelineProvisioner,
        versions: VersionBuilder,
        generator: Arc<dyn CodeGenerator>,
        layout: RepositoryLayout,
    ) -> Self {
        Self {
            inventory,
            repositories,
            pipelines,
            versions,
            generator,
            layout,
        }
    }

    /// Register an implementation of a READY API version.
    ///
    /// The name must be unique across all implementations and differ from
    /// the component's name. `on_ready` fires once the implementation is
    /// READY or a stage has failed.
    pub async fn create(
        &self,
        ctx: &CallerContext,
        name: &str,
        language: Language,
        description: &str,
        api_version_id: &ResourceId,
        on_ready: Callback,
    ) -> FactoryResult<Provisioning<Implementation>> {
        validate_name(name)?;
        let deploy_key = ctx.deploy_key()?.to_owned();

        let api_version: ApiVersion = self.inventory.require(ctx, api_version_id).await?;
        api_version.ensure_ready()?;
        let component: Component = self.inventory.require(ctx, &api_version.component_id).await?;
        component.ensure_not_errored()?;

        if name == component.name {
            return Err(FactoryError::validation(format!(
                "implementation name '{name}' must differ from its component's name"
            )));
        }
        if !self
            .inventory
            .implementations
            .list(ctx, &Filter::new().with_name(name))
            .await?
            .is_empty()
        {
            return Err(FactoryError::already_exists(ResourceKind::Implementation, name));
        }

        let group_id = component.require_metadata(keys::GROUP_ID)?;
        let group_path = component.require_metadata(keys::GROUP_PATH)?;
        let api_group_id = component.require_metadata(keys::API_GROUP_ID)?;

        let metadata = Metadata::from([
            (keys::DEPLOY_KEY.to_owned(), deploy_key.clone()),
            (keys::ARTIFACT_NAME.to_owned(), artifact_name(name)),
            (keys::ARTIFACT_GROUP_ID.to_owned(), api_group_id.to_owned()),
            (keys::GROUP_ID.to_owned(), group_id.to_owned()),
            (keys::GROUP_PATH.to_owned(), group_path.to_owned()),
        ]);

        let implementation = self
            .inventory
            .implementations
            .insert(
                ctx,
                Implementation {
                    header: Header::pending_with(metadata),
                    component_id: component.id().clone(),
                    api_version_id: api_version.id().clone(),
                    name: name.to_owned(),
                    language,
                    description: description.to_owned(),
                },
            )
            .await?;

        info!(
            implementation_id = %implementation.id(),
            name,
            %language,
            api_version = %api_version.version,
            "implementation registered"
        );

        let path = self.layout.implementation_repository(group_path, name);
        let this = self.clone();
        let task_ctx = ctx.clone();
        let registered = implementation.clone();
        let task = detach(ctx, "provision_implementation", implementation.id(), async move {
            let on_ready = OnceCallback::new(on_ready);
            let id = registered.id().clone();

            let next = this.clone();
            let next_ctx = task_ctx.clone();
            let next_id = id.clone();
            let notify = on_ready.clone();
            let on_repository = Callback::new(move || async move {
                next.after_repository(&next_ctx, &next_id, &notify).await;
            });

            if let Err(err) = this
                .repositories
                .create(&task_ctx, &id, &registered.name, &path, vec![deploy_key], on_repository)
                .await
            {
                this.fail(&task_ctx, &id, &err, &on_ready).await;
            }
        });

        Ok(Provisioning {
            resource: implementation,
            task,
        })
    }

    async fn fail(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        err: &FactoryError,
        on_ready: &OnceCallback,
    ) {
        self.inventory.manage_error::<Implementation>(ctx, id, err).await;
        on_ready.fire().await;
    }

    /// The implementation, unless it is gone or has already failed.
    async fn in_progress(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
    ) -> FactoryResult<Option<Implementation>> {
        Ok(self
            .inventory
            .find::<Implementation>(ctx, id)
            .await?
            .filter(|imp| imp.is_pending() || imp.status() == Status::Updating))
    }

    async fn after_repository(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        on_ready: &OnceCallback,
    ) {
        if let Err(err) = self.scaffold_and_create_pipeline(ctx, id, on_ready).await {
            self.fail(ctx, id, &err, on_ready).await;
        }
    }

    async fn scaffold_and_create_pipeline(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        on_ready: &OnceCallback,
    ) -> FactoryResult<()> {
        let Some(implementation) = self.in_progress(ctx, id).await? else {
            return Ok(());
        };
        let repository = self
            .repositories
            .find_by_owner(ctx, id)
            .await?
            .ok_or_else(|| FactoryError::not_found(ResourceKind::SourceRepository, id))?;
        repository.ensure_not_errored()?;
        repository.ensure_ready()?;

        let template = Template::for_implementation(implementation.language)?;
        let settings = BTreeMap::from([
            ("NAME".to_owned(), implementation.name.clone()),
            (
                args::ARTIFACT_NAME.to_owned(),
                implementation.require_metadata(keys::ARTIFACT_NAME)?.to_owned(),
            ),
            (
                args::ARTIFACT_GROUP_ID.to_owned(),
                implementation.require_metadata(keys::ARTIFACT_GROUP_ID)?.to_owned(),
            ),
            (args::LANGUAGE.to_owned(), implementation.language.as_str().to_owned()),
        ]);
        let scaffold = self
            .generator
            .render_template(ctx, template.as_str(), &settings)
            .await?;
        self.repositories
            .commit_archive_and_tag(ctx, &repository, self.layout.default_branch(), scaffold, None)
            .await?;
        debug!(implementation_id = %id, %template, "scaffold committed");

        let next = self.clone();
        let next_ctx = ctx.clone();
        let next_id = id.clone();
        let notify = on_ready.clone();
        let on_pipeline = Callback::new(move || async move {
            next.after_pipeline(&next_ctx, &next_id, &notify).await;
        });

        self.pipelines
            .create(
                ctx,
                PipelineSpec {
                    owner: id,
                    name: &implementation.name,
                    path: &repository.path,
                    template,
                    credential_id: implementation.require_metadata(keys::DEPLOY_KEY)?,
                },
                &repository,
                on_pipeline,
            )
            .await?;
        Ok(())
    }

    async fn after_pipeline(&self, ctx: &CallerContext, id: &ResourceId, on_ready: &OnceCallback) {
        if let Err(err) = self.start_first_version(ctx, id, on_ready).await {
            self.fail(ctx, id, &err, on_ready).await;
        }
    }

    async fn start_first_version(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        on_ready: &OnceCallback,
    ) -> FactoryResult<()> {
        let Some(implementation) = self.in_progress(ctx, id).await? else {
            return Ok(());
        };
        let pipeline = self
            .pipelines
            .find_by_owner(ctx, id)
            .await?
            .ok_or_else(|| FactoryError::not_found(ResourceKind::Pipeline, id))?;
        pipeline.ensure_not_errored()?;
        pipeline.ensure_ready()?;

        let next = self.clone();
        let next_ctx = ctx.clone();
        let next_id = id.clone();
        let notify = on_ready.clone();
        let on_version = Callback::new(move || async move {
            next.after_first_version(&next_ctx, &next_id, &notify).await;
        });

        self.versions
            .start_implementation_version(
                ctx,
                &implementation,
                &SemanticVersion::INITIAL.to_string(),
                on_version,
            )
            .await?;
        Ok(())
    }

    async fn after_first_version(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        on_ready: &OnceCallback,
    ) {
        if let Err(err) = self.finish(ctx, id, on_ready).await {
            self.fail(ctx, id, &err, on_ready).await;
        }
    }

    async fn finish(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        on_ready: &OnceCallback,
    ) -> FactoryResult<()> {
        if self.in_progress(ctx, id).await?.is_none() {
            return Ok(());
        }
        let initial = SemanticVersion::INITIAL.to_string();
        let version = self
            .versions
            .implementation_versions(ctx, id)
            .await?
            .into_iter()
            .find(|v| v.version == initial)
            .ok_or_else(|| FactoryError::not_found(ResourceKind::ImplementationVersion, &initial))?;
        version.ensure_not_errored()?;
        version.ensure_ready()?;

        self.inventory
            .update_status::<Implementation>(ctx, id, Status::Ready)
            .await?;
        info!(implementation_id = %id, "implementation ready");
        on_ready.fire().await;
        Ok(())
    }

    /// Build a further version of a READY implementation.
    pub async fn add_version(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        version: &str,
        on_ready: Callback,
    ) -> FactoryResult<Provisioning<ImplementationVersion>> {
        let implementation: Implementation = self.inventory.require(ctx, id).await?;
        self.versions
            .create_implementation_version(ctx, &implementation, version, on_ready)
            .await
    }

    /// Versions of an implementation.
    pub async fn versions(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
    ) -> FactoryResult<Vec<ImplementationVersion>> {
        self.versions.implementation_versions(ctx, id).await
    }

    /// Implementations of a component.
    pub async fn list(
        &self,
        ctx: &CallerContext,
        component_id: &ResourceId,
    ) -> FactoryResult<Vec<Implementation>> {
        self.inventory.owned(ctx, component_id).await
    }

    /// Get an implementation.
    pub async fn get(&self, ctx: &CallerContext, id: &ResourceId) -> FactoryResult<Implementation> {
        self.inventory.require(ctx, id).await
    }

    /// Delete an implementation with its versions, pipeline and repository.
    pub async fn delete(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        purge: bool,
    ) -> FactoryResult<()> {
        let Some(implementation) = self.inventory.deletable::<Implementation>(ctx, id).await? else {
            debug!(implementation_id = %id, "implementation already deleted");
            return Ok(());
        };

        let versions = self.versions.implementation_versions(ctx, id).await?;
        settle_all(
            versions
                .iter()
                .map(|version| self.versions.delete_implementation_version(ctx, version.id())),
        )
        .await?;

        if let Some(pipeline) = self.pipelines.find_by_owner(ctx, id).await? {
            self.pipelines.delete(ctx, pipeline.id()).await?;
        }
        if let Some(repository) = self.repositories.find_by_owner(ctx, id).await? {
            self.repositories.delete(ctx, repository.id(), purge).await?;
        }
        self.inventory.retire::<Implementation>(ctx, id).await?;

        info!(implementation_id = %id, name = %implementation.name, "implementation deleted");
        Ok(())
    }
}
