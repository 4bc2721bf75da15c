//! Read-only queries against an implementation's repository and pipeline.
//!
//! Every query first proves that the referenced repository or pipeline
//! belongs to an existing implementation.

use crate::backend::{BranchInfo, BuildSummary, CommitInfo};
use crate::context::CallerContext;
use crate::error::{FactoryError, FactoryResult};
use crate::inventory::Inventory;
use crate::model::{Implementation, Pipeline, ResourceKind, SourceRepository};
use crate::pipeline::PipelineProvisioner;
use crate::repository::RepositoryProvisioner;
use crate::types::ResourceId;

/// Branch, commit and build queries.
#[derive(Clone)]
pub struct QueryService {
    inventory: Inventory,
    repositories: RepositoryProvisioner,
    pipelines: PipelineProvisioner,
}

impl QueryService {
    /// Create a service.
    pub fn new(
        inventory: Inventory,
        repositories: RepositoryProvisioner,
        pipelines: PipelineProvisioner,
    ) -> Self {
        Self {
            inventory,
            repositories,
            pipelines,
        }
    }

    /// Branches of an implementation's repository.
    pub async fn branches(
        &self,
        ctx: &CallerContext,
        implementation_id: &ResourceId,
        repository_id: &ResourceId,
    ) -> FactoryResult<Vec<BranchInfo>> {
        let repository = self.owned_repository(ctx, implementation_id, repository_id).await?;
        self.repositories.get_branches(ctx, &repository).await
    }

    /// Commits on `branch` of an implementation's repository.
    pub async fn commits(
        &self,
        ctx: &CallerContext,
        implementation_id: &ResourceId,
        repository_id: &ResourceId,
        branch: &str,
    ) -> FactoryResult<Vec<CommitInfo>> {
        let repository = self.owned_repository(ctx, implementation_id, repository_id).await?;
        self.repositories.get_commits(ctx, &repository, branch).await
    }

    /// Builds of `reference` on an implementation's pipeline.
    pub async fn builds(
        &self,
        ctx: &CallerContext,
        implementation_id: &ResourceId,
        pipeline_id: &ResourceId,
        reference: &str,
    ) -> FactoryResult<Vec<BuildSummary>> {
        self.inventory
            .require::<Implementation>(ctx, implementation_id)
            .await?;
        let pipeline: Pipeline = self.inventory.require(ctx, pipeline_id).await?;
        if pipeline.owner != *implementation_id {
            return Err(FactoryError::not_found(ResourceKind::Pipeline, pipeline_id));
        }
        self.pipelines.list_builds(ctx, &pipeline, reference).await
    }

    async fn owned_repository(
        &self,
        ctx: &CallerContext,
        implementation_id: &ResourceId,
        repository_id: &ResourceId,
    ) -> FactoryResult<SourceRepository> {
        self.inventory
            .require::<Implementation>(ctx, implementation_id)
            .await?;
        let repository: SourceRepository = self.inventory.require(ctx, repository_id).await?;
        if repository.owner != *implementation_id {
            return Err(FactoryError::not_found(
                ResourceKind::SourceRepository,
                repository_id,
            ));
        }
        Ok(repository)
    }
}
