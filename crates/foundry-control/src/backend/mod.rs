//! Remote systems the engine provisions against.
//!
//! Three contracts are consumed: a version-control backend hosting
//! repositories, a CI backend running pipelines, and a code generator
//! producing source trees. Each has an in-memory implementation for
//! testing and an HTTP client for the real service.

mod http;
mod memory;

pub use http::{HttpCodeGenerator, HttpContinuousIntegration, HttpVersionControl};
pub use memory::{BuildOutcome, MemoryCi, MemoryGenerator, MemoryVersionControl};

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archive::SourceTree;
use crate::context::CallerContext;
use crate::error::FactoryResult;
use crate::types::{BuildNumber, BuildStatus, Language, LibraryKind, Template};

/// A repository materialised by the version-control backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRepository {
    /// Clone URL.
    pub remote_url: String,
}

/// Files to commit to one branch, optionally tagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    /// Target branch.
    pub branch: String,
    /// Commit message.
    pub message: String,
    /// Tag to place on the commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Files to write.
    pub files: SourceTree,
}

/// A commit in a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    /// Commit hash.
    pub id: String,
    /// Commit message.
    pub message: String,
    /// Principal that committed.
    pub author: String,
    /// When the commit was made.
    pub created_at: DateTime<Utc>,
}

/// A branch in a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchInfo {
    /// Branch name.
    pub name: String,
    /// Head commit.
    pub head: String,
}

/// Version-control backend.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Create a repository at `path` writable by `deploy_keys`.
    async fn create_repository(
        &self,
        ctx: &CallerContext,
        path: &str,
        deploy_keys: &[String],
    ) -> FactoryResult<RemoteRepository>;

    /// Delete the repository at `path` and its storage. A missing repository
    /// is not an error.
    async fn delete_repository(&self, ctx: &CallerContext, path: &str) -> FactoryResult<()>;

    /// Commit files, optionally tagging the commit.
    ///
    /// Fails with [`FactoryError::PreconditionFailed`] if the tag already
    /// exists.
    ///
    /// [`FactoryError::PreconditionFailed`]: crate::FactoryError::PreconditionFailed
    async fn commit(
        &self,
        ctx: &CallerContext,
        path: &str,
        request: &CommitRequest,
    ) -> FactoryResult<CommitInfo>;

    /// Branches of the repository.
    async fn list_branches(&self, ctx: &CallerContext, path: &str)
        -> FactoryResult<Vec<BranchInfo>>;

    /// Commits on `branch`, newest first.
    async fn list_commits(
        &self,
        ctx: &CallerContext,
        path: &str,
        branch: &str,
    ) -> FactoryResult<Vec<CommitInfo>>;

    /// Content of `file` at `reference` (branch or tag).
    async fn get_file(
        &self,
        ctx: &CallerContext,
        path: &str,
        file: &str,
        reference: &str,
    ) -> FactoryResult<String>;
}

/// Pipeline registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRegistration {
    /// Pipeline name.
    pub name: String,
    /// Pipeline path.
    pub path: String,
    /// Repository clone URL.
    pub remote_url: String,
    /// Build template.
    pub template: Template,
    /// Credential used to check out the repository.
    pub credential_id: String,
}

/// A pipeline registered with the CI backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPipeline {
    /// Name of the CI backend.
    pub provider: String,
    /// Identity of the pipeline inside the CI backend.
    pub provider_id: String,
}

/// Build submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    /// Branch or tag to build.
    pub reference: String,
    /// Repository clone URL.
    pub remote_url: String,
    /// Extra build arguments.
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

/// A build as listed by the CI backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    /// Build number.
    pub number: BuildNumber,
    /// Branch or tag built.
    pub reference: String,
    /// Current status.
    pub status: BuildStatus,
}

/// CI backend.
#[async_trait]
pub trait ContinuousIntegration: Send + Sync {
    /// Register a pipeline.
    async fn register_pipeline(
        &self,
        ctx: &CallerContext,
        registration: &PipelineRegistration,
    ) -> FactoryResult<RegisteredPipeline>;

    /// Submit a build. Returns as soon as a build number is assigned.
    async fn submit_build(
        &self,
        ctx: &CallerContext,
        provider_id: &str,
        request: &BuildRequest,
    ) -> FactoryResult<BuildNumber>;

    /// Status of one build.
    async fn build_status(
        &self,
        ctx: &CallerContext,
        provider_id: &str,
        number: BuildNumber,
    ) -> FactoryResult<BuildStatus>;

    /// Builds of `reference`.
    async fn list_builds(
        &self,
        ctx: &CallerContext,
        provider_id: &str,
        reference: &str,
    ) -> FactoryResult<Vec<BuildSummary>>;

    /// Delete a pipeline. A missing pipeline is not an error.
    async fn delete_pipeline(&self, ctx: &CallerContext, provider_id: &str) -> FactoryResult<()>;
}

/// What a generation run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "kind")]
pub enum GenerationTarget {
    /// A library binding of the given kind.
    Library(LibraryKind),
    /// A service implementation.
    Service,
}

/// Code generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    /// API spec content.
    pub spec: String,
    /// Target language.
    pub language: Language,
    /// What to generate.
    pub target: GenerationTarget,
    /// Artifact name.
    pub artifact_name: String,
    /// Artifact group.
    pub artifact_group: String,
    /// Artifact version.
    pub version: String,
}

/// Code generator. Both operations return a tar.zst archive.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Generate sources from an API spec.
    async fn generate(&self, ctx: &CallerContext, request: &GenerationRequest)
        -> FactoryResult<Bytes>;

    /// Render the named template.
    async fn render_template(
        &self,
        ctx: &CallerContext,
        template: &str,
        args: &BTreeMap<String, String>,
    ) -> FactoryResult<Bytes>;
}
