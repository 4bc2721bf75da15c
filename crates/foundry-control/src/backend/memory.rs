//! In-process backends for testing.
//!
//! Each backend keeps its state behind a lock and exposes a few knobs so
//! tests can script failures and build outcomes.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use crate::archive::SourceTree;
use crate::context::CallerContext;
use crate::error::{FactoryError, FactoryResult};
use crate::types::{BuildNumber, BuildStatus, ResourceId};

use super::{
    BranchInfo, BuildRequest, BuildSummary, CodeGenerator, CommitInfo, CommitRequest,
    ContinuousIntegration, GenerationRequest, GenerationTarget, PipelineRegistration,
    RegisteredPipeline, RemoteRepository, VersionControl,
};

fn poisoned() -> FactoryError {
    FactoryError::internal("lock poisoned")
}

// =============================================================================
// Version control
// =============================================================================

#[derive(Debug, Default)]
struct HostedRepository {
    deploy_keys: Vec<String>,
    /// Commits per branch, oldest first.
    commits: HashMap<String, Vec<CommitInfo>>,
    /// Files per branch or tag.
    snapshots: HashMap<String, BTreeMap<String, String>>,
    tags: Vec<String>,
}

/// In-memory version-control backend.
#[derive(Debug, Default)]
pub struct MemoryVersionControl {
    repositories: RwLock<HashMap<String, HostedRepository>>,
    fail_creation: AtomicBool,
}

impl MemoryVersionControl {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent repository creation fail.
    pub fn fail_repository_creation(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::SeqCst);
    }

    /// True if a repository exists at `path`.
    #[must_use]
    pub fn repository_exists(&self, path: &str) -> bool {
        self.repositories
            .read()
            .map(|repos| repos.contains_key(path))
            .unwrap_or(false)
    }

    /// Number of hosted repositories.
    #[must_use]
    pub fn repository_count(&self) -> usize {
        self.repositories.read().map(|repos| repos.len()).unwrap_or(0)
    }

    /// Deploy keys of the repository at `path`.
    #[must_use]
    pub fn deploy_keys(&self, path: &str) -> Vec<String> {
        self.repositories
            .read()
            .ok()
            .and_then(|repos| repos.get(path).map(|repo| repo.deploy_keys.clone()))
            .unwrap_or_default()
    }

    /// Number of commits across all branches of `path`.
    #[must_use]
    pub fn commit_count(&self, path: &str) -> usize {
        self.repositories
            .read()
            .ok()
            .and_then(|repos| {
                repos
                    .get(path)
                    .map(|repo| repo.commits.values().map(Vec::len).sum())
            })
            .unwrap_or(0)
    }

    /// Tags of `path` in creation order.
    #[must_use]
    pub fn tags(&self, path: &str) -> Vec<String> {
        self.repositories
            .read()
            .ok()
            .and_then(|repos| repos.get(path).map(|repo| repo.tags.clone()))
            .unwrap_or_default()
    }

    fn remote_url(path: &str) -> String {
        format!("memory://vcs/{path}.git")
    }
}

fn missing_repository(path: &str) -> FactoryError {
    FactoryError::backend("vcs", format!("repository '{path}' does not exist"))
}

#[async_trait]
impl VersionControl for MemoryVersionControl {
    async fn create_repository(
        &self,
        _ctx: &CallerContext,
        path: &str,
        deploy_keys: &[String],
    ) -> FactoryResult<RemoteRepository> {
        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(FactoryError::backend(
                "vcs",
                format!("cannot create repository '{path}'"),
            ));
        }

        let mut repos = self.repositories.write().map_err(|_| poisoned())?;
        let repo = repos.entry(path.to_owned()).or_default();
        for key in deploy_keys {
            if !repo.deploy_keys.contains(key) {
                repo.deploy_keys.push(key.clone());
            }
        }

        Ok(RemoteRepository {
            remote_url: Self::remote_url(path),
        })
    }

    async fn delete_repository(&self, _ctx: &CallerContext, path: &str) -> FactoryResult<()> {
        let mut repos = self.repositories.write().map_err(|_| poisoned())?;
        repos.remove(path);
        Ok(())
    }

    async fn commit(
        &self,
        ctx: &CallerContext,
        path: &str,
        request: &CommitRequest,
    ) -> FactoryResult<CommitInfo> {
        let mut repos = self.repositories.write().map_err(|_| poisoned())?;
        let repo = repos.get_mut(path).ok_or_else(|| missing_repository(path))?;

        if let Some(ref tag) = request.tag {
            if repo.tags.contains(tag) {
                return Err(FactoryError::PreconditionFailed(format!(
                    "tag '{tag}' already exists in '{path}'"
                )));
            }
        }

        let commit = CommitInfo {
            id: ResourceId::generate().to_string(),
            message: request.message.clone(),
            author: ctx.principal().to_owned(),
            created_at: Utc::now(),
        };

        let snapshot = repo.snapshots.entry(request.branch.clone()).or_default();
        for (file, content) in request.files.files() {
            snapshot.insert(file.to_owned(), content.to_owned());
        }
        let snapshot = snapshot.clone();

        repo.commits
            .entry(request.branch.clone())
            .or_default()
            .push(commit.clone());

        if let Some(ref tag) = request.tag {
            repo.tags.push(tag.clone());
            repo.snapshots.insert(tag.clone(), snapshot);
        }

        Ok(commit)
    }

    async fn list_branches(
        &self,
        _ctx: &CallerContext,
        path: &str,
    ) -> FactoryResult<Vec<BranchInfo>> {
        let repos = self.repositories.read().map_err(|_| poisoned())?;
        let repo = repos.get(path).ok_or_else(|| missing_repository(path))?;

        let mut branches: Vec<_> = repo
            .commits
            .iter()
            .filter_map(|(name, commits)| {
                commits.last().map(|head| BranchInfo {
                    name: name.clone(),
                    head: head.id.clone(),
                })
            })
            .collect();
        branches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(branches)
    }

    async fn list_commits(
        &self,
        _ctx: &CallerContext,
        path: &str,
        branch: &str,
    ) -> FactoryResult<Vec<CommitInfo>> {
        let repos = self.repositories.read().map_err(|_| poisoned())?;
        let repo = repos.get(path).ok_or_else(|| missing_repository(path))?;

        Ok(repo
            .commits
            .get(branch)
            .map(|commits| commits.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_file(
        &self,
        _ctx: &CallerContext,
        path: &str,
        file: &str,
        reference: &str,
    ) -> FactoryResult<String> {
        let repos = self.repositories.read().map_err(|_| poisoned())?;
        let repo = repos.get(path).ok_or_else(|| missing_repository(path))?;

        repo.snapshots
            .get(reference)
            .and_then(|snapshot| snapshot.get(file))
            .cloned()
            .ok_or_else(|| {
                FactoryError::backend(
                    "vcs",
                    format!("'{file}' not found at '{reference}' in '{path}'"),
                )
            })
    }
}

// =============================================================================
// CI
// =============================================================================

/// Scripted result of a build in [`MemoryCi`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Finish with SUCCESS.
    #[default]
    Succeed,
    /// Finish with FAILED.
    Fail,
    /// Stay PROCESSING forever.
    Hang,
}

#[derive(Debug)]
struct Build {
    number: BuildNumber,
    request: BuildRequest,
    outcome: BuildOutcome,
    checks: u32,
}

impl Build {
    fn status(&self) -> BuildStatus {
        if self.checks == 0 {
            return BuildStatus::Scheduled;
        }
        match self.outcome {
            _ if self.checks < 2 => BuildStatus::Processing,
            BuildOutcome::Succeed => BuildStatus::Success,
            BuildOutcome::Fail => BuildStatus::Failed,
            BuildOutcome::Hang => BuildStatus::Processing,
        }
    }
}

#[derive(Debug)]
struct HostedPipeline {
    registration: PipelineRegistration,
    builds: Vec<Build>,
}

/// In-memory CI backend.
///
/// A build reports SCHEDULED until its status is first checked, PROCESSING
/// on the first check and its scripted [`BuildOutcome`] from the second
/// check on.
#[derive(Debug, Default)]
pub struct MemoryCi {
    pipelines: RwLock<HashMap<String, HostedPipeline>>,
    outcomes: Mutex<HashMap<String, BuildOutcome>>,
    default_outcome: Mutex<BuildOutcome>,
    fail_registration: AtomicBool,
    failing_checks: AtomicUsize,
    status_checks: AtomicUsize,
}

impl MemoryCi {
    /// Create an empty backend where every build succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcome of builds of pipelines with no specific outcome.
    pub fn set_default_outcome(&self, outcome: BuildOutcome) {
        if let Ok(mut default) = self.default_outcome.lock() {
            *default = outcome;
        }
    }

    /// Outcome of builds of the pipeline registered at `path`.
    pub fn set_outcome(&self, path: impl Into<String>, outcome: BuildOutcome) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.insert(path.into(), outcome);
        }
    }

    /// Make every subsequent registration fail.
    pub fn fail_registration(&self, fail: bool) {
        self.fail_registration.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` status checks fail.
    pub fn fail_next_status_checks(&self, count: usize) {
        self.failing_checks.store(count, Ordering::SeqCst);
    }

    /// Number of status checks served so far, failed ones included.
    #[must_use]
    pub fn status_checks(&self) -> usize {
        self.status_checks.load(Ordering::SeqCst)
    }

    /// Number of registered pipelines.
    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.read().map(|p| p.len()).unwrap_or(0)
    }

    /// Build requests submitted to the pipeline registered at `path`.
    #[must_use]
    pub fn submitted_builds(&self, path: &str) -> Vec<BuildRequest> {
        self.pipelines
            .read()
            .map(|pipelines| {
                pipelines
                    .values()
                    .filter(|p| p.registration.path == path)
                    .flat_map(|p| p.builds.iter().map(|b| b.request.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn outcome_for(&self, path: &str) -> BuildOutcome {
        let scripted = self
            .outcomes
            .lock()
            .ok()
            .and_then(|outcomes| outcomes.get(path).copied());
        scripted
            .or_else(|| self.default_outcome.lock().ok().map(|d| *d))
            .unwrap_or_default()
    }
}

fn missing_pipeline(provider_id: &str) -> FactoryError {
    FactoryError::backend("ci", format!("pipeline '{provider_id}' does not exist"))
}

#[async_trait]
impl ContinuousIntegration for MemoryCi {
    async fn register_pipeline(
        &self,
        _ctx: &CallerContext,
        registration: &PipelineRegistration,
    ) -> FactoryResult<RegisteredPipeline> {
        if self.fail_registration.load(Ordering::SeqCst) {
            return Err(FactoryError::backend(
                "ci",
                format!("cannot register pipeline '{}'", registration.path),
            ));
        }

        let provider_id = format!("job-{}", ResourceId::generate());
        let mut pipelines = self.pipelines.write().map_err(|_| poisoned())?;
        pipelines.insert(
            provider_id.clone(),
            HostedPipeline {
                registration: registration.clone(),
                builds: Vec::new(),
            },
        );

        Ok(RegisteredPipeline {
            provider: "memory".to_owned(),
            provider_id,
        })
    }

    async fn submit_build(
        &self,
        _ctx: &CallerContext,
        provider_id: &str,
        request: &BuildRequest,
    ) -> FactoryResult<BuildNumber> {
        let mut pipelines = self.pipelines.write().map_err(|_| poisoned())?;
        let pipeline = pipelines
            .get_mut(provider_id)
            .ok_or_else(|| missing_pipeline(provider_id))?;

        let outcome = self.outcome_for(&pipeline.registration.path);
        let number = BuildNumber(pipeline.builds.len() as u64 + 1);
        pipeline.builds.push(Build {
            number,
            request: request.clone(),
            outcome,
            checks: 0,
        });
        Ok(number)
    }

    async fn build_status(
        &self,
        _ctx: &CallerContext,
        provider_id: &str,
        number: BuildNumber,
    ) -> FactoryResult<BuildStatus> {
        self.status_checks.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failing_checks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(FactoryError::backend("ci", "status endpoint unavailable"));
        }

        let mut pipelines = self.pipelines.write().map_err(|_| poisoned())?;
        let build = pipelines
            .get_mut(provider_id)
            .ok_or_else(|| missing_pipeline(provider_id))?
            .builds
            .iter_mut()
            .find(|b| b.number == number)
            .ok_or_else(|| {
                FactoryError::backend("ci", format!("build {number} of '{provider_id}' not found"))
            })?;

        build.checks += 1;
        Ok(build.status())
    }

    async fn list_builds(
        &self,
        _ctx: &CallerContext,
        provider_id: &str,
        reference: &str,
    ) -> FactoryResult<Vec<BuildSummary>> {
        let pipelines = self.pipelines.read().map_err(|_| poisoned())?;
        let pipeline = pipelines
            .get(provider_id)
            .ok_or_else(|| missing_pipeline(provider_id))?;

        Ok(pipeline
            .builds
            .iter()
            .filter(|b| b.request.reference == reference)
            .map(|b| BuildSummary {
                number: b.number,
                reference: b.request.reference.clone(),
                status: b.status(),
            })
            .collect())
    }

    async fn delete_pipeline(&self, _ctx: &CallerContext, provider_id: &str) -> FactoryResult<()> {
        let mut pipelines = self.pipelines.write().map_err(|_| poisoned())?;
        pipelines.remove(provider_id);
        Ok(())
    }
}

// =============================================================================
// Code generator
// =============================================================================

/// In-memory code generator producing small deterministic source trees.
#[derive(Debug, Default)]
pub struct MemoryGenerator {
    fail: AtomicBool,
    generated: Mutex<Vec<GenerationRequest>>,
}

impl MemoryGenerator {
    /// Create a generator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail.
    pub fn fail_generation(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Requests served by [`CodeGenerator::generate`].
    #[must_use]
    pub fn generated(&self) -> Vec<GenerationRequest> {
        self.generated.lock().map(|g| g.clone()).unwrap_or_default()
    }

    fn check(&self) -> FactoryResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FactoryError::backend("generator", "generation failed"));
        }
        Ok(())
    }
}

#[async_trait]
impl CodeGenerator for MemoryGenerator {
    async fn generate(
        &self,
        _ctx: &CallerContext,
        request: &GenerationRequest,
    ) -> FactoryResult<Bytes> {
        self.check()?;
        if let Ok(mut generated) = self.generated.lock() {
            generated.push(request.clone());
        }

        let target = match request.target {
            GenerationTarget::Library(kind) => kind.as_str().to_lowercase(),
            GenerationTarget::Service => "service".to_owned(),
        };
        let tree = SourceTree::new()
            .with_file(
                "README.md",
                format!(
                    "# {} {}\n\n{} {target} generated for {}\n",
                    request.artifact_group, request.artifact_name, request.language, request.version
                ),
            )
            .with_file(
                format!("src/{}/api.yaml", request.artifact_name),
                request.spec.clone(),
            );

        tree.to_archive().await
    }

    async fn render_template(
        &self,
        _ctx: &CallerContext,
        template: &str,
        args: &BTreeMap<String, String>,
    ) -> FactoryResult<Bytes> {
        self.check()?;

        let settings: String = args
            .iter()
            .map(|(key, value)| format!("{key}={value}\n"))
            .collect();
        SourceTree::new()
            .with_file("TEMPLATE", template)
            .with_file("build.properties", settings)
            .to_archive()
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{Language, Template};

    fn ctx() -> CallerContext {
        CallerContext::new("tester")
    }

    fn commit(tag: Option<&str>, content: &str) -> CommitRequest {
        CommitRequest {
            branch: "master".to_owned(),
            message: "update".to_owned(),
            tag: tag.map(ToOwned::to_owned),
            files: SourceTree::single("api.yaml", content),
        }
    }

    #[tokio::test]
    async fn duplicate_tag_is_a_precondition_failure() {
        let vcs = MemoryVersionControl::new();
        vcs.create_repository(&ctx(), "acme/orders/api", &["key".to_owned()])
            .await
            .unwrap();

        vcs.commit(&ctx(), "acme/orders/api", &commit(Some("1.0.0"), "a"))
            .await
            .unwrap();
        let err = vcs
            .commit(&ctx(), "acme/orders/api", &commit(Some("1.0.0"), "a"))
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());

        let content = vcs
            .get_file(&ctx(), "acme/orders/api", "api.yaml", "1.0.0")
            .await
            .unwrap();
        assert_eq!(content, "a");
        assert_eq!(vcs.commit_count("acme/orders/api"), 1);
    }

    #[tokio::test]
    async fn tags_snapshot_the_branch() {
        let vcs = MemoryVersionControl::new();
        vcs.create_repository(&ctx(), "r", &[]).await.unwrap();
        vcs.commit(&ctx(), "r", &commit(Some("1.0.0"), "v1")).await.unwrap();
        vcs.commit(&ctx(), "r", &commit(None, "v2")).await.unwrap();

        assert_eq!(vcs.get_file(&ctx(), "r", "api.yaml", "1.0.0").await.unwrap(), "v1");
        assert_eq!(vcs.get_file(&ctx(), "r", "api.yaml", "master").await.unwrap(), "v2");

        let commits = vcs.list_commits(&ctx(), "r", "master").await.unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].author, "tester");
    }

    #[tokio::test]
    async fn scripted_build_outcomes() {
        let ci = MemoryCi::new();
        ci.set_outcome("acme/orders-impl", BuildOutcome::Fail);

        let registration = PipelineRegistration {
            name: "orders-impl".to_owned(),
            path: "acme/orders-impl".to_owned(),
            remote_url: "memory://vcs/acme/orders-impl.git".to_owned(),
            template: Template::for_implementation(Language::Java).unwrap(),
            credential_id: "key".to_owned(),
        };
        let registered = ci.register_pipeline(&ctx(), &registration).await.unwrap();

        let request = BuildRequest {
            reference: "1.0.0".to_owned(),
            remote_url: registration.remote_url.clone(),
            args: BTreeMap::new(),
        };
        let number = ci
            .submit_build(&ctx(), &registered.provider_id, &request)
            .await
            .unwrap();
        assert_eq!(number, BuildNumber(1));

        let id = &registered.provider_id;
        assert_eq!(ci.build_status(&ctx(), id, number).await.unwrap(), BuildStatus::Processing);
        assert_eq!(ci.build_status(&ctx(), id, number).await.unwrap(), BuildStatus::Failed);

        let builds = ci.list_builds(&ctx(), id, "1.0.0").await.unwrap();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn injected_status_failures_are_consumed() {
        let ci = MemoryCi::new();
        ci.fail_next_status_checks(1);

        let err = ci
            .build_status(&ctx(), "job-x", BuildNumber(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::Backend { backend: "ci", .. }));

        let err = ci
            .build_status(&ctx(), "job-x", BuildNumber(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert_eq!(ci.status_checks(), 2);
    }

    #[tokio::test]
    async fn generated_archive_contains_spec() {
        let generator = MemoryGenerator::new();
        let request = GenerationRequest {
            spec: "openapi: 3.0.0".to_owned(),
            language: Language::Python,
            target: GenerationTarget::Library(crate::types::LibraryKind::Client),
            artifact_name: "orders".to_owned(),
            artifact_group: "com.acme".to_owned(),
            version: "1.0.0".to_owned(),
        };

        let archive = generator.generate(&ctx(), &request).await.unwrap();
        let tree = SourceTree::from_archive(archive).await.unwrap();
        assert_eq!(tree.get("src/orders/api.yaml"), Some("openapi: 3.0.0"));
        assert_eq!(generator.generated().len(), 1);
    }
}
