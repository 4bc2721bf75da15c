//! Pipeline provisioning and build monitoring.
//!
//! Builds are submitted without waiting. When the caller wants to know the
//! outcome, a detached poll loop checks the build status at a fixed interval
//! until it is terminal or the monitoring timeout elapses. A timeout is a
//! monitoring failure: the pipeline becomes UNSTABLE and the caller's
//! callback is not invoked.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{BuildRequest, BuildSummary, ContinuousIntegration, PipelineRegistration};
use crate::config::BuildConfig;
use crate::context::CallerContext;
use crate::error::{FactoryError, FactoryResult};
use crate::inventory::Inventory;
use crate::model::{Header, Pipeline, PipelinePatch, ResourceKind, SourceRepository, StatusPatch};
use crate::resource::Resource;
use crate::task::{detach, Callback, Provisioning};
use crate::types::{keys, BuildNumber, BuildStatus, ResourceId, Status, Template};

type Watcher = Box<dyn FnOnce(BuildNumber, BuildStatus) -> BoxFuture<'static, ()> + Send>;

/// Continuation invoked with the terminal status of a build.
pub struct OnBuildFinished(Watcher);

impl OnBuildFinished {
    /// Wrap an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(BuildNumber, BuildStatus) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self(Box::new(move |number, status| f(number, status).boxed()))
    }

    async fn fire(self, number: BuildNumber, status: BuildStatus) {
        (self.0)(number, status).await;
    }
}

impl std::fmt::Debug for OnBuildFinished {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OnBuildFinished")
    }
}

/// Parameters of a new pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSpec<'a> {
    /// Owning resource.
    pub owner: &'a ResourceId,
    /// Pipeline name.
    pub name: &'a str,
    /// Pipeline path.
    pub path: &'a str,
    /// Build template.
    pub template: Template,
    /// Credential used to check out the repository.
    pub credential_id: &'a str,
}

/// Registers pipelines and runs builds.
#[derive(Clone)]
pub struct PipelineProvisioner {
    inventory: Inventory,
    ci: Arc<dyn ContinuousIntegration>,
    poll_interval: Duration,
    timeout: Duration,
}

impl PipelineProvisioner {
    /// Create a provisioner.
    pub fn new(
        inventory: Inventory,
        ci: Arc<dyn ContinuousIntegration>,
        build: &BuildConfig,
    ) -> Self {
        Self {
            inventory,
            ci,
            poll_interval: build.poll_interval,
            timeout: build.timeout,
        }
    }

    /// Register a PENDING pipeline for a READY repository and register it
    /// with the CI backend in the background.
    ///
    /// `on_ready` fires when the background step ends, whether the pipeline
    /// became READY or ERROR.
    pub async fn create(
        &self,
        ctx: &CallerContext,
        spec: PipelineSpec<'_>,
        repository: &SourceRepository,
        on_ready: Callback,
    ) -> FactoryResult<Provisioning<Pipeline>> {
        if spec.name.trim().is_empty() || spec.path.trim().is_empty() {
            return Err(FactoryError::validation("pipeline name and path must not be empty"));
        }
        if spec.credential_id.is_empty() {
            return Err(FactoryError::validation("pipeline credential must not be empty"));
        }
        if spec.template.is_empty() {
            return Err(FactoryError::validation("pipeline template must not be empty"));
        }
        repository.ensure_ready()?;
        let remote_url = repository
            .remote()
            .ok_or_else(|| {
                FactoryError::validation(format!(
                    "repository {} has no remote URL",
                    repository.id()
                ))
            })?
            .to_owned();
        if self
            .inventory
            .by_path::<Pipeline>(ctx, spec.path)
            .await?
            .is_some()
        {
            return Err(FactoryError::already_exists(ResourceKind::Pipeline, spec.path));
        }

        let pipeline = self
            .inventory
            .pipelines
            .insert(
                ctx,
                Pipeline {
                    header: Header::pending(),
                    owner: spec.owner.clone(),
                    repository_id: repository.id().clone(),
                    name: spec.name.to_owned(),
                    path: spec.path.to_owned(),
                    template: spec.template.clone(),
                    provider: None,
                    provider_id: None,
                },
            )
            .await?;

        info!(
            pipeline_id = %pipeline.id(),
            path = %pipeline.path,
            template = %pipeline.template,
            "pipeline registered"
        );

        let registration = PipelineRegistration {
            name: pipeline.name.clone(),
            path: pipeline.path.clone(),
            remote_url,
            template: pipeline.template.clone(),
            credential_id: spec.credential_id.to_owned(),
        };

        let this = self.clone();
        let task_ctx = ctx.clone();
        let id = pipeline.id().clone();
        let task = detach(ctx, "create_pipeline", pipeline.id(), async move {
            match this.register(&task_ctx, &id, &registration).await {
                Ok(ready) => info!(
                    pipeline_id = %id,
                    provider_id = ready.provider_id.as_deref().unwrap_or_default(),
                    "pipeline ready"
                ),
                Err(err) => this.inventory.manage_error::<Pipeline>(&task_ctx, &id, &err).await,
            }
            on_ready.fire().await;
        });

        Ok(Provisioning {
            resource: pipeline,
            task,
        })
    }

    async fn register(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        registration: &PipelineRegistration,
    ) -> FactoryResult<Pipeline> {
        let registered = self.ci.register_pipeline(ctx, registration).await?;

        self.inventory
            .patch::<Pipeline>(
                ctx,
                id,
                PipelinePatch {
                    common: StatusPatch::status(Status::Ready),
                    provider: Some(registered.provider),
                    provider_id: Some(registered.provider_id),
                },
            )
            .await
    }

    /// Submit a build of `reference` and return its number immediately.
    ///
    /// With `on_finished`, a detached poll loop watches the build and hands
    /// its terminal status to the callback.
    pub async fn build(
        &self,
        ctx: &CallerContext,
        pipeline: &Pipeline,
        reference: &str,
        args: BTreeMap<String, String>,
        on_finished: Option<OnBuildFinished>,
    ) -> FactoryResult<BuildNumber> {
        if pipeline.path.is_empty() {
            return Err(FactoryError::validation(format!(
                "pipeline {} has no path",
                pipeline.id()
            )));
        }
        let provider_id = provider_id(pipeline)?.to_owned();
        let repository: SourceRepository =
            self.inventory.require(ctx, &pipeline.repository_id).await?;
        let remote_url = repository.remote().ok_or_else(|| {
            FactoryError::validation(format!("repository {} has no remote URL", repository.id()))
        })?;

        let request = BuildRequest {
            reference: reference.to_owned(),
            remote_url: remote_url.to_owned(),
            args,
        };
        let number = self.ci.submit_build(ctx, &provider_id, &request).await?;

        self.inventory
            .patch::<Pipeline>(
                ctx,
                pipeline.id(),
                StatusPatch::metadata(keys::LAST_BUILD_NUMBER, number.to_string()),
            )
            .await?;

        info!(pipeline_id = %pipeline.id(), build = %number, reference, "build submitted");

        if let Some(on_finished) = on_finished {
            let this = self.clone();
            let task_ctx = ctx.clone();
            let pipeline_id = pipeline.id().clone();
            detach(ctx, "watch_build", pipeline.id(), async move {
                this.watch(&task_ctx, &pipeline_id, &provider_id, number, on_finished)
                    .await;
            });
        }

        Ok(number)
    }

    async fn watch(
        &self,
        ctx: &CallerContext,
        pipeline_id: &ResourceId,
        provider_id: &str,
        number: BuildNumber,
        on_finished: OnBuildFinished,
    ) {
        match self.poll_until_terminal(ctx, provider_id, number).await {
            Some(status) => {
                info!(pipeline_id = %pipeline_id, build = %number, %status, "build finished");
                self.restore_health(ctx, pipeline_id).await;
                on_finished.fire(number, status).await;
            }
            None => {
                warn!(
                    pipeline_id = %pipeline_id,
                    build = %number,
                    timeout_secs = self.timeout.as_secs(),
                    "build monitoring timed out"
                );
                if let Err(err) = self
                    .inventory
                    .update_status::<Pipeline>(ctx, pipeline_id, Status::Unstable)
                    .await
                {
                    warn!(
                        pipeline_id = %pipeline_id,
                        error = %err,
                        "failed to mark pipeline unstable"
                    );
                }
            }
        }
    }

    /// Put an UNSTABLE pipeline back to READY once one of its builds is seen
    /// to finish again.
    async fn restore_health(&self, ctx: &CallerContext, pipeline_id: &ResourceId) {
        let restored = match self.inventory.find::<Pipeline>(ctx, pipeline_id).await {
            Ok(Some(pipeline)) if pipeline.status() == Status::Unstable => {
                self.inventory
                    .update_status::<Pipeline>(ctx, pipeline_id, Status::Ready)
                    .await
            }
            Ok(_) => return,
            Err(err) => Err(err),
        };
        match restored {
            Ok(_) => info!(pipeline_id = %pipeline_id, "pipeline monitoring recovered"),
            Err(err) => {
                warn!(
                    pipeline_id = %pipeline_id,
                    error = %err,
                    "failed to restore pipeline status"
                );
            }
        }
    }

    /// Check the build status every poll interval until it is terminal.
    ///
    /// Returns `None` once the timeout has elapsed without a terminal status.
    /// Failed status checks are logged and retried.
    async fn poll_until_terminal(
        &self,
        ctx: &CallerContext,
        provider_id: &str,
        number: BuildNumber,
    ) -> Option<BuildStatus> {
        let started = Instant::now();

        loop {
            tokio::time::sleep(self.poll_interval).await;

            match self.ci.build_status(ctx, provider_id, number).await {
                Ok(status) if status.is_terminal() => return Some(status),
                Ok(status) => debug!(build = %number, %status, "build still running"),
                Err(err) => warn!(build = %number, error = %err, "build status check failed"),
            }

            if started.elapsed() >= self.timeout {
                return None;
            }
        }
    }

    /// Builds of `reference` for a registered pipeline.
    pub async fn list_builds(
        &self,
        ctx: &CallerContext,
        pipeline: &Pipeline,
        reference: &str,
    ) -> FactoryResult<Vec<BuildSummary>> {
        let provider_id = provider_id(pipeline)?;
        self.ci.list_builds(ctx, provider_id, reference).await
    }

    /// The pipeline owned by `owner`, if any.
    pub async fn find_by_owner(
        &self,
        ctx: &CallerContext,
        owner: &ResourceId,
    ) -> FactoryResult<Option<Pipeline>> {
        self.inventory.owned_one(ctx, owner).await
    }

    /// Unregister a pipeline from the CI backend and delete its record.
    pub async fn delete(&self, ctx: &CallerContext, id: &ResourceId) -> FactoryResult<()> {
        let Some(pipeline) = self.inventory.deletable::<Pipeline>(ctx, id).await? else {
            debug!(pipeline_id = %id, "pipeline already deleted");
            return Ok(());
        };

        if let Some(ref provider_id) = pipeline.provider_id {
            self.ci.delete_pipeline(ctx, provider_id).await?;
        }
        self.inventory.retire::<Pipeline>(ctx, id).await?;

        info!(pipeline_id = %id, path = %pipeline.path, "pipeline deleted");
        Ok(())
    }
}

/// Fail unless `pipeline` can take new builds.
///
/// An UNSTABLE pipeline only lost track of an earlier build and still builds.
pub(crate) fn ensure_buildable(pipeline: &Pipeline) -> FactoryResult<()> {
    if pipeline.status() == Status::Unstable {
        return Ok(());
    }
    pipeline.ensure_ready()
}

fn provider_id(pipeline: &Pipeline) -> FactoryResult<&str> {
    pipeline
        .provider_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| FactoryError::NotReady {
            kind: ResourceKind::Pipeline,
            id: pipeline.id().clone(),
            status: pipeline.status(),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::backend::{BuildOutcome, MemoryCi, MemoryVersionControl};
    use crate::repository::RepositoryProvisioner;
    use crate::types::{Language, LibraryKind};

    struct Fixture {
        inventory: Inventory,
        ci: Arc<MemoryCi>,
        pipelines: PipelineProvisioner,
        repository: SourceRepository,
    }

    fn ctx() -> CallerContext {
        CallerContext::new("tester").with_deploy_key("key")
    }

    async fn fixture(build: BuildConfig) -> Fixture {
        let inventory = Inventory::memory();
        let ci = Arc::new(MemoryCi::new());
        let repositories =
            RepositoryProvisioner::new(inventory.clone(), Arc::new(MemoryVersionControl::new()));
        let pipelines = PipelineProvisioner::new(inventory.clone(), ci.clone(), &build);

        let provisioning = repositories
            .create(&ctx(), &ResourceId::new("lib"), "lib", "acme/lib", vec![], Callback::none())
            .await
            .unwrap();
        let id = provisioning.resource.id().clone();
        provisioning.join().await.unwrap();
        let repository = inventory.require(&ctx(), &id).await.unwrap();

        Fixture {
            inventory,
            ci,
            pipelines,
            repository,
        }
    }

    fn spec<'a>(owner: &'a ResourceId) -> PipelineSpec<'a> {
        PipelineSpec {
            owner,
            name: "lib",
            path: "acme/lib",
            template: Template::for_library(Language::Java, LibraryKind::Client),
            credential_id: "key",
        }
    }

    async fn ready_pipeline(f: &Fixture) -> Pipeline {
        let owner = ResourceId::new("lib");
        let provisioning = f
            .pipelines
            .create(&ctx(), spec(&owner), &f.repository, Callback::none())
            .await
            .unwrap();
        let id = provisioning.resource.id().clone();
        provisioning.join().await.unwrap();
        f.inventory.require(&ctx(), &id).await.unwrap()
    }

    fn counting(
        counter: &Arc<AtomicUsize>,
        seen: Arc<std::sync::Mutex<Option<BuildStatus>>>,
    ) -> OnBuildFinished {
        let counter = Arc::clone(counter);
        OnBuildFinished::new(move |_, status| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut slot) = seen.lock() {
                *slot = Some(status);
            }
        })
    }

    #[tokio::test]
    async fn create_requires_ready_repository() {
        let f = fixture(BuildConfig::default()).await;
        let mut pending = f.repository.clone();
        pending.header.status = Status::Pending;

        let owner = ResourceId::new("lib");
        let err = f
            .pipelines
            .create(&ctx(), spec(&owner), &pending, Callback::none())
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::NotReady { .. }));

        let mut blank = spec(&owner);
        blank.credential_id = "";
        let err = f
            .pipelines
            .create(&ctx(), blank, &f.repository, Callback::none())
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::Validation(_)));
    }

    #[tokio::test]
    async fn registration_assigns_provider_identity() {
        let f = fixture(BuildConfig::default()).await;
        let pipeline = ready_pipeline(&f).await;

        assert!(pipeline.is_ready());
        assert_eq!(pipeline.provider.as_deref(), Some("memory"));
        assert!(pipeline.provider_id.is_some());
        assert_eq!(f.ci.pipeline_count(), 1);
    }

    #[tokio::test]
    async fn registration_failure_marks_error() {
        let f = fixture(BuildConfig::default()).await;
        f.ci.fail_registration(true);
        let pipeline = ready_pipeline(&f).await;
        assert!(pipeline.is_error());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loop_reports_terminal_status() {
        let f = fixture(BuildConfig::default()).await;
        let pipeline = ready_pipeline(&f).await;

        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(std::sync::Mutex::new(None));
        let number = f
            .pipelines
            .build(
                &ctx(),
                &pipeline,
                "1.0.0",
                BTreeMap::new(),
                Some(counting(&counter, seen.clone())),
            )
            .await
            .unwrap();
        assert_eq!(number, BuildNumber(1));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), Some(BuildStatus::Success));

        let pipeline: Pipeline = f.inventory.require(&ctx(), pipeline.id()).await.unwrap();
        assert_eq!(pipeline.metadata_value(keys::LAST_BUILD_NUMBER), Some("1"));
        assert!(pipeline.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loop_survives_transient_errors() {
        let f = fixture(BuildConfig::default()).await;
        let pipeline = ready_pipeline(&f).await;
        f.ci.fail_next_status_checks(3);

        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(std::sync::Mutex::new(None));
        f.pipelines
            .build(
                &ctx(),
                &pipeline,
                "1.0.0",
                BTreeMap::new(),
                Some(counting(&counter, seen.clone())),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5 * 30 + 1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(f.ci.status_checks(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_timeout_marks_pipeline_unstable_without_callback() {
        let f = fixture(BuildConfig::default()).await;
        f.ci.set_default_outcome(BuildOutcome::Hang);
        let pipeline = ready_pipeline(&f).await;

        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(std::sync::Mutex::new(None));
        f.pipelines
            .build(&ctx(), &pipeline, "1.0.0", BTreeMap::new(), Some(counting(&counter, seen)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(601)).await;
        // Let the watcher record the status change.
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(f.ci.status_checks(), 20);
        let pipeline: Pipeline = f.inventory.require(&ctx(), pipeline.id()).await.unwrap();
        assert_eq!(pipeline.status(), Status::Unstable);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_build_restores_unstable_pipeline() {
        let f = fixture(BuildConfig::default()).await;
        f.ci.set_default_outcome(BuildOutcome::Hang);
        let pipeline = ready_pipeline(&f).await;

        let hung = Arc::new(AtomicUsize::new(0));
        f.pipelines
            .build(
                &ctx(),
                &pipeline,
                "1.0.0",
                BTreeMap::new(),
                Some(counting(&hung, Arc::default())),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(631)).await;
        assert_eq!(hung.load(Ordering::SeqCst), 0);

        let unstable: Pipeline = f.inventory.require(&ctx(), pipeline.id()).await.unwrap();
        assert_eq!(unstable.status(), Status::Unstable);
        ensure_buildable(&unstable).unwrap();

        f.ci.set_default_outcome(BuildOutcome::Succeed);
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(std::sync::Mutex::new(None));
        f.pipelines
            .build(
                &ctx(),
                &unstable,
                "1.1.0",
                BTreeMap::new(),
                Some(counting(&counter, seen.clone())),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(121)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), Some(BuildStatus::Success));
        let pipeline: Pipeline = f.inventory.require(&ctx(), pipeline.id()).await.unwrap();
        assert!(pipeline.is_ready());
    }

    #[tokio::test]
    async fn build_without_watcher_returns_number() {
        let f = fixture(BuildConfig::default()).await;
        let pipeline = ready_pipeline(&f).await;

        let mut args = BTreeMap::new();
        args.insert("VERSION".to_owned(), "1.0.0".to_owned());
        f.pipelines
            .build(&ctx(), &pipeline, "master", args, None)
            .await
            .unwrap();

        let submitted = f.ci.submitted_builds("acme/lib");
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].args.get("VERSION").map(String::as_str), Some("1.0.0"));
        assert_eq!(submitted[0].remote_url, "memory://vcs/acme/lib.git");

        let builds = f.pipelines.list_builds(&ctx(), &pipeline, "master").await.unwrap();
        assert_eq!(builds.len(), 1);
    }

    #[tokio::test]
    async fn delete_unregisters_and_is_idempotent() {
        let f = fixture(BuildConfig::default()).await;
        let pipeline = ready_pipeline(&f).await;

        f.pipelines.delete(&ctx(), pipeline.id()).await.unwrap();
        f.pipelines.delete(&ctx(), pipeline.id()).await.unwrap();
        assert_eq!(f.ci.pipeline_count(), 0);
    }
}
