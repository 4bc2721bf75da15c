//! Library orchestration.
//!
//! A library is ready once its repository and then its pipeline are. Each
//! step's completion re-runs a readiness check; the checks are safe to run
//! any number of times and in any order.

use tracing::{debug, info};

use crate::context::CallerContext;
use crate::error::{FactoryError, FactoryResult};
use crate::inventory::{Filter, Inventory};
use crate::model::{
    Component, Header, Library, LibraryApiVersion, Pipeline, ResourceKind, SourceRepository,
};
use crate::pipeline::{PipelineProvisioner, PipelineSpec};
use crate::repository::{RepositoryLayout, RepositoryProvisioner};
use crate::resource::Resource;
use crate::rollup::RollupLocks;
use crate::task::{detach, settle_all, Callback, OnceCallback, Provisioning};
use crate::types::{keys, Language, LibraryKind, ResourceId, Status, Template};

/// Provisions the libraries of components.
#[derive(Clone)]
pub struct LibraryOrchestrator {
    inventory: Inventory,
    repositories: RepositoryProvisioner,
    pipelines: PipelineProvisioner,
    layout: RepositoryLayout,
    locks: RollupLocks,
}

impl LibraryOrchestrator {
    /// Create an orchestrator.
    pub fn new(
        inventory: Inventory,
        repositories: RepositoryProvisioner,
        pipelines: PipelineProvisioner,
        layout: RepositoryLayout,
    ) -> Self {
        Self {
            inventory,
            repositories,
            pipelines,
            layout,
            locks: RollupLocks::new(),
        }
    }

    /// Register a library of `component` for `language` and `kind`.
    ///
    /// Rejects a second library for the same pair. `on_ready` fires once the
    /// library is READY or has failed.
    pub async fn add(
        &self,
        ctx: &CallerContext,
        component: &Component,
        language: Language,
        kind: LibraryKind,
        on_ready: Callback,
    ) -> FactoryResult<Provisioning<Library>> {
        component.ensure_not_errored()?;
        let group_path = component.require_metadata(keys::GROUP_PATH)?.to_owned();
        let deploy_key = ctx.deploy_key()?.to_owned();

        let existing: Vec<Library> = self.inventory.owned(ctx, component.id()).await?;
        if existing
            .iter()
            .any(|lib| lib.language == language && lib.kind == kind && !lib.is_deleted())
        {
            return Err(FactoryError::already_exists(
                ResourceKind::Library,
                format!("{}/{language}/{kind}", component.name),
            ));
        }

        let name = format!(
            "{}-{}-{}",
            component.name,
            language.as_str().to_lowercase(),
            kind.as_str().to_lowercase()
        );
        let library = self
            .inventory
            .libraries
            .insert(
                ctx,
                Library {
                    header: Header::pending(),
                    component_id: component.id().clone(),
                    name,
                    language,
                    kind,
                },
            )
            .await?;

        info!(library_id = %library.id(), name = %library.name, "library registered");

        let path = self
            .layout
            .library_repository(&group_path, &component.name, language, kind);
        let this = self.clone();
        let task_ctx = ctx.clone();
        let registered = library.clone();
        let task = detach(ctx, "provision_library", library.id(), async move {
            this.provision(task_ctx, registered, path, deploy_key, OnceCallback::new(on_ready))
                .await;
        });

        Ok(Provisioning {
            resource: library,
            task,
        })
    }

    async fn provision(
        &self,
        ctx: CallerContext,
        library: Library,
        path: String,
        deploy_key: String,
        on_ready: OnceCallback,
    ) {
        let this = self.clone();
        let check_ctx = ctx.clone();
        let id = library.id().clone();
        let notify = on_ready.clone();
        let on_repository = Callback::new(move || async move {
            this.on_repository_ready(&check_ctx, &id, &notify).await;
        });

        if let Err(err) = self
            .repositories
            .create(&ctx, library.id(), &library.name, &path, vec![deploy_key], on_repository)
            .await
        {
            self.fail(&ctx, library.id(), &err, &on_ready).await;
        }
    }

    async fn fail(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        err: &FactoryError,
        on_ready: &OnceCallback,
    ) {
        self.inventory.manage_error::<Library>(ctx, id, err).await;
        on_ready.fire().await;
    }

    async fn on_repository_ready(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        on_ready: &OnceCallback,
    ) {
        if let Err(err) = self.check_repository(ctx, id, on_ready).await {
            self.fail(ctx, id, &err, on_ready).await;
        }
    }

    async fn on_pipeline_ready(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        on_ready: &OnceCallback,
    ) {
        if let Err(err) = self.check_pipeline(ctx, id, on_ready).await {
            self.fail(ctx, id, &err, on_ready).await;
        }
    }

    /// First readiness check: once the repository is READY with a remote,
    /// create the pipeline. Returns whether the library advanced.
    async fn check_repository(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        on_ready: &OnceCallback,
    ) -> FactoryResult<bool> {
        let _guard = self.locks.acquire(id).await;

        let Some(library) = self.inventory.find::<Library>(ctx, id).await? else {
            return Ok(false);
        };
        if library.is_ready() {
            return Ok(true);
        }
        if library.is_error() || library.is_deleted() {
            return Ok(false);
        }

        let Some(repository) = self
            .inventory
            .owned_one::<SourceRepository>(ctx, id)
            .await?
        else {
            return Ok(false);
        };
        repository.ensure_not_errored()?;
        if !repository.is_ready() || repository.remote().is_none() {
            debug!(library_id = %id, "library repository not ready");
            return Ok(false);
        }

        if self
            .inventory
            .owned_one::<Pipeline>(ctx, id)
            .await?
            .is_some()
        {
            return Ok(false);
        }

        let this = self.clone();
        let check_ctx = ctx.clone();
        let library_id = id.clone();
        let notify = on_ready.clone();
        let on_pipeline = Callback::new(move || async move {
            this.on_pipeline_ready(&check_ctx, &library_id, &notify).await;
        });

        self.pipelines
            .create(
                ctx,
                PipelineSpec {
                    owner: id,
                    name: &library.name,
                    path: &repository.path,
                    template: Template::for_library(library.language, library.kind),
                    credential_id: ctx.deploy_key()?,
                },
                &repository,
                on_pipeline,
            )
            .await?;

        Ok(true)
    }

    /// Second readiness check: once the pipeline is READY, mark the library
    /// READY and notify. Returns whether the library is READY.
    async fn check_pipeline(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        on_ready: &OnceCallback,
    ) -> FactoryResult<bool> {
        let _guard = self.locks.acquire(id).await;

        let Some(library) = self.inventory.find::<Library>(ctx, id).await? else {
            return Ok(false);
        };
        if library.is_ready() {
            return Ok(true);
        }
        if library.is_error() || library.is_deleted() {
            return Ok(false);
        }

        let Some(pipeline) = self.inventory.owned_one::<Pipeline>(ctx, id).await? else {
            return Ok(false);
        };
        pipeline.ensure_not_errored()?;
        if !pipeline.is_ready() {
            return Ok(false);
        }

        self.inventory
            .update_status::<Library>(ctx, id, Status::Ready)
            .await?;
        info!(library_id = %id, "library ready");
        on_ready.fire().await;
        Ok(true)
    }

    /// Libraries of a component.
    pub async fn list(
        &self,
        ctx: &CallerContext,
        component_id: &ResourceId,
    ) -> FactoryResult<Vec<Library>> {
        self.inventory.owned(ctx, component_id).await
    }

    /// Get a library.
    pub async fn get(&self, ctx: &CallerContext, id: &ResourceId) -> FactoryResult<Library> {
        self.inventory.require(ctx, id).await
    }

    /// Delete a library, its pipeline and its repository.
    ///
    /// Refuses while API versions were generated into the library unless
    /// `force` is set, in which case those are deleted first.
    pub async fn delete(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        force: bool,
        purge: bool,
    ) -> FactoryResult<()> {
        let Some(library) = self.inventory.deletable::<Library>(ctx, id).await? else {
            debug!(library_id = %id, "library already deleted");
            return Ok(());
        };

        let generated: Vec<LibraryApiVersion> = self
            .inventory
            .library_api_versions
            .list(ctx, &Filter::new())
            .await?
            .into_iter()
            .filter(|version| &version.library_id == id)
            .collect();
        if !generated.is_empty() && !force {
            return Err(FactoryError::validation(format!(
                "library {} has {} generated API versions",
                library.name,
                generated.len()
            )));
        }
        settle_all(
            generated
                .iter()
                .map(|version| self.inventory.retire::<LibraryApiVersion>(ctx, version.id())),
        )
        .await?;

        if let Some(pipeline) = self.pipelines.find_by_owner(ctx, id).await? {
            self.pipelines.delete(ctx, pipeline.id()).await?;
        }
        if let Some(repository) = self.repositories.find_by_owner(ctx, id).await? {
            self.repositories.delete(ctx, repository.id(), purge).await?;
        }

        self.inventory.retire::<Library>(ctx, id).await?;
        self.locks.forget(id);

        info!(library_id = %id, name = %library.name, "library deleted");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::backend::{MemoryCi, MemoryVersionControl};
    use crate::config::BuildConfig;
    use crate::types::Metadata;

    struct Fixture {
        inventory: Inventory,
        vcs: Arc<MemoryVersionControl>,
        ci: Arc<MemoryCi>,
        libraries: LibraryOrchestrator,
        component: Component,
    }

    fn ctx() -> CallerContext {
        CallerContext::new("tester").with_deploy_key("deploy-key")
    }

    async fn fixture() -> Fixture {
        let inventory = Inventory::memory();
        let vcs = Arc::new(MemoryVersionControl::new());
        let ci = Arc::new(MemoryCi::new());
        let repositories = RepositoryProvisioner::new(inventory.clone(), vcs.clone());
        let pipelines =
            PipelineProvisioner::new(inventory.clone(), ci.clone(), &BuildConfig::default());
        let libraries = LibraryOrchestrator::new(
            inventory.clone(),
            repositories,
            pipelines,
            RepositoryLayout::default(),
        );

        let mut metadata = Metadata::new();
        metadata.insert(keys::GROUP_PATH.to_owned(), "/acme".to_owned());
        let component = inventory
            .components
            .insert(
                &ctx(),
                Component {
                    header: Header::pending_with(metadata),
                    group_id: ResourceId::new("g"),
                    name: "orders".to_owned(),
                    description: String::new(),
                },
            )
            .await
            .unwrap();

        Fixture {
            inventory,
            vcs,
            ci,
            libraries,
            component,
        }
    }

    async fn wait_for(inventory: &Inventory, id: &ResourceId, status: Status) -> Library {
        for _ in 0..200 {
            let library: Library = inventory.require(&ctx(), id).await.unwrap();
            if library.status() == status {
                return library;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("library {id} never reached {status}");
    }

    fn counter_callback(counter: &Arc<AtomicUsize>) -> Callback {
        let counter = Arc::clone(counter);
        Callback::new(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn library_becomes_ready_after_repository_and_pipeline() {
        let f = fixture().await;
        let fired = Arc::new(AtomicUsize::new(0));

        let library = f
            .libraries
            .add(
                &ctx(),
                &f.component,
                Language::Java,
                LibraryKind::Client,
                counter_callback(&fired),
            )
            .await
            .unwrap()
            .resource;
        assert!(library.is_pending());
        assert_eq!(library.name, "orders-java-client");

        wait_for(&f.inventory, library.id(), Status::Ready).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(f.vcs.repository_exists("acme/orders/java-client"));
        assert_eq!(f.vcs.deploy_keys("acme/orders/java-client"), vec!["deploy-key".to_owned()]);
        assert_eq!(f.ci.pipeline_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_pair_is_rejected() {
        let f = fixture().await;
        f.libraries
            .add(&ctx(), &f.component, Language::Python, LibraryKind::Server, Callback::none())
            .await
            .unwrap();

        let err = f
            .libraries
            .add(&ctx(), &f.component, Language::Python, LibraryKind::Server, Callback::none())
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::AlreadyExists { kind: ResourceKind::Library, .. }));
    }

    #[tokio::test]
    async fn repository_failure_marks_library_error() {
        let f = fixture().await;
        f.vcs.fail_repository_creation(true);
        let fired = Arc::new(AtomicUsize::new(0));

        let library = f
            .libraries
            .add(
                &ctx(),
                &f.component,
                Language::Java,
                LibraryKind::Server,
                counter_callback(&fired),
            )
            .await
            .unwrap()
            .resource;

        wait_for(&f.inventory, library.id(), Status::Error).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(f.ci.pipeline_count(), 0);
    }

    #[tokio::test]
    async fn readiness_checks_are_reentrant() {
        let f = fixture().await;
        let fired = Arc::new(AtomicUsize::new(0));
        let library = f
            .libraries
            .add(
                &ctx(),
                &f.component,
                Language::Java,
                LibraryKind::Client,
                counter_callback(&fired),
            )
            .await
            .unwrap()
            .resource;
        wait_for(&f.inventory, library.id(), Status::Ready).await;

        let once = OnceCallback::new(counter_callback(&fired));
        assert!(f.libraries.check_repository(&ctx(), library.id(), &once).await.unwrap());
        assert!(f.libraries.check_pipeline(&ctx(), library.id(), &once).await.unwrap());
        assert_eq!(f.ci.pipeline_count(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_removes_pipeline_then_repository() {
        let f = fixture().await;
        let library = f
            .libraries
            .add(&ctx(), &f.component, Language::Java, LibraryKind::Client, Callback::none())
            .await
            .unwrap()
            .resource;
        wait_for(&f.inventory, library.id(), Status::Ready).await;

        f.libraries.delete(&ctx(), library.id(), false, true).await.unwrap();
        f.libraries.delete(&ctx(), library.id(), false, true).await.unwrap();

        assert_eq!(f.ci.pipeline_count(), 0);
        assert!(!f.vcs.repository_exists("acme/orders/java-client"));
        assert!(f.libraries.list(&ctx(), f.component.id()).await.unwrap().is_empty());
    }
}
