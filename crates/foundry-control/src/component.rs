//! Component orchestration.
//!
//! A component fans out into one API repository and one library per
//! (language, kind) pair of the configured matrix. Every one of those
//! provisionings ends by re-running the component rollup, which marks the
//! component READY once the API repository and the full set of libraries
//! are READY. The rollup takes the component's lock, so concurrent child
//! events see a consistent view and the callback fires once.

use tracing::{debug, info};

use crate::api_version::ApiVersionOrchestrator;
use crate::config::MatrixConfig;
use crate::context::CallerContext;
use crate::error::{FactoryError, FactoryResult};
use crate::implementation::ImplementationOrchestrator;
use crate::inventory::Inventory;
use crate::library::LibraryOrchestrator;
use crate::model::{ApiVersion, Component, Group, Header, ResourceKind, SourceRepository};
use crate::repository::{RepositoryLayout, RepositoryProvisioner};
use crate::resource::Resource;
use crate::rollup::RollupLocks;
use crate::task::{detach, settle_all, Callback, OnceCallback, Provisioning};
use crate::types::{artifact_name, keys, validate_name, Metadata, ResourceId, Status};

/// Provisions components and tears them down.
#[derive(Clone)]
pub struct ComponentOrchestrator {
    inventory: Inventory,
    repositories: RepositoryProvisioner,
    libraries: LibraryOrchestrator,
    implementations: ImplementationOrchestrator,
    api_versions: ApiVersionOrchestrator,
    layout: RepositoryLayout,
    matrix: MatrixConfig,
    default_group: String,
    locks: RollupLocks,
}

impl ComponentOrchestrator {
    /// Create an orchestrator.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inventory: Inventory,
        repositories: RepositoryProvisioner,
        libraries: LibraryOrchestrator,
        implementations: ImplementationOrchestrator,
        api_versions: ApiVersionOrchestrator,
        layout: RepositoryLayout,
        matrix: MatrixConfig,
        default_group: impl Into<String>,
    ) -> Self {
        Self {
            inventory,
            repositories,
            libraries,
            implementations,
            api_versions,
            layout,
            matrix,
            default_group: default_group.into(),
            locks: RollupLocks::new(),
        }
    }

    /// Register a component under the group at `group_path`.
    ///
    /// Returns the PENDING component; `on_ready` fires once it is READY or
    /// has failed.
    pub async fn create(
        &self,
        ctx: &CallerContext,
        name: &str,
        description: &str,
        group_path: &str,
        on_ready: Callback,
    ) -> FactoryResult<Provisioning<Component>> {
        validate_name(name)?;
        let deploy_key = ctx.deploy_key()?.to_owned();

        let group = self
            .inventory
            .by_path::<Group>(ctx, group_path)
            .await?
            .ok_or_else(|| FactoryError::not_found(ResourceKind::Group, group_path))?;
        group.ensure_not_errored()?;

        let siblings: Vec<Component> = self.inventory.owned(ctx, group.id()).await?;
        if siblings.iter().any(|c| c.name == name) {
            return Err(FactoryError::already_exists(
                ResourceKind::Component,
                format!("{group_path}/{name}"),
            ));
        }

        let metadata = Metadata::from([
            (keys::GROUP_ID.to_owned(), group.id().to_string()),
            (keys::GROUP_PATH.to_owned(), group.path.clone()),
            (
                keys::API_GROUP_ID.to_owned(),
                format!("{}.{}", self.default_group, artifact_name(&group.name)),
            ),
        ]);

        let component = self
            .inventory
            .components
            .insert(
                ctx,
                Component {
                    header: Header::pending_with(metadata),
                    group_id: group.id().clone(),
                    name: name.to_owned(),
                    description: description.to_owned(),
                },
            )
            .await?;

        info!(component_id = %component.id(), name, group_path, "component registered");

        let this = self.clone();
        let task_ctx = ctx.clone();
        let registered = component.clone();
        let task = detach(ctx, "provision_component", component.id(), async move {
            this.provision(&task_ctx, &registered, deploy_key, OnceCallback::new(on_ready))
                .await;
        });

        Ok(Provisioning {
            resource: component,
            task,
        })
    }

    fn rollup_callback(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        on_ready: &OnceCallback,
    ) -> Callback {
        let this = self.clone();
        let ctx = ctx.clone();
        let id = id.clone();
        let on_ready = on_ready.clone();
        Callback::new(move || async move {
            if let Err(err) = this.validate(&ctx, &id, &on_ready).await {
                this.fail(&ctx, &id, &err, &on_ready).await;
            }
        })
    }

    async fn fail(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        err: &FactoryError,
        on_ready: &OnceCallback,
    ) {
        self.inventory.manage_error::<Component>(ctx, id, err).await;
        on_ready.fire().await;
    }

    async fn provision(
        &self,
        ctx: &CallerContext,
        component: &Component,
        deploy_key: String,
        on_ready: OnceCallback,
    ) {
        let id = component.id();
        let group_path = component
            .metadata_value(keys::GROUP_PATH)
            .unwrap_or_default();

        let api_path = self.layout.api_repository(group_path, &component.name);
        if let Err(err) = self
            .repositories
            .create(
                ctx,
                id,
                &format!("{}-api", component.name),
                &api_path,
                vec![deploy_key],
                self.rollup_callback(ctx, id, &on_ready),
            )
            .await
        {
            self.fail(ctx, id, &err, &on_ready).await;
            return;
        }

        for (index, (language, kind)) in self.matrix.pairs().into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.matrix.library_stagger).await;
            }
            if let Err(err) = self
                .libraries
                .add(ctx, component, language, kind, self.rollup_callback(ctx, id, &on_ready))
                .await
            {
                self.fail(ctx, id, &err, &on_ready).await;
                return;
            }
            debug!(component_id = %id, %language, %kind, "library requested");
        }
    }

    /// Re-evaluate the component's readiness.
    ///
    /// Returns `true` once the component is READY. Safe to call any number of
    /// times; the READY transition and `on_ready` happen once. A library in
    /// ERROR fails the component.
    pub(crate) async fn validate(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        on_ready: &OnceCallback,
    ) -> FactoryResult<bool> {
        let _guard = self.locks.acquire(id).await;

        let Some(component) = self.inventory.find::<Component>(ctx, id).await? else {
            return Ok(false);
        };
        if component.is_ready() {
            return Ok(true);
        }
        if component.is_error() || component.is_deleted() {
            return Ok(false);
        }

        let Some(api_repository) = self
            .inventory
            .owned_one::<SourceRepository>(ctx, id)
            .await?
        else {
            return Ok(false);
        };
        api_repository.ensure_not_errored()?;
        if !api_repository.is_ready() {
            return Ok(false);
        }

        let libraries = self.libraries.list(ctx, id).await?;
        if let Some(failed) = libraries.iter().find(|lib| lib.is_error()) {
            failed.ensure_not_errored()?;
        }
        if libraries.len() != self.matrix.size() {
            debug!(
                component_id = %id,
                libraries = libraries.len(),
                expected = self.matrix.size(),
                "component libraries incomplete"
            );
            return Ok(false);
        }
        if !libraries.iter().all(|lib| lib.is_ready()) {
            return Ok(false);
        }

        self.inventory
            .update_status::<Component>(ctx, id, Status::Ready)
            .await?;
        info!(component_id = %id, name = %component.name, "component ready");
        on_ready.fire().await;
        Ok(true)
    }

    /// Get a component.
    pub async fn get(&self, ctx: &CallerContext, id: &ResourceId) -> FactoryResult<Component> {
        self.inventory.require(ctx, id).await
    }

    /// Components of a group.
    pub async fn list(
        &self,
        ctx: &CallerContext,
        group_id: &ResourceId,
    ) -> FactoryResult<Vec<Component>> {
        self.inventory.owned(ctx, group_id).await
    }

    /// Delete a component and everything below it.
    ///
    /// Refuses while the component has implementations unless `force` is
    /// set. Implementations, then API versions, then the API repository,
    /// then libraries are deleted before the component record; siblings are
    /// deleted concurrently and the first failure is returned once all have
    /// been attempted.
    pub async fn delete(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        force: bool,
        purge: bool,
    ) -> FactoryResult<()> {
        let Some(component) = self.inventory.deletable::<Component>(ctx, id).await? else {
            debug!(component_id = %id, "component already deleted");
            return Ok(());
        };

        let implementations = self.implementations.list(ctx, id).await?;
        if !implementations.is_empty() && !force {
            return Err(FactoryError::validation(format!(
                "component {} has {} implementations",
                component.name,
                implementations.len()
            )));
        }
        settle_all(
            implementations
                .iter()
                .map(|imp| self.implementations.delete(ctx, imp.id(), purge)),
        )
        .await?;

        let api_versions: Vec<ApiVersion> = self.inventory.owned(ctx, id).await?;
        settle_all(
            api_versions
                .iter()
                .map(|version| self.api_versions.delete(ctx, version.id())),
        )
        .await?;

        if let Some(repository) = self.repositories.find_by_owner(ctx, id).await? {
            self.repositories.delete(ctx, repository.id(), purge).await?;
        }

        let libraries = self.libraries.list(ctx, id).await?;
        settle_all(
            libraries
                .iter()
                .map(|lib| self.libraries.delete(ctx, lib.id(), true, purge)),
        )
        .await?;

        self.inventory.retire::<Component>(ctx, id).await?;
        self.locks.forget(id);

        info!(component_id = %id, name = %component.name, "component deleted");
        Ok(())
    }
}

impl std::fmt::Debug for ComponentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentOrchestrator")
            .field("matrix", &self.matrix)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::backend::{MemoryCi, MemoryGenerator, MemoryVersionControl};
    use crate::config::BuildConfig;
    use crate::pipeline::PipelineProvisioner;
    use crate::types::{Language, LibraryKind};
    use crate::version::VersionBuilder;

    struct Fixture {
        inventory: Inventory,
        vcs: Arc<MemoryVersionControl>,
        components: ComponentOrchestrator,
    }

    fn ctx() -> CallerContext {
        CallerContext::new("tester").with_deploy_key("deploy-key")
    }

    fn matrix() -> MatrixConfig {
        MatrixConfig {
            languages: vec![Language::Java, Language::Python],
            kinds: vec![LibraryKind::Client, LibraryKind::Server],
            library_stagger: Duration::from_millis(1),
        }
    }

    async fn fixture() -> Fixture {
        let inventory = Inventory::memory();
        let vcs = Arc::new(MemoryVersionControl::new());
        let ci = Arc::new(MemoryCi::new());
        let generator = Arc::new(MemoryGenerator::new());
        let layout = RepositoryLayout::default();
        let repositories = RepositoryProvisioner::new(inventory.clone(), vcs.clone());
        let pipelines = PipelineProvisioner::new(inventory.clone(), ci, &BuildConfig::default());
        let versions = VersionBuilder::new(
            inventory.clone(),
            repositories.clone(),
            pipelines.clone(),
            generator.clone(),
            layout.clone(),
            "com.foundry",
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
            pipelines,
            versions.clone(),
            generator,
            layout.clone(),
        );
        let api_versions = ApiVersionOrchestrator::new(
            inventory.clone(),
            repositories.clone(),
            versions,
            layout.clone(),
        );
        let components = ComponentOrchestrator::new(
            inventory.clone(),
            repositories,
            libraries,
            implementations,
            api_versions,
            layout,
            matrix(),
            "com.foundry",
        );

        inventory
            .groups
            .insert(
                &ctx(),
                Group {
                    header: Header::pending(),
                    name: "acme".to_owned(),
                    path: "/acme".to_owned(),
                },
            )
            .await
            .unwrap();

        Fixture {
            inventory,
            vcs,
            components,
        }
    }

    async fn wait_until(inventory: &Inventory, id: &ResourceId, status: Status) {
        for _ in 0..400 {
            let component: Component = inventory.require(&ctx(), id).await.unwrap();
            if component.status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("component {id} never reached {status}");
    }

    #[tokio::test]
    async fn component_rolls_up_to_ready_once() {
        let f = fixture().await;
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let component = f
            .components
            .create(
                &ctx(),
                "orders",
                "order service",
                "/acme",
                Callback::new(move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap()
            .resource;

        assert!(component.is_pending());
        assert_eq!(component.metadata_value(keys::GROUP_PATH), Some("/acme"));
        assert_eq!(component.metadata_value(keys::API_GROUP_ID), Some("com.foundry.acme"));

        wait_until(&f.inventory, component.id(), Status::Ready).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(f.vcs.repository_exists("acme/orders/api"));
        assert_eq!(f.vcs.repository_count(), 5);

        let once = OnceCallback::new(Callback::none());
        assert!(f.components.validate(&ctx(), component.id(), &once).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_group_and_bad_names_are_rejected() {
        let f = fixture().await;

        let err = f
            .components
            .create(&ctx(), "orders", "", "/nowhere", Callback::none())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = f
            .components
            .create(&ctx(), "orders service", "", "/acme", Callback::none())
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::Validation(_)));

        let err = f
            .components
            .create(&CallerContext::new("anonymous"), "orders", "", "/acme", Callback::none())
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::Validation(_)));
    }

    #[tokio::test]
    async fn duplicate_name_in_group_is_rejected() {
        let f = fixture().await;
        f.components
            .create(&ctx(), "orders", "", "/acme", Callback::none())
            .await
            .unwrap();

        let err = f
            .components
            .create(&ctx(), "orders", "", "/acme", Callback::none())
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::AlreadyExists { kind: ResourceKind::Component, .. }));
    }

    #[tokio::test]
    async fn repository_failure_marks_component_error() {
        let f = fixture().await;
        f.vcs.fail_repository_creation(true);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let component = f
            .components
            .create(
                &ctx(),
                "orders",
                "",
                "/acme",
                Callback::new(move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap()
            .resource;

        wait_until(&f.inventory, component.id(), Status::Error).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let failed: Component = f.inventory.require(&ctx(), component.id()).await.unwrap();
        assert!(failed.metadata_value(keys::ERROR_STACK_TRACE).is_some());
    }

    #[tokio::test]
    async fn delete_removes_subtree_and_is_idempotent() {
        let f = fixture().await;
        let component = f
            .components
            .create(&ctx(), "orders", "", "/acme", Callback::none())
            .await
            .unwrap()
            .resource;
        wait_until(&f.inventory, component.id(), Status::Ready).await;

        f.components.delete(&ctx(), component.id(), false, true).await.unwrap();
        f.components.delete(&ctx(), component.id(), false, true).await.unwrap();

        assert_eq!(f.vcs.repository_count(), 0);
        assert!(f.inventory.find::<Component>(&ctx(), component.id()).await.unwrap().is_none());
        let repositories: Vec<SourceRepository> = f
            .inventory
            .repositories
            .list(&ctx(), &crate::inventory::Filter::new())
            .await
            .unwrap();
        assert!(repositories.is_empty());
    }
}
