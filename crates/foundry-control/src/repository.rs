//! Repository provisioning.
//!
//! Repositories are created in two phases: a PENDING record is registered
//! synchronously, then a detached task asks the version-control backend to
//! materialise the repository and records the remote URL it assigns.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::archive::SourceTree;
use crate::backend::{BranchInfo, CommitInfo, CommitRequest, VersionControl};
use crate::config::RepositoryConfig;
use crate::context::CallerContext;
use crate::error::{FactoryError, FactoryResult};
use crate::inventory::Inventory;
use crate::model::{Header, RepositoryPatch, ResourceKind, SourceRepository, StatusPatch};
use crate::resource::Resource;
use crate::task::{detach, Callback, Provisioning};
use crate::types::{Language, LibraryKind, ResourceId, Status};

/// Where repositories live and what they contain.
#[derive(Debug, Clone)]
pub struct RepositoryLayout {
    prefix: String,
    default_branch: String,
    api_spec_file: String,
}

impl RepositoryLayout {
    /// Layout from configuration.
    #[must_use]
    pub fn new(config: &RepositoryConfig) -> Self {
        Self {
            prefix: config.path_prefix.clone(),
            default_branch: config.default_branch.clone(),
            api_spec_file: config.api_spec_file.clone(),
        }
    }

    /// Join path parts below the configured prefix, ignoring empty parts
    /// and surrounding slashes.
    #[must_use]
    pub fn path(&self, parts: &[&str]) -> String {
        std::iter::once(self.prefix.as_str())
            .chain(parts.iter().copied())
            .map(|part| part.trim_matches('/'))
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Path of a component's API repository.
    #[must_use]
    pub fn api_repository(&self, group_path: &str, component: &str) -> String {
        self.path(&[group_path, component, "api"])
    }

    /// Path of a library repository.
    #[must_use]
    pub fn library_repository(
        &self,
        group_path: &str,
        component: &str,
        language: Language,
        kind: LibraryKind,
    ) -> String {
        let leaf = format!(
            "{}-{}",
            language.as_str().to_lowercase(),
            kind.as_str().to_lowercase()
        );
        self.path(&[group_path, component, &leaf])
    }

    /// Path of an implementation repository.
    #[must_use]
    pub fn implementation_repository(&self, group_path: &str, name: &str) -> String {
        self.path(&[group_path, name])
    }

    /// Branch commits and builds target.
    #[must_use]
    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    /// API spec file name.
    #[must_use]
    pub fn api_spec_file(&self) -> &str {
        &self.api_spec_file
    }
}

impl Default for RepositoryLayout {
    fn default() -> Self {
        Self::new(&RepositoryConfig::default())
    }
}

/// Creates, commits to and deletes source repositories.
#[derive(Clone)]
pub struct RepositoryProvisioner {
    inventory: Inventory,
    vcs: Arc<dyn VersionControl>,
}

impl RepositoryProvisioner {
    /// Create a provisioner.
    pub fn new(inventory: Inventory, vcs: Arc<dyn VersionControl>) -> Self {
        Self { inventory, vcs }
    }

    /// Register a PENDING repository and materialise it in the background.
    ///
    /// `on_ready` fires when the background step ends, whether the
    /// repository became READY or ERROR.
    pub async fn create(
        &self,
        ctx: &CallerContext,
        owner: &ResourceId,
        name: &str,
        path: &str,
        deploy_keys: Vec<String>,
        on_ready: Callback,
    ) -> FactoryResult<Provisioning<SourceRepository>> {
        if name.trim().is_empty() {
            return Err(FactoryError::validation("repository name must not be empty"));
        }
        if path.trim().is_empty() {
            return Err(FactoryError::validation("repository path must not be empty"));
        }
        if self
            .inventory
            .by_path::<SourceRepository>(ctx, path)
            .await?
            .is_some()
        {
            return Err(FactoryError::already_exists(ResourceKind::SourceRepository, path));
        }

        let repo = self
            .inventory
            .repositories
            .insert(
                ctx,
                SourceRepository {
                    header: Header::pending(),
                    owner: owner.clone(),
                    name: name.to_owned(),
                    path: path.to_owned(),
                    remote_url: None,
                },
            )
            .await?;

        info!(repository_id = %repo.id(), path = %repo.path, "repository registered");

        let this = self.clone();
        let task_ctx = ctx.clone();
        let pending = repo.clone();
        let task = detach(ctx, "create_repository", repo.id(), async move {
            match this.materialise(&task_ctx, &pending, &deploy_keys).await {
                Ok(ready) => {
                    info!(
                        repository_id = %ready.id(),
                        remote_url = ready.remote().unwrap_or_default(),
                        "repository ready"
                    );
                }
                Err(err) => {
                    this.inventory
                        .manage_error::<SourceRepository>(&task_ctx, pending.id(), &err)
                        .await;
                }
            }
            on_ready.fire().await;
        });

        Ok(Provisioning {
            resource: repo,
            task,
        })
    }

    async fn materialise(
        &self,
        ctx: &CallerContext,
        repo: &SourceRepository,
        deploy_keys: &[String],
    ) -> FactoryResult<SourceRepository> {
        let remote = self
            .vcs
            .create_repository(ctx, &repo.path, deploy_keys)
            .await?;

        self.inventory
            .patch::<SourceRepository>(
                ctx,
                repo.id(),
                RepositoryPatch {
                    common: StatusPatch::status(Status::Ready),
                    remote_url: Some(remote.remote_url),
                },
            )
            .await
    }

    /// Commit one file to `branch`, tagging the commit when `tag` is set.
    pub async fn commit_file_and_tag(
        &self,
        ctx: &CallerContext,
        repo: &SourceRepository,
        branch: &str,
        file: &str,
        content: &str,
        tag: Option<&str>,
    ) -> FactoryResult<()> {
        let files = SourceTree::single(file, content);
        self.commit(ctx, repo, branch, files, tag).await
    }

    /// Commit the contents of a tar.zst archive to `branch`, tagging the
    /// commit when `tag` is set.
    pub async fn commit_archive_and_tag(
        &self,
        ctx: &CallerContext,
        repo: &SourceRepository,
        branch: &str,
        archive: Bytes,
        tag: Option<&str>,
    ) -> FactoryResult<()> {
        let files = SourceTree::from_archive(archive).await?;
        self.commit(ctx, repo, branch, files, tag).await
    }

    async fn commit(
        &self,
        ctx: &CallerContext,
        repo: &SourceRepository,
        branch: &str,
        files: SourceTree,
        tag: Option<&str>,
    ) -> FactoryResult<()> {
        repo.ensure_ready()?;

        let request = CommitRequest {
            branch: branch.to_owned(),
            message: match tag {
                Some(tag) => format!("Release {tag}"),
                None => format!("Update {} file(s)", files.len()),
            },
            tag: tag.map(ToOwned::to_owned),
            files,
        };

        match self.vcs.commit(ctx, &repo.path, &request).await {
            Ok(commit) => {
                debug!(repository_id = %repo.id(), commit = %commit.id, tag, "committed");
                Ok(())
            }
            Err(err) if err.is_precondition_failed() => {
                debug!(repository_id = %repo.id(), tag, "content already committed");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Content of `file` at `reference`.
    pub async fn get_file(
        &self,
        ctx: &CallerContext,
        repo: &SourceRepository,
        file: &str,
        reference: &str,
    ) -> FactoryResult<String> {
        repo.ensure_ready()?;
        self.vcs.get_file(ctx, &repo.path, file, reference).await
    }

    /// Commits on `branch`, newest first.
    pub async fn get_commits(
        &self,
        ctx: &CallerContext,
        repo: &SourceRepository,
        branch: &str,
    ) -> FactoryResult<Vec<CommitInfo>> {
        repo.ensure_ready()?;
        self.vcs.list_commits(ctx, &repo.path, branch).await
    }

    /// Branches of the repository.
    pub async fn get_branches(
        &self,
        ctx: &CallerContext,
        repo: &SourceRepository,
    ) -> FactoryResult<Vec<BranchInfo>> {
        repo.ensure_ready()?;
        self.vcs.list_branches(ctx, &repo.path).await
    }

    /// The repository owned by `owner`, if any.
    pub async fn find_by_owner(
        &self,
        ctx: &CallerContext,
        owner: &ResourceId,
    ) -> FactoryResult<Option<SourceRepository>> {
        self.inventory.owned_one(ctx, owner).await
    }

    /// Delete a repository record. With `purge`, also delete the repository
    /// from the version-control backend.
    pub async fn delete(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        purge: bool,
    ) -> FactoryResult<()> {
        let Some(repo) = self.inventory.deletable::<SourceRepository>(ctx, id).await? else {
            debug!(repository_id = %id, "repository already deleted");
            return Ok(());
        };

        if purge {
            self.vcs.delete_repository(ctx, &repo.path).await?;
        }
        self.inventory.retire::<SourceRepository>(ctx, id).await?;

        info!(repository_id = %id, path = %repo.path, purge, "repository deleted");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::MemoryVersionControl;

    fn setup() -> (RepositoryProvisioner, Arc<MemoryVersionControl>, Inventory) {
        let inventory = Inventory::memory();
        let vcs = Arc::new(MemoryVersionControl::new());
        let provisioner = RepositoryProvisioner::new(inventory.clone(), vcs.clone());
        (provisioner, vcs, inventory)
    }

    fn ctx() -> CallerContext {
        CallerContext::new("tester")
    }

    async fn ready_repo(provisioner: &RepositoryProvisioner, path: &str) -> SourceRepository {
        let provisioning = provisioner
            .create(
                &ctx(),
                &ResourceId::new("owner"),
                "repo",
                path,
                vec!["key".to_owned()],
                Callback::none(),
            )
            .await
            .unwrap();
        let id = provisioning.resource.id().clone();
        provisioning.join().await.unwrap();
        provisioner.inventory.require(&ctx(), &id).await.unwrap()
    }

    #[test]
    fn layout_joins_paths() {
        let layout = RepositoryLayout::new(&RepositoryConfig {
            path_prefix: "/factory/".to_owned(),
            ..RepositoryConfig::default()
        });
        assert_eq!(layout.api_repository("/acme", "orders"), "factory/acme/orders/api");
        assert_eq!(
            layout.library_repository("/acme", "orders", Language::Java, LibraryKind::Client),
            "factory/acme/orders/java-client"
        );
        assert_eq!(
            RepositoryLayout::default().implementation_repository("/acme", "orders-impl"),
            "acme/orders-impl"
        );
    }

    #[tokio::test]
    async fn create_registers_pending_then_ready() {
        let (provisioner, vcs, _) = setup();

        let provisioning = provisioner
            .create(
                &ctx(),
                &ResourceId::new("owner"),
                "api",
                "acme/orders/api",
                vec!["key".to_owned()],
                Callback::none(),
            )
            .await
            .unwrap();
        assert!(provisioning.resource.is_pending());
        assert!(provisioning.resource.remote_url.is_none());

        let repo = ready_repo(&provisioner, "acme/orders/other").await;
        assert!(repo.is_ready());
        assert_eq!(repo.remote(), Some("memory://vcs/acme/orders/other.git"));
        assert_eq!(vcs.deploy_keys("acme/orders/other"), vec!["key".to_owned()]);
    }

    #[tokio::test]
    async fn failure_marks_error_and_still_fires() {
        let (provisioner, vcs, inventory) = setup();
        vcs.fail_repository_creation(true);

        let (tx, rx) = tokio::sync::oneshot::channel();
        let provisioning = provisioner
            .create(
                &ctx(),
                &ResourceId::new("owner"),
                "api",
                "acme/orders/api",
                vec![],
                Callback::new(move || async move {
                    tx.send(()).ok();
                }),
            )
            .await
            .unwrap();
        let id = provisioning.resource.id().clone();
        provisioning.join().await.unwrap();
        rx.await.unwrap();

        let repo: SourceRepository = inventory.require(&ctx(), &id).await.unwrap();
        assert!(repo.is_error());
        assert!(repo.metadata_value(crate::types::keys::ERROR_STACK_TRACE).is_some());
    }

    #[tokio::test]
    async fn duplicate_path_is_rejected_synchronously() {
        let (provisioner, _, _) = setup();
        ready_repo(&provisioner, "acme/orders/api").await;

        let err = provisioner
            .create(
                &ctx(),
                &ResourceId::new("other"),
                "api",
                "acme/orders/api",
                vec![],
                Callback::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn repeated_tagged_commit_is_idempotent() {
        let (provisioner, vcs, _) = setup();
        let repo = ready_repo(&provisioner, "acme/orders/api").await;
        let archive = SourceTree::single("Main.java", "class Main {}").to_archive().await.unwrap();

        provisioner
            .commit_archive_and_tag(&ctx(), &repo, "master", archive.clone(), Some("1.0.0"))
            .await
            .unwrap();
        provisioner
            .commit_archive_and_tag(&ctx(), &repo, "master", archive, Some("1.0.0"))
            .await
            .unwrap();

        assert_eq!(vcs.commit_count("acme/orders/api"), 1);
        assert_eq!(
            provisioner.get_file(&ctx(), &repo, "Main.java", "1.0.0").await.unwrap(),
            "class Main {}"
        );
    }

    #[tokio::test]
    async fn reads_require_ready() {
        let (provisioner, _, _) = setup();
        let pending = provisioner
            .create(&ctx(), &ResourceId::new("owner"), "api", "acme/x", vec![], Callback::none())
            .await
            .unwrap()
            .resource;

        let err = provisioner.get_branches(&ctx(), &pending).await.unwrap_err();
        assert!(matches!(err, FactoryError::NotReady { .. }));
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_purges() {
        let (provisioner, vcs, _) = setup();
        let repo = ready_repo(&provisioner, "acme/orders/api").await;

        provisioner.delete(&ctx(), repo.id(), true).await.unwrap();
        provisioner.delete(&ctx(), repo.id(), true).await.unwrap();
        assert!(!vcs.repository_exists("acme/orders/api"));
        assert!(provisioner
            .find_by_owner(&ctx(), &ResourceId::new("owner"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delete_without_purge_keeps_backend_storage() {
        let (provisioner, vcs, _) = setup();
        let repo = ready_repo(&provisioner, "acme/orders/api").await;

        provisioner.delete(&ctx(), repo.id(), false).await.unwrap();
        assert!(vcs.repository_exists("acme/orders/api"));
    }
}
