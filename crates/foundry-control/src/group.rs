//! Groups: the namespaces components live in.

use tracing::info;

use crate::context::CallerContext;
use crate::error::{FactoryError, FactoryResult};
use crate::inventory::{Filter, Inventory};
use crate::model::{Component, Group, Header, ResourceKind};
use crate::resource::Resource;
use crate::types::{validate_name, ResourceId, Status};

/// Registers and removes groups.
#[derive(Debug, Clone)]
pub struct GroupService {
    inventory: Inventory,
}

impl GroupService {
    /// Create a service.
    pub fn new(inventory: Inventory) -> Self {
        Self { inventory }
    }

    /// Register a group at `path`. Groups have nothing to provision and are
    /// READY immediately.
    pub async fn create(
        &self,
        ctx: &CallerContext,
        name: &str,
        path: &str,
    ) -> FactoryResult<Group> {
        validate_name(name)?;
        if path.trim_matches('/').is_empty() {
            return Err(FactoryError::validation("group path must not be empty"));
        }
        if self.get_by_path(ctx, path).await?.is_some() {
            return Err(FactoryError::already_exists(ResourceKind::Group, path));
        }

        let mut header = Header::pending();
        header.status = Status::Ready;
        let group = self
            .inventory
            .groups
            .insert(
                ctx,
                Group {
                    header,
                    name: name.to_owned(),
                    path: path.to_owned(),
                },
            )
            .await?;

        info!(group_id = %group.id(), name, path, "group created");
        Ok(group)
    }

    /// Group registered at `path`.
    pub async fn get_by_path(
        &self,
        ctx: &CallerContext,
        path: &str,
    ) -> FactoryResult<Option<Group>> {
        self.inventory.by_path(ctx, path).await
    }

    /// Get a group.
    pub async fn get(&self, ctx: &CallerContext, id: &ResourceId) -> FactoryResult<Group> {
        self.inventory.require(ctx, id).await
    }

    /// All groups.
    pub async fn list(&self, ctx: &CallerContext) -> FactoryResult<Vec<Group>> {
        self.inventory.groups.list(ctx, &Filter::new()).await
    }

    /// Delete an empty group.
    pub async fn delete(&self, ctx: &CallerContext, id: &ResourceId) -> FactoryResult<()> {
        let Some(group) = self.inventory.deletable::<Group>(ctx, id).await? else {
            return Ok(());
        };

        let components: Vec<Component> = self.inventory.owned(ctx, id).await?;
        if !components.is_empty() {
            return Err(FactoryError::validation(format!(
                "group {} still has {} components",
                group.path,
                components.len()
            )));
        }

        self.inventory.retire::<Group>(ctx, id).await?;
        info!(group_id = %id, path = %group.path, "group deleted");
        Ok(())
    }
}
