//! Resource lifecycle kernel.
//!
//! Status predicates, the error-state guard, and the status helpers every
//! orchestrator uses. Status changes are always written as partial patches
//! so concurrent sibling tasks never overwrite each other's fields.

use tracing::{debug, error, warn};

use crate::context::CallerContext;
use crate::error::{FactoryError, FactoryResult};
use crate::inventory::{Filter, Inventory};
use crate::model::{Entity, Header, ResourceKind, StatusPatch};
use crate::types::{keys, Metadata, ResourceId, Status};

/// Shared view over the header of every entity.
pub trait Resource {
    /// Shared fields.
    fn header(&self) -> &Header;

    /// Mutable shared fields.
    fn header_mut(&mut self) -> &mut Header;

    /// Kind of this resource.
    fn kind(&self) -> ResourceKind;

    /// Identifier.
    fn id(&self) -> &ResourceId {
        &self.header().id
    }

    /// Lifecycle status.
    fn status(&self) -> Status {
        self.header().status
    }

    /// Metadata map.
    fn metadata(&self) -> &Metadata {
        &self.header().metadata
    }

    /// Metadata value for `key`.
    fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata().get(key).map(String::as_str)
    }

    /// Metadata value for `key`, or a validation error naming it.
    fn require_metadata(&self, key: &str) -> FactoryResult<&str> {
        self.metadata_value(key)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                FactoryError::validation(format!(
                    "{} {} is missing metadata '{key}'",
                    self.kind(),
                    self.id()
                ))
            })
    }

    /// True when READY.
    fn is_ready(&self) -> bool {
        self.status() == Status::Ready
    }

    /// True when PENDING.
    fn is_pending(&self) -> bool {
        self.status() == Status::Pending
    }

    /// True when ERROR.
    fn is_error(&self) -> bool {
        self.status() == Status::Error
    }

    /// True when DELETED.
    fn is_deleted(&self) -> bool {
        self.status() == Status::Deleted
    }

    /// Fail fast if this resource is in the ERROR state.
    fn ensure_not_errored(&self) -> FactoryResult<()> {
        if self.is_error() {
            return Err(FactoryError::ResourceInErrorState {
                kind: self.kind(),
                id: self.id().clone(),
            });
        }
        Ok(())
    }

    /// Fail unless this resource is READY.
    fn ensure_ready(&self) -> FactoryResult<()> {
        self.ensure_not_errored()?;
        if !self.is_ready() {
            return Err(FactoryError::NotReady {
                kind: self.kind(),
                id: self.id().clone(),
                status: self.status(),
            });
        }
        Ok(())
    }
}

impl Inventory {
    /// Fetch an entity, failing if it does not exist.
    pub async fn require<E: Entity>(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
    ) -> FactoryResult<E> {
        E::collection(self)
            .get(ctx, id)
            .await?
            .ok_or_else(|| FactoryError::not_found(E::KIND, id))
    }

    /// Fetch an entity if it exists.
    pub async fn find<E: Entity>(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
    ) -> FactoryResult<Option<E>> {
        E::collection(self).get(ctx, id).await
    }

    /// Apply a partial update.
    pub async fn patch<E: Entity>(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        patch: impl Into<E::Patch>,
    ) -> FactoryResult<E> {
        E::collection(self).patch(ctx, id, &patch.into()).await
    }

    /// Persist only the status of an entity.
    pub async fn update_status<E: Entity>(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        status: Status,
    ) -> FactoryResult<E> {
        debug!(kind = %E::KIND, resource_id = %id, %status, "updating status");
        self.patch::<E>(ctx, id, StatusPatch::status(status)).await
    }

    /// Record `err` on the resource and transition it to ERROR.
    ///
    /// Never fails: if the error cannot be recorded it is logged and dropped.
    pub async fn manage_error<E: Entity>(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        err: &FactoryError,
    ) {
        error!(kind = %E::KIND, resource_id = %id, error = %err, "provisioning failed");

        let patch = StatusPatch::status(Status::Error)
            .with_metadata(keys::ERROR_STACK_TRACE, err.trace());
        if let Err(record_err) = self.patch::<E>(ctx, id, patch).await {
            warn!(
                kind = %E::KIND,
                resource_id = %id,
                error = %record_err,
                "failed to record error state"
            );
        }
    }

    /// Entities owned by `owner`.
    pub async fn owned<E: Entity>(
        &self,
        ctx: &CallerContext,
        owner: &ResourceId,
    ) -> FactoryResult<Vec<E>> {
        E::collection(self)
            .list(ctx, &Filter::new().with_owner(owner.clone()))
            .await
    }

    /// The single entity of this type owned by `owner`, if any.
    pub async fn owned_one<E: Entity>(
        &self,
        ctx: &CallerContext,
        owner: &ResourceId,
    ) -> FactoryResult<Option<E>> {
        Ok(self.owned::<E>(ctx, owner).await?.into_iter().next())
    }

    /// Entity registered under `path`, if any.
    pub async fn by_path<E: Entity>(
        &self,
        ctx: &CallerContext,
        path: &str,
    ) -> FactoryResult<Option<E>> {
        Ok(E::collection(self)
            .list(ctx, &Filter::new().with_path(path))
            .await?
            .into_iter()
            .next())
    }

    /// Remove an entity record. A record that is already gone is not an
    /// error.
    pub async fn remove<E: Entity>(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
    ) -> FactoryResult<()> {
        match E::collection(self).delete(ctx, id).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Current state of an entity for a delete: `None` when there is nothing
    /// left to delete (record gone or already DELETED).
    pub async fn deletable<E: Entity>(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
    ) -> FactoryResult<Option<E>> {
        Ok(self.find::<E>(ctx, id).await?.filter(|e| !e.is_deleted()))
    }

    /// Mark an entity DELETED and drop its record.
    pub async fn retire<E: Entity>(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
    ) -> FactoryResult<()> {
        match self.update_status::<E>(ctx, id, Status::Deleted).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        }
        self.remove::<E>(ctx, id).await
    }
}
