//! In-memory inventory collection for testing.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::context::CallerContext;
use crate::error::{FactoryError, FactoryResult};
use crate::model::Entity;
use crate::types::ResourceId;

use super::{Collection, Filter};

#[derive(Debug)]
struct Slot<E> {
    seq: u64,
    entity: E,
}

#[derive(Debug)]
struct State<E> {
    next_seq: u64,
    entities: HashMap<ResourceId, Slot<E>>,
}

/// In-memory collection for testing.
///
/// Paths are unique within a collection, as in the remote store. Data is
/// lost when the process exits.
#[derive(Debug)]
pub struct MemoryCollection<E> {
    state: RwLock<State<E>>,
}

impl<E> Default for MemoryCollection<E> {
    fn default() -> Self {
        Self {
            state: RwLock::new(State {
                next_seq: 0,
                entities: HashMap::new(),
            }),
        }
    }
}

impl<E> MemoryCollection<E> {
    /// Create a new empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<E: Entity> Collection<E> for MemoryCollection<E> {
    async fn insert(&self, _ctx: &CallerContext, mut entity: E) -> FactoryResult<E> {
        let mut state = self
            .state
            .write()
            .map_err(|_| FactoryError::internal("lock poisoned"))?;

        if let Some(path) = entity.path() {
            if state
                .entities
                .values()
                .any(|slot| slot.entity.path() == Some(path))
            {
                return Err(FactoryError::already_exists(E::KIND, path));
            }
        }

        let header = entity.header_mut();
        if header.id.is_unassigned() {
            header.id = ResourceId::generate();
        }
        let now = Utc::now();
        header.created_at = now;
        header.updated_at = now;

        let id = header.id.clone();
        if state.entities.contains_key(&id) {
            return Err(FactoryError::already_exists(E::KIND, id.as_str()));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entities.insert(
            id,
            Slot {
                seq,
                entity: entity.clone(),
            },
        );
        Ok(entity)
    }

    async fn get(&self, _ctx: &CallerContext, id: &ResourceId) -> FactoryResult<Option<E>> {
        let state = self
            .state
            .read()
            .map_err(|_| FactoryError::internal("lock poisoned"))?;

        Ok(state.entities.get(id).map(|slot| slot.entity.clone()))
    }

    async fn list(&self, _ctx: &CallerContext, filter: &Filter) -> FactoryResult<Vec<E>> {
        let state = self
            .state
            .read()
            .map_err(|_| FactoryError::internal("lock poisoned"))?;

        let mut results: Vec<_> = state
            .entities
            .values()
            .filter(|slot| filter.matches(&slot.entity))
            .collect();
        results.sort_by_key(|slot| slot.seq);

        Ok(results.into_iter().map(|slot| slot.entity.clone()).collect())
    }

    async fn patch(
        &self,
        _ctx: &CallerContext,
        id: &ResourceId,
        patch: &E::Patch,
    ) -> FactoryResult<E> {
        let mut state = self
            .state
            .write()
            .map_err(|_| FactoryError::internal("lock poisoned"))?;

        let slot = state
            .entities
            .get_mut(id)
            .ok_or_else(|| FactoryError::not_found(E::KIND, id))?;

        slot.entity.apply(patch);
        Ok(slot.entity.clone())
    }

    async fn delete(&self, _ctx: &CallerContext, id: &ResourceId) -> FactoryResult<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| FactoryError::internal("lock poisoned"))?;

        state
            .entities
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| FactoryError::not_found(E::KIND, id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{Header, SourceRepository, StatusPatch};
    use crate::resource::Resource;
    use crate::types::Status;

    fn repo(owner: &str, path: &str) -> SourceRepository {
        SourceRepository {
            header: Header::pending(),
            owner: ResourceId::new(owner),
            name: path.rsplit('/').next().unwrap_or(path).to_owned(),
            path: path.to_owned(),
            remote_url: None,
        }
    }

    #[tokio::test]
    async fn insert_assigns_identity() {
        let store = MemoryCollection::new();
        let ctx = CallerContext::new("tester");

        let stored = store.insert(&ctx, repo("c-1", "acme/orders/api")).await.unwrap();
        assert!(!stored.id().is_unassigned());

        let fetched = store.get(&ctx, stored.id()).await.unwrap().unwrap();
        assert_eq!(fetched.path, "acme/orders/api");
    }

    #[tokio::test]
    async fn duplicate_path_is_rejected() {
        let store = MemoryCollection::new();
        let ctx = CallerContext::new("tester");

        store.insert(&ctx, repo("c-1", "acme/orders/api")).await.unwrap();
        let err = store
            .insert(&ctx, repo("c-2", "acme/orders/api"))
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn list_filters_and_keeps_insertion_order() {
        let store = MemoryCollection::new();
        let ctx = CallerContext::new("tester");

        store.insert(&ctx, repo("c-1", "a/1")).await.unwrap();
        store.insert(&ctx, repo("c-2", "a/2")).await.unwrap();
        store.insert(&ctx, repo("c-1", "a/3")).await.unwrap();

        let owned = store
            .list(&ctx, &Filter::new().with_owner(ResourceId::new("c-1")))
            .await
            .unwrap();
        let paths: Vec<_> = owned.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["a/1", "a/3"]);

        let by_path = store
            .list(&ctx, &Filter::new().with_path("a/2"))
            .await
            .unwrap();
        assert_eq!(by_path.len(), 1);
    }

    #[tokio::test]
    async fn patch_and_delete_missing() {
        let store: MemoryCollection<SourceRepository> = MemoryCollection::new();
        let ctx = CallerContext::new("tester");
        let missing = ResourceId::new("nope");

        let err = store
            .patch(&ctx, &missing, &StatusPatch::status(Status::Ready).into())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.delete(&ctx, &missing).await.unwrap_err().is_not_found());
    }
}
