//! HTTP client for one collection of the remote inventory store.

use std::marker::PhantomData;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};

use crate::context::CallerContext;
use crate::error::{FactoryError, FactoryResult};
use crate::model::Entity;
use crate::types::ResourceId;

use super::{Collection, Filter};

/// Inventory collection served at `{base_url}/{collection}`.
#[derive(Debug)]
pub struct HttpCollection<E> {
    client: Client,
    base_url: String,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> HttpCollection<E> {
    /// Create a collection client sharing `client`.
    #[must_use]
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            _entity: PhantomData,
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/{}", self.base_url, E::KIND.collection())
    }

    fn entity_url(&self, id: &ResourceId) -> String {
        format!("{}/{}/{}", self.base_url, E::KIND.collection(), id)
    }
}

fn authorised(request: RequestBuilder, ctx: &CallerContext) -> RequestBuilder {
    match ctx.token() {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

fn unexpected(action: &str, status: StatusCode) -> FactoryError {
    FactoryError::backend("inventory", format!("failed to {action}: {status}"))
}

#[async_trait]
impl<E: Entity> Collection<E> for HttpCollection<E> {
    async fn insert(&self, ctx: &CallerContext, entity: E) -> FactoryResult<E> {
        let response = authorised(self.client.post(self.collection_url()), ctx)
            .json(&entity)
            .send()
            .await
            .map_err(FactoryError::Http)?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                response.json().await.map_err(FactoryError::Http)
            }
            StatusCode::CONFLICT => Err(FactoryError::already_exists(
                E::KIND,
                entity.path().unwrap_or_else(|| entity.name()),
            )),
            status => Err(unexpected(&format!("insert {}", E::KIND), status)),
        }
    }

    async fn get(&self, ctx: &CallerContext, id: &ResourceId) -> FactoryResult<Option<E>> {
        let response = authorised(self.client.get(self.entity_url(id)), ctx)
            .send()
            .await
            .map_err(FactoryError::Http)?;

        match response.status() {
            StatusCode::OK => response.json().await.map(Some).map_err(FactoryError::Http),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(unexpected(&format!("get {} {id}", E::KIND), status)),
        }
    }

    async fn list(&self, ctx: &CallerContext, filter: &Filter) -> FactoryResult<Vec<E>> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(ref owner) = filter.owner {
            query.push(("owner", owner.as_str()));
        }
        if let Some(ref name) = filter.name {
            query.push(("name", name.as_str()));
        }
        if let Some(ref path) = filter.path {
            query.push(("path", path.as_str()));
        }

        let response = authorised(self.client.get(self.collection_url()), ctx)
            .query(&query)
            .send()
            .await
            .map_err(FactoryError::Http)?;

        if !response.status().is_success() {
            return Err(unexpected(&format!("list {}", E::KIND), response.status()));
        }

        response.json().await.map_err(FactoryError::Http)
    }

    async fn patch(
        &self,
        ctx: &CallerContext,
        id: &ResourceId,
        patch: &E::Patch,
    ) -> FactoryResult<E> {
        let response = authorised(self.client.patch(self.entity_url(id)), ctx)
            .json(patch)
            .send()
            .await
            .map_err(FactoryError::Http)?;

        match response.status() {
            StatusCode::OK => response.json().await.map_err(FactoryError::Http),
            StatusCode::NOT_FOUND => Err(FactoryError::not_found(E::KIND, id)),
            status => Err(unexpected(&format!("patch {} {id}", E::KIND), status)),
        }
    }

    async fn delete(&self, ctx: &CallerContext, id: &ResourceId) -> FactoryResult<()> {
        let response = authorised(self.client.delete(self.entity_url(id)), ctx)
            .send()
            .await
            .map_err(FactoryError::Http)?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => Err(FactoryError::not_found(E::KIND, id)),
            status => Err(unexpected(&format!("delete {} {id}", E::KIND), status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Group, LibraryApiVersion};

    #[test]
    fn urls_use_collection_names() {
        let groups: HttpCollection<Group> = HttpCollection::new(Client::new(), "http://inv:8090/");
        assert_eq!(groups.collection_url(), "http://inv:8090/groups");

        let versions: HttpCollection<LibraryApiVersion> =
            HttpCollection::new(Client::new(), "http://inv:8090");
        assert_eq!(
            versions.entity_url(&ResourceId::new("01h")),
            "http://inv:8090/library-api-versions/01h"
        );
    }
}
