//! HTTP clients for the remote backends.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::config::EndpointConfig;
use crate::context::CallerContext;
use crate::error::{FactoryError, FactoryResult};
use crate::types::{BuildNumber, BuildStatus};

use super::{
    BranchInfo, BuildRequest, BuildSummary, CodeGenerator, CommitInfo, CommitRequest,
    ContinuousIntegration, GenerationRequest, PipelineRegistration, RegisteredPipeline,
    RemoteRepository, VersionControl,
};

/// Base URL and client shared by the calls to one backend.
#[derive(Debug, Clone)]
struct Endpoint {
    backend: &'static str,
    client: Client,
    base_url: Url,
}

impl Endpoint {
    fn new(backend: &'static str, config: &EndpointConfig) -> FactoryResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(FactoryError::Http)?;
        let base_url = Url::parse(config.url.trim_end_matches('/'))
            .map_err(|e| FactoryError::Config(format!("invalid {backend} URL: {e}")))?;

        if base_url.cannot_be_a_base() {
            return Err(FactoryError::Config(format!(
                "{backend} URL '{}' cannot be a base",
                config.url
            )));
        }

        Ok(Self {
            backend,
            client,
            base_url,
        })
    }

    /// URL of `segments` below the base, each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorised(&self, request: RequestBuilder, ctx: &CallerContext) -> RequestBuilder {
        match ctx.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, ctx: &CallerContext) -> FactoryResult<Response> {
        self.authorised(request, ctx)
            .send()
            .await
            .map_err(FactoryError::Http)
    }

    fn failure(&self, action: &str, status: StatusCode) -> FactoryError {
        FactoryError::backend(self.backend, format!("failed to {action}: {status}"))
    }

    /// Map a delete response: a missing target counts as deleted.
    fn deleted(&self, action: &str, response: &Response) -> FactoryResult<()> {
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(self.failure(action, status)),
        }
    }
}

// =============================================================================
// Version control
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRepository<'a> {
    path: &'a str,
    deploy_keys: &'a [String],
}

/// Client for the version-control service.
#[derive(Debug, Clone)]
pub struct HttpVersionControl {
    endpoint: Endpoint,
}

impl HttpVersionControl {
    /// Create a client from configuration.
    pub fn new(config: &EndpointConfig) -> FactoryResult<Self> {
        Ok(Self {
            endpoint: Endpoint::new("vcs", config)?,
        })
    }
}

#[async_trait]
impl VersionControl for HttpVersionControl {
    async fn create_repository(
        &self,
        ctx: &CallerContext,
        path: &str,
        deploy_keys: &[String],
    ) -> FactoryResult<RemoteRepository> {
        let url = self.endpoint.url(&["repositories"]);
        let request = self
            .endpoint
            .client
            .post(url)
            .json(&CreateRepository { path, deploy_keys });
        let response = self.endpoint.send(request, ctx).await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                response.json().await.map_err(FactoryError::Http)
            }
            status => Err(self
                .endpoint
                .failure(&format!("create repository '{path}'"), status)),
        }
    }

    async fn delete_repository(&self, ctx: &CallerContext, path: &str) -> FactoryResult<()> {
        let url = self.endpoint.url(&["repositories", path]);
        let response = self
            .endpoint
            .send(self.endpoint.client.delete(url), ctx)
            .await?;
        self.endpoint
            .deleted(&format!("delete repository '{path}'"), &response)
    }

    async fn commit(
        &self,
        ctx: &CallerContext,
        path: &str,
        request: &CommitRequest,
    ) -> FactoryResult<CommitInfo> {
        let url = self.endpoint.url(&["repositories", path, "commits"]);
        let response = self
            .endpoint
            .send(self.endpoint.client.post(url).json(request), ctx)
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                response.json().await.map_err(FactoryError::Http)
            }
            StatusCode::PRECONDITION_FAILED => Err(FactoryError::PreconditionFailed(format!(
                "'{path}' already has {}",
                request.tag.as_deref().unwrap_or("this content")
            ))),
            status => Err(self.endpoint.failure(&format!("commit to '{path}'"), status)),
        }
    }

    async fn list_branches(
        &self,
        ctx: &CallerContext,
        path: &str,
    ) -> FactoryResult<Vec<BranchInfo>> {
        let url = self.endpoint.url(&["repositories", path, "branches"]);
        let response = self.endpoint.send(self.endpoint.client.get(url), ctx).await?;

        if !response.status().is_success() {
            return Err(self
                .endpoint
                .failure(&format!("list branches of '{path}'"), response.status()));
        }
        response.json().await.map_err(FactoryError::Http)
    }

    async fn list_commits(
        &self,
        ctx: &CallerContext,
        path: &str,
        branch: &str,
    ) -> FactoryResult<Vec<CommitInfo>> {
        let url = self
            .endpoint
            .url(&["repositories", path, "branches", branch, "commits"]);
        let response = self.endpoint.send(self.endpoint.client.get(url), ctx).await?;

        if !response.status().is_success() {
            return Err(self
                .endpoint
                .failure(&format!("list commits of '{path}'"), response.status()));
        }
        response.json().await.map_err(FactoryError::Http)
    }

    async fn get_file(
        &self,
        ctx: &CallerContext,
        path: &str,
        file: &str,
        reference: &str,
    ) -> FactoryResult<String> {
        let url = self.endpoint.url(&["repositories", path, "files", file]);
        let request = self.endpoint.client.get(url).query(&[("ref", reference)]);
        let response = self.endpoint.send(request, ctx).await?;

        if !response.status().is_success() {
            return Err(self.endpoint.failure(
                &format!("read '{file}' at '{reference}' from '{path}'"),
                response.status(),
            ));
        }
        response.text().await.map_err(FactoryError::Http)
    }
}

// =============================================================================
// CI
// =============================================================================

#[derive(Deserialize)]
struct SubmittedBuild {
    number: BuildNumber,
}

#[derive(Deserialize)]
struct BuildState {
    status: BuildStatus,
}

/// Client for the CI service.
#[derive(Debug, Clone)]
pub struct HttpContinuousIntegration {
    endpoint: Endpoint,
}

impl HttpContinuousIntegration {
    /// Create a client from configuration.
    pub fn new(config: &EndpointConfig) -> FactoryResult<Self> {
        Ok(Self {
            endpoint: Endpoint::new("ci", config)?,
        })
    }
}

#[async_trait]
impl ContinuousIntegration for HttpContinuousIntegration {
    async fn register_pipeline(
        &self,
        ctx: &CallerContext,
        registration: &PipelineRegistration,
    ) -> FactoryResult<RegisteredPipeline> {
        let url = self.endpoint.url(&["pipelines"]);
        let response = self
            .endpoint
            .send(self.endpoint.client.post(url).json(registration), ctx)
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                response.json().await.map_err(FactoryError::Http)
            }
            status => Err(self.endpoint.failure(
                &format!("register pipeline '{}'", registration.path),
                status,
            )),
        }
    }

    async fn submit_build(
        &self,
        ctx: &CallerContext,
        provider_id: &str,
        request: &BuildRequest,
    ) -> FactoryResult<BuildNumber> {
        let url = self.endpoint.url(&["pipelines", provider_id, "builds"]);
        let response = self
            .endpoint
            .send(self.endpoint.client.post(url).json(request), ctx)
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => {
                let submitted: SubmittedBuild = response.json().await.map_err(FactoryError::Http)?;
                Ok(submitted.number)
            }
            status => Err(self
                .endpoint
                .failure(&format!("submit build to '{provider_id}'"), status)),
        }
    }

    async fn build_status(
        &self,
        ctx: &CallerContext,
        provider_id: &str,
        number: BuildNumber,
    ) -> FactoryResult<BuildStatus> {
        let number = number.to_string();
        let url = self
            .endpoint
            .url(&["pipelines", provider_id, "builds", &number]);
        let response = self.endpoint.send(self.endpoint.client.get(url), ctx).await?;

        if !response.status().is_success() {
            return Err(self.endpoint.failure(
                &format!("get build {number} of '{provider_id}'"),
                response.status(),
            ));
        }
        let state: BuildState = response.json().await.map_err(FactoryError::Http)?;
        Ok(state.status)
    }

    async fn list_builds(
        &self,
        ctx: &CallerContext,
        provider_id: &str,
        reference: &str,
    ) -> FactoryResult<Vec<BuildSummary>> {
        let url = self.endpoint.url(&["pipelines", provider_id, "builds"]);
        let request = self.endpoint.client.get(url).query(&[("reference", reference)]);
        let response = self.endpoint.send(request, ctx).await?;

        if !response.status().is_success() {
            return Err(self
                .endpoint
                .failure(&format!("list builds of '{provider_id}'"), response.status()));
        }
        response.json().await.map_err(FactoryError::Http)
    }

    async fn delete_pipeline(&self, ctx: &CallerContext, provider_id: &str) -> FactoryResult<()> {
        let url = self.endpoint.url(&["pipelines", provider_id]);
        let response = self
            .endpoint
            .send(self.endpoint.client.delete(url), ctx)
            .await?;
        self.endpoint
            .deleted(&format!("delete pipeline '{provider_id}'"), &response)
    }
}

// =============================================================================
// Code generator
// =============================================================================

/// Client for the code generation service.
#[derive(Debug, Clone)]
pub struct HttpCodeGenerator {
    endpoint: Endpoint,
}

impl HttpCodeGenerator {
    /// Create a client from configuration.
    pub fn new(config: &EndpointConfig) -> FactoryResult<Self> {
        Ok(Self {
            endpoint: Endpoint::new("generator", config)?,
        })
    }

    async fn archive(&self, action: &str, response: Response) -> FactoryResult<Bytes> {
        if !response.status().is_success() {
            return Err(self.endpoint.failure(action, response.status()));
        }
        response.bytes().await.map_err(FactoryError::Http)
    }
}

#[async_trait]
impl CodeGenerator for HttpCodeGenerator {
    async fn generate(
        &self,
        ctx: &CallerContext,
        request: &GenerationRequest,
    ) -> FactoryResult<Bytes> {
        let url = self.endpoint.url(&["generate"]);
        let response = self
            .endpoint
            .send(self.endpoint.client.post(url).json(request), ctx)
            .await?;
        self.archive(&format!("generate '{}'", request.artifact_name), response)
            .await
    }

    async fn render_template(
        &self,
        ctx: &CallerContext,
        template: &str,
        args: &BTreeMap<String, String>,
    ) -> FactoryResult<Bytes> {
        let url = self.endpoint.url(&["templates", template]);
        let response = self
            .endpoint
            .send(self.endpoint.client.post(url).json(args), ctx)
            .await?;
        self.archive(&format!("render template '{template}'"), response)
            .await
    }
}
