//! Configuration for foundry-control.

use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{FactoryError, FactoryResult};
use crate::types::{Language, LibraryKind};

/// Top-level configuration for the provisioning engine.
#[derive(Debug, Clone, Deserialize)]
pub struct FactoryConfig {
    /// Which backend implementations to wire.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Inventory store client.
    #[serde(default = "default_inventory")]
    pub inventory: EndpointConfig,

    /// Version-control backend client.
    #[serde(default = "default_version_control")]
    pub version_control: EndpointConfig,

    /// CI backend client.
    #[serde(default = "default_ci")]
    pub ci: EndpointConfig,

    /// Code generator client.
    #[serde(default = "default_generator")]
    pub generator: EndpointConfig,

    /// Build monitoring.
    #[serde(default)]
    pub build: BuildConfig,

    /// Library matrix provisioned for every component.
    #[serde(default)]
    pub matrix: MatrixConfig,

    /// Repository layout.
    #[serde(default)]
    pub repository: RepositoryConfig,

    /// Artifact naming.
    #[serde(default)]
    pub artifacts: ArtifactConfig,
}

impl FactoryConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `foundry.toml` in the current directory (if present)
    /// 3. Environment variables with `FOUNDRY_CONTROL_` prefix
    pub fn load() -> FactoryResult<Self> {
        Self::from_file("foundry.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> FactoryResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FOUNDRY_CONTROL_").split("__"))
            .extract::<Self>()
            .map_err(|e| FactoryError::Config(e.to_string()))?
            .validated()
    }

    /// Reject settings the engine cannot run with.
    pub fn validated(self) -> FactoryResult<Self> {
        if self.matrix.languages.is_empty() || self.matrix.kinds.is_empty() {
            return Err(FactoryError::Config(
                "library matrix must name at least one language and one kind".to_owned(),
            ));
        }
        if self.build.poll_interval.is_zero() {
            return Err(FactoryError::Config(
                "build poll interval must be positive".to_owned(),
            ));
        }
        if self.repository.api_spec_file.is_empty() || self.repository.default_branch.is_empty() {
            return Err(FactoryError::Config(
                "repository branch and spec file must be set".to_owned(),
            ));
        }
        Ok(self)
    }
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            inventory: default_inventory(),
            version_control: default_version_control(),
            ci: default_ci(),
            generator: default_generator(),
            build: BuildConfig::default(),
            matrix: MatrixConfig::default(),
            repository: RepositoryConfig::default(),
            artifacts: ArtifactConfig::default(),
        }
    }
}

/// Backend selection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    /// Kind of backends to use.
    #[serde(default)]
    pub kind: BackendKind,
}

/// Kind of backend implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Remote services over HTTP.
    #[default]
    Http,

    /// In-process backends for testing.
    Memory,
}

/// HTTP endpoint of one backend.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Base URL.
    pub url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl EndpointConfig {
    /// Endpoint at `url` with the default timeout.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

const fn default_timeout_secs() -> u64 {
    10
}

fn default_inventory() -> EndpointConfig {
    EndpointConfig::new("http://localhost:8090")
}

fn default_version_control() -> EndpointConfig {
    EndpointConfig::new("http://localhost:8091")
}

fn default_ci() -> EndpointConfig {
    EndpointConfig::new("http://localhost:8092")
}

fn default_generator() -> EndpointConfig {
    EndpointConfig::new("http://localhost:8093")
}

/// Build monitoring configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Pause between two build status checks, in milliseconds.
    #[serde(with = "serde_duration_millis")]
    pub poll_interval: Duration,

    /// Give up monitoring after this long, in milliseconds.
    #[serde(with = "serde_duration_millis")]
    pub timeout: Duration,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Library matrix configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    /// Languages every component gets a library for.
    pub languages: Vec<Language>,

    /// Packaging kinds every component gets a library for.
    pub kinds: Vec<LibraryKind>,

    /// Pause between two library creations, in milliseconds.
    #[serde(with = "serde_duration_millis")]
    pub library_stagger: Duration,
}

impl MatrixConfig {
    /// Every (language, kind) pair, languages outermost.
    #[must_use]
    pub fn pairs(&self) -> Vec<(Language, LibraryKind)> {
        self.languages
            .iter()
            .flat_map(|language| self.kinds.iter().map(move |kind| (*language, *kind)))
            .collect()
    }

    /// Number of libraries every component expects.
    #[must_use]
    pub fn size(&self) -> usize {
        self.languages.len() * self.kinds.len()
    }
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            languages: vec![Language::Java, Language::Python],
            kinds: vec![LibraryKind::Client, LibraryKind::Server],
            library_stagger: Duration::from_millis(500),
        }
    }
}

/// Repository layout configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Branch commits and builds target.
    pub default_branch: String,

    /// Name of the API spec file in component API repositories.
    pub api_spec_file: String,

    /// Prefix prepended to every repository path.
    pub path_prefix: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            default_branch: "master".to_owned(),
            api_spec_file: "api.yaml".to_owned(),
            path_prefix: String::new(),
        }
    }
}

/// Artifact naming configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Artifact group used when a component carries no API group id.
    pub default_group: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            default_group: "com.foundry".to_owned(),
        }
    }
}

/// Serde helper for Duration as milliseconds.
mod serde_duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
