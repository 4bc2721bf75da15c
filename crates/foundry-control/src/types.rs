//! Core types for foundry-control.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{FactoryError, FactoryResult};

/// Pattern for resource names.
static NAME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Za-z_-]+$").ok());

/// Pattern for `X.Y.Z` versions.
static VERSION_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^([0-9]+)\.([0-9]+)\.([0-9]+)$").ok());

/// Open string-to-string side channel carried by every resource.
pub type Metadata = BTreeMap<String, String>;

/// Well-known metadata keys.
pub mod keys {
    /// Identifier of the owning group.
    pub const GROUP_ID: &str = "groupId";
    /// Path of the owning group.
    pub const GROUP_PATH: &str = "groupPath";
    /// Artifact group used for generated API bindings.
    pub const API_GROUP_ID: &str = "apiGroupId";
    /// Credential identifier allowed to write to provisioned repositories.
    pub const DEPLOY_KEY: &str = "deployKey";
    /// Artifact name of an implementation.
    pub const ARTIFACT_NAME: &str = "artifactName";
    /// Artifact group of an implementation.
    pub const ARTIFACT_GROUP_ID: &str = "artifactGroupId";
    /// Number of the last build submitted for a pipeline.
    pub const LAST_BUILD_NUMBER: &str = "lastBuildNumber";
    /// Number of the build that produced a version.
    pub const BUILD_NUMBER: &str = "buildNumber";
    /// Serialised error trace recorded on failure.
    pub const ERROR_STACK_TRACE: &str = "error-stack-trace";
}

/// Opaque resource identifier assigned by the inventory store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Create a resource ID from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique resource ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True until the inventory has assigned an identity.
    #[must_use]
    pub fn is_unassigned(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ResourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Lifecycle status shared by every resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Registered, provisioning in progress.
    #[default]
    Pending,
    /// Provisioning or rollup confirmed complete.
    Ready,
    /// A mutation is being re-applied to a READY resource.
    Updating,
    /// A step failed; the trace is in the metadata.
    Error,
    /// A build poll loop timed out (pipelines only).
    Unstable,
    /// Removed from the provisioning domain.
    Deleted,
}

impl Status {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Ready => "READY",
            Self::Updating => "UPDATING",
            Self::Error => "ERROR",
            Self::Unstable => "UNSTABLE",
            Self::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "READY" => Ok(Self::Ready),
            "UPDATING" => Ok(Self::Updating),
            "ERROR" => Ok(Self::Error),
            "UNSTABLE" => Ok(Self::Unstable),
            "DELETED" => Ok(Self::Deleted),
            _ => Err(format!("unknown resource status: {s}")),
        }
    }
}

/// Target language of generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Language {
    /// Java.
    Java,
    /// Python.
    Python,
    /// TypeScript.
    Typescript,
    /// Go.
    Go,
}

impl Language {
    /// Get the language name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Java => "JAVA",
            Self::Python => "PYTHON",
            Self::Typescript => "TYPESCRIPT",
            Self::Go => "GO",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Packaging kind of a library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LibraryKind {
    /// Client binding.
    Client,
    /// Server stub.
    Server,
}

impl LibraryKind {
    /// Get the kind name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "CLIENT",
            Self::Server => "SERVER",
        }
    }
}

impl fmt::Display for LibraryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// CI pipeline template name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Template(String);

impl Template {
    /// Create a template from its name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Template building a library of the given language and kind.
    #[must_use]
    pub fn for_library(language: Language, kind: LibraryKind) -> Self {
        Self(format!("{}_{}", language.as_str(), kind.as_str()))
    }

    /// Template building a service implementation.
    ///
    /// Only JAVA and PYTHON services have a template.
    pub fn for_implementation(language: Language) -> FactoryResult<Self> {
        match language {
            Language::Java => Ok(Self::new("JAVA_SERVICE")),
            Language::Python => Ok(Self::new("PYTHON_SERVICE")),
            other => Err(FactoryError::UnsupportedLanguage(other)),
        }
    }

    /// Get the template name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when no template name is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Build number assigned by the CI backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildNumber(pub u64);

impl fmt::Display for BuildNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of an ephemeral CI build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    /// Accepted, waiting for an executor.
    Scheduled,
    /// Running.
    Processing,
    /// Finished successfully.
    Success,
    /// Finished with a failure.
    Failed,
}

impl BuildStatus {
    /// True for SUCCESS and FAILED.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Processing => "PROCESSING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A `X.Y.Z` semantic version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SemanticVersion {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
}

impl SemanticVersion {
    /// First version built for every new implementation.
    pub const INITIAL: Self = Self {
        major: 1,
        minor: 0,
        patch: 0,
    };

    /// Parse a version matching `^[0-9]+\.[0-9]+\.[0-9]+$`.
    pub fn parse(version: &str) -> FactoryResult<Self> {
        let captures = VERSION_PATTERN
            .as_ref()
            .and_then(|pattern| pattern.captures(version))
            .ok_or_else(|| {
                FactoryError::validation(format!("version '{version}' is not of the form X.Y.Z"))
            })?;

        let component = |index: usize| -> FactoryResult<u64> {
            captures[index].parse().map_err(|_| {
                FactoryError::validation(format!("version component out of range in '{version}'"))
            })
        };

        Ok(Self {
            major: component(1)?,
            minor: component(2)?,
            patch: component(3)?,
        })
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Check a resource name against `[0-9A-Za-z_-]+`.
pub fn validate_name(name: &str) -> FactoryResult<()> {
    let valid = NAME_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(name));

    if valid {
        Ok(())
    } else {
        Err(FactoryError::validation(format!(
            "name '{name}' must match [0-9A-Za-z_-]+"
        )))
    }
}

/// Derive an artifact name: lower-cased, letters only.
#[must_use]
pub fn artifact_name(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
