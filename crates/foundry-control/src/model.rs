//! Entities tracked in the inventory and their partial-update values.
//!
//! Every entity embeds a [`Header`] (identity, status, metadata, timestamps)
//! and is mutated only through its `Patch` type: every field of a patch is
//! optional, and applying it touches only the fields that are present. This
//! is what lets sibling tasks update the same record without clobbering one
//! another.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::inventory::{Collection, Inventory};
use crate::resource::Resource;
use crate::types::{Language, LibraryKind, Metadata, ResourceId, Status, Template};

/// Kind of a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Namespace owning components.
    Group,
    /// Versioned API-backed software unit.
    Component,
    /// Generated binding of a component for one language and kind.
    Library,
    /// Version-control repository.
    SourceRepository,
    /// CI pipeline.
    Pipeline,
    /// Language-specific implementation of a component API.
    Implementation,
    /// One build of an implementation.
    ImplementationVersion,
    /// Tagged snapshot of a component API spec.
    ApiVersion,
    /// Generated binding of one library for one API version.
    LibraryApiVersion,
}

impl ResourceKind {
    /// Human readable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Component => "component",
            Self::Library => "library",
            Self::SourceRepository => "source repository",
            Self::Pipeline => "pipeline",
            Self::Implementation => "implementation",
            Self::ImplementationVersion => "implementation version",
            Self::ApiVersion => "api version",
            Self::LibraryApiVersion => "library api version",
        }
    }

    /// Collection name used by the inventory API.
    #[must_use]
    pub const fn collection(&self) -> &'static str {
        match self {
            Self::Group => "groups",
            Self::Component => "components",
            Self::Library => "libraries",
            Self::SourceRepository => "repositories",
            Self::Pipeline => "pipelines",
            Self::Implementation => "implementations",
            Self::ImplementationVersion => "implementation-versions",
            Self::ApiVersion => "api-versions",
            Self::LibraryApiVersion => "library-api-versions",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fields shared by every entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// Identity assigned by the inventory on insert.
    #[serde(default)]
    pub id: ResourceId,
    /// Lifecycle status.
    pub status: Status,
    /// Cross-stage bookkeeping.
    #[serde(default)]
    pub metadata: Metadata,
    /// When the record was registered.
    pub created_at: DateTime<Utc>,
    /// When the record was last patched.
    pub updated_at: DateTime<Utc>,
}

impl Header {
    /// Header of a record about to be registered.
    #[must_use]
    pub fn pending() -> Self {
        let now = Utc::now();
        Self {
            id: ResourceId::default(),
            status: Status::Pending,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Header with initial metadata.
    #[must_use]
    pub fn pending_with(metadata: Metadata) -> Self {
        Self {
            metadata,
            ..Self::pending()
        }
    }

    fn apply(&mut self, patch: &StatusPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        for (key, value) in &patch.metadata {
            self.metadata.insert(key.clone(), value.clone());
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update of the fields every entity has.
///
/// Metadata entries are merged into the stored map, never replacing it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPatch {
    /// New status, if changing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    /// Metadata entries to set.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl StatusPatch {
    /// Patch changing only the status.
    #[must_use]
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            metadata: Metadata::new(),
        }
    }

    /// Patch setting a single metadata entry.
    #[must_use]
    pub fn metadata(key: &str, value: impl Into<String>) -> Self {
        Self::default().with_metadata(key, value)
    }

    /// Add a metadata entry to this patch.
    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }
}

/// Patch type of an entity.
pub trait EntityPatch:
    From<StatusPatch> + fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Fields shared with every other patch.
    fn common(&self) -> &StatusPatch;
}

impl EntityPatch for StatusPatch {
    fn common(&self) -> &StatusPatch {
        self
    }
}

/// A resource stored in one inventory collection.
pub trait Entity:
    Resource + fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind stored in this collection.
    const KIND: ResourceKind;

    /// Partial update type.
    type Patch: EntityPatch;

    /// The collection holding entities of this type.
    fn collection(inventory: &Inventory) -> &Arc<dyn Collection<Self>>;

    /// Parent resource, if any.
    fn owner(&self) -> Option<&ResourceId>;

    /// Natural name used by list filters.
    fn name(&self) -> &str;

    /// Globally unique path, for entities that have one.
    fn path(&self) -> Option<&str> {
        None
    }

    /// Apply a partial update.
    fn apply(&mut self, patch: &Self::Patch);
}

macro_rules! header_resource {
    ($ty:ty, $kind:expr) => {
        impl Resource for $ty {
            fn header(&self) -> &Header {
                &self.header
            }

            fn header_mut(&mut self) -> &mut Header {
                &mut self.header
            }

            fn kind(&self) -> ResourceKind {
                $kind
            }
        }
    };
}

// =============================================================================
// Group
// =============================================================================

/// Namespace with a hierarchical path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// Shared fields.
    #[serde(flatten)]
    pub header: Header,
    /// Display name.
    pub name: String,
    /// Hierarchical path, e.g. `/acme`.
    pub path: String,
}

header_resource!(Group, ResourceKind::Group);

impl Entity for Group {
    const KIND: ResourceKind = ResourceKind::Group;
    type Patch = StatusPatch;

    fn collection(inventory: &Inventory) -> &Arc<dyn Collection<Self>> {
        &inventory.groups
    }

    fn owner(&self) -> Option<&ResourceId> {
        None
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> Option<&str> {
        Some(&self.path)
    }

    fn apply(&mut self, patch: &Self::Patch) {
        self.header.apply(patch);
    }
}

// =============================================================================
// Component
// =============================================================================

/// Versioned API-backed software unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    /// Shared fields.
    #[serde(flatten)]
    pub header: Header,
    /// Owning group.
    pub group_id: ResourceId,
    /// Name, unique within the group.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

header_resource!(Component, ResourceKind::Component);

impl Entity for Component {
    const KIND: ResourceKind = ResourceKind::Component;
    type Patch = StatusPatch;

    fn collection(inventory: &Inventory) -> &Arc<dyn Collection<Self>> {
        &inventory.components
    }

    fn owner(&self) -> Option<&ResourceId> {
        Some(&self.group_id)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, patch: &Self::Patch) {
        self.header.apply(patch);
    }
}

// =============================================================================
// Library
// =============================================================================

/// Binding of a component for one language and packaging kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Library {
    /// Shared fields.
    #[serde(flatten)]
    pub header: Header,
    /// Owning component.
    pub component_id: ResourceId,
    /// Derived name, e.g. `orders-java-client`.
    pub name: String,
    /// Target language.
    pub language: Language,
    /// Packaging kind.
    pub kind: LibraryKind,
}

header_resource!(Library, ResourceKind::Library);

impl Entity for Library {
    const KIND: ResourceKind = ResourceKind::Library;
    type Patch = StatusPatch;

    fn collection(inventory: &Inventory) -> &Arc<dyn Collection<Self>> {
        &inventory.libraries
    }

    fn owner(&self) -> Option<&ResourceId> {
        Some(&self.component_id)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, patch: &Self::Patch) {
        self.header.apply(patch);
    }
}

// =============================================================================
// SourceRepository
// =============================================================================

/// Version-control repository owned by a component, library or
/// implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRepository {
    /// Shared fields.
    #[serde(flatten)]
    pub header: Header,
    /// Owning resource.
    pub owner: ResourceId,
    /// Repository name.
    pub name: String,
    /// Globally unique repository path.
    pub path: String,
    /// Remote URL assigned by the version-control backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
}

impl SourceRepository {
    /// Remote URL, if assigned and non-empty.
    #[must_use]
    pub fn remote(&self) -> Option<&str> {
        self.remote_url.as_deref().filter(|url| !url.is_empty())
    }
}

header_resource!(SourceRepository, ResourceKind::SourceRepository);

/// Partial update of a [`SourceRepository`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryPatch {
    /// Shared fields.
    #[serde(flatten)]
    pub common: StatusPatch,
    /// New remote URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
}

impl From<StatusPatch> for RepositoryPatch {
    fn from(common: StatusPatch) -> Self {
        Self {
            common,
            remote_url: None,
        }
    }
}

impl EntityPatch for RepositoryPatch {
    fn common(&self) -> &StatusPatch {
        &self.common
    }
}

impl Entity for SourceRepository {
    const KIND: ResourceKind = ResourceKind::SourceRepository;
    type Patch = RepositoryPatch;

    fn collection(inventory: &Inventory) -> &Arc<dyn Collection<Self>> {
        &inventory.repositories
    }

    fn owner(&self) -> Option<&ResourceId> {
        Some(&self.owner)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> Option<&str> {
        Some(&self.path)
    }

    fn apply(&mut self, patch: &Self::Patch) {
        self.header.apply(&patch.common);
        if let Some(url) = &patch.remote_url {
            self.remote_url = Some(url.clone());
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// CI pipeline bound to one repository and template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    /// Shared fields.
    #[serde(flatten)]
    pub header: Header,
    /// Owning resource.
    pub owner: ResourceId,
    /// Repository the pipeline builds.
    pub repository_id: ResourceId,
    /// Pipeline name.
    pub name: String,
    /// Pipeline path in the CI backend.
    pub path: String,
    /// Build template.
    pub template: Template,
    /// CI backend that registered the pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Identity of the pipeline inside the CI backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

header_resource!(Pipeline, ResourceKind::Pipeline);

/// Partial update of a [`Pipeline`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelinePatch {
    /// Shared fields.
    #[serde(flatten)]
    pub common: StatusPatch,
    /// CI backend name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// CI backend identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

impl From<StatusPatch> for PipelinePatch {
    fn from(common: StatusPatch) -> Self {
        Self {
            common,
            provider: None,
            provider_id: None,
        }
    }
}

impl EntityPatch for PipelinePatch {
    fn common(&self) -> &StatusPatch {
        &self.common
    }
}

impl Entity for Pipeline {
    const KIND: ResourceKind = ResourceKind::Pipeline;
    type Patch = PipelinePatch;

    fn collection(inventory: &Inventory) -> &Arc<dyn Collection<Self>> {
        &inventory.pipelines
    }

    fn owner(&self) -> Option<&ResourceId> {
        Some(&self.owner)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> Option<&str> {
        Some(&self.path)
    }

    fn apply(&mut self, patch: &Self::Patch) {
        self.header.apply(&patch.common);
        if let Some(provider) = &patch.provider {
            self.provider = Some(provider.clone());
        }
        if let Some(provider_id) = &patch.provider_id {
            self.provider_id = Some(provider_id.clone());
        }
    }
}

// =============================================================================
// Implementation
// =============================================================================

/// Language-specific implementation of a component API version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Implementation {
    /// Shared fields.
    #[serde(flatten)]
    pub header: Header,
    /// Owning component.
    pub component_id: ResourceId,
    /// API version the implementation is pinned to.
    pub api_version_id: ResourceId,
    /// Globally unique name.
    pub name: String,
    /// Implementation language.
    pub language: Language,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

header_resource!(Implementation, ResourceKind::Implementation);

impl Entity for Implementation {
    const KIND: ResourceKind = ResourceKind::Implementation;
    type Patch = StatusPatch;

    fn collection(inventory: &Inventory) -> &Arc<dyn Collection<Self>> {
        &inventory.implementations
    }

    fn owner(&self) -> Option<&ResourceId> {
        Some(&self.component_id)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, patch: &Self::Patch) {
        self.header.apply(patch);
    }
}

// =============================================================================
// ImplementationVersion
// =============================================================================

/// One build of an implementation at a semantic version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplementationVersion {
    /// Shared fields.
    #[serde(flatten)]
    pub header: Header,
    /// Owning implementation.
    pub implementation_id: ResourceId,
    /// `X.Y.Z` version, also used as the tag.
    pub version: String,
}

header_resource!(ImplementationVersion, ResourceKind::ImplementationVersion);

impl Entity for ImplementationVersion {
    const KIND: ResourceKind = ResourceKind::ImplementationVersion;
    type Patch = StatusPatch;

    fn collection(inventory: &Inventory) -> &Arc<dyn Collection<Self>> {
        &inventory.implementation_versions
    }

    fn owner(&self) -> Option<&ResourceId> {
        Some(&self.implementation_id)
    }

    fn name(&self) -> &str {
        &self.version
    }

    fn apply(&mut self, patch: &Self::Patch) {
        self.header.apply(patch);
    }
}

// =============================================================================
// ApiVersion
// =============================================================================

/// Tagged snapshot of the API spec in the component API repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiVersion {
    /// Shared fields.
    #[serde(flatten)]
    pub header: Header,
    /// Owning component.
    pub component_id: ResourceId,
    /// `X.Y.Z` version, also used as the tag.
    pub version: String,
}

header_resource!(ApiVersion, ResourceKind::ApiVersion);

impl Entity for ApiVersion {
    const KIND: ResourceKind = ResourceKind::ApiVersion;
    type Patch = StatusPatch;

    fn collection(inventory: &Inventory) -> &Arc<dyn Collection<Self>> {
        &inventory.api_versions
    }

    fn owner(&self) -> Option<&ResourceId> {
        Some(&self.component_id)
    }

    fn name(&self) -> &str {
        &self.version
    }

    fn apply(&mut self, patch: &Self::Patch) {
        self.header.apply(patch);
    }
}

// =============================================================================
// LibraryApiVersion
// =============================================================================

/// Generated binding of one library for one API version.
///
/// The aggregate status becomes READY only once both sub-statuses are.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryApiVersion {
    /// Shared fields.
    #[serde(flatten)]
    pub header: Header,
    /// Owning API version.
    pub api_version_id: ResourceId,
    /// Library the binding is generated into.
    pub library_id: ResourceId,
    /// Version of the API snapshot.
    pub version: String,
    /// Code generation and commit.
    pub api_repository_status: Status,
    /// CI build.
    pub pipeline_status: Status,
}

impl LibraryApiVersion {
    /// True when both sub-statuses are READY.
    #[must_use]
    pub fn parts_ready(&self) -> bool {
        self.api_repository_status == Status::Ready && self.pipeline_status == Status::Ready
    }
}

header_resource!(LibraryApiVersion, ResourceKind::LibraryApiVersion);

/// Partial update of a [`LibraryApiVersion`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryApiVersionPatch {
    /// Shared fields.
    #[serde(flatten)]
    pub common: StatusPatch,
    /// New code generation sub-status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_repository_status: Option<Status>,
    /// New build sub-status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_status: Option<Status>,
}

impl From<StatusPatch> for LibraryApiVersionPatch {
    fn from(common: StatusPatch) -> Self {
        Self {
            common,
            api_repository_status: None,
            pipeline_status: None,
        }
    }
}

impl EntityPatch for LibraryApiVersionPatch {
    fn common(&self) -> &StatusPatch {
        &self.common
    }
}

impl Entity for LibraryApiVersion {
    const KIND: ResourceKind = ResourceKind::LibraryApiVersion;
    type Patch = LibraryApiVersionPatch;

    fn collection(inventory: &Inventory) -> &Arc<dyn Collection<Self>> {
        &inventory.library_api_versions
    }

    fn owner(&self) -> Option<&ResourceId> {
        Some(&self.api_version_id)
    }

    fn name(&self) -> &str {
        &self.version
    }

    fn apply(&mut self, patch: &Self::Patch) {
        self.header.apply(&patch.common);
        if let Some(status) = patch.api_repository_status {
            self.api_repository_status = status;
        }
        if let Some(status) = patch.pipeline_status {
            self.pipeline_status = status;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::keys;

    fn repository() -> SourceRepository {
        SourceRepository {
            header: Header::pending(),
            owner: ResourceId::new("lib-1"),
            name: "orders-java-client".to_owned(),
            path: "acme/orders/java-client".to_owned(),
            remote_url: None,
        }
    }

    #[test]
    fn patch_touches_only_present_fields() {
        let mut repo = repository();
        repo.header
            .metadata
            .insert("keep".to_owned(), "me".to_owned());

        repo.apply(&RepositoryPatch {
            common: StatusPatch::status(Status::Ready),
            remote_url: Some("git@vcs:acme/orders.git".to_owned()),
        });

        assert_eq!(repo.header.status, Status::Ready);
        assert_eq!(repo.remote(), Some("git@vcs:acme/orders.git"));
        assert_eq!(repo.header.metadata.get("keep").map(String::as_str), Some("me"));

        repo.apply(&StatusPatch::metadata(keys::LAST_BUILD_NUMBER, "7").into());
        assert_eq!(repo.header.status, Status::Ready);
        assert_eq!(repo.remote(), Some("git@vcs:acme/orders.git"));
        assert_eq!(
            repo.header.metadata.get(keys::LAST_BUILD_NUMBER).map(String::as_str),
            Some("7")
        );
    }

    #[test]
    fn empty_remote_url_is_not_a_remote() {
        let mut repo = repository();
        repo.remote_url = Some(String::new());
        assert!(repo.remote().is_none());
    }

    #[test]
    fn library_api_version_parts() {
        let mut version = LibraryApiVersion {
            header: Header::pending(),
            api_version_id: ResourceId::new("av-1"),
            library_id: ResourceId::new("lib-1"),
            version: "1.0.0".to_owned(),
            api_repository_status: Status::Pending,
            pipeline_status: Status::Pending,
        };

        version.apply(&LibraryApiVersionPatch {
            pipeline_status: Some(Status::Ready),
            ..LibraryApiVersionPatch::default()
        });
        assert!(!version.parts_ready());

        version.apply(&LibraryApiVersionPatch {
            api_repository_status: Some(Status::Ready),
            ..LibraryApiVersionPatch::default()
        });
        assert!(version.parts_ready());
        assert_eq!(version.header.status, Status::Pending);
    }

    #[test]
    fn patch_serialises_sparsely() {
        let patch = PipelinePatch {
            common: StatusPatch::status(Status::Unstable),
            ..PipelinePatch::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "UNSTABLE" }));
    }

    #[test]
    fn entity_json_is_flat() {
        let json = serde_json::to_value(repository()).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["path"], "acme/orders/java-client");
        assert!(json.get("header").is_none());
    }
}
