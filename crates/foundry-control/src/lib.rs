//! Foundry control
//!
//! Provisioning and readiness-rollup engine of the foundry software factory.
//!
//! # Architecture
//!
//! - **Provisioners** create single backend resources in two phases:
//!   [`RepositoryProvisioner`] for version-control repositories and
//!   [`PipelineProvisioner`] for CI pipelines and their builds.
//! - **Orchestrators** sequence provisioners and roll readiness up to the
//!   parent: [`LibraryOrchestrator`], [`ComponentOrchestrator`],
//!   [`ImplementationOrchestrator`], [`ApiVersionOrchestrator`] and
//!   [`LibraryApiVersionOrchestrator`].
//! - **Backends** are traits with in-memory and HTTP implementations, see
//!   [`backend`] and [`inventory`].
//!
//! # Lifecycle
//!
//! ```text
//! PENDING ──▶ READY ──▶ DELETED
//!    │          │
//!    ▼          ▼
//!  ERROR     UPDATING / UNSTABLE
//! ```
//!
//! Create operations return a [`Provisioning`] holding the PENDING record
//! and the handle of the detached task that finishes it.

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod api_version;
pub mod archive;
pub mod backend;
pub mod component;
pub mod config;
pub mod context;
pub mod error;
pub mod factory;
pub mod group;
pub mod implementation;
pub mod inventory;
pub mod library;
pub mod model;
pub mod pipeline;
pub mod query;
pub mod repository;
pub mod resource;
pub mod rollup;
pub mod task;
pub mod types;
pub mod version;

// Re-export commonly used types at the crate root
pub use api_version::{ApiVersionOrchestrator, LibraryApiVersionOrchestrator};
pub use archive::SourceTree;
pub use backend::{
    BuildOutcome, CodeGenerator, ContinuousIntegration, MemoryCi, MemoryGenerator,
    MemoryVersionControl, VersionControl,
};
pub use component::ComponentOrchestrator;
pub use config::FactoryConfig;
pub use context::CallerContext;
pub use error::{FactoryError, FactoryResult};
pub use factory::{Backends, Factory, FactoryBuilder};
pub use group::GroupService;
pub use implementation::ImplementationOrchestrator;
pub use inventory::{Collection, Filter, Inventory};
pub use library::LibraryOrchestrator;
pub use model::{
    ApiVersion, Component, Group, Implementation, ImplementationVersion, Library,
    LibraryApiVersion, Pipeline, ResourceKind, SourceRepository,
};
pub use pipeline::{OnBuildFinished, PipelineProvisioner, PipelineSpec};
pub use query::QueryService;
pub use repository::{RepositoryLayout, RepositoryProvisioner};
pub use resource::Resource;
pub use rollup::RollupLocks;
pub use task::{Callback, OnceCallback, Provisioning};
pub use types::{
    BuildNumber, BuildStatus, Language, LibraryKind, ResourceId, SemanticVersion, Status, Template,
};
pub use version::VersionBuilder;
