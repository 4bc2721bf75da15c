//! Error types for foundry-control.

use crate::model::ResourceKind;
use crate::types::{BuildStatus, Language, ResourceId, Status};

/// Result type alias using [`FactoryError`].
pub type FactoryResult<T> = Result<T, FactoryError>;

/// Errors that can occur in the provisioning engine.
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    // ─────────────────────────────────────────────────────────────────────────
    // Validation errors (rejected before anything is registered)
    // ─────────────────────────────────────────────────────────────────────────
    /// Bad input: empty field, pattern mismatch, malformed version.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced resource does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of the missing resource.
        kind: ResourceKind,
        /// Identifier or natural key that was looked up.
        id: String,
    },

    /// A resource with the same natural key is already registered.
    #[error("{kind} already exists: {key}")]
    AlreadyExists {
        /// Kind of the conflicting resource.
        kind: ResourceKind,
        /// Natural key that collided (path, name, version).
        key: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // State-precondition errors
    // ─────────────────────────────────────────────────────────────────────────
    /// A resource used as an input is not READY yet.
    #[error("{kind} {id} is not ready (status {status})")]
    NotReady {
        /// Kind of the resource.
        kind: ResourceKind,
        /// Resource identifier.
        id: ResourceId,
        /// Status observed.
        status: Status,
    },

    /// A resource used as an input is in the ERROR state.
    #[error("{kind} {id} is in error state")]
    ResourceInErrorState {
        /// Kind of the resource.
        kind: ResourceKind,
        /// Resource identifier.
        id: ResourceId,
    },

    /// No pipeline template exists for this language.
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(Language),

    // ─────────────────────────────────────────────────────────────────────────
    // Backend errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The version-control backend refused a commit because the content is
    /// already present at the requested tag.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A backend call failed.
    #[error("{backend} error: {message}")]
    Backend {
        /// Backend that failed (inventory, vcs, ci, generator).
        backend: &'static str,
        /// Error message.
        message: String,
    },

    /// A build reached the FAILED state.
    #[error("build {number} failed")]
    BuildFailed {
        /// Build number assigned by the CI backend.
        number: u64,
    },

    /// A build finished in a state that is neither SUCCESS nor FAILED.
    #[error("unexpected build status: {0}")]
    UnexpectedBuildStatus(BuildStatus),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A generated source archive could not be read.
    #[error("archive error: {0}")]
    Archive(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FactoryError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error.
    #[must_use]
    pub fn not_found(kind: ResourceKind, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Create an already-exists error.
    #[must_use]
    pub fn already_exists(kind: ResourceKind, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            key: key.into(),
        }
    }

    /// Create a backend error.
    #[must_use]
    pub fn backend(backend: &'static str, msg: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: msg.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for the "already committed" condition reported on idempotent
    /// commits.
    #[must_use]
    pub const fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed(_))
    }

    /// True when the error reports a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Render this error and its source chain as diagnostic text.
    #[must_use]
    pub fn trace(&self) -> String {
        let mut trace = format!("{self:?}: {self}");
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            trace.push_str("\ncaused by: ");
            trace.push_str(&cause.to_string());
            source = cause.source();
        }
        trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_key() {
        let err = FactoryError::already_exists(ResourceKind::SourceRepository, "acme/orders/api");
        assert_eq!(
            err.to_string(),
            "source repository already exists: acme/orders/api"
        );
    }

    #[test]
    fn precondition_failed_is_named() {
        assert!(FactoryError::PreconditionFailed("tag 1.0.0".to_owned()).is_precondition_failed());
        assert!(!FactoryError::validation("x").is_precondition_failed());
    }

    #[test]
    fn trace_contains_message() {
        let err = FactoryError::backend("vcs", "connection refused");
        let trace = err.trace();
        assert!(trace.contains("vcs error: connection refused"));
    }
}
