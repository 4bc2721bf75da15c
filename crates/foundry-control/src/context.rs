//! Caller identity carried into every backend call.

use crate::error::{FactoryError, FactoryResult};

/// Identity and credentials of the caller that started an operation.
///
/// Captured when a public operation is called and moved into every task the
/// operation detaches, so backend calls made after the caller has gone away
/// still run as that caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    principal: String,
    token: Option<String>,
    deploy_key: Option<String>,
}

impl CallerContext {
    /// Context for a named principal without credentials.
    #[must_use]
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            token: None,
            deploy_key: None,
        }
    }

    /// Attach a bearer token sent to HTTP backends.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Attach the credential identifier used as repository deploy key and
    /// CI credential.
    #[must_use]
    pub fn with_deploy_key(mut self, key: impl Into<String>) -> Self {
        self.deploy_key = Some(key.into());
        self
    }

    /// Principal name.
    #[must_use]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Bearer token, if any.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Deploy key, required by operations that provision repositories.
    pub fn deploy_key(&self) -> FactoryResult<&str> {
        self.deploy_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                FactoryError::validation(format!(
                    "caller '{}' has no deploy key",
                    self.principal
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_key_is_required() {
        let ctx = CallerContext::new("alice");
        assert!(ctx.deploy_key().is_err());

        let ctx = ctx.with_deploy_key("");
        assert!(ctx.deploy_key().is_err());

        let ctx = CallerContext::new("alice").with_deploy_key("key-1");
        assert_eq!(ctx.deploy_key().ok(), Some("key-1"));
    }
}
