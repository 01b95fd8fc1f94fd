//! Credential resolution (C5): maps a consumer identity to a credential map.

use std::sync::Arc;

use tracing::debug;

use crate::error::OcmError;
use crate::identity::{Credentials, Identity};

/// One entry in a [`CredentialResolver`]'s ordered list: an identity this source
/// matches against, and the credentials it supplies when matched.
#[async_trait::async_trait]
pub trait CredentialSource: Send + Sync {
    /// The identity this source is registered under.
    fn identity(&self) -> &Identity;

    /// Produce the credentials for this source.
    ///
    /// Resolution is side-effect-free and safe under concurrent callers (spec §4.5);
    /// implementations backed by I/O (a credential file, an OS keychain) should read
    /// fresh each call rather than assume a cache.
    async fn credentials(&self) -> Result<Credentials, OcmError>;
}

/// A static `(identity, credentials)` pair, the common case for config-file-driven
/// credential repositories.
pub struct StaticCredentialSource {
    identity: Identity,
    credentials: Credentials,
}

impl StaticCredentialSource {
    /// Build a source that matches `identity` and always returns `credentials`.
    pub fn new(identity: Identity, credentials: Credentials) -> Self {
        Self { identity, credentials }
    }
}

#[async_trait::async_trait]
impl CredentialSource for StaticCredentialSource {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn credentials(&self) -> Result<Credentials, OcmError> {
        Ok(self.credentials.clone())
    }
}

/// An ordered list of credential repositories: the first whose own identity
/// [`Identity::is_superset_of`]-matches the queried identity supplies credentials.
#[derive(Default, Clone)]
pub struct CredentialResolver {
    repositories: Vec<Arc<dyn CredentialSource>>,
}

impl CredentialResolver {
    /// Build an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a credential repository, returning `self` for chaining.
    pub fn with(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.repositories.push(source);
        self
    }

    /// Resolve credentials for `identity`.
    ///
    /// `CredentialResolution` failures are non-fatal by convention (spec §7): callers
    /// fall through to unauthenticated access unless the handler in question requires
    /// credentials.
    pub async fn resolve(&self, identity: &Identity) -> Result<Credentials, OcmError> {
        for source in &self.repositories {
            if source.identity().is_superset_of(identity) {
                return source.credentials().await;
            }
        }
        debug!(?identity, "no credential repository matched identity");
        Err(OcmError::CredentialResolution(format!("{identity:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_matching_source_wins() {
        let ghcr = Arc::new(StaticCredentialSource::new(
            Identity::new().with("hostname", "ghcr.io"),
            Credentials::new().with("username", "ghcr-user"),
        ));
        let docker_hub = Arc::new(StaticCredentialSource::new(
            Identity::new().with("hostname", "docker.io"),
            Credentials::new().with("username", "hub-user"),
        ));
        let resolver = CredentialResolver::new().with(ghcr).with(docker_hub);

        let creds = resolver
            .resolve(&Identity::new().with("hostname", "docker.io"))
            .await
            .unwrap();
        assert_eq!(creds.get("username"), Some("hub-user"));
    }

    #[tokio::test]
    async fn no_match_fails_with_credential_resolution() {
        let resolver = CredentialResolver::new();
        let err = resolver.resolve(&Identity::new().with("hostname", "ghcr.io")).await.unwrap_err();
        assert!(matches!(err, OcmError::CredentialResolution(_)));
    }

    #[tokio::test]
    async fn matches_against_superset_identity() {
        let source = Arc::new(StaticCredentialSource::new(
            Identity::new().with("hostname", "ghcr.io").with("scheme", "https"),
            Credentials::new().with("username", "ghcr-user"),
        ));
        let resolver = CredentialResolver::new().with(source);
        let creds = resolver.resolve(&Identity::new().with("hostname", "ghcr.io")).await.unwrap();
        assert_eq!(creds.get("username"), Some("ghcr-user"));
    }
}
