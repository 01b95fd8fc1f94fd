//! The provider registry (C2): maps a [`RepositorySpec`] variant to the
//! [`Provider`] that knows how to derive a consumer identity from it and open a
//! backend handle.

use std::collections::HashMap;
use std::sync::Arc;

use crate::component_repository::ComponentVersionRepository;
use crate::error::OcmError;
use crate::identity::{Credentials, Identity};
use crate::repository_spec::{RepositorySpec, RepositorySpecKind};

/// A backend factory for one [`RepositorySpec`] variant.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Derive the credential lookup identity for `spec` (e.g. `{hostname, port, scheme}`
    /// for an OCI registry, `{path}` for a CTF archive).
    fn consumer_identity(&self, spec: &RepositorySpec) -> Identity;

    /// Open a backend handle for `spec`, authenticated with `credentials`.
    async fn open(
        &self,
        spec: &RepositorySpec,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ComponentVersionRepository>, OcmError>;
}

/// Maps a [`RepositorySpecKind`] to the [`Provider`] that implements it.
///
/// Read-mostly after startup (spec §5): populate at construction, then share behind
/// an `Arc` for concurrent lookup.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<RepositorySpecKind, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider for `kind`, replacing any previous registration.
    pub fn register(&mut self, kind: RepositorySpecKind, provider: Arc<dyn Provider>) {
        self.providers.insert(kind, provider);
    }

    /// Look up the provider registered for `spec`'s variant.
    pub fn provider_for(&self, spec: &RepositorySpec) -> Result<Arc<dyn Provider>, OcmError> {
        let kind = match spec {
            RepositorySpec::OciRegistry(_) => RepositorySpecKind::OciRegistry,
            RepositorySpec::CtfArchive(_) => RepositorySpecKind::CtfArchive,
            RepositorySpec::Raw { type_tag, .. } => {
                return Err(OcmError::UnsupportedRepositoryType(type_tag.clone()))
            }
        };
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| OcmError::UnsupportedRepositoryType(spec.label()))
    }

    /// Open a backend handle for `spec`, resolving its provider first.
    pub async fn open(
        &self,
        spec: &RepositorySpec,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ComponentVersionRepository>, OcmError> {
        self.provider_for(spec)?.open(spec, credentials).await
    }
}
