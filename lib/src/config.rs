//! Host-facing configuration: wires a set of resolvers, providers, and
//! credentials into a ready-to-use [`FallbackDispatcher`], and carries the
//! hash/normalisation/signing scheme a CLI or embedding application runs under.

use std::sync::Arc;

use bon::Builder;

use crate::credentials::CredentialResolver;
use crate::digest::{HashAlgorithm, NORMALISATION_CURRENT};
use crate::fallback::{FallbackDispatcher, Resolver};
use crate::orchestrator::SigningConfig;
use crate::provider::ProviderRegistry;
use crate::signature::{EncodingPolicy, SigningAlgorithm};

/// The resolved configuration for a single resolution/signing session.
#[derive(Clone, Builder)]
pub struct Config {
    /// The routing rules a [`FallbackDispatcher`] dispatches component lookups through.
    #[builder(default)]
    pub resolvers: Vec<Resolver>,
    /// The backend factories registered for each [`crate::repository_spec::RepositorySpecKind`].
    pub providers: Arc<ProviderRegistry>,
    /// The credential repositories consulted for each opened backend.
    #[builder(default)]
    pub credentials: Arc<CredentialResolver>,
    /// The hash algorithm applied to normalised descriptor bytes.
    #[builder(default = HashAlgorithm::Sha256)]
    pub hash_algorithm: HashAlgorithm,
    /// The normalisation scheme applied before hashing.
    #[builder(into, default = NORMALISATION_CURRENT)]
    pub normalisation_algorithm: String,
    /// The RSA signing scheme used when producing new signatures.
    #[builder(default = SigningAlgorithm::RsaPss)]
    pub signing_algorithm: SigningAlgorithm,
    /// How produced signature artifacts are encoded.
    #[builder(default = EncodingPolicy::Plain)]
    pub encoding_policy: EncodingPolicy,
}

impl Config {
    /// Build a [`FallbackDispatcher`] over this configuration's resolvers,
    /// providers, and credential resolver.
    pub fn dispatcher(&self) -> FallbackDispatcher {
        FallbackDispatcher::new(self.resolvers.clone(), self.providers.clone(), self.credentials.clone())
    }

    /// The signing scheme derived from this configuration, for use with
    /// [`crate::orchestrator::sign_component_version`] and
    /// [`crate::orchestrator::verify_component_version`].
    pub fn signing_config(&self) -> SigningConfig {
        SigningConfig::builder()
            .hash_algorithm(self.hash_algorithm)
            .normalisation_algorithm(self.normalisation_algorithm.clone())
            .signing_algorithm(self.signing_algorithm)
            .encoding_policy(self.encoding_policy)
            .build()
    }
}
