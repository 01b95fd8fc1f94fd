//! Shared CLI plumbing for `get`, `sign`, and `verify`: turning a parsed
//! component reference into a one-resolver [`FallbackDispatcher`], and loading
//! credential files for `--signer-spec`/`--verifier-spec`.

use std::sync::Arc;

use color_eyre::eyre::{Context, Result};
use ocm_core::credentials::CredentialResolver;
use ocm_core::fallback::{FallbackDispatcher, Resolver};
use ocm_core::identity::Credentials;
use ocm_core::provider::ProviderRegistry;
use ocm_core::reference::{self, ComponentReference};
use ocm_core::OcmError;

/// Parse a component reference and build a single-resolver dispatcher routed
/// at the repository the reference names, resolving credentials (C5) through
/// `credentials`.
///
/// No concrete [`ocm_core::provider::Provider`] is registered here: this
/// crate's core intentionally does not implement OCI registry or CTF archive
/// transport (spec Non-goals), so dispatching against the decoded repository
/// spec fails with `UnsupportedRepositoryType` unless an embedding application
/// links in its own providers. This binary exists to exercise reference
/// parsing, error-taxonomy exit codes, and the sign/verify flow's flag
/// plumbing, not to perform real fetches.
pub fn resolve_reference(text: &str, credentials: CredentialResolver) -> Result<(ComponentReference, FallbackDispatcher)> {
    // Map to `OcmError` before wrapping in the eyre chain: `main.rs`'s exit-code
    // dispatch downcasts to `OcmError`, which it cannot recover from a bare `ParseError`.
    let parsed = reference::parse(text).map_err(OcmError::from).context("parse component reference")?;
    let resolver = Resolver {
        repository_spec: parsed.repository.clone(),
        prefix: parsed.prefix.clone(),
        priority: 0,
    };
    let providers = Arc::new(ProviderRegistry::new());
    let dispatcher = FallbackDispatcher::new(vec![resolver], providers, Arc::new(credentials));
    Ok((parsed, dispatcher))
}

/// Load a flat `{"key": "value", ...}` JSON document into [`Credentials`], used
/// for `--signer-spec`/`--verifier-spec` (key/secret material, certificate
/// chains, or file paths to either).
pub async fn load_credentials(path: &str) -> Result<Credentials> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read credential file {path}"))?;
    let map: std::collections::BTreeMap<String, String> =
        serde_json::from_str(&text).with_context(|| format!("parse credential file {path} as a flat JSON object"))?;
    Ok(map.into_iter().fold(Credentials::new(), |creds, (k, v)| creds.with(k, v)))
}
