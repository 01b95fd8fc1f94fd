use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use ocm_core::credentials::{CredentialResolver, StaticCredentialSource};
use ocm_core::orchestrator::{self, VerifyOptions};
use ocm_core::signature::{credential_identity, SigningAlgorithm};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::common::{load_credentials, resolve_reference};

#[derive(Debug, Parser)]
pub struct Options {
    /// The component reference to verify.
    reference: String,

    /// The signature name to verify.
    #[clap(long, default_value = "default")]
    signature: String,

    /// Path to a flat JSON credential file carrying verification key material
    /// (`public_key_pem`/`public_key_pem_file`, plus `underlying` for the
    /// PEM-chain encoding policy's issuer certificate).
    #[clap(long)]
    verifier_spec: String,

    /// The RSA signing scheme the stored signature is expected to use, used to
    /// build the credential-resolution identity (spec §4.7) before the
    /// descriptor carrying the actual signature has been fetched.
    #[clap(long, default_value = "RSASSA-PSS")]
    algorithm: String,

    /// Also recompute and check every local resource/source content digest.
    ///
    /// Requires an embedding application's `DigestProcessor`; this binary has
    /// none wired in; passing this flag against this binary always fails.
    #[clap(long)]
    verify_digest_consistency: bool,
}

#[tracing::instrument]
pub async fn main(opts: Options) -> Result<()> {
    let signing_algorithm = SigningAlgorithm::parse(&opts.algorithm)?;
    let credentials = load_credentials(&opts.verifier_spec).await.context("load verifier credentials")?;

    let identity = credential_identity(signing_algorithm, &opts.signature);
    let resolver = CredentialResolver::new().with(Arc::new(StaticCredentialSource::new(identity, credentials)));

    let (parsed, dispatcher) = resolve_reference(&opts.reference, resolver)?;
    let version = parsed
        .version
        .clone()
        .ok_or_else(|| color_eyre::eyre::eyre!("reference carries no version: {}", opts.reference))?;

    let options = VerifyOptions::builder()
        .verify_digest_consistency(opts.verify_digest_consistency)
        .build();

    info!(component = %parsed.component, %version, signature = %opts.signature, "verifying component version");
    orchestrator::verify_component_version(
        &dispatcher,
        &parsed.component,
        &version,
        &opts.signature,
        options,
        None,
        &CancellationToken::new(),
    )
    .await
    .context("verify component version")?;

    println!("signature '{}' on {} verified", opts.signature, opts.reference);
    Ok(())
}
