use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use ocm_core::credentials::{CredentialResolver, StaticCredentialSource};
use ocm_core::digest::HashAlgorithm;
use ocm_core::orchestrator::{self, SignOptions, SigningConfig};
use ocm_core::signature::{credential_identity, EncodingPolicy, SigningAlgorithm};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::common::{load_credentials, resolve_reference};

#[derive(Debug, Parser)]
pub struct Options {
    /// The component reference to sign.
    reference: String,

    /// The signature name to store under.
    #[clap(long, default_value = "default")]
    signature: String,

    /// Path to a flat JSON credential file carrying signing key material
    /// (`private_key_pem`/`private_key_pem_file`, plus `certificate_chain_pem`
    /// for the `pem` encoding policy).
    #[clap(long)]
    signer_spec: String,

    /// Hash algorithm applied to normalised descriptor bytes.
    #[clap(long, default_value = "SHA-256")]
    hash: String,

    /// Normalisation algorithm identifier.
    #[clap(long, default_value = "jsonNormalisation/v4alpha1")]
    normalisation: String,

    /// RSA signing scheme (`RSASSA-PSS` or `RSASSA-PKCS1-V1_5`).
    #[clap(long, default_value = "RSASSA-PSS")]
    algorithm: String,

    /// Encode the signature as a PEM bundle with a certificate chain, instead of plain hex.
    #[clap(long)]
    pem: bool,

    /// Overwrite an existing signature of the same name.
    #[clap(long)]
    force: bool,

    /// Compute and print the signed descriptor without storing it.
    #[clap(long)]
    dry_run: bool,
}

#[tracing::instrument]
pub async fn main(opts: Options) -> Result<()> {
    let signing_algorithm = SigningAlgorithm::parse(&opts.algorithm)?;
    let credentials = load_credentials(&opts.signer_spec).await.context("load signer credentials")?;

    // Register the loaded key material under the spec §4.7 signing identity so
    // `sign_component_version` resolves it through C5 rather than taking it directly.
    let identity = credential_identity(signing_algorithm, &opts.signature);
    let resolver = CredentialResolver::new().with(Arc::new(StaticCredentialSource::new(identity, credentials)));

    let (parsed, dispatcher) = resolve_reference(&opts.reference, resolver)?;
    let version = parsed
        .version
        .clone()
        .ok_or_else(|| color_eyre::eyre::eyre!("reference carries no version: {}", opts.reference))?;

    let config = SigningConfig::builder()
        .hash_algorithm(HashAlgorithm::parse(&opts.hash)?)
        .normalisation_algorithm(opts.normalisation.clone())
        .signing_algorithm(signing_algorithm)
        .encoding_policy(if opts.pem { EncodingPolicy::Pem } else { EncodingPolicy::Plain })
        .build();
    let options = SignOptions::builder().force(opts.force).dry_run(opts.dry_run).build();

    info!(component = %parsed.component, %version, signature = %opts.signature, "signing component version");
    let descriptor = orchestrator::sign_component_version(
        &dispatcher,
        &parsed.component,
        &version,
        &opts.signature,
        &config,
        options,
        &CancellationToken::new(),
    )
    .await
    .context("sign component version")?;

    let rendered = serde_json::to_string_pretty(&descriptor).context("render signed descriptor")?;
    println!("{rendered}");
    Ok(())
}
