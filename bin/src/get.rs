use clap::Parser;
use color_eyre::eyre::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use ocm_core::credentials::CredentialResolver;

use crate::common::resolve_reference;

#[derive(Debug, Parser)]
pub struct Options {
    /// The component reference to fetch (e.g. `ghcr.io/acme//github.com/acme/widget:1.0.0`).
    reference: String,
}

#[tracing::instrument]
pub async fn main(opts: Options) -> Result<()> {
    let (parsed, dispatcher) = resolve_reference(&opts.reference, CredentialResolver::new())?;
    let version = parsed
        .version
        .clone()
        .ok_or_else(|| color_eyre::eyre::eyre!("reference carries no version: {}", opts.reference))?;

    info!(component = %parsed.component, %version, "fetching component version");
    let descriptor = dispatcher
        .get_component_version(&parsed.component, &version, &CancellationToken::new())
        .await
        .context("fetch component version")?;

    let rendered = serde_json::to_string_pretty(&descriptor).context("render descriptor")?;
    println!("{rendered}");
    Ok(())
}
