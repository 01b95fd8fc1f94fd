//! The per-backend component-version repository contract (C3): read/write
//! descriptors, list versions, move local resource/source blobs.

use std::pin::Pin;

use tokio::io::AsyncRead;

use crate::descriptor::{Descriptor, Resource, ResourceIdentity, Source};
use crate::error::OcmError;

/// A boxed, owned byte stream used for blob upload/download.
pub type BlobStream = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// The operations an open backend handle exposes, implemented once per [`crate::repository_spec::RepositorySpec`] variant.
///
/// Instances are created lazily by [`crate::provider::Provider::open`] for a given
/// `(spec, credentials)` pair and cached for the process lifetime (spec §3, §5).
#[async_trait::async_trait]
pub trait ComponentVersionRepository: Send + Sync {
    /// Fetch a component version's descriptor.
    async fn get_component_version(&self, name: &str, version: &str) -> Result<Descriptor, OcmError>;

    /// List every version known for `name`.
    async fn list_component_versions(&self, name: &str) -> Result<Vec<String>, OcmError>;

    /// Store a descriptor.
    ///
    /// Idempotent over descriptor equality (spec §4.3): re-adding the identical
    /// descriptor for an existing `(name, version)` is a no-op success; a differing
    /// descriptor overwrites.
    async fn add_component_version(&self, descriptor: &Descriptor) -> Result<(), OcmError>;

    /// Upload a local resource's content, returning the resource metadata updated
    /// with a [`crate::access::Access::LocalBlob`] access whose `local_reference` is
    /// the content digest of the uploaded bytes.
    async fn add_local_resource(
        &self,
        component_name: &str,
        version: &str,
        resource: &Resource,
        blob: BlobStream,
    ) -> Result<Resource, OcmError>;

    /// Fetch a local resource's content by identity.
    async fn get_local_resource(
        &self,
        component_name: &str,
        version: &str,
        identity: &ResourceIdentity,
    ) -> Result<(BlobStream, Resource), OcmError>;

    /// Upload a local source's content. See [`Self::add_local_resource`].
    async fn add_local_source(
        &self,
        component_name: &str,
        version: &str,
        source: &Source,
        blob: BlobStream,
    ) -> Result<Source, OcmError>;

    /// Fetch a local source's content by identity. See [`Self::get_local_resource`].
    async fn get_local_source(
        &self,
        component_name: &str,
        version: &str,
        identity: &ResourceIdentity,
    ) -> Result<(BlobStream, Source), OcmError>;
}
