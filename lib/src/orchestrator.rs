//! The signing orchestrator (C8): end-to-end sign and verify flows over a
//! [`FallbackDispatcher`], combining descriptor normalisation, digesting, and
//! RSA signature production/verification (spec §4.8).

use std::sync::Arc;

use bon::Builder;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::access::Access;
use crate::descriptor::{Descriptor, Resource, Signature, Source};
use crate::digest::{Digest, HashAlgorithm, NORMALISATION_CURRENT};
use crate::error::OcmError;
use crate::fallback::FallbackDispatcher;
use crate::normalise::digest_descriptor;
use crate::signature::{credential_identity, sign, verify, EncodingPolicy, SigningAlgorithm};

/// How resource and source content digests are recomputed and checked against
/// what a descriptor records, during [`verify_component_version`].
///
/// Injectable because the orchestrator core (spec §1 Non-goals) does not itself
/// implement blob transport for any concrete repository kind; a caller that
/// wires in an OCI or CTF backend supplies the matching digest logic here.
#[async_trait::async_trait]
pub trait DigestProcessor: Send + Sync {
    /// Recompute the content digest for a resource's access, returning an error
    /// if the bytes cannot be read or hashed.
    async fn digest_resource(&self, component: &str, version: &str, resource: &Resource) -> Result<Digest, OcmError>;

    /// Recompute the content digest for a source's access.
    async fn digest_source(&self, component: &str, version: &str, source: &Source) -> Result<Digest, OcmError>;
}

/// The hash, normalisation, and signing scheme a sign/verify flow runs under.
#[derive(Debug, Clone, Builder)]
pub struct SigningConfig {
    /// The hash algorithm applied to normalised bytes.
    #[builder(default = HashAlgorithm::Sha256)]
    pub hash_algorithm: HashAlgorithm,
    /// The normalisation scheme to apply before hashing.
    #[builder(into, default = NORMALISATION_CURRENT)]
    pub normalisation_algorithm: String,
    /// The RSA signing scheme.
    #[builder(default = SigningAlgorithm::RsaPss)]
    pub signing_algorithm: SigningAlgorithm,
    /// How the produced signature artifact is encoded.
    #[builder(default = EncodingPolicy::Plain)]
    pub encoding_policy: EncodingPolicy,
}

/// Flags controlling a single sign operation.
#[derive(Debug, Clone, Copy, Builder)]
pub struct SignOptions {
    /// Overwrite an existing signature of the same name instead of failing.
    #[builder(default = false)]
    pub force: bool,
    /// Compute and report the signature without storing the updated descriptor.
    #[builder(default = false)]
    pub dry_run: bool,
    /// Refuse to sign a descriptor that fails the safe-to-digest precondition.
    #[builder(default = true)]
    pub strict: bool,
}

/// The maximum number of resource/source digests [`verify_component_version`]
/// recomputes concurrently.
const VERIFY_CONCURRENCY: usize = 8;

/// Fetch, digest, resolve signing credentials through C5 under the signing
/// identity `{ algorithm, signature, type: RSA/v1alpha1 }` (spec §4.7), sign, and
/// (unless `options.dry_run`) store a component version's descriptor under the
/// signature name `signature_name` (spec §4.8 steps 1-7).
pub async fn sign_component_version(
    dispatcher: &FallbackDispatcher,
    component: &str,
    version: &str,
    signature_name: &str,
    config: &SigningConfig,
    options: SignOptions,
    cancel: &CancellationToken,
) -> Result<Descriptor, OcmError> {
    let mut descriptor = dispatcher.get_component_version(component, version, cancel).await?;

    if options.strict {
        if let Some(violation) = descriptor.safe_to_digest_violation() {
            return Err(OcmError::UnsafeDescriptor(violation));
        }
    }

    let identity = credential_identity(config.signing_algorithm, signature_name);
    let credentials = dispatcher.resolve_credentials(&identity).await;

    let digest = digest_descriptor(&descriptor, config.hash_algorithm, &config.normalisation_algorithm)?;
    let signature_info = sign(&digest, config.signing_algorithm, config.encoding_policy, &credentials)?;
    descriptor.put_signature(
        Signature { name: signature_name.to_string(), digest, signature_info },
        options.force,
    )?;

    if !options.dry_run {
        dispatcher.add_component_version(component, &descriptor, cancel).await?;
    }

    Ok(descriptor)
}

/// Options controlling a verify operation.
#[derive(Debug, Clone, Copy, Builder)]
pub struct VerifyOptions {
    /// Also recompute and check every local resource/source's content digest
    /// via `processor`, not just the descriptor's own signed digest.
    #[builder(default = false)]
    pub verify_digest_consistency: bool,
}

/// Fetch a component version's descriptor, recompute its digest under the
/// normalisation/hash scheme recorded on the named signature, resolve verifying
/// credentials through C5 under the verifying identity `{ algorithm, signature,
/// type: RSA/v1alpha1 }` (spec §4.7), verify the signature, and (if
/// `options.verify_digest_consistency`) recheck every resource/source content
/// digest via `processor` (spec §4.8 steps 8-10).
pub async fn verify_component_version(
    dispatcher: &FallbackDispatcher,
    component: &str,
    version: &str,
    signature_name: &str,
    options: VerifyOptions,
    processor: Option<Arc<dyn DigestProcessor>>,
    cancel: &CancellationToken,
) -> Result<(), OcmError> {
    let descriptor = dispatcher.get_component_version(component, version, cancel).await?;

    let signature = descriptor
        .signature(signature_name)
        .ok_or_else(|| OcmError::NotFound(format!("signature '{signature_name}' on {component}:{version}")))?;

    let hash_algorithm = signature.digest.algorithm()?;
    let recomputed = digest_descriptor(&descriptor, hash_algorithm, &signature.digest.normalisation_algorithm)?;
    if recomputed.value != signature.digest.value {
        return Err(OcmError::DigestMismatch {
            expected: signature.digest.value.clone(),
            actual: recomputed.value,
        });
    }

    let signing_algorithm = SigningAlgorithm::parse(&signature.signature_info.algorithm)?;
    let identity = credential_identity(signing_algorithm, signature_name);
    let credentials = dispatcher.resolve_credentials(&identity).await;

    verify(&signature.digest, &signature.signature_info, &credentials)?;

    if options.verify_digest_consistency {
        let processor = processor
            .ok_or_else(|| OcmError::UnsafeDescriptor("digest consistency check requested with no digest processor configured".into()))?;
        verify_content_digests(&descriptor, component, version, processor, cancel).await?;
    }

    Ok(())
}

/// Recompute and check every local resource/source digest, bounded to
/// [`VERIFY_CONCURRENCY`] concurrent checks, cancelling outstanding work on the
/// first failure (spec §5).
async fn verify_content_digests(
    descriptor: &Descriptor,
    component: &str,
    version: &str,
    processor_handle: Arc<dyn DigestProcessor>,
    cancel: &CancellationToken,
) -> Result<(), OcmError> {
    let child = cancel.child_token();
    let mut join_set: JoinSet<Result<(), OcmError>> = JoinSet::new();
    let mut pending = Vec::new();

    for resource in &descriptor.resources {
        if resource.access.is_none() {
            continue;
        }
        pending.push(ResourceOrSource::Resource(resource.clone()));
    }
    for source in &descriptor.sources {
        if source.access.is_none() {
            continue;
        }
        pending.push(ResourceOrSource::Source(source.clone()));
    }

    let mut iter = pending.into_iter();
    let mut first_error = None;

    loop {
        while join_set.len() < VERIFY_CONCURRENCY {
            let Some(item) = iter.next() else { break };
            if child.is_cancelled() {
                break;
            }
            let processor = processor_handle.clone();
            join_set.spawn(check_one(item, component.to_string(), version.to_string(), processor, child.clone()));
        }
        if join_set.is_empty() {
            break;
        }

        let Some(result) = join_set.join_next().await else { break };
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                child.cancel();
                first_error.get_or_insert(err);
            }
            Err(join_err) => {
                child.cancel();
                first_error.get_or_insert(OcmError::Transport(Box::new(join_err)));
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

enum ResourceOrSource {
    Resource(Resource),
    Source(Source),
}

async fn check_one(
    item: ResourceOrSource,
    component: String,
    version: String,
    processor: Arc<dyn DigestProcessor>,
    cancel: CancellationToken,
) -> Result<(), OcmError> {
    if cancel.is_cancelled() {
        return Err(OcmError::Cancelled);
    }
    let (access, expected) = match &item {
        ResourceOrSource::Resource(resource) => (&resource.access, resource.digest.clone()),
        ResourceOrSource::Source(source) => (&source.access, source.digest.clone()),
    };
    let Some(expected) = expected else { return Ok(()) };

    // LocalBlob shortcut (spec §4.3, §4.8 step 3): the access's `local_reference` is
    // itself a content digest, so compare it directly rather than re-reading the blob.
    if let Access::LocalBlob { local_reference, .. } = access {
        return check_local_blob_shortcut(local_reference, &expected);
    }

    let actual = match item {
        ResourceOrSource::Resource(resource) => processor.digest_resource(&component, &version, &resource).await?,
        ResourceOrSource::Source(source) => processor.digest_source(&component, &version, &source).await?,
    };
    if expected.value != actual.value {
        return Err(OcmError::DigestMismatch { expected: expected.value, actual: actual.value });
    }
    Ok(())
}

/// Compare a `LocalBlob` access's `local_reference` (`<algo>:<hex>`) against the
/// descriptor's recorded digest without re-reading the blob.
fn check_local_blob_shortcut(local_reference: &str, expected: &Digest) -> Result<(), OcmError> {
    let (algo, hex) = local_reference
        .split_once(':')
        .ok_or_else(|| OcmError::UnsafeDescriptor(format!("local reference '{local_reference}' is not '<algo>:<hex>'")))?;
    let local_algorithm = HashAlgorithm::parse(algo)?;
    let expected_algorithm = expected.algorithm()?;
    if local_algorithm != expected_algorithm {
        return Err(OcmError::DigestMismatch { expected: expected.value.clone(), actual: hex.to_string() });
    }
    if !hex.eq_ignore_ascii_case(&expected.value) {
        return Err(OcmError::DigestMismatch { expected: expected.value.clone(), actual: hex.to_string() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component_repository::{BlobStream, ComponentVersionRepository};
    use crate::credentials::{CredentialResolver, StaticCredentialSource};
    use crate::descriptor::ResourceIdentity;
    use crate::fallback::Resolver;
    use crate::identity::Credentials;
    use crate::provider::{Provider, ProviderRegistry};
    use crate::repository_spec::{AccessMode, CtfArchiveSpec, RepositorySpec, RepositorySpecKind};
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};
    use rsa::RsaPrivateKey;
    use std::sync::Mutex;

    struct InMemoryRepo {
        descriptors: Mutex<std::collections::HashMap<(String, String), Descriptor>>,
    }

    #[async_trait::async_trait]
    impl ComponentVersionRepository for InMemoryRepo {
        async fn get_component_version(&self, name: &str, version: &str) -> Result<Descriptor, OcmError> {
            self.descriptors
                .lock()
                .unwrap()
                .get(&(name.to_string(), version.to_string()))
                .cloned()
                .ok_or_else(|| OcmError::NotFound(format!("{name}:{version}")))
        }
        async fn list_component_versions(&self, _name: &str) -> Result<Vec<String>, OcmError> {
            Ok(Vec::new())
        }
        async fn add_component_version(&self, descriptor: &Descriptor) -> Result<(), OcmError> {
            self.descriptors.lock().unwrap().insert(
                (descriptor.component_name.clone(), descriptor.version.clone()),
                descriptor.clone(),
            );
            Ok(())
        }
        async fn add_local_resource(&self, _: &str, _: &str, _: &Resource, _: BlobStream) -> Result<Resource, OcmError> {
            unimplemented!()
        }
        async fn get_local_resource(
            &self,
            _: &str,
            _: &str,
            _: &ResourceIdentity,
        ) -> Result<(BlobStream, Resource), OcmError> {
            unimplemented!()
        }
        async fn add_local_source(&self, _: &str, _: &str, _: &Source, _: BlobStream) -> Result<Source, OcmError> {
            unimplemented!()
        }
        async fn get_local_source(
            &self,
            _: &str,
            _: &str,
            _: &ResourceIdentity,
        ) -> Result<(BlobStream, Source), OcmError> {
            unimplemented!()
        }
    }

    struct StubProvider {
        repo: Arc<InMemoryRepo>,
    }

    #[async_trait::async_trait]
    impl Provider for StubProvider {
        fn consumer_identity(&self, spec: &RepositorySpec) -> crate::identity::Identity {
            crate::identity::Identity::new().with("path", spec.label())
        }
        async fn open(
            &self,
            _spec: &RepositorySpec,
            _credentials: &Credentials,
        ) -> Result<Arc<dyn ComponentVersionRepository>, OcmError> {
            Ok(self.repo.clone() as Arc<dyn ComponentVersionRepository>)
        }
    }

    fn dispatcher_with(descriptor: Descriptor, credentials: CredentialResolver) -> FallbackDispatcher {
        let repo = Arc::new(InMemoryRepo { descriptors: Mutex::new(std::collections::HashMap::new()) });
        repo.descriptors
            .lock()
            .unwrap()
            .insert((descriptor.component_name.clone(), descriptor.version.clone()), descriptor);

        let mut providers = ProviderRegistry::new();
        providers.register(RepositorySpecKind::CtfArchive, Arc::new(StubProvider { repo }));

        FallbackDispatcher::new(
            vec![Resolver {
                repository_spec: RepositorySpec::CtfArchive(CtfArchiveSpec {
                    file_path: "./archive".into(),
                    access_mode: AccessMode::READ.union(AccessMode::WRITE),
                }),
                prefix: String::new(),
                priority: 0,
            }],
            Arc::new(providers),
            Arc::new(credentials),
        )
    }

    /// A resolver with the signing/verifying credentials registered under the
    /// default signature name's §4.7 identity, so `sign_component_version` and
    /// `verify_component_version` can resolve them through C5 without a caller
    /// passing raw credentials.
    fn credential_resolver_for(signature_name: &str, signer: &Credentials, verifier: &Credentials) -> CredentialResolver {
        let identity = credential_identity(SigningAlgorithm::RsaPss, signature_name);
        let merged = Credentials::new()
            .with("private_key_pem", signer.get("private_key_pem").unwrap_or_default())
            .with("public_key_pem", verifier.get("public_key_pem").unwrap_or_default());
        CredentialResolver::new().with(Arc::new(StaticCredentialSource::new(identity, merged)))
    }

    fn bare_descriptor() -> Descriptor {
        Descriptor {
            component_name: "acme.org/helloworld".into(),
            version: "1.0.0".into(),
            provider: "acme".into(),
            resources: Vec::new(),
            sources: Vec::new(),
            references: Vec::new(),
            labels: Vec::new(),
            signatures: Vec::new(),
        }
    }

    fn test_credentials() -> (Credentials, Credentials) {
        let mut rng = rand::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_key = rsa::RsaPublicKey::from(&private_key);
        let signer = Credentials::new().with("private_key_pem", private_key.to_pkcs8_pem(Default::default()).unwrap().to_string());
        let verifier = Credentials::new().with("public_key_pem", public_key.to_public_key_pem(Default::default()).unwrap());
        (signer, verifier)
    }

    #[tokio::test]
    async fn sign_then_verify_round_trips() {
        let descriptor = bare_descriptor();
        let (signer_creds, verifier_creds) = test_credentials();
        let dispatcher = dispatcher_with(descriptor, credential_resolver_for("default", &signer_creds, &verifier_creds));
        let config = SigningConfig::builder().build();
        let cancel = CancellationToken::new();

        sign_component_version(
            &dispatcher,
            "acme.org/helloworld",
            "1.0.0",
            "default",
            &config,
            SignOptions::builder().build(),
            &cancel,
        )
        .await
        .unwrap();

        verify_component_version(
            &dispatcher,
            "acme.org/helloworld",
            "1.0.0",
            "default",
            VerifyOptions::builder().build(),
            None,
            &cancel,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn verify_detects_tampering_after_signing() {
        let descriptor = bare_descriptor();
        let (signer_creds, verifier_creds) = test_credentials();
        let dispatcher = dispatcher_with(descriptor, credential_resolver_for("default", &signer_creds, &verifier_creds));
        let config = SigningConfig::builder().build();
        let cancel = CancellationToken::new();

        let mut signed = sign_component_version(
            &dispatcher,
            "acme.org/helloworld",
            "1.0.0",
            "default",
            &config,
            SignOptions::builder().build(),
            &cancel,
        )
        .await
        .unwrap();

        signed.provider = "someone-else".into();
        dispatcher.add_component_version("acme.org/helloworld", &signed, &cancel).await.unwrap();

        let err = verify_component_version(
            &dispatcher,
            "acme.org/helloworld",
            "1.0.0",
            "default",
            VerifyOptions::builder().build(),
            None,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OcmError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn sign_rejects_duplicate_name_without_force() {
        let descriptor = bare_descriptor();
        let (signer_creds, verifier_creds) = test_credentials();
        let dispatcher = dispatcher_with(descriptor, credential_resolver_for("default", &signer_creds, &verifier_creds));
        let config = SigningConfig::builder().build();
        let cancel = CancellationToken::new();

        sign_component_version(
            &dispatcher,
            "acme.org/helloworld",
            "1.0.0",
            "default",
            &config,
            SignOptions::builder().build(),
            &cancel,
        )
        .await
        .unwrap();

        let err = sign_component_version(
            &dispatcher,
            "acme.org/helloworld",
            "1.0.0",
            "default",
            &config,
            SignOptions::builder().build(),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OcmError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn strict_sign_rejects_unsafe_descriptor() {
        let mut descriptor = bare_descriptor();
        descriptor.resources.push(Resource {
            name: "image".into(),
            version: "1.0.0".into(),
            resource_type: "ociImage".into(),
            relation: crate::descriptor::ResourceRelation::External,
            access: crate::access::Access::OciImage { image_reference: "ghcr.io/acme/x:1.0.0".into() },
            digest: None,
            extra_identity: Default::default(),
            labels: Vec::new(),
        });
        let (signer_creds, verifier_creds) = test_credentials();
        let dispatcher = dispatcher_with(descriptor, credential_resolver_for("default", &signer_creds, &verifier_creds));
        let config = SigningConfig::builder().build();
        let cancel = CancellationToken::new();

        let err = sign_component_version(
            &dispatcher,
            "acme.org/helloworld",
            "1.0.0",
            "default",
            &config,
            SignOptions::builder().build(),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OcmError::UnsafeDescriptor(_)));
    }

    struct PanicsIfCalledProcessor;

    #[async_trait::async_trait]
    impl DigestProcessor for PanicsIfCalledProcessor {
        async fn digest_resource(&self, _: &str, _: &str, _: &Resource) -> Result<Digest, OcmError> {
            panic!("LocalBlob access should use the shortcut, not the digest processor");
        }
        async fn digest_source(&self, _: &str, _: &str, _: &Source) -> Result<Digest, OcmError> {
            panic!("LocalBlob access should use the shortcut, not the digest processor");
        }
    }

    fn local_blob_resource(digest_hex: &str) -> Resource {
        Resource {
            name: "image".into(),
            version: "1.0.0".into(),
            resource_type: "blob".into(),
            relation: crate::descriptor::ResourceRelation::Local,
            access: crate::access::Access::LocalBlob {
                local_reference: format!("sha256:{digest_hex}"),
                media_type: "application/octet-stream".into(),
            },
            digest: Some(Digest {
                hash_algorithm: "SHA-256".into(),
                normalisation_algorithm: NORMALISATION_CURRENT.into(),
                value: digest_hex.to_string(),
            }),
            extra_identity: Default::default(),
            labels: Vec::new(),
        }
    }

    #[tokio::test]
    async fn verify_content_digests_uses_local_blob_shortcut_without_processor() {
        let digest_hex = "a".repeat(64);
        let mut descriptor = bare_descriptor();
        descriptor.resources.push(local_blob_resource(&digest_hex));

        verify_content_digests(
            &descriptor,
            "acme.org/helloworld",
            "1.0.0",
            Arc::new(PanicsIfCalledProcessor),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn verify_content_digests_rejects_local_blob_mismatch() {
        let mut descriptor = bare_descriptor();
        let mut resource = local_blob_resource(&"a".repeat(64));
        resource.digest = Some(Digest {
            hash_algorithm: "SHA-256".into(),
            normalisation_algorithm: NORMALISATION_CURRENT.into(),
            value: "b".repeat(64),
        });
        descriptor.resources.push(resource);

        let err = verify_content_digests(
            &descriptor,
            "acme.org/helloworld",
            "1.0.0",
            Arc::new(PanicsIfCalledProcessor),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OcmError::DigestMismatch { .. }));
    }
}
