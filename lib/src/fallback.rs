//! The fallback dispatcher (C4): routes a component lookup to the first backend
//! that succeeds, and pins subsequent lookups for that component to the winner.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::component_repository::{BlobStream, ComponentVersionRepository};
use crate::credentials::CredentialResolver;
use crate::descriptor::{Descriptor, Resource, ResourceIdentity, Source};
use crate::error::OcmError;
use crate::identity::Credentials;
use crate::provider::ProviderRegistry;
use crate::repository_spec::{RepositorySpec, Scheme};

/// A `(repositorySpec, prefix, priority)` routing rule.
#[derive(Debug, Clone)]
pub struct Resolver {
    /// The backend this resolver routes to.
    pub repository_spec: RepositorySpec,
    /// A component-name prefix filter; empty matches every component.
    pub prefix: String,
    /// Larger wins; ties broken by input order (stable sort).
    pub priority: i64,
}

impl Resolver {
    fn matches(&self, component: &str) -> bool {
        self.prefix.is_empty() || component.starts_with(self.prefix.as_str())
    }
}

struct ResolverSlot {
    id: usize,
    resolver: Resolver,
    backend: OnceCell<Arc<dyn ComponentVersionRepository>>,
}

#[derive(Default)]
struct Inner {
    fallbacks: Vec<Arc<ResolverSlot>>,
}

/// Given an ordered set of resolvers, dispatches component operations to the first
/// backend that succeeds, caching the winning binding per component (spec §4.4).
pub struct FallbackDispatcher {
    providers: Arc<ProviderRegistry>,
    credentials: Arc<CredentialResolver>,
    inner: RwLock<Inner>,
    bindings: RwLock<HashMap<String, usize>>,
    next_id: AtomicUsize,
}

fn stable_sort_by_priority(slots: &mut [Arc<ResolverSlot>]) {
    slots.sort_by(|a, b| b.resolver.priority.cmp(&a.resolver.priority));
}

impl FallbackDispatcher {
    /// Build a dispatcher from an initial resolver set, sorted by descending
    /// priority with a stable sort (ties preserve input order).
    pub fn new(resolvers: Vec<Resolver>, providers: Arc<ProviderRegistry>, credentials: Arc<CredentialResolver>) -> Self {
        let next_id = AtomicUsize::new(0);
        let mut fallbacks: Vec<Arc<ResolverSlot>> = resolvers
            .into_iter()
            .map(|resolver| {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                Arc::new(ResolverSlot { id, resolver, backend: OnceCell::new() })
            })
            .collect();
        stable_sort_by_priority(&mut fallbacks);

        Self {
            providers,
            credentials,
            inner: RwLock::new(Inner { fallbacks }),
            bindings: RwLock::new(HashMap::new()),
            next_id,
        }
    }

    /// Add resolvers after construction, re-sorting while preserving the
    /// stable-sort invariant. Existing bindings are unaffected.
    pub fn add_resolvers(&self, resolvers: Vec<Resolver>) {
        let mut inner = self.inner.write().expect("fallback lock poisoned");
        for resolver in resolvers {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            inner.fallbacks.push(Arc::new(ResolverSlot { id, resolver, backend: OnceCell::new() }));
        }
        stable_sort_by_priority(&mut inner.fallbacks);
    }

    fn snapshot(&self) -> Vec<Arc<ResolverSlot>> {
        self.inner.read().expect("fallback lock poisoned").fallbacks.clone()
    }

    fn bound_slot(&self, component: &str) -> Option<Arc<ResolverSlot>> {
        let id = *self.bindings.read().expect("bindings lock poisoned").get(component)?;
        self.snapshot().into_iter().find(|slot| slot.id == id)
    }

    fn bind(&self, component: &str, id: usize) {
        self.bindings.write().expect("bindings lock poisoned").insert(component.to_string(), id);
    }

    async fn open_slot(&self, slot: &ResolverSlot) -> Result<Arc<dyn ComponentVersionRepository>, OcmError> {
        slot.backend
            .get_or_try_init(|| async {
                let provider = self.providers.provider_for(&slot.resolver.repository_spec)?;
                let identity = provider.consumer_identity(&slot.resolver.repository_spec);
                let credentials = self.resolve_credentials(&identity).await;
                provider.open(&slot.resolver.repository_spec, &credentials).await
            })
            .await
            .cloned()
    }

    /// Resolve credentials for `identity` through the configured credential resolver
    /// (C5), falling through to unauthenticated access (with a warning) when no
    /// repository matches (spec §7: `CredentialResolution` failures are non-fatal by
    /// convention; a handler that requires credentials converts the absence itself).
    ///
    /// Exposed so C8 (the signing orchestrator) can resolve the signing/verifying
    /// identity (spec §4.7) through the same credential resolver this dispatcher was
    /// built with, instead of requiring a caller to pre-resolve credentials.
    pub async fn resolve_credentials(&self, identity: &crate::identity::Identity) -> Credentials {
        match self.credentials.resolve(identity).await {
            Ok(credentials) => credentials,
            Err(err) => {
                tracing::warn!(%err, "credential resolution failed, falling through to unauthenticated access");
                Credentials::new()
            }
        }
    }

    fn log_dispatch(component: &str, slot: &ResolverSlot) {
        let repository = Scheme::default()
            .encode(&slot.resolver.repository_spec)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_else(|_| slot.resolver.repository_spec.label());
        info!(realm = "fallback", component, repository, "dispatched component lookup");
    }

    async fn dispatch_first_wins<T, F, Fut>(
        &self,
        component: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, OcmError>
    where
        F: Fn(Arc<dyn ComponentVersionRepository>) -> Fut,
        Fut: Future<Output = Result<T, OcmError>>,
    {
        if let Some(slot) = self.bound_slot(component) {
            let backend = self.open_slot(&slot).await?;
            return op(backend).await;
        }

        for slot in self.snapshot() {
            if cancel.is_cancelled() {
                return Err(OcmError::Cancelled);
            }
            if !slot.resolver.matches(component) {
                continue;
            }

            let backend = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OcmError::Cancelled),
                result = self.open_slot(&slot) => result?,
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OcmError::Cancelled),
                result = op(backend) => result,
            };

            match result {
                Ok(value) => {
                    self.bind(component, slot.id);
                    Self::log_dispatch(component, &slot);
                    return Ok(value);
                }
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
        }

        Err(OcmError::ComponentNotFound(component.to_string()))
    }

    /// Fetch a component version's descriptor (first-wins).
    pub async fn get_component_version(
        &self,
        component: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<Descriptor, OcmError> {
        self.dispatch_first_wins(component, cancel, |backend| {
            let version = version.to_string();
            async move { backend.get_component_version(component, &version).await }
        })
        .await
    }

    /// Store a descriptor (first-wins).
    pub async fn add_component_version(
        &self,
        component: &str,
        descriptor: &Descriptor,
        cancel: &CancellationToken,
    ) -> Result<(), OcmError> {
        self.dispatch_first_wins(component, cancel, |backend| {
            let descriptor = descriptor.clone();
            async move { backend.add_component_version(&descriptor).await }
        })
        .await
    }

    /// Upload a local resource's content (first-wins). `blob` is consumed on the
    /// first dispatch attempt; callers retrying after a transport failure must
    /// supply a fresh stream.
    pub async fn add_local_resource(
        &self,
        component: &str,
        version: &str,
        resource: &Resource,
        blob: BlobStream,
        cancel: &CancellationToken,
    ) -> Result<Resource, OcmError> {
        let blob = std::cell::RefCell::new(Some(blob));
        self.dispatch_first_wins(component, cancel, |backend| {
            let version = version.to_string();
            let resource = resource.clone();
            let blob = blob.borrow_mut().take();
            async move {
                let blob = blob.ok_or_else(|| OcmError::Transport("blob stream already consumed".into()))?;
                backend.add_local_resource(component, &version, &resource, blob).await
            }
        })
        .await
    }

    /// Fetch a local resource's content by identity (first-wins).
    pub async fn get_local_resource(
        &self,
        component: &str,
        version: &str,
        identity: &ResourceIdentity,
        cancel: &CancellationToken,
    ) -> Result<(BlobStream, Resource), OcmError> {
        self.dispatch_first_wins(component, cancel, |backend| {
            let version = version.to_string();
            let identity = identity.clone();
            async move { backend.get_local_resource(component, &version, &identity).await }
        })
        .await
    }

    /// Upload a local source's content (first-wins). See [`Self::add_local_resource`].
    pub async fn add_local_source(
        &self,
        component: &str,
        version: &str,
        source: &Source,
        blob: BlobStream,
        cancel: &CancellationToken,
    ) -> Result<Source, OcmError> {
        let blob = std::cell::RefCell::new(Some(blob));
        self.dispatch_first_wins(component, cancel, |backend| {
            let version = version.to_string();
            let source = source.clone();
            let blob = blob.borrow_mut().take();
            async move {
                let blob = blob.ok_or_else(|| OcmError::Transport("blob stream already consumed".into()))?;
                backend.add_local_source(component, &version, &source, blob).await
            }
        })
        .await
    }

    /// Fetch a local source's content by identity (first-wins).
    pub async fn get_local_source(
        &self,
        component: &str,
        version: &str,
        identity: &ResourceIdentity,
        cancel: &CancellationToken,
    ) -> Result<(BlobStream, Source), OcmError> {
        self.dispatch_first_wins(component, cancel, |backend| {
            let version = version.to_string();
            let identity = identity.clone();
            async move { backend.get_local_source(component, &version, &identity).await }
        })
        .await
    }

    /// List every version known for `component` across *all* matching backends
    /// (union semantics): no binding-cache consultation, no early exit; any
    /// non-`NotFound` error aborts the whole operation. Results are deduplicated,
    /// preserving first-appearance order across backends ordered by descending
    /// priority (spec §4.4, §5).
    pub async fn list_component_versions(
        &self,
        component: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, OcmError> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();

        for slot in self.snapshot() {
            if cancel.is_cancelled() {
                return Err(OcmError::Cancelled);
            }
            if !slot.resolver.matches(component) {
                continue;
            }

            let backend = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OcmError::Cancelled),
                result = self.open_slot(&slot) => result?,
            };

            let versions = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OcmError::Cancelled),
                result = backend.list_component_versions(component) => result,
            };

            match versions {
                Ok(versions) => {
                    for version in versions {
                        if seen.insert(version.clone()) {
                            result.push(version);
                        }
                    }
                }
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;
    use crate::repository_spec::CtfArchiveSpec;
    use std::sync::Mutex;

    struct FakeRepo {
        label: &'static str,
        versions: Vec<&'static str>,
        fail_not_found: bool,
        fail_transport: bool,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait::async_trait]
    impl ComponentVersionRepository for FakeRepo {
        async fn get_component_version(&self, name: &str, _version: &str) -> Result<Descriptor, OcmError> {
            self.calls.lock().unwrap().push(self.label);
            if self.fail_transport {
                return Err(OcmError::Transport("boom".into()));
            }
            if self.fail_not_found {
                return Err(OcmError::NotFound(name.to_string()));
            }
            Ok(Descriptor {
                component_name: name.to_string(),
                version: "1.0.0".into(),
                provider: self.label.to_string(),
                resources: Vec::new(),
                sources: Vec::new(),
                references: Vec::new(),
                labels: Vec::new(),
                signatures: Vec::new(),
            })
        }
        async fn list_component_versions(&self, _name: &str) -> Result<Vec<String>, OcmError> {
            if self.fail_transport {
                return Err(OcmError::Transport("boom".into()));
            }
            if self.fail_not_found {
                return Err(OcmError::NotFound("none".into()));
            }
            Ok(self.versions.iter().map(|v| v.to_string()).collect())
        }
        async fn add_component_version(&self, _descriptor: &Descriptor) -> Result<(), OcmError> {
            unimplemented!()
        }
        async fn add_local_resource(
            &self,
            _: &str,
            _: &str,
            _: &Resource,
            _: BlobStream,
        ) -> Result<Resource, OcmError> {
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

    fn spec(path: &str) -> RepositorySpec {
        RepositorySpec::CtfArchive(CtfArchiveSpec { file_path: path.into(), access_mode: crate::repository_spec::AccessMode::READ })
    }

    /// Routes `open()` to whichever [`FakeRepo`] matches the spec's label, so tests
    /// can give each resolver a distinct backend despite sharing one provider kind.
    struct RoutingProvider {
        by_label: HashMap<&'static str, Arc<FakeRepo>>,
    }

    impl RoutingProvider {
        fn new(repos: Vec<Arc<FakeRepo>>) -> Self {
            Self { by_label: repos.into_iter().map(|r| (r.label, r)).collect() }
        }
    }

    #[async_trait::async_trait]
    impl Provider for RoutingProvider {
        fn consumer_identity(&self, spec: &RepositorySpec) -> crate::identity::Identity {
            crate::identity::Identity::new().with("path", spec.label())
        }
        async fn open(
            &self,
            spec: &RepositorySpec,
            _credentials: &Credentials,
        ) -> Result<Arc<dyn ComponentVersionRepository>, OcmError> {
            self.by_label
                .get(spec.label().as_str())
                .cloned()
                .map(|r| r as Arc<dyn ComponentVersionRepository>)
                .ok_or_else(|| OcmError::NotFound(spec.label()))
        }
    }

    #[tokio::test]
    async fn priority_tie_first_in_list_wins() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let copy = Arc::new(FakeRepo { label: "copy", versions: vec![], fail_not_found: false, fail_transport: false, calls: calls.clone() });
        let original = Arc::new(FakeRepo { label: "original", versions: vec![], fail_not_found: false, fail_transport: false, calls: calls.clone() });

        let mut providers = ProviderRegistry::new();
        providers.register(
            crate::repository_spec::RepositorySpecKind::CtfArchive,
            Arc::new(RoutingProvider::new(vec![copy.clone(), original.clone()])),
        );
        let dispatcher = FallbackDispatcher::new(
            vec![
                Resolver { repository_spec: spec("copy"), prefix: String::new(), priority: 0 },
                Resolver { repository_spec: spec("original"), prefix: String::new(), priority: 0 },
            ],
            Arc::new(providers),
            Arc::new(CredentialResolver::new()),
        );

        let descriptor = dispatcher
            .get_component_version("acme/helloworld", "1.0.0", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(descriptor.provider, "copy");
        assert_eq!(calls.lock().unwrap().as_slice(), ["copy"]);
    }

    #[tokio::test]
    async fn higher_priority_resolver_wins() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let copy = Arc::new(FakeRepo { label: "copy", versions: vec![], fail_not_found: false, fail_transport: false, calls: calls.clone() });
        let original = Arc::new(FakeRepo { label: "original", versions: vec![], fail_not_found: false, fail_transport: false, calls: calls.clone() });

        let mut providers = ProviderRegistry::new();
        providers.register(
            crate::repository_spec::RepositorySpecKind::CtfArchive,
            Arc::new(RoutingProvider::new(vec![copy.clone(), original.clone()])),
        );

        let dispatcher = FallbackDispatcher::new(
            vec![
                Resolver { repository_spec: spec("copy"), prefix: String::new(), priority: 0 },
                Resolver { repository_spec: spec("original"), prefix: String::new(), priority: 20 },
            ],
            Arc::new(providers),
            Arc::new(CredentialResolver::new()),
        );

        let descriptor = dispatcher
            .get_component_version("acme/helloworld", "1.0.0", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(descriptor.provider, "original");
        assert_eq!(calls.lock().unwrap().as_slice(), ["original"]);
    }

    #[tokio::test]
    async fn fallback_on_not_found_pins_binding() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let primary = Arc::new(FakeRepo { label: "primary", versions: vec![], fail_not_found: true, fail_transport: false, calls: calls.clone() });
        let mirror = Arc::new(FakeRepo { label: "mirror", versions: vec![], fail_not_found: false, fail_transport: false, calls: calls.clone() });

        let mut providers = ProviderRegistry::new();
        providers.register(
            crate::repository_spec::RepositorySpecKind::CtfArchive,
            Arc::new(RoutingProvider::new(vec![primary.clone(), mirror.clone()])),
        );

        let dispatcher = FallbackDispatcher::new(
            vec![
                Resolver { repository_spec: spec("primary"), prefix: String::new(), priority: 0 },
                Resolver { repository_spec: spec("mirror"), prefix: String::new(), priority: 0 },
            ],
            Arc::new(providers),
            Arc::new(CredentialResolver::new()),
        );

        let descriptor = dispatcher.get_component_version("hello", "1.0.0", &CancellationToken::new()).await.unwrap();
        assert_eq!(descriptor.provider, "mirror");

        calls.lock().unwrap().clear();
        let descriptor = dispatcher.get_component_version("hello", "1.0.0", &CancellationToken::new()).await.unwrap();
        assert_eq!(descriptor.provider, "mirror");
        assert_eq!(calls.lock().unwrap().as_slice(), ["mirror"]);
    }

    #[tokio::test]
    async fn listing_union_aborts_on_non_not_found_error() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let nonexistent = Arc::new(FakeRepo {
            label: "nonexistent",
            versions: vec![],
            fail_not_found: false,
            fail_transport: true,
            calls: calls.clone(),
        });
        let good = Arc::new(FakeRepo {
            label: "good",
            versions: vec!["1.0.0"],
            fail_not_found: false,
            fail_transport: false,
            calls: calls.clone(),
        });

        let mut providers = ProviderRegistry::new();
        providers.register(
            crate::repository_spec::RepositorySpecKind::CtfArchive,
            Arc::new(RoutingProvider::new(vec![nonexistent.clone(), good.clone()])),
        );

        let dispatcher = FallbackDispatcher::new(
            vec![
                Resolver { repository_spec: spec("nonexistent"), prefix: String::new(), priority: 20 },
                Resolver { repository_spec: spec("good"), prefix: String::new(), priority: 0 },
            ],
            Arc::new(providers),
            Arc::new(CredentialResolver::new()),
        );

        let err = dispatcher.list_component_versions("acme/helloworld", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, OcmError::Transport(_)));
    }

    #[tokio::test]
    async fn prefix_filter_skips_non_matching_resolvers() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let repo_a = Arc::new(FakeRepo { label: "a", versions: vec![], fail_not_found: false, fail_transport: false, calls: calls.clone() });
        let repo_b = Arc::new(FakeRepo { label: "b", versions: vec![], fail_not_found: false, fail_transport: false, calls: calls.clone() });

        struct RoutingProvider {
            a: Arc<FakeRepo>,
            b: Arc<FakeRepo>,
        }
        #[async_trait::async_trait]
        impl Provider for RoutingProvider {
            fn consumer_identity(&self, spec: &RepositorySpec) -> crate::identity::Identity {
                crate::identity::Identity::new().with("path", spec.label())
            }
            async fn open(
                &self,
                spec: &RepositorySpec,
                _credentials: &Credentials,
            ) -> Result<Arc<dyn ComponentVersionRepository>, OcmError> {
                if spec.label() == "a" {
                    Ok(self.a.clone() as Arc<dyn ComponentVersionRepository>)
                } else {
                    Ok(self.b.clone() as Arc<dyn ComponentVersionRepository>)
                }
            }
        }
        let mut providers = ProviderRegistry::new();
        providers.register(
            crate::repository_spec::RepositorySpecKind::CtfArchive,
            Arc::new(RoutingProvider { a: repo_a.clone(), b: repo_b.clone() }),
        );

        let dispatcher = FallbackDispatcher::new(
            vec![
                Resolver { repository_spec: spec("a"), prefix: "github.com/not-acme.org".into(), priority: 0 },
                Resolver { repository_spec: spec("b"), prefix: "github.com/acme.org".into(), priority: 0 },
            ],
            Arc::new(providers),
            Arc::new(CredentialResolver::new()),
        );

        let descriptor = dispatcher
            .get_component_version("github.com/acme.org/hello", "1.0.0", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(descriptor.provider, "b");
        assert_eq!(calls.lock().unwrap().as_slice(), ["b"]);
    }
}
