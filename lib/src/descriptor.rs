//! The component descriptor data model: the immutable, signed manifest a
//! [`crate::component_repository::ComponentVersionRepository`] reads and writes.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::Access;
use crate::digest::Digest;
use crate::error::OcmError;

/// A free-form label attached to a descriptor, resource, source, or reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    /// The label key.
    pub name: String,
    /// The label value, any JSON shape.
    pub value: Value,
    /// Whether this label is itself covered by descriptor normalisation/signing.
    #[serde(default)]
    pub signing: bool,
}

/// Extra identity attributes distinguishing resources/sources that otherwise share a
/// `(name, version)` pair (e.g. multiple architectures of the same image).
pub type ExtraIdentity = BTreeMap<String, String>;

/// A queryable identity for a resource or source: the tuple `getLocalResource` and
/// `getLocalSource` match against.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceIdentity {
    /// The resource/source name.
    pub name: String,
    /// The resource/source version, when it differs from the component's own version.
    pub version: Option<String>,
    /// Extra identity attributes (e.g. `{"architecture": "arm64"}`).
    pub extra_identity: ExtraIdentity,
}

impl ResourceIdentity {
    /// An identity naming only `name`, with no version or extra attributes.
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), version: None, extra_identity: ExtraIdentity::new() }
    }
}

/// The relation of a resource to the component that declares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceRelation {
    /// Produced by this component's own build.
    Local,
    /// Sourced from a third party (e.g. a base image).
    External,
}

/// A named artifact with an access describing how to retrieve its bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// The resource name, unique together with `version` and `extra_identity`.
    pub name: String,
    /// The resource version.
    pub version: String,
    /// The resource kind (e.g. `ociImage`, `helmChart`, `blob`).
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Whether this resource was built locally or sourced externally.
    pub relation: ResourceRelation,
    /// How to retrieve the resource's bytes.
    pub access: Access,
    /// The content digest, present iff `access` is not [`Access::None`] (spec §4.6).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    /// Extra identity attributes distinguishing this resource from same-named siblings.
    #[serde(rename = "extraIdentity", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_identity: ExtraIdentity,
    /// Labels attached to this resource.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

impl Resource {
    /// Whether `identity` names this resource: `name` (and `version`, if given) match
    /// exactly, and every key in `identity.extra_identity` matches this resource's.
    pub fn matches(&self, identity: &ResourceIdentity) -> bool {
        if self.name != identity.name {
            return false;
        }
        if let Some(version) = &identity.version {
            if &self.version != version {
                return false;
            }
        }
        identity
            .extra_identity
            .iter()
            .all(|(k, v)| self.extra_identity.get(k).is_some_and(|actual| actual == v))
    }
}

/// A named artifact sourced as input to this component's build (e.g. a source tree).
///
/// Structurally identical to [`Resource`] minus the build `relation`, matching the
/// distinction the descriptor data model draws between resources and sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// The source name, unique together with `version` and `extra_identity`.
    pub name: String,
    /// The source version.
    pub version: String,
    /// The source kind (e.g. `git`, `filesystem`).
    #[serde(rename = "type")]
    pub source_type: String,
    /// How to retrieve the source's bytes.
    pub access: Access,
    /// The content digest, present iff `access` is not [`Access::None`] (spec §4.6).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    /// Extra identity attributes distinguishing this source from same-named siblings.
    #[serde(rename = "extraIdentity", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_identity: ExtraIdentity,
    /// Labels attached to this source.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

impl Source {
    /// Whether `identity` names this source. See [`Resource::matches`].
    pub fn matches(&self, identity: &ResourceIdentity) -> bool {
        if self.name != identity.name {
            return false;
        }
        if let Some(version) = &identity.version {
            if &self.version != version {
                return false;
            }
        }
        identity
            .extra_identity
            .iter()
            .all(|(k, v)| self.extra_identity.get(k).is_some_and(|actual| actual == v))
    }
}

/// A reference from this descriptor to another component version, forming a node in
/// the component DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentReferenceEntry {
    /// The label under which this reference is addressed within the parent descriptor.
    pub name: String,
    /// The referenced component's name.
    #[serde(rename = "componentName")]
    pub component_name: String,
    /// The referenced component's version.
    pub version: String,
    /// The digest of the referenced component's own descriptor, when pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    /// Labels attached to this reference.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

/// The additional attributes of an RSA signature artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureInfo {
    /// The signing algorithm (`RSASSA-PSS` or `RSASSA-PKCS1-V1_5`).
    pub algorithm: String,
    /// The media type of `value` (`application/vnd.ocm.signature.rsa.pss`,
    /// `application/vnd.ocm.signature.rsa`, or `application/x-pem-file`).
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Hex-encoded raw signature bytes, or a PEM bundle, depending on `media_type`.
    pub value: String,
    /// The signer's Distinguished Name, when the encoding policy embeds a certificate chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

/// A named signature over a descriptor's normalised digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    /// The user-assigned label distinguishing this signature among others on the
    /// same descriptor (e.g. `"default"`, `"release"`).
    pub name: String,
    /// The digest that was signed.
    pub digest: Digest,
    /// The signature bytes and metadata.
    #[serde(rename = "signature")]
    pub signature_info: SignatureInfo,
}

/// The full component descriptor: an immutable, signable manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// The component's name (dotted/slashed grammar, see [`crate::reference`]).
    #[serde(rename = "componentName")]
    pub component_name: String,
    /// The component's version.
    pub version: String,
    /// The provider identifier (e.g. an organisation name).
    pub provider: String,
    /// The artifacts this component produces.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
    /// The artifacts this component was built from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    /// Edges to other component versions in the dependency DAG.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ComponentReferenceEntry>,
    /// Labels attached to the descriptor itself.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    /// Signatures over this descriptor's normalised digest.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<Signature>,
}

impl Descriptor {
    /// Find a signature by name.
    pub fn signature(&self, name: &str) -> Option<&Signature> {
        self.signatures.iter().find(|s| s.name == name)
    }

    /// Insert or replace a signature by name.
    ///
    /// Returns `AlreadyExists` if a signature with the same name is present and
    /// `force` is `false` (spec §4.8 step 7).
    pub fn put_signature(&mut self, signature: Signature, force: bool) -> Result<(), OcmError> {
        if let Some(existing) = self.signatures.iter().position(|s| s.name == signature.name) {
            if !force {
                return Err(OcmError::AlreadyExists(signature.name.clone()));
            }
            self.signatures[existing] = signature;
        } else {
            self.signatures.push(signature);
        }
        Ok(())
    }

    /// Find a resource by identity.
    pub fn resource(&self, identity: &ResourceIdentity) -> Option<&Resource> {
        self.resources.iter().find(|r| r.matches(identity))
    }

    /// Find a source by identity.
    pub fn source(&self, identity: &ResourceIdentity) -> Option<&Source> {
        self.sources.iter().find(|s| s.matches(identity))
    }

    /// Check the safe-to-digest precondition (spec §4.6): every resource/source with a
    /// non-[`Access::None`] access carries a digest, and every one with
    /// [`Access::None`] carries none. Returns the first violation found, if any.
    pub fn safe_to_digest_violation(&self) -> Option<String> {
        for resource in &self.resources {
            if resource.access.is_none() && resource.digest.is_some() {
                return Some(format!("resource '{}' has no access but carries a digest", resource.name));
            }
            if !resource.access.is_none() && resource.digest.is_none() {
                return Some(format!("resource '{}' has an access but carries no digest", resource.name));
            }
        }
        for source in &self.sources {
            if source.access.is_none() && source.digest.is_some() {
                return Some(format!("source '{}' has no access but carries a digest", source.name));
            }
            if !source.access.is_none() && source.digest.is_none() {
                return Some(format!("source '{}' has an access but carries no digest", source.name));
            }
        }
        for reference in &self.references {
            if reference.digest.is_none() {
                return Some(format!("reference '{}' carries no digest", reference.name));
            }
        }
        None
    }
}

/// A `(name, version)` pair identifying a component version, used by descriptor DAG
/// traversal (spec §9: validate acyclicity lazily with a visited set).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentVersionKey {
    /// The component name.
    pub name: String,
    /// The component version.
    pub version: String,
}

/// Walk the reference DAG rooted at `root`, calling `lookup` to fetch each referenced
/// descriptor, and return an error if a cycle is found.
///
/// `lookup` returning `None` for a key means "not traversable from here" (e.g. a
/// reference this crate has no repository configured for) and is treated as a leaf,
/// not an error: cycle detection only needs to see descriptors it can reach.
pub fn detect_reference_cycle(
    root: &Descriptor,
    lookup: &mut dyn FnMut(&ComponentVersionKey) -> Option<Descriptor>,
) -> Result<(), OcmError> {
    let mut visiting = HashSet::new();
    let mut visited = HashSet::new();
    walk(root, lookup, &mut visiting, &mut visited)
}

fn walk(
    descriptor: &Descriptor,
    lookup: &mut dyn FnMut(&ComponentVersionKey) -> Option<Descriptor>,
    visiting: &mut HashSet<ComponentVersionKey>,
    visited: &mut HashSet<ComponentVersionKey>,
) -> Result<(), OcmError> {
    let key = ComponentVersionKey {
        name: descriptor.component_name.clone(),
        version: descriptor.version.clone(),
    };
    if visited.contains(&key) {
        return Ok(());
    }
    if !visiting.insert(key.clone()) {
        return Err(OcmError::UnsafeDescriptor(format!(
            "cyclic component reference detected at {}:{}",
            key.name, key.version
        )));
    }

    for reference in &descriptor.references {
        let child_key = ComponentVersionKey {
            name: reference.component_name.clone(),
            version: reference.version.clone(),
        };
        if let Some(child) = lookup(&child_key) {
            walk(&child, lookup, visiting, visited)?;
        }
    }

    visiting.remove(&key);
    visited.insert(key);
    Ok(())
}
