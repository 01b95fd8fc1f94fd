//! Repository specifications: a tagged union of backend descriptions, plus the
//! [`Scheme`] registry that maps string type tags to variants.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::OcmError;

/// Read/write/create bits for a [`CtfArchiveSpec`].
///
/// Archive forms (`.tar`, `.tar.gz`, `.tgz`) reject [`AccessMode::WRITE`]; this is
/// enforced by the CTF backend at open time, not by this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "AccessModeWire", into = "String")]
pub struct AccessMode(u8);

impl AccessMode {
    /// Read permission.
    pub const READ: AccessMode = AccessMode(0b001);
    /// Write permission.
    pub const WRITE: AccessMode = AccessMode(0b010);
    /// Create-if-missing permission.
    pub const CREATE: AccessMode = AccessMode(0b100);

    /// The empty mode (no permissions).
    pub fn none() -> Self {
        AccessMode(0)
    }

    /// Union two modes.
    pub fn union(self, other: AccessMode) -> AccessMode {
        AccessMode(self.0 | other.0)
    }

    /// Whether `self` grants every bit set in `other`.
    pub fn contains(&self, other: AccessMode) -> bool {
        self.0 & other.0 == other.0
    }

    /// Parse from the string form: one or more of `readonly|readwrite|create` joined by `|`.
    pub fn parse_str(s: &str) -> Result<Self, OcmError> {
        let mut mode = AccessMode::none();
        for token in s.split('|') {
            mode = mode.union(match token.trim() {
                "readonly" => AccessMode::READ,
                "readwrite" => AccessMode::READ.union(AccessMode::WRITE),
                "create" => AccessMode::CREATE,
                other => {
                    return Err(OcmError::Parse(crate::error::ParseError::InvalidComponent(
                        format!("unknown access mode token: {other}"),
                    )))
                }
            });
        }
        Ok(mode)
    }

    /// Parse from the integer alias form: `0` readonly, `1` readwrite, `2` create.
    pub fn from_int_alias(n: u8) -> Result<Self, OcmError> {
        match n {
            0 => Ok(AccessMode::READ),
            1 => Ok(AccessMode::READ.union(AccessMode::WRITE)),
            2 => Ok(AccessMode::CREATE),
            other => Err(OcmError::Parse(crate::error::ParseError::InvalidComponent(
                format!("unknown access mode integer alias: {other}"),
            ))),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(AccessMode::READ.union(AccessMode::WRITE)) {
            parts.push("readwrite");
        } else if self.contains(AccessMode::READ) {
            parts.push("readonly");
        }
        if self.contains(AccessMode::CREATE) {
            parts.push("create");
        }
        write!(f, "{}", parts.join("|"))
    }
}

impl From<AccessMode> for String {
    fn from(mode: AccessMode) -> Self {
        mode.to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AccessModeWire {
    Text(String),
    Int(u8),
}

impl TryFrom<AccessModeWire> for AccessMode {
    type Error = OcmError;

    fn try_from(wire: AccessModeWire) -> Result<Self, Self::Error> {
        match wire {
            AccessModeWire::Text(s) => AccessMode::parse_str(&s),
            AccessModeWire::Int(n) => AccessMode::from_int_alias(n),
        }
    }
}

/// An OCI registry backend: component descriptors live under `sub_path` in the
/// registry rooted at `base_url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciRegistrySpec {
    /// Scheme + host[:port], with no path component.
    #[serde(rename = "baseUrl")]
    pub base_url: String,

    /// The registry repository path under which component descriptors live.
    #[serde(rename = "subPath", default)]
    pub sub_path: String,
}

/// A Common Transport Format backend: a directory or tar(.gz) archive on the local
/// filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtfArchiveSpec {
    /// Path to the directory or archive file.
    #[serde(rename = "filePath")]
    pub file_path: String,

    /// The requested access bits.
    #[serde(rename = "accessMode", default = "AccessMode::none")]
    pub access_mode: AccessMode,
}

impl CtfArchiveSpec {
    /// Whether `file_path` names an archive form (`.tar`, `.tar.gz`, `.tgz`) as opposed to
    /// a plain directory. Archive forms are read-only.
    pub fn is_archive_form(&self) -> bool {
        let lower = self.file_path.to_ascii_lowercase();
        lower.ends_with(".tar") || lower.ends_with(".tar.gz") || lower.ends_with(".tgz")
    }
}

/// The closed set of repository spec variants, with a `Raw` escape hatch for forward
/// compatibility with repository types this crate does not (yet) understand.
#[derive(Debug, Clone, PartialEq)]
pub enum RepositorySpec {
    /// A remote OCI registry.
    OciRegistry(OciRegistrySpec),
    /// A local CTF directory or archive.
    CtfArchive(CtfArchiveSpec),
    /// An unrecognised repository type, preserved losslessly.
    Raw {
        /// The `type` discriminator as written in the source JSON.
        type_tag: String,
        /// The remaining fields, preserved verbatim.
        fields: Map<String, Value>,
    },
}

impl RepositorySpec {
    /// A short, human-readable label for logging (e.g. fallback-dispatch events).
    pub fn label(&self) -> String {
        match self {
            RepositorySpec::OciRegistry(spec) => format!("{}/{}", spec.base_url, spec.sub_path),
            RepositorySpec::CtfArchive(spec) => spec.file_path.clone(),
            RepositorySpec::Raw { type_tag, .. } => type_tag.clone(),
        }
    }
}

/// The closed set of variant kinds, used as the key type for [`Scheme`] registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositorySpecKind {
    /// [`RepositorySpec::OciRegistry`]
    OciRegistry,
    /// [`RepositorySpec::CtfArchive`]
    CtfArchive,
}

/// A bijection between string type tags (versioned and unversioned aliases) and
/// repository spec variants, plus canonical JSON (de)serialisation.
#[derive(Debug, Clone)]
pub struct Scheme {
    aliases: HashMap<String, RepositorySpecKind>,
    canonical_tag: HashMap<RepositorySpecKind, &'static str>,
}

/// The canonical, versioned type tag for an OCI registry spec.
pub const OCI_REGISTRY_TYPE: &str = "OCIRegistry/v1";
/// The canonical, versioned type tag for a CTF archive spec.
pub const CTF_ARCHIVE_TYPE: &str = "CommonTransportFormat/v1";

impl Default for Scheme {
    fn default() -> Self {
        let mut scheme = Scheme {
            aliases: HashMap::new(),
            canonical_tag: HashMap::new(),
        };
        scheme.canonical_tag.insert(RepositorySpecKind::OciRegistry, OCI_REGISTRY_TYPE);
        scheme.canonical_tag.insert(RepositorySpecKind::CtfArchive, CTF_ARCHIVE_TYPE);

        scheme.register_alias(OCI_REGISTRY_TYPE, RepositorySpecKind::OciRegistry);
        scheme.register_alias("OCIRegistry", RepositorySpecKind::OciRegistry);
        // The external-interface examples in the wild sometimes spell this `OCIRepository`;
        // accept both spellings as aliases of the same variant.
        scheme.register_alias("OCIRepository/v1", RepositorySpecKind::OciRegistry);
        scheme.register_alias("OCIRepository", RepositorySpecKind::OciRegistry);
        scheme.register_alias(CTF_ARCHIVE_TYPE, RepositorySpecKind::CtfArchive);
        scheme.register_alias("CommonTransportFormat", RepositorySpecKind::CtfArchive);
        scheme.register_alias("CTF", RepositorySpecKind::CtfArchive);
        scheme
    }
}

impl Scheme {
    /// Register a type tag (versioned or unversioned) as an alias for `kind`.
    pub fn register_alias(&mut self, tag: impl Into<String>, kind: RepositorySpecKind) {
        self.aliases.insert(tag.into(), kind);
    }

    /// Look up the variant kind registered for a type tag.
    pub fn kind_for_tag(&self, tag: &str) -> Option<RepositorySpecKind> {
        self.aliases.get(tag).copied()
    }

    /// Construct an empty spec of the variant registered for `tag`.
    pub fn new_empty(&self, tag: &str) -> Result<RepositorySpec, OcmError> {
        match self.kind_for_tag(tag) {
            Some(RepositorySpecKind::OciRegistry) => Ok(RepositorySpec::OciRegistry(OciRegistrySpec {
                base_url: String::new(),
                sub_path: String::new(),
            })),
            Some(RepositorySpecKind::CtfArchive) => Ok(RepositorySpec::CtfArchive(CtfArchiveSpec {
                file_path: String::new(),
                access_mode: AccessMode::none(),
            })),
            None => Ok(RepositorySpec::Raw {
                type_tag: tag.to_string(),
                fields: Map::new(),
            }),
        }
    }

    /// Decode a repository spec from canonical JSON bytes.
    pub fn decode(&self, bytes: &[u8]) -> Result<RepositorySpec, OcmError> {
        let mut value: Value = serde_json::from_slice(bytes)
            .map_err(|e| OcmError::Transport(Box::new(e)))?;
        let Value::Object(ref mut map) = value else {
            return Err(OcmError::UnsupportedRepositoryType("not a JSON object".into()));
        };
        let Some(Value::String(type_tag)) = map.remove("type") else {
            return Err(OcmError::UnsupportedRepositoryType("missing 'type' field".into()));
        };

        match self.kind_for_tag(&type_tag) {
            Some(RepositorySpecKind::OciRegistry) => {
                let spec: OciRegistrySpec = serde_json::from_value(Value::Object(map.clone()))
                    .map_err(|e| OcmError::Transport(Box::new(e)))?;
                Ok(RepositorySpec::OciRegistry(spec))
            }
            Some(RepositorySpecKind::CtfArchive) => {
                let spec: CtfArchiveSpec = serde_json::from_value(Value::Object(map.clone()))
                    .map_err(|e| OcmError::Transport(Box::new(e)))?;
                Ok(RepositorySpec::CtfArchive(spec))
            }
            None => Ok(RepositorySpec::Raw {
                type_tag,
                fields: map.clone(),
            }),
        }
    }

    /// Encode a repository spec to canonical JSON bytes, with the `type` discriminator set
    /// to the canonical (versioned) tag for the spec's variant.
    pub fn encode(&self, spec: &RepositorySpec) -> Result<Vec<u8>, OcmError> {
        let mut value = match spec {
            RepositorySpec::OciRegistry(inner) => {
                serde_json::to_value(inner).map_err(|e| OcmError::Transport(Box::new(e)))?
            }
            RepositorySpec::CtfArchive(inner) => {
                serde_json::to_value(inner).map_err(|e| OcmError::Transport(Box::new(e)))?
            }
            RepositorySpec::Raw { fields, .. } => Value::Object(fields.clone()),
        };
        let type_tag = match spec {
            RepositorySpec::OciRegistry(_) => self.canonical_tag[&RepositorySpecKind::OciRegistry].to_string(),
            RepositorySpec::CtfArchive(_) => self.canonical_tag[&RepositorySpecKind::CtfArchive].to_string(),
            RepositorySpec::Raw { type_tag, .. } => type_tag.clone(),
        };
        if let Value::Object(map) = &mut value {
            map.insert("type".to_string(), Value::String(type_tag));
        }
        serde_json::to_vec(&value).map_err(|e| OcmError::Transport(Box::new(e)))
    }

    /// Copy fields between equivalent versions of the same logical variant.
    ///
    /// For the variants this crate knows about there is currently only one version each,
    /// so this degrades to a clone with the destination tag's canonical fields; it exists
    /// as the seam future version migrations hang off.
    pub fn convert(&self, src: &RepositorySpec, dst_tag: &str) -> Result<RepositorySpec, OcmError> {
        let dst_kind = self
            .kind_for_tag(dst_tag)
            .ok_or_else(|| OcmError::UnsupportedRepositoryType(dst_tag.to_string()))?;
        match (src, dst_kind) {
            (RepositorySpec::OciRegistry(spec), RepositorySpecKind::OciRegistry) => {
                Ok(RepositorySpec::OciRegistry(spec.clone()))
            }
            (RepositorySpec::CtfArchive(spec), RepositorySpecKind::CtfArchive) => {
                Ok(RepositorySpec::CtfArchive(spec.clone()))
            }
            _ => Err(OcmError::UnsupportedRepositoryType(format!(
                "cannot convert {src:?} into {dst_tag}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_oci_registry_spec() {
        let scheme = Scheme::default();
        let spec = RepositorySpec::OciRegistry(OciRegistrySpec {
            base_url: "https://ghcr.io".into(),
            sub_path: "open-component-model/ocm".into(),
        });
        let bytes = scheme.encode(&spec).unwrap();
        let decoded = scheme.decode(&bytes).unwrap();
        assert_eq!(decoded, spec);
    }

    #[test]
    fn decodes_unversioned_alias() {
        let scheme = Scheme::default();
        let bytes = br#"{"type":"CTF","filePath":"./archive","accessMode":"readwrite"}"#;
        let decoded = scheme.decode(bytes).unwrap();
        assert_eq!(
            decoded,
            RepositorySpec::CtfArchive(CtfArchiveSpec {
                file_path: "./archive".into(),
                access_mode: AccessMode::READ.union(AccessMode::WRITE),
            })
        );
    }

    #[test]
    fn preserves_unknown_type_losslessly() {
        let scheme = Scheme::default();
        let bytes = br#"{"type":"GitRepository/v1","url":"https://example.com/repo.git"}"#;
        let decoded = scheme.decode(bytes).unwrap();
        let RepositorySpec::Raw { type_tag, fields } = &decoded else {
            panic!("expected Raw variant");
        };
        assert_eq!(type_tag, "GitRepository/v1");
        assert_eq!(fields["url"], "https://example.com/repo.git");

        let reencoded = scheme.encode(&decoded).unwrap();
        let redecoded = scheme.decode(&reencoded).unwrap();
        assert_eq!(redecoded, decoded);
    }

    #[test]
    fn archive_forms_are_detected() {
        let spec = CtfArchiveSpec {
            file_path: "./archive.tar.gz".into(),
            access_mode: AccessMode::READ,
        };
        assert!(spec.is_archive_form());

        let spec = CtfArchiveSpec {
            file_path: "./archive".into(),
            access_mode: AccessMode::READ,
        };
        assert!(!spec.is_archive_form());
    }

    #[test]
    fn access_mode_integer_aliases() {
        assert_eq!(AccessMode::from_int_alias(0).unwrap(), AccessMode::READ);
        assert_eq!(
            AccessMode::from_int_alias(1).unwrap(),
            AccessMode::READ.union(AccessMode::WRITE)
        );
        assert_eq!(AccessMode::from_int_alias(2).unwrap(), AccessMode::CREATE);
    }
}
