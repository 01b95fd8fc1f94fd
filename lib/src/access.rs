//! Resource/source access specifications: a tagged union describing where artifact
//! bytes live.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::OcmError;

/// How a [`crate::descriptor::Resource`] or [`crate::descriptor::Source`]'s bytes
/// are retrieved.
///
/// This is an open tagged union: variants this crate actively reads and writes, plus
/// a `Raw` escape hatch for access types it only needs to pass through losslessly
/// (git, helm, and any future remote access kind).
#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    /// Content addressed by digest inside the backing CTF/OCI store.
    LocalBlob {
        /// The content-addressable digest of the blob (e.g. `sha256:<hex>`).
        local_reference: String,
        /// The declared media type of the blob contents.
        media_type: String,
    },

    /// A remote OCI image reference, fetched by the consumer rather than this crate.
    OciImage {
        /// The fully qualified image reference (`host/repo:tag` or `host/repo@digest`).
        image_reference: String,
    },

    /// No access: the resource/source is declared but its bytes are not retrievable
    /// through this descriptor (e.g. purely informational entries).
    None,

    /// An access type this crate does not implement fetch logic for (git, helm, ...),
    /// preserved losslessly.
    Raw {
        /// The `type` discriminator as written in the source JSON.
        access_type: String,
        /// The remaining fields, preserved verbatim.
        fields: Map<String, Value>,
    },
}

impl Access {
    /// The `type` discriminator this access would serialise with.
    pub fn type_tag(&self) -> &str {
        match self {
            Access::LocalBlob { .. } => "localBlob/v1",
            Access::OciImage { .. } => "ociArtifact/v1",
            Access::None => "none",
            Access::Raw { access_type, .. } => access_type,
        }
    }

    /// True for [`Access::None`]: a resource with this access carries no digest
    /// (spec §4.6 safe-to-digest precondition).
    pub fn is_none(&self) -> bool {
        matches!(self, Access::None)
    }

    /// Decode an access from its canonical JSON object form.
    pub fn decode(value: &Value) -> Result<Self, OcmError> {
        let Value::Object(map) = value else {
            return Err(OcmError::UnsupportedMediaType("access is not a JSON object".into()));
        };
        let mut map = map.clone();
        let Some(Value::String(access_type)) = map.remove("type") else {
            return Err(OcmError::UnsupportedMediaType("access missing 'type' field".into()));
        };

        match access_type.as_str() {
            "localBlob/v1" | "localBlob" => {
                let local_reference = string_field(&map, "localReference")?;
                let media_type = string_field(&map, "mediaType")?;
                Ok(Access::LocalBlob { local_reference, media_type })
            }
            "ociArtifact/v1" | "ociArtifact" | "ociImage" => {
                let image_reference = string_field(&map, "imageReference")?;
                Ok(Access::OciImage { image_reference })
            }
            "none" => Ok(Access::None),
            other => Ok(Access::Raw {
                access_type: other.to_string(),
                fields: map,
            }),
        }
    }

    /// Encode an access to its canonical JSON object form.
    pub fn encode(&self) -> Value {
        let mut map = Map::new();
        match self {
            Access::LocalBlob { local_reference, media_type } => {
                map.insert("localReference".into(), Value::String(local_reference.clone()));
                map.insert("mediaType".into(), Value::String(media_type.clone()));
            }
            Access::OciImage { image_reference } => {
                map.insert("imageReference".into(), Value::String(image_reference.clone()));
            }
            Access::None => {}
            Access::Raw { fields, .. } => map = fields.clone(),
        }
        map.insert("type".into(), Value::String(self.type_tag().to_string()));
        Value::Object(map)
    }
}

fn string_field(map: &Map<String, Value>, key: &str) -> Result<String, OcmError> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| OcmError::UnsupportedMediaType(format!("access missing '{key}' field")))
}

impl Serialize for Access {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.encode().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Access {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Access::decode(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_local_blob() {
        let access = Access::LocalBlob {
            local_reference: "sha256:abc123".into(),
            media_type: "application/vnd.oci.image.layer.v1.tar+gzip".into(),
        };
        let encoded = access.encode();
        let decoded = Access::decode(&encoded).unwrap();
        assert_eq!(decoded, access);
    }

    #[test]
    fn roundtrips_oci_image() {
        let access = Access::OciImage {
            image_reference: "ghcr.io/acme/helloworld:1.0.0".into(),
        };
        let encoded = access.encode();
        let decoded = Access::decode(&encoded).unwrap();
        assert_eq!(decoded, access);
    }

    #[test]
    fn preserves_unknown_access_type_losslessly() {
        let value = serde_json::json!({
            "type": "gitHub/v1",
            "repoUrl": "https://github.com/acme/helloworld",
            "commit": "deadbeef",
        });
        let decoded = Access::decode(&value).unwrap();
        let Access::Raw { access_type, fields } = &decoded else {
            panic!("expected Raw variant");
        };
        assert_eq!(access_type, "gitHub/v1");
        assert_eq!(fields["commit"], "deadbeef");

        let reencoded = decoded.encode();
        let redecoded = Access::decode(&reencoded).unwrap();
        assert_eq!(redecoded, decoded);
    }

    #[test]
    fn none_access_has_no_digest_eligible_fields() {
        assert!(Access::None.is_none());
        assert!(!Access::OciImage { image_reference: "x".into() }.is_none());
    }
}
