//! Digests over normalised descriptor bytes.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};

use crate::error::OcmError;

/// Hash algorithms accepted for descriptor/resource digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// SHA-256, stored canonically as `SHA-256`.
    #[display("SHA-256")]
    Sha256,

    /// SHA-512, stored canonically as `SHA-512`.
    #[display("SHA-512")]
    Sha512,
}

impl HashAlgorithm {
    /// Parse a hash algorithm name, accepting case- and dash-insensitive aliases
    /// (`SHA256`, `SHA-256`, `sha256`, ...).
    pub fn parse(s: &str) -> Result<Self, OcmError> {
        let normalised = s.to_ascii_lowercase().replace('-', "");
        match normalised.as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(OcmError::UnsupportedHashAlgorithm(other.to_string())),
        }
    }

    /// Hash `bytes`, returning lowercase hex.
    pub fn hash_hex(&self, bytes: &[u8]) -> String {
        match self {
            Self::Sha256 => hex::encode(Sha256::digest(bytes)),
            Self::Sha512 => hex::encode(Sha512::digest(bytes)),
        }
    }
}

/// The current canonical JSON normalisation algorithm identifier.
pub const NORMALISATION_CURRENT: &str = "jsonNormalisation/v4alpha1";

/// A legacy normalisation identifier accepted as an alias for [`NORMALISATION_CURRENT`]
/// by both sign and verify paths (with a warning logged).
pub const NORMALISATION_LEGACY_ALIAS: &str = "jsonNormalisation/v3";

/// Resolve a normalisation algorithm identifier to its canonical form, logging a warning
/// when a legacy alias is used.
pub fn canonical_normalisation_algorithm(name: &str) -> Result<&'static str, OcmError> {
    match name {
        NORMALISATION_CURRENT => Ok(NORMALISATION_CURRENT),
        NORMALISATION_LEGACY_ALIAS => {
            tracing::warn!(
                requested = name,
                canonical = NORMALISATION_CURRENT,
                "normalisation algorithm is a legacy alias"
            );
            Ok(NORMALISATION_CURRENT)
        }
        other => Err(OcmError::UnsupportedHashAlgorithm(other.to_string())),
    }
}

/// A content digest over a normalised descriptor or resource access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    /// The hashing algorithm used, stored canonically (`SHA-256`, `SHA-512`).
    #[serde(rename = "hashAlgorithm")]
    pub hash_algorithm: String,

    /// The normalisation algorithm applied before hashing.
    #[serde(rename = "normalisationAlgorithm")]
    pub normalisation_algorithm: String,

    /// The lowercase hex-encoded hash value.
    pub value: String,
}

impl Digest {
    /// Build a digest by normalising `bytes` that are already known to be in normalised form,
    /// hashing them with `algorithm`.
    pub fn of_normalised_bytes(bytes: &[u8], algorithm: HashAlgorithm, normalisation: &str) -> Self {
        Self {
            hash_algorithm: algorithm.to_string(),
            normalisation_algorithm: normalisation.to_string(),
            value: algorithm.hash_hex(bytes),
        }
    }

    /// Parse the `hash_algorithm` field into a [`HashAlgorithm`].
    pub fn algorithm(&self) -> Result<HashAlgorithm, OcmError> {
        HashAlgorithm::parse(&self.hash_algorithm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_and_dash_insensitive_aliases() {
        for alias in ["sha256", "SHA256", "SHA-256", "Sha-256"] {
            assert_eq!(HashAlgorithm::parse(alias).unwrap(), HashAlgorithm::Sha256);
        }
    }

    #[test]
    fn rejects_unknown_algorithm() {
        assert!(HashAlgorithm::parse("md5").is_err());
    }

    #[test]
    fn legacy_normalisation_alias_resolves_to_current() {
        assert_eq!(
            canonical_normalisation_algorithm(NORMALISATION_LEGACY_ALIAS).unwrap(),
            NORMALISATION_CURRENT
        );
    }
}
