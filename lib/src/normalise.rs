//! Descriptor normalisation and digesting (C6): render a [`Descriptor`] to the
//! canonical byte sequence its digest is computed over.
//!
//! Canonicalisation relies on `serde_json::Map`'s default `BTreeMap` backing (this
//! crate does not enable `serde_json`'s `preserve_order` feature): serialising a
//! `Value` produced from a `BTreeMap`-keyed structure sorts object keys
//! lexicographically for free, which is exactly `jsonNormalisation/v4alpha1`'s rule.

use serde_json::{Map, Value};

use crate::descriptor::Descriptor;
use crate::digest::{canonical_normalisation_algorithm, Digest, HashAlgorithm};
use crate::error::OcmError;

/// Render `descriptor` to the canonical bytes that `digest_descriptor` hashes,
/// under the normalisation scheme named by `algorithm` (a current name or legacy
/// alias, per [`canonical_normalisation_algorithm`]).
///
/// Per spec §4.6, normalisation strips the `signatures` array (digests are
/// computed over the content a signature attests to, not other signatures) and
/// any label not marked `signing: true` on a resource, source, or the descriptor
/// itself.
pub fn normalise(descriptor: &Descriptor, algorithm: &str) -> Result<Vec<u8>, OcmError> {
    canonical_normalisation_algorithm(algorithm)?;

    let value = serde_json::to_value(descriptor)
        .map_err(|e| OcmError::UnsafeDescriptor(format!("descriptor does not serialise: {e}")))?;
    let mut object = match value {
        Value::Object(object) => object,
        _ => return Err(OcmError::UnsafeDescriptor("descriptor did not serialise to a JSON object".into())),
    };

    object.remove("signatures");
    strip_non_signing_labels(&mut object);
    if let Some(Value::Array(resources)) = object.get_mut("resources") {
        resources.iter_mut().filter_map(Value::as_object_mut).for_each(strip_non_signing_labels);
    }
    if let Some(Value::Array(sources)) = object.get_mut("sources") {
        sources.iter_mut().filter_map(Value::as_object_mut).for_each(strip_non_signing_labels);
    }
    if let Some(Value::Array(references)) = object.get_mut("references") {
        references.iter_mut().filter_map(Value::as_object_mut).for_each(strip_non_signing_labels);
    }

    serde_json::to_vec(&Value::Object(object))
        .map_err(|e| OcmError::UnsafeDescriptor(format!("normalised descriptor does not serialise: {e}")))
}

fn strip_non_signing_labels(object: &mut Map<String, Value>) {
    let Some(Value::Array(labels)) = object.get_mut("labels") else {
        return;
    };
    labels.retain(|label| {
        label
            .get("signing")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    });
    if labels.is_empty() {
        object.remove("labels");
    }
}

/// Normalise `descriptor` under `normalisation`, then hash the result under
/// `hash_algorithm` into a [`Digest`] (spec §4.6).
pub fn digest_descriptor(descriptor: &Descriptor, hash_algorithm: HashAlgorithm, normalisation: &str) -> Result<Digest, OcmError> {
    let canonical = normalise(descriptor, normalisation)?;
    Ok(Digest::of_normalised_bytes(&canonical, hash_algorithm, normalisation))
}
