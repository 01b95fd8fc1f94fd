//! Consumer identities used to look credentials up against configured repositories.

use std::collections::BTreeMap;

use derive_more::Debug;
use serde::{Deserialize, Serialize};

/// An ordered map of lowercase string attributes used as a credential lookup key.
///
/// Keys are conventionally lowercase (`hostname`, `port`, `path`, `scheme`, `type`,
/// plus handler-specific keys like `algorithm`/`signature`); this type does not
/// enforce lowercasing itself, callers are expected to normalise before inserting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity(BTreeMap<String, String>);

impl Identity {
    /// Create an empty identity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an attribute, returning `self` for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Set an attribute in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up an attribute.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Iterate over the attributes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `IdentitySubset(a, b) = true` iff every key in `b` is present in `a` with equal value.
    ///
    /// Called as `a.is_superset_of(b)`.
    pub fn is_superset_of(&self, other: &Identity) -> bool {
        other
            .0
            .iter()
            .all(|(k, v)| self.0.get(k).is_some_and(|actual| actual == v))
    }
}

impl FromIterator<(String, String)> for Identity {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A map of credential attributes resolved for a given [`Identity`].
///
/// Keys are conventionally `username`, `password`, `refresh_token`, `access_token`,
/// `public_key_pem`, `private_key_pem`, and the corresponding `*_file` variants, plus
/// handler-specific keys such as `underlying` (a PEM certificate used for issuer checks).
#[derive(Clone, Default, Serialize, Deserialize)]
#[derive(Debug)]
pub struct Credentials(#[debug(skip)] BTreeMap<String, String>);

impl Credentials {
    /// Create an empty credential map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a credential attribute, returning `self` for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Look up a credential attribute.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}
