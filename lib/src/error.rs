//! The error taxonomy for the component-version resolution and access core.
//!
//! Every fallible operation in this crate returns [`OcmError`] (or a `color_eyre::Result`
//! wrapping one, at the CLI boundary). The taxonomy exists so that control flow that must
//! distinguish error *kinds* - the fallback dispatcher recovering from [`OcmError::NotFound`],
//! the CLI mapping a kind to an exit code - doesn't have to downcast an opaque error chain.

use thiserror::Error;

/// A parse failure for a component reference.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The version suffix did not match the loose-semver grammar.
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    /// The digest suffix did not match `<algo>:<hex>=32`.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// The component name did not match the dotted-domain/slash-segments grammar.
    #[error("invalid component name: {0}")]
    InvalidComponent(String),

    /// The `<type>::` head named a type tag not registered with the [`crate::repository_spec::Scheme`].
    #[error("unknown repository type: {0}")]
    UnknownType(String),

    /// No component name could be isolated from the input.
    #[error("missing component name in reference: {0}")]
    MissingComponent(String),
}

/// The unified error taxonomy for the resolution and access core.
#[derive(Debug, Error)]
pub enum OcmError {
    /// Failed to parse a component reference.
    #[error("parse component reference")]
    Parse(#[from] ParseError),

    /// A repository spec named a `type` tag with no registered [`crate::provider::Provider`].
    #[error("unsupported repository type: {0}")]
    UnsupportedRepositoryType(String),

    /// A signature or access carried a media type this crate does not understand.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// A digest named a hash algorithm this crate does not implement.
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedHashAlgorithm(String),

    /// The requested component, version, or resource does not exist in the backend.
    #[error("not found: {0}")]
    NotFound(String),

    /// A network or filesystem transport failure.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A write was attempted against a read-only access mode or archive form.
    #[error("repository is read-only: {0}")]
    ReadOnly(String),

    /// A descriptor violated the safe-to-digest precondition under strict mode.
    #[error("descriptor is not safe to digest: {0}")]
    UnsafeDescriptor(String),

    /// Recomputing a stored digest during verification produced a different value.
    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch {
        /// The digest recorded in the descriptor/signature.
        expected: String,
        /// The digest recomputed during verification.
        actual: String,
    },

    /// Cryptographic signature verification failed.
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    /// A certificate chain did not validate against the configured roots.
    #[error("certificate invalid: {0}")]
    CertificateInvalid(String),

    /// A signature's declared issuer does not match the credential-supplied certificate subject.
    #[error("issuer mismatch: {0}")]
    IssuerMismatch(String),

    /// A signature with the same name already exists and `force` was not set.
    #[error("signature already exists: {0}")]
    AlreadyExists(String),

    /// The operation was cancelled before completing.
    #[error("operation cancelled")]
    Cancelled,

    /// Credential resolution failed to find a match.
    ///
    /// Non-fatal by default: callers fall through to unauthenticated access unless the
    /// handler in question requires credentials, in which case it is converted to
    /// [`OcmError::SignatureInvalid`] by that handler.
    #[error("credential resolution failed: {0}")]
    CredentialResolution(String),

    /// No resolver in a fallback dispatcher matched or returned anything but `NotFound`.
    #[error("component not found in any configured repository: {0}")]
    ComponentNotFound(String),
}

impl OcmError {
    /// True for errors the fallback dispatcher should recover from by trying the next resolver.
    pub fn is_not_found(&self) -> bool {
        matches!(self, OcmError::NotFound(_))
    }

    /// The stable CLI exit code for this error kind.
    ///
    /// Exit codes are assigned in taxonomy-declaration order starting from 2 (0 is success,
    /// 1 is reserved for uncategorized/panic-adjacent failures surfaced by `color_eyre`).
    pub fn exit_code(&self) -> i32 {
        match self {
            OcmError::Parse(_) => 2,
            OcmError::UnsupportedRepositoryType(_) => 3,
            OcmError::UnsupportedMediaType(_) => 4,
            OcmError::UnsupportedHashAlgorithm(_) => 5,
            OcmError::NotFound(_) => 6,
            OcmError::Transport(_) => 7,
            OcmError::ReadOnly(_) => 8,
            OcmError::UnsafeDescriptor(_) => 9,
            OcmError::DigestMismatch { .. } => 10,
            OcmError::SignatureInvalid(_) => 11,
            OcmError::CertificateInvalid(_) => 12,
            OcmError::IssuerMismatch(_) => 13,
            OcmError::AlreadyExists(_) => 14,
            OcmError::Cancelled => 15,
            OcmError::CredentialResolution(_) => 16,
            OcmError::ComponentNotFound(_) => 17,
        }
    }
}

/// Convenience alias for results returned by the core crate.
pub type Result<T> = std::result::Result<T, OcmError>;
