//! RSA signature production and verification (C7): sign/verify a digest under a
//! configured scheme, producing or consuming signature artifacts that optionally
//! carry a certificate chain.
//!
//! PEM assembly here is hand-rolled string formatting over `base64` rather than
//! routed through a PEM-handling crate: the bundle this crate reads and writes is a
//! narrow, fixed shape (one `SIGNATURE` block plus a certificate chain), and the
//! `pem` crate's general-purpose header handling buys nothing a few lines of
//! string splitting doesn't already cover.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};

use crate::digest::{Digest, HashAlgorithm};
use crate::identity::{Credentials, Identity};

/// The RSA signing scheme used to produce a signature over a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    /// `RSASSA-PSS`, the default scheme.
    RsaPss,
    /// `RSASSA-PKCS1-V1_5`.
    RsaPkcs1V15,
}

impl SigningAlgorithm {
    /// Parse the wire name (`RSASSA-PSS` or `RSASSA-PKCS1-V1_5`).
    pub fn parse(s: &str) -> Result<Self, OcmError> {
        match s {
            "RSASSA-PSS" => Ok(Self::RsaPss),
            "RSASSA-PKCS1-V1_5" => Ok(Self::RsaPkcs1V15),
            other => Err(OcmError::UnsupportedMediaType(format!("unknown signing algorithm: {other}"))),
        }
    }

    /// The wire name this scheme serialises as.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::RsaPss => "RSASSA-PSS",
            Self::RsaPkcs1V15 => "RSASSA-PKCS1-V1_5",
        }
    }

    /// The media type for the `plain` encoding policy under this scheme.
    pub fn plain_media_type(self) -> &'static str {
        match self {
            Self::RsaPss => "application/vnd.ocm.signature.rsa.pss",
            Self::RsaPkcs1V15 => "application/vnd.ocm.signature.rsa",
        }
    }
}

/// How a produced signature's bytes are encoded onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodingPolicy {
    /// Hex bytes of the raw signature.
    Plain,
    /// A PEM bundle carrying the signature and the issuer certificate chain.
    Pem,
}

/// Media type for the `pem` encoding policy, regardless of signing algorithm.
pub const PEM_MEDIA_TYPE: &str = "application/x-pem-file";

use crate::descriptor::SignatureInfo;
use crate::error::OcmError;

/// The identity (spec §4.7) a sign/verify flow resolves credentials (C5) under:
/// `{ algorithm, signature, type: RSA/v1alpha1 }`.
pub fn credential_identity(algorithm: SigningAlgorithm, signature_name: &str) -> Identity {
    Identity::new()
        .with("type", "RSA/v1alpha1")
        .with("signature", signature_name)
        .with("algorithm", algorithm.wire_name())
}

/// Sign `digest` under `algorithm`/`policy`, sourcing key material (and, for the
/// `pem` policy, a certificate chain) from `credentials` (spec §4.7).
pub fn sign(
    digest: &Digest,
    algorithm: SigningAlgorithm,
    policy: EncodingPolicy,
    credentials: &Credentials,
) -> Result<SignatureInfo, OcmError> {
    let private_key = load_private_key(credentials)?;
    let hash = digest.algorithm()?;
    let digest_bytes = hex::decode(&digest.value)
        .map_err(|e| OcmError::UnsupportedMediaType(format!("digest value is not hex: {e}")))?;
    let raw_signature = sign_digest(&private_key, algorithm, hash, &digest_bytes)?;

    match policy {
        EncodingPolicy::Plain => Ok(SignatureInfo {
            algorithm: algorithm.wire_name().to_string(),
            media_type: algorithm.plain_media_type().to_string(),
            value: hex::encode(raw_signature),
            issuer: None,
        }),
        EncodingPolicy::Pem => {
            let chain_pem = credentials
                .get("certificate_chain_pem")
                .ok_or_else(|| OcmError::SignatureInvalid("pem encoding policy requires a certificate_chain_pem credential".into()))?;
            let issuer = first_cert_subject(chain_pem)?;
            let bundle = encode_signature_pem(algorithm, &raw_signature, chain_pem);
            Ok(SignatureInfo {
                algorithm: algorithm.wire_name().to_string(),
                media_type: PEM_MEDIA_TYPE.to_string(),
                value: bundle,
                issuer,
            })
        }
    }
}

/// Verify `signature` was produced over `digest`, sourcing verification key
/// material from `credentials` (spec §4.7).
pub fn verify(digest: &Digest, signature: &SignatureInfo, credentials: &Credentials) -> Result<(), OcmError> {
    verify_at(digest, signature, credentials, Utc::now())
}

/// As [`verify`], but with the "current time" used for certificate validity-period
/// checks (spec §4.7, §5: "a handler-owned clock function to permit test
/// determinism") supplied explicitly rather than read from the system clock.
pub fn verify_at(digest: &Digest, signature: &SignatureInfo, credentials: &Credentials, now: DateTime<Utc>) -> Result<(), OcmError> {
    let algorithm = SigningAlgorithm::parse(&signature.algorithm)?;
    let hash = digest.algorithm()?;
    let digest_bytes = hex::decode(&digest.value)
        .map_err(|e| OcmError::UnsupportedMediaType(format!("digest value is not hex: {e}")))?;

    if signature.media_type == PEM_MEDIA_TYPE {
        verify_pem(algorithm, hash, &digest_bytes, signature, credentials, now)
    } else {
        let raw_signature = hex::decode(&signature.value)
            .map_err(|e| OcmError::SignatureInvalid(format!("signature value is not hex: {e}")))?;
        let public_key = load_public_key(credentials)?;
        verify_digest(&public_key, algorithm, hash, &digest_bytes, &raw_signature)
    }
}

fn verify_pem(
    algorithm: SigningAlgorithm,
    hash: HashAlgorithm,
    digest_bytes: &[u8],
    signature: &SignatureInfo,
    credentials: &Credentials,
    now: DateTime<Utc>,
) -> Result<(), OcmError> {
    let parsed = parse_signature_pem(&signature.value)?;
    if parsed.chain.is_empty() {
        return Err(OcmError::CertificateInvalid("signature PEM carries no certificate chain".into()));
    }

    let anchor = credentials
        .get("underlying")
        .map(|pem_text| x509_certificate::X509Certificate::from_pem(pem_text.as_bytes()))
        .transpose()
        .map_err(|e| OcmError::CertificateInvalid(e.to_string()))?;

    let mut roots = system_roots();
    if let Some(anchor) = &anchor {
        roots.push(anchor.clone());
    }

    validate_chain(&parsed.chain, &roots, now)?;

    if let Some(issuer) = &signature.issuer {
        if !issuer.is_empty() {
            let underlying_subject = anchor
                .as_ref()
                .and_then(|cert| cert.subject_common_name())
                .ok_or_else(|| {
                    OcmError::IssuerMismatch("signature declares an issuer but no underlying certificate was supplied".into())
                })?;
            check_issuer_constraint(issuer, &underlying_subject)?;
        }
    }

    let leaf = &parsed.chain[0];
    let public_key = RsaPublicKey::from_pkcs1_der(&leaf.public_key_data())
        .map_err(|e| OcmError::CertificateInvalid(format!("leaf certificate has unsupported public key: {e}")))?;
    verify_digest(&public_key, algorithm, hash, digest_bytes, &parsed.raw_signature)
}

fn sign_digest(
    private_key: &RsaPrivateKey,
    algorithm: SigningAlgorithm,
    hash: HashAlgorithm,
    digest_bytes: &[u8],
) -> Result<Vec<u8>, OcmError> {
    use rand::rngs::OsRng;

    let result = match (algorithm, hash) {
        (SigningAlgorithm::RsaPkcs1V15, HashAlgorithm::Sha256) => {
            private_key.sign(Pkcs1v15Sign::new::<Sha256>(), digest_bytes)
        }
        (SigningAlgorithm::RsaPkcs1V15, HashAlgorithm::Sha512) => {
            private_key.sign(Pkcs1v15Sign::new::<Sha512>(), digest_bytes)
        }
        (SigningAlgorithm::RsaPss, HashAlgorithm::Sha256) => {
            private_key.sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), digest_bytes)
        }
        (SigningAlgorithm::RsaPss, HashAlgorithm::Sha512) => {
            private_key.sign_with_rng(&mut OsRng, Pss::new::<Sha512>(), digest_bytes)
        }
    };
    result.map_err(|e| OcmError::SignatureInvalid(e.to_string()))
}

fn verify_digest(
    public_key: &RsaPublicKey,
    algorithm: SigningAlgorithm,
    hash: HashAlgorithm,
    digest_bytes: &[u8],
    raw_signature: &[u8],
) -> Result<(), OcmError> {
    let result = match (algorithm, hash) {
        (SigningAlgorithm::RsaPkcs1V15, HashAlgorithm::Sha256) => {
            public_key.verify(Pkcs1v15Sign::new::<Sha256>(), digest_bytes, raw_signature)
        }
        (SigningAlgorithm::RsaPkcs1V15, HashAlgorithm::Sha512) => {
            public_key.verify(Pkcs1v15Sign::new::<Sha512>(), digest_bytes, raw_signature)
        }
        (SigningAlgorithm::RsaPss, HashAlgorithm::Sha256) => {
            public_key.verify(Pss::new::<Sha256>(), digest_bytes, raw_signature)
        }
        (SigningAlgorithm::RsaPss, HashAlgorithm::Sha512) => {
            public_key.verify(Pss::new::<Sha512>(), digest_bytes, raw_signature)
        }
    };
    result.map_err(|_| OcmError::SignatureInvalid("signature does not match digest".into()))
}

fn load_private_key(credentials: &Credentials) -> Result<RsaPrivateKey, OcmError> {
    let pem_text = read_pem_credential(credentials, "private_key_pem", "private_key_pem_file")?
        .ok_or_else(|| OcmError::SignatureInvalid("no private key material available for signing".into()))?;

    if pem_text.contains("BEGIN RSA PRIVATE KEY") {
        RsaPrivateKey::from_pkcs1_pem(&pem_text).map_err(|e| OcmError::SignatureInvalid(e.to_string()))
    } else {
        RsaPrivateKey::from_pkcs8_pem(&pem_text).map_err(|e| OcmError::SignatureInvalid(e.to_string()))
    }
}

fn load_public_key(credentials: &Credentials) -> Result<RsaPublicKey, OcmError> {
    let pem_text = read_pem_credential(credentials, "public_key_pem", "public_key_pem_file")?
        .ok_or_else(|| OcmError::SignatureInvalid("no public key material available for verification".into()))?;
    parse_public_key_pem(&pem_text)
}

fn parse_public_key_pem(pem_text: &str) -> Result<RsaPublicKey, OcmError> {
    if pem_text.contains("BEGIN CERTIFICATE") {
        let cert = x509_certificate::X509Certificate::from_pem(pem_text.as_bytes())
            .map_err(|e| OcmError::CertificateInvalid(e.to_string()))?;
        return RsaPublicKey::from_pkcs1_der(&cert.public_key_data())
            .map_err(|e| OcmError::CertificateInvalid(format!("unsupported public key in certificate: {e}")));
    }
    if pem_text.contains("BEGIN RSA PUBLIC KEY") {
        return RsaPublicKey::from_pkcs1_pem(pem_text).map_err(|e| OcmError::SignatureInvalid(e.to_string()));
    }
    RsaPublicKey::from_public_key_pem(pem_text).map_err(|e| OcmError::SignatureInvalid(e.to_string()))
}

fn read_pem_credential(credentials: &Credentials, inline_key: &str, file_key: &str) -> Result<Option<String>, OcmError> {
    if let Some(pem_text) = credentials.get(inline_key) {
        return Ok(Some(pem_text.to_string()));
    }
    if let Some(path) = credentials.get(file_key) {
        let pem_text = std::fs::read_to_string(path).map_err(|e| OcmError::Transport(Box::new(e)))?;
        return Ok(Some(pem_text));
    }
    Ok(None)
}

fn first_cert_subject(chain_pem: &str) -> Result<Option<String>, OcmError> {
    let certs = x509_certificate::X509Certificate::from_pem_multiple(chain_pem.as_bytes())
        .map_err(|e| OcmError::CertificateInvalid(e.to_string()))?;
    Ok(certs.first().and_then(|cert| cert.subject_common_name()).map(|cn| format!("CN={cn}")))
}

fn system_roots() -> Vec<x509_certificate::X509Certificate> {
    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        tracing::warn!(%err, "failed to load a native root certificate");
    }
    result
        .certs
        .into_iter()
        .filter_map(|der| x509_certificate::X509Certificate::from_der(der.as_ref()).ok())
        .collect()
}

/// Walk the leaf and its intermediates (`chain[1:]`, spec §4.7) verifying each link
/// was signed by the next, require the final certificate be signed by one of
/// `roots` (spec §4.7 scenario 7), and check the leaf carries `ExtKeyUsage =
/// CodeSigning` (when the extension is present) and that every certificate in the
/// chain is valid at `now` (spec §4.7, §5: the clock is handler-owned so tests can
/// fix it rather than depending on the system clock).
fn validate_chain(
    chain: &[x509_certificate::X509Certificate],
    roots: &[x509_certificate::X509Certificate],
    now: DateTime<Utc>,
) -> Result<(), OcmError> {
    let leaf = &chain[0];
    let intermediates = &chain[1..];

    check_code_signing_eku(leaf)?;
    for cert in chain {
        check_validity(cert, now)?;
    }

    for window in chain.windows(2) {
        let (cert, issuer) = (&window[0], &window[1]);
        cert.verify_signed_by_certificate(issuer)
            .map_err(|e| OcmError::CertificateInvalid(format!("chain link invalid: {e}")))?;
    }
    let last = intermediates.last().unwrap_or(leaf);
    for root in roots {
        if last.verify_signed_by_certificate(root).is_ok() {
            return Ok(());
        }
    }
    Err(OcmError::CertificateInvalid("signed by unknown authority".into()))
}

/// OID `2.5.29.37` (`id-ce-extKeyUsage`), DER-encoded.
const EXT_KEY_USAGE_OID_DER: &[u8] = &[0x55, 0x1d, 0x25];
/// OID `1.3.6.1.5.5.7.3.3` (`id-kp-codeSigning`), DER-encoded.
const CODE_SIGNING_OID_DER: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x03, 0x03];

/// Require `cert`'s Extended Key Usage extension (when present) include
/// `codeSigning` (spec §4.7). Certificates that omit the extension entirely are
/// accepted, matching RFC 5280's "absent means unrestricted" semantics; the
/// extension's value is scanned as a raw DER byte sequence for the code-signing
/// OID rather than decoded, consistent with the rest of this module's hand-rolled
/// low-level parsing.
fn check_code_signing_eku(cert: &x509_certificate::X509Certificate) -> Result<(), OcmError> {
    let tbs = &cert.as_ref().tbs_certificate;
    let Some(extensions) = tbs.extensions.as_ref() else { return Ok(()) };

    for extension in extensions.iter() {
        let oid: &[u8] = extension.id.as_ref();
        if oid != EXT_KEY_USAGE_OID_DER {
            continue;
        }
        let value: &[u8] = extension.value.as_ref();
        if !contains_subsequence(value, CODE_SIGNING_OID_DER) {
            return Err(OcmError::CertificateInvalid(
                "leaf certificate's ExtKeyUsage does not include codeSigning".into(),
            ));
        }
        return Ok(());
    }
    Ok(())
}

/// Require `now` fall within `cert`'s `notBefore`/`notAfter` validity period (spec §4.7).
fn check_validity(cert: &x509_certificate::X509Certificate, now: DateTime<Utc>) -> Result<(), OcmError> {
    let validity = &cert.as_ref().tbs_certificate.validity;
    let not_before: DateTime<Utc> = validity.not_before.clone().into();
    let not_after: DateTime<Utc> = validity.not_after.clone().into();

    if now < not_before {
        return Err(OcmError::CertificateInvalid(format!("certificate not yet valid (not before {not_before})")));
    }
    if now > not_after {
        return Err(OcmError::CertificateInvalid(format!("certificate expired (not after {not_after})")));
    }
    Ok(())
}

fn contains_subsequence(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}

struct ParsedSignaturePem {
    raw_signature: Vec<u8>,
    chain: Vec<x509_certificate::X509Certificate>,
}

fn parse_signature_pem(bundle: &str) -> Result<ParsedSignaturePem, OcmError> {
    let (block, rest) = find_pem_block(bundle, "SIGNATURE")?;
    if !block.headers.contains_key("Algorithm") {
        return Err(OcmError::UnsupportedMediaType("signature PEM missing Algorithm header".into()));
    }
    let raw_signature = base64_decode(&block.body)?;
    let chain = x509_certificate::X509Certificate::from_pem_multiple(rest.as_bytes())
        .map_err(|e| OcmError::CertificateInvalid(e.to_string()))?;
    Ok(ParsedSignaturePem { raw_signature, chain })
}

fn encode_signature_pem(algorithm: SigningAlgorithm, raw_signature: &[u8], chain_pem: &str) -> String {
    let mut bundle = encode_pem_block("SIGNATURE", &[("Algorithm", algorithm.wire_name())], raw_signature);
    if !chain_pem.ends_with('\n') {
        bundle.push('\n');
    }
    bundle.push_str(chain_pem);
    bundle
}

struct PemBlock {
    headers: BTreeMap<String, String>,
    body: String,
}

/// Find the first `-----BEGIN <tag>-----` ... `-----END <tag>-----` block in `text`,
/// returning it alongside the remainder of `text` following the closing marker.
fn find_pem_block<'a>(text: &'a str, tag: &str) -> Result<(PemBlock, &'a str), OcmError> {
    let begin_marker = format!("-----BEGIN {tag}-----");
    let end_marker = format!("-----END {tag}-----");
    let start = text
        .find(&begin_marker)
        .ok_or_else(|| OcmError::UnsupportedMediaType(format!("missing {tag} PEM block")))?;
    let after_begin = start + begin_marker.len();
    let end_offset = text[after_begin..]
        .find(&end_marker)
        .ok_or_else(|| OcmError::UnsupportedMediaType(format!("unterminated {tag} PEM block")))?;
    let end = after_begin + end_offset;
    let body_region = &text[after_begin..end];

    let mut headers = BTreeMap::new();
    let mut body_lines = Vec::new();
    let mut in_headers = true;
    for line in body_region.lines() {
        let line = line.trim();
        if line.is_empty() {
            in_headers = false;
            continue;
        }
        if in_headers {
            if let Some((key, value)) = line.split_once(':') {
                headers.insert(key.trim().to_string(), value.trim().to_string());
                continue;
            }
        }
        body_lines.push(line);
    }

    let rest = &text[end + end_marker.len()..];
    Ok((PemBlock { headers, body: body_lines.concat() }, rest))
}

fn encode_pem_block(tag: &str, headers: &[(&str, &str)], contents: &[u8]) -> String {
    use base64::Engine;
    use std::fmt::Write;

    const LINE_WIDTH: usize = 64;
    let mut out = String::new();
    let _ = writeln!(out, "-----BEGIN {tag}-----");
    for (key, value) in headers {
        let _ = writeln!(out, "{key}: {value}");
    }
    if !headers.is_empty() {
        out.push('\n');
    }
    let encoded = base64::engine::general_purpose::STANDARD.encode(contents);
    for chunk in encoded.as_bytes().chunks(LINE_WIDTH) {
        let _ = writeln!(out, "{}", std::str::from_utf8(chunk).expect("base64 alphabet is ascii"));
    }
    let _ = writeln!(out, "-----END {tag}-----");
    out
}

fn base64_decode(body: &str) -> Result<Vec<u8>, OcmError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| OcmError::UnsupportedMediaType(format!("invalid base64 in PEM body: {e}")))
}

/// A signer or certificate Distinguished Name, parsed from the `/`, `;`, `,`, `+`-
/// separated form used by `Issuer` fields (spec §9). A bare token without `=` is
/// interpreted as a `CN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinguishedName {
    attributes: Vec<(String, String)>,
}

const DN_KEYS: &[&str] = &["CN", "C", "O", "OU", "L", "ST", "STREET", "POSTALCODE", "SN"];

impl DistinguishedName {
    /// Parse a DN string. Attributes under a key outside the recognised set (spec §9)
    /// are dropped rather than kept under an arbitrary key.
    pub fn parse(s: &str) -> Self {
        let attributes = s
            .split(|c| matches!(c, '/' | ';' | ',' | '+'))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .filter_map(|token| match token.split_once('=') {
                Some((key, value)) => {
                    let key = normalise_dn_key(key.trim())?;
                    Some((key, value.trim().to_string()))
                }
                None => Some(("CN".to_string(), token.to_string())),
            })
            .collect();
        Self { attributes }
    }

    /// All values recorded under `key` (case-sensitive, already-normalised key name).
    pub fn values(&self, key: &str) -> Vec<&str> {
        self.attributes.iter().filter(|(k, _)| k == key).map(|(_, v)| v.as_str()).collect()
    }
}

fn normalise_dn_key(key: &str) -> Option<String> {
    let upper = key.to_ascii_uppercase();
    DN_KEYS.contains(&upper.as_str()).then_some(upper)
}

/// Require every non-empty field of `issuer` (a DN string) be present in
/// `underlying_subject` (another DN string, typically derived from a certificate's
/// subject), CommonName by equality and other attributes by pattern-subset (spec §4.7).
pub fn check_issuer_constraint(issuer: &str, underlying_subject: &str) -> Result<(), OcmError> {
    let pattern = DistinguishedName::parse(issuer);
    let actual = DistinguishedName::parse(underlying_subject);

    for (key, value) in &pattern.attributes {
        if value.is_empty() {
            continue;
        }
        let actual_values = actual.values(key);
        let matched = if key == "CN" {
            actual_values.iter().any(|v| v.eq_ignore_ascii_case(value))
        } else {
            actual_values.contains(&value.as_str())
        };
        if !matched {
            return Err(OcmError::IssuerMismatch(format!(
                "issuer attribute {key}='{value}' not present in certificate subject"
            )));
        }
    }
    Ok(())
}
