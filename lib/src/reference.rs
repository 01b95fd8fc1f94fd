//! Parses textual component references into typed [`ComponentReference`] values.
//!
//! Grammar: `[type::]<repo>/[component-descriptors]/<component>[:<version>][@<algo>:<hex>]`.
//! See spec §4.1 for the full left-to-right grammar this implements.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::ParseError;
use crate::repository_spec::{CtfArchiveSpec, OciRegistrySpec, RepositorySpec};

/// A digest pinned onto a [`ComponentReference`], in `<algo>:<hex>` form.
///
/// Unlike [`crate::digest::Digest`] this carries no normalisation algorithm: it is a raw
/// content pin, the same shape used by OCI image references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedDigest {
    /// The hash algorithm tag as written (not canonicalised).
    pub algorithm: String,
    /// Lowercase hex digest value.
    pub hex: String,
}

impl fmt::Display for PinnedDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

fn digest_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*):([0-9A-Fa-f]{32,})$")
            .expect("static regex")
    })
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^v?\d+(\.\d+){0,2}(-[0-9A-Za-z.-]+)?(\+[0-9A-Za-z.-]+)?$").expect("static regex")
    })
}

fn domain_label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").expect("static regex"))
}

fn component_segment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9._-]*[a-z0-9])?$").expect("static regex"))
}

impl PinnedDigest {
    /// Parse a `<algo>:<hex>` string, validating it against the digest grammar.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let caps = digest_regex()
            .captures(s)
            .ok_or_else(|| ParseError::InvalidDigest(s.to_string()))?;
        Ok(PinnedDigest {
            algorithm: caps[1].to_string(),
            hex: caps[2].to_ascii_lowercase(),
        })
    }
}

/// Validate a component name against the dotted-domain/slash-segments grammar:
/// a domain (two-or-more dot-separated lowercase labels) followed by one or more
/// slash-separated lowercase segments.
pub fn validate_component_name(name: &str) -> Result<(), ParseError> {
    let mut segments = name.split('/');
    let domain = segments.next().unwrap_or_default();
    let domain_labels: Vec<&str> = domain.split('.').collect();
    if domain_labels.len() < 2 || domain_labels.iter().any(|l| !domain_label_regex().is_match(l)) {
        return Err(ParseError::InvalidComponent(name.to_string()));
    }

    let rest: Vec<&str> = segments.collect();
    if rest.is_empty() {
        return Err(ParseError::InvalidComponent(name.to_string()));
    }
    for segment in rest {
        if segment.is_empty() || !component_segment_regex().is_match(segment) {
            return Err(ParseError::InvalidComponent(name.to_string()));
        }
    }
    Ok(())
}

/// A fully parsed component reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentReference {
    /// The repository type tag, explicit or inferred.
    pub repository_type: String,
    /// The resolved backend specification.
    pub repository: RepositorySpec,
    /// The component-descriptor prefix: `"component-descriptors"` or `""`.
    pub prefix: String,
    /// The dotted/slashed component name.
    pub component: String,
    /// The advisory version, if present.
    pub version: Option<String>,
    /// The pinned content digest, if present. When set, unambiguously identifies content;
    /// `version` is then advisory only.
    pub digest: Option<PinnedDigest>,
}

impl fmt::Display for ComponentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.repository_type, self.repository.label())?;
        if !self.prefix.is_empty() {
            write!(f, "/{}", self.prefix)?;
        } else {
            write!(f, "/")?;
        }
        write!(f, "/{}", self.component)?;
        if let Some(version) = &self.version {
            write!(f, ":{version}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

const PREFIX_COMPONENT_DESCRIPTORS: &str = "component-descriptors";

/// Expand a leading `<alias>//<rest>` into `rest`, recording that `alias` was resolved via
/// the supplied alias table. Returns the input unchanged if it does not start with a
/// registered alias.
pub fn expand_alias<'a>(text: &'a str, aliases: &HashMap<String, RepositorySpec>) -> Option<(&'static str, RepositorySpec, &'a str)> {
    let (head, rest) = text.split_once("//")?;
    aliases.get(head).map(|spec| {
        let leaked: &'static str = Box::leak(head.to_string().into_boxed_str());
        (leaked, spec.clone(), rest)
    })
}

/// Parse a textual component reference.
pub fn parse(text: &str) -> Result<ComponentReference, ParseError> {
    // Step 1: optional `<type>::` head.
    let (repository_type, rest) = match text.split_once("::") {
        Some((ty, rest)) => (Some(ty.to_string()), rest),
        None => (None, text),
    };

    // Step 2: optional trailing `@<digest>`.
    let (rest, digest) = match rest.rsplit_once('@') {
        Some((head, tail)) => match PinnedDigest::parse(tail) {
            Ok(digest) => (head, Some(digest)),
            Err(_) => (rest, None),
        },
        None => (rest, None),
    };

    // Step 3: optional trailing `:<version>`, where the tail must not contain '/'.
    let (rest, version) = match rest.rsplit_once(':') {
        Some((head, tail)) if !tail.contains('/') && version_regex().is_match(tail) => {
            (head, Some(tail.to_string()))
        }
        _ => (rest, None),
    };

    // Step 4: find the leftmost prefix token, skipping a leading URL scheme (if any) so that
    // the `//` in `scheme://host` is never mistaken for an empty-prefix separator.
    let scheme_len = scheme_prefix_len(rest);
    let search_space = &rest[scheme_len..];

    let (repo_head, prefix, component_tail) = if let Some(idx) = search_space.find("/component-descriptors/") {
        let split = scheme_len + idx;
        (
            &rest[..split],
            PREFIX_COMPONENT_DESCRIPTORS.to_string(),
            &rest[split + "/component-descriptors/".len()..],
        )
    } else if let Some(idx) = search_space.find("//") {
        let split = scheme_len + idx;
        (&rest[..split], String::new(), &rest[split + 2..])
    } else {
        // No explicit prefix token: the first path segment is the repository host/path root,
        // everything after the first '/' is the component.
        match rest.split_once('/') {
            Some((head, tail)) => (head, PREFIX_COMPONENT_DESCRIPTORS.to_string(), tail),
            None => return Err(ParseError::MissingComponent(text.to_string())),
        }
    };

    if component_tail.is_empty() {
        return Err(ParseError::MissingComponent(text.to_string()));
    }

    // Step 5: validate the component name grammar.
    validate_component_name(component_tail)?;

    // Type inference, when no explicit `<type>::` head was given.
    let inferred_kind = repository_type
        .as_deref()
        .map(InferredKind::from_tag)
        .unwrap_or_else(|| infer_kind(repo_head));

    let repository = match inferred_kind {
        InferredKind::Oci => RepositorySpec::OciRegistry(split_oci(repo_head)),
        InferredKind::Ctf => RepositorySpec::CtfArchive(CtfArchiveSpec {
            file_path: normalise_path(repo_head),
            access_mode: crate::repository_spec::AccessMode::READ,
        }),
        InferredKind::Unknown(tag) => return Err(ParseError::UnknownType(tag)),
    };

    let repository_type = repository_type.unwrap_or_else(|| match &repository {
        RepositorySpec::OciRegistry(_) => "OCIRegistry".to_string(),
        RepositorySpec::CtfArchive(_) => "CommonTransportFormat".to_string(),
        RepositorySpec::Raw { type_tag, .. } => type_tag.clone(),
    });

    Ok(ComponentReference {
        repository_type,
        repository,
        prefix,
        component: component_tail.to_string(),
        version,
        digest,
    })
}

enum InferredKind {
    Oci,
    Ctf,
    Unknown(String),
}

impl InferredKind {
    fn from_tag(tag: &str) -> Self {
        match tag {
            "OCIRegistry" | "OCIRegistry/v1" => InferredKind::Oci,
            "CommonTransportFormat" | "CommonTransportFormat/v1" | "CTF" => InferredKind::Ctf,
            other => InferredKind::Unknown(other.to_string()),
        }
    }
}

/// Length of a leading `scheme://` prefix, or 0 if there isn't one.
fn scheme_prefix_len(s: &str) -> usize {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*://").expect("static regex"));
    re.find(s).map(|m| m.end()).unwrap_or(0)
}

fn infer_kind(head: &str) -> InferredKind {
    // Windows drive-letter absolute path, e.g. `C:\tmp\ctf` or `C:/tmp/ctf`.
    static WINDOWS_DRIVE: OnceLock<Regex> = OnceLock::new();
    let windows_drive = WINDOWS_DRIVE.get_or_init(|| Regex::new(r"^[A-Za-z]:[\\/]").expect("static regex"));
    if windows_drive.is_match(head) {
        return InferredKind::Ctf;
    }

    if let Some(rest) = head.strip_prefix("file://") {
        let _ = rest;
        return InferredKind::Ctf;
    }
    if scheme_prefix_len(head) > 0 {
        return InferredKind::Oci;
    }

    if head.starts_with('/') {
        return InferredKind::Ctf;
    }

    let first_segment = head.split('/').next().unwrap_or(head);
    if first_segment.contains(':') || first_segment == "localhost" {
        return InferredKind::Oci;
    }

    let lower = head.to_ascii_lowercase();
    if lower.ends_with(".tar") || lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        return InferredKind::Ctf;
    }

    let looks_like_domain = first_segment.contains('.') && first_segment.chars().any(|c| c.is_ascii_alphabetic());
    if looks_like_domain {
        return InferredKind::Oci;
    }

    InferredKind::Ctf
}

fn normalise_path(head: &str) -> String {
    head.replace('\\', "/")
}

fn split_oci(head: &str) -> OciRegistrySpec {
    let scheme_len = scheme_prefix_len(head);
    let (scheme, rest) = if scheme_len > 0 {
        (Some(&head[..scheme_len - 3]), &head[scheme_len..])
    } else {
        (None, head)
    };

    let (host, path) = match rest.split_once('/') {
        Some((host, path)) => (host, path),
        None => (rest, ""),
    };

    let base_url = match scheme {
        Some(scheme) => format!("{scheme}://{host}"),
        None => host.to_string(),
    };

    OciRegistrySpec {
        base_url,
        sub_path: path.trim_start_matches('/').to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository_spec::AccessMode;
    use simple_test_case::test_case;

    #[test_case(
        "ghcr.io/org/repo//ocm.software/cli:1.0.0",
        RepositorySpec::OciRegistry(OciRegistrySpec { base_url: "ghcr.io".into(), sub_path: "org/repo".into() }),
        "",
        "ocm.software/cli",
        Some("1.0.0")
        ; "double slash empty prefix"
    )]
    #[test_case(
        "ghcr.io/org/repo/component-descriptors/ocm.software/cli:1.0.0",
        RepositorySpec::OciRegistry(OciRegistrySpec { base_url: "ghcr.io".into(), sub_path: "org/repo".into() }),
        "component-descriptors",
        "ocm.software/cli",
        Some("1.0.0")
        ; "explicit component-descriptors prefix"
    )]
    #[test_case(
        "ghcr.io/ocm.software/cli",
        RepositorySpec::OciRegistry(OciRegistrySpec { base_url: "ghcr.io".into(), sub_path: String::new() }),
        "component-descriptors",
        "ocm.software/cli",
        None
        ; "implicit prefix, no version"
    )]
    #[test]
    fn parses_oci_references(
        input: &str,
        expected_repo: RepositorySpec,
        expected_prefix: &str,
        expected_component: &str,
        expected_version: Option<&str>,
    ) {
        let parsed = parse(input).expect("parse");
        assert_eq!(parsed.repository, expected_repo);
        assert_eq!(parsed.prefix, expected_prefix);
        assert_eq!(parsed.component, expected_component);
        assert_eq!(parsed.version.as_deref(), expected_version);
    }

    #[test]
    fn parses_digest_pinned_reference() {
        let parsed = parse(
            "ghcr.io/ocm.software/cli@sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        )
        .expect("parse");
        assert_eq!(parsed.digest.as_ref().unwrap().algorithm, "sha256");
        assert_eq!(parsed.digest.unwrap().hex.len(), 64);
    }

    #[test]
    fn parses_ctf_archive_with_explicit_type() {
        let parsed = parse("CommonTransportFormat::./archive/component-descriptors/ocm.software/cli:0.1.0")
            .expect("parse");
        assert_eq!(
            parsed.repository,
            RepositorySpec::CtfArchive(CtfArchiveSpec {
                file_path: "./archive".into(),
                access_mode: AccessMode::READ,
            })
        );
        assert_eq!(parsed.component, "ocm.software/cli");
        assert_eq!(parsed.version.as_deref(), Some("0.1.0"));
    }

    #[test]
    fn rejects_invalid_component_name() {
        let err = parse("ghcr.io/org/repo//justaname:1.0.0").unwrap_err();
        assert!(matches!(err, ParseError::InvalidComponent(_)));
    }

    #[test]
    fn rejects_unknown_type() {
        let err = parse("FooBar::host/component-descriptors/ocm.software/cli").unwrap_err();
        assert!(matches!(err, ParseError::UnknownType(_)));
    }

    #[test]
    fn rejects_missing_component() {
        let err = parse("ghcr.io").unwrap_err();
        assert!(matches!(err, ParseError::MissingComponent(_)));
    }

    #[test]
    fn display_round_trips_inferred_type() {
        let parsed = parse("ghcr.io/org/repo//ocm.software/cli:1.0.0").expect("parse");
        let rendered = parsed.to_string();
        let reparsed = parse(&rendered).expect("reparse");
        assert_eq!(reparsed.component, parsed.component);
        assert_eq!(reparsed.repository, parsed.repository);
    }

    use proptest::prelude::*;
    use proptest::proptest;

    fn domain_strategy() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9]{1,8}\\.[a-z]{2,4}"
    }

    fn component_strategy() -> impl Strategy<Value = String> {
        (domain_strategy(), "[a-z][a-z0-9-]{0,8}")
            .prop_map(|(domain, segment)| format!("{domain}/{segment}"))
    }

    fn version_strategy() -> impl Strategy<Value = String> {
        (1u32..99, 0u32..99, 0u32..99).prop_map(|(a, b, c)| format!("{a}.{b}.{c}"))
    }

    proptest! {
        // parse(format(r)) == r, modulo the repository_type/prefix fields inference fills in.
        #[test]
        fn parse_format_round_trips(
            host in domain_strategy(),
            sub_path in "[a-z][a-z0-9-]{0,8}",
            component in component_strategy(),
            version in version_strategy(),
        ) {
            let text = format!("{host}/{sub_path}//{component}:{version}");
            let parsed = parse(&text).expect("parse");
            let rendered = parsed.to_string();
            let reparsed = parse(&rendered).expect("reparse rendered reference");
            prop_assert_eq!(reparsed, parsed);
        }
    }
}
