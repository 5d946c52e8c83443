//! Docker-style image reference parsing.
//!
//! Accepts `[registry/]repository[:tag][@digest]`. A first path segment is
//! treated as a registry host only when it contains a `.` or `:` or is
//! `localhost`, the same rule the docker CLI uses.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Hostname used when an image does not name a registry.
pub const DEFAULT_REGISTRY_HOSTNAME: &str = "index.docker.io";

/// Full address of the default registry.
pub const DEFAULT_DOCKER_REGISTRY: &str = "https://index.docker.io";

pub const DEFAULT_TAG: &str = "latest";

const DOCKER_HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];
const OFFICIAL_NAMESPACE: &str = "library/";
const MAX_TAG_LENGTH: usize = 128;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid reference format: {0}")]
    InvalidReference(String),

    #[error("invalid tag '{tag}' in reference {reference}")]
    InvalidTag { reference: String, tag: String },

    #[error("invalid digest in reference {0}")]
    InvalidDigest(String),
}

/// A parsed image reference. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    registry: String,
    path: String,
    tag: Option<String>,
    digest: Option<String>,
}

pub fn parse(raw: &str) -> Result<Reference, ParseError> {
    Reference::parse(raw)
}

impl Reference {
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ParseError::InvalidReference(raw.to_string()));
        }

        let (name_and_tag, digest) = match raw.split_once('@') {
            Some((name, digest)) => {
                if !is_valid_digest(digest) {
                    return Err(ParseError::InvalidDigest(raw.to_string()));
                }
                (name, Some(digest.to_string()))
            },
            None => (raw, None),
        };

        // A colon followed by a slash belongs to a registry port, not a tag.
        let (name, tag) = match name_and_tag.rfind(':') {
            Some(idx) if !name_and_tag[idx + 1..].contains('/') => {
                let tag = &name_and_tag[idx + 1..];
                if !is_valid_tag(tag) {
                    return Err(ParseError::InvalidTag {
                        reference: raw.to_string(),
                        tag: tag.to_string(),
                    });
                }
                (&name_and_tag[..idx], Some(tag.to_string()))
            },
            _ => (name_and_tag, None),
        };

        let (registry, path) = match name.split_once('/') {
            Some((first, rest)) if looks_like_registry(first) => (first, rest),
            _ => (DEFAULT_REGISTRY_HOSTNAME, name),
        };

        if path.is_empty() || !path.split('/').all(is_valid_component) {
            return Err(ParseError::InvalidReference(raw.to_string()));
        }

        let registry = normalize_registry(registry);
        let path = match path.strip_prefix(OFFICIAL_NAMESPACE) {
            Some(rest) if registry == DEFAULT_REGISTRY_HOSTNAME && !rest.contains('/') => rest,
            _ => path,
        };

        Ok(Self {
            registry,
            path: path.to_string(),
            tag,
            digest,
        })
    }

    /// Registry hostname, `index.docker.io` when none was given.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn is_default_registry(&self) -> bool {
        self.registry == DEFAULT_REGISTRY_HOSTNAME
    }

    /// Scheme used to reach the registry. Plain http only for local registries.
    pub fn scheme(&self) -> &'static str {
        let host = self.registry.split(':').next().unwrap_or_default();
        if host == "localhost" || host == "127.0.0.1" {
            "http"
        } else {
            "https"
        }
    }

    /// Tag-stripped repository path without any registry prefix.
    pub fn short_name(&self) -> &str {
        &self.path
    }

    /// Tag-stripped repository including a non-default registry prefix.
    pub fn repository(&self) -> String {
        if self.is_default_registry() {
            self.path.clone()
        } else {
            format!("{}/{}", self.registry, self.path)
        }
    }

    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// Whether the raw reference spelled a tag out.
    pub fn has_tag(&self) -> bool {
        self.tag.is_some()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// `short_name:tag`.
    pub fn name(&self) -> String {
        format!("{}:{}", self.path, self.tag())
    }

    /// `repository:tag`.
    pub fn remote(&self) -> String {
        format!("{}:{}", self.repository(), self.tag())
    }

    /// Image string for this repository at `tag`, spelled the way workloads
    /// reference it: no registry prefix for the default registry.
    pub fn with_tag(&self, tag: &str) -> String {
        if self.is_default_registry() {
            format!("{}:{}", self.path, tag)
        } else {
            format!("{}:{}", self.repository(), tag)
        }
    }
}

impl FromStr for Reference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.remote())?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Maps Docker Hub aliases onto the default hostname.
pub fn normalize_registry(registry: &str) -> String {
    let host = registry
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .trim_end_matches("/v1")
        .trim_end_matches("/v2");
    if DOCKER_HUB_ALIASES.contains(&host) {
        DEFAULT_REGISTRY_HOSTNAME.to_string()
    } else {
        host.to_string()
    }
}

fn looks_like_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

fn is_valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes.iter().all(|b| {
                    b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-')
                })
        },
        _ => false,
    }
}

fn is_valid_tag(tag: &str) -> bool {
    let bytes = tag.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= MAX_TAG_LENGTH
        && (bytes[0].is_ascii_alphanumeric() || bytes[0] == b'_')
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

fn is_valid_digest(digest: &str) -> bool {
    match digest.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty()
                && hex.len() >= 32
                && hex.bytes().all(|b| b.is_ascii_hexdigit())
        },
        None => false,
    }
}
