use crate::models::annotations;
use semver::Version;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error};

const GLOB_PREFIX: &str = "glob:";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Invalid glob pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("Invalid semver version '{version}': {source}")]
    InvalidVersion {
        version: String,
        #[source]
        source: semver::Error,
    },
}

/// Options attached to a policy name by the owning resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyOptions {
    pub match_tag: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemverPolicyType {
    /// Any newer version
    All,
    /// Any newer version, major bumps included
    Major,
    /// Newer version within the same major
    Minor,
    /// Newer version within the same major.minor
    Patch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyType {
    SemverAll,
    SemverMajor,
    SemverMinor,
    SemverPatch,
    Glob,
    Force,
    None,
}

#[derive(Debug, Clone)]
pub struct GlobPolicy {
    policy: String,
    pattern: glob::Pattern,
}

impl GlobPolicy {
    /// Builds a glob policy from `glob:<pattern>`.
    pub fn new(policy: &str) -> Result<Self, PolicyError> {
        let raw = policy.strip_prefix(GLOB_PREFIX).unwrap_or(policy).trim();
        if raw.is_empty() {
            return Err(PolicyError::InvalidPolicy(policy.to_string()));
        }

        let pattern = glob::Pattern::new(raw).map_err(|source| PolicyError::InvalidPattern {
            pattern: raw.to_string(),
            source,
        })?;

        Ok(Self {
            policy: format!("{}{}", GLOB_PREFIX, raw),
            pattern,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

impl PartialEq for GlobPolicy {
    fn eq(&self, other: &Self) -> bool {
        self.policy == other.policy
    }
}

impl Eq for GlobPolicy {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Policy {
    Semver(SemverPolicyType),
    Glob(GlobPolicy),
    Force { match_tag: bool },
    #[default]
    None,
}

impl Policy {
    /// Resolves a configured policy name.
    ///
    /// Unknown names resolve to [`Policy::None`]; a malformed glob pattern is
    /// reported to the caller.
    pub fn from_name(name: &str, options: PolicyOptions) -> Result<Self, PolicyError> {
        let normalized = name.trim();
        if normalized.to_lowercase().starts_with(GLOB_PREFIX) {
            return GlobPolicy::new(&normalized[GLOB_PREFIX.len()..]).map(Policy::Glob);
        }

        let policy = match normalized.to_lowercase().as_str() {
            "all" => Policy::Semver(SemverPolicyType::All),
            "major" => Policy::Semver(SemverPolicyType::Major),
            "minor" => Policy::Semver(SemverPolicyType::Minor),
            "patch" => Policy::Semver(SemverPolicyType::Patch),
            "force" => Policy::Force {
                match_tag: options.match_tag,
            },
            "" | "none" | "never" => Policy::None,
            other => {
                debug!("Unknown policy '{}', treating as none", other);
                Policy::None
            },
        };

        Ok(policy)
    }

    /// Strict variant of [`Policy::from_name`] that rejects unknown names.
    pub fn parse(name: &str, options: PolicyOptions) -> Result<Self, PolicyError> {
        let policy = Self::from_name(name, options)?;
        let lowered = name.trim().to_lowercase();
        if policy == Policy::None && !matches!(lowered.as_str(), "" | "none" | "never") {
            return Err(PolicyError::InvalidPolicy(name.to_string()));
        }
        Ok(policy)
    }

    pub fn should_update(&self, current: &str, new: &str) -> Result<bool, PolicyError> {
        match self {
            Policy::None => Ok(false),
            Policy::Force { match_tag } => Ok(!match_tag || current == new),
            Policy::Glob(glob) => Ok(glob.pattern.matches(new)),
            Policy::Semver(kind) => {
                let current_version = parse_version(current)?;
                let new_version = parse_version(new)?;

                if new_version <= current_version {
                    return Ok(false);
                }

                Ok(match kind {
                    SemverPolicyType::All | SemverPolicyType::Major => true,
                    SemverPolicyType::Minor => new_version.major == current_version.major,
                    SemverPolicyType::Patch => {
                        new_version.major == current_version.major
                            && new_version.minor == current_version.minor
                    },
                })
            },
        }
    }

    pub fn name(&self) -> String {
        match self {
            Policy::Semver(SemverPolicyType::All) => "all".to_string(),
            Policy::Semver(SemverPolicyType::Major) => "major".to_string(),
            Policy::Semver(SemverPolicyType::Minor) => "minor".to_string(),
            Policy::Semver(SemverPolicyType::Patch) => "patch".to_string(),
            Policy::Glob(glob) => glob.policy.clone(),
            Policy::Force { .. } => "force".to_string(),
            Policy::None => "none".to_string(),
        }
    }

    pub fn kind(&self) -> PolicyType {
        match self {
            Policy::Semver(SemverPolicyType::All) => PolicyType::SemverAll,
            Policy::Semver(SemverPolicyType::Major) => PolicyType::SemverMajor,
            Policy::Semver(SemverPolicyType::Minor) => PolicyType::SemverMinor,
            Policy::Semver(SemverPolicyType::Patch) => PolicyType::SemverPatch,
            Policy::Glob(_) => PolicyType::Glob,
            Policy::Force { .. } => PolicyType::Force,
            Policy::None => PolicyType::None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Policy::None)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Lenient resolver for policies read from cluster metadata. Malformed
/// policies are logged and resolve to [`Policy::None`].
pub fn get_policy(name: &str, options: PolicyOptions) -> Policy {
    match Policy::from_name(name, options) {
        Ok(policy) => policy,
        Err(e) => {
            error!("Failed to resolve policy '{}': {}", name, e);
            Policy::None
        },
    }
}

/// Resolves a resource's policy: annotation, then label, then the legacy label.
pub fn get_policy_from_labels_or_annotations(
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> Policy {
    let options = PolicyOptions {
        match_tag: lookup(labels, annotations, annotations::MATCH_TAG)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    };

    let name = annotations
        .get(annotations::POLICY)
        .or_else(|| labels.get(annotations::POLICY))
        .or_else(|| labels.get(annotations::LEGACY_POLICY));

    match name {
        Some(name) => get_policy(name, options),
        None => Policy::None,
    }
}

/// Looks a key up in annotations first, then labels.
pub fn lookup<'a>(
    labels: &'a BTreeMap<String, String>,
    annotations: &'a BTreeMap<String, String>,
    key: &str,
) -> Option<&'a str> {
    annotations
        .get(key)
        .or_else(|| labels.get(key))
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
}

/// Parses a tag as semver, tolerating a `v` prefix and missing minor/patch parts.
pub fn parse_version(version: &str) -> Result<Version, PolicyError> {
    let clean = version.trim().trim_start_matches('v');

    Version::parse(clean).or_else(|source| {
        coerce_partial(clean).ok_or_else(|| PolicyError::InvalidVersion {
            version: version.to_string(),
            source,
        })
    })
}

fn coerce_partial(version: &str) -> Option<Version> {
    let split = version.find(['-', '+']).unwrap_or(version.len());
    let (core, rest) = version.split_at(split);
    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() >= 3 || parts.iter().any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
        return None;
    }

    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(rest);
    Version::parse(&padded).ok()
}
