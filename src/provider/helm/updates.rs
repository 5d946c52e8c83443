use super::implementer::Release;
use super::values::{ChartConfig, ChartConfigError, parse_image, plan_values};
use crate::image;
use crate::models::Repository;
use crate::policy::Policy;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info};

/// Value changes for one release. Every impacted image of the release is
/// merged into the same value map.
#[derive(Debug, Clone)]
pub struct HelmUpdatePlan {
    pub release: Release,
    pub config: ChartConfig,
    pub values: BTreeMap<String, String>,
    pub current_version: String,
    pub new_version: String,
    pub release_notes: Vec<String>,
}

impl HelmUpdatePlan {
    pub fn is_noop(&self) -> bool {
        self.current_version == self.new_version
    }

    pub fn target(&self) -> String {
        format!("release/{}/{}", self.release.namespace, self.release.name)
    }
}

impl fmt::Display for HelmUpdatePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {}->{}",
            self.release.namespace, self.release.name, self.current_version, self.new_version
        )
    }
}

/// Builds the plan `repo` implies for `release`, or `None` when the release
/// has no configuration or no image qualifies.
pub fn check_release(repo: &Repository, release: &Release) -> Option<HelmUpdatePlan> {
    let event_ref = match image::parse(&repo.to_string()) {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to parse event repository {}: {}", repo.name, e);
            return None;
        },
    };

    let config = match ChartConfig::from_values(&release.values) {
        Ok(config) => config,
        Err(ChartConfigError::NotFound | ChartConfigError::PolicyNotSpecified) => return None,
        Err(e) => {
            error!(
                "Failed to read configuration of release {}/{}: {}",
                release.namespace, release.name, e
            );
            return None;
        },
    };

    if config.policy.is_none() {
        return None;
    }

    debug!(
        "Policy for release {}/{}: {}",
        release.namespace, release.name, config.policy
    );

    let mut values = BTreeMap::new();
    let mut release_notes = Vec::new();
    let mut matched = Vec::new();

    for details in &config.images {
        let image_ref = match parse_image(&release.values, details) {
            Ok(r) => r,
            Err(e) => {
                error!(
                    "Failed to parse image of release {}/{}: {}",
                    release.namespace, release.name, e
                );
                continue;
            },
        };

        if image_ref.repository() != event_ref.repository() {
            debug!(
                "Images do not match: {} vs {}, ignoring",
                image_ref.remote(),
                repo.name
            );
            continue;
        }

        match config.policy.should_update(image_ref.tag(), event_ref.tag()) {
            Ok(true) => {},
            Ok(false) => {
                info!(
                    "Policy {} ignores {} -> {} for release {}/{}",
                    config.policy,
                    image_ref.tag(),
                    event_ref.tag(),
                    release.namespace,
                    release.name
                );
                continue;
            },
            Err(e) => {
                debug!(
                    "Cannot evaluate policy {} for release {}/{}: {}",
                    config.policy, release.namespace, release.name, e
                );
                continue;
            },
        }

        // Only force re-applies an image that already runs the event tag.
        let retag = image_ref.tag() != event_ref.tag();
        if !retag && !matches!(config.policy, Policy::Force { .. }) {
            debug!(
                "Release {}/{} already runs {}, ignoring",
                release.namespace,
                release.name,
                image_ref.remote()
            );
            continue;
        }
        matched.push((image_ref, details, retag));
    }

    // Once any image moves to a new tag, current ones stay untouched.
    if matched.iter().any(|(_, _, retag)| *retag) {
        matched.retain(|(_, _, retag)| *retag);
    }
    let current_version = matched.first()?.0.tag().to_string();

    for (image_ref, details, _) in &matched {
        if !details.digest.is_empty()
            && let Some(digest) = repo.digest.as_deref().filter(|d| !d.is_empty())
        {
            values.insert(details.digest.clone(), digest.to_string());
        }

        let (path, value) = plan_values(image_ref, details, event_ref.tag());
        values.insert(path, value);
        if !details.release_notes.is_empty() {
            release_notes.push(details.release_notes.clone());
        }
    }

    Some(HelmUpdatePlan {
        release: release.clone(),
        config,
        values,
        current_version,
        new_version: event_ref.tag().to_string(),
        release_notes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(values: &str) -> Release {
        Release {
            name: "release-1".to_string(),
            namespace: "default".to_string(),
            chart: "app-1.0.0".to_string(),
            values: serde_yaml::from_str(values).unwrap(),
        }
    }

    const CHART_VALUES: &str = r#"
image:
  repository: gcr.io/v2-namespace/hello-world
  tag: 1.1.0

bowline:
  policy: all
  trigger: poll
  images:
    - repository: image.repository
      tag: image.tag
"#;

    #[test]
    fn test_check_release() {
        let repo = Repository::new("gcr.io/v2-namespace/hello-world", "1.2.0");
        let plan = check_release(&repo, &release(CHART_VALUES)).unwrap();

        assert_eq!(plan.current_version, "1.1.0");
        assert_eq!(plan.new_version, "1.2.0");
        assert_eq!(
            plan.values,
            BTreeMap::from([("image.tag".to_string(), "1.2.0".to_string())])
        );
        assert_eq!(plan.target(), "release/default/release-1");
    }

    #[test]
    fn test_check_release_without_config() {
        let values = "image:\n  repository: gcr.io/v2-namespace/hello-world\n  tag: 1.1.0\n";
        let repo = Repository::new("gcr.io/v2-namespace/hello-world", "1.2.0");
        assert!(check_release(&repo, &release(values)).is_none());
    }

    #[test]
    fn test_check_release_other_image() {
        let repo = Repository::new("gcr.io/v2-namespace/other", "1.2.0");
        assert!(check_release(&repo, &release(CHART_VALUES)).is_none());
    }

    #[test]
    fn test_check_release_sets_digest() {
        let values = r#"
image:
  repository: karolisr/keel
  tag: latest
  digest: sha256:old
bowline:
  policy: force
  images:
    - repository: image.repository
      tag: image.tag
      digest: image.digest
      releaseNotes: https://github.com/keel-hq/keel/releases
"#;
        let repo = Repository::new("karolisr/keel", "latest").with_digest("sha256:new");
        let plan = check_release(&repo, &release(values)).unwrap();

        assert!(plan.is_noop());
        assert_eq!(plan.values.get("image.digest").unwrap(), "sha256:new");
        assert_eq!(plan.values.get("image.tag").unwrap(), "latest");
        assert_eq!(plan.release_notes.len(), 1);
    }

    #[test]
    fn test_check_release_merges_images() {
        let values = r#"
image:
  repository: gcr.io/v2-namespace/hello-world
  tag: 1.1.0
sidecar:
  image: gcr.io/v2-namespace/hello-world:1.0.0
bowline:
  policy: major
  images:
    - repository: image.repository
      tag: image.tag
    - repository: sidecar.image
"#;
        let repo = Repository::new("gcr.io/v2-namespace/hello-world", "1.2.0");
        let plan = check_release(&repo, &release(values)).unwrap();

        assert_eq!(plan.values.len(), 2);
        assert_eq!(
            plan.values.get("sidecar.image").unwrap(),
            "gcr.io/v2-namespace/hello-world:1.2.0"
        );
        assert_eq!(plan.current_version, "1.1.0");
    }

    const MIXED_VALUES: &str = r#"
image:
  repository: gcr.io/v2-namespace/hello-world
  tag: 1.2.0
sidecar:
  repository: gcr.io/v2-namespace/hello-world
  tag: 1.1.0
bowline:
  policy: force
  images:
    - repository: image.repository
      tag: image.tag
    - repository: sidecar.repository
      tag: sidecar.tag
"#;

    #[test]
    fn test_current_image_does_not_hide_stale_one() {
        let repo = Repository::new("gcr.io/v2-namespace/hello-world", "1.2.0");
        let plan = check_release(&repo, &release(MIXED_VALUES)).unwrap();

        assert!(!plan.is_noop());
        assert_eq!(plan.current_version, "1.1.0");
        assert_eq!(
            plan.values,
            BTreeMap::from([("sidecar.tag".to_string(), "1.2.0".to_string())])
        );
    }

    #[test]
    fn test_stale_image_listed_first() {
        let values = MIXED_VALUES
            .replace("tag: 1.2.0\nsidecar", "tag: 1.1.0\nsidecar")
            .replace("  tag: 1.1.0\nbowline", "  tag: 1.2.0\nbowline")
            .replace("policy: force", "policy: all");
        let repo = Repository::new("gcr.io/v2-namespace/hello-world", "1.2.0");
        let plan = check_release(&repo, &release(&values)).unwrap();

        assert_eq!(plan.current_version, "1.1.0");
        assert_eq!(
            plan.values,
            BTreeMap::from([("image.tag".to_string(), "1.2.0".to_string())])
        );
    }

    #[test]
    fn test_non_semver_tag_is_skipped() {
        let repo = Repository::new("gcr.io/v2-namespace/hello-world", "latest");
        assert!(check_release(&repo, &release(CHART_VALUES)).is_none());
    }
}
