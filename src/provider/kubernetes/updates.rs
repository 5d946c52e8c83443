use crate::image::{self, ParseError};
use crate::k8s::GenericResource;
use crate::models::{Repository, annotations};
use crate::policy::Policy;
use chrono::Utc;
use std::fmt;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageChange {
    pub container: usize,
    pub from: String,
    pub to: String,
}

/// Pending update of one workload. Every matching container of the workload
/// is collected into the same plan.
#[derive(Debug, Clone)]
pub struct UpdatePlan {
    /// The workload with its new images already applied
    pub resource: GenericResource,
    pub current_version: String,
    pub new_version: String,
    pub changes: Vec<ImageChange>,
}

impl UpdatePlan {
    pub fn is_noop(&self) -> bool {
        self.current_version == self.new_version
    }
}

impl fmt::Display for UpdatePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}->{}",
            self.resource.identifier, self.current_version, self.new_version
        )
    }
}

/// Builds the plan `repo` implies for `resource`, or `None` when no container
/// qualifies. Fails only when the event itself cannot be parsed.
pub fn check_for_update(
    policy: &Policy,
    repo: &Repository,
    resource: &GenericResource,
) -> Result<Option<UpdatePlan>, ParseError> {
    let event_ref = image::parse(&repo.to_string())?;

    debug!(
        "Checking {} against {} with policy {}",
        resource, repo, policy
    );

    let mut changes = Vec::new();

    for (idx, container) in resource.containers().iter().enumerate() {
        let Some(raw) = container.image.as_deref() else {
            continue;
        };
        let container_ref = match image::parse(raw) {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to parse image {} of {}: {}", raw, resource, e);
                continue;
            },
        };

        if container_ref.repository() != event_ref.repository() {
            debug!(
                "Images do not match: {} vs {}, ignoring",
                container_ref.remote(),
                repo.name
            );
            continue;
        }

        match policy.should_update(container_ref.tag(), event_ref.tag()) {
            Ok(true) => {},
            Ok(false) => {
                debug!(
                    "Policy {} does not allow {} -> {} for {}",
                    policy,
                    container_ref.tag(),
                    event_ref.tag(),
                    resource
                );
                continue;
            },
            Err(e) => {
                debug!("Cannot evaluate policy {} for {}: {}", policy, resource, e);
                continue;
            },
        }

        // Only force re-applies an image that already runs the event tag.
        let retag = container_ref.tag() != event_ref.tag();
        if !retag && !matches!(policy, Policy::Force { .. }) {
            debug!(
                "{} already runs {}, ignoring",
                resource,
                container_ref.remote()
            );
            continue;
        }

        changes.push((
            container_ref.tag().to_string(),
            retag,
            ImageChange {
                container: idx,
                from: raw.to_string(),
                to: container_ref.with_tag(event_ref.tag()),
            },
        ));
    }

    if changes.is_empty() {
        return Ok(None);
    }

    // Once any container moves to a new tag, current ones stay untouched.
    if changes.iter().any(|(_, retag, _)| *retag) {
        changes.retain(|(_, retag, _)| *retag);
    }
    let current_version = changes[0].0.clone();
    let changes: Vec<ImageChange> = changes.into_iter().map(|(_, _, change)| change).collect();

    let mut updated = resource.clone();
    for change in &changes {
        updated.update_container(change.container, &change.to);
    }
    set_update_time(&mut updated);

    Ok(Some(UpdatePlan {
        resource: updated,
        current_version,
        new_version: event_ref.tag().to_string(),
        changes,
    }))
}

fn set_update_time(resource: &mut GenericResource) {
    let mut spec_annotations = resource.spec_annotations();
    spec_annotations.insert(annotations::UPDATE_TIME.to_string(), Utc::now().to_rfc3339());
    resource.set_spec_annotations(spec_annotations);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SemverPolicyType;

    fn resource(images: &[&str]) -> GenericResource {
        let containers: String = images
            .iter()
            .enumerate()
            .map(|(i, image)| format!("        - name: c{}\n          image: {}\n", i, image))
            .collect();
        let raw = format!(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: wd\n  namespace: xxxx\nspec:\n  selector:\n    matchLabels:\n      app: wd\n  template:\n    metadata:\n      labels:\n        app: wd\n    spec:\n      containers:\n{}",
            containers
        );
        GenericResource::from_yaml(&raw).unwrap().unwrap()
    }

    #[test]
    fn test_default_registry_update() {
        let plan = check_for_update(
            &Policy::Semver(SemverPolicyType::All),
            &Repository::new("karolisr/keel", "1.1.0"),
            &resource(&["karolisr/keel:1.0.0"]),
        )
        .unwrap()
        .unwrap();

        assert_eq!(plan.current_version, "1.0.0");
        assert_eq!(plan.new_version, "1.1.0");
        assert_eq!(plan.resource.images(), vec!["karolisr/keel:1.1.0"]);
        assert!(
            plan.resource
                .spec_annotations()
                .contains_key(annotations::UPDATE_TIME)
        );
    }

    #[test]
    fn test_private_registry_keeps_prefix() {
        let plan = check_for_update(
            &Policy::Semver(SemverPolicyType::All),
            &Repository::new("gcr.io/v2-namespace/hello-world", "1.2.0"),
            &resource(&["gcr.io/v2-namespace/hello-world:1.1.0"]),
        )
        .unwrap()
        .unwrap();

        assert_eq!(
            plan.resource.images(),
            vec!["gcr.io/v2-namespace/hello-world:1.2.0"]
        );
    }

    #[test]
    fn test_only_matching_container_changes() {
        let plan = check_for_update(
            &Policy::Semver(SemverPolicyType::Major),
            &Repository::new("karolisr/keel", "1.1.0"),
            &resource(&["yo/sidecar:1.0.0", "karolisr/keel:1.0.0"]),
        )
        .unwrap()
        .unwrap();

        assert_eq!(
            plan.resource.images(),
            vec!["yo/sidecar:1.0.0", "karolisr/keel:1.1.0"]
        );
        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.changes[0].container, 1);
    }

    #[test]
    fn test_multiple_matching_containers_share_one_plan() {
        let plan = check_for_update(
            &Policy::Semver(SemverPolicyType::All),
            &Repository::new("karolisr/keel", "1.1.0"),
            &resource(&["karolisr/keel:1.0.0", "karolisr/keel:1.0.5"]),
        )
        .unwrap()
        .unwrap();

        assert_eq!(plan.changes.len(), 2);
        assert_eq!(plan.current_version, "1.0.0");
    }

    #[test]
    fn test_current_container_does_not_hide_stale_one() {
        let plan = check_for_update(
            &Policy::Force { match_tag: false },
            &Repository::new("karolisr/keel", "1.1.0"),
            &resource(&["karolisr/keel:1.1.0", "karolisr/keel:1.0.0"]),
        )
        .unwrap()
        .unwrap();

        assert!(!plan.is_noop());
        assert_eq!(plan.current_version, "1.0.0");
        assert_eq!(
            plan.changes,
            vec![ImageChange {
                container: 1,
                from: "karolisr/keel:1.0.0".to_string(),
                to: "karolisr/keel:1.1.0".to_string(),
            }]
        );
        assert_eq!(
            plan.resource.images(),
            vec!["karolisr/keel:1.1.0", "karolisr/keel:1.1.0"]
        );
    }

    #[test]
    fn test_mixed_versions_in_either_order() {
        for images in [
            ["karolisr/keel:1.1.0", "karolisr/keel:1.0.0"],
            ["karolisr/keel:1.0.0", "karolisr/keel:1.1.0"],
        ] {
            let plan = check_for_update(
                &Policy::Semver(SemverPolicyType::All),
                &Repository::new("karolisr/keel", "1.1.0"),
                &resource(&images),
            )
            .unwrap()
            .unwrap();

            assert!(!plan.is_noop());
            assert_eq!(plan.current_version, "1.0.0");
            assert_eq!(plan.changes.len(), 1);
            assert_eq!(plan.changes[0].from, "karolisr/keel:1.0.0");
        }
    }

    #[test]
    fn test_glob_skips_container_already_on_tag() {
        let plan = check_for_update(
            &Policy::from_name("glob:release-*", Default::default()).unwrap(),
            &Repository::new("karolisr/keel", "release-2"),
            &resource(&["karolisr/keel:release-2"]),
        )
        .unwrap();
        assert!(plan.is_none());
    }

    #[test]
    fn test_policy_rejects_update() {
        let plan = check_for_update(
            &Policy::Semver(SemverPolicyType::Patch),
            &Repository::new("karolisr/keel", "1.1.0"),
            &resource(&["karolisr/keel:1.0.0"]),
        )
        .unwrap();
        assert!(plan.is_none());

        let not_semver = check_for_update(
            &Policy::Semver(SemverPolicyType::All),
            &Repository::new("karolisr/keel", "latest"),
            &resource(&["karolisr/keel:1.0.0"]),
        )
        .unwrap();
        assert!(not_semver.is_none());
    }

    #[test]
    fn test_force_same_tag_is_a_noop_plan() {
        let plan = check_for_update(
            &Policy::Force { match_tag: true },
            &Repository::new("karolisr/keel", "latest"),
            &resource(&["karolisr/keel:latest"]),
        )
        .unwrap()
        .unwrap();
        assert!(plan.is_noop());
    }
}
