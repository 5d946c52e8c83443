//! Updates workloads in place through the cluster API.

pub mod updates;

pub use updates::{ImageChange, UpdatePlan, check_for_update};

use super::{ApprovalRequest, EventQueue, Gate, ProviderError, approval_complete, check_approval};
use crate::approval::ApprovalManager;
use crate::image;
use crate::k8s::{GenericResource, GenericResourceCache, Implementer};
use crate::metrics;
use crate::models::{Event, Repository, TrackedImage, TriggerType, annotations};
use crate::notifications::{EventNotification, Level, NotificationType, Sender};
use crate::policy::{get_policy_from_labels_or_annotations, lookup};
use crate::trigger::poll::{DEFAULT_POLL_SCHEDULE, Schedule};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const PROVIDER_NAME: &str = "kubernetes";

pub struct KubernetesProvider {
    queue: EventQueue,
    cache: Arc<dyn GenericResourceCache>,
    implementer: Arc<dyn Implementer>,
    sender: Arc<dyn Sender>,
    approvals: Arc<ApprovalManager>,
}

impl KubernetesProvider {
    pub fn new(
        cache: Arc<dyn GenericResourceCache>,
        implementer: Arc<dyn Implementer>,
        sender: Arc<dyn Sender>,
        approvals: Arc<ApprovalManager>,
    ) -> Self {
        Self {
            queue: EventQueue::new(PROVIDER_NAME),
            cache,
            implementer,
            sender,
            approvals,
        }
    }

    pub fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    pub async fn submit(&self, event: Event) -> Result<(), ProviderError> {
        self.queue.submit(event).await
    }

    pub fn tracked_images(&self) -> Vec<TrackedImage> {
        tracked_images(&self.cache.values(), PROVIDER_NAME)
    }

    pub async fn start(&self) -> Result<(), ProviderError> {
        self.queue
            .run(|event| async move {
                self.process_event(event).await;
            })
            .await
    }

    pub fn stop(&self) {
        self.queue.stop();
    }

    /// Handles one event and returns the workloads that were updated.
    pub async fn process_event(&self, event: Event) -> Vec<GenericResource> {
        let plans = self.create_update_plans(&event.repository);
        if plans.is_empty() {
            debug!(
                "No kubernetes update plans for {}",
                event.repository
            );
            return Vec::new();
        }

        let plans: Vec<UpdatePlan> = plans
            .into_iter()
            .filter(|plan| {
                if plan.is_noop() {
                    debug!("Skipping {}: already at {}", plan.resource, plan.new_version);
                }
                !plan.is_noop()
            })
            .collect();

        let approved = self.check_for_approvals(&event, plans).await;
        self.update_resources(approved).await
    }

    /// One plan per impacted workload, no-op plans included.
    pub fn create_update_plans(&self, repo: &Repository) -> Vec<UpdatePlan> {
        create_update_plans(&self.cache.values(), repo)
    }

    async fn check_for_approvals(
        &self,
        event: &Event,
        plans: Vec<UpdatePlan>,
    ) -> Vec<(UpdatePlan, ApprovalRequest)> {
        let mut approved = Vec::new();
        for plan in plans {
            let request = approval_request(PROVIDER_NAME, &plan);
            match check_approval(&self.approvals, PROVIDER_NAME, event, &request).await {
                Gate::Execute => approved.push((plan, request)),
                Gate::Hold => info!("Update {} is waiting for approval", plan),
                Gate::Skip => debug!("Update {} skipped by approval gate", plan),
            }
        }
        approved
    }

    async fn update_resources(
        &self,
        plans: Vec<(UpdatePlan, ApprovalRequest)>,
    ) -> Vec<GenericResource> {
        let mut updated = Vec::new();

        for (plan, request) in plans {
            let mut resource = plan.resource.clone();
            let mut resource_annotations = resource.annotations();
            let channels = notification_channels(&resource_annotations);
            let images = resource.images().join(", ");

            self.sender.send(
                notification(&resource, NotificationType::PreDeploymentUpdate, Level::Debug)
                    .with_message(format!(
                        "Preparing to update {} {}->{} ({})",
                        resource, plan.current_version, plan.new_version, images
                    ))
                    .with_channels(channels.clone()),
            );

            resource_annotations.insert(
                annotations::CHANGE_CAUSE.to_string(),
                format!(
                    "bowline automated update, version {} -> {} [{}]",
                    plan.current_version,
                    plan.new_version,
                    Utc::now().to_rfc3339()
                ),
            );
            resource.set_annotations(resource_annotations);

            if let Err(e) = self.implementer.update(&resource).await {
                error!("Failed to update {}: {:#}", resource, e);
                metrics::UPDATE_FAILURES
                    .with_label_values(&[PROVIDER_NAME])
                    .inc();
                self.sender.send(
                    notification(&resource, NotificationType::DeploymentUpdate, Level::Error)
                        .with_message(format!(
                            "Failed to update {} {}->{} ({}). Error: {:#}",
                            resource, plan.current_version, plan.new_version, images, e
                        ))
                        .with_channels(channels),
                );
                continue;
            }

            metrics::KUBERNETES_VERSIONED_UPDATES
                .with_label_values(&[&format!("{}/{}", resource.namespace, resource.name)])
                .inc();
            approval_complete(&self.approvals, &request).await;

            let mut message = format!(
                "Successfully updated {} {}->{} ({})",
                resource, plan.current_version, plan.new_version, images
            );
            if let Some(notes) = lookup(&resource.labels(), &resource.annotations(), annotations::RELEASE_NOTES) {
                message.push_str(&format!(". Release notes: {}", notes));
            }
            self.sender.send(
                notification(&resource, NotificationType::DeploymentUpdate, Level::Success)
                    .with_message(message)
                    .with_channels(channels),
            );

            info!(
                "Updated {} {} -> {}",
                resource, plan.current_version, plan.new_version
            );
            updated.push(resource);
        }

        updated
    }
}

/// Plans for every workload in `resources` that `repo` affects.
pub fn create_update_plans(resources: &[GenericResource], repo: &Repository) -> Vec<UpdatePlan> {
    let mut impacted = Vec::new();

    for resource in resources {
        let policy =
            get_policy_from_labels_or_annotations(&resource.labels(), &resource.annotations());
        if policy.is_none() {
            continue;
        }

        match check_for_update(&policy, repo, resource) {
            Ok(Some(plan)) => impacted.push(plan),
            Ok(None) => {},
            Err(e) => {
                error!("Failed to check {} for {}: {}", resource, repo, e);
                break;
            },
        }
    }

    impacted
}

pub fn approval_request(provider: &str, plan: &UpdatePlan) -> ApprovalRequest {
    let labels = plan.resource.labels();
    let meta = plan.resource.annotations();
    ApprovalRequest::from_meta(
        provider,
        &plan.resource.identifier,
        &plan.current_version,
        &plan.new_version,
        lookup(&labels, &meta, annotations::APPROVALS),
        lookup(&labels, &meta, annotations::APPROVAL_DEADLINE),
    )
    .with_message(format!(
        "New image is available for {} {}->{}.",
        plan.resource, plan.current_version, plan.new_version
    ))
}

/// Tracked images of every workload with a policy.
pub fn tracked_images(resources: &[GenericResource], provider: &str) -> Vec<TrackedImage> {
    let mut tracked = Vec::new();

    for resource in resources {
        let labels = resource.labels();
        let meta = resource.annotations();

        let policy = get_policy_from_labels_or_annotations(&labels, &meta);
        if policy.is_none() {
            continue;
        }

        let schedule = match lookup(&labels, &meta, annotations::POLL_SCHEDULE) {
            Some(raw) => match Schedule::parse(raw) {
                Ok(_) => raw.to_string(),
                Err(e) => {
                    error!("{} on {}, using default schedule", e, resource);
                    DEFAULT_POLL_SCHEDULE.to_string()
                },
            },
            None => DEFAULT_POLL_SCHEDULE.to_string(),
        };

        let trigger = lookup(&labels, &meta, annotations::TRIGGER)
            .map(|raw| {
                raw.parse().unwrap_or_else(|e| {
                    warn!("{} on {}, using default trigger", e, resource);
                    TriggerType::Default
                })
            })
            .unwrap_or_default();

        let mut secrets = resource.image_pull_secrets();
        if let Some(secret) = lookup(&labels, &meta, annotations::IMAGE_PULL_SECRET)
            && !secrets.iter().any(|s| s == secret)
        {
            secrets.push(secret.to_string());
        }

        for raw in resource.images() {
            let image = match image::parse(&raw) {
                Ok(image) => image,
                Err(e) => {
                    error!("Failed to parse image {} of {}: {}", raw, resource, e);
                    continue;
                },
            };

            tracked.push(TrackedImage {
                image,
                provider: provider.to_string(),
                namespace: resource.namespace.clone(),
                secrets: secrets.clone(),
                trigger,
                poll_schedule: schedule.clone(),
                policy: policy.clone(),
                meta: BTreeMap::from([("resource".to_string(), resource.identifier.clone())]),
            });
        }
    }

    tracked
}

pub(crate) fn notification_channels(meta: &BTreeMap<String, String>) -> Vec<String> {
    meta.get(annotations::NOTIFY)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn notification(
    resource: &GenericResource,
    notification_type: NotificationType,
    level: Level,
) -> EventNotification {
    EventNotification::new(notification_type, level)
        .with_resource(resource.kind(), &resource.identifier, &resource.name)
        .with_metadata("provider", PROVIDER_NAME)
        .with_metadata("namespace", &resource.namespace)
        .with_metadata("name", &resource.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalStatus, MemoryStore};
    use crate::k8s::ResourceCache;
    use crate::notifications::testing::RecordingSender;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeImplementer {
        updated: Mutex<Vec<GenericResource>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Implementer for FakeImplementer {
        async fn update(&self, resource: &GenericResource) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("api server unavailable");
            }
            self.updated.lock().unwrap().push(resource.clone());
            Ok(())
        }
    }

    fn deployment(name: &str, image: &str, meta: &[(&str, &str)]) -> GenericResource {
        let annotations: String = meta
            .iter()
            .map(|(k, v)| format!("    {}: \"{}\"\n", k, v))
            .collect();
        let raw = format!(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {name}\n  namespace: xxxx\n  annotations:\n{annotations}spec:\n  selector:\n    matchLabels:\n      app: {name}\n  template:\n    metadata:\n      labels:\n        app: {name}\n    spec:\n      imagePullSecrets:\n        - name: regcred\n      containers:\n        - name: app\n          image: {image}\n",
        );
        GenericResource::from_yaml(&raw).unwrap().unwrap()
    }

    struct Fixture {
        provider: KubernetesProvider,
        implementer: Arc<FakeImplementer>,
        sender: Arc<RecordingSender>,
        approvals: Arc<ApprovalManager>,
    }

    fn fixture(resources: Vec<GenericResource>, fail: bool) -> Fixture {
        let cache = Arc::new(ResourceCache::new());
        cache.replace_all(resources);
        let implementer = Arc::new(FakeImplementer {
            fail,
            ..Default::default()
        });
        let sender = Arc::new(RecordingSender::default());
        let approvals = Arc::new(ApprovalManager::new(
            Arc::new(MemoryStore::default()),
            Arc::new(RecordingSender::default()),
        ));
        let provider = KubernetesProvider::new(cache, implementer.clone(), sender.clone(), approvals.clone());
        Fixture {
            provider,
            implementer,
            sender,
            approvals,
        }
    }

    fn event(name: &str, tag: &str) -> Event {
        Event::new(Repository::new(name, tag), "test")
    }

    #[tokio::test]
    async fn test_update_applies_plan() {
        let f = fixture(
            vec![
                deployment("wd-1", "gcr.io/v2-namespace/hello-world:1.1.0", &[("bowline.sh/policy", "all")]),
                deployment("wd-2", "gcr.io/v2-namespace/hello-world:1.1.0", &[]),
            ],
            false,
        );

        let updated = f
            .provider
            .process_event(event("gcr.io/v2-namespace/hello-world", "1.2.0"))
            .await;

        assert_eq!(updated.len(), 1);
        let written = f.implementer.updated.lock().unwrap();
        assert_eq!(written[0].images(), vec!["gcr.io/v2-namespace/hello-world:1.2.0"]);
        assert!(
            written[0]
                .annotations()
                .get(annotations::CHANGE_CAUSE)
                .unwrap()
                .contains("1.1.0 -> 1.2.0")
        );

        let sent = f.sender.events();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].notification_type, NotificationType::PreDeploymentUpdate);
        assert_eq!(sent[1].level, Level::Success);
    }

    #[tokio::test]
    async fn test_noop_plan_is_not_executed() {
        let f = fixture(
            vec![deployment(
                "wd",
                "karolisr/keel:latest",
                &[("bowline.sh/policy", "force"), ("bowline.sh/matchTag", "true")],
            )],
            false,
        );

        let evt = event("karolisr/keel", "latest");
        assert_eq!(f.provider.create_update_plans(&evt.repository).len(), 1);

        let updated = f.provider.process_event(evt).await;
        assert!(updated.is_empty());
        assert!(f.implementer.updated.lock().unwrap().is_empty());
        assert!(f.sender.events().is_empty());
    }

    #[tokio::test]
    async fn test_stale_container_behind_current_one_is_updated() {
        let raw = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: wd\n  namespace: xxxx\n  annotations:\n    bowline.sh/policy: force\nspec:\n  selector:\n    matchLabels:\n      app: wd\n  template:\n    metadata:\n      labels:\n        app: wd\n    spec:\n      containers:\n        - name: a\n          image: karolisr/keel:1.1.0\n        - name: b\n          image: karolisr/keel:1.0.0\n";
        let f = fixture(vec![GenericResource::from_yaml(raw).unwrap().unwrap()], false);

        let updated = f.provider.process_event(event("karolisr/keel", "1.1.0")).await;

        assert_eq!(updated.len(), 1);
        let written = f.implementer.updated.lock().unwrap();
        assert_eq!(
            written[0].images(),
            vec!["karolisr/keel:1.1.0", "karolisr/keel:1.1.0"]
        );
        assert_eq!(f.sender.events().last().unwrap().level, Level::Success);
    }

    #[tokio::test]
    async fn test_failed_update_is_reported() {
        let f = fixture(
            vec![
                deployment("a", "karolisr/keel:1.0.0", &[("bowline.sh/policy", "all")]),
                deployment("b", "karolisr/keel:1.0.0", &[("bowline.sh/policy", "all")]),
            ],
            true,
        );

        let updated = f.provider.process_event(event("karolisr/keel", "1.1.0")).await;
        assert!(updated.is_empty());

        let errors: Vec<_> = f
            .sender
            .events()
            .into_iter()
            .filter(|e| e.level == Level::Error)
            .collect();
        // each plan fails on its own
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn test_approval_holds_update_until_voted() {
        let f = fixture(
            vec![deployment(
                "wd",
                "karolisr/keel:1.0.0",
                &[("bowline.sh/policy", "all"), ("bowline.sh/approvals", "1")],
            )],
            false,
        );

        let first = f.provider.process_event(event("karolisr/keel", "1.1.0")).await;
        assert!(first.is_empty());

        let identifier = "kubernetes/deployment/xxxx/wd:1.0.0->1.1.0";
        let approval = f.approvals.get(identifier).await.unwrap();
        assert_eq!(approval.status(), ApprovalStatus::Pending);

        f.approvals.approve(identifier, "alice").await.unwrap();
        let second = f.provider.process_event(approval.event).await;
        assert_eq!(second.len(), 1);
        assert!(f.approvals.get(identifier).await.is_err());
    }

    #[test]
    fn test_tracked_images() {
        let resources = vec![
            deployment(
                "wd",
                "gcr.io/v2-namespace/hello-world:1.1.0",
                &[
                    ("bowline.sh/policy", "all"),
                    ("bowline.sh/trigger", "poll"),
                    ("bowline.sh/pollSchedule", "@every 2m"),
                    ("bowline.sh/imagePullSecret", "extra"),
                ],
            ),
            deployment("bad-schedule", "alpine:3.7.3", &[("bowline.sh/policy", "patch"), ("bowline.sh/pollSchedule", "soon")]),
            deployment("untracked", "alpine:3.7.3", &[]),
        ];

        let images = tracked_images(&resources, PROVIDER_NAME);
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].trigger, TriggerType::Poll);
        assert_eq!(images[0].poll_schedule, "@every 2m");
        assert_eq!(images[0].secrets, vec!["regcred", "extra"]);
        assert_eq!(images[0].namespace, "xxxx");
        assert_eq!(images[1].trigger, TriggerType::Default);
        assert_eq!(images[1].poll_schedule, DEFAULT_POLL_SCHEDULE);
    }

    #[test]
    fn test_notification_channels() {
        let meta = BTreeMap::from([(
            annotations::NOTIFY.to_string(),
            "chan1, chan2,,".to_string(),
        )]);
        assert_eq!(notification_channels(&meta), vec!["chan1", "chan2"]);
        assert!(notification_channels(&BTreeMap::new()).is_empty());
    }
}
