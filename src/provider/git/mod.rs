//! Commits image updates to a manifest repository instead of touching the
//! cluster. Plans come from the workloads the repository renders.

use super::kubernetes::{self, UpdatePlan};
use super::{ApprovalRequest, EventQueue, Gate, ProviderError, approval_complete, check_approval};
use crate::approval::ApprovalManager;
use crate::gitrepo::ManifestRepo;
use crate::k8s::GenericResourceCache;
use crate::metrics;
use crate::models::{Event, TrackedImage};
use crate::notifications::{EventNotification, Level, NotificationType, Sender};
use std::sync::Arc;
use tracing::{debug, error, info};

pub const PROVIDER_NAME: &str = "git";

pub struct GitProvider {
    queue: EventQueue,
    cache: Arc<dyn GenericResourceCache>,
    repo: Arc<dyn ManifestRepo>,
    sender: Arc<dyn Sender>,
    approvals: Arc<ApprovalManager>,
}

impl GitProvider {
    pub fn new(
        cache: Arc<dyn GenericResourceCache>,
        repo: Arc<dyn ManifestRepo>,
        sender: Arc<dyn Sender>,
        approvals: Arc<ApprovalManager>,
    ) -> Self {
        Self {
            queue: EventQueue::new(PROVIDER_NAME),
            cache,
            repo,
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
        kubernetes::tracked_images(&self.cache.values(), PROVIDER_NAME)
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

    /// Handles one event and returns the number of plans committed.
    pub async fn process_event(&self, event: Event) -> usize {
        let plans = kubernetes::create_update_plans(&self.cache.values(), &event.repository);

        let mut approved = Vec::new();
        for plan in plans {
            if plan.is_noop() {
                debug!("Skipping {}: already at {}", plan, plan.new_version);
                continue;
            }

            let request = kubernetes::approval_request(PROVIDER_NAME, &plan);
            match check_approval(&self.approvals, PROVIDER_NAME, &event, &request).await {
                Gate::Execute => approved.push((plan, request)),
                Gate::Hold => info!("Commit for {} is waiting for approval", plan),
                Gate::Skip => debug!("Commit for {} skipped by approval gate", plan),
            }
        }

        let mut committed = 0;
        for (plan, request) in approved {
            if self.commit_plan(&plan, &request).await {
                committed += 1;
            }
        }
        committed
    }

    async fn commit_plan(&self, plan: &UpdatePlan, request: &ApprovalRequest) -> bool {
        let resource = &plan.resource;
        let channels = kubernetes::notification_channels(&resource.annotations());
        let replacements: Vec<(String, String)> = plan
            .changes
            .iter()
            .filter(|c| c.from != c.to)
            .map(|c| (c.from.clone(), c.to.clone()))
            .collect();
        let message = format!(
            "Bowline automated update of {} {} -> {}",
            resource, plan.current_version, plan.new_version
        );

        self.sender.send(
            notification(plan, Level::Debug, NotificationType::PreDeploymentUpdate)
                .with_message(format!("Preparing to commit {}", message))
                .with_channels(channels.clone()),
        );

        match self.repo.apply(&replacements, &message).await {
            Ok(0) => {
                info!("No manifest in the repository references {}", plan);
                false
            },
            Ok(files) => {
                metrics::GIT_UPDATES
                    .with_label_values(&[&resource.identifier])
                    .inc();
                approval_complete(&self.approvals, request).await;
                self.sender.send(
                    notification(plan, Level::Success, NotificationType::DeploymentUpdate)
                        .with_message(format!("Committed {} ({} files)", message, files))
                        .with_channels(channels),
                );
                info!("Committed {} to the manifest repository", plan);
                true
            },
            Err(e) => {
                error!("Failed to commit {}: {}", plan, e);
                metrics::UPDATE_FAILURES
                    .with_label_values(&[PROVIDER_NAME])
                    .inc();
                self.sender.send(
                    notification(plan, Level::Error, NotificationType::DeploymentUpdate)
                        .with_message(format!("Failed to commit {}. Error: {}", message, e))
                        .with_channels(channels),
                );
                false
            },
        }
    }
}

fn notification(plan: &UpdatePlan, level: Level, notification_type: NotificationType) -> EventNotification {
    EventNotification::new(notification_type, level)
        .with_resource(plan.resource.kind(), &plan.resource.identifier, &plan.resource.name)
        .with_metadata("provider", PROVIDER_NAME)
        .with_metadata("namespace", &plan.resource.namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::MemoryStore;
    use crate::gitrepo::{GitError, render};
    use crate::k8s::ResourceCache;
    use crate::models::Repository;
    use crate::notifications::testing::RecordingSender;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRepo {
        applied: Mutex<Vec<(Vec<(String, String)>, String)>>,
    }

    #[async_trait::async_trait]
    impl ManifestRepo for FakeRepo {
        async fn apply(&self, replacements: &[(String, String)], message: &str) -> Result<usize, GitError> {
            self.applied
                .lock()
                .unwrap()
                .push((replacements.to_vec(), message.to_string()));
            Ok(replacements.len())
        }
    }

    const MANIFESTS: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: apps
  annotations:
    bowline.sh/policy: minor
    bowline.sh/trigger: poll
spec:
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: web
          image: karolisr/keel:0.1.0
        - name: proxy
          image: envoyproxy/envoy:v1.28.0
"#;

    fn provider(repo: Arc<FakeRepo>) -> GitProvider {
        provider_for(repo, MANIFESTS)
    }

    fn provider_for(repo: Arc<FakeRepo>, manifests: &str) -> GitProvider {
        let cache = Arc::new(ResourceCache::new());
        cache.replace_all(render::workloads(&render::split_documents("web.yaml", manifests)));
        let approvals = Arc::new(ApprovalManager::new(
            Arc::new(MemoryStore::default()),
            Arc::new(RecordingSender::default()),
        ));
        GitProvider::new(cache, repo, Arc::new(RecordingSender::default()), approvals)
    }

    #[tokio::test]
    async fn test_commit_replaces_old_image() {
        let repo = Arc::new(FakeRepo::default());
        let provider = provider(repo.clone());

        let event = Event::new(Repository::new("karolisr/keel", "0.2.0"), "poll");
        assert_eq!(provider.process_event(event).await, 1);

        let applied = repo.applied.lock().unwrap();
        assert_eq!(
            applied[0].0,
            vec![("karolisr/keel:0.1.0".to_string(), "karolisr/keel:0.2.0".to_string())]
        );
        assert!(applied[0].1.contains("0.1.0 -> 0.2.0"));
    }

    #[tokio::test]
    async fn test_commit_skips_container_already_on_new_tag() {
        let manifests = MANIFESTS.replace(
            "image: envoyproxy/envoy:v1.28.0",
            "image: karolisr/keel:0.1.0",
        );
        let manifests = manifests.replacen("image: karolisr/keel:0.1.0", "image: karolisr/keel:0.2.0", 1);
        let repo = Arc::new(FakeRepo::default());
        let provider = provider_for(repo.clone(), &manifests);

        let event = Event::new(Repository::new("karolisr/keel", "0.2.0"), "poll");
        assert_eq!(provider.process_event(event).await, 1);

        let applied = repo.applied.lock().unwrap();
        assert_eq!(
            applied[0].0,
            vec![("karolisr/keel:0.1.0".to_string(), "karolisr/keel:0.2.0".to_string())]
        );
        assert!(applied[0].1.contains("0.1.0 -> 0.2.0"));
    }

    #[tokio::test]
    async fn test_policy_rejects_major_bump() {
        let repo = Arc::new(FakeRepo::default());
        let provider = provider(repo.clone());

        let event = Event::new(Repository::new("karolisr/keel", "1.0.0"), "poll");
        assert_eq!(provider.process_event(event).await, 0);
        assert!(repo.applied.lock().unwrap().is_empty());
    }

    #[test]
    fn test_tracked_images() {
        let provider = provider(Arc::new(FakeRepo::default()));
        let images = provider.tracked_images();
        assert_eq!(images.len(), 2);
        assert!(images.iter().all(|i| i.provider == PROVIDER_NAME));
        assert_eq!(images[0].namespace, "apps");
    }
}
