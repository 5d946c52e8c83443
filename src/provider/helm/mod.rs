//! Upgrades Helm releases whose chart values opt into automated updates.
//!
//! Releases carry their configuration in the `bowline` block of their values:
//!
//! ```yaml
//! bowline:
//!   policy: minor
//!   trigger: poll
//!   images:
//!     - repository: image.repository
//!       tag: image.tag
//! ```

pub mod implementer;
pub mod updates;
pub mod values;

pub use implementer::{HelmCli, HelmImplementer, Release};
pub use updates::{HelmUpdatePlan, check_release};
pub use values::{ChartConfig, ChartConfigError, ImageDetails, ValuesError};

use super::{ApprovalRequest, EventQueue, Gate, ProviderError, approval_complete, check_approval};
use crate::approval::ApprovalManager;
use crate::metrics;
use crate::models::{Event, Repository, TrackedImage};
use crate::notifications::{EventNotification, Level, NotificationType, Sender};
use crate::trigger::poll::{DEFAULT_POLL_SCHEDULE, Schedule};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const PROVIDER_NAME: &str = "helm";

pub struct HelmProvider {
    queue: EventQueue,
    implementer: Arc<dyn HelmImplementer>,
    sender: Arc<dyn Sender>,
    approvals: Arc<ApprovalManager>,
}

impl HelmProvider {
    pub fn new(
        implementer: Arc<dyn HelmImplementer>,
        sender: Arc<dyn Sender>,
        approvals: Arc<ApprovalManager>,
    ) -> Self {
        Self {
            queue: EventQueue::new(PROVIDER_NAME),
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

    pub async fn tracked_images(&self) -> Vec<TrackedImage> {
        match self.implementer.list_releases().await {
            Ok(releases) => tracked_images(&releases),
            Err(e) => {
                error!("Failed to list helm releases: {:#}", e);
                Vec::new()
            },
        }
    }

    /// Handles one event and returns the number of upgraded releases.
    pub async fn process_event(&self, event: Event) -> usize {
        let plans = match self.create_update_plans(&event.repository).await {
            Ok(plans) => plans,
            Err(e) => {
                error!("Failed to list helm releases: {:#}", e);
                return 0;
            },
        };

        let mut approved = Vec::new();
        for plan in plans {
            if plan.is_noop() {
                debug!("Skipping {}: already at {}", plan, plan.new_version);
                continue;
            }

            let request = ApprovalRequest::new(
                PROVIDER_NAME,
                &plan.target(),
                &plan.current_version,
                &plan.new_version,
                plan.config.approvals,
                plan.config.approval_deadline,
            )
            .with_message(format!(
                "New image is available for release {}/{} {}->{}.",
                plan.release.namespace, plan.release.name, plan.current_version, plan.new_version
            ));

            match check_approval(&self.approvals, PROVIDER_NAME, &event, &request).await {
                Gate::Execute => approved.push((plan, request)),
                Gate::Hold => info!("Release update {} is waiting for approval", plan),
                Gate::Skip => debug!("Release update {} skipped by approval gate", plan),
            }
        }

        self.update_releases(approved).await
    }

    pub async fn create_update_plans(
        &self,
        repo: &Repository,
    ) -> anyhow::Result<Vec<HelmUpdatePlan>> {
        let releases = self.implementer.list_releases().await?;
        Ok(releases
            .iter()
            .filter_map(|release| check_release(repo, release))
            .collect())
    }

    async fn update_releases(&self, plans: Vec<(HelmUpdatePlan, ApprovalRequest)>) -> usize {
        let mut updated = 0;

        for (plan, request) in plans {
            let channels = plan.config.notification_channels.clone();

            self.sender.send(
                notification(&plan, NotificationType::PreReleaseUpdate, Level::Debug)
                    .with_message(format!(
                        "Preparing to update release {}/{} {}->{} ({})",
                        plan.release.namespace,
                        plan.release.name,
                        plan.current_version,
                        plan.new_version,
                        format_values(&plan.values)
                    ))
                    .with_channels(channels.clone()),
            );

            if let Err(e) = self
                .implementer
                .update_release_from_chart(&plan.release, &plan.values)
                .await
            {
                error!("Failed to upgrade release {}: {:#}", plan, e);
                metrics::UPDATE_FAILURES
                    .with_label_values(&[PROVIDER_NAME])
                    .inc();
                self.sender.send(
                    notification(&plan, NotificationType::ReleaseUpdate, Level::Error)
                        .with_message(format!(
                            "Release update failed {}/{} {}->{}. Error: {:#}",
                            plan.release.namespace,
                            plan.release.name,
                            plan.current_version,
                            plan.new_version,
                            e
                        ))
                        .with_channels(channels),
                );
                continue;
            }

            metrics::HELM_VERSIONED_UPDATES
                .with_label_values(&[&format!("{}/{}", plan.release.namespace, plan.release.name)])
                .inc();
            approval_complete(&self.approvals, &request).await;

            let mut message = format!(
                "Successfully updated release {}/{} {}->{} ({})",
                plan.release.namespace,
                plan.release.name,
                plan.current_version,
                plan.new_version,
                format_values(&plan.values)
            );
            if !plan.release_notes.is_empty() {
                message.push_str(&format!(". Release notes: {}", plan.release_notes.join(", ")));
            }
            self.sender.send(
                notification(&plan, NotificationType::ReleaseUpdate, Level::Success)
                    .with_message(message)
                    .with_channels(channels),
            );

            info!("Upgraded release {}", plan);
            updated += 1;
        }

        updated
    }
}

/// Tracked images of every release with a usable configuration.
pub fn tracked_images(releases: &[Release]) -> Vec<TrackedImage> {
    let mut tracked = Vec::new();

    for release in releases {
        let config = match ChartConfig::from_values(&release.values) {
            Ok(config) if !config.policy.is_none() => config,
            Ok(_) | Err(ChartConfigError::NotFound | ChartConfigError::PolicyNotSpecified) => {
                continue;
            },
            Err(e) => {
                error!(
                    "Failed to read configuration of release {}/{}: {}",
                    release.namespace, release.name, e
                );
                continue;
            },
        };

        let schedule = match Schedule::parse(&config.poll_schedule) {
            Ok(_) => config.poll_schedule.clone(),
            Err(e) => {
                error!(
                    "{} on release {}/{}, using default schedule",
                    e, release.namespace, release.name
                );
                DEFAULT_POLL_SCHEDULE.to_string()
            },
        };

        for details in &config.images {
            let image = match values::parse_image(&release.values, details) {
                Ok(image) => image,
                Err(e) => {
                    error!(
                        "Failed to parse image of release {}/{}: {}",
                        release.namespace, release.name, e
                    );
                    continue;
                },
            };

            let secrets = if details.image_pull_secret.is_empty() {
                Vec::new()
            } else {
                vec![details.image_pull_secret.clone()]
            };

            tracked.push(TrackedImage {
                image,
                provider: PROVIDER_NAME.to_string(),
                namespace: release.namespace.clone(),
                secrets,
                trigger: config.trigger,
                poll_schedule: schedule.clone(),
                policy: config.policy.clone(),
                meta: BTreeMap::from([
                    ("selector".to_string(), release.name.clone()),
                    ("chart".to_string(), release.chart.clone()),
                ]),
            });
        }
    }

    tracked
}

fn format_values(values: &BTreeMap<String, String>) -> String {
    values
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

fn notification(plan: &HelmUpdatePlan, notification_type: NotificationType, level: Level) -> EventNotification {
    EventNotification::new(notification_type, level)
        .with_resource("release", plan.target(), &plan.release.name)
        .with_metadata("provider", PROVIDER_NAME)
        .with_metadata("namespace", &plan.release.namespace)
        .with_metadata("name", &plan.release.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::MemoryStore;
    use crate::models::TriggerType;
    use crate::notifications::testing::RecordingSender;
    use std::sync::Mutex;

    struct FakeHelm {
        releases: Vec<Release>,
        upgrades: Mutex<Vec<(String, BTreeMap<String, String>)>>,
        fail: bool,
    }

    impl FakeHelm {
        fn new(releases: Vec<Release>) -> Self {
            Self {
                releases,
                upgrades: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl HelmImplementer for FakeHelm {
        async fn list_releases(&self) -> anyhow::Result<Vec<Release>> {
            Ok(self.releases.clone())
        }

        async fn update_release_from_chart(
            &self,
            release: &Release,
            values: &BTreeMap<String, String>,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("tiller unreachable");
            }
            self.upgrades
                .lock()
                .unwrap()
                .push((release.name.clone(), values.clone()));
            Ok(())
        }
    }

    fn release(name: &str, values: &str) -> Release {
        Release {
            name: name.to_string(),
            namespace: "default".to_string(),
            chart: "hello-world-0.1.0".to_string(),
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
  pollSchedule: "@every 2m"
  notificationChannels: [releases]
  images:
    - repository: image.repository
      tag: image.tag
      imagePullSecret: gcr-creds
"#;

    fn provider(helm: Arc<FakeHelm>) -> (HelmProvider, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        let approvals = Arc::new(ApprovalManager::new(
            Arc::new(MemoryStore::default()),
            Arc::new(RecordingSender::default()),
        ));
        (HelmProvider::new(helm, sender.clone(), approvals), sender)
    }

    #[tokio::test]
    async fn test_release_is_upgraded() {
        let helm = Arc::new(FakeHelm::new(vec![
            release("release-1", CHART_VALUES),
            release("release-2", "image:\n  repository: gcr.io/v2-namespace/hello-world\n  tag: 1.1.0\n"),
        ]));
        let (provider, sender) = provider(helm.clone());

        let event = Event::new(Repository::new("gcr.io/v2-namespace/hello-world", "1.2.0"), "poll");
        assert_eq!(provider.process_event(event).await, 1);

        let upgrades = helm.upgrades.lock().unwrap();
        assert_eq!(upgrades.len(), 1);
        assert_eq!(upgrades[0].0, "release-1");
        assert_eq!(upgrades[0].1.get("image.tag").unwrap(), "1.2.0");

        let sent = sender.events();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].level, Level::Success);
        assert_eq!(sent[1].channels, vec!["releases"]);
    }

    #[tokio::test]
    async fn test_noop_release_is_not_upgraded() {
        let forced = CHART_VALUES.replace("policy: all", "policy: force");
        let helm = Arc::new(FakeHelm::new(vec![release("release-1", &forced)]));
        let (provider, sender) = provider(helm.clone());

        let repo = Repository::new("gcr.io/v2-namespace/hello-world", "1.1.0");
        assert_eq!(provider.create_update_plans(&repo).await.unwrap().len(), 1);

        assert_eq!(provider.process_event(Event::new(repo, "poll")).await, 0);
        assert!(helm.upgrades.lock().unwrap().is_empty());
        assert!(sender.events().is_empty());
    }

    #[tokio::test]
    async fn test_failed_upgrade_is_reported() {
        let mut helm = FakeHelm::new(vec![release("release-1", CHART_VALUES)]);
        helm.fail = true;
        let (provider, sender) = provider(Arc::new(helm));

        let event = Event::new(Repository::new("gcr.io/v2-namespace/hello-world", "1.2.0"), "poll");
        assert_eq!(provider.process_event(event).await, 0);
        assert_eq!(sender.events().last().unwrap().level, Level::Error);
    }

    #[tokio::test]
    async fn test_tracked_images() {
        let helm = Arc::new(FakeHelm::new(vec![
            release("release-1", CHART_VALUES),
            release("release-2", "image:\n  repository: nginx\n  tag: 1.25\n"),
        ]));
        let (provider, _) = provider(helm);

        let images = provider.tracked_images().await;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].image.remote(), "gcr.io/v2-namespace/hello-world:1.1.0");
        assert_eq!(images[0].trigger, TriggerType::Poll);
        assert_eq!(images[0].poll_schedule, "@every 2m");
        assert_eq!(images[0].secrets, vec!["gcr-creds"]);
        assert_eq!(images[0].provider, PROVIDER_NAME);
    }
}
