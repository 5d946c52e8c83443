use crate::config::{Lookup, parse_bool, parse_u64};
use crate::metrics;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

mod slack;
mod webhook;

pub use slack::SlackNotifier;
pub use webhook::WebhookNotifier;

/// Notification severity. Ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Success,
    Warn,
    Error,
    Fatal,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Success => "success",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Self::Debug => "#9E9E9E",
            Self::Info => "#2196F3",
            Self::Success => "#4CAF50",
            Self::Warn => "#FF9800",
            Self::Error | Self::Fatal => "#F44336",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Debug => ":mag:",
            Self::Info => ":information_source:",
            Self::Success => ":white_check_mark:",
            Self::Warn => ":warning:",
            Self::Error => ":x:",
            Self::Fatal => ":boom:",
        }
    }
}

#[derive(Debug, Error)]
#[error("Invalid notification level: {0}")]
pub struct InvalidLevel(String);

impl FromStr for Level {
    type Err = InvalidLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "success" => Ok(Self::Success),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            other => Err(InvalidLevel(other.to_string())),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    PreDeploymentUpdate,
    DeploymentUpdate,
    PreReleaseUpdate,
    ReleaseUpdate,
    ApprovalRequired,
    ApprovalUpdate,
    SystemEvent,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreDeploymentUpdate => "preparing deployment update",
            Self::DeploymentUpdate => "deployment update",
            Self::PreReleaseUpdate => "preparing release update",
            Self::ReleaseUpdate => "release update",
            Self::ApprovalRequired => "approval required",
            Self::ApprovalUpdate => "approval update",
            Self::SystemEvent => "system event",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventNotification {
    pub resource_kind: String,
    pub identifier: String,
    pub name: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub level: Level,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl EventNotification {
    pub fn new(notification_type: NotificationType, level: Level) -> Self {
        Self {
            resource_kind: String::new(),
            identifier: String::new(),
            name: String::new(),
            message: String::new(),
            created_at: Utc::now(),
            notification_type,
            level,
            channels: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_resource(
        mut self,
        kind: impl Into<String>,
        identifier: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.resource_kind = kind.into();
        self.identifier = identifier.into();
        self.name = name.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn title(&self) -> String {
        if self.name.is_empty() {
            capitalize(self.notification_type.as_str())
        } else {
            format!("{}: {}", capitalize(self.notification_type.as_str()), self.name)
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Fire-and-forget notification sink handed to providers and the approval manager.
pub trait Sender: Send + Sync {
    fn send(&self, event: EventNotification);
}

/// Delivery backend behind the [`NotificationManager`].
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, event: &EventNotification) -> Result<()>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Default)]
pub struct SlackConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub channel: Option<String>,
    pub username: Option<String>,
    pub icon_emoji: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub secret: Option<String>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            secret: None,
            timeout_seconds: 10,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotificationConfig {
    /// Events below this level are dropped
    pub level: Level,
    pub slack: SlackConfig,
    pub webhook: WebhookConfig,
}

impl NotificationConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Self {
        let level = match lookup("NOTIFICATION_LEVEL") {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!("{}, defaulting to info", e);
                Level::Info
            }),
            None => Level::Info,
        };

        let webhook_url = lookup("WEBHOOK_ENDPOINT").or_else(|| lookup("WEBHOOK_URL"));

        Self {
            level,
            slack: SlackConfig {
                enabled: parse_bool(lookup("SLACK_ENABLED"), false),
                webhook_url: lookup("SLACK_WEBHOOK_URL"),
                channel: lookup("SLACK_CHANNEL"),
                username: lookup("SLACK_USERNAME"),
                icon_emoji: lookup("SLACK_ICON_EMOJI"),
            },
            webhook: WebhookConfig {
                // An endpoint on its own is enough to enable the webhook sender.
                enabled: parse_bool(lookup("WEBHOOK_ENABLED"), webhook_url.is_some()),
                url: webhook_url,
                secret: lookup("WEBHOOK_SECRET"),
                timeout_seconds: parse_u64(lookup("WEBHOOK_TIMEOUT"), 10),
                max_retries: parse_u64(lookup("WEBHOOK_MAX_RETRIES"), 3) as u32,
            },
        }
    }
}

/// Registry of configured notifiers, built once at startup.
pub struct NotificationManager {
    notifiers: Arc<Vec<Box<dyn Notifier>>>,
    level: Level,
}

impl NotificationManager {
    pub fn new(config: NotificationConfig) -> Self {
        let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();

        if config.slack.enabled {
            match SlackNotifier::new(config.slack.clone()) {
                Ok(notifier) => notifiers.push(Box::new(notifier)),
                Err(e) => error!("Failed to create Slack notifier: {}", e),
            }
        }

        if config.webhook.enabled {
            match WebhookNotifier::new(config.webhook.clone()) {
                Ok(notifier) => notifiers.push(Box::new(notifier)),
                Err(e) => error!("Failed to create webhook notifier: {}", e),
            }
        }

        Self::with_notifiers(config.level, notifiers)
    }

    pub fn with_notifiers(level: Level, notifiers: Vec<Box<dyn Notifier>>) -> Self {
        info!(
            "Notification manager initialized with {} notifiers at level {}",
            notifiers.len(),
            level
        );

        Self {
            notifiers: Arc::new(notifiers),
            level,
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.notifiers.iter().map(|n| n.name()).collect()
    }

    pub fn level(&self) -> Level {
        self.level
    }

    async fn dispatch(notifiers: &[Box<dyn Notifier>], event: &EventNotification) {
        for notifier in notifiers {
            match notifier.send(event).await {
                Ok(()) => {
                    debug!("Notification sent via {}", notifier.name());
                    metrics::NOTIFICATIONS_SENT_TOTAL
                        .with_label_values(&[notifier.name()])
                        .inc();
                },
                Err(e) => {
                    error!("Failed to send notification via {}: {}", notifier.name(), e);
                    metrics::NOTIFICATIONS_FAILED_TOTAL
                        .with_label_values(&[notifier.name()])
                        .inc();
                },
            }
        }
    }
}

impl Sender for NotificationManager {
    fn send(&self, event: EventNotification) {
        if event.level < self.level {
            debug!(
                "Dropping {} notification below level {}: {}",
                event.level, self.level, event.message
            );
            return;
        }

        if self.notifiers.is_empty() {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime available, dropping notification");
                return;
            },
        };

        let notifiers = self.notifiers.clone();
        handle.spawn(async move {
            Self::dispatch(&notifiers, &event).await;
        });
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    struct ChannelNotifier {
        tx: mpsc::UnboundedSender<EventNotification>,
    }

    #[async_trait::async_trait]
    impl Notifier for ChannelNotifier {
        async fn send(&self, event: &EventNotification) -> Result<()> {
            self.tx.send(event.clone())?;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "channel"
        }
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Success);
        assert!(Level::Warn < Level::Error);
        assert_eq!("warning".parse::<Level>().unwrap(), Level::Warn);
        assert!("loud".parse::<Level>().is_err());
    }

    #[test]
    fn test_config_from_lookup() {
        let env = HashMap::from([
            ("NOTIFICATION_LEVEL", "success"),
            ("WEBHOOK_ENDPOINT", "https://example.com/hook"),
            ("SLACK_ENABLED", "true"),
            ("SLACK_WEBHOOK_URL", "https://hooks.slack.com/services/T"),
        ]);
        let config =
            NotificationConfig::from_lookup(&|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.level, Level::Success);
        assert!(config.webhook.enabled);
        assert_eq!(config.webhook.max_retries, 3);
        assert!(config.slack.enabled);
    }

    #[tokio::test]
    async fn test_manager_filters_below_level() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager =
            NotificationManager::with_notifiers(Level::Info, vec![Box::new(ChannelNotifier { tx })]);

        manager.send(
            EventNotification::new(NotificationType::PreDeploymentUpdate, Level::Debug)
                .with_message("hidden"),
        );
        manager.send(
            EventNotification::new(NotificationType::DeploymentUpdate, Level::Success)
                .with_message("visible"),
        );

        let received = rx.recv().await.unwrap();
        assert_eq!(received.message, "visible");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_title() {
        let event = EventNotification::new(NotificationType::DeploymentUpdate, Level::Success)
            .with_resource("deployment", "deployment/default/wd", "wd");
        assert_eq!(event.title(), "Deployment update: wd");
    }
}
