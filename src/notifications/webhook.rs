use super::{EventNotification, Level, NotificationType, Notifier, WebhookConfig};
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Bowline-Signature";
pub const EVENT_HEADER: &str = "X-Bowline-Event";

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Body posted to the webhook endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    #[serde(rename = "type")]
    notification_type: NotificationType,
    level: Level,
    title: String,
    message: &'a str,
    resource: ResourceRef<'a>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    channels: &'a [String],
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    metadata: &'a BTreeMap<String, String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ResourceRef<'a> {
    kind: &'a str,
    identifier: &'a str,
    name: &'a str,
}

impl<'a> From<&'a EventNotification> for WebhookPayload<'a> {
    fn from(event: &'a EventNotification) -> Self {
        Self {
            notification_type: event.notification_type,
            level: event.level,
            title: format!("{} {}", event.notification_type, event.name)
                .trim()
                .to_string(),
            message: &event.message,
            resource: ResourceRef {
                kind: &event.resource_kind,
                identifier: &event.identifier,
                name: &event.name,
            },
            channels: &event.channels,
            metadata: &event.metadata,
            created_at: event.created_at,
        }
    }
}

/// Posts notifications as JSON, signed with HMAC-SHA256 when a secret is set.
pub struct WebhookNotifier {
    url: String,
    secret: Option<String>,
    max_retries: u32,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self> {
        if !config.enabled {
            bail!("webhook notifier is disabled");
        }
        let url = config
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| anyhow!("webhook notifier needs WEBHOOK_ENDPOINT"))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build webhook HTTP client")?;

        Ok(Self {
            url,
            secret: config.secret.filter(|s| !s.is_empty()),
            max_retries: config.max_retries,
            client,
        })
    }

    /// `sha256=<hex>` HMAC of `body`, or `None` without a secret.
    fn signature(&self, body: &[u8]) -> Result<Option<String>> {
        self.secret
            .as_deref()
            .map(|secret| sign(secret.as_bytes(), body))
            .transpose()
    }

    async fn deliver(&self, body: &[u8], event_type: NotificationType) -> Result<()> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header(EVENT_HEADER, event_type.as_str());
        if let Some(signature) = self.signature(body)? {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request
            .body(body.to_vec())
            .send()
            .await
            .context("webhook request failed")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("webhook returned {}: {}", status, text);
        }
        Ok(())
    }
}

fn sign(key: &[u8], body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key).context("invalid webhook secret")?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, event: &EventNotification) -> Result<()> {
        let body = serde_json::to_vec(&WebhookPayload::from(event))
            .context("Failed to encode webhook payload")?;

        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;
        loop {
            match self.deliver(&body, event.notification_type).await {
                Ok(()) => {
                    debug!("Delivered {} notification to {}", event.notification_type, self.url);
                    return Ok(());
                },
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "Webhook delivery failed ({}), retry {}/{} in {:?}",
                        e, attempt, self.max_retries, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                },
                Err(e) => return Err(e.context(format!("giving up after {} retries", attempt))),
            }
        }
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(secret: Option<&str>) -> WebhookConfig {
        WebhookConfig {
            enabled: true,
            url: Some("https://hooks.example.com/bowline".to_string()),
            secret: secret.map(str::to_string),
            timeout_seconds: 5,
            max_retries: 2,
        }
    }

    #[test]
    fn test_requires_enabled_and_url() {
        assert!(WebhookNotifier::new(config(None)).is_ok());
        assert!(
            WebhookNotifier::new(WebhookConfig {
                enabled: false,
                ..config(None)
            })
            .is_err()
        );
        assert!(
            WebhookNotifier::new(WebhookConfig {
                url: Some("  ".to_string()),
                ..config(None)
            })
            .is_err()
        );
    }

    #[test]
    fn test_hmac_sha256_known_vector() {
        // RFC 4231, test case 2
        assert_eq!(
            sign(b"Jefe", b"what do ya want for nothing?").unwrap(),
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_signature_only_with_secret() {
        let signed = WebhookNotifier::new(config(Some("Jefe"))).unwrap();
        assert_eq!(
            signed.signature(b"what do ya want for nothing?").unwrap().unwrap(),
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );

        let unsigned = WebhookNotifier::new(config(Some(""))).unwrap();
        assert!(unsigned.signature(b"body").unwrap().is_none());
    }

    #[test]
    fn test_payload_shape() {
        let event = EventNotification::new(NotificationType::DeploymentUpdate, Level::Success)
            .with_resource("deployment", "deployment/default/wd", "wd")
            .with_message("Successfully updated deployment/default/wd 1.0.0 -> 1.1.0")
            .with_metadata("provider", "kubernetes");

        let json = serde_json::to_value(WebhookPayload::from(&event)).unwrap();
        assert_eq!(json["type"], "deployment_update");
        assert_eq!(json["level"], "success");
        assert_eq!(json["title"], "deployment update wd");
        assert_eq!(json["resource"]["identifier"], "deployment/default/wd");
        assert_eq!(json["metadata"]["provider"], "kubernetes");
        assert!(json.get("channels").is_none());
        assert!(json.get("createdAt").is_some());
    }
}
