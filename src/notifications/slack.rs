use super::{EventNotification, Notifier, SlackConfig};
use anyhow::{Context, Result, anyhow};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub struct SlackNotifier {
    config: SlackConfig,
    client: Client,
}

impl SlackNotifier {
    pub fn new(config: SlackConfig) -> Result<Self> {
        if !config.enabled {
            return Err(anyhow!("Slack notifier is disabled"));
        }

        if config.webhook_url.is_none() {
            return Err(anyhow!("Slack webhook URL is required"));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { config, client })
    }

    /// Build Slack message in Block Kit format
    fn build_message(&self, event: &EventNotification) -> serde_json::Value {
        let mut fields = vec![json!({
            "type": "mrkdwn",
            "text": format!("*Level:*\n{}", event.level)
        })];

        if !event.resource_kind.is_empty() {
            fields.push(json!({
                "type": "mrkdwn",
                "text": format!("*Kind:*\n{}", event.resource_kind)
            }));
        }

        if !event.identifier.is_empty() {
            fields.push(json!({
                "type": "mrkdwn",
                "text": format!("*Identifier:*\n`{}`", event.identifier)
            }));
        }

        for (key, value) in &event.metadata {
            fields.push(json!({
                "type": "mrkdwn",
                "text": format!("*{}:*\n{}", key, value)
            }));
        }

        let blocks = vec![
            json!({
                "type": "header",
                "text": {
                    "type": "plain_text",
                    "text": format!("{} {}", event.level.emoji(), event.title()),
                    "emoji": true
                }
            }),
            json!({
                "type": "section",
                "text": { "type": "mrkdwn", "text": event.message }
            }),
            json!({
                "type": "section",
                "fields": fields
            }),
            json!({
                "type": "context",
                "elements": [{
                    "type": "mrkdwn",
                    "text": format!("<!date^{}^{{date_short_pretty}} at {{time}}|{}>",
                        event.created_at.timestamp(),
                        event.created_at.format("%Y-%m-%d %H:%M:%S UTC")
                    )
                }]
            }),
        ];

        let mut message = json!({
            "blocks": blocks,
            "attachments": [{
                "color": event.level.color(),
                "fallback": event.title()
            }]
        });

        // Legacy incoming webhooks honour a channel override; app webhooks ignore it.
        if let Some(channel) = event.channels.first().or(self.config.channel.as_ref()) {
            message["channel"] = json!(channel);
        }

        message["username"] = json!(self.config.username.as_deref().unwrap_or("Bowline"));
        message["icon_emoji"] = json!(self.config.icon_emoji.as_deref().unwrap_or(":anchor:"));

        message
    }
}

#[async_trait::async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, event: &EventNotification) -> Result<()> {
        let webhook_url = self
            .config
            .webhook_url
            .as_ref()
            .ok_or_else(|| anyhow!("Slack webhook URL not configured"))?;

        let message = self.build_message(event);
        debug!("Sending Slack notification: {}", event.title());

        let response = self
            .client
            .post(webhook_url)
            .json(&message)
            .send()
            .await
            .context("Failed to send Slack notification")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response".to_string());
            return Err(anyhow!("Slack API returned error {}: {}", status, body));
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "slack"
    }
}
