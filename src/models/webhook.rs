use crate::image;
use crate::models::{Event, Repository};
use serde::{Deserialize, Serialize};

/// Docker distribution notification envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryWebhook {
    pub events: Vec<RegistryEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEvent {
    pub action: String,
    pub target: Target,
    pub request: Option<Request>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    #[serde(rename = "mediaType")]
    pub media_type: Option<String>,
    pub digest: String,
    pub repository: String,
    pub tag: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub host: Option<String>,
    pub method: Option<String>,
    pub useragent: Option<String>,
}

impl RegistryWebhook {
    /// Converts tagged push actions into events, qualifying the repository
    /// with the registry host that sent the notification.
    pub fn into_events(self) -> Vec<Event> {
        self.events
            .into_iter()
            .filter(|e| e.action == "push")
            .filter_map(|e| {
                let tag = e.target.tag?;
                let host = e.request.and_then(|r| r.host).unwrap_or_default();
                let name = if host.is_empty()
                    || image::normalize_registry(&host) == image::DEFAULT_REGISTRY_HOSTNAME
                {
                    e.target.repository
                } else {
                    format!("{}/{}", host, e.target.repository)
                };
                Some(Event::new(
                    Repository::new(name, tag).with_digest(e.target.digest),
                    "registry-notification",
                ))
            })
            .collect()
    }
}

/// Docker Hub webhook format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerHubWebhook {
    pub push_data: PushData,
    pub repository: DockerHubRepository,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushData {
    pub tag: String,
    pub pushed_at: Option<i64>,
    pub pusher: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerHubRepository {
    pub repo_name: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl From<DockerHubWebhook> for Event {
    fn from(payload: DockerHubWebhook) -> Self {
        Event::new(
            Repository::new(payload.repository.repo_name, payload.push_data.tag),
            "dockerhub",
        )
    }
}

/// Minimal payload accepted by the native endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeWebhook {
    pub name: String,
    pub tag: String,
    #[serde(default)]
    pub digest: Option<String>,
}

impl From<NativeWebhook> for Event {
    fn from(payload: NativeWebhook) -> Self {
        let mut repository = Repository::new(payload.name, payload.tag);
        repository.digest = payload.digest;
        Event::new(repository, "native")
    }
}
