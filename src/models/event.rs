use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// "This image:tag now exists" signal produced by a trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub name: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl Repository {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    pub fn with_old_tag(mut self, old_tag: impl Into<String>) -> Self {
        self.old_tag = Some(old_tag.into());
        self
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tag.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}:{}", self.name, self.tag)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub repository: Repository,
    pub created_at: DateTime<Utc>,
    pub trigger_name: String,
}

impl Event {
    pub fn new(repository: Repository, trigger_name: impl Into<String>) -> Self {
        Self {
            repository,
            created_at: Utc::now(),
            trigger_name: trigger_name.into(),
        }
    }
}

/// How a tracked image learns about new versions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    /// Push events delivered by webhooks
    #[default]
    Default,
    /// Scheduled registry checks
    Poll,
}

#[derive(Debug, Error)]
#[error("Invalid trigger: {0}")]
pub struct InvalidTrigger(String);

impl FromStr for TriggerType {
    type Err = InvalidTrigger;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "poll" => Ok(TriggerType::Poll),
            "" | "default" | "push" => Ok(TriggerType::Default),
            other => Err(InvalidTrigger(other.to_string())),
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerType::Default => f.write_str("default"),
            TriggerType::Poll => f.write_str("poll"),
        }
    }
}
