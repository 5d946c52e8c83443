//! Multi-vote approval gate in front of update plans.
//!
//! An approval is keyed by its identifier and moves from `Pending` to one of
//! the terminal states `Approved`, `Rejected` or `Expired`. Mutations on one
//! identifier are serialized through a keyed lock; different identifiers
//! proceed concurrently.

use crate::metrics;
use crate::models::Event;
use crate::notifications::{EventNotification, Level, NotificationType, Sender};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedMutexGuard, broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

pub mod api;
pub mod command;
pub mod store;

pub use store::{ApprovalStore, ConfigMapStore, MemoryStore, StoreError};

pub const DEFAULT_DEADLINE_HOURS: i64 = 24;
pub const DEFAULT_EXPIRY_INTERVAL: Duration = Duration::from_secs(60);
const APPROVED_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval {0} already exists")]
    AlreadyExists(String),

    #[error("approval {0} not found")]
    NotFound(String),

    #[error("{voter} has already voted on approval {identifier}")]
    AlreadyVoted { identifier: String, voter: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    /// Name of the provider that owns the held plan
    pub provider: String,
    pub identifier: String,
    /// Event to resubmit once approved
    pub event: Event,
    #[serde(default)]
    pub message: String,
    pub current_version: String,
    pub new_version: String,
    pub votes_required: u32,
    #[serde(default)]
    pub votes_received: u32,
    #[serde(default)]
    pub voters: Vec<String>,
    #[serde(default)]
    pub rejected: bool,
    #[serde(default)]
    pub expired: bool,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Approval {
    pub fn new(
        provider: impl Into<String>,
        identifier: impl Into<String>,
        event: Event,
        votes_required: u32,
        deadline_hours: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            provider: provider.into(),
            identifier: identifier.into(),
            event,
            message: String::new(),
            current_version: String::new(),
            new_version: String::new(),
            votes_required,
            votes_received: 0,
            voters: Vec::new(),
            rejected: false,
            expired: false,
            deadline: now + ChronoDuration::hours(deadline_hours),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_versions(mut self, current: impl Into<String>, new: impl Into<String>) -> Self {
        self.current_version = current.into();
        self.new_version = new.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Composite key of an approval: `provider/target:current->new`.
    pub fn identifier_for(provider: &str, target: &str, current: &str, new: &str) -> String {
        format!("{}/{}:{}->{}", provider, target, current, new)
    }

    pub fn status(&self) -> ApprovalStatus {
        self.status_at(Utc::now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> ApprovalStatus {
        if self.rejected {
            ApprovalStatus::Rejected
        } else if self.votes_received >= self.votes_required {
            ApprovalStatus::Approved
        } else if self.expired || now >= self.deadline {
            ApprovalStatus::Expired
        } else {
            ApprovalStatus::Pending
        }
    }

    /// Past its deadline with too few votes and not yet marked expired.
    fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.expired
            && !self.rejected
            && self.votes_received < self.votes_required
            && now >= self.deadline
    }
}

/// Per-identifier async locks. Idle entries are pruned on acquisition.
#[derive(Default)]
struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.retain(|_, lock| Arc::strong_count(lock) > 1);
            inner.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct ApprovalManager {
    store: Arc<dyn ApprovalStore>,
    sender: Arc<dyn Sender>,
    locks: KeyedLocks,
    approved: broadcast::Sender<Approval>,
}

impl ApprovalManager {
    pub fn new(store: Arc<dyn ApprovalStore>, sender: Arc<dyn Sender>) -> Self {
        let (approved, _) = broadcast::channel(APPROVED_CHANNEL_CAPACITY);
        Self {
            store,
            sender,
            locks: KeyedLocks::default(),
            approved,
        }
    }

    /// Receives every approval that reaches its vote threshold.
    pub fn subscribe_approved(&self) -> broadcast::Receiver<Approval> {
        self.approved.subscribe()
    }

    pub async fn create(&self, mut approval: Approval) -> Result<Approval, ApprovalError> {
        let _guard = self.locks.lock(&approval.identifier).await;

        if let Some(existing) = self.store.get(&approval.identifier).await? {
            if existing.status() == ApprovalStatus::Pending {
                return Err(ApprovalError::AlreadyExists(approval.identifier));
            }
            debug!(
                "Replacing {} approval {}",
                existing.status(),
                existing.identifier
            );
        }

        let now = Utc::now();
        approval.votes_received = 0;
        approval.voters.clear();
        approval.rejected = false;
        approval.expired = false;
        approval.created_at = now;
        approval.updated_at = now;

        self.store.put(&approval).await?;
        metrics::APPROVALS_CREATED.inc();
        info!(
            "Created approval {} requiring {} votes",
            approval.identifier, approval.votes_required
        );

        self.sender.send(
            EventNotification::new(NotificationType::ApprovalRequired, Level::Info)
                .with_resource("approval", &approval.identifier, &approval.identifier)
                .with_message(format!(
                    "{} Approval required: {} vote(s). Reply 'approve {}' or 'reject {}'.",
                    approval.message,
                    approval.votes_required,
                    approval.identifier,
                    approval.identifier
                ))
                .with_metadata("provider", &approval.provider)
                .with_metadata("votesRequired", approval.votes_required.to_string()),
        );

        Ok(approval)
    }

    pub async fn vote(
        &self,
        identifier: &str,
        voter: &str,
        approve: bool,
    ) -> Result<Approval, ApprovalError> {
        let _guard = self.locks.lock(identifier).await;

        let mut approval = self
            .store
            .get(identifier)
            .await?
            .filter(|a| a.status() == ApprovalStatus::Pending)
            .ok_or_else(|| ApprovalError::NotFound(identifier.to_string()))?;

        if approval.voters.iter().any(|v| v == voter) {
            return Err(ApprovalError::AlreadyVoted {
                identifier: identifier.to_string(),
                voter: voter.to_string(),
            });
        }

        approval.voters.push(voter.to_string());
        approval.updated_at = Utc::now();
        if approve {
            approval.votes_received += 1;
        } else {
            approval.rejected = true;
        }

        self.store.put(&approval).await?;
        metrics::APPROVAL_VOTES
            .with_label_values(&[if approve { "approve" } else { "reject" }])
            .inc();

        let status = approval.status();
        info!(
            "Approval {} received {} vote from {}, status {} ({}/{})",
            identifier,
            if approve { "approve" } else { "reject" },
            voter,
            status,
            approval.votes_received,
            approval.votes_required
        );

        let level = match status {
            ApprovalStatus::Approved => Level::Success,
            ApprovalStatus::Rejected => Level::Warn,
            _ => Level::Info,
        };
        self.sender.send(
            EventNotification::new(NotificationType::ApprovalUpdate, level)
                .with_resource("approval", identifier, identifier)
                .with_message(format!(
                    "Approval {} is {} ({}/{} votes, last vote by {})",
                    identifier, status, approval.votes_received, approval.votes_required, voter
                ))
                .with_metadata("provider", &approval.provider),
        );

        if status == ApprovalStatus::Approved && self.approved.send(approval.clone()).is_err() {
            debug!("No subscribers for approved approval {}", identifier);
        }

        Ok(approval)
    }

    pub async fn approve(&self, identifier: &str, voter: &str) -> Result<Approval, ApprovalError> {
        self.vote(identifier, voter, true).await
    }

    pub async fn reject(&self, identifier: &str, voter: &str) -> Result<Approval, ApprovalError> {
        self.vote(identifier, voter, false).await
    }

    pub async fn get(&self, identifier: &str) -> Result<Approval, ApprovalError> {
        self.store
            .get(identifier)
            .await?
            .ok_or_else(|| ApprovalError::NotFound(identifier.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Approval>, ApprovalError> {
        Ok(self.store.list().await?)
    }

    pub async fn delete(&self, identifier: &str) -> Result<(), ApprovalError> {
        let _guard = self.locks.lock(identifier).await;
        self.store.delete(identifier).await?;
        Ok(())
    }

    /// Marks overdue pending approvals as expired. Returns how many expired.
    pub async fn expire_stale(&self) -> Result<usize, ApprovalError> {
        let now = Utc::now();
        let overdue: Vec<String> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|a| a.is_overdue(now))
            .map(|a| a.identifier)
            .collect();

        let mut expired = 0;
        for identifier in overdue {
            let _guard = self.locks.lock(&identifier).await;

            let mut approval = match self.store.get(&identifier).await? {
                Some(a) if a.is_overdue(now) => a,
                _ => continue,
            };

            approval.expired = true;
            approval.updated_at = now;
            self.store.put(&approval).await?;
            metrics::APPROVALS_EXPIRED.inc();
            expired += 1;

            info!("Approval {} expired", identifier);
            self.sender.send(
                EventNotification::new(NotificationType::ApprovalUpdate, Level::Warn)
                    .with_resource("approval", &identifier, &identifier)
                    .with_message(format!(
                        "Approval {} expired with {}/{} votes",
                        identifier, approval.votes_received, approval.votes_required
                    ))
                    .with_metadata("provider", &approval.provider),
            );
        }

        Ok(expired)
    }

    /// Sweeps for expired approvals every `interval` until shutdown.
    pub async fn start_expiry_service(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting approval expiry service, interval {:?}", interval);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.expire_stale().await {
                        Ok(0) => {},
                        Ok(n) => debug!("Expired {} approvals", n),
                        Err(e) => error!("Approval expiry sweep failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Approval expiry service stopped");
                    return;
                }
            }
        }
    }
}
