//! Update providers and the aggregator that fans events out to them.
//!
//! Every provider owns an [`EventQueue`]: a bounded channel drained by a
//! single consumer, so events for one provider are handled in submission
//! order. Plans that need votes are parked in the [`ApprovalManager`] and
//! resubmitted once approved.

pub mod git;
pub mod helm;
pub mod kubernetes;

pub use git::GitProvider;
pub use helm::HelmProvider;
pub use kubernetes::KubernetesProvider;

use crate::approval::{Approval, ApprovalError, ApprovalManager, ApprovalStatus, DEFAULT_DEADLINE_HOURS};
use crate::metrics;
use crate::models::{Event, TrackedImage};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of every provider's event queue. A full queue blocks submitters.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider {0} is stopped")]
    Stopped(String),

    #[error("provider {0} is already running")]
    AlreadyRunning(String),

    #[error("unknown provider {0}")]
    UnknownProvider(String),
}

pub struct EventQueue {
    name: &'static str,
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    stop: watch::Sender<bool>,
}

impl EventQueue {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (stop, _) = watch::channel(false);
        Self {
            name,
            tx,
            rx: Mutex::new(Some(rx)),
            stop,
        }
    }

    pub async fn submit(&self, event: Event) -> Result<(), ProviderError> {
        if *self.stop.borrow() {
            return Err(ProviderError::Stopped(self.name.to_string()));
        }
        self.tx
            .send(event)
            .await
            .map_err(|_| ProviderError::Stopped(self.name.to_string()))?;
        metrics::EVENTS_SUBMITTED.with_label_values(&[self.name]).inc();
        Ok(())
    }

    /// Feeds queued events to `handler` one at a time until [`EventQueue::stop`].
    ///
    /// The event being handled when stop is called runs to completion;
    /// events still queued are dropped.
    pub async fn run<F, Fut>(&self, mut handler: F) -> Result<(), ProviderError>
    where
        F: FnMut(Event) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ProviderError::AlreadyRunning(self.name.to_string()))?;
        let mut stop = self.stop.subscribe();

        info!("Provider {} started", self.name);

        loop {
            if *stop.borrow_and_update() {
                break;
            }

            tokio::select! {
                biased;
                _ = stop.changed() => break,
                event = rx.recv() => match event {
                    Some(event) => handler(event).await,
                    None => break,
                },
            }
        }

        rx.close();
        info!("Provider {} got shutdown signal, stopping...", self.name);
        Ok(())
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }
}

/// What to do with a plan after consulting the approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Execute,
    Hold,
    Skip,
}

/// Approval settings of one plan.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub identifier: String,
    pub votes_required: u32,
    pub deadline_hours: i64,
    pub current_version: String,
    pub new_version: String,
    pub message: String,
}

impl ApprovalRequest {
    /// A non-positive deadline falls back to [`DEFAULT_DEADLINE_HOURS`].
    pub fn new(
        provider: &str,
        target: &str,
        current: &str,
        new: &str,
        votes_required: u32,
        deadline_hours: i64,
    ) -> Self {
        Self {
            identifier: Approval::identifier_for(provider, target, current, new),
            votes_required,
            deadline_hours: if deadline_hours > 0 {
                deadline_hours
            } else {
                DEFAULT_DEADLINE_HOURS
            },
            current_version: current.to_string(),
            new_version: new.to_string(),
            message: String::new(),
        }
    }

    /// Reads vote count and deadline from `approvals` and `approvalDeadline`.
    pub fn from_meta(
        provider: &str,
        target: &str,
        current: &str,
        new: &str,
        approvals: Option<&str>,
        deadline: Option<&str>,
    ) -> Self {
        Self::new(
            provider,
            target,
            current,
            new,
            approvals.and_then(|v| v.trim().parse().ok()).unwrap_or(0),
            deadline.and_then(|v| v.trim().parse().ok()).unwrap_or(0),
        )
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

pub async fn check_approval(
    manager: &ApprovalManager,
    provider: &str,
    event: &Event,
    request: &ApprovalRequest,
) -> Gate {
    if request.votes_required == 0 {
        return Gate::Execute;
    }

    let existing = match manager.get(&request.identifier).await {
        Ok(approval) => Some(approval),
        Err(ApprovalError::NotFound(_)) => None,
        Err(e) => {
            error!("Failed to read approval {}: {}", request.identifier, e);
            return Gate::Skip;
        },
    };

    match existing.as_ref().map(Approval::status) {
        Some(ApprovalStatus::Approved) => return Gate::Execute,
        Some(ApprovalStatus::Pending) => {
            debug!("Approval {} still pending", request.identifier);
            return Gate::Hold;
        },
        Some(ApprovalStatus::Rejected) => {
            info!("Update {} was rejected, skipping", request.identifier);
            return Gate::Skip;
        },
        Some(ApprovalStatus::Expired) | None => {},
    }

    let approval = Approval::new(
        provider,
        &request.identifier,
        event.clone(),
        request.votes_required,
        request.deadline_hours,
    )
    .with_versions(&request.current_version, &request.new_version)
    .with_message(&request.message);

    match manager.create(approval).await {
        Ok(_) | Err(ApprovalError::AlreadyExists(_)) => Gate::Hold,
        Err(e) => {
            error!("Failed to create approval {}: {}", request.identifier, e);
            Gate::Skip
        },
    }
}

/// Drops the approval of a plan that has been applied.
pub async fn approval_complete(manager: &ApprovalManager, request: &ApprovalRequest) {
    if request.votes_required == 0 {
        return;
    }
    if let Err(e) = manager.delete(&request.identifier).await {
        warn!(
            "Failed to remove approval {} after update: {}",
            request.identifier, e
        );
    }
}

/// One enabled provider.
#[derive(Clone)]
pub enum ProviderHandle {
    Kubernetes(Arc<KubernetesProvider>),
    Helm(Arc<HelmProvider>),
    Git(Arc<GitProvider>),
}

impl ProviderHandle {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderHandle::Kubernetes(p) => p.name(),
            ProviderHandle::Helm(p) => p.name(),
            ProviderHandle::Git(p) => p.name(),
        }
    }

    pub async fn submit(&self, event: Event) -> Result<(), ProviderError> {
        match self {
            ProviderHandle::Kubernetes(p) => p.submit(event).await,
            ProviderHandle::Helm(p) => p.submit(event).await,
            ProviderHandle::Git(p) => p.submit(event).await,
        }
    }

    pub async fn tracked_images(&self) -> Vec<TrackedImage> {
        match self {
            ProviderHandle::Kubernetes(p) => p.tracked_images(),
            ProviderHandle::Helm(p) => p.tracked_images().await,
            ProviderHandle::Git(p) => p.tracked_images(),
        }
    }

    pub async fn start(&self) -> Result<(), ProviderError> {
        match self {
            ProviderHandle::Kubernetes(p) => p.start().await,
            ProviderHandle::Helm(p) => p.start().await,
            ProviderHandle::Git(p) => p.start().await,
        }
    }

    pub fn stop(&self) {
        match self {
            ProviderHandle::Kubernetes(p) => p.stop(),
            ProviderHandle::Helm(p) => p.stop(),
            ProviderHandle::Git(p) => p.stop(),
        }
    }
}

/// Fan-out over every enabled provider.
#[derive(Clone, Default)]
pub struct Providers {
    providers: Vec<ProviderHandle>,
}

impl Providers {
    pub fn new(providers: Vec<ProviderHandle>) -> Self {
        Self { providers }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(ProviderHandle::name).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Submits to every provider. Failures are logged per provider.
    pub async fn submit(&self, event: Event) {
        for provider in &self.providers {
            if let Err(e) = provider.submit(event.clone()).await {
                error!(
                    "Failed to submit {} to provider {}: {}",
                    event.repository,
                    provider.name(),
                    e
                );
            }
        }
    }

    pub async fn submit_to(&self, name: &str, event: Event) -> Result<(), ProviderError> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))?;
        provider.submit(event).await
    }

    pub async fn tracked_images(&self) -> Vec<TrackedImage> {
        let mut images = Vec::new();
        for provider in &self.providers {
            images.extend(provider.tracked_images().await);
        }
        images
    }

    /// Spawns every provider loop.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.providers
            .iter()
            .cloned()
            .map(|provider| {
                tokio::spawn(async move {
                    if let Err(e) = provider.start().await {
                        error!("Provider {} failed: {}", provider.name(), e);
                    }
                })
            })
            .collect()
    }

    pub fn stop(&self) {
        for provider in &self.providers {
            provider.stop();
        }
    }

    /// Resubmits stored approvals that were approved but never executed,
    /// e.g. before a restart. Returns how many were resubmitted.
    pub async fn resubmit_stored_approved(&self, approvals: &ApprovalManager) -> usize {
        let stored = match approvals.list().await {
            Ok(stored) => stored,
            Err(e) => {
                error!("Failed to list stored approvals: {}", e);
                return 0;
            },
        };

        let mut resubmitted = 0;
        for approval in stored
            .into_iter()
            .filter(|a| a.status() == ApprovalStatus::Approved)
        {
            info!(
                "Approval {} was approved earlier, resubmitting to {}",
                approval.identifier, approval.provider
            );
            match self.submit_to(&approval.provider, approval.event.clone()).await {
                Ok(()) => resubmitted += 1,
                Err(e) => error!(
                    "Failed to resubmit approved update {}: {}",
                    approval.identifier, e
                ),
            }
        }
        resubmitted
    }

    /// Resubmits the event of every approved approval to its provider.
    pub async fn resubmit_approved(
        self,
        mut approved: broadcast::Receiver<Approval>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let approval = tokio::select! {
                received = approved.recv() => match received {
                    Ok(approval) => approval,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} approved approvals", n);
                        continue;
                    },
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = shutdown.changed() => return,
            };

            info!(
                "Approval {} reached its votes, resubmitting to {}",
                approval.identifier, approval.provider
            );
            if let Err(e) = self
                .submit_to(&approval.provider, approval.event.clone())
                .await
            {
                error!(
                    "Failed to resubmit approved update {}: {}",
                    approval.identifier, e
                );
            }
        }
    }
}
