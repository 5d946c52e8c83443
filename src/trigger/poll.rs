//! Scheduled registry checks for images whose trigger is `poll`.

use super::EventSink;
use crate::metrics;
use crate::models::{Event, Repository, TrackedImage, TriggerType};
use crate::policy::{Policy, parse_version};
use crate::provider::Providers;
use crate::registry::{CredentialsHelper, Opts, RegistryClient};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const DEFAULT_POLL_SCHEDULE: &str = "@every 1m";
/// How often the job set is rebuilt from the providers' tracked images.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(30);
const TICK: Duration = Duration::from_secs(1);
const EVERY_PREFIX: &str = "@every";
pub const POLL_TRIGGER_NAME: &str = "poll";

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid duration in schedule '{0}': {1}")]
    Duration(String, humantime::DurationError),

    #[error("invalid cron schedule '{0}': {1}")]
    Cron(String, cron::error::Error),
}

#[derive(Debug, Clone)]
pub enum Schedule {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    /// Accepts `@every <duration>`, `@hourly`-style shorthands and cron
    /// expressions. Five-field expressions run at second zero.
    pub fn parse(raw: &str) -> Result<Self, ScheduleError> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix(EVERY_PREFIX) {
            let duration = humantime::parse_duration(rest.trim())
                .map_err(|e| ScheduleError::Duration(raw.to_string(), e))?;
            return Ok(Schedule::Every(duration));
        }

        let expression = if raw.split_whitespace().count() == 5 {
            format!("0 {}", raw)
        } else {
            raw.to_string()
        };
        cron::Schedule::from_str(&expression)
            .map(|s| Schedule::Cron(Box::new(s)))
            .map_err(|e| ScheduleError::Cron(raw.to_string(), e))
    }

    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Every(interval) => chrono::Duration::from_std(*interval)
                .ok()
                .map(|d| now + d),
            Schedule::Cron(schedule) => schedule.after(&now).next(),
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Every(Duration::from_secs(60))
    }
}

/// Highest tag in `tags` that `policy` accepts as an update from `current`.
pub fn select_tag<'a>(policy: &Policy, current: &str, tags: &'a [String]) -> Option<&'a str> {
    tags.iter()
        .filter(|tag| policy.should_update(current, tag).unwrap_or(false))
        .filter_map(|tag| parse_version(tag).ok().map(|v| (v, tag)))
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, tag)| tag.as_str())
}

struct Job {
    image: TrackedImage,
    schedule: Schedule,
    next_run: DateTime<Utc>,
    last_digest: Option<String>,
    last_submitted: Option<String>,
}

impl Job {
    fn new(image: TrackedImage) -> Self {
        let schedule = Schedule::parse(&image.poll_schedule).unwrap_or_else(|e| {
            warn!("{}, using {}", e, DEFAULT_POLL_SCHEDULE);
            Schedule::default()
        });
        Self {
            image,
            schedule,
            next_run: Utc::now(),
            last_digest: None,
            last_submitted: None,
        }
    }

    fn key(image: &TrackedImage) -> String {
        format!("{}|{}", image.image.remote(), image.policy.name())
    }
}

pub struct PollTrigger {
    providers: Providers,
    sink: Arc<dyn EventSink>,
    registry: Arc<dyn RegistryClient>,
    credentials: Arc<CredentialsHelper>,
    jobs: Mutex<HashMap<String, Job>>,
}

impl PollTrigger {
    pub fn new(
        providers: Providers,
        registry: Arc<dyn RegistryClient>,
        credentials: Arc<CredentialsHelper>,
    ) -> Self {
        let sink: Arc<dyn EventSink> = Arc::new(providers.clone());
        Self::with_sink(providers, sink, registry, credentials)
    }

    pub fn with_sink(
        providers: Providers,
        sink: Arc<dyn EventSink>,
        registry: Arc<dyn RegistryClient>,
        credentials: Arc<CredentialsHelper>,
    ) -> Self {
        Self {
            providers,
            sink,
            registry,
            credentials,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Rebuilds the job set from `images`, keeping the state of jobs that
    /// are still tracked.
    pub async fn sync(&self, images: Vec<TrackedImage>) {
        let wanted: HashMap<String, TrackedImage> = images
            .into_iter()
            .filter(|i| i.trigger == TriggerType::Poll && !i.policy.is_none())
            .map(|i| (Job::key(&i), i))
            .collect();

        let mut jobs = self.jobs.lock().await;
        jobs.retain(|key, _| wanted.contains_key(key));
        for (key, image) in wanted {
            jobs.entry(key).or_insert_with(|| {
                info!("Polling {} on schedule {}", image.image.remote(), image.poll_schedule);
                Job::new(image)
            });
        }
        metrics::POLL_JOBS.set(jobs.len() as i64);
    }

    /// Runs every job that is due at `now`.
    pub async fn run_due(&self, now: DateTime<Utc>) {
        let mut jobs = self.jobs.lock().await;
        for job in jobs.values_mut().filter(|j| j.next_run <= now) {
            match self.poll(job).await {
                Ok(Some(event)) => {
                    info!("Poll found {} for {}", event.repository, job.image.image.remote());
                    self.sink.submit(event).await;
                },
                Ok(None) => {},
                Err(e) => error!("Failed to poll {}: {:#}", job.image.image.remote(), e),
            }
            job.next_run = job
                .schedule
                .next_after(now)
                .unwrap_or_else(|| now + chrono::Duration::seconds(60));
        }
    }

    async fn poll(&self, job: &mut Job) -> Result<Option<Event>> {
        let image = &job.image.image;
        let opts = Opts::new(image.registry(), image.short_name(), image.tag())
            .with_credentials(self.credentials.get(&job.image).await);

        metrics::REGISTRIES_SCANNED
            .with_label_values(&[image.registry(), image.short_name()])
            .inc();

        if let Policy::Semver(_) = job.image.policy {
            let tags = self.registry.tags(&opts).await?;
            let Some(best) = select_tag(&job.image.policy, image.tag(), &tags) else {
                debug!("No newer tag for {} among {} tags", image.remote(), tags.len());
                return Ok(None);
            };
            if job.last_submitted.as_deref() == Some(best) {
                return Ok(None);
            }
            job.last_submitted = Some(best.to_string());
            let repository = Repository::new(image.repository(), best).with_old_tag(image.tag());
            return Ok(Some(Event::new(repository, POLL_TRIGGER_NAME)));
        }

        let digest = self.registry.digest(&opts).await?;
        match job.last_digest.replace(digest.clone()) {
            None => {
                debug!("First digest for {}: {}", image.remote(), digest);
                Ok(None)
            },
            Some(previous) if previous == digest => Ok(None),
            Some(_) => {
                let repository =
                    Repository::new(image.repository(), image.tag()).with_digest(digest);
                Ok(Some(Event::new(repository, POLL_TRIGGER_NAME)))
            },
        }
    }

    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting poll trigger");

        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_sync: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if last_sync.is_none_or(|t| t.elapsed() >= SYNC_INTERVAL) {
                        self.sync(self.providers.tracked_images().await).await;
                        last_sync = Some(Instant::now());
                    }
                    self.run_due(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    info!("Poll trigger stopped");
                    return;
                }
            }
        }
    }
}
