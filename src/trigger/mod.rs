//! Event sources: registry polling and inbound webhooks.

pub mod poll;
pub mod webhook;

pub use poll::{PollTrigger, Schedule, ScheduleError};

use crate::models::Event;
use crate::provider::Providers;

/// Destination of trigger events.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn submit(&self, event: Event);
}

#[async_trait::async_trait]
impl EventSink for Providers {
    async fn submit(&self, event: Event) {
        Providers::submit(self, event).await
    }
}
