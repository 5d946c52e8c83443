use super::{ChartRenderer, GitRepo, render};
use crate::k8s::ResourceCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Keeps `cache` filled with the workloads the repository's chart renders,
/// refreshing every `interval` until shutdown.
pub fn start_repo_sync(
    repo: Arc<GitRepo>,
    renderer: ChartRenderer,
    cache: Arc<ResourceCache>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Syncing manifest repository every {}",
            humantime::format_duration(interval)
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = shutdown.changed() => {
                    info!("Manifest repository sync got shutdown signal, stopping...");
                    return;
                },
            }

            match repo.sync_and_render(&renderer).await {
                Ok(manifests) => {
                    let resources = render::workloads(&manifests);
                    debug!(
                        "Rendered {} manifests, {} workloads",
                        manifests.len(),
                        resources.len()
                    );
                    cache.replace_all(resources);
                },
                Err(e) => error!("Failed to sync manifest repository: {}", e),
            }
        }
    })
}
