use super::{GenericResource, ResourceCache};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::CronJob;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Starts one watcher per workload kind, feeding `cache` until shutdown.
pub fn watch_workloads(
    client: Client,
    cache: Arc<ResourceCache>,
    shutdown: Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(watch_kind::<Deployment>(
            Api::all(client.clone()),
            "deployment",
            cache.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(watch_kind::<StatefulSet>(
            Api::all(client.clone()),
            "statefulset",
            cache.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(watch_kind::<DaemonSet>(
            Api::all(client.clone()),
            "daemonset",
            cache.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(watch_kind::<CronJob>(
            Api::all(client),
            "cronjob",
            cache,
            shutdown,
        )),
    ]
}

async fn watch_kind<K>(
    api: Api<K>,
    kind: &'static str,
    cache: Arc<ResourceCache>,
    mut shutdown: Receiver<bool>,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Default,
    GenericResource: From<K>,
{
    loop {
        let mut stream = watcher(api.clone(), watcher::Config::default())
            .default_backoff()
            .boxed();
        let mut listing: Vec<GenericResource> = Vec::new();

        info!("Watching {} resources", kind);

        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                _ = shutdown.changed() => {
                    info!("Stopped watching {} resources", kind);
                    return;
                }
            };

            match event {
                Some(Ok(watcher::Event::Apply(obj))) => cache.add(obj.into()),
                Some(Ok(watcher::Event::Delete(obj))) => {
                    let resource = GenericResource::from(obj);
                    debug!("{} deleted", resource);
                    cache.delete(&resource.identifier);
                },
                Some(Ok(watcher::Event::Init)) => listing.clear(),
                Some(Ok(watcher::Event::InitApply(obj))) => listing.push(obj.into()),
                Some(Ok(watcher::Event::InitDone)) => {
                    debug!("Listed {} {} resources", listing.len(), kind);
                    cache.replace_kind(kind, std::mem::take(&mut listing));
                },
                Some(Err(e)) => error!("{} watcher error: {}", kind, e),
                None => break,
            }
        }

        warn!("{} watcher stream ended, restarting in 5 seconds...", kind);
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
