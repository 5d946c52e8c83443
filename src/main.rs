use anyhow::{Context, Result};
use bowline::approval::{self, ApprovalManager, ApprovalStore, ConfigMapStore, MemoryStore};
use bowline::config::{ApprovalStoreKind, Config, DEFAULT_NAMESPACE};
use bowline::gitrepo::{self, ChartRenderer, GitRepo};
use bowline::k8s::{self, KubeImplementer, ResourceCache};
use bowline::metrics;
use bowline::notifications::{NotificationManager, Sender};
use bowline::provider::helm::HelmCli;
use bowline::provider::{GitProvider, HelmProvider, KubernetesProvider, ProviderHandle, Providers};
use bowline::registry::{CredentialsHelper, OciRegistryClient};
use bowline::trigger::{self, EventSink, PollTrigger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let debug = bowline::config::parse_bool(std::env::var("DEBUG").ok(), false);
    let default_filter = if debug {
        "bowline=debug,kube=info"
    } else {
        "bowline=info,kube=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Bowline - automated workload updates");

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let namespace = std::env::var("BOWLINE_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
    let config = Config::load(client.clone(), &namespace).await;

    let (shutdown_tx, shutdown) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    tasks.push(metrics::start_metrics_server(config.metrics_addr).await?);

    let sender: Arc<dyn Sender> = Arc::new(NotificationManager::new(config.notifications.clone()));

    let store: Arc<dyn ApprovalStore> = match config.approval_store {
        ApprovalStoreKind::Memory => Arc::new(MemoryStore::default()),
        ApprovalStoreKind::ConfigMap => Arc::new(ConfigMapStore::new(client.clone(), &config.namespace)),
    };
    let approvals = Arc::new(ApprovalManager::new(store, sender.clone()));

    let mut handles = Vec::new();

    if config.kubernetes_provider {
        let cache = Arc::new(ResourceCache::new());
        tasks.extend(k8s::watch::watch_workloads(
            client.clone(),
            cache.clone(),
            shutdown.clone(),
        ));
        handles.push(ProviderHandle::Kubernetes(Arc::new(KubernetesProvider::new(
            cache,
            Arc::new(KubeImplementer::new(client.clone())),
            sender.clone(),
            approvals.clone(),
        ))));
    }

    if config.helm_provider {
        handles.push(ProviderHandle::Helm(Arc::new(HelmProvider::new(
            Arc::new(HelmCli::new(&config.helm)),
            sender.clone(),
            approvals.clone(),
        ))));
    }

    if let Some(git) = &config.git {
        let cache = Arc::new(ResourceCache::new());
        let repo = Arc::new(GitRepo::new(git));
        tasks.push(gitrepo::start_repo_sync(
            repo.clone(),
            ChartRenderer::new(&config.helm.binary),
            cache.clone(),
            git.sync_interval,
            shutdown.clone(),
        ));
        handles.push(ProviderHandle::Git(Arc::new(GitProvider::new(
            cache,
            repo,
            sender.clone(),
            approvals.clone(),
        ))));
    }

    let providers = Providers::new(handles);
    if providers.is_empty() {
        warn!("No providers enabled, events will be dropped");
    }
    info!("Enabled providers: {:?}", providers.names());
    tasks.extend(providers.start());

    let approved = approvals.subscribe_approved();
    let resubmitted = providers.resubmit_stored_approved(&approvals).await;
    if resubmitted > 0 {
        info!("Resubmitted {} stored approved updates", resubmitted);
    }
    tasks.push(tokio::spawn(
        providers
            .clone()
            .resubmit_approved(approved, shutdown.clone()),
    ));
    tasks.push(tokio::spawn(
        approvals
            .clone()
            .start_expiry_service(config.approval_expiry_interval, shutdown.clone()),
    ));

    if config.poll {
        let credentials = Arc::new(CredentialsHelper::new(
            Some(client.clone()),
            config.docker_registry_cfg.clone(),
        ));
        let poll = Arc::new(PollTrigger::new(
            providers.clone(),
            Arc::new(OciRegistryClient::new()),
            credentials,
        ));
        tasks.push(tokio::spawn(poll.start(shutdown.clone())));
    }

    let sink: Arc<dyn EventSink> = Arc::new(providers.clone());
    tasks.push(
        trigger::webhook::start_webhook_server(
            config.http_addr,
            sink,
            approval::api::router(approvals.clone()),
            shutdown.clone(),
        )
        .await?,
    );

    info!("Bowline is running");

    shutdown_signal().await;
    info!("Shutdown signal received, stopping...");
    shutdown_tx.send_replace(true);
    providers.stop();

    let drain = futures::future::join_all(tasks);
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!(
            "Tasks still running after {}, exiting",
            humantime::format_duration(SHUTDOWN_GRACE)
        );
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
