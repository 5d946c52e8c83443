use crate::image::DEFAULT_DOCKER_REGISTRY;
use crate::notifications::NotificationConfig;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

pub const CONFIGMAP_NAME: &str = "bowline-config";
pub const DEFAULT_NAMESPACE: &str = "bowline";

/// Key lookup used to build configuration. Tests pass a map, the binary the
/// process environment.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStoreKind {
    Memory,
    ConfigMap,
}

#[derive(Debug, Clone)]
pub struct GitConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub branch: String,
    pub chart_path: String,
    pub local_path: PathBuf,
    pub sync_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct HelmConfig {
    pub binary: String,
    /// Repository charts are upgraded from. Unset means the release's own chart reference.
    pub chart_repository: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub debug: bool,
    pub namespace: String,
    pub poll: bool,
    pub kubernetes_provider: bool,
    pub helm_provider: bool,
    pub helm: HelmConfig,
    pub git: Option<GitConfig>,
    pub approval_store: ApprovalStoreKind,
    pub approval_expiry_interval: Duration,
    pub http_addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    /// Default dockerconfigjson used for every registry
    pub docker_registry_cfg: Option<String>,
    pub default_registry: String,
    pub notifications: NotificationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(&|_| None)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Self {
        let git = lookup("REPO_URL")
            .filter(|url| !url.trim().is_empty())
            .map(|url| GitConfig {
                url,
                username: lookup("REPO_USERNAME").filter(|v| !v.is_empty()),
                password: lookup("REPO_PASSWORD").filter(|v| !v.is_empty()),
                branch: lookup("REPO_BRANCH").unwrap_or_else(|| "master".to_string()),
                chart_path: lookup("REPO_CHART_PATH").unwrap_or_default(),
                local_path: lookup("REPO_LOCAL_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp/bowline-repo")),
                sync_interval: Duration::from_secs(parse_u64(
                    lookup("REPO_SYNC_INTERVAL_SECS"),
                    30,
                )),
            });

        let approval_store = match lookup("APPROVAL_STORE").as_deref() {
            Some("memory") => ApprovalStoreKind::Memory,
            Some("configmap") | None => ApprovalStoreKind::ConfigMap,
            Some(other) => {
                warn!("Unknown approval store '{}', using configmap", other);
                ApprovalStoreKind::ConfigMap
            },
        };

        Self {
            debug: parse_bool(lookup("DEBUG"), false),
            namespace: lookup("BOWLINE_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            poll: parse_bool(lookup("POLL"), true),
            kubernetes_provider: parse_bool(lookup("KUBERNETES_PROVIDER"), true),
            helm_provider: parse_bool(lookup("HELM_PROVIDER"), false),
            helm: HelmConfig {
                binary: lookup("HELM_BINARY").unwrap_or_else(|| "helm".to_string()),
                chart_repository: lookup("HELM_CHART_REPOSITORY").filter(|v| !v.trim().is_empty()),
            },
            git,
            approval_store,
            approval_expiry_interval: Duration::from_secs(parse_u64(
                lookup("APPROVAL_EXPIRY_INTERVAL_SECS"),
                60,
            )),
            http_addr: parse_addr(lookup("HTTP_ADDR"), "0.0.0.0:9300"),
            metrics_addr: parse_addr(lookup("METRICS_ADDR"), "0.0.0.0:9090"),
            docker_registry_cfg: lookup("DOCKER_REGISTRY_CFG").filter(|v| !v.is_empty()),
            default_registry: DEFAULT_DOCKER_REGISTRY.to_string(),
            notifications: NotificationConfig::from_lookup(lookup),
        }
    }

    /// Environment first, then keys from the `bowline-config` ConfigMap.
    pub async fn load(client: Client, namespace: &str) -> Self {
        let config_maps: Api<ConfigMap> = Api::namespaced(client, namespace);
        let data = match config_maps.get_opt(CONFIGMAP_NAME).await {
            Ok(Some(cm)) => {
                info!(
                    "Loaded configuration overrides from ConfigMap {}/{}",
                    namespace, CONFIGMAP_NAME
                );
                cm.data.unwrap_or_default()
            },
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!(
                    "Failed to read ConfigMap {}/{}: {}. Using environment only.",
                    namespace, CONFIGMAP_NAME, e
                );
                BTreeMap::new()
            },
        };

        Self::from_lookup(&|key| std::env::var(key).ok().or_else(|| data.get(key).cloned()))
    }
}

pub fn parse_bool(value: Option<String>, default: bool) -> bool {
    value
        .and_then(|v| v.trim().to_lowercase().parse().ok())
        .unwrap_or(default)
}

pub fn parse_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_addr(value: Option<String>, default: &str) -> SocketAddr {
    let fallback = || {
        default
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 9300)))
    };
    match value {
        Some(raw) => raw.parse().unwrap_or_else(|e| {
            warn!("Invalid address '{}': {}, using {}", raw, e, default);
            fallback()
        }),
        None => fallback(),
    }
}
