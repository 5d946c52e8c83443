use super::Approval;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const APPROVALS_CONFIGMAP: &str = "bowline-approvals";
const MAX_CONFLICT_RETRIES: usize = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Failed to encode approval: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Gave up writing {0} after {1} conflicting updates")]
    Conflict(String, usize),
}

/// Persistence for approvals. The manager serializes access per identifier,
/// so implementations only need single-record atomic writes.
#[async_trait::async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn get(&self, identifier: &str) -> Result<Option<Approval>, StoreError>;
    async fn put(&self, approval: &Approval) -> Result<(), StoreError>;
    async fn delete(&self, identifier: &str) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<Approval>, StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    approvals: RwLock<HashMap<String, Approval>>,
}

#[async_trait::async_trait]
impl ApprovalStore for MemoryStore {
    async fn get(&self, identifier: &str) -> Result<Option<Approval>, StoreError> {
        Ok(self.approvals.read().await.get(identifier).cloned())
    }

    async fn put(&self, approval: &Approval) -> Result<(), StoreError> {
        self.approvals
            .write()
            .await
            .insert(approval.identifier.clone(), approval.clone());
        Ok(())
    }

    async fn delete(&self, identifier: &str) -> Result<(), StoreError> {
        self.approvals.write().await.remove(identifier);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Approval>, StoreError> {
        Ok(self.approvals.read().await.values().cloned().collect())
    }
}

/// Stores every approval as a JSON entry of one ConfigMap.
///
/// Writes use the ConfigMap's resourceVersion for optimistic concurrency and
/// retry on conflict.
pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    name: String,
}

impl ConfigMapStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: APPROVALS_CONFIGMAP.to_string(),
        }
    }

    /// ConfigMap keys only allow `[-._a-zA-Z0-9]`.
    pub fn key(identifier: &str) -> String {
        URL_SAFE_NO_PAD.encode(identifier)
    }

    async fn data(&self) -> Result<BTreeMap<String, String>, StoreError> {
        Ok(self
            .api
            .get_opt(&self.name)
            .await?
            .and_then(|cm| cm.data)
            .unwrap_or_default())
    }

    async fn modify<F>(&self, apply: F) -> Result<(), StoreError>
    where
        F: Fn(&mut BTreeMap<String, String>),
    {
        for attempt in 1..=MAX_CONFLICT_RETRIES {
            let result = match self.api.get_opt(&self.name).await? {
                Some(mut cm) => {
                    let mut data = cm.data.take().unwrap_or_default();
                    apply(&mut data);
                    cm.data = Some(data);
                    self.api
                        .replace(&self.name, &PostParams::default(), &cm)
                        .await
                },
                None => {
                    let mut data = BTreeMap::new();
                    apply(&mut data);
                    let cm = ConfigMap {
                        metadata: ObjectMeta {
                            name: Some(self.name.clone()),
                            labels: Some(BTreeMap::from([(
                                "app.kubernetes.io/managed-by".to_string(),
                                "bowline".to_string(),
                            )])),
                            ..Default::default()
                        },
                        data: Some(data),
                        ..Default::default()
                    };
                    self.api.create(&PostParams::default(), &cm).await
                },
            };

            match result {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    debug!(
                        "Conflict writing ConfigMap {} (attempt {}/{})",
                        self.name, attempt, MAX_CONFLICT_RETRIES
                    );
                },
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Conflict(self.name.clone(), MAX_CONFLICT_RETRIES))
    }
}

#[async_trait::async_trait]
impl ApprovalStore for ConfigMapStore {
    async fn get(&self, identifier: &str) -> Result<Option<Approval>, StoreError> {
        match self.data().await?.get(&Self::key(identifier)) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, approval: &Approval) -> Result<(), StoreError> {
        let key = Self::key(&approval.identifier);
        let value = serde_json::to_string(approval)?;
        self.modify(|data| {
            data.insert(key.clone(), value.clone());
        })
        .await
    }

    async fn delete(&self, identifier: &str) -> Result<(), StoreError> {
        let key = Self::key(identifier);
        self.modify(|data| {
            data.remove(&key);
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Approval>, StoreError> {
        let mut approvals = Vec::new();
        for (key, raw) in self.data().await? {
            match serde_json::from_str(&raw) {
                Ok(approval) => approvals.push(approval),
                Err(e) => warn!("Skipping unreadable approval entry {}: {}", key, e),
            }
        }
        Ok(approvals)
    }
}
