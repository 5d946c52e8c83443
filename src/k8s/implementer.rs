use super::{GenericResource, Workload};
use anyhow::Result;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

/// Writes an updated workload back to the cluster.
#[async_trait::async_trait]
pub trait Implementer: Send + Sync {
    async fn update(&self, resource: &GenericResource) -> Result<()>;
}

pub struct KubeImplementer {
    client: Client,
}

impl KubeImplementer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Implementer for KubeImplementer {
    async fn update(&self, resource: &GenericResource) -> Result<()> {
        let pp = PostParams::default();
        let ns = resource.namespace.as_str();
        let name = resource.name.as_str();

        debug!("Replacing {}", resource);

        match resource.workload() {
            Workload::Deployment(d) => {
                Api::namespaced(self.client.clone(), ns)
                    .replace(name, &pp, d)
                    .await?;
            },
            Workload::StatefulSet(s) => {
                Api::namespaced(self.client.clone(), ns)
                    .replace(name, &pp, s)
                    .await?;
            },
            Workload::DaemonSet(d) => {
                Api::namespaced(self.client.clone(), ns)
                    .replace(name, &pp, d)
                    .await?;
            },
            Workload::CronJob(c) => {
                Api::namespaced(self.client.clone(), ns)
                    .replace(name, &pp, c)
                    .await?;
            },
        }

        Ok(())
    }
}
