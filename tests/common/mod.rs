// Common test utilities for integration tests
//
// Fixtures and recording fakes for driving providers without a cluster,
// a Helm binary or a git remote.
#![allow(dead_code)]

use bowline::approval::{ApprovalManager, MemoryStore};
use bowline::k8s::{GenericResource, Implementer};
use bowline::notifications::{EventNotification, Sender};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Creates a sample Deployment for testing
pub fn create_test_deployment(
    name: &str,
    namespace: &str,
    image: &str,
    annotations: Option<BTreeMap<String, String>>,
) -> GenericResource {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), name.to_string());

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations,
            ..Default::default()
        },
        spec: Some(k8s_openapi::api::apps::v1::DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "app".to_string(),
                        image: Some(image.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
    .into()
}

/// Creates bowline annotations for a workload
pub fn bowline_annotations(policy: &str, approvals: Option<u32>) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert("bowline.sh/policy".to_string(), policy.to_string());
    if let Some(n) = approvals {
        annotations.insert("bowline.sh/approvals".to_string(), n.to_string());
    }
    annotations
}

/// Creates a Docker Hub webhook payload
pub fn create_dockerhub_webhook_payload(repo: &str, tag: &str) -> serde_json::Value {
    let (namespace, name) = repo.split_once('/').unwrap_or(("library", repo));

    serde_json::json!({
        "push_data": {
            "tag": tag,
            "pusher": "ci"
        },
        "repository": {
            "repo_name": repo,
            "namespace": namespace,
            "name": name
        }
    })
}

/// Creates a docker distribution notification payload
pub fn create_registry_webhook_payload(host: &str, image: &str, tag: &str) -> serde_json::Value {
    serde_json::json!({
        "events": [{
            "action": "push",
            "target": {
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "digest": "sha256:abc123",
                "repository": image,
                "url": format!("https://{}/v2/{}/manifests/{}", host, image, tag),
                "tag": tag
            },
            "request": {
                "id": "3b1a8c2e",
                "host": host,
                "method": "PUT"
            }
        }]
    })
}

/// Sender that keeps every notification
#[derive(Default)]
pub struct RecordingSender {
    events: Mutex<Vec<EventNotification>>,
}

impl RecordingSender {
    pub fn events(&self) -> Vec<EventNotification> {
        self.events.lock().unwrap().clone()
    }
}

impl Sender for RecordingSender {
    fn send(&self, event: EventNotification) {
        self.events.lock().unwrap().push(event);
    }
}

/// Implementer that records updated workloads instead of calling the API
#[derive(Default)]
pub struct RecordingImplementer {
    updated: Mutex<Vec<GenericResource>>,
}

impl RecordingImplementer {
    pub fn updated(&self) -> Vec<GenericResource> {
        self.updated.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Implementer for RecordingImplementer {
    async fn update(&self, resource: &GenericResource) -> anyhow::Result<()> {
        self.updated.lock().unwrap().push(resource.clone());
        Ok(())
    }
}

pub fn approval_manager() -> Arc<ApprovalManager> {
    Arc::new(ApprovalManager::new(
        Arc::new(MemoryStore::default()),
        Arc::new(RecordingSender::default()),
    ))
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    check()
}
