//! Workload abstraction over the kinds whose pod templates carry images.

pub mod cache;
pub mod implementer;
pub mod watch;

pub use cache::{GenericResourceCache, ResourceCache};
pub use implementer::{Implementer, KubeImplementer};

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to parse manifest: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("manifest has no kind")]
    MissingKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Workload {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
    CronJob(CronJob),
}

/// A workload reduced to what image tracking needs.
///
/// The identifier is `kind/namespace/name` and stays stable across updates.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericResource {
    pub identifier: String,
    pub namespace: String,
    pub name: String,
    workload: Workload,
}

impl GenericResource {
    pub fn new(workload: Workload) -> Self {
        let meta = metadata(&workload);
        let namespace = meta
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let name = meta.name.clone().unwrap_or_default();
        let identifier = format!("{}/{}/{}", kind_of(&workload), namespace, name);

        Self {
            identifier,
            namespace,
            name,
            workload,
        }
    }

    /// Builds a resource from one YAML document. Kinds without a pod
    /// template yield `Ok(None)`.
    pub fn from_yaml(raw: &str) -> Result<Option<Self>, ManifestError> {
        let value: serde_yaml::Value = serde_yaml::from_str(raw)?;
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or(ManifestError::MissingKind)?
            .to_string();

        let workload = match kind.as_str() {
            "Deployment" => Workload::Deployment(serde_yaml::from_value(value)?),
            "StatefulSet" => Workload::StatefulSet(serde_yaml::from_value(value)?),
            "DaemonSet" => Workload::DaemonSet(serde_yaml::from_value(value)?),
            "CronJob" => Workload::CronJob(serde_yaml::from_value(value)?),
            _ => return Ok(None),
        };

        Ok(Some(Self::new(workload)))
    }

    pub fn kind(&self) -> &'static str {
        kind_of(&self.workload)
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        metadata(&self.workload).labels.clone().unwrap_or_default()
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        metadata(&self.workload)
            .annotations
            .clone()
            .unwrap_or_default()
    }

    pub fn set_annotations(&mut self, annotations: BTreeMap<String, String>) {
        metadata_mut(&mut self.workload).annotations = Some(annotations);
    }

    /// Annotations of the pod template.
    pub fn spec_annotations(&self) -> BTreeMap<String, String> {
        self.template()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.annotations.clone())
            .unwrap_or_default()
    }

    pub fn set_spec_annotations(&mut self, annotations: BTreeMap<String, String>) {
        if let Some(template) = self.template_mut() {
            template
                .metadata
                .get_or_insert_with(ObjectMeta::default)
                .annotations = Some(annotations);
        }
    }

    pub fn containers(&self) -> &[Container] {
        self.template()
            .and_then(|t| t.spec.as_ref())
            .map(|s| s.containers.as_slice())
            .unwrap_or_default()
    }

    pub fn images(&self) -> Vec<String> {
        self.containers()
            .iter()
            .filter_map(|c| c.image.clone())
            .collect()
    }

    /// Pull secrets referenced by the pod template.
    pub fn image_pull_secrets(&self) -> Vec<String> {
        self.template()
            .and_then(|t| t.spec.as_ref())
            .and_then(|s| s.image_pull_secrets.as_ref())
            .map(|secrets| secrets.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Sets the image of the container at `index`. Out of range is a no-op.
    pub fn update_container(&mut self, index: usize, image: &str) {
        if let Some(container) = self
            .template_mut()
            .and_then(|t| t.spec.as_mut())
            .and_then(|s| s.containers.get_mut(index))
        {
            container.image = Some(image.to_string());
        }
    }

    fn template(&self) -> Option<&PodTemplateSpec> {
        match &self.workload {
            Workload::Deployment(d) => d.spec.as_ref().map(|s| &s.template),
            Workload::StatefulSet(s) => s.spec.as_ref().map(|s| &s.template),
            Workload::DaemonSet(d) => d.spec.as_ref().map(|s| &s.template),
            Workload::CronJob(c) => c
                .spec
                .as_ref()
                .and_then(|s| s.job_template.spec.as_ref())
                .map(|s| &s.template),
        }
    }

    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        match &mut self.workload {
            Workload::Deployment(d) => d.spec.as_mut().map(|s| &mut s.template),
            Workload::StatefulSet(s) => s.spec.as_mut().map(|s| &mut s.template),
            Workload::DaemonSet(d) => d.spec.as_mut().map(|s| &mut s.template),
            Workload::CronJob(c) => c
                .spec
                .as_mut()
                .and_then(|s| s.job_template.spec.as_mut())
                .map(|s| &mut s.template),
        }
    }
}

impl fmt::Display for GenericResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind(), self.namespace, self.name)
    }
}

impl From<Deployment> for GenericResource {
    fn from(value: Deployment) -> Self {
        Self::new(Workload::Deployment(value))
    }
}

impl From<StatefulSet> for GenericResource {
    fn from(value: StatefulSet) -> Self {
        Self::new(Workload::StatefulSet(value))
    }
}

impl From<DaemonSet> for GenericResource {
    fn from(value: DaemonSet) -> Self {
        Self::new(Workload::DaemonSet(value))
    }
}

impl From<CronJob> for GenericResource {
    fn from(value: CronJob) -> Self {
        Self::new(Workload::CronJob(value))
    }
}

fn kind_of(workload: &Workload) -> &'static str {
    match workload {
        Workload::Deployment(_) => "deployment",
        Workload::StatefulSet(_) => "statefulset",
        Workload::DaemonSet(_) => "daemonset",
        Workload::CronJob(_) => "cronjob",
    }
}

fn metadata(workload: &Workload) -> &ObjectMeta {
    match workload {
        Workload::Deployment(d) => &d.metadata,
        Workload::StatefulSet(s) => &s.metadata,
        Workload::DaemonSet(d) => &d.metadata,
        Workload::CronJob(c) => &c.metadata,
    }
}

fn metadata_mut(workload: &mut Workload) -> &mut ObjectMeta {
    match workload {
        Workload::Deployment(d) => &mut d.metadata,
        Workload::StatefulSet(s) => &mut s.metadata,
        Workload::DaemonSet(d) => &mut d.metadata,
        Workload::CronJob(c) => &mut c.metadata,
    }
}
