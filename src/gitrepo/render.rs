use super::GitError;
use crate::k8s::{GenericResource, ManifestError};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, warn};

/// One YAML document, named after the file it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub name: String,
    pub content: String,
}

/// Turns a chart directory into manifests: `helm template` when the
/// directory holds a `Chart.yaml`, otherwise its YAML files as they are.
pub struct ChartRenderer {
    helm_binary: String,
}

impl ChartRenderer {
    pub fn new(helm_binary: impl Into<String>) -> Self {
        Self {
            helm_binary: helm_binary.into(),
        }
    }

    pub async fn render(&self, dir: &Path) -> Result<Vec<Manifest>, GitError> {
        if dir.join("Chart.yaml").exists() {
            self.template(dir).await
        } else {
            read_manifests(dir)
        }
    }

    async fn template(&self, dir: &Path) -> Result<Vec<Manifest>, GitError> {
        let output = Command::new(&self.helm_binary)
            .args(["template", "bowline"])
            .arg(dir)
            .output()
            .await?;

        if !output.status.success() {
            return Err(GitError::Render(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(split_documents(
            &dir.to_string_lossy(),
            &String::from_utf8_lossy(&output.stdout),
        ))
    }
}

fn read_manifests(dir: &Path) -> Result<Vec<Manifest>, GitError> {
    let mut manifests = Vec::new();
    let base = glob::Pattern::escape(&dir.to_string_lossy());

    for ext in ["yaml", "yml"] {
        for path in glob::glob(&format!("{}/*.{}", base, ext))?.flatten() {
            let content = std::fs::read_to_string(&path)?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            manifests.extend(split_documents(&name, &content));
        }
    }

    Ok(manifests)
}

/// Splits a multi-document stream. Documents rendered by helm are named by
/// their `# Source:` comment.
pub fn split_documents(name: &str, content: &str) -> Vec<Manifest> {
    let mut documents = Vec::new();
    let mut current = Vec::new();

    let mut flush = |lines: &mut Vec<&str>| {
        let body = lines.join("\n");
        lines.clear();
        if body.lines().all(|l| l.trim().is_empty() || l.trim_start().starts_with('#')) {
            return;
        }
        let source = body
            .lines()
            .find_map(|l| l.strip_prefix("# Source: "))
            .unwrap_or(name)
            .to_string();
        documents.push(Manifest {
            name: source,
            content: body,
        });
    };

    for line in content.lines() {
        if line.trim_end() == "---" || line.starts_with("--- ") {
            flush(&mut current);
        } else {
            current.push(line);
        }
    }
    flush(&mut current);

    documents
}

/// Workloads declared by `manifests`. Other kinds are ignored and broken
/// documents are logged.
pub fn workloads(manifests: &[Manifest]) -> Vec<GenericResource> {
    let mut resources = Vec::new();

    for manifest in manifests {
        match GenericResource::from_yaml(&manifest.content) {
            Ok(Some(resource)) => resources.push(resource),
            Ok(None) => debug!("Skipping {}: not a workload", manifest.name),
            Err(ManifestError::MissingKind) => debug!("Skipping {}: no kind", manifest.name),
            Err(e) => warn!("Failed to read manifest {}: {}", manifest.name, e),
        }
    }

    resources
}
