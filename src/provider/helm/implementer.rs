use crate::config::HelmConfig;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio::process::Command;
use tracing::debug;

/// A deployed release and the values it currently runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    /// Chart as reported by helm, `name-version`
    pub chart: String,
    pub values: serde_yaml::Value,
}

impl Release {
    /// Chart name and version split out of `chart`.
    pub fn chart_name_and_version(&self) -> (&str, Option<&str>) {
        split_chart(&self.chart)
    }
}

#[async_trait::async_trait]
pub trait HelmImplementer: Send + Sync {
    async fn list_releases(&self) -> Result<Vec<Release>>;

    /// Upgrades `release` to its current chart with `values` set on top of
    /// the values it already runs with.
    async fn update_release_from_chart(
        &self,
        release: &Release,
        values: &BTreeMap<String, String>,
    ) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
    namespace: String,
    chart: String,
}

/// Drives the `helm` binary.
pub struct HelmCli {
    binary: String,
    chart_repository: Option<String>,
}

impl HelmCli {
    pub fn new(config: &HelmConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            chart_repository: config.chart_repository.clone(),
        }
    }

    /// Chart to upgrade from: `<repository>/<chart>` when a repository is
    /// configured, otherwise the chart reference the release was listed with.
    fn chart_reference(&self, chart: &str) -> String {
        match &self.chart_repository {
            Some(repository) if !chart.contains('/') => format!("{}/{}", repository, chart),
            _ => chart.to_string(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>> {
        debug!("Running {} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.binary))?;

        if !output.status.success() {
            bail!(
                "{} {} failed (exit {}): {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }

    async fn values(&self, name: &str, namespace: &str) -> Result<serde_yaml::Value> {
        let stdout = self
            .run(&owned(&["get", "values", name, "-n", namespace, "--all", "-o", "json"]))
            .await?;
        let json: serde_json::Value = serde_json::from_slice(&stdout)
            .with_context(|| format!("Invalid values of release {}/{}", namespace, name))?;
        Ok(serde_yaml::to_value(json)?)
    }
}

#[async_trait::async_trait]
impl HelmImplementer for HelmCli {
    async fn list_releases(&self) -> Result<Vec<Release>> {
        let stdout = self.run(&owned(&["list", "-A", "-o", "json"])).await?;
        let entries: Vec<ListEntry> =
            serde_json::from_slice(&stdout).context("Invalid helm list output")?;

        let mut releases = Vec::with_capacity(entries.len());
        for entry in entries {
            let values = self.values(&entry.name, &entry.namespace).await?;
            releases.push(Release {
                name: entry.name,
                namespace: entry.namespace,
                chart: entry.chart,
                values,
            });
        }
        Ok(releases)
    }

    async fn update_release_from_chart(
        &self,
        release: &Release,
        values: &BTreeMap<String, String>,
    ) -> Result<()> {
        let (chart, version) = release.chart_name_and_version();
        let mut args = owned(&[
            "upgrade",
            &release.name,
            &self.chart_reference(chart),
            "-n",
            &release.namespace,
            "--reuse-values",
        ]);
        if let Some(version) = version {
            args.push("--version".to_string());
            args.push(version.to_string());
        }
        for (path, value) in values {
            args.push("--set".to_string());
            args.push(format!("{}={}", path, value));
        }

        self.run(&args).await?;
        Ok(())
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Splits `name-version` at the first dash that starts a version.
pub fn split_chart(chart: &str) -> (&str, Option<&str>) {
    let bytes = chart.as_bytes();
    for (idx, b) in bytes.iter().enumerate() {
        if *b == b'-' && bytes.get(idx + 1).is_some_and(u8::is_ascii_digit) {
            return (&chart[..idx], Some(&chart[idx + 1..]));
        }
    }
    (chart, None)
}
