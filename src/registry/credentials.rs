use crate::image::normalize_registry;
use crate::models::TrackedImage;
use anyhow::{Context, Result};
use base64::prelude::*;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct DockerConfig {
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub registry: String,
    pub username: String,
    pub password: String,
}

/// Resolves registry credentials for tracked images: the default docker
/// config first, then the image's pull secrets in its namespace.
pub struct CredentialsHelper {
    client: Option<Client>,
    default_config: Option<String>,
}

impl CredentialsHelper {
    pub fn new(client: Option<Client>, default_config: Option<String>) -> Self {
        Self {
            client,
            default_config,
        }
    }

    pub async fn get(&self, image: &TrackedImage) -> Option<RegistryCredentials> {
        let registry = image.image.registry();

        if let Some(config) = &self.default_config {
            match parse_default_config(config, registry) {
                Ok(Some(creds)) => {
                    debug!("Using default registry credentials for {}", registry);
                    return Some(creds);
                },
                Ok(None) => {},
                Err(e) => warn!("Failed to parse default registry config: {}", e),
            }
        }

        let client = self.client.as_ref()?;
        let secrets: Api<Secret> = Api::namespaced(client.clone(), &image.namespace);

        for name in &image.secrets {
            match secrets.get_opt(name).await {
                Ok(Some(secret)) => match parse_secret(&secret, registry) {
                    Ok(Some(creds)) => {
                        debug!(
                            "Using credentials from secret {}/{} for {}",
                            image.namespace, name, registry
                        );
                        return Some(creds);
                    },
                    Ok(None) => {},
                    Err(e) => warn!("Failed to parse secret {}/{}: {}", image.namespace, name, e),
                },
                Ok(None) => debug!("Secret {}/{} not found", image.namespace, name),
                Err(e) => warn!("Failed to get secret {}/{}: {}", image.namespace, name, e),
            }
        }

        None
    }
}

/// The default config may be raw JSON or base64 encoded JSON.
fn parse_default_config(config: &str, registry: &str) -> Result<Option<RegistryCredentials>> {
    let trimmed = config.trim();
    if trimmed.starts_with('{') {
        return parse_dockerconfigjson(trimmed.as_bytes(), registry);
    }
    let decoded = BASE64_STANDARD
        .decode(trimmed)
        .context("default registry config is neither JSON nor base64")?;
    parse_dockerconfigjson(&decoded, registry)
}

fn parse_secret(secret: &Secret, registry: &str) -> Result<Option<RegistryCredentials>> {
    let data = match &secret.data {
        Some(d) => d,
        None => return Ok(None),
    };

    if let Some(dockerconfigjson) = data.get(".dockerconfigjson") {
        return parse_dockerconfigjson(&dockerconfigjson.0, registry);
    }

    if let Some(dockercfg) = data.get(".dockercfg") {
        let auths: HashMap<String, DockerAuthEntry> =
            serde_json::from_slice(&dockercfg.0).context("Failed to parse .dockercfg")?;
        return find_entry(&auths, registry);
    }

    Ok(None)
}

pub fn parse_dockerconfigjson(data: &[u8], registry: &str) -> Result<Option<RegistryCredentials>> {
    let config: DockerConfig =
        serde_json::from_slice(data).context("Failed to parse .dockerconfigjson")?;
    find_entry(&config.auths, registry)
}

fn find_entry(
    auths: &HashMap<String, DockerAuthEntry>,
    registry: &str,
) -> Result<Option<RegistryCredentials>> {
    match auths.iter().find(|(key, _)| registry_matches(key, registry)) {
        Some((_, entry)) => parse_auth_entry(entry, registry),
        None => Ok(None),
    }
}

fn parse_auth_entry(entry: &DockerAuthEntry, registry: &str) -> Result<Option<RegistryCredentials>> {
    if !entry.username.is_empty() && !entry.password.is_empty() {
        return Ok(Some(RegistryCredentials {
            registry: registry.to_string(),
            username: entry.username.clone(),
            password: entry.password.clone(),
        }));
    }

    if !entry.auth.is_empty() {
        let decoded = BASE64_STANDARD
            .decode(entry.auth.as_bytes())
            .context("Failed to decode auth token")?;
        let auth = String::from_utf8(decoded).context("Auth token is not valid UTF-8")?;

        if let Some((username, password)) = auth.split_once(':') {
            return Ok(Some(RegistryCredentials {
                registry: registry.to_string(),
                username: username.to_string(),
                password: password.to_string(),
            }));
        }
    }

    Ok(None)
}

/// Compares a docker config key (`https://host/v1/` and friends) to a registry
/// hostname, treating all Docker Hub aliases as one.
fn registry_matches(key: &str, registry: &str) -> bool {
    let host = key
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or_default();
    normalize_registry(host) == normalize_registry(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_json(key: &str) -> String {
        let auth = BASE64_STANDARD.encode("bob:hunter2");
        format!(r#"{{"auths":{{"{}":{{"auth":"{}"}}}}}}"#, key, auth)
    }

    #[test]
    fn test_registry_matches() {
        assert!(registry_matches("gcr.io", "gcr.io"));
        assert!(registry_matches("https://gcr.io", "gcr.io"));
        assert!(registry_matches("https://index.docker.io/v1/", "index.docker.io"));
        assert!(registry_matches("docker.io", "index.docker.io"));
        assert!(registry_matches("registry-1.docker.io", "index.docker.io"));
        assert!(!registry_matches("gcr.io", "index.docker.io"));
        assert!(!registry_matches("quay.io", "gcr.io"));
    }

    #[test]
    fn test_parse_dockerconfigjson_auth_token() {
        let raw = config_json("https://index.docker.io/v1/");
        let creds = parse_dockerconfigjson(raw.as_bytes(), "index.docker.io")
            .unwrap()
            .unwrap();
        assert_eq!(creds.username, "bob");
        assert_eq!(creds.password, "hunter2");

        assert!(parse_dockerconfigjson(raw.as_bytes(), "quay.io")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_default_config_base64() {
        let encoded = BASE64_STANDARD.encode(config_json("gcr.io"));
        let creds = parse_default_config(&encoded, "gcr.io").unwrap().unwrap();
        assert_eq!(creds.registry, "gcr.io");
        assert!(parse_default_config("%%%", "gcr.io").is_err());
    }

    #[test]
    fn test_explicit_username_password() {
        let raw = r#"{"auths":{"quay.io":{"username":"u","password":"p"}}}"#;
        let creds = parse_dockerconfigjson(raw.as_bytes(), "quay.io").unwrap().unwrap();
        assert_eq!((creds.username.as_str(), creds.password.as_str()), ("u", "p"));
    }
}
