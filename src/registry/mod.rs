//! Registry access used by the poll trigger.

pub mod credentials;

pub use credentials::{CredentialsHelper, RegistryCredentials};

use crate::image::DEFAULT_REGISTRY_HOSTNAME;
use anyhow::{Context, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client as OciClient, Reference as OciReference};

/// Docker Hub rejects names without a namespace.
const OFFICIAL_NAMESPACE: &str = "library";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Opts {
    /// Registry hostname, optionally with a port
    pub registry: String,
    /// Repository path without the registry
    pub name: String,
    pub tag: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Opts {
    pub fn new(registry: &str, name: &str, tag: &str) -> Self {
        Self {
            registry: registry.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, credentials: Option<RegistryCredentials>) -> Self {
        if let Some(creds) = credentials {
            self.username = Some(creds.username);
            self.password = Some(creds.password);
        }
        self
    }

    /// Repository path as the registry API expects it.
    pub fn repository(&self) -> String {
        if self.registry == DEFAULT_REGISTRY_HOSTNAME && !self.name.contains('/') {
            format!("{}/{}", OFFICIAL_NAMESPACE, self.name)
        } else {
            self.name.clone()
        }
    }

    fn auth(&self) -> RegistryAuth {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => RegistryAuth::Basic(user.clone(), pass.clone()),
            _ => RegistryAuth::Anonymous,
        }
    }

    fn reference(&self) -> OciReference {
        OciReference::with_tag(self.registry.clone(), self.repository(), self.tag.clone())
    }
}

#[async_trait::async_trait]
pub trait RegistryClient: Send + Sync {
    /// Manifest digest of `opts.tag`.
    async fn digest(&self, opts: &Opts) -> Result<String>;

    /// Every tag of the repository.
    async fn tags(&self, opts: &Opts) -> Result<Vec<String>>;
}

pub struct OciRegistryClient {
    client: OciClient,
}

impl Default for OciRegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OciRegistryClient {
    pub fn new() -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::HttpsExcept(vec![
                "localhost".to_string(),
                "127.0.0.1".to_string(),
            ]),
            ..Default::default()
        };
        Self {
            client: OciClient::new(config),
        }
    }
}

#[async_trait::async_trait]
impl RegistryClient for OciRegistryClient {
    async fn digest(&self, opts: &Opts) -> Result<String> {
        let reference = opts.reference();
        self.client
            .fetch_manifest_digest(&reference, &opts.auth())
            .await
            .with_context(|| format!("failed to fetch digest for {}", reference))
    }

    async fn tags(&self, opts: &Opts) -> Result<Vec<String>> {
        let reference = opts.reference();
        let response = self
            .client
            .list_tags(&reference, &opts.auth(), None, None)
            .await
            .with_context(|| format!("failed to list tags for {}", reference))?;
        Ok(response.tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_official_images_get_library_prefix() {
        assert_eq!(
            Opts::new("index.docker.io", "alpine", "3.7.3").repository(),
            "library/alpine"
        );
        assert_eq!(
            Opts::new("index.docker.io", "karolisr/keel", "0.2.0").repository(),
            "karolisr/keel"
        );
        assert_eq!(
            Opts::new("gcr.io", "hello-world", "1.0.0").repository(),
            "hello-world"
        );
    }

    #[test]
    fn test_auth_from_credentials() {
        let anonymous = Opts::new("gcr.io", "app", "1");
        assert!(matches!(anonymous.auth(), RegistryAuth::Anonymous));

        let basic = Opts::new("gcr.io", "app", "1").with_credentials(Some(RegistryCredentials {
            registry: "gcr.io".to_string(),
            username: "user".to_string(),
            password: "secret".to_string(),
        }));
        assert!(matches!(basic.auth(), RegistryAuth::Basic(u, p) if u == "user" && p == "secret"));
    }
}
