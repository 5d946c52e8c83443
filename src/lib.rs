// Library exports for integration testing
//
// The binary entrypoint in main.rs wires these modules together.

pub mod approval;
pub mod config;
pub mod gitrepo;
pub mod image;
pub mod k8s;
pub mod metrics;
pub mod models;
pub mod notifications;
pub mod policy;
pub mod provider;
pub mod registry;
pub mod trigger;

// Re-export commonly used types for testing
pub use image::Reference;
pub use models::{DockerHubWebhook, Event, NativeWebhook, RegistryWebhook, Repository, TrackedImage};
pub use policy::{Policy, PolicyOptions};
pub use provider::{ProviderHandle, Providers};
