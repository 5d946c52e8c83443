use crate::image::Reference;
use crate::models::TriggerType;
use crate::policy::Policy;
use std::collections::BTreeMap;
use std::fmt;

/// An image a provider currently watches. Built fresh on every listing.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedImage {
    pub image: Reference,
    pub provider: String,
    pub namespace: String,
    /// Pull secret names, resolved in `namespace`
    pub secrets: Vec<String>,
    pub trigger: TriggerType,
    pub poll_schedule: String,
    pub policy: Policy,
    pub meta: BTreeMap<String, String>,
}

impl fmt::Display for TrackedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (provider={}, namespace={}, trigger={}, policy={})",
            self.image.remote(),
            self.provider,
            self.namespace,
            self.trigger,
            self.policy
        )
    }
}
