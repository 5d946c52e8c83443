use super::GenericResource;
use std::collections::{BTreeMap, HashSet};
use std::sync::{PoisonError, RwLock};

pub trait GenericResourceCache: Send + Sync {
    /// A copy of the cached resources. Mutating it does not touch the cache.
    fn values(&self) -> Vec<GenericResource>;
}

/// Snapshot of watched workloads, keyed by identifier.
#[derive(Debug, Default)]
pub struct ResourceCache {
    resources: RwLock<BTreeMap<String, GenericResource>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, resource: GenericResource) {
        self.write()
            .insert(resource.identifier.clone(), resource);
    }

    pub fn delete(&self, identifier: &str) {
        self.write().remove(identifier);
    }

    pub fn replace_all(&self, resources: Vec<GenericResource>) {
        let mut cache = self.write();
        cache.clear();
        cache.extend(resources.into_iter().map(|r| (r.identifier.clone(), r)));
    }

    /// Replaces every entry of `kind`, dropping those no longer listed.
    pub fn replace_kind(&self, kind: &str, resources: Vec<GenericResource>) {
        let listed: HashSet<String> = resources.iter().map(|r| r.identifier.clone()).collect();
        let mut cache = self.write();
        cache.retain(|id, r| r.kind() != kind || listed.contains(id));
        cache.extend(resources.into_iter().map(|r| (r.identifier.clone(), r)));
    }

    pub fn len(&self) -> usize {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, GenericResource>> {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl GenericResourceCache for ResourceCache {
    fn values(&self) -> Vec<GenericResource> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
