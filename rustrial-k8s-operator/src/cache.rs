use dashmap::{DashMap, mapref::entry::Entry};

use crate::resource::{CachedEntry, ResourceRef, ResourceVersion};

/// Thread-safe store of the last known state of each resource.
///
/// Writes are ordered by `resourceVersion`: an entry which is not newer than
/// the cached one is rejected. The cache never triggers reconciliation itself.
pub struct ResourceCache<K> {
    entries: DashMap<ResourceRef, CachedEntry<K>>,
}

impl<K> Default for ResourceCache<K> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<K> ResourceCache<K> {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self, resource_ref: &ResourceRef) -> Option<CachedEntry<K>> {
        self.entries.get(resource_ref).map(|e| e.value().clone())
    }

    /// Stores `entry` unless it is stale, returns whether it was applied.
    pub fn put(&self, entry: CachedEntry<K>) -> bool {
        match self.entries.entry(entry.resource_ref.clone()) {
            Entry::Occupied(mut occupied) => {
                if entry
                    .resource_version
                    .is_newer_than(&occupied.get().resource_version)
                {
                    occupied.insert(entry);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                true
            }
        }
    }

    pub fn remove(&self, resource_ref: &ResourceRef) -> Option<CachedEntry<K>> {
        self.entries.remove(resource_ref).map(|(_, entry)| entry)
    }

    /// Removes the entry unless a newer version than `resource_version` was
    /// cached in the meantime, returns whether it was removed.
    pub fn evict(&self, resource_ref: &ResourceRef, resource_version: &ResourceVersion) -> bool {
        self.entries
            .remove_if(resource_ref, |_, cached| {
                !cached.resource_version.is_newer_than(resource_version)
            })
            .is_some()
    }

    /// Marks the cached entry as deleted remotely, returns the marked entry.
    pub fn mark_tombstone(&self, resource_ref: &ResourceRef) -> Option<CachedEntry<K>> {
        self.entries.get_mut(resource_ref).map(|mut entry| {
            entry.tombstone = true;
            entry.value().clone()
        })
    }

    pub fn contains(&self, resource_ref: &ResourceRef) -> bool {
        self.entries.contains_key(resource_ref)
    }

    /// Refs of all cached entries within `namespace` (`None` = all namespaces).
    pub fn refs(&self, namespace: Option<&str>) -> Vec<ResourceRef> {
        self.entries
            .iter()
            .filter(|e| e.key().is_within(namespace))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evicts all entries, used when a controller is unregistered.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
