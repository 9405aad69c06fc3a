use std::{fmt::Debug, sync::Arc};

use kube::{Resource, ResourceExt};
use serde::{Serialize, de::DeserializeOwned};

use crate::errors::OperatorError;

/// Bounds every resource type managed by a pipeline must satisfy.
pub trait ManagedResource:
    Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> ManagedResource for T where
    T: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Identity of a resource instance, `namespace` is `None` for cluster scoped kinds.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub namespace: Option<String>,
    pub name: String,
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", namespace, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl ResourceRef {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(|v| v.to_string()),
            name: name.to_string(),
        }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    pub fn cluster(name: &str) -> Self {
        Self::new(None, name)
    }

    /// `None` if the object has no name.
    pub fn from_resource<K: Resource>(o: &K) -> Option<Self> {
        let name = o.meta().name.as_deref()?;
        Some(Self::new(o.meta().namespace.as_deref(), name))
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Whether this ref lies within the watch scope `namespace` (`None` = all).
    pub fn is_within(&self, namespace: Option<&str>) -> bool {
        namespace.map_or(true, |ns| self.namespace() == Some(ns))
    }
}

/// Opaque `metadata.resourceVersion` token.
///
/// Kubernetes does not promise any ordering, but in practice versions are
/// increasing integers. If both tokens are integers they are compared
/// numerically, otherwise any different token counts as newer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_newer_than(&self, other: &ResourceVersion) -> bool {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(me), Ok(other)) => me > other,
            _ => self.0 != other.0,
        }
    }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl From<&str> for ResourceVersion {
    fn from(v: &str) -> Self {
        Self::new(v)
    }
}

/// Last known state of a resource, owned by the [`crate::cache::ResourceCache`].
#[derive(Debug)]
pub struct CachedEntry<K> {
    pub resource_ref: ResourceRef,
    pub generation: Option<i64>,
    pub resource_version: ResourceVersion,
    pub deletion_timestamp_set: bool,
    pub finalizers: Vec<String>,
    /// The object no longer exists remotely.
    pub tombstone: bool,
    pub payload: Arc<K>,
}

impl<K> Clone for CachedEntry<K> {
    fn clone(&self) -> Self {
        Self {
            resource_ref: self.resource_ref.clone(),
            generation: self.generation,
            resource_version: self.resource_version.clone(),
            deletion_timestamp_set: self.deletion_timestamp_set,
            finalizers: self.finalizers.clone(),
            tombstone: self.tombstone,
            payload: self.payload.clone(),
        }
    }
}

impl<K: Resource> CachedEntry<K> {
    /// Fails for objects without name or `resourceVersion`.
    pub fn from_resource(o: K) -> Result<Self, OperatorError> {
        let resource_ref = ResourceRef::from_resource(&o).ok_or_else(|| {
            OperatorError::MalformedNotification("object without metadata.name".to_string())
        })?;
        let resource_version = o
            .meta()
            .resource_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(ResourceVersion::new)
            .ok_or_else(|| {
                OperatorError::MalformedNotification(format!(
                    "{} has no metadata.resourceVersion",
                    resource_ref
                ))
            })?;
        Ok(Self {
            resource_ref,
            generation: o.meta().generation,
            resource_version,
            deletion_timestamp_set: o.meta().deletion_timestamp.is_some(),
            finalizers: o.finalizers().to_vec(),
            tombstone: false,
            payload: Arc::new(o),
        })
    }

    pub fn into_tombstone(mut self) -> Self {
        self.tombstone = true;
        self
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f.as_str() == finalizer)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    /// A related (e.g. owned) object of the resource changed.
    Related,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::Added => "Added",
            EventKind::Modified => "Modified",
            EventKind::Deleted => "Deleted",
            EventKind::Related => "Related",
        };
        f.write_str(name)
    }
}

/// Normalized change notification, consumed once by the event handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub resource_ref: ResourceRef,
    pub kind: EventKind,
    pub observed_generation: Option<i64>,
    pub observed_resource_version: Option<ResourceVersion>,
    /// Name of the event source which emitted this event.
    pub source: String,
}

impl Event {
    pub fn for_entry<K>(kind: EventKind, entry: &CachedEntry<K>, source: &str) -> Self {
        Self {
            resource_ref: entry.resource_ref.clone(),
            kind,
            observed_generation: entry.generation,
            observed_resource_version: Some(entry.resource_version.clone()),
            source: source.to_string(),
        }
    }

    pub fn related(resource_ref: ResourceRef, source: &str) -> Self {
        Self {
            resource_ref,
            kind: EventKind::Related,
            observed_generation: None,
            observed_resource_version: None,
            source: source.to_string(),
        }
    }
}
