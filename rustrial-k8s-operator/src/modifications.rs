use json_patch::diff;
use serde_json::Value;
use std::ops::{Deref, DerefMut};

use crate::{errors::OperatorError, reconciler::Context, resource::ManagedResource};

/// Helper construct to simplify updating resources from reconcile logic:
/// tracks the original object and writes back only what actually changed.
pub struct ResourceModifications<K> {
    original: K,
    pub modified: K,
}

impl<K> Deref for ResourceModifications<K> {
    type Target = K;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl<K> DerefMut for ResourceModifications<K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

fn split_status(o: Value) -> (Value, Value) {
    match o {
        Value::Object(mut map) => {
            let status = map.remove("status").unwrap_or(Value::Null);
            (Value::Object(map), status)
        }
        other => (other, Value::Null),
    }
}

impl<K: ManagedResource> ResourceModifications<K> {
    pub fn new(original: K) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    pub fn original(&self) -> &K {
        &self.original
    }

    pub fn is_deleted(&self) -> bool {
        self.modified.meta().deletion_timestamp.is_some()
    }

    fn patches(&self) -> Result<(json_patch::Patch, json_patch::Patch), OperatorError> {
        let (original, original_status) = split_status(serde_json::to_value(&self.original)?);
        let (modified, modified_status) = split_status(serde_json::to_value(&self.modified)?);
        Ok((
            diff(&original, &modified),
            diff(&original_status, &modified_status),
        ))
    }

    /// JSON patch of everything but the status.
    pub fn spec_patch(&self) -> Result<Option<json_patch::Patch>, OperatorError> {
        let (patch, _) = self.patches()?;
        Ok(if patch.0.is_empty() { None } else { Some(patch) })
    }

    pub fn status_patch(&self) -> Result<Option<json_patch::Patch>, OperatorError> {
        let (_, patch) = self.patches()?;
        Ok(if patch.0.is_empty() { None } else { Some(patch) })
    }

    pub fn spec_has_changed(&self) -> Result<bool, OperatorError> {
        Ok(self.spec_patch()?.is_some())
    }

    pub fn status_has_changed(&self) -> Result<bool, OperatorError> {
        Ok(self.status_patch()?.is_some())
    }

    fn updated(&mut self, updated: K) {
        self.original = updated.clone();
        self.modified = updated;
    }

    /// Writes the object back if anything besides its status changed.
    pub async fn replace(&mut self, ctx: &Context<K>) -> Result<bool, OperatorError> {
        if self.spec_has_changed()? {
            let updated = ctx.update_resource(&self.modified).await?;
            debug!(
                "[{}] replaced {} ({:?})",
                ctx.controller_name(),
                ctx.resource_ref(),
                updated.meta().resource_version
            );
            self.updated(updated);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Writes the status back if it changed.
    pub async fn replace_status(&mut self, ctx: &Context<K>) -> Result<bool, OperatorError> {
        if self.status_has_changed()? {
            let updated = ctx.update_status(&self.modified).await?;
            debug!(
                "[{}] replaced status of {} ({:?})",
                ctx.controller_name(),
                ctx.resource_ref(),
                updated.meta().resource_version
            );
            self.updated(updated);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        resource::ResourceRef,
        retry::{RetryInfo, RetryPolicy},
        testing::FakeCluster,
    };
    use k8s_openapi::api::core::v1::ConfigMap;
    use rustrial_k8s_operator_apis::{Echo, EchoSpec};
    use std::sync::Arc;

    #[test]
    fn detects_changes() {
        let mut echo = Echo::new("hello", EchoSpec {
            message: "hi".to_string(),
        });
        echo.metadata.namespace = Some("ns1".to_string());
        let mut m = ResourceModifications::new(echo);
        assert!(!m.spec_has_changed().unwrap());
        assert!(!m.status_has_changed().unwrap());
        m.update_echoed("hi".to_string(), Some(1));
        assert!(!m.spec_has_changed().unwrap());
        assert!(m.status_has_changed().unwrap());
        m.spec.message = "ho".to_string();
        assert!(m.spec_has_changed().unwrap());
        assert_eq!("hi", m.original().spec.message);
        assert!(!m.is_deleted());
    }

    #[tokio::test]
    async fn writes_back_changes_only() {
        let cluster = FakeCluster::new();
        let foo = ResourceRef::namespaced("ns1", "foo");
        let ctx = Context::new(
            "test",
            foo.clone(),
            RetryInfo::new(0, &RetryPolicy::NoRetry),
            cluster.clone() as Arc<dyn crate::client::ResourceClient<ConfigMap>>,
        );
        let mut m = ResourceModifications::new(cluster.create("ns1", "foo", 1));
        assert!(!m.replace(&ctx).await.unwrap());
        assert!(!m.replace_status(&ctx).await.unwrap());
        assert_eq!(0, cluster.status_updates());

        m.data = Some([("key".to_string(), "value".to_string())].into());
        assert!(m.replace(&ctx).await.unwrap());
        let remote = cluster.get(&foo).unwrap();
        assert_eq!(Some(2), remote.metadata.generation);
        assert_eq!(remote.metadata.resource_version, m.metadata.resource_version);
        assert!(!m.spec_has_changed().unwrap());

        // A concurrent change turns the next write into a stale update.
        cluster.touch(&foo);
        m.data = None;
        assert!(matches!(
            m.replace(&ctx).await,
            Err(OperatorError::StaleUpdate(_))
        ));
    }
}
