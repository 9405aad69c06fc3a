use kube::Resource;

use crate::{client::ResourceClient, errors::OperatorError, resource::CachedEntry};

/// Adds `finalizer` unless present, returns the updated object if the
/// finalizer had to be added.
pub(crate) async fn add_finalizer_if_missing<K: Resource>(
    client: &dyn ResourceClient<K>,
    entry: &CachedEntry<K>,
    finalizer: &str,
) -> Result<Option<K>, OperatorError> {
    if entry.has_finalizer(finalizer) {
        Ok(None)
    } else {
        let mut finalizers = entry.finalizers.clone();
        finalizers.push(finalizer.to_string());
        let updated = client
            .update_finalizers(&entry.resource_ref, &finalizers, &entry.resource_version)
            .await?;
        Ok(Some(updated))
    }
}

/// Removes `finalizer` if present, returns the updated object if the finalizer
/// had to be removed. An object which no longer exists counts as removed.
pub(crate) async fn remove_finalizer<K: Resource>(
    client: &dyn ResourceClient<K>,
    entry: &CachedEntry<K>,
    finalizer: &str,
) -> Result<Option<K>, OperatorError> {
    let mut finalizers = entry.finalizers.clone();
    let len = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    if finalizers.len() != len {
        match client
            .update_finalizers(&entry.resource_ref, &finalizers, &entry.resource_version)
            .await
        {
            Ok(updated) => Ok(Some(updated)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    } else {
        Ok(None)
    }
}

/// The CRD name `<plural>.<group>` of `K`, or just `<plural>` for the core group.
pub fn crd_name<K>() -> String
where
    K: Resource,
    K::DynamicType: Default,
{
    let dt = K::DynamicType::default();
    let group = K::group(&dt);
    if group.is_empty() {
        K::plural(&dt).to_string()
    } else {
        format!("{}.{}", K::plural(&dt), group)
    }
}
