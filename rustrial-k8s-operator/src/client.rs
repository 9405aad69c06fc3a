//! Boundary to the Kubernetes API: list/watch and optimistic-concurrency updates.

use async_trait::async_trait;
use futures::{StreamExt, future, stream::BoxStream};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    Api, Client, Resource,
    api::{Patch, PatchParams, PostParams},
};
use kube_runtime::watcher;
use serde_json::json;

use crate::{
    MANAGER,
    errors::OperatorError,
    resource::{EventKind, ManagedResource, ResourceRef, ResourceVersion},
};

/// A remote change notification.
#[derive(Clone, Debug)]
pub struct Notification<K> {
    pub kind: EventKind,
    pub object: K,
}

pub type NotificationStream<K> = BoxStream<'static, Result<Notification<K>, OperatorError>>;

/// Source of listings and live notification streams of one resource kind.
#[async_trait]
pub trait WatchProvider<K>: Send + Sync {
    /// Lists all objects within `namespace` (`None` = all namespaces) and opens a
    /// notification stream starting right after the listing.
    ///
    /// Stream items failing with [`OperatorError::MalformedNotification`] are
    /// dropped by the consumer, any other error terminates the subscription.
    async fn list_and_watch(
        &self,
        namespace: Option<&str>,
    ) -> Result<(Vec<K>, NotificationStream<K>), OperatorError>;
}

/// Optimistic-concurrency updates of resources.
///
/// All operations fail with [`OperatorError::StaleUpdate`] if the expected
/// `resourceVersion` no longer matches the remote one.
#[async_trait]
pub trait ResourceClient<K>: Send + Sync {
    /// Replaces the finalizer list of the object, returns the updated object.
    async fn update_finalizers(
        &self,
        resource_ref: &ResourceRef,
        finalizers: &[String],
        expected: &ResourceVersion,
    ) -> Result<K, OperatorError>;

    /// Replaces the object, the expected version is taken from its metadata.
    async fn update_resource(&self, resource: &K) -> Result<K, OperatorError>;

    /// Replaces the status sub-resource, the expected version is taken from its metadata.
    async fn update_status(&self, resource: &K) -> Result<K, OperatorError>;
}

fn namespaced_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn cluster_api<K>(client: Client, _namespace: Option<&str>) -> Api<K>
where
    K: Resource,
    K::DynamicType: Default,
{
    Api::all(client)
}

/// [`WatchProvider`] and [`ResourceClient`] backed by the Kubernetes API.
pub struct KubeApi<K> {
    client: Client,
    api_for: fn(Client, Option<&str>) -> Api<K>,
    field_manager: String,
}

impl<K> Clone for KubeApi<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            api_for: self.api_for,
            field_manager: self.field_manager.clone(),
        }
    }
}

impl<K> KubeApi<K>
where
    K: ManagedResource,
    K::DynamicType: Default,
{
    /// For namespace scoped kinds.
    pub fn namespaced(client: Client) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
    {
        Self {
            client,
            api_for: namespaced_api::<K>,
            field_manager: MANAGER.to_string(),
        }
    }

    /// For cluster scoped kinds.
    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            api_for: cluster_api::<K>,
            field_manager: MANAGER.to_string(),
        }
    }

    pub fn with_field_manager(mut self, field_manager: &str) -> Self {
        self.field_manager = field_manager.to_string();
        self
    }

    fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.api_for)(self.client.clone(), namespace)
    }

    fn post_params(&self) -> PostParams {
        let mut pp = PostParams::default();
        pp.field_manager = Some(self.field_manager.clone());
        pp
    }

    fn resource_ref(resource: &K) -> Result<ResourceRef, OperatorError> {
        ResourceRef::from_resource(resource).ok_or_else(|| {
            OperatorError::Any(anyhow::anyhow!("cannot update object without metadata.name"))
        })
    }
}

fn watch_error(e: watcher::Error) -> OperatorError {
    match e {
        watcher::Error::WatchFailed(kube::Error::SerdeError(e)) => {
            OperatorError::MalformedNotification(e.to_string())
        }
        e => OperatorError::WatchConnection(e.to_string()),
    }
}

fn to_notification<K>(
    event: watcher::Result<watcher::Event<K>>,
) -> Option<Result<Notification<K>, OperatorError>> {
    match event {
        // Additions are told apart from modifications by the event source.
        Ok(watcher::Event::Apply(object)) => Some(Ok(Notification {
            kind: EventKind::Modified,
            object,
        })),
        Ok(watcher::Event::Delete(object)) => Some(Ok(Notification {
            kind: EventKind::Deleted,
            object,
        })),
        // The watcher lost track (e.g. 410 Gone) and relists, the subscription
        // must be re-established so the event source resyncs from the new listing.
        Ok(watcher::Event::Init) => Some(Err(OperatorError::WatchConnection(
            "watch desynchronized, relisting".to_string(),
        ))),
        Ok(watcher::Event::InitApply(_)) | Ok(watcher::Event::InitDone) => None,
        Err(e) => Some(Err(watch_error(e))),
    }
}

#[async_trait]
impl<K> WatchProvider<K> for KubeApi<K>
where
    K: ManagedResource,
    K::DynamicType: Default,
{
    async fn list_and_watch(
        &self,
        namespace: Option<&str>,
    ) -> Result<(Vec<K>, NotificationStream<K>), OperatorError> {
        let mut events = watcher::watcher(self.api(namespace), watcher::Config::default()).boxed();
        let mut listing = Vec::new();
        loop {
            match events.next().await {
                Some(Ok(watcher::Event::Init)) => listing.clear(),
                Some(Ok(watcher::Event::InitApply(object))) => listing.push(object),
                Some(Ok(watcher::Event::InitDone)) => break,
                Some(Ok(_)) => (),
                Some(Err(e)) => return Err(watch_error(e)),
                None => {
                    return Err(OperatorError::WatchConnection(
                        "watch ended before the initial listing completed".to_string(),
                    ));
                }
            }
        }
        let stream = events
            .filter_map(|event| future::ready(to_notification(event)))
            .boxed();
        Ok((listing, stream))
    }
}

#[async_trait]
impl<K> ResourceClient<K> for KubeApi<K>
where
    K: ManagedResource,
    K::DynamicType: Default,
{
    async fn update_finalizers(
        &self,
        resource_ref: &ResourceRef,
        finalizers: &[String],
        expected: &ResourceVersion,
    ) -> Result<K, OperatorError> {
        // A merge patch carrying metadata.resourceVersion is rejected with 409 Conflict
        // if the object changed in the meantime.
        let patch = json!({
            "metadata": {
                "resourceVersion": expected.as_str(),
                "finalizers": finalizers,
            }
        });
        let api = self.api(resource_ref.namespace());
        let response = api
            .patch(
                resource_ref.name.as_str(),
                &PatchParams {
                    field_manager: Some(self.field_manager.clone()),
                    dry_run: false,
                    force: false,
                    field_validation: None,
                },
                &Patch::Merge(&patch),
            )
            .await;
        debug!(
            "Patch finalizers of {} ({}) with {:?} -> {}",
            resource_ref,
            expected,
            finalizers,
            if response.is_ok() { "ok" } else { "failed" }
        );
        response.map_err(|e| OperatorError::from_api(e, resource_ref.to_string().as_str()))
    }

    async fn update_resource(&self, resource: &K) -> Result<K, OperatorError> {
        let resource_ref = Self::resource_ref(resource)?;
        let api = self.api(resource_ref.namespace());
        api.replace(resource_ref.name.as_str(), &self.post_params(), resource)
            .await
            .map_err(|e| OperatorError::from_api(e, resource_ref.to_string().as_str()))
    }

    async fn update_status(&self, resource: &K) -> Result<K, OperatorError> {
        let resource_ref = Self::resource_ref(resource)?;
        let api = self.api(resource_ref.namespace());
        api.replace_status(
            resource_ref.name.as_str(),
            &self.post_params(),
            serde_json::to_vec(resource)?,
        )
        .await
        .map_err(|e| OperatorError::from_api(e, resource_ref.to_string().as_str()))
    }
}
