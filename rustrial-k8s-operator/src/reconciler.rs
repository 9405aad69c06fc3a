use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    client::ResourceClient,
    errors::OperatorError,
    event_source_manager::EventSourceManager,
    resource::{ManagedResource, ResourceRef},
    retry::RetryInfo,
};

/// What should happen after a successful reconciliation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `duration`, even if nothing changed.
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Only reconcile again if the resource changes.
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Failure reported by reconcile logic.
#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    /// Eligible for retry according to the controller's retry policy.
    #[error("{0:#}")]
    Transient(#[from] anyhow::Error),
    /// Never retried automatically, only a new change of the resource
    /// triggers another attempt.
    #[error("{0:#}")]
    Permanent(anyhow::Error),
}

impl ReconcileError {
    pub fn transient(e: impl Into<anyhow::Error>) -> Self {
        ReconcileError::Transient(e.into())
    }

    pub fn permanent(e: impl Into<anyhow::Error>) -> Self {
        ReconcileError::Permanent(e.into())
    }
}

impl From<OperatorError> for ReconcileError {
    fn from(e: OperatorError) -> Self {
        if e.is_temporary() {
            ReconcileError::Transient(e.into())
        } else {
            ReconcileError::Permanent(e.into())
        }
    }
}

impl From<kube::Error> for ReconcileError {
    fn from(e: kube::Error) -> Self {
        ReconcileError::Transient(e.into())
    }
}

/// Everything reconcile logic gets to know besides the resource itself.
pub struct Context<K> {
    controller: String,
    resource_ref: ResourceRef,
    retry: RetryInfo,
    client: Arc<dyn ResourceClient<K>>,
}

impl<K> Context<K> {
    pub(crate) fn new(
        controller: &str,
        resource_ref: ResourceRef,
        retry: RetryInfo,
        client: Arc<dyn ResourceClient<K>>,
    ) -> Self {
        Self {
            controller: controller.to_string(),
            resource_ref,
            retry,
            client,
        }
    }

    pub fn controller_name(&self) -> &str {
        self.controller.as_str()
    }

    pub fn resource_ref(&self) -> &ResourceRef {
        &self.resource_ref
    }

    pub fn retry_info(&self) -> RetryInfo {
        self.retry
    }

    pub fn client(&self) -> &Arc<dyn ResourceClient<K>> {
        &self.client
    }

    /// Replaces the resource. Fails with [`OperatorError::StaleUpdate`] if it
    /// changed since it was handed to reconcile logic.
    pub async fn update_resource(&self, resource: &K) -> Result<K, OperatorError> {
        self.client.update_resource(resource).await
    }

    /// Replaces the status of the resource, with the same concurrency
    /// semantics as [`Context::update_resource`].
    pub async fn update_status(&self, resource: &K) -> Result<K, OperatorError> {
        self.client.update_status(resource).await
    }
}

/// Reconcile logic of one controller.
///
/// The pipeline guarantees that `reconcile` and `cleanup` never run
/// concurrently for the same resource.
#[async_trait]
pub trait Reconciler<K: ManagedResource>: Send + Sync + 'static {
    /// The controller name, used to resolve its configuration.
    fn name(&self) -> String;

    /// Called once before the pipeline starts, the place to register
    /// additional event sources.
    fn init(&self, _event_sources: &EventSourceManager) -> Result<(), OperatorError> {
        Ok(())
    }

    /// Drives the actual state towards the desired state of `resource`.
    async fn reconcile(&self, resource: Arc<K>, ctx: &Context<K>) -> Result<Action, ReconcileError>;

    /// Releases everything `resource` owns outside of Kubernetes, called
    /// before the finalizer is removed from a deleted resource.
    async fn cleanup(&self, resource: Arc<K>, ctx: &Context<K>) -> Result<(), ReconcileError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions() {
        assert_eq!(None, Action::await_change().requeue_after());
        assert_eq!(Action::default(), Action::await_change());
        assert_eq!(
            Some(Duration::from_secs(5)),
            Action::requeue(Duration::from_secs(5)).requeue_after()
        );
    }

    #[test]
    fn error_conversion() {
        let e: ReconcileError = OperatorError::StaleUpdate("ns1/foo".to_string()).into();
        assert!(matches!(e, ReconcileError::Transient(_)));
        let e: ReconcileError = OperatorError::ReconcileTerminal("ns1/foo".to_string()).into();
        assert!(matches!(e, ReconcileError::Permanent(_)));
        let e: ReconcileError = anyhow::anyhow!("boom").into();
        assert!(matches!(e, ReconcileError::Transient(_)));
        assert_eq!("boom", ReconcileError::permanent(anyhow::anyhow!("boom")).to_string());
    }
}
