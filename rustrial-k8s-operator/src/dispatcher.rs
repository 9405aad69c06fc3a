use std::{sync::Arc, time::Duration};

use crate::{
    cache::ResourceCache,
    client::ResourceClient,
    errors::OperatorError,
    reconciler::{Context, ReconcileError, Reconciler},
    resource::{CachedEntry, ManagedResource},
    retry::RetryInfo,
    utils::{add_finalizer_if_missing, remove_finalizer},
};

/// Result of a single dispatch.
#[derive(Debug)]
pub enum Outcome {
    Success { requeue_after: Option<Duration> },
    TransientFailure(OperatorError),
    TerminalFailure(OperatorError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

/// Invokes reconcile logic for one resource snapshot and enforces the
/// finalizer protocol around it: the finalizer is added before the first
/// reconcile and only removed after a successful cleanup.
pub struct Dispatcher<K, R> {
    controller: String,
    reconciler: Arc<R>,
    finalizer: String,
    client: Arc<dyn ResourceClient<K>>,
    cache: Arc<ResourceCache<K>>,
}

impl<K, R> Dispatcher<K, R>
where
    K: ManagedResource,
    R: Reconciler<K>,
{
    pub fn new(
        controller: &str,
        reconciler: Arc<R>,
        finalizer: &str,
        client: Arc<dyn ResourceClient<K>>,
        cache: Arc<ResourceCache<K>>,
    ) -> Self {
        Self {
            controller: controller.to_string(),
            reconciler,
            finalizer: finalizer.to_string(),
            client,
            cache,
        }
    }

    pub fn finalizer(&self) -> &str {
        self.finalizer.as_str()
    }

    pub async fn dispatch(&self, entry: CachedEntry<K>, retry: RetryInfo) -> Outcome {
        if entry.tombstone {
            debug!(
                "[{}] {} no longer exists, evicting it",
                self.controller, entry.resource_ref
            );
            self.cache.evict(&entry.resource_ref, &entry.resource_version);
            return Outcome::Success {
                requeue_after: None,
            };
        }
        let ctx = Context::new(
            self.controller.as_str(),
            entry.resource_ref.clone(),
            retry,
            self.client.clone(),
        );
        if entry.deletion_timestamp_set {
            self.handle_delete(entry, &ctx).await
        } else {
            self.handle_create_or_update(entry, &ctx).await
        }
    }

    async fn handle_delete(&self, entry: CachedEntry<K>, ctx: &Context<K>) -> Outcome {
        let id = &entry.resource_ref;
        if !entry.has_finalizer(self.finalizer()) {
            debug!(
                "[{}] skip cleanup of {} as finalizer {} is not present",
                self.controller, id, self.finalizer
            );
            self.cache.evict(id, &entry.resource_version);
            return Outcome::Success {
                requeue_after: None,
            };
        }
        if let Err(e) = self.reconciler.cleanup(entry.payload.clone(), ctx).await {
            let e = match e {
                ReconcileError::Transient(e) | ReconcileError::Permanent(e) => e,
            };
            warn!("[{}] cleanup of {} failed: {:#}", self.controller, id, e);
            return Outcome::TransientFailure(OperatorError::ReconcileTransient(e));
        }
        match remove_finalizer(self.client.as_ref(), &entry, self.finalizer()).await {
            Ok(updated) => {
                info!(
                    "[{}] removed finalizer {} from {}",
                    self.controller, self.finalizer, id
                );
                let version = updated
                    .and_then(|o| CachedEntry::from_resource(o).ok())
                    .map(|e| e.resource_version)
                    .unwrap_or_else(|| entry.resource_version.clone());
                self.cache.evict(id, &version);
                Outcome::Success {
                    requeue_after: None,
                }
            }
            Err(e) => {
                debug!(
                    "[{}] failed to remove finalizer {} from {}: {}",
                    self.controller, self.finalizer, id, e
                );
                Outcome::TransientFailure(e)
            }
        }
    }

    async fn handle_create_or_update(&self, entry: CachedEntry<K>, ctx: &Context<K>) -> Outcome {
        let id = &entry.resource_ref;
        let added = add_finalizer_if_missing(self.client.as_ref(), &entry, self.finalizer()).await;
        let resource = match added {
            Ok(Some(updated)) => {
                debug!(
                    "[{}] added finalizer {} to {}",
                    self.controller, self.finalizer, id
                );
                match CachedEntry::from_resource(updated) {
                    Ok(updated) => {
                        let payload = updated.payload.clone();
                        self.cache.put(updated);
                        payload
                    }
                    Err(_) => entry.payload.clone(),
                }
            }
            Ok(None) => entry.payload.clone(),
            Err(e) => {
                debug!(
                    "[{}] failed to add finalizer {} to {}: {}",
                    self.controller, self.finalizer, id, e
                );
                return Outcome::TransientFailure(e);
            }
        };
        match self.reconciler.reconcile(resource, ctx).await {
            Ok(action) => Outcome::Success {
                requeue_after: action.requeue_after(),
            },
            Err(ReconcileError::Transient(e)) => {
                Outcome::TransientFailure(OperatorError::ReconcileTransient(e))
            }
            Err(ReconcileError::Permanent(e)) => Outcome::TerminalFailure(
                OperatorError::ReconcileTerminal(format!("{}: {:#}", id, e)),
            ),
        }
    }
}
