//! In-memory cluster and reconciler doubles for pipeline tests.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use k8s_openapi::{
    api::core::v1::ConfigMap,
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
    chrono::Utc,
};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

use crate::{
    client::{Notification, NotificationStream, ResourceClient, WatchProvider},
    errors::OperatorError,
    event_source::EventSource,
    event_source_manager::EventSourceManager,
    reconciler::{Action, Context, ReconcileError, Reconciler},
    resource::{EventKind, ResourceRef, ResourceVersion},
    retry::RetryInfo,
};

pub(crate) fn config_map(ns: &str, name: &str, rv: &str, generation: i64) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            resource_version: Some(rv.to_string()),
            generation: Some(generation),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Polls `condition` until it holds, panics after five seconds.
pub(crate) async fn eventually(description: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", description);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

type Watcher = (
    Option<String>,
    UnboundedSender<Result<Notification<ConfigMap>, OperatorError>>,
);

#[derive(Default)]
struct ClusterState {
    objects: BTreeMap<ResourceRef, ConfigMap>,
    version: u64,
    watchers: Vec<Watcher>,
}

impl ClusterState {
    fn bump(&mut self, object: &mut ConfigMap) {
        self.version += 1;
        object.metadata.resource_version = Some(self.version.to_string());
    }

    fn notify(&mut self, kind: EventKind, object: &ConfigMap) {
        let namespace = object.metadata.namespace.clone();
        self.watchers.retain(|(scope, tx)| {
            if scope.is_none() || *scope == namespace {
                tx.send(Ok(Notification {
                    kind,
                    object: object.clone(),
                }))
                .is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Namespaced ConfigMaps with increasing integer resource versions.
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<ClusterState>,
    list_calls: AtomicUsize,
    conflicts: AtomicUsize,
    failing_subscriptions: AtomicUsize,
    finalizer_updates: Mutex<Vec<(ResourceRef, Vec<String>)>>,
    status_updates: AtomicUsize,
}

impl FakeCluster {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Default::default())
    }

    pub(crate) fn create(&self, ns: &str, name: &str, generation: i64) -> ConfigMap {
        self.apply(config_map(ns, name, "", generation))
    }

    pub(crate) fn create_with_finalizers(
        &self,
        ns: &str,
        name: &str,
        generation: i64,
        finalizers: &[&str],
    ) -> ConfigMap {
        let mut object = config_map(ns, name, "", generation);
        object.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        self.apply(object)
    }

    /// Creates or replaces `object` with a fresh resource version, keeping the
    /// finalizers of an existing object.
    pub(crate) fn apply(&self, mut object: ConfigMap) -> ConfigMap {
        self.store(&mut object, true);
        object
    }

    /// Like [`FakeCluster::apply`] without notifying watchers.
    pub(crate) fn apply_silently(&self, mut object: ConfigMap) -> ConfigMap {
        self.store(&mut object, false);
        object
    }

    fn store(&self, object: &mut ConfigMap, notify: bool) {
        let id = ResourceRef::from_resource(&*object).unwrap();
        let mut state = self.state.lock().unwrap();
        let kind = match state.objects.get(&id) {
            Some(existing) => {
                if object.metadata.finalizers.is_none() {
                    object.metadata.finalizers = existing.metadata.finalizers.clone();
                }
                EventKind::Modified
            }
            None => EventKind::Added,
        };
        state.bump(object);
        state.objects.insert(id, object.clone());
        if notify {
            state.notify(kind, object);
        }
    }

    /// Sets the generation of an existing object, as a spec change would.
    pub(crate) fn set_generation(&self, id: &ResourceRef, generation: i64) -> ConfigMap {
        let mut object = self.get(id).unwrap();
        object.metadata.generation = Some(generation);
        self.apply(object)
    }

    /// A change which does not bump the generation, like a status update.
    pub(crate) fn touch(&self, id: &ResourceRef) -> ConfigMap {
        self.apply(self.get(id).unwrap())
    }

    /// Requests deletion: objects with finalizers only get a deletion timestamp.
    pub(crate) fn delete(&self, id: &ResourceRef) {
        let mut state = self.state.lock().unwrap();
        if let Some(mut object) = state.objects.get(id).cloned() {
            state.bump(&mut object);
            if object.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty()) {
                state.objects.remove(id);
                state.notify(EventKind::Deleted, &object);
            } else {
                object.metadata.deletion_timestamp = Some(Time(Utc::now()));
                state.objects.insert(id.clone(), object.clone());
                state.notify(EventKind::Modified, &object);
            }
        }
    }

    /// Removes the object without notifying watchers, as if the deletion
    /// notification got lost.
    pub(crate) fn remove_silently(&self, id: &ResourceRef) {
        let mut state = self.state.lock().unwrap();
        state.objects.remove(id);
    }

    pub(crate) fn get(&self, id: &ResourceRef) -> Option<ConfigMap> {
        self.state.lock().unwrap().objects.get(id).cloned()
    }

    /// Sends a raw notification to all watchers.
    pub(crate) fn send(&self, kind: EventKind, object: ConfigMap) {
        self.state.lock().unwrap().notify(kind, &object);
    }

    pub(crate) fn send_malformed(&self) {
        let mut state = self.state.lock().unwrap();
        state.watchers.retain(|(_, tx)| {
            tx.send(Err(OperatorError::MalformedNotification(
                "unexpected end of input".to_string(),
            )))
            .is_ok()
        });
    }

    /// Terminates all open notification streams.
    pub(crate) fn disconnect(&self) {
        self.state.lock().unwrap().watchers.clear();
    }

    pub(crate) fn watcher_count(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.watchers.retain(|(_, tx)| !tx.is_closed());
        state.watchers.len()
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// The next `n` finalizer updates fail with a conflict.
    pub(crate) fn inject_conflicts(&self, n: usize) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// The next `n` subscriptions fail.
    pub(crate) fn fail_subscriptions(&self, n: usize) {
        self.failing_subscriptions.store(n, Ordering::SeqCst);
    }

    pub(crate) fn finalizer_updates(&self) -> Vec<(ResourceRef, Vec<String>)> {
        self.finalizer_updates.lock().unwrap().clone()
    }

    pub(crate) fn status_updates(&self) -> usize {
        self.status_updates.load(Ordering::SeqCst)
    }

    fn replace(
        &self,
        resource: &ConfigMap,
        bump_generation: bool,
    ) -> Result<ConfigMap, OperatorError> {
        let id = ResourceRef::from_resource(resource).unwrap();
        let mut state = self.state.lock().unwrap();
        let current = state
            .objects
            .get(&id)
            .cloned()
            .ok_or_else(|| OperatorError::NotFound(id.to_string()))?;
        if current.metadata.resource_version != resource.metadata.resource_version {
            return Err(OperatorError::StaleUpdate(id.to_string()));
        }
        let mut updated = resource.clone();
        if bump_generation && current.data != resource.data {
            updated.metadata.generation = current.metadata.generation.map(|g| g + 1);
        }
        state.bump(&mut updated);
        state.objects.insert(id, updated.clone());
        state.notify(EventKind::Modified, &updated);
        Ok(updated)
    }
}

#[async_trait]
impl WatchProvider<ConfigMap> for FakeCluster {
    async fn list_and_watch(
        &self,
        namespace: Option<&str>,
    ) -> Result<(Vec<ConfigMap>, NotificationStream<ConfigMap>), OperatorError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failing_subscriptions) {
            return Err(OperatorError::WatchConnection("connection refused".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        let items = state
            .objects
            .iter()
            .filter(|(id, _)| id.is_within(namespace))
            .map(|(_, o)| o.clone())
            .collect();
        let (tx, rx) = unbounded_channel();
        state.watchers.push((namespace.map(|v| v.to_string()), tx));
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok((items, stream))
    }
}

#[async_trait]
impl ResourceClient<ConfigMap> for FakeCluster {
    async fn update_finalizers(
        &self,
        resource_ref: &ResourceRef,
        finalizers: &[String],
        expected: &ResourceVersion,
    ) -> Result<ConfigMap, OperatorError> {
        self.finalizer_updates
            .lock()
            .unwrap()
            .push((resource_ref.clone(), finalizers.to_vec()));
        if take_one(&self.conflicts) {
            return Err(OperatorError::StaleUpdate(resource_ref.to_string()));
        }
        let mut state = self.state.lock().unwrap();
        let mut object = state
            .objects
            .get(resource_ref)
            .cloned()
            .ok_or_else(|| OperatorError::NotFound(resource_ref.to_string()))?;
        if object.metadata.resource_version.as_deref() != Some(expected.as_str()) {
            return Err(OperatorError::StaleUpdate(resource_ref.to_string()));
        }
        object.metadata.finalizers = Some(finalizers.to_vec());
        state.bump(&mut object);
        if object.metadata.deletion_timestamp.is_some() && finalizers.is_empty() {
            state.objects.remove(resource_ref);
            state.notify(EventKind::Deleted, &object);
        } else {
            state.objects.insert(resource_ref.clone(), object.clone());
            state.notify(EventKind::Modified, &object);
        }
        Ok(object)
    }

    async fn update_resource(&self, resource: &ConfigMap) -> Result<ConfigMap, OperatorError> {
        self.replace(resource, true)
    }

    async fn update_status(&self, resource: &ConfigMap) -> Result<ConfigMap, OperatorError> {
        self.status_updates.fetch_add(1, Ordering::SeqCst);
        self.replace(resource, false)
    }
}

/// Reconciler with scripted results, the fallback action (by default
/// `Action::await_change()`) once the script is exhausted. Tracks how many
/// reconciliations overlap.
#[derive(Default)]
pub(crate) struct TestReconciler {
    reconciles: AtomicUsize,
    cleanups: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    reconcile_results: Mutex<VecDeque<Result<Action, ReconcileError>>>,
    fallback: Mutex<Action>,
    cleanup_results: Mutex<VecDeque<Result<(), ReconcileError>>>,
    seen: Mutex<Vec<ConfigMap>>,
    attempts: Mutex<Vec<RetryInfo>>,
    secondary_sources: Mutex<Vec<Arc<dyn EventSource>>>,
}

impl TestReconciler {
    pub(crate) fn with_delay(delay: Duration) -> Self {
        let reconciler = Self::default();
        *reconciler.delay.lock().unwrap() = Some(delay);
        reconciler
    }

    pub(crate) fn push_reconcile(&self, result: Result<Action, ReconcileError>) {
        self.reconcile_results.lock().unwrap().push_back(result);
    }

    pub(crate) fn set_fallback(&self, action: Action) {
        *self.fallback.lock().unwrap() = action;
    }

    pub(crate) fn push_cleanup(&self, result: Result<(), ReconcileError>) {
        self.cleanup_results.lock().unwrap().push_back(result);
    }

    /// Registered as secondary source when the pipeline initializes.
    pub(crate) fn add_secondary_source(&self, source: Arc<dyn EventSource>) {
        self.secondary_sources.lock().unwrap().push(source);
    }

    pub(crate) fn reconcile_count(&self) -> usize {
        self.reconciles.load(Ordering::SeqCst)
    }

    pub(crate) fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub(crate) fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Objects handed to `reconcile`, in order.
    pub(crate) fn seen(&self) -> Vec<ConfigMap> {
        self.seen.lock().unwrap().clone()
    }

    pub(crate) fn attempts(&self) -> Vec<RetryInfo> {
        self.attempts.lock().unwrap().clone()
    }

    async fn enter(&self) {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Reconciler<ConfigMap> for TestReconciler {
    fn name(&self) -> String {
        "test".to_string()
    }

    fn init(&self, event_sources: &EventSourceManager) -> Result<(), OperatorError> {
        for source in self.secondary_sources.lock().unwrap().drain(..) {
            event_sources.register_secondary_source(source)?;
        }
        Ok(())
    }

    async fn reconcile(
        &self,
        resource: Arc<ConfigMap>,
        ctx: &Context<ConfigMap>,
    ) -> Result<Action, ReconcileError> {
        self.enter().await;
        self.seen.lock().unwrap().push(resource.as_ref().clone());
        self.attempts.lock().unwrap().push(ctx.retry_info());
        let fallback = *self.fallback.lock().unwrap();
        let result = self
            .reconcile_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(fallback));
        self.reconciles.fetch_add(1, Ordering::SeqCst);
        self.exit();
        result
    }

    async fn cleanup(
        &self,
        _resource: Arc<ConfigMap>,
        _ctx: &Context<ConfigMap>,
    ) -> Result<(), ReconcileError> {
        self.enter().await;
        let result = self.cleanup_results.lock().unwrap().pop_front().unwrap_or(Ok(()));
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        self.exit();
        result
    }
}
