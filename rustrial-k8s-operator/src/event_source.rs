use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use futures::{StreamExt, future::join_all};
use kube::Resource;
use rustrial_k8s_operator_apis::WatchBackoffConfiguration;
use tokio::sync::{mpsc::UnboundedSender, watch};

use crate::{
    cache::ResourceCache,
    client::{Notification, WatchProvider},
    errors::OperatorError,
    resource::{CachedEntry, Event, EventKind, ManagedResource, ResourceRef},
    retry::ReconnectBackoff,
};

/// Sending half of a pipeline's event stream.
pub type EventSink = UnboundedSender<Event>;

/// Flips to `true` once the owning pipeline shuts down.
pub type ShutdownSignal = watch::Receiver<bool>;

/// Produces [`Event`]s for a pipeline.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Unique name within a pipeline.
    fn name(&self) -> &str;

    /// Emits events into `sink` until `shutdown` fires or the sink is closed.
    async fn run(&self, sink: EventSink, shutdown: ShutdownSignal);
}

/// Resolves once shutdown was requested or the requesting side is gone.
pub(crate) async fn stopped(shutdown: &mut ShutdownSignal) {
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}

fn emit(sink: &EventSink, event: Event) {
    if sink.send(event).is_err() {
        trace!("event sink closed, dropping event");
    }
}

/// Keeps one list+watch subscription alive, reconnecting with backoff until
/// shutdown. Every (re-)established subscription starts with a listing.
#[allow(clippy::too_many_arguments)]
async fn watch_with_reconnect<K, L, N>(
    label: &str,
    provider: &dyn WatchProvider<K>,
    namespace: Option<&str>,
    backoff: &WatchBackoffConfiguration,
    sink: &EventSink,
    mut shutdown: ShutdownSignal,
    mut on_listing: L,
    mut on_notification: N,
) where
    K: ManagedResource,
    L: FnMut(Vec<K>) + Send,
    N: FnMut(Notification<K>) + Send,
{
    let scope = namespace.unwrap_or("*");
    let mut backoff = ReconnectBackoff::new(backoff);
    loop {
        if *shutdown.borrow() || sink.is_closed() {
            break;
        }
        let connected_at = Instant::now();
        let subscription = tokio::select! {
            subscription = provider.list_and_watch(namespace) => subscription,
            _ = stopped(&mut shutdown) => break,
        };
        match subscription {
            Ok((listing, mut stream)) => {
                debug!(
                    "[{}] subscribed in namespace {}, listed {} objects",
                    label,
                    scope,
                    listing.len()
                );
                on_listing(listing);
                loop {
                    let next = tokio::select! {
                        next = stream.next() => next,
                        _ = stopped(&mut shutdown) => return,
                    };
                    match next {
                        Some(Ok(notification)) => on_notification(notification),
                        Some(Err(OperatorError::MalformedNotification(e))) => {
                            warn!("[{}] dropping malformed notification: {}", label, e);
                        }
                        Some(Err(e)) => {
                            warn!("[{}] watch in namespace {} failed: {}", label, scope, e);
                            break;
                        }
                        None => {
                            debug!("[{}] watch in namespace {} ended", label, scope);
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("[{}] subscription in namespace {} failed: {}", label, scope, e);
            }
        }
        backoff.observe_connected(connected_at.elapsed());
        let delay = backoff.next_delay();
        debug!(
            "[{}] reconnecting in namespace {} after {:?}",
            label, scope, delay
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => (),
            _ = stopped(&mut shutdown) => break,
        }
    }
    debug!("[{}] stopped watching namespace {}", label, scope);
}

/// The primary event source of a pipeline: keeps the [`ResourceCache`] in
/// sync with the remote state of the controlled resource kind.
pub struct CustomResourceEventSource<K> {
    name: String,
    provider: Arc<dyn WatchProvider<K>>,
    cache: Arc<ResourceCache<K>>,
    namespaces: Option<BTreeSet<String>>,
    backoff: WatchBackoffConfiguration,
}

impl<K: ManagedResource> CustomResourceEventSource<K> {
    pub fn new(
        name: &str,
        provider: Arc<dyn WatchProvider<K>>,
        cache: Arc<ResourceCache<K>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            provider,
            cache,
            namespaces: None,
            backoff: Default::default(),
        }
    }

    /// Restrict to `namespaces`, `None` watches all namespaces.
    pub fn with_namespaces(mut self, namespaces: Option<BTreeSet<String>>) -> Self {
        self.namespaces = namespaces;
        self
    }

    pub fn with_backoff(mut self, backoff: WatchBackoffConfiguration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Applies a fresh listing: new or changed objects yield `Added` or
    /// `Modified`, cached objects missing from the listing yield `Deleted`.
    fn resync(&self, namespace: Option<&str>, listing: Vec<K>, sink: &EventSink) {
        let mut listed = HashSet::new();
        for object in listing {
            let entry = match CachedEntry::from_resource(object) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("[{}] ignoring listed object: {}", self.name, e);
                    continue;
                }
            };
            listed.insert(entry.resource_ref.clone());
            let kind = match self.cache.get(&entry.resource_ref) {
                None => EventKind::Added,
                Some(cached) if cached.tombstone => EventKind::Added,
                Some(cached) if entry.resource_version.is_newer_than(&cached.resource_version) => {
                    EventKind::Modified
                }
                Some(_) => continue,
            };
            let event = Event::for_entry(kind, &entry, self.name.as_str());
            if self.cache.put(entry) {
                emit(sink, event);
            }
        }
        for resource_ref in self.cache.refs(namespace) {
            if listed.contains(&resource_ref) {
                continue;
            }
            match self.cache.get(&resource_ref) {
                Some(cached) if !cached.tombstone => {
                    if let Some(tombstone) = self.cache.mark_tombstone(&resource_ref) {
                        debug!(
                            "[{}] {} vanished while disconnected",
                            self.name, resource_ref
                        );
                        emit(
                            sink,
                            Event::for_entry(EventKind::Deleted, &tombstone, self.name.as_str()),
                        );
                    }
                }
                _ => (),
            }
        }
    }

    fn on_notification(&self, notification: Notification<K>, sink: &EventSink) {
        let entry = match CachedEntry::from_resource(notification.object) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("[{}] dropping {} notification: {}", self.name, notification.kind, e);
                return;
            }
        };
        // Watches which do not tell additions apart report them as modifications.
        let kind = match notification.kind {
            EventKind::Modified
                if self
                    .cache
                    .get(&entry.resource_ref)
                    .is_none_or(|cached| cached.tombstone) =>
            {
                EventKind::Added
            }
            kind => kind,
        };
        let entry = if kind == EventKind::Deleted {
            entry.into_tombstone()
        } else {
            entry
        };
        let event = Event::for_entry(kind, &entry, self.name.as_str());
        let id = entry.resource_ref.clone();
        let version = entry.resource_version.clone();
        if self.cache.put(entry) {
            emit(sink, event);
        } else {
            debug!(
                "[{}] ignoring stale {} notification of {} ({})",
                self.name, kind, id, version
            );
        }
    }

    async fn watch(&self, namespace: Option<&str>, sink: EventSink, shutdown: ShutdownSignal) {
        watch_with_reconnect(
            self.name.as_str(),
            self.provider.as_ref(),
            namespace,
            &self.backoff,
            &sink,
            shutdown,
            |listing| self.resync(namespace, listing, &sink),
            |notification| self.on_notification(notification, &sink),
        )
        .await
    }
}

#[async_trait]
impl<K: ManagedResource> EventSource for CustomResourceEventSource<K> {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    async fn run(&self, sink: EventSink, shutdown: ShutdownSignal) {
        match &self.namespaces {
            None => self.watch(None, sink, shutdown).await,
            Some(namespaces) => {
                join_all(
                    namespaces
                        .iter()
                        .map(|ns| self.watch(Some(ns.as_str()), sink.clone(), shutdown.clone())),
                )
                .await;
            }
        }
    }
}

/// Maps a changed secondary object to the primary resources it relates to.
pub type RelationMapper<C> = Arc<dyn Fn(&C) -> Vec<ResourceRef> + Send + Sync>;

/// Secondary event source: emits `Related` events for the primary resources
/// of changed secondary objects, e.g. the owners of owned objects.
pub struct OwnedResourceEventSource<C> {
    name: String,
    provider: Arc<dyn WatchProvider<C>>,
    namespaces: Option<BTreeSet<String>>,
    backoff: WatchBackoffConfiguration,
    mapper: RelationMapper<C>,
}

impl<C: ManagedResource> OwnedResourceEventSource<C> {
    pub fn new(name: &str, provider: Arc<dyn WatchProvider<C>>, mapper: RelationMapper<C>) -> Self {
        Self {
            name: name.to_string(),
            provider,
            namespaces: None,
            backoff: Default::default(),
            mapper,
        }
    }

    /// Relates secondary objects to their owners of kind `P` via owner references.
    pub fn owned_by<P>(name: &str, provider: Arc<dyn WatchProvider<C>>) -> Self
    where
        P: Resource,
        P::DynamicType: Default,
    {
        let dt = P::DynamicType::default();
        let kind = P::kind(&dt).to_string();
        let api_version = P::api_version(&dt).to_string();
        let mapper: RelationMapper<C> = Arc::new(move |o: &C| {
            let namespace = o.meta().namespace.as_deref();
            o.meta()
                .owner_references
                .iter()
                .flatten()
                .filter(|r| r.kind == kind && r.api_version == api_version)
                .map(|r| ResourceRef::new(namespace, r.name.as_str()))
                .collect::<Vec<_>>()
        });
        Self::new(name, provider, mapper)
    }

    pub fn with_namespaces(mut self, namespaces: Option<BTreeSet<String>>) -> Self {
        self.namespaces = namespaces;
        self
    }

    pub fn with_backoff(mut self, backoff: WatchBackoffConfiguration) -> Self {
        self.backoff = backoff;
        self
    }

    fn relate(&self, object: &C, sink: &EventSink) {
        for resource_ref in (self.mapper)(object) {
            emit(sink, Event::related(resource_ref, self.name.as_str()));
        }
    }

    async fn watch(&self, namespace: Option<&str>, sink: EventSink, shutdown: ShutdownSignal) {
        watch_with_reconnect(
            self.name.as_str(),
            self.provider.as_ref(),
            namespace,
            &self.backoff,
            &sink,
            shutdown,
            |listing| {
                for object in listing.iter() {
                    self.relate(object, &sink);
                }
            },
            |notification| self.relate(&notification.object, &sink),
        )
        .await
    }
}

#[async_trait]
impl<C: ManagedResource> EventSource for OwnedResourceEventSource<C> {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    async fn run(&self, sink: EventSink, shutdown: ShutdownSignal) {
        match &self.namespaces {
            None => self.watch(None, sink, shutdown).await,
            Some(namespaces) => {
                join_all(
                    namespaces
                        .iter()
                        .map(|ns| self.watch(Some(ns.as_str()), sink.clone(), shutdown.clone())),
                )
                .await;
            }
        }
    }
}
