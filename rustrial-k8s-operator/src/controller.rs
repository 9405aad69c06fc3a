use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustrial_k8s_operator_apis::ControllerConfiguration;
use tokio::task::JoinHandle;

use crate::{
    cache::ResourceCache,
    client::{ResourceClient, WatchProvider},
    dispatcher::Dispatcher,
    errors::OperatorError,
    event_handler::EventHandler,
    event_source::CustomResourceEventSource,
    event_source_manager::EventSourceManager,
    reconciler::Reconciler,
    resource::ManagedResource,
    retry::RetryPolicy,
    utils::crd_name,
};

/// One running pipeline: primary event source, cache, scheduler and
/// dispatcher of a single controller.
pub struct Controller<K, R> {
    configuration: ControllerConfiguration,
    reconciler: Arc<R>,
    cache: Arc<ResourceCache<K>>,
    event_sources: EventSourceManager,
    handler: Arc<EventHandler<K, R>>,
    handler_task: Mutex<Option<JoinHandle<()>>>,
}

impl<K, R> Controller<K, R>
where
    K: ManagedResource,
    K::DynamicType: Default,
    R: Reconciler<K>,
{
    /// Wires and starts the pipeline, must be called within a Tokio runtime.
    pub fn start<C>(
        reconciler: R,
        client: Arc<C>,
        configuration: ControllerConfiguration,
    ) -> Result<Arc<Self>, OperatorError>
    where
        C: WatchProvider<K> + ResourceClient<K> + 'static,
    {
        let configuration = match configuration.crd_name {
            Some(_) => configuration,
            None => configuration.with_crd_name(crd_name::<K>()),
        };
        configuration.validate()?;
        let name = configuration.name.as_str();
        let crd = configuration.crd_name.clone().unwrap_or_default();
        let reconciler = Arc::new(reconciler);
        let cache = Arc::new(ResourceCache::new());
        let resource_client: Arc<dyn ResourceClient<K>> = client.clone();
        let provider: Arc<dyn WatchProvider<K>> = client;
        let dispatcher = Dispatcher::new(
            name,
            reconciler.clone(),
            configuration.finalizer().as_str(),
            resource_client,
            cache.clone(),
        );
        let handler = EventHandler::new(
            name,
            cache.clone(),
            dispatcher,
            RetryPolicy::from_configuration(configuration.retry.as_ref()),
            configuration.generation_aware,
            configuration.max_concurrent_reconciles,
        );
        let event_sources = EventSourceManager::new(name);
        reconciler.init(&event_sources)?;
        let primary = CustomResourceEventSource::new(
            format!("{}/{}", name, crd).as_str(),
            provider,
            cache.clone(),
        )
        .with_namespaces(configuration.target_namespaces().cloned())
        .with_backoff(configuration.watch_backoff.clone());
        event_sources.register_source(Arc::new(primary))?;
        let events = event_sources.start()?;
        let handler_task = tokio::spawn(handler.clone().run(events));
        let namespaces = match configuration.target_namespaces() {
            Some(namespaces) => namespaces.iter().cloned().collect::<Vec<_>>().join(","),
            None => "[all namespaces]".to_string(),
        };
        info!(
            "Registered controller {} for CRD {} for namespaces {}",
            name, crd, namespaces
        );
        Ok(Arc::new(Self {
            configuration,
            reconciler,
            cache,
            event_sources,
            handler,
            handler_task: Mutex::new(Some(handler_task)),
        }))
    }

    pub fn configuration(&self) -> &ControllerConfiguration {
        &self.configuration
    }

    pub fn reconciler(&self) -> &Arc<R> {
        &self.reconciler
    }

    pub fn cache(&self) -> &Arc<ResourceCache<K>> {
        &self.cache
    }

    pub fn event_sources(&self) -> &EventSourceManager {
        &self.event_sources
    }

    pub fn handler(&self) -> &Arc<EventHandler<K, R>> {
        &self.handler
    }

    /// Stops the event sources, waits for in-flight reconciliations and
    /// evicts the cache.
    pub async fn stop(&self) {
        let name = self.configuration.name.as_str();
        info!("Stopping controller {}", name);
        self.handler.stop_accepting();
        self.event_sources.stop().await;
        self.handler.shutdown().await;
        let task = self
            .handler_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("[{}] event handler task failed: {}", name, e);
            }
        }
        self.cache.clear();
        info!("Stopped controller {}", name);
    }
}

#[async_trait]
trait RunningController: Send + Sync {
    fn configuration(&self) -> &ControllerConfiguration;
    async fn stop(&self);
}

#[async_trait]
impl<K, R> RunningController for Controller<K, R>
where
    K: ManagedResource,
    K::DynamicType: Default,
    R: Reconciler<K>,
{
    fn configuration(&self) -> &ControllerConfiguration {
        &self.configuration
    }

    async fn stop(&self) {
        Controller::stop(self).await
    }
}

/// Type-erased handle of a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    inner: Arc<dyn RunningController>,
}

impl<K, R> From<Arc<Controller<K, R>>> for ControllerHandle
where
    K: ManagedResource,
    K::DynamicType: Default,
    R: Reconciler<K>,
{
    fn from(controller: Arc<Controller<K, R>>) -> Self {
        Self { inner: controller }
    }
}

impl ControllerHandle {
    pub fn name(&self) -> &str {
        self.inner.configuration().name.as_str()
    }

    pub fn configuration(&self) -> &ControllerConfiguration {
        self.inner.configuration()
    }

    pub async fn stop(&self) {
        self.inner.stop().await
    }
}
