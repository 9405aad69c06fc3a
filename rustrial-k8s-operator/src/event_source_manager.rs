use std::sync::{Arc, Mutex, MutexGuard};

use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, unbounded_channel},
        watch,
    },
    task::JoinHandle,
};

use crate::{
    errors::OperatorError,
    event_source::{EventSink, EventSource},
    resource::Event,
};

/// The merged event stream of all sources of a pipeline.
pub type EventStream = UnboundedReceiver<Event>;

#[derive(Default)]
struct State {
    sources: Vec<Arc<dyn EventSource>>,
    sink: Option<EventSink>,
    stream: Option<EventStream>,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

/// Owns the event sources of one pipeline and merges their output into a
/// single stream consumed by the event handler.
///
/// Sources registered after [`EventSourceManager::start`] are started right
/// away.
pub struct EventSourceManager {
    controller: String,
    state: Mutex<State>,
    shutdown: watch::Sender<bool>,
}

impl EventSourceManager {
    pub fn new(controller: &str) -> Self {
        let (sink, stream) = unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            controller: controller.to_string(),
            state: Mutex::new(State {
                sink: Some(sink),
                stream: Some(stream),
                ..Default::default()
            }),
            shutdown,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn(&self, sink: &EventSink, source: Arc<dyn EventSource>) -> JoinHandle<()> {
        let sink = sink.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { source.run(sink, shutdown).await })
    }

    pub fn register_source(&self, source: Arc<dyn EventSource>) -> Result<(), OperatorError> {
        let mut state = self.state();
        if state.sources.iter().any(|s| s.name() == source.name()) {
            return Err(OperatorError::DuplicateEventSource(source.name().to_string()));
        }
        debug!(
            "[{}] registered event source {}",
            self.controller,
            source.name()
        );
        if state.started {
            match state.sink.as_ref() {
                Some(sink) => {
                    let task = self.spawn(sink, source.clone());
                    state.tasks.push(task);
                }
                None => {
                    warn!(
                        "[{}] not starting event source {} as the pipeline is stopped",
                        self.controller,
                        source.name()
                    );
                }
            }
        }
        state.sources.push(source);
        Ok(())
    }

    /// Registers a source of events about related (e.g. owned) objects.
    pub fn register_secondary_source(
        &self,
        source: Arc<dyn EventSource>,
    ) -> Result<(), OperatorError> {
        info!(
            "[{}] watching secondary resources via {}",
            self.controller,
            source.name()
        );
        self.register_source(source)
    }

    pub fn source_names(&self) -> Vec<String> {
        self.state()
            .sources
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Starts all registered sources and hands out the merged event stream.
    pub fn start(&self) -> Result<EventStream, OperatorError> {
        let mut state = self.state();
        let (Some(sink), Some(stream)) = (state.sink.clone(), state.stream.take()) else {
            return Err(OperatorError::AlreadyStarted(format!(
                "event sources of controller {}",
                self.controller
            )));
        };
        let tasks: Vec<_> = state
            .sources
            .iter()
            .map(|source| self.spawn(&sink, source.clone()))
            .collect();
        state.tasks.extend(tasks);
        state.started = true;
        Ok(stream)
    }

    /// Stops all sources and waits for them to terminate. The event stream
    /// ends once all buffered events were consumed.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let tasks = {
            let mut state = self.state();
            state.sink = None;
            state.stream = None;
            std::mem::take(&mut state.tasks)
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("[{}] event source task failed: {}", self.controller, e);
            }
        }
        debug!("[{}] stopped event sources", self.controller);
    }
}
