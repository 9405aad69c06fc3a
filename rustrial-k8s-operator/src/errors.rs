use rustrial_k8s_operator_apis::ConfigurationError;

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum OperatorError {
    /// No configuration resolves for a registered controller, the controller
    /// is not started.
    #[error("no configuration found for controller {0}")]
    ConfigurationMissing(String),
    /// Invalid controller configuration.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),
    /// Transport-level failure of a watch subscription. Retried with backoff
    /// by the event source and never surfaced to the controller.
    #[error("watch connection failed: {0}")]
    WatchConnection(String),
    /// A notification which could not be decoded or lacks identity metadata.
    #[error("malformed notification: {0}")]
    MalformedNotification(String),
    /// Optimistic-concurrency conflict, resolved by awaiting fresher state.
    #[error("stale resourceVersion for {0}")]
    StaleUpdate(String),
    /// The object no longer exists.
    #[error("{0} not found")]
    NotFound(String),
    /// Reconcile logic failed, eligible for retry.
    #[error("reconcile failed: {0:#}")]
    ReconcileTransient(anyhow::Error),
    /// Reconcile logic failed permanently or exhausted its retries.
    #[error("reconcile failed permanently: {0}")]
    ReconcileTerminal(String),
    /// Deletion handling exhausted its retries, the finalizer blocks removal
    /// of the object until somebody intervenes.
    #[error("finalizer stuck: {0}")]
    FinalizerStuck(String),
    /// The pipeline was already started.
    #[error("{0} already started")]
    AlreadyStarted(String),
    /// An event source with the same name is already registered.
    #[error("event source {0} already registered")]
    DuplicateEventSource(String),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl OperatorError {
    pub fn is_temporary(&self) -> bool {
        match self {
            OperatorError::ConfigurationMissing(_)
            | OperatorError::Configuration(_)
            | OperatorError::MalformedNotification(_)
            | OperatorError::ReconcileTerminal(_)
            | OperatorError::FinalizerStuck(_)
            | OperatorError::AlreadyStarted(_)
            | OperatorError::DuplicateEventSource(_) => false,
            _ => true,
        }
    }

    pub fn is_stale_update(&self) -> bool {
        match self {
            OperatorError::StaleUpdate(_) => true,
            OperatorError::KubeApi(e) => e.is_conflict(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound(_) => true,
            OperatorError::KubeApi(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Maps API conflicts and missing objects of `id` to their dedicated variants.
    pub(crate) fn from_api(e: kube::Error, id: &str) -> Self {
        if e.is_conflict() {
            OperatorError::StaleUpdate(id.to_string())
        } else if e.is_not_found() {
            OperatorError::NotFound(id.to_string())
        } else {
            OperatorError::KubeApi(e)
        }
    }
}
