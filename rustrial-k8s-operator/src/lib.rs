//! Runtime for Kubernetes operators: keeps a local cache of custom resources
//! in sync with the cluster and drives user supplied reconcile logic through
//! a per-resource scheduler with finalizer handling and retries.

#[macro_use]
extern crate log;

pub mod cache;
pub mod client;
pub mod controller;
pub mod dispatcher;
pub mod errors;
pub mod event_handler;
pub mod event_source;
pub mod event_source_manager;
pub mod modifications;
pub mod operator;
pub mod reconciler;
pub mod resource;
pub mod retry;
mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::ResourceCache;
pub use client::{KubeApi, ResourceClient, WatchProvider};
pub use controller::{Controller, ControllerHandle};
pub use errors::OperatorError;
pub use event_handler::{EventHandler, Phase, SchedulingSnapshot};
pub use event_source::{CustomResourceEventSource, EventSource, OwnedResourceEventSource};
pub use event_source_manager::EventSourceManager;
pub use modifications::ResourceModifications;
pub use operator::{ConfigurationService, Operator};
pub use reconciler::{Action, Context, ReconcileError, Reconciler};
pub use resource::{CachedEntry, Event, EventKind, ResourceRef, ResourceVersion};
pub use retry::{RetryInfo, RetryPolicy};
pub use utils::crd_name;

/// The K8s field manager name.
pub const MANAGER: &str = "rustrial-k8s-operator";
