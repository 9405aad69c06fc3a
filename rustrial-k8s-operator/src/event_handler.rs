//! Per-resource scheduling of reconciliations.
//!
//! Every resource is in exactly one [`Phase`]. Events arriving while a
//! reconciliation runs are coalesced into a `dirty` flag and handled once it
//! completes, so at most one dispatch per resource is ever in flight while
//! dispatches of different resources run in parallel on a bounded pool.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::sync::{Semaphore, watch};

use crate::{
    cache::ResourceCache,
    dispatcher::{Dispatcher, Outcome},
    errors::OperatorError,
    event_source::stopped,
    event_source_manager::EventStream,
    reconciler::Reconciler,
    resource::{CachedEntry, Event, EventKind, ManagedResource, ResourceRef},
    retry::{RetryInfo, RetryPolicy, RetryState},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    /// Waiting for a worker.
    Scheduled,
    Running,
    /// Waiting for the retry timer.
    RetryPending,
}

#[derive(Debug, Default)]
struct RefState {
    phase: Phase,
    /// Events arrived while running.
    dirty: bool,
    /// One of those events must not be suppressed by generation filtering.
    forced: bool,
    retry: Option<RetryState>,
    last_reconciled_generation: Option<i64>,
    /// Retries were exhausted or the failure was not retryable.
    terminal: bool,
    last_error: Option<String>,
    /// Invalidates armed retry timers.
    timer_epoch: u64,
    /// Token of the only requeue timer allowed to fire, any completed
    /// dispatch revokes it.
    requeue: Option<u64>,
}

/// Point-in-time view of the scheduling state of one resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulingSnapshot {
    pub phase: Phase,
    pub dirty: bool,
    /// Consecutive failed attempts of the pending retry, `0` without retry.
    pub failed_attempts: u32,
    pub next_attempt_at: Option<Instant>,
    pub last_reconciled_generation: Option<i64>,
    pub terminal: bool,
    pub last_error: Option<String>,
    pub requeue_pending: bool,
}

#[derive(Clone, Copy, Debug)]
enum Timer {
    Retry { epoch: u64 },
    Requeue { token: u64 },
}

/// What to do once the state lock is released.
enum Next {
    Nothing,
    Submit,
    Reevaluate,
    Arm(Duration, Timer),
    Forget,
}

pub struct EventHandler<K, R> {
    controller: String,
    cache: Arc<ResourceCache<K>>,
    dispatcher: Dispatcher<K, R>,
    retry_policy: RetryPolicy,
    generation_aware: bool,
    states: DashMap<ResourceRef, RefState>,
    workers: Arc<Semaphore>,
    max_workers: u32,
    requeue_tokens: AtomicU64,
    stopping: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl<K, R> EventHandler<K, R>
where
    K: ManagedResource,
    R: Reconciler<K>,
{
    pub fn new(
        controller: &str,
        cache: Arc<ResourceCache<K>>,
        dispatcher: Dispatcher<K, R>,
        retry_policy: RetryPolicy,
        generation_aware: bool,
        max_concurrent_reconciles: usize,
    ) -> Arc<Self> {
        let limit = Semaphore::MAX_PERMITS.min(u32::MAX as usize);
        let max_workers = max_concurrent_reconciles.clamp(1, limit) as u32;
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            controller: controller.to_string(),
            cache,
            dispatcher,
            retry_policy,
            generation_aware,
            states: DashMap::new(),
            workers: Arc::new(Semaphore::new(max_workers as usize)),
            max_workers,
            requeue_tokens: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Consumes `events` until the stream ends.
    pub async fn run(self: Arc<Self>, mut events: EventStream) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("[{}] event stream ended", self.controller);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, resource_ref: &ResourceRef) -> Option<SchedulingSnapshot> {
        self.states.get(resource_ref).map(|state| SchedulingSnapshot {
            phase: state.phase,
            dirty: state.dirty,
            failed_attempts: state.retry.as_ref().map_or(0, |r| r.attempt),
            next_attempt_at: state.retry.as_ref().and_then(|r| r.next_attempt_at),
            last_reconciled_generation: state.last_reconciled_generation,
            terminal: state.terminal,
            last_error: state.last_error.clone(),
            requeue_pending: state.requeue.is_some(),
        })
    }

    /// Whether an update of a reconciled generation can be skipped.
    fn is_filtered(
        &self,
        generation: Option<i64>,
        entry: &CachedEntry<K>,
        state: &RefState,
    ) -> bool {
        self.generation_aware
            && !entry.deletion_timestamp_set
            && !entry.tombstone
            && matches!(
                (generation, state.last_reconciled_generation),
                (Some(observed), Some(reconciled)) if observed == reconciled
            )
    }

    pub fn handle_event(self: &Arc<Self>, event: Event) {
        if self.is_stopping() {
            trace!(
                "[{}] ignoring {} event of {} while stopping",
                self.controller, event.kind, event.resource_ref
            );
            return;
        }
        let id = event.resource_ref;
        let Some(entry) = self.cache.get(&id) else {
            debug!(
                "[{}] ignoring {} event of {} which is not cached",
                self.controller, event.kind, id
            );
            return;
        };
        let next = {
            let mut state = self.states.entry(id.clone()).or_default();
            let forced = event.kind != EventKind::Modified;
            if !forced && self.is_filtered(event.observed_generation, &entry, &state) {
                trace!(
                    "[{}] skipping {} event of {}, generation {:?} already reconciled",
                    self.controller, event.kind, id, event.observed_generation
                );
                return;
            }
            if state.terminal {
                state.terminal = false;
                state.retry = None;
            }
            match state.phase {
                Phase::Running => {
                    state.dirty = true;
                    state.forced |= forced;
                    Next::Nothing
                }
                Phase::Scheduled => Next::Nothing,
                Phase::RetryPending => {
                    state.timer_epoch += 1;
                    state.phase = Phase::Scheduled;
                    Next::Submit
                }
                Phase::Idle => {
                    state.phase = Phase::Scheduled;
                    Next::Submit
                }
            }
        };
        self.apply(id, next);
    }

    fn apply(self: &Arc<Self>, id: ResourceRef, next: Next) {
        match next {
            Next::Nothing => (),
            Next::Submit => self.submit(id),
            Next::Reevaluate => self.reevaluate(id),
            Next::Arm(delay, timer) => self.arm(id, delay, timer),
            Next::Forget => {
                self.states
                    .remove_if(&id, |_, s| s.phase == Phase::Idle && !s.dirty);
            }
        }
    }

    /// Runs a dispatch of `id`, which must be [`Phase::Scheduled`], as soon
    /// as a worker is available.
    fn submit(self: &Arc<Self>, id: ResourceRef) {
        let me = self.clone();
        tokio::spawn(async move { me.execute(id).await });
    }

    async fn execute(self: Arc<Self>, id: ResourceRef) {
        let Ok(permit) = self.workers.clone().acquire_owned().await else {
            return;
        };
        let entry = if self.is_stopping() {
            None
        } else {
            self.cache.get(&id)
        };
        let (entry, retry) = {
            let Some(mut state) = self.states.get_mut(&id) else {
                return;
            };
            if state.phase != Phase::Scheduled {
                return;
            }
            let Some(entry) = entry else {
                state.phase = Phase::Idle;
                return;
            };
            state.phase = Phase::Running;
            state.dirty = false;
            state.forced = false;
            let failed = state.retry.as_ref().map_or(0, |r| r.attempt);
            (entry, RetryInfo::new(failed, &self.retry_policy))
        };
        debug!(
            "[{}] dispatching {} (generation {:?}, resourceVersion {}, attempt {})",
            self.controller, id, entry.generation, entry.resource_version, retry.attempt
        );
        let outcome = self.dispatcher.dispatch(entry.clone(), retry).await;
        drop(permit);
        self.complete(id, entry, outcome);
    }

    fn complete(self: &Arc<Self>, id: ResourceRef, entry: CachedEntry<K>, outcome: Outcome) {
        let deleting = entry.deletion_timestamp_set || entry.tombstone;
        let mut requeue = None;
        let next = {
            let Some(mut state) = self.states.get_mut(&id) else {
                return;
            };
            let dirty = std::mem::take(&mut state.dirty);
            let forced = std::mem::take(&mut state.forced);
            state.phase = Phase::Idle;
            state.requeue = None;
            match outcome {
                Outcome::Success { requeue_after } => {
                    state.retry = None;
                    state.terminal = false;
                    state.last_error = None;
                    if !deleting {
                        state.last_reconciled_generation = entry.generation;
                        if let Some(delay) = requeue_after {
                            let token = self.requeue_tokens.fetch_add(1, Ordering::SeqCst);
                            state.requeue = Some(token);
                            requeue = Some((delay, Timer::Requeue { token }));
                        }
                    }
                    if dirty {
                        state.dirty = true;
                        state.forced = forced;
                        Next::Reevaluate
                    } else if deleting {
                        Next::Forget
                    } else {
                        Next::Nothing
                    }
                }
                Outcome::TransientFailure(e) if e.is_stale_update() => {
                    debug!(
                        "[{}] {} changed concurrently, awaiting its latest state",
                        self.controller, id
                    );
                    let newer = self
                        .cache
                        .get(&id)
                        .is_some_and(|c| c.resource_version.is_newer_than(&entry.resource_version));
                    if dirty || newer {
                        state.phase = Phase::Scheduled;
                        Next::Submit
                    } else {
                        Next::Nothing
                    }
                }
                Outcome::TransientFailure(e) => {
                    let attempt = state.retry.as_ref().map_or(0, |r| r.attempt) + 1;
                    match self.retry_policy.next_delay(attempt) {
                        Some(delay) => {
                            warn!(
                                "[{}] attempt {} of {} failed, retrying in {:?}: {}",
                                self.controller, attempt, id, delay, e
                            );
                            state.last_error = Some(e.to_string());
                            state.retry = Some(RetryState {
                                attempt,
                                last_error: e.to_string(),
                                next_attempt_at: Some(Instant::now() + delay),
                            });
                            if dirty {
                                state.phase = Phase::Scheduled;
                                Next::Submit
                            } else {
                                state.phase = Phase::RetryPending;
                                state.timer_epoch += 1;
                                Next::Arm(
                                    delay,
                                    Timer::Retry {
                                        epoch: state.timer_epoch,
                                    },
                                )
                            }
                        }
                        None => {
                            let e = if deleting {
                                OperatorError::FinalizerStuck(format!(
                                    "giving up on cleanup of {} after {} attempts: {}",
                                    id, attempt, e
                                ))
                            } else {
                                OperatorError::ReconcileTerminal(format!(
                                    "giving up on {} after {} attempts: {}",
                                    id, attempt, e
                                ))
                            };
                            self.give_up(&mut state, e, dirty)
                        }
                    }
                }
                Outcome::TerminalFailure(e) => self.give_up(&mut state, e, dirty),
            }
        };
        if let Some((delay, timer)) = requeue {
            self.arm(id.clone(), delay, timer);
        }
        self.apply(id, next);
    }

    fn give_up(&self, state: &mut RefState, e: OperatorError, dirty: bool) -> Next {
        error!("[{}] {}", self.controller, e);
        state.retry = None;
        state.last_error = Some(e.to_string());
        if dirty {
            // Changed in the meantime, which deserves a fresh series of attempts.
            state.terminal = false;
            state.phase = Phase::Scheduled;
            Next::Submit
        } else {
            state.terminal = true;
            Next::Nothing
        }
    }

    /// Schedules another dispatch if the latest cached state warrants one.
    fn reevaluate(self: &Arc<Self>, id: ResourceRef) {
        let entry = self.cache.get(&id);
        let next = {
            let Some(mut state) = self.states.get_mut(&id) else {
                return;
            };
            if state.phase != Phase::Idle {
                return;
            }
            let forced = std::mem::take(&mut state.forced);
            state.dirty = false;
            match entry {
                None => Next::Forget,
                Some(entry) if !forced && self.is_filtered(entry.generation, &entry, &state) => {
                    Next::Nothing
                }
                Some(_) => {
                    state.phase = Phase::Scheduled;
                    Next::Submit
                }
            }
        };
        self.apply(id, next);
    }

    fn arm(self: &Arc<Self>, id: ResourceRef, delay: Duration, timer: Timer) {
        let me = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => me.fire(id, timer),
                _ = stopped(&mut shutdown) => (),
            }
        });
    }

    fn fire(self: &Arc<Self>, id: ResourceRef, timer: Timer) {
        if self.is_stopping() {
            return;
        }
        let cached = self.cache.contains(&id);
        let next = {
            let Some(mut state) = self.states.get_mut(&id) else {
                return;
            };
            match (timer, state.phase) {
                (Timer::Retry { epoch }, Phase::RetryPending) if epoch == state.timer_epoch => {
                    state.phase = Phase::Scheduled;
                    Next::Submit
                }
                (Timer::Retry { .. }, _) => Next::Nothing,
                (Timer::Requeue { token }, phase) if state.requeue == Some(token) => {
                    state.requeue = None;
                    if phase == Phase::Idle && cached {
                        debug!("[{}] requeue of {} is due", self.controller, id);
                        state.phase = Phase::Scheduled;
                        Next::Submit
                    } else {
                        // Gone, or superseded by a dispatch started since.
                        Next::Nothing
                    }
                }
                (Timer::Requeue { .. }, _) => Next::Nothing,
            }
        };
        self.apply(id, next);
    }

    /// Stops accepting events, pending timers are cancelled.
    pub fn stop_accepting(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }

    /// Stops accepting events and waits for in-flight dispatches to complete.
    pub async fn shutdown(&self) {
        self.stop_accepting();
        match self.workers.acquire_many(self.max_workers).await {
            Ok(permits) => drop(permits),
            Err(e) => debug!("[{}] worker pool already closed: {}", self.controller, e),
        }
        self.workers.close();
        debug!("[{}] event handler stopped", self.controller);
    }
}
