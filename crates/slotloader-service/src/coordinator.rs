//! Requesting resources for slots.
//!
//! The [`Coordinator`] is owned by a single context, typically a UI thread or task, which issues
//! all requests and processes all completions. Loads themselves run on the blocking pool of the
//! runtime handed to [`CoordinatorBuilder::build`] and report back over a channel. Since only the
//! owning context ever touches slots, the check whether a finished task is still wanted and the
//! assignment of its result cannot race with new requests.
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Instant;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::caching::{CacheStore, Cached, Weigher};
use crate::config::{AbsentResults, CacheConfig};
use crate::loader::{LoadError, Loader, load_catching};
use crate::slots::{SlotContent, SlotId, SlotTable};
use crate::tasks::{LoadTask, TaskId, TaskState};

/// Receives every failed load, on the worker thread that ran it.
pub type FailureCallback<K> = Arc<dyn Fn(&K, &LoadError) + Send + Sync>;

/// What [`Coordinator::request_load`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The resource was cached and is now shown by the slot.
    CacheHit,
    /// The slot shows the placeholder until the newly scheduled load finishes.
    LoadStarted,
    /// The slot is already loading this key.
    AlreadyLoading,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheHit => "hit",
            Self::LoadStarted => "started",
            Self::AlreadyLoading => "coalesced",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// The slot was never created or has been destroyed.
    #[error("unknown slot {0}")]
    UnknownSlot(SlotId),
}

/// The result of a task, sent from the worker back to the coordinator.
struct Completion<K, R> {
    task: Arc<LoadTask<K>>,
    resource: Cached<R>,
}

/// Everything a worker thread needs to run a task.
struct Worker<K, R> {
    loader: Box<dyn Loader<K, R>>,
    cache: Arc<CacheStore<K, R>>,
    absent_results: AbsentResults,
    on_failure: Option<FailureCallback<K>>,
    completions: mpsc::UnboundedSender<Completion<K, R>>,
}

impl<K, R> Worker<K, R>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    fn run(&self, task: Arc<LoadTask<K>>) {
        // the completion is sent even if the weigher or the failure callback panic
        let resource = match panic::catch_unwind(AssertUnwindSafe(|| self.load(&task))) {
            Ok(resource) => resource,
            Err(_) => {
                tracing::error!(task = %task.id(), "Load task panicked outside of the loader");
                metric!(counter("tasks.panicked") += 1);
                None
            }
        };
        // the receiver is gone once the coordinator was dropped, nobody wants the result then
        self.completions.send(Completion { task, resource }).ok();
    }

    fn load(&self, task: &LoadTask<K>) -> Cached<R> {
        let Some(key) = task.key() else {
            return None;
        };

        if !task.begin() {
            tracing::trace!(task = %task.id(), "Skipping cancelled task");
            metric!(counter("tasks.discarded") += 1, "reason" => "cancelled");
            return None;
        }

        let start = Instant::now();
        let result = load_catching(self.loader.as_ref(), key);
        metric!(timer("loader.duration") = start.elapsed());

        let resource = match result {
            Ok(resource) => resource.map(Arc::new),
            Err(err) => {
                tracing::warn!(
                    task = %task.id(),
                    error = &err as &dyn std::error::Error,
                    "Failed to load resource",
                );
                metric!(counter("loader.failure") += 1, "kind" => err.kind());
                if let Some(on_failure) = &self.on_failure {
                    on_failure(key, &err);
                }
                None
            }
        };

        if task.is_cancelled() {
            tracing::trace!(task = %task.id(), "Discarding result of cancelled task");
            metric!(counter("tasks.discarded") += 1, "reason" => "cancelled");
            return None;
        }

        if resource.is_some() || self.absent_results == AbsentResults::Cache {
            self.cache.put_if_absent(key.clone(), resource.clone());
        }
        resource
    }
}

/// Loads resources into slots, caching the results.
///
/// Requests are served from the [`CacheStore`] when possible. Otherwise a [`LoadTask`] is bound to
/// the slot and run in the background, and the slot shows the placeholder in the meantime. Each
/// slot has at most one task bound to it: a request for another key cancels the previous task, a
/// request for the same key joins it.
///
/// Finished tasks are only applied once the owner calls [`process_completions`] or
/// [`next_completion`]. A result is shown only if its task is still bound to a slot that still
/// exists.
///
/// [`process_completions`]: Self::process_completions
/// [`next_completion`]: Self::next_completion
pub struct Coordinator<K, R> {
    cache: Arc<CacheStore<K, R>>,
    slots: SlotTable<K, R>,
    placeholder: Arc<R>,
    worker: Arc<Worker<K, R>>,
    completions: mpsc::UnboundedReceiver<Completion<K, R>>,
    runtime: Handle,
    task_ids: AtomicU64,
    pending: usize,
}

impl<K, R> Coordinator<K, R>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    /// Starts building a coordinator around `loader`.
    ///
    /// Slots show `placeholder` while their load is pending.
    pub fn builder(loader: impl Loader<K, R>, placeholder: R) -> CoordinatorBuilder<K, R> {
        CoordinatorBuilder {
            loader: Box::new(loader),
            placeholder: Arc::new(placeholder),
            config: CacheConfig::default(),
            weigher: None,
            on_failure: None,
        }
    }

    /// Requests the resource for `key` to be shown in `slot`.
    ///
    /// This never blocks: cache hits are applied right away, everything else is scheduled on the
    /// worker pool.
    pub fn request_load(&mut self, key: K, slot: SlotId) -> Result<RequestOutcome, RequestError> {
        let Some(current) = self.slots.get_mut(slot) else {
            return Err(RequestError::UnknownSlot(slot));
        };

        metric!(counter("cache.access") += 1);
        if let Some(cached) = self.cache.get(&key) {
            metric!(counter("cache.hit") += 1);
            // a task still running for this slot must not replace what we show now, but its
            // result is still good for the cache
            current.unbind();
            current.show(match cached {
                Some(resource) => SlotContent::Resource(resource),
                None => SlotContent::Placeholder(Arc::clone(&self.placeholder)),
            });
            return Ok(self.outcome(RequestOutcome::CacheHit));
        }

        if current.is_loading(&key) {
            return Ok(self.outcome(RequestOutcome::AlreadyLoading));
        }

        let task = Arc::new(LoadTask::new(TaskId::next(&self.task_ids), slot));
        if let Some(previous) = current.bind(Arc::clone(&task)) {
            tracing::debug!(%slot, task = %previous.id(), "Cancelled load task");
            metric!(counter("tasks.cancelled") += 1);
        }
        current.show(SlotContent::Placeholder(Arc::clone(&self.placeholder)));

        self.schedule(task, key);
        Ok(self.outcome(RequestOutcome::LoadStarted))
    }

    fn outcome(&self, outcome: RequestOutcome) -> RequestOutcome {
        metric!(counter("requests") += 1, "outcome" => outcome.as_str());
        outcome
    }

    fn schedule(&mut self, task: Arc<LoadTask<K>>, key: K) {
        tracing::debug!(task = %task.id(), slot = %task.slot(), "Scheduling load task");
        task.assign_key(key);
        self.pending += 1;

        let worker = Arc::clone(&self.worker);
        self.runtime.spawn_blocking(move || worker.run(task));
    }

    /// Processes all completions that arrived so far, without waiting.
    ///
    /// Returns the number of processed completions.
    pub fn process_completions(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(completion) = self.completions.try_recv() {
            self.complete(completion);
            processed += 1;
        }
        processed
    }

    /// Waits for the next completion and processes it.
    ///
    /// Returns `false` right away if no task is outstanding.
    pub async fn next_completion(&mut self) -> bool {
        if self.pending == 0 {
            return false;
        }
        match self.completions.recv().await {
            Some(completion) => {
                self.complete(completion);
                true
            }
            None => false,
        }
    }

    fn complete(&mut self, completion: Completion<K, R>) {
        self.pending = self.pending.saturating_sub(1);
        let Completion { task, resource } = completion;

        if task.is_cancelled() {
            tracing::trace!(task = %task.id(), "Dropping completion of cancelled task");
            return;
        }

        let reason = match self.slots.get_mut(task.slot()) {
            None => Some("slot_destroyed"),
            Some(slot) if !slot.is_bound_to(task.id()) => Some("superseded"),
            Some(slot) => {
                slot.unbind();
                // without a resource, the placeholder stays
                if let Some(resource) = resource {
                    slot.show(SlotContent::Resource(resource));
                }
                None
            }
        };

        if let Some(reason) = reason {
            tracing::trace!(task = %task.id(), slot = %task.slot(), reason, "Dropping stale completion");
            metric!(counter("tasks.discarded") += 1, "reason" => reason);
        }
        task.complete();
    }

    /// Creates a new, empty slot.
    pub fn create_slot(&mut self) -> SlotId {
        self.slots.insert()
    }

    /// Destroys a slot.
    ///
    /// A task still running for it is not cancelled: it finishes and fills the cache, only its
    /// completion is dropped.
    pub fn destroy_slot(&mut self, slot: SlotId) -> bool {
        self.slots.remove(slot).is_some()
    }

    /// Cancels the task bound to `slot`, leaving the slot's content as it is.
    ///
    /// Returns `true` if a task was cancelled.
    pub fn cancel(&mut self, slot: SlotId) -> bool {
        let Some(task) = self.slots.get_mut(slot).and_then(|slot| slot.unbind()) else {
            return false;
        };
        let cancelled = task.cancel();
        if cancelled {
            tracing::debug!(%slot, task = %task.id(), "Cancelled load task");
            metric!(counter("tasks.cancelled") += 1);
        }
        cancelled
    }

    /// What `slot` shows, or [`None`] if it does not exist.
    pub fn slot_content(&self, slot: SlotId) -> Option<&SlotContent<R>> {
        self.slots.get(slot).map(|slot| slot.content())
    }

    /// The state of the task bound to `slot`, if any.
    pub fn slot_task_state(&self, slot: SlotId) -> Option<TaskState> {
        let task = self.slots.get(slot)?.current_task()?;
        Some(task.state())
    }

    pub fn cache(&self) -> &CacheStore<K, R> {
        &self.cache
    }

    pub fn placeholder(&self) -> &Arc<R> {
        &self.placeholder
    }

    /// The number of scheduled tasks whose completion was not processed yet.
    pub fn pending(&self) -> usize {
        self.pending
    }
}

impl<K: Eq + Hash, R> fmt::Debug for Coordinator<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("cache", &self.cache)
            .field("slots", &self.slots.len())
            .field("pending", &self.pending)
            .finish()
    }
}

/// Configures and creates a [`Coordinator`].
pub struct CoordinatorBuilder<K, R> {
    loader: Box<dyn Loader<K, R>>,
    placeholder: Arc<R>,
    config: CacheConfig,
    weigher: Option<Weigher<K, R>>,
    on_failure: Option<FailureCallback<K>>,
}

impl<K, R> CoordinatorBuilder<K, R>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    /// Takes over all cache settings from `config`.
    pub fn config(mut self, config: &CacheConfig) -> Self {
        self.config = config.clone();
        self
    }

    /// Sets the maximum total weight of the cache.
    pub fn max_weight(mut self, max_weight: u64) -> Self {
        self.config.max_weight = Some(max_weight);
        self
    }

    /// Sets the memory budget the default maximum weight is derived from.
    pub fn available_memory(mut self, available_memory: u64) -> Self {
        self.config.available_memory = available_memory;
        self
    }

    pub fn absent_results(mut self, absent_results: AbsentResults) -> Self {
        self.config.absent_results = absent_results;
        self
    }

    /// Sets the function used to weigh cached resources.
    pub fn weigher<F>(mut self, weigher: F) -> Self
    where
        F: Fn(&K, &R) -> u64 + Send + Sync + 'static,
    {
        self.weigher = Some(Arc::new(weigher));
        self
    }

    /// Registers a callback that is invoked for every failed load.
    pub fn on_failure<F>(mut self, on_failure: F) -> Self
    where
        F: Fn(&K, &LoadError) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(on_failure));
        self
    }

    /// Creates the coordinator, running loads on the blocking pool of `runtime`.
    pub fn build(self, runtime: Handle) -> Coordinator<K, R> {
        let cache = Arc::new(
            CacheStore::builder(self.config.max_weight())
                .weigher_arc(self.weigher)
                .build(),
        );
        let (sender, completions) = mpsc::unbounded_channel();
        let worker = Worker {
            loader: self.loader,
            cache: Arc::clone(&cache),
            absent_results: self.config.absent_results,
            on_failure: self.on_failure,
            completions: sender,
        };

        Coordinator {
            cache,
            slots: SlotTable::default(),
            placeholder: self.placeholder,
            worker: Arc::new(worker),
            completions,
            runtime,
            task_ids: AtomicU64::new(0),
            pending: 0,
        }
    }
}
