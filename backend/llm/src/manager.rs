//! Single-slot model cache with serialized access.
//!
//! A [`ResourceManager`] owns at most one loaded model. Every mutation of the
//! slot that is requested asynchronously runs on one dedicated worker thread,
//! so requests are handled in submission order. Exclusive operations are
//! gated by a busy flag: a second request while busy is rejected, never queued.

use chrono::{DateTime, Utc};
use localrag_core::{pending, task, Pending, RagConfig, RagError, StopSignal, TaskHandle};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::eviction::EvictionPolicy;
use crate::model::{
    BatchInput, ExclusiveInput, ManagedModel, ModelLoader, PromptInput, RerankResult, Reranker,
    TextGenerator,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared handle to the model currently held by a manager.
///
/// Handles stay valid after the manager replaces or unloads the model, but
/// the model behind them has been cleaned up by then.
pub struct LoadedModel<M> {
    key: String,
    loaded_at: DateTime<Utc>,
    model: Arc<Mutex<M>>,
}

impl<M> Clone for LoadedModel<M> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            loaded_at: self.loaded_at,
            model: self.model.clone(),
        }
    }
}

impl<M: ManagedModel> LoadedModel<M> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn lock(&self) -> MutexGuard<'_, M> {
        lock(&self.model)
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().is_initialized()
    }

    /// True when both handles point at the same loaded instance.
    pub fn same_instance(&self, other: &LoadedModel<M>) -> bool {
        Arc::ptr_eq(&self.model, &other.model)
    }
}

/// Observes real loads (cache hits are silent). Called on the loading thread.
pub trait LoadListener: Send + Sync {
    fn on_load_start(&self, _key: &str) {}
    fn on_load_progress(&self, _message: &str) {}
    fn on_load_complete(&self, _key: &str) {}
    fn on_load_error(&self, _error: &str) {}
}

/// Handed to an exclusive operation while it holds the model.
pub struct ExclusiveContext<'a> {
    progress: &'a (dyn Fn(String) -> bool + 'a),
    stop: &'a StopSignal,
}

impl ExclusiveContext<'_> {
    /// Forward an intermediate progress event to the caller.
    ///
    /// Returns false once the caller has stopped listening.
    pub fn report(&self, message: impl Into<String>) -> bool {
        (self.progress)(message.into())
    }

    /// Stop point between units of work.
    pub fn checkpoint(&self) -> Result<(), RagError> {
        self.stop.checkpoint()
    }

    pub fn stop_signal(&self) -> &StopSignal {
        self.stop
    }
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Name of the worker thread, also used in log lines
    pub name: String,
    pub stop: StopSignal,
    pub eviction: EvictionPolicy,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            name: "model-manager".to_string(),
            stop: StopSignal::global(),
            eviction: EvictionPolicy::Disabled,
        }
    }
}

impl ManagerOptions {
    /// Defaults plus the idle-unload policy from `config`.
    pub fn from_config(config: &RagConfig) -> Self {
        Self {
            eviction: EvictionPolicy::from_idle_timeout(config.idle_unload()),
            ..Default::default()
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Job),
    /// Re-read the eviction deadline.
    Wake,
}

struct Slot<M> {
    current: Option<LoadedModel<M>>,
    /// Whether `current` is initialized, tracked without locking the model.
    ready: bool,
    last_access: Instant,
    eviction_deadline: Option<Instant>,
}

/// Snapshot of the slot read by the accessors. Only ever locked briefly, so
/// it stays readable while a load or an operation is in progress.
#[derive(Debug, Clone, Default)]
struct Status {
    key: Option<String>,
    ready: bool,
}

struct Shared<L: ModelLoader> {
    name: String,
    loader: L,
    slot: Mutex<Slot<L::Model>>,
    status: Mutex<Status>,
    busy: AtomicBool,
    shut_down: AtomicBool,
    stop: StopSignal,
    eviction: EvictionPolicy,
    listener: Mutex<Option<Arc<dyn LoadListener>>>,
}

/// Resets the busy flag when dropped.
struct BusyGuard<L: ModelLoader>(Arc<Shared<L>>);

impl<L: ModelLoader> Drop for BusyGuard<L> {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::SeqCst);
        debug!("[{}] Released model busy state", self.0.name);
    }
}

impl<L: ModelLoader> Shared<L> {
    fn listener(&self) -> Option<Arc<dyn LoadListener>> {
        lock(&self.listener).clone()
    }

    fn publish(&self, slot: &Slot<L::Model>) {
        *lock(&self.status) = Status {
            key: slot.current.as_ref().map(|model| model.key.clone()),
            ready: slot.current.is_some() && slot.ready,
        };
    }

    /// Take the current model out of the slot and clean it up.
    fn clear(&self, slot: &mut Slot<L::Model>, reason: &str) {
        if let Some(old) = slot.current.take() {
            info!("[{}] {}: {}", self.name, reason, old.key);
            slot.ready = false;
            self.publish(slot);
            old.lock().cleanup();
        }
    }

    /// Record whether `model` is still usable after an operation ran on it.
    fn refresh(&self, model: &LoadedModel<L::Model>, ready: bool) {
        let mut slot = lock(&self.slot);
        if slot.current.as_ref().is_some_and(|current| current.same_instance(model)) {
            slot.ready = ready;
            self.publish(&slot);
        }
    }

    fn get_or_load(&self, key: &str) -> Result<LoadedModel<L::Model>, RagError> {
        if key.trim().is_empty() {
            return Err(RagError::invalid_input("model key empty"));
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(RagError::ShutDown);
        }

        let mut slot = lock(&self.slot);
        slot.last_access = Instant::now();
        slot.eviction_deadline = None;

        if let Some(current) = &slot.current {
            if current.key == key && slot.ready {
                debug!("[{}] Using existing model, no need to reload", self.name);
                return Ok(current.clone());
            }
        }

        self.clear(&mut slot, "Cleaning up current model");

        info!("[{}] Need to load new model: {}", self.name, key);
        let loaded = match catch_unwind(AssertUnwindSafe(|| self.load(key))) {
            Ok(result) => result,
            Err(payload) => Err(RagError::from_panic(payload)),
        };

        match loaded {
            Ok(model) => {
                slot.current = Some(model.clone());
                slot.ready = true;
                self.publish(&slot);
                Ok(model)
            }
            Err(e) => {
                error!("[{}] Model loading failed: {}", self.name, e);
                if let Some(listener) = self.listener() {
                    listener.on_load_error(&e.to_string());
                }
                Err(e)
            }
        }
    }

    fn load(&self, key: &str) -> Result<LoadedModel<L::Model>, RagError> {
        let listener = self.listener();
        if let Some(listener) = &listener {
            listener.on_load_start(key);
        }

        if !self.loader.exists(key) {
            return Err(RagError::ResourceNotFound(format!(
                "model file does not exist: {}",
                key
            )));
        }

        if let Some(listener) = &listener {
            listener.on_load_progress("Initializing model...");
        }

        let mut model = self
            .loader
            .load(key)
            .map_err(|e| RagError::ResourceInitFailure(format!("{:#}", e)))?;

        if let Err(e) = model.initialize() {
            model.cleanup();
            return Err(RagError::ResourceInitFailure(format!("{:#}", e)));
        }

        info!("[{}] Model loaded successfully: {}", self.name, key);
        if let Some(listener) = &listener {
            listener.on_load_complete(key);
        }

        Ok(LoadedModel {
            key: key.to_string(),
            loaded_at: Utc::now(),
            model: Arc::new(Mutex::new(model)),
        })
    }

    fn unload(&self) {
        let mut slot = lock(&self.slot);
        self.clear(&mut slot, "Unloading model");
        slot.eviction_deadline = None;
    }

    fn eviction_deadline(&self) -> Option<Instant> {
        lock(&self.slot).eviction_deadline
    }

    fn evict_if_idle(&self) {
        let mut slot = lock(&self.slot);
        // Any access since the timer was armed clears or moves the deadline.
        match slot.eviction_deadline {
            Some(deadline) if Instant::now() >= deadline => slot.eviction_deadline = None,
            _ => return,
        }
        if self.busy.load(Ordering::SeqCst) {
            return;
        }
        self.clear(&mut slot, "Auto-unloading idle model");
    }
}

fn run_worker<L: ModelLoader>(shared: Arc<Shared<L>>, commands: mpsc::Receiver<Command>) {
    loop {
        let command = match shared.eviction_deadline() {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match commands.recv_timeout(wait) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => {
                        shared.evict_if_idle();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match commands.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            Command::Run(job) => {
                // Jobs report their own faults; this only keeps the worker alive.
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("[{}] Worker job panicked", shared.name);
                }
            }
            Command::Wake => {}
        }
    }
    debug!("[{}] Worker stopped", shared.name);
}

/// Owns one expensive model slot. See the module docs.
pub struct ResourceManager<L: ModelLoader> {
    shared: Arc<Shared<L>>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<L: ModelLoader> ResourceManager<L> {
    pub fn new(loader: L) -> Self {
        Self::with_options(loader, ManagerOptions::default())
    }

    pub fn with_options(loader: L, options: ManagerOptions) -> Self {
        let shared = Arc::new(Shared {
            name: options.name,
            loader,
            slot: Mutex::new(Slot {
                current: None,
                ready: false,
                last_access: Instant::now(),
                eviction_deadline: None,
            }),
            status: Mutex::new(Status::default()),
            busy: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            stop: options.stop,
            eviction: options.eviction,
            listener: Mutex::new(None),
        });

        let (tx, rx) = mpsc::channel();
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name(shared.name.clone())
            .spawn(move || run_worker(worker_shared, rx))
            .map_err(|e| error!("Failed to spawn model worker: {}", e))
            .ok();

        Self {
            shared,
            commands: Mutex::new(worker.as_ref().map(|_| tx)),
            worker: Mutex::new(worker),
        }
    }

    pub fn set_load_listener(&self, listener: Option<Arc<dyn LoadListener>>) {
        *lock(&self.shared.listener) = listener;
    }

    fn submit(&self, job: Job) -> Result<(), RagError> {
        let commands = lock(&self.commands);
        match commands.as_ref() {
            Some(tx) => tx.send(Command::Run(job)).map_err(|_| RagError::ShutDown),
            None => Err(RagError::ShutDown),
        }
    }

    /// Load `key` into the slot, or reuse it when it is already loaded.
    ///
    /// Runs on the calling thread. A different model in the slot is cleaned up
    /// before the new one is loaded; a failed load leaves the slot empty.
    pub fn get_or_load(&self, key: &str) -> Result<LoadedModel<L::Model>, RagError> {
        self.shared.get_or_load(key)
    }

    /// [`Self::get_or_load`] on the worker thread.
    pub fn get_or_load_async(&self, key: &str) -> Pending<LoadedModel<L::Model>> {
        if key.trim().is_empty() {
            warn!("[{}] Model key is empty", self.shared.name);
            return Pending::ready(Err(RagError::invalid_input("model key empty")));
        }

        let (completer, outcome) = pending();
        let shared = self.shared.clone();
        let key = key.to_string();
        let job: Job = Box::new(move || {
            let result = shared.get_or_load(&key);
            completer.complete(result);
        });

        match self.submit(job) {
            Ok(()) => outcome,
            Err(e) => Pending::ready(Err(e)),
        }
    }

    /// Run `operation` against the model for `key` with exclusive access.
    ///
    /// Invalid input and a busy model are reported immediately without
    /// touching the slot or the worker. Otherwise the model is resolved on
    /// the worker, the stop signal is checked, and `operation` runs; its
    /// progress events arrive as task updates. The busy flag is cleared on
    /// every path before the outcome is delivered.
    pub fn run_exclusive<I, T, F>(&self, key: &str, input: I, operation: F) -> TaskHandle<String, T>
    where
        I: ExclusiveInput + Send + 'static,
        T: Send + 'static,
        F: FnOnce(&mut L::Model, I, &ExclusiveContext<'_>) -> Result<T, RagError> + Send + 'static,
    {
        let name = &self.shared.name;
        if key.trim().is_empty() {
            warn!("[{}] Model key is empty", name);
            return TaskHandle::rejected(RagError::invalid_input("model key empty"));
        }
        if let Err(e) = input.validate() {
            warn!("[{}] Rejected exclusive request: {}", name, e);
            return TaskHandle::rejected(e);
        }
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return TaskHandle::rejected(RagError::ShutDown);
        }
        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("[{}] Model is currently in use, please wait", name);
            return TaskHandle::rejected(RagError::ResourceBusy);
        }
        let busy = BusyGuard(self.shared.clone());

        let (reporter, handle) = task();
        let shared = self.shared.clone();
        let key = key.to_string();
        let job: Job = Box::new(move || {
            let report = |message: String| reporter.update(message);
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let loaded = shared.get_or_load(&key)?;
                if shared.stop.is_stop_requested() {
                    debug!("[{}] Stop requested, aborting before execution", shared.name);
                    return Err(RagError::StoppedByUser);
                }
                let ctx = ExclusiveContext {
                    progress: &report,
                    stop: &shared.stop,
                };
                let mut model = loaded.lock();
                let result = operation(&mut model, input, &ctx);
                let ready = model.is_initialized();
                drop(model);
                shared.refresh(&loaded, ready);
                result
            }))
            .unwrap_or_else(|payload| Err(RagError::from_panic(payload)));

            if let Err(e) = &outcome {
                warn!("[{}] Exclusive operation failed: {}", shared.name, e);
            }
            drop(busy);
            reporter.finish(outcome);
        });

        match self.submit(job) {
            Ok(()) => handle,
            Err(e) => TaskHandle::rejected(e),
        }
    }

    /// Claim the model for a caller that holds it directly.
    ///
    /// Returns false, changing nothing, when the model is already busy.
    pub fn mark_in_use(&self) -> bool {
        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("[{}] Model is currently in use, please wait", self.shared.name);
            return false;
        }
        let mut slot = lock(&self.shared.slot);
        slot.last_access = Instant::now();
        slot.eviction_deadline = None;
        debug!("[{}] Marked model as in use", self.shared.name);
        true
    }

    /// Clear the busy flag and arm the idle timer if eviction is enabled.
    pub fn mark_not_in_use(&self) {
        self.shared.busy.store(false, Ordering::SeqCst);
        {
            let mut slot = lock(&self.shared.slot);
            slot.last_access = Instant::now();
            slot.eviction_deadline = self
                .shared
                .eviction
                .idle_timeout()
                .map(|timeout| slot.last_access + timeout);
        }
        if self.shared.eviction.idle_timeout().is_some() {
            if let Some(tx) = lock(&self.commands).as_ref() {
                let _ = tx.send(Command::Wake);
            }
        }
        debug!("[{}] Marked model as no longer in use", self.shared.name);
    }

    /// Clean up and drop the current model. Safe to call with nothing loaded.
    pub fn unload(&self) {
        self.shared.unload();
    }

    /// Unload, stop the worker and drop the load listener. Terminal.
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[{}] Shutting down model manager", self.shared.name);
        self.shared.unload();

        // Closing the channel lets the worker finish queued jobs and exit.
        lock(&self.commands).take();
        if let Some(worker) = lock(&self.worker).take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                error!("[{}] Worker thread panicked", self.shared.name);
            }
        }
        self.set_load_listener(None);
    }

    /// Key of the model in the slot. Never waits for a load or an operation.
    pub fn current_key(&self) -> Option<String> {
        lock(&self.shared.status).key.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// Whether an initialized model is loaded. Never waits for a load or an
    /// operation.
    pub fn has_resource(&self) -> bool {
        lock(&self.shared.status).ready
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.shared.stop
    }
}

impl<L> ResourceManager<L>
where
    L: ModelLoader,
    L::Model: Reranker,
{
    /// Score every document against `input.query` and keep the best `top_k`.
    ///
    /// Emits one `"{score:.3}, "` progress event per document and checks the
    /// stop signal between documents.
    pub fn rerank(
        &self,
        key: &str,
        input: BatchInput,
        top_k: usize,
    ) -> TaskHandle<String, Vec<RerankResult>> {
        self.run_exclusive(key, input, move |model, input, ctx| {
            let BatchInput { query, batch } = input;
            let mut results = Vec::with_capacity(batch.len());
            for (index, document) in batch.into_iter().enumerate() {
                ctx.checkpoint()?;
                let score = model.score(&query, &document)?;
                ctx.report(format!("{:.3}, ", score));
                results.push(RerankResult {
                    index,
                    document,
                    score,
                });
            }
            results.sort_by(|a, b| b.score.total_cmp(&a.score));
            results.truncate(top_k);
            Ok(results)
        })
    }
}

impl<L> ResourceManager<L>
where
    L: ModelLoader,
    L::Model: TextGenerator,
{
    /// Generate text for `prompt`; every token arrives as a progress event.
    ///
    /// Generation ends early, keeping the text so far, once the handle stops
    /// receiving updates.
    pub fn generate(&self, key: &str, prompt: &str) -> TaskHandle<String, String> {
        let input = PromptInput {
            prompt: prompt.to_string(),
        };
        self.run_exclusive(key, input, |model, input, ctx| {
            let mut stopped = false;
            let text = model.generate(&input.prompt, &mut |token: &str| {
                if ctx.stop_signal().is_stop_requested() {
                    stopped = true;
                    return false;
                }
                ctx.report(token)
            })?;
            if stopped {
                return Err(RagError::StoppedByUser);
            }
            Ok(text)
        })
    }
}

impl<L: ModelLoader> Drop for ResourceManager<L> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
