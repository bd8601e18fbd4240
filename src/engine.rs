//! The engine handle, its builder, and the interrupt/drain protocol.
//!
//! An [`Engine`] moves through three states:
//!
//! 1. **Running** -- external `post`/`request` calls are accepted.
//! 2. **Draining** -- entered by [`Engine::interrupt`]. External work is
//!    rejected, but handlers already in flight may still post follow-up
//!    handlers and requests so their causal chains can settle.
//! 3. **Closed** -- once nothing is in flight, both output streams close.
//!    Terminal.
//!
//! The in-flight count covers handlers *and* requests. A completing request
//! posts its follow-up handler before giving up its own slot, so the count
//! cannot touch zero between the two.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use futures::future::AbortHandle;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::broadcast::{Broadcaster, Signals, Updates};
use crate::config::{EngineConfig, FailurePolicy};
use crate::error::{BuildError, DispatchError, Failure, HandlerResult, StoreError};
use crate::handler::{HandlerContext, HandlerId};
use crate::latch::QuiescenceLatch;
use crate::model::{Model, Variant};
use crate::program::Program;
use crate::request::RequestId;
use crate::snapshot::Snapshot;
use crate::store::ModelStore;

/// Shared state behind every [`Engine`] and [`HandlerContext`].
pub(crate) struct Core<P: Program> {
    pub(crate) program: P,
    pub(crate) config: EngineConfig,
    pub(crate) runtime: Handle,
    pub(crate) store: ModelStore<P::Model>,
    pub(crate) updates: Broadcaster<P::Model>,
    pub(crate) signals: Broadcaster<P::Signal>,
    pub(crate) handlers: DashMap<HandlerId, AbortHandle>,
    pub(crate) requests: DashMap<RequestId, AbortHandle>,
    pub(crate) next_handler: AtomicU64,
    pub(crate) next_request: AtomicU64,
    pub(crate) in_flight: QuiescenceLatch,
    interrupt_permit: Semaphore,
    interrupted: AtomicBool,
    failure: OnceLock<Failure>,
}

impl<P: Program> Core<P> {
    /// Replace a model and publish it.
    ///
    /// The store write and the emission are separate steps: two handlers
    /// writing the same kind at once may publish in either order, but the
    /// store always holds the last write.
    pub(crate) fn update_model(&self, model: P::Model) {
        self.store.put(model.clone());
        self.updates.emit(model);
    }

    pub(crate) fn modify_model<V, F>(&self, f: F) -> Result<V, StoreError>
    where
        V: Variant<P::Model> + Clone,
        F: FnOnce(V) -> V,
    {
        let next = self.store.modify(f)?;
        self.updates.emit(next.clone().into());
        Ok(next)
    }

    pub(crate) fn emit_signal(&self, signal: P::Signal) {
        self.signals.emit(signal);
    }

    /// Take an in-flight slot for external work, unless the engine is
    /// already interrupted.
    ///
    /// The slot is taken before the flag is read. Together with `interrupt`
    /// setting the flag before reading the count, this means either the
    /// caller sees the interrupt or the finalization check sees the slot.
    fn admit(&self) -> Result<(), DispatchError> {
        self.in_flight.increment();
        if self.interrupted.load(Ordering::SeqCst) {
            self.release();
            return Err(DispatchError::Interrupted);
        }
        Ok(())
    }

    /// Give back one in-flight slot and run the finalization check.
    pub(crate) fn release(&self) {
        self.in_flight.decrement();
        self.try_finalize();
    }

    /// Apply the configured policy to a handler or request failure.
    pub(crate) fn on_failure(&self, failure: Failure) {
        match self.config.failure_policy {
            FailurePolicy::Isolate => {}
            FailurePolicy::CancelAll => self.fail(failure),
        }
    }

    /// Record a fatal failure, tear down everything in flight, and
    /// interrupt.
    pub(crate) fn fail(&self, failure: Failure) {
        let message = failure.to_string();
        if self.failure.set(failure).is_ok() {
            tracing::error!(engine = %self.config.name, failure = %message, "engine failed");
        }
        self.cancel_all();
        self.interrupt();
    }

    fn cancel_all(&self) {
        // Collect first: aborting while iterating would hold shard locks
        // that a finishing task needs for its own removal.
        let handlers: Vec<HandlerId> = self.handlers.iter().map(|e| *e.key()).collect();
        let requests: Vec<RequestId> = self.requests.iter().map(|e| *e.key()).collect();
        for id in handlers {
            self.cancel_handler(id);
        }
        for id in requests {
            self.cancel_request(id);
        }
    }

    pub(crate) fn interrupt(&self) -> bool {
        let Ok(permit) = self.interrupt_permit.try_acquire() else {
            return false;
        };
        permit.forget();
        self.interrupted.store(true, Ordering::SeqCst);
        tracing::info!(
            engine = %self.config.name,
            in_flight = self.in_flight.count(),
            "engine interrupted, draining"
        );
        self.try_finalize();
        true
    }

    fn try_finalize(&self) {
        if !self.interrupted.load(Ordering::SeqCst) || self.in_flight.count() != 0 {
            return;
        }
        let closed_updates = self.updates.close();
        let closed_signals = self.signals.close();
        if closed_updates || closed_signals {
            tracing::info!(engine = %self.config.name, "engine drained, streams closed");
        }
    }
}

/// Handle to a running engine.
///
/// `Clone` is cheap: every clone shares the same store, tables and
/// streams.
///
/// # Examples
///
/// ```
/// use std::future::Future;
///
/// use empress::{Engine, HandlerContext, HandlerResult, Model, Program, RequestError, Variant};
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct Counter(u64);
///
/// #[derive(Debug, Clone, PartialEq)]
/// enum State {
///     Counter(Counter),
/// }
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// enum Kind {
///     Counter,
/// }
///
/// impl Model for State {
///     type Kind = Kind;
///     fn kind(&self) -> Kind {
///         Kind::Counter
///     }
/// }
///
/// impl From<Counter> for State {
///     fn from(c: Counter) -> Self {
///         State::Counter(c)
///     }
/// }
///
/// impl Variant<State> for Counter {
///     const KIND: Kind = Kind::Counter;
///     fn from_model(model: State) -> Option<Self> {
///         let State::Counter(c) = model;
///         Some(c)
///     }
/// }
///
/// struct App;
///
/// impl Program for App {
///     type Model = State;
///     type Signal = ();
///     type Request = ();
///     type Event = ();
///
///     fn request(&self, _: ()) -> impl Future<Output = Result<(), RequestError>> + Send {
///         async { Ok(()) }
///     }
///
///     fn on_event(_: HandlerContext<Self>, _: ()) -> impl Future<Output = HandlerResult> + Send + 'static {
///         async { Ok(()) }
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = Engine::builder(App).model(Counter(0)).build()?;
/// engine.post(|ctx| async move {
///     ctx.modify(|c: Counter| Counter(c.0 + 1))?;
///     Ok(())
/// })?;
/// engine.drained().await;
/// assert_eq!(engine.model::<Counter>()?, Counter(1));
/// # Ok(())
/// # }
/// ```
pub struct Engine<P: Program> {
    core: Arc<Core<P>>,
}

impl<P: Program> Clone for Engine<P> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<P: Program> fmt::Debug for Engine<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.core.config.name)
            .field("interrupted", &self.is_interrupted())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl<P: Program> Engine<P> {
    pub(crate) fn from_core(core: Arc<Core<P>>) -> Self {
        Self { core }
    }

    /// Start configuring an engine for `program`.
    pub fn builder(program: P) -> EngineBuilder<P> {
        EngineBuilder::new(program)
    }

    /// Post a handler.
    ///
    /// The handler runs on the calling thread up to its first suspension
    /// point before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Interrupted`] once [`interrupt`](Engine::interrupt)
    /// has been called. The handler is not run.
    pub fn post<F, Fut>(&self, handler: F) -> Result<HandlerId, DispatchError>
    where
        F: FnOnce(HandlerContext<P>) -> Fut,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.core.admit()?;
        let id = self.core.spawn_handler(handler);
        self.core.release();
        Ok(id)
    }

    /// Cancel a running handler. `false` if it already finished or never
    /// existed.
    pub fn cancel_handler(&self, id: HandlerId) -> bool {
        self.core.cancel_handler(id)
    }

    /// Start a detached request.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Interrupted`] once the engine is interrupted.
    pub fn request(&self, payload: P::Request) -> Result<RequestId, DispatchError> {
        self.core.admit()?;
        let id = self.core.post_request(payload);
        self.core.release();
        Ok(id)
    }

    /// Cancel a pending request. `false` if it already finished or never
    /// existed.
    pub fn cancel_request(&self, id: RequestId) -> bool {
        self.core.cancel_request(id)
    }

    /// Replace a model and publish it on the update stream.
    pub fn update_model(&self, model: impl Into<P::Model>) {
        self.core.update_model(model.into());
    }

    /// Publish an ephemeral signal to current subscribers.
    pub fn emit_signal(&self, signal: P::Signal) {
        self.core.emit_signal(signal);
    }

    /// Every current model, in registration order.
    pub fn models(&self) -> Vec<P::Model> {
        self.core.store.all()
    }

    /// The current model of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the kind was never registered.
    pub fn get(&self, kind: <P::Model as Model>::Kind) -> Result<P::Model, StoreError> {
        self.core.store.get(kind)
    }

    /// The current model of variant `V`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if `V::KIND` was never registered.
    pub fn model<V: Variant<P::Model>>(&self) -> Result<V, StoreError> {
        self.core.store.get_as::<V>()
    }

    /// Export every current model for the host to persist.
    pub fn snapshot(&self) -> Snapshot<P::Model> {
        Snapshot::new(self.core.store.all())
    }

    /// Subscribe to model updates from now on.
    pub fn updates(&self) -> Updates<P::Model> {
        self.core.updates.subscribe()
    }

    /// Subscribe to model updates, starting with the current value of every
    /// model.
    ///
    /// No update committed after the replay is read can be missed.
    pub fn updates_with_current(&self) -> Updates<P::Model> {
        self.core.updates.subscribe_with(|| self.core.store.all())
    }

    /// Subscribe to signals from now on.
    pub fn signals(&self) -> Signals<P::Signal> {
        self.core.signals.subscribe()
    }

    /// Stop accepting external work and close the streams once everything in
    /// flight has finished.
    ///
    /// Idempotent. Returns `true` only for the call that interrupted.
    pub fn interrupt(&self) -> bool {
        self.core.interrupt()
    }

    /// Interrupt and wait until every handler and request has finished and
    /// both streams are closed.
    pub async fn drained(&self) {
        self.core.interrupt();
        self.core.in_flight.wait_zero().await;
        self.core.try_finalize();
    }

    /// Whether [`interrupt`](Engine::interrupt) has run.
    pub fn is_interrupted(&self) -> bool {
        self.core.interrupted.load(Ordering::SeqCst)
    }

    /// Whether the output streams are closed.
    pub fn is_closed(&self) -> bool {
        self.core.updates.is_closed()
    }

    /// The failure that stopped the engine, if any.
    pub fn failure(&self) -> Option<Failure> {
        self.core.failure.get().cloned()
    }

    /// Number of handlers currently live.
    pub fn active_handlers(&self) -> usize {
        self.core.handlers.len()
    }

    /// Number of requests currently pending.
    pub fn pending_requests(&self) -> usize {
        self.core.requests.len()
    }

    /// Number of handlers and requests still holding an in-flight slot.
    pub fn in_flight(&self) -> usize {
        self.core.in_flight.count()
    }
}

/// Builder for configuring and starting an [`Engine`].
///
/// Collects the initial models, an optional restored set, configuration,
/// and the runtime to spawn on, then validates everything in
/// [`build`](EngineBuilder::build).
pub struct EngineBuilder<P: Program> {
    program: P,
    initial: Vec<P::Model>,
    restored: Option<Vec<P::Model>>,
    config: EngineConfig,
    runtime: Option<Handle>,
}

impl<P: Program> fmt::Debug for EngineBuilder<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("initial", &self.initial.len())
            .field("restored", &self.restored.as_ref().map(Vec::len))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P: Program> EngineBuilder<P> {
    fn new(program: P) -> Self {
        Self {
            program,
            initial: Vec::new(),
            restored: None,
            config: EngineConfig::default(),
            runtime: None,
        }
    }

    /// Add initial models.
    ///
    /// # Arguments
    ///
    /// * `models` - One model per kind. Duplicates fail at
    ///   [`build`](EngineBuilder::build).
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn initial(mut self, models: impl IntoIterator<Item = P::Model>) -> Self {
        self.initial.extend(models);
        self
    }

    /// Add a single initial model.
    pub fn model(mut self, model: impl Into<P::Model>) -> Self {
        self.initial.push(model.into());
        self
    }

    /// Supply restored models that override initial models of the same
    /// kind.
    ///
    /// # Arguments
    ///
    /// * `models` - Typically a previous engine's [`Engine::models`].
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn restored(mut self, models: impl IntoIterator<Item = P::Model>) -> Self {
        self.restored = Some(models.into_iter().collect());
        self
    }

    /// Restore from a host-supplied [`Snapshot`].
    pub fn restore_snapshot(self, snapshot: Snapshot<P::Model>) -> Self {
        self.restored(snapshot.into_models())
    }

    /// Set the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn onto `handle` instead of the runtime `build` is called from.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Validate the models and start the engine.
    ///
    /// # Errors
    ///
    /// * [`BuildError::Store`] -- duplicate initial or restored kinds.
    /// * [`BuildError::NoRuntime`] -- no runtime handle was given and `build`
    ///   was called outside a Tokio runtime.
    pub fn build(self) -> Result<Engine<P>, BuildError> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| BuildError::NoRuntime)?,
        };
        let store = ModelStore::new(self.initial, self.restored)?;
        tracing::debug!(engine = %self.config.name, models = store.len(), "engine built");

        let core = Core {
            program: self.program,
            config: self.config,
            runtime,
            store,
            updates: Broadcaster::new(),
            signals: Broadcaster::new(),
            handlers: DashMap::new(),
            requests: DashMap::new(),
            next_handler: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
            in_flight: QuiescenceLatch::new(),
            interrupt_permit: Semaphore::new(1),
            interrupted: AtomicBool::new(false),
            failure: OnceLock::new(),
        };
        Ok(Engine::from_core(Arc::new(core)))
    }
}
