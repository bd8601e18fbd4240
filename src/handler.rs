//! Handler dispatch: runs units of application logic as independent,
//! cancellable tasks.
//!
//! A posted handler is polled once on the caller's thread before `post`
//! returns, so it runs synchronously up to its first suspension point. A
//! handler that never suspends is finished by the time `post` returns;
//! one that does suspend continues as a Tokio task.
//!
//! Handlers are **not** serialized against each other. Any number of them
//! may read and write the store at once; the only guarantee is that a single
//! write to a single model kind is atomic. Within one handler, the code
//! between two `.await`s is never interleaved with itself, but other
//! handlers may run in parallel on other worker threads.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Waker};

use futures::FutureExt;
use futures::future::{AbortHandle, Abortable, Aborted};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::engine::{Core, Engine};
use crate::error::{Failure, HandlerResult, StoreError};
use crate::model::{Model, Variant};
use crate::program::Program;
use crate::request::RequestId;

/// Identity of one handler invocation.
///
/// Assigned when the handler starts, increasing, never reused. It is
/// serializable so a handler can store its own id in a model and let a later
/// handler cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(u64);

impl HandlerId {
    /// The raw counter value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// How a handler or request task ended.
///
/// Handlers fail with a rendered message; requests keep their
/// [`RequestError`](crate::RequestError).
#[derive(Debug)]
pub(crate) enum Exit<T, E = String> {
    Completed(T),
    Failed(E),
    Panicked(String),
    Cancelled,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A running handler's view of the engine.
///
/// Passed by value into every handler. It carries the handler's own
/// [`HandlerId`] explicitly; there is no ambient "current handler".
pub struct HandlerContext<P: Program> {
    id: HandlerId,
    core: Arc<Core<P>>,
}

// Manual `Clone` because `P` itself need not be `Clone`.
impl<P: Program> Clone for HandlerContext<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            core: Arc::clone(&self.core),
        }
    }
}

impl<P: Program> fmt::Debug for HandlerContext<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<P: Program> HandlerContext<P> {
    /// This handler's own id.
    pub fn id(&self) -> HandlerId {
        self.id
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

    /// Snapshot of every model.
    pub fn models(&self) -> Vec<P::Model> {
        self.core.store.all()
    }

    /// Replace a model and publish it on the update stream.
    pub fn update(&self, model: impl Into<P::Model>) {
        self.core.update_model(model.into());
    }

    /// Atomically rewrite variant `V` and publish the result.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if `V::KIND` was never registered.
    pub fn modify<V, F>(&self, f: F) -> Result<V, StoreError>
    where
        V: Variant<P::Model> + Clone,
        F: FnOnce(V) -> V,
    {
        self.core.modify_model(f)
    }

    /// Publish an ephemeral signal.
    pub fn signal(&self, signal: P::Signal) {
        self.core.emit_signal(signal);
    }

    /// Start a detached request. Its event comes back through
    /// [`Program::on_event`] unless it is cancelled first.
    pub fn request(&self, request: P::Request) -> RequestId {
        self.core.post_request(request)
    }

    /// Cancel a pending request. `false` if it already finished or never
    /// existed.
    pub fn cancel_request(&self, id: RequestId) -> bool {
        self.core.cancel_request(id)
    }

    /// Cancel a running handler. `false` if it already finished or never
    /// existed.
    pub fn cancel_handler(&self, id: HandlerId) -> bool {
        self.core.cancel_handler(id)
    }

    /// Post a follow-up handler.
    ///
    /// Unlike [`Engine::post`], this is accepted while the engine drains:
    /// follow-up work is part of the chain the drain waits for.
    pub fn post<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: FnOnce(HandlerContext<P>) -> Fut,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.core.spawn_handler(handler)
    }

    /// A cloneable handle to the whole engine.
    pub fn engine(&self) -> Engine<P> {
        Engine::from_core(Arc::clone(&self.core))
    }
}

impl<P: Program> Core<P> {
    /// Register and start a handler.
    ///
    /// The abort handle is in the live table before the handler is first
    /// polled, so a cancel issued from anywhere can never miss it.
    pub(crate) fn spawn_handler<F, Fut>(self: &Arc<Self>, handler: F) -> HandlerId
    where
        F: FnOnce(HandlerContext<P>) -> Fut,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        let (abort, registration) = AbortHandle::new_pair();
        self.handlers.insert(id, abort);
        self.in_flight.increment();

        let span = tracing::debug_span!("handler", engine = %self.config.name, handler_id = %id);
        let ctx = HandlerContext {
            id,
            core: Arc::clone(self),
        };

        // Building the future runs caller code; a panic there must still
        // release the slot taken above.
        let body = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(ctx))) {
            Ok(body) => body,
            Err(payload) => {
                self.finish_handler(id, Exit::Panicked(panic_message(&*payload)));
                return id;
            }
        };

        let core = Arc::clone(self);
        let task = async move {
            tracing::debug!("handler started");
            let outcome = AssertUnwindSafe(Abortable::new(body, registration))
                .catch_unwind()
                .await;
            let exit = match outcome {
                Ok(Ok(Ok(()))) => Exit::Completed(()),
                Ok(Ok(Err(err))) => Exit::Failed(err.to_string()),
                Ok(Err(Aborted)) => Exit::Cancelled,
                Err(payload) => Exit::Panicked(panic_message(&*payload)),
            };
            core.finish_handler(id, exit);
        }
        .instrument(span);

        // Run up to the first suspension point right here. Every pending
        // future re-registers its waker on the next poll, which the runtime
        // performs as soon as the task is spawned.
        let mut task = Box::pin(task);
        let ready = {
            let _runtime = self.runtime.enter();
            let mut cx = Context::from_waker(Waker::noop());
            task.as_mut().poll(&mut cx).is_ready()
        };
        if !ready {
            self.runtime.spawn(task);
        }
        id
    }

    /// Abort a live handler. Removes it from the table immediately; it
    /// releases its in-flight slot once its task actually stops.
    pub(crate) fn cancel_handler(&self, id: HandlerId) -> bool {
        match self.handlers.remove(&id) {
            Some((_, abort)) => {
                abort.abort();
                tracing::debug!(engine = %self.config.name, handler_id = %id, "handler cancel requested");
                true
            }
            None => false,
        }
    }

    fn finish_handler(&self, id: HandlerId, exit: Exit<()>) {
        self.handlers.remove(&id);
        match exit {
            Exit::Completed(()) => tracing::debug!("handler finished"),
            Exit::Cancelled => tracing::debug!("handler cancelled"),
            Exit::Failed(message) => {
                tracing::warn!(handler_id = %id, error = %message, "handler failed");
                self.on_failure(Failure::Handler { id, message });
            }
            Exit::Panicked(message) => {
                tracing::error!(handler_id = %id, panic = %message, "handler panicked");
                self.on_failure(Failure::Handler { id, message });
            }
        }
        self.release();
    }
}
