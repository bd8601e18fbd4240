//! Detached, cancellable requests whose results re-enter the engine as new
//! handlers.
//!
//! A request's abort handle is registered before its task is spawned.
//! Completion and cancellation race on removing that entry from the request
//! table: whichever removes it first wins, so an event is forwarded only if
//! no cancel got there first.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::FutureExt;
use futures::future::{AbortHandle, Abortable, Aborted};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::engine::Core;
use crate::error::{Failure, RequestError};
use crate::handler::{Exit, panic_message};
use crate::program::Program;

/// Identity of one pending request.
///
/// Created on post, dropped on completion or cancellation, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// The raw counter value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request-{}", self.0)
    }
}

impl<P: Program> Core<P> {
    /// Register and spawn a request.
    ///
    /// The request holds an in-flight slot until after its follow-up handler
    /// has been posted, so a drain never sees a gap between the two.
    pub(crate) fn post_request(self: &Arc<Self>, payload: P::Request) -> RequestId {
        let id = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
        let (abort, registration) = AbortHandle::new_pair();
        self.requests.insert(id, abort);
        self.in_flight.increment();

        let span = tracing::debug_span!("request", engine = %self.config.name, request_id = %id);
        let core = Arc::clone(self);
        let task = async move {
            tracing::debug!("request started");
            let outcome = AssertUnwindSafe(Abortable::new(core.program.request(payload), registration))
                .catch_unwind()
                .await;
            let exit = match outcome {
                Ok(Ok(Ok(event))) => Exit::Completed(event),
                Ok(Ok(Err(err))) => Exit::Failed(err),
                Ok(Err(Aborted)) => Exit::Cancelled,
                Err(payload) => Exit::Panicked(panic_message(&*payload)),
            };
            core.finish_request(id, exit);
        }
        .instrument(span);

        self.runtime.spawn(task);
        id
    }

    /// Cancel a pending request. Never errors; reports whether it had an
    /// effect.
    pub(crate) fn cancel_request(&self, id: RequestId) -> bool {
        match self.requests.remove(&id) {
            Some((_, abort)) => {
                abort.abort();
                tracing::debug!(engine = %self.config.name, request_id = %id, "request cancelled");
                true
            }
            None => false,
        }
    }

    fn finish_request(self: &Arc<Self>, id: RequestId, exit: Exit<P::Event, RequestError>) {
        match exit {
            Exit::Completed(event) => {
                // Removal is the check: a cancel that already removed the
                // entry suppresses the event.
                if self.requests.remove(&id).is_some() {
                    tracing::debug!("request completed, dispatching event");
                    self.spawn_handler(move |ctx| P::on_event(ctx, event));
                } else {
                    tracing::debug!("request completed after cancel, event dropped");
                }
            }
            Exit::Cancelled => {}
            Exit::Failed(error @ RequestError::Unhandled { .. }) => {
                self.requests.remove(&id);
                tracing::error!(request_id = %id, error = %error, "request has no handler");
                self.fail(Failure::Request { id, error });
            }
            Exit::Failed(error) => {
                self.requests.remove(&id);
                tracing::warn!(request_id = %id, error = %error, "request failed");
                self.on_failure(Failure::Request { id, error });
            }
            Exit::Panicked(message) => {
                self.requests.remove(&id);
                tracing::error!(request_id = %id, panic = %message, "request panicked");
                self.on_failure(Failure::Request {
                    id,
                    error: RequestError::Failed(format!("panicked: {message}")),
                });
            }
        }
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio_stream::StreamExt;

    use super::*;
    use crate::config::{EngineConfig, FailurePolicy};
    use crate::engine::Engine;
    use crate::program::test_fixtures::{AppRequest, Notice, Sender, TestApp, initial_models};

    fn engine() -> Engine<TestApp> {
        Engine::builder(TestApp)
            .initial(initial_models())
            .build()
            .expect("engine should build")
    }

    #[test]
    fn request_id_display() {
        assert_eq!(RequestId::from_raw(12).to_string(), "request-12");
    }

    #[tokio::test]
    async fn completed_request_feeds_event_back() {
        let engine = engine();
        let mut signals = engine.signals();

        let id = engine
            .request(AppRequest::Send {
                delay: Duration::from_millis(10),
            })
            .expect("running");
        assert_eq!(engine.pending_requests(), 1);

        assert_eq!(signals.recv().await, Some(Notice::Sent));
        assert!(!engine.cancel_request(id), "finished requests cannot be cancelled");
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let engine = engine();
        let id = engine
            .request(AppRequest::Send {
                delay: Duration::from_secs(5),
            })
            .expect("running");

        assert!(engine.cancel_request(id));
        assert!(!engine.cancel_request(id));
        assert!(!engine.cancel_request(RequestId::from_raw(4242)));

        tokio::time::timeout(Duration::from_secs(1), engine.drained())
            .await
            .expect("cancelled request must not hold the drain");
    }

    #[tokio::test]
    async fn cancelled_request_never_emits() {
        let engine = engine();
        let mut signals = engine.signals();
        let mut updates = engine.updates();

        let stored = std::sync::Arc::new(Mutex::new(None));
        let slot = std::sync::Arc::clone(&stored);
        engine
            .post(move |ctx| async move {
                let id = ctx.request(AppRequest::Send {
                    delay: Duration::from_millis(50),
                });
                *slot.lock().expect("lock") = Some(id);
                Ok(())
            })
            .expect("running");

        let id = stored.lock().expect("lock").expect("request was posted");
        assert!(engine.cancel_request(id));
        engine.drained().await;

        assert_eq!(signals.next().await, None);
        assert_eq!(updates.next().await, None);
    }

    #[tokio::test]
    async fn failed_request_is_isolated_by_default() {
        let engine = engine();
        engine
            .request(AppRequest::Fail("offline".to_string()))
            .expect("running");
        engine.drained().await;
        assert!(engine.failure().is_none());
        assert_eq!(engine.model::<Sender>(), Ok(Sender::Idle));
    }

    #[tokio::test]
    async fn failed_request_under_cancel_all_is_recorded() {
        let engine = Engine::builder(TestApp)
            .initial(initial_models())
            .config(EngineConfig::default().with_failure_policy(FailurePolicy::CancelAll))
            .build()
            .expect("engine should build");

        let slow = engine
            .request(AppRequest::Send {
                delay: Duration::from_secs(5),
            })
            .expect("running");
        engine
            .request(AppRequest::Fail("offline".to_string()))
            .expect("running");

        tokio::time::timeout(Duration::from_secs(1), engine.drained())
            .await
            .expect("cancel-all must tear down the slow request");
        let failure = engine.failure().expect("cancel-all records the failure");
        assert!(matches!(
            &failure,
            Failure::Request {
                error: RequestError::Failed(reason),
                ..
            } if reason == "offline"
        ));
        assert_eq!(
            failure.to_string(),
            format!("request {} failed: request failed: offline", RequestId::from_raw(2))
        );
        assert!(!engine.cancel_request(slow));
    }

    #[tokio::test]
    async fn unhandled_request_is_fatal() {
        let engine = engine();
        let mut updates = engine.updates();
        let long = engine
            .post(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .expect("running");

        let id = engine.request(AppRequest::Unsupported).expect("running");

        tokio::time::timeout(Duration::from_secs(1), updates.next())
            .await
            .expect("a fatal request must close the streams");
        assert!(engine.is_closed());
        assert_eq!(
            engine.failure(),
            Some(Failure::Request {
                id,
                error: RequestError::Unhandled {
                    request: "Unsupported".to_string()
                }
            })
        );
        assert!(!engine.cancel_handler(long), "siblings were torn down");
    }
}
