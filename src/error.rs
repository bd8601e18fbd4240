//! Crate-level error types for construction, model lookup, dispatch,
//! handler bodies, and requests.

use crate::handler::HandlerId;
use crate::request::RequestId;

/// Error returned by the model store.
///
/// Model kinds are rendered through their `Debug` impl so the error type
/// stays independent of the application's model enum.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No model of this kind was ever registered.
    #[error("no model registered for kind {kind}")]
    NotFound {
        /// `Debug` rendering of the missing kind.
        kind: String,
    },

    /// Two initial models share a kind.
    #[error("duplicate initial model for kind {kind}")]
    DuplicateInitializer {
        /// `Debug` rendering of the duplicated kind.
        kind: String,
    },

    /// Two restored models share a kind.
    #[error("duplicate restored model for kind {kind}")]
    DuplicateRestored {
        /// `Debug` rendering of the duplicated kind.
        kind: String,
    },
}

/// Error returned when building an [`Engine`](crate::Engine).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The initial or restored model sets are invalid.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// `build` was called outside a Tokio runtime and no runtime handle was
    /// supplied through [`EngineBuilder::runtime`](crate::EngineBuilder::runtime).
    #[error("no tokio runtime available to spawn handlers on")]
    NoRuntime,
}

/// Error returned when new work is posted from outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The engine was interrupted and no longer accepts external work.
    #[error("engine is interrupted and no longer accepts new work")]
    Interrupted,
}

/// Error a handler body may fail with.
///
/// A failed handler is removed from the live table like any other finished
/// handler; what happens to its siblings is decided by the engine's
/// [`FailurePolicy`](crate::FailurePolicy).
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// A model lookup failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Posting follow-up work failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Application-level failure with a message.
    #[error("handler failed: {0}")]
    Failed(String),

    /// Any other error raised by application code.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Convenience alias for handler bodies.
pub type HandlerResult = Result<(), HandlerError>;

/// Error returned by [`Program::request`](crate::Program::request).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The program has no handler for this request payload.
    ///
    /// This is a configuration bug, not a runtime condition: the engine
    /// treats it as fatal regardless of the failure policy.
    #[error("no request handler for {request}")]
    Unhandled {
        /// Description of the unhandled payload.
        request: String,
    },

    /// The request ran and failed (e.g. a network error).
    #[error("request failed: {0}")]
    Failed(String),
}

/// Fatal outcome recorded by the engine before it tears itself down.
///
/// Only the first failure is kept. Inspect it with
/// [`Engine::failure`](crate::Engine::failure).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Failure {
    /// A request failed fatally.
    #[error("request {id} failed: {error}")]
    Request {
        /// The failed request.
        id: RequestId,
        /// The error it failed with.
        error: RequestError,
    },

    /// A handler failed while the engine runs with
    /// [`FailurePolicy::CancelAll`](crate::FailurePolicy::CancelAll).
    #[error("handler {id} failed: {message}")]
    Handler {
        /// The failed handler.
        id: HandlerId,
        /// Rendered error or panic message.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_display() {
        let err = StoreError::NotFound {
            kind: "Counter".to_string(),
        };
        assert_eq!(err.to_string(), "no model registered for kind Counter");
    }

    #[test]
    fn build_error_wraps_store_error_transparently() {
        let err = BuildError::from(StoreError::DuplicateInitializer {
            kind: "Sender".to_string(),
        });
        assert_eq!(err.to_string(), "duplicate initial model for kind Sender");
    }

    #[test]
    fn handler_error_from_store_error() {
        let err: HandlerError = StoreError::NotFound {
            kind: "Job".to_string(),
        }
        .into();
        assert!(matches!(err, HandlerError::Store(StoreError::NotFound { .. })));
    }

    #[test]
    fn handler_error_from_boxed_error() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk");
        let err = HandlerError::from(Box::new(io) as Box<dyn std::error::Error + Send + Sync>);
        assert!(err.to_string().contains("slow disk"));
    }

    #[test]
    fn failure_display_names_the_request() {
        let err = Failure::Request {
            id: RequestId::from_raw(7),
            error: RequestError::Unhandled {
                request: "Upload".to_string(),
            },
        };
        assert_eq!(
            err.to_string(),
            "request request-7 failed: no request handler for Upload"
        );
    }

    // Errors cross task boundaries, so they must be `Send + Sync`.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<StoreError>();
            assert_send_sync::<BuildError>();
            assert_send_sync::<DispatchError>();
            assert_send_sync::<HandlerError>();
            assert_send_sync::<RequestError>();
            assert_send_sync::<Failure>();
        }
    };
}
