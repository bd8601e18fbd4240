//! The application side of an engine: its types and its effect routing.

use std::future::Future;

use crate::error::{HandlerResult, RequestError};
use crate::handler::HandlerContext;
use crate::model::Model;

/// Everything an [`Engine`](crate::Engine) needs to know about one
/// application.
///
/// Requests and events are plain enums, so routing them is an exhaustive
/// `match`: a variant without a branch fails to compile instead of failing
/// at runtime.
///
/// # Associated Types
///
/// - `Model`: the state slices held by the store.
/// - `Signal`: ephemeral notifications published on the signal stream.
/// - `Request`: payloads for detached effects started by handlers.
/// - `Event`: results of completed requests, fed back through
///   [`on_event`](Program::on_event).
///
/// # Contract
///
/// - [`request`](Program::request) performs the effect and may suspend for
///   as long as it needs; it must not touch the engine. Returning
///   [`RequestError::Unhandled`] is fatal for the engine.
/// - [`on_event`](Program::on_event) runs as an ordinary handler with its
///   own [`HandlerId`](crate::HandlerId).
pub trait Program: Send + Sync + Sized + 'static {
    /// The state slices held by the store.
    type Model: Model;

    /// Ephemeral notifications.
    type Signal: Clone + Send + 'static;

    /// Payloads for detached effects.
    type Request: Send + 'static;

    /// Results of completed requests.
    type Event: Send + 'static;

    /// Perform a request and produce the event to react to.
    fn request(
        &self,
        request: Self::Request,
    ) -> impl Future<Output = Result<Self::Event, RequestError>> + Send;

    /// React to a completed request. Runs as a new handler.
    fn on_event(
        ctx: HandlerContext<Self>,
        event: Self::Event,
    ) -> impl Future<Output = HandlerResult> + Send + 'static;
}
