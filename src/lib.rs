//! Reactive state orchestration: a typed model store, concurrent handlers,
//! cancellable requests, and multicast update streams behind one engine.

mod broadcast;
pub use broadcast::{Broadcaster, Signals, Subscription, Updates};
mod config;
pub use config::{EngineConfig, FailurePolicy};
mod engine;
pub use engine::{Engine, EngineBuilder};
mod error;
mod handler;
mod latch;
mod model;
mod program;
mod request;
mod snapshot;
mod store;

pub use error::{
    BuildError, DispatchError, Failure, HandlerError, HandlerResult, RequestError, StoreError,
};
pub use handler::{HandlerContext, HandlerId};
pub use latch::QuiescenceLatch;
pub use model::{Model, Variant};
pub use program::Program;
pub use request::RequestId;
pub use snapshot::Snapshot;
pub use store::ModelStore;
