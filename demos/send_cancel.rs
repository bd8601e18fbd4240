//! Send a slow message, cancel it, send another, then drain.
//!
//! Run with: `RUST_LOG=empress=debug cargo run --example send_cancel`

use std::time::Duration;

use empress::{Engine, HandlerContext, HandlerResult, Model, Program, RequestError, RequestId, Variant};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// Number of messages actually delivered.
#[derive(Debug, Clone, Default, PartialEq)]
struct Delivered(u32);

/// Whether a message is on its way.
#[derive(Debug, Clone, PartialEq)]
enum Outbox {
    Idle,
    Sending(RequestId),
}

#[derive(Debug, Clone, PartialEq)]
enum State {
    Delivered(Delivered),
    Outbox(Outbox),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Delivered,
    Outbox,
}

impl Model for State {
    type Kind = Kind;

    fn kind(&self) -> Kind {
        match self {
            State::Delivered(_) => Kind::Delivered,
            State::Outbox(_) => Kind::Outbox,
        }
    }
}

impl From<Delivered> for State {
    fn from(value: Delivered) -> Self {
        State::Delivered(value)
    }
}

impl From<Outbox> for State {
    fn from(value: Outbox) -> Self {
        State::Outbox(value)
    }
}

impl Variant<State> for Delivered {
    const KIND: Kind = Kind::Delivered;

    fn from_model(model: State) -> Option<Self> {
        match model {
            State::Delivered(d) => Some(d),
            _ => None,
        }
    }
}

impl Variant<State> for Outbox {
    const KIND: Kind = Kind::Outbox;

    fn from_model(model: State) -> Option<Self> {
        match model {
            State::Outbox(o) => Some(o),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Toast {
    Sent(String),
    Cancelled,
}

enum Request {
    Deliver { body: String, latency: Duration },
}

enum Event {
    Delivered(String),
}

struct Messenger;

impl Program for Messenger {
    type Model = State;
    type Signal = Toast;
    type Request = Request;
    type Event = Event;

    async fn request(&self, request: Request) -> Result<Event, RequestError> {
        match request {
            Request::Deliver { body, latency } => {
                tokio::time::sleep(latency).await;
                Ok(Event::Delivered(body))
            }
        }
    }

    async fn on_event(ctx: HandlerContext<Self>, event: Event) -> HandlerResult {
        match event {
            Event::Delivered(body) => {
                ctx.modify(|d: Delivered| Delivered(d.0 + 1))?;
                ctx.update(Outbox::Idle);
                ctx.signal(Toast::Sent(body));
            }
        }
        Ok(())
    }
}

async fn send(ctx: HandlerContext<Messenger>, body: String, latency: Duration) -> HandlerResult {
    let request = ctx.request(Request::Deliver { body, latency });
    ctx.update(Outbox::Sending(request));
    Ok(())
}

async fn cancel(ctx: HandlerContext<Messenger>) -> HandlerResult {
    if let Outbox::Sending(request) = ctx.model::<Outbox>()? {
        if ctx.cancel_request(request) {
            ctx.signal(Toast::Cancelled);
        }
    }
    ctx.update(Outbox::Idle);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let engine = Engine::builder(Messenger)
        .model(Delivered::default())
        .model(Outbox::Idle)
        .build()?;

    let mut updates = engine.updates_with_current();
    let mut toasts = engine.signals();
    let printer = tokio::spawn(async move {
        while let Some(model) = updates.next().await {
            println!("update: {model:?}");
        }
    });

    engine.post(|ctx| send(ctx, "slow".to_owned(), Duration::from_secs(1)))?;
    engine.post(cancel)?;
    engine.post(|ctx| send(ctx, "fast".to_owned(), Duration::from_millis(50)))?;

    engine.drained().await;
    printer.await?;
    while let Some(toast) = toasts.next().await {
        println!("toast: {toast:?}");
    }

    println!("delivered: {}", engine.model::<Delivered>()?.0);
    println!("snapshot: {:?}", engine.snapshot().into_models());
    Ok(())
}
