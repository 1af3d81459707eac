//! Change notification: an explicit event loop plus the per-key listener
//! dispatcher that runs on it.

pub mod dispatcher;
pub mod event_loop;

pub use dispatcher::{
    notify_fn, ChangeFeed, DeliveryState, Dispatcher, Layer, ListenerHandle, NotifyFn,
    NotifyPolicy,
};
pub use event_loop::{EventLoop, EventSource, LoopHandle, SourceId};
