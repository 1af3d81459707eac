//! # dacfg-core
//!
//! Schema-typed configuration engine.  Applications read and write typed
//! values identified by (group, key), validated against a declarative schema,
//! persisted through a pluggable storage backend, and observed through
//! change notifications delivered on an explicitly driven event loop.
//!
//! # Architecture overview (for beginners)
//!
//! ```text
//!            ┌────────────┐   typed values    ┌──────────────┐
//!  app ────► │   Client   │ ◄───────────────► │ SchemaRegistry│
//!            └─────┬──────┘                   └──────────────┘
//!                  │ encode / decode (codec)
//!                  ▼
//!            ┌────────────┐  ChangeEvent   ┌────────────┐   callbacks
//!            │  Backend   │ ─────────────► │ Dispatcher │ ─────────────► app
//!            └────────────┘   (channel)    └─────┬──────┘
//!                                                │ runs on
//!                                          ┌─────▼──────┐
//!                                          │ EventLoop  │
//!                                          └────────────┘
//! ```
//!
//! - **`domain`** – the schema registry and the closed set of value types.
//! - **`codec`** – the marshaler between typed values and the backend's raw
//!   text form.
//! - **`backend`** – the storage capability set and its two variants:
//!   in-memory and a TOML flat file.
//! - **`notify`** – the event loop and per-key listener dispatch.
//! - **`client`** – the facade tying the above together.
//! - **`settings`** – engine settings (backend choice, notify policy).

pub mod backend;
pub mod client;
pub mod codec;
pub mod domain;
pub mod error;
pub mod notify;
pub mod settings;

// Re-export the most-used types at the crate root so callers can write
// `dacfg_core::Client` instead of `dacfg_core::client::Client`.
pub use backend::{Backend, BackendError, ChangeEvent, FlatFileBackend, MemoryBackend, RawValue};
pub use client::{Client, ClientBuilder};
pub use codec::{decode, decode_as, encode, encode_as, MarshalError};
pub use domain::schema::{KeyPath, SchemaEntry, SchemaError, SchemaRegistry};
pub use domain::value::{ScalarType, TypedValue, ValueType};
pub use error::ConfigError;
pub use notify::{
    notify_fn, DeliveryState, EventLoop, ListenerHandle, LoopHandle, NotifyFn, NotifyPolicy,
};
pub use settings::{load_settings, BackendKind, EngineSettings, SettingsError};
