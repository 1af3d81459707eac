//! Client facade: the one type applications talk to.
//!
//! A [`Client`] binds an immutable [`SchemaRegistry`] to a storage
//! [`Backend`] and, optionally, to an [`EventLoop`] for change notification.
//!
//! # Layers (for beginners)
//!
//! Every read resolves through up to three layers, first hit wins:
//!
//! ```text
//!   instance overlay   (only when built with `.instance(..)`)
//!         │ miss
//!   shared store       (the bound backend)
//!         │ miss
//!   schema default
//! ```
//!
//! Writes always go to the topmost layer that exists.  `reset(true)` clears
//! only the instance overlay; `reset(false)` clears both.
//!
//! # Errors
//!
//! Reads never fail just because nothing is stored: a missing override means
//! the schema default.  A backend that cannot be read at all also degrades
//! to the default (with a warning), while a store or value that exists but
//! cannot be understood surfaces as [`ConfigError::BackendRead`] or
//! [`ConfigError::CorruptValue`].
//!
//! [`EventLoop`]: crate::notify::EventLoop

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError, ChangeEvent, MemoryBackend, WatchStream};
use crate::codec::{decode, encode};
use crate::domain::schema::{KeyPath, SchemaEntry, SchemaRegistry};
use crate::domain::value::{ScalarType, TypedValue, ValueType};
use crate::error::ConfigError;
use crate::notify::{
    ChangeFeed, DeliveryState, Dispatcher, Layer, ListenerHandle, LoopHandle, NotifyFn,
    NotifyPolicy, SourceId,
};

// ── Layers ────────────────────────────────────────────────────────────────────

struct Layers {
    schema: Arc<SchemaRegistry>,
    shared: Arc<dyn Backend>,
    instance: Option<Arc<dyn Backend>>,
}

impl Layers {
    fn entry(&self, group: &str, key: &str) -> Result<&SchemaEntry, ConfigError> {
        Ok(self.schema.lookup(group, key)?)
    }

    /// The layer that receives writes.
    fn writable(&self) -> &Arc<dyn Backend> {
        self.instance.as_ref().unwrap_or(&self.shared)
    }

    /// Reads and decodes one layer's override, if any.
    fn read_layer(
        &self,
        backend: &dyn Backend,
        entry: &SchemaEntry,
    ) -> Result<Option<TypedValue>, ConfigError> {
        let raw = match backend.get_raw(entry.group(), entry.key()) {
            Ok(raw) => raw,
            Err(source @ BackendError::Corrupt { .. }) => {
                return Err(ConfigError::BackendRead {
                    path: Some(entry.path.clone()),
                    source,
                })
            }
            Err(err) => {
                warn!(
                    "{}: cannot read {}, using lower layer: {err}",
                    backend.name(),
                    entry.path
                );
                return Ok(None);
            }
        };
        raw.map(|raw| decode(entry, &raw).map_err(|e| ConfigError::mismatch(&entry.path, e)))
            .transpose()
    }

    fn shared_or_default(&self, entry: &SchemaEntry) -> Result<TypedValue, ConfigError> {
        Ok(self
            .read_layer(self.shared.as_ref(), entry)?
            .unwrap_or_else(|| entry.default.clone()))
    }

    fn effective(&self, entry: &SchemaEntry) -> Result<TypedValue, ConfigError> {
        if let Some(instance) = &self.instance {
            if let Some(value) = self.read_layer(instance.as_ref(), entry)? {
                return Ok(value);
            }
        }
        self.shared_or_default(entry)
    }

    fn decode_event(
        &self,
        entry: &SchemaEntry,
        event: &ChangeEvent,
    ) -> Option<Result<TypedValue, ConfigError>> {
        event
            .raw
            .as_ref()
            .map(|raw| decode(entry, raw).map_err(|e| ConfigError::mismatch(&entry.path, e)))
    }
}

impl ChangeFeed for Layers {
    fn watch(&self, path: &KeyPath) -> Result<Vec<(Layer, WatchStream)>, ConfigError> {
        self.entry(&path.group, &path.key)?;
        let open = |backend: &Arc<dyn Backend>| {
            backend
                .watch(&path.group, &path.key)
                .map_err(|source| ConfigError::BackendRead {
                    path: Some(path.clone()),
                    source,
                })
        };
        let mut streams = vec![(Layer::Shared, open(&self.shared)?)];
        if let Some(instance) = &self.instance {
            streams.push((Layer::Instance, open(instance)?));
        }
        Ok(streams)
    }

    fn resolve(&self, layer: Layer, event: &ChangeEvent) -> Result<TypedValue, ConfigError> {
        let entry = self.entry(&event.path.group, &event.path.key)?;
        match layer {
            Layer::Instance => match self.decode_event(entry, event) {
                Some(value) => value,
                None => self.shared_or_default(entry),
            },
            Layer::Shared => {
                // An instance override hides shared-store changes.
                if let Some(instance) = &self.instance {
                    if let Some(value) = self.read_layer(instance.as_ref(), entry)? {
                        return Ok(value);
                    }
                }
                match self.decode_event(entry, event) {
                    Some(value) => value,
                    None => Ok(entry.default.clone()),
                }
            }
        }
    }

    fn current(&self, path: &KeyPath) -> Result<TypedValue, ConfigError> {
        let entry = self.entry(&path.group, &path.key)?;
        self.effective(entry)
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

enum SchemaSource {
    Path(PathBuf),
    Text(String),
    Registry(Arc<SchemaRegistry>),
}

/// Step-by-step construction of a [`Client`].
pub struct ClientBuilder {
    schema: SchemaSource,
    backend: Option<Arc<dyn Backend>>,
    instance: Option<(String, Arc<dyn Backend>)>,
    event_loop: Option<LoopHandle>,
    policy: NotifyPolicy,
}

impl ClientBuilder {
    fn new(schema: SchemaSource) -> Self {
        Self {
            schema,
            backend: None,
            instance: None,
            event_loop: None,
            policy: NotifyPolicy::default(),
        }
    }

    /// Shared store.  Defaults to a fresh [`MemoryBackend`].
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Adds a per-instance overlay named `id` stored in `backend`.
    pub fn instance(mut self, id: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        self.instance = Some((id.into(), backend));
        self
    }

    /// Enables change notification, delivered on the given loop.
    pub fn event_loop(mut self, handle: LoopHandle) -> Self {
        self.event_loop = Some(handle);
        self
    }

    pub fn notify_policy(mut self, policy: NotifyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Result<Client, ConfigError> {
        let schema = match self.schema {
            SchemaSource::Path(path) => Arc::new(SchemaRegistry::load(path)?),
            SchemaSource::Text(text) => Arc::new(SchemaRegistry::parse(&text)?),
            SchemaSource::Registry(registry) => registry,
        };
        let shared = self
            .backend
            .unwrap_or_else(|| Arc::new(MemoryBackend::new()));
        let (instance_id, instance) = match self.instance {
            Some((id, backend)) => (Some(id), Some(backend)),
            None => (None, None),
        };

        info!(
            "config client ready: {} keys, backend={}{}",
            schema.len(),
            shared.name(),
            instance_id
                .as_deref()
                .map(|id| format!(", instance={id}"))
                .unwrap_or_default()
        );

        let layers = Arc::new(Layers {
            schema,
            shared,
            instance,
        });

        let notifier = self.event_loop.map(|handle| {
            let dispatcher = Arc::new(Dispatcher::new(layers.clone(), handle.clone(), self.policy));
            let source = handle.attach(dispatcher.clone());
            Notifier {
                dispatcher,
                handle,
                source,
            }
        });

        Ok(Client {
            layers,
            notifier,
            instance_id,
        })
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

struct Notifier {
    dispatcher: Arc<Dispatcher>,
    handle: LoopHandle,
    source: SourceId,
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.handle.detach(self.source);
    }
}

/// Typed, schema-checked access to one configuration store.
pub struct Client {
    layers: Arc<Layers>,
    notifier: Option<Notifier>,
    instance_id: Option<String>,
}

impl Client {
    /// Starts building a client whose schema is read from `path`.
    pub fn builder(schema_path: impl Into<PathBuf>) -> ClientBuilder {
        ClientBuilder::new(SchemaSource::Path(schema_path.into()))
    }

    /// Starts building a client from schema text.
    pub fn builder_from_str(schema: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(SchemaSource::Text(schema.into()))
    }

    /// Starts building a client around an already-loaded registry.
    pub fn builder_from_registry(schema: Arc<SchemaRegistry>) -> ClientBuilder {
        ClientBuilder::new(SchemaSource::Registry(schema))
    }

    /// Loads the schema at `schema_path` and binds it to `backend`, without
    /// change notification.
    pub fn new(
        schema_path: impl Into<PathBuf>,
        backend: Arc<dyn Backend>,
    ) -> Result<Self, ConfigError> {
        Self::builder(schema_path).backend(backend).build()
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.layers.schema
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    /// Effective value of a declared key.
    pub fn get(&self, group: &str, key: &str) -> Result<TypedValue, ConfigError> {
        let entry = self.layers.entry(group, key)?;
        self.layers.effective(entry)
    }

    /// Alias of [`Client::get`].
    pub fn get_value(&self, group: &str, key: &str) -> Result<TypedValue, ConfigError> {
        self.get(group, key)
    }

    pub fn get_bool(&self, group: &str, key: &str) -> Result<bool, ConfigError> {
        self.get_scalar(group, key, ScalarType::Bool, TypedValue::as_bool)
    }

    pub fn get_int(&self, group: &str, key: &str) -> Result<i64, ConfigError> {
        self.get_scalar(group, key, ScalarType::Int, TypedValue::as_int)
    }

    pub fn get_float(&self, group: &str, key: &str) -> Result<f64, ConfigError> {
        self.get_scalar(group, key, ScalarType::Float, TypedValue::as_float)
    }

    pub fn get_string(&self, group: &str, key: &str) -> Result<String, ConfigError> {
        self.get_scalar(group, key, ScalarType::String, |v| v.as_str().map(str::to_string))
    }

    /// Elements of a list-typed key.
    pub fn get_list(&self, group: &str, key: &str) -> Result<Vec<TypedValue>, ConfigError> {
        let entry = self.layers.entry(group, key)?;
        if !entry.value_type.is_list() {
            return Err(accessor_mismatch(entry, "list"));
        }
        match self.layers.effective(entry)? {
            TypedValue::List(items) => Ok(items),
            _ => Err(accessor_mismatch(entry, "list")),
        }
    }

    fn get_scalar<T>(
        &self,
        group: &str,
        key: &str,
        wanted: ScalarType,
        extract: impl FnOnce(&TypedValue) -> Option<T>,
    ) -> Result<T, ConfigError> {
        let entry = self.layers.entry(group, key)?;
        if entry.value_type != ValueType::from(wanted) {
            return Err(accessor_mismatch(entry, wanted.name()));
        }
        extract(&self.layers.effective(entry)?)
            .ok_or_else(|| accessor_mismatch(entry, wanted.name()))
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    /// Type-checks, encodes and persists `value` as an override.
    ///
    /// Nothing is written when validation fails.
    pub fn set(
        &self,
        group: &str,
        key: &str,
        value: impl Into<TypedValue>,
    ) -> Result<(), ConfigError> {
        let entry = self.layers.entry(group, key)?;
        let value = value.into();
        let raw = encode(entry, &value).map_err(|e| ConfigError::mismatch(&entry.path, e))?;
        let backend = self.layers.writable();
        debug!("{}: set {} = {value}", backend.name(), entry.path);
        backend
            .set_raw(group, key, raw)
            .map_err(|source| ConfigError::BackendWrite {
                path: Some(entry.path.clone()),
                source,
            })
    }

    /// Alias of [`Client::set`].
    pub fn set_value(&self, group: &str, key: &str, value: TypedValue) -> Result<(), ConfigError> {
        self.set(group, key, value)
    }

    pub fn set_bool(&self, group: &str, key: &str, value: bool) -> Result<(), ConfigError> {
        self.set(group, key, TypedValue::Bool(value))
    }

    pub fn set_int(&self, group: &str, key: &str, value: i64) -> Result<(), ConfigError> {
        self.set(group, key, TypedValue::Int(value))
    }

    pub fn set_float(&self, group: &str, key: &str, value: f64) -> Result<(), ConfigError> {
        self.set(group, key, TypedValue::Float(value))
    }

    pub fn set_string(&self, group: &str, key: &str, value: &str) -> Result<(), ConfigError> {
        self.set(group, key, TypedValue::String(value.to_string()))
    }

    pub fn set_list<I, T>(&self, group: &str, key: &str, items: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<TypedValue>,
    {
        self.set(
            group,
            key,
            TypedValue::List(items.into_iter().map(Into::into).collect()),
        )
    }

    /// Drops the override for one key from the writable layer, so readers see
    /// the next layer down.
    pub fn unset(&self, group: &str, key: &str) -> Result<(), ConfigError> {
        let entry = self.layers.entry(group, key)?;
        self.layers
            .writable()
            .erase(group, key)
            .map_err(|source| ConfigError::BackendWrite {
                path: Some(entry.path.clone()),
                source,
            })
    }

    /// Removes stored overrides.  With `instance_only` only the instance
    /// overlay is cleared (a no-op for clients without one); otherwise the
    /// shared store is cleared too.  Returns how many overrides were erased.
    ///
    /// Only `reset(false)` guarantees that every key reads its schema default
    /// afterwards.
    ///
    /// # Example
    ///
    /// ```rust
    /// use dacfg_core::Client;
    ///
    /// let schema = "[numeric.integer]\ntype = \"int\"\ndefault = 3\n";
    /// let client = Client::builder_from_str(schema).build().unwrap();
    /// client.set_int("numeric", "integer", 100).unwrap();
    ///
    /// // No instance overlay: nothing to clear, the shared override stays.
    /// assert_eq!(client.reset(true).unwrap(), 0);
    /// assert_eq!(client.get_int("numeric", "integer").unwrap(), 100);
    ///
    /// assert_eq!(client.reset(false).unwrap(), 1);
    /// assert_eq!(client.get_int("numeric", "integer").unwrap(), 3);
    /// ```
    pub fn reset(&self, instance_only: bool) -> Result<usize, ConfigError> {
        if instance_only && self.layers.instance.is_none() {
            warn!("reset(instance_only) without an instance overlay: shared overrides kept");
            return Ok(0);
        }

        let erase = |backend: &Arc<dyn Backend>| {
            backend
                .erase_all()
                .map_err(|source| ConfigError::BackendWrite { path: None, source })
        };

        let mut erased = 0;
        if let Some(instance) = &self.layers.instance {
            erased += erase(instance)?;
        }
        if !instance_only {
            erased += erase(&self.layers.shared)?;
        }
        info!("reset erased {erased} override(s) (instance_only={instance_only})");
        Ok(erased)
    }

    // ── Notification ─────────────────────────────────────────────────────────

    /// Registers `callback` for changes to a declared key.  Callbacks run
    /// during event-loop passes, never inside `set`.
    pub fn notify_add(
        &self,
        group: &str,
        key: &str,
        callback: NotifyFn,
    ) -> Result<ListenerHandle, ConfigError> {
        let entry = self.layers.entry(group, key)?;
        self.dispatcher()?.add(&entry.path, callback)
    }

    /// Removes the earliest registration of `callback` for the key.
    /// Returns `Ok(false)` when nothing matched.
    pub fn notify_remove(
        &self,
        group: &str,
        key: &str,
        callback: &NotifyFn,
    ) -> Result<bool, ConfigError> {
        let entry = self.layers.entry(group, key)?;
        Ok(self.dispatcher()?.remove(&entry.path, callback))
    }

    pub fn notify_remove_handle(&self, handle: ListenerHandle) -> Result<bool, ConfigError> {
        Ok(self.dispatcher()?.remove_handle(handle))
    }

    /// Delivery state of a key; [`DeliveryState::Idle`] for unwatched keys.
    pub fn delivery_state(&self, group: &str, key: &str) -> Result<DeliveryState, ConfigError> {
        let entry = self.layers.entry(group, key)?;
        Ok(self.dispatcher()?.state(&entry.path))
    }

    fn dispatcher(&self) -> Result<&Dispatcher, ConfigError> {
        self.notifier
            .as_ref()
            .map(|n| n.dispatcher.as_ref())
            .ok_or(ConfigError::NoEventLoop)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("keys", &self.layers.schema.len())
            .field("backend", &self.layers.shared.name())
            .field("instance_id", &self.instance_id)
            .field("notify", &self.notifier.is_some())
            .finish()
    }
}

fn accessor_mismatch(entry: &SchemaEntry, requested: &str) -> ConfigError {
    ConfigError::TypeMismatch {
        group: entry.group().to_string(),
        key: entry.key().to_string(),
        expected: entry.value_type,
        found: format!("{requested} accessor"),
    }
}
