//! Per-key listener registry and change delivery.
//!
//! The dispatcher is an [`EventSource`]: backends push [`ChangeEvent`]s into
//! watch streams from whatever thread observes them, and the dispatcher only
//! drains and delivers them when the owning [`EventLoop`] runs a pass.
//!
//! Per (group, key):
//!
//! ```text
//!   Idle ──change arrives──► Pending ──loop pass──► Delivering ──done──► Idle
//! ```
//!
//! Within one key, events are delivered in the order the backend emitted them
//! and listeners are called in registration order.  Listeners never run while
//! the registry lock is held, so a callback may add or remove listeners (or
//! write values) without deadlocking.  A callback that re-enters the loop
//! will not cause nested delivery.
//!
//! [`EventLoop`]: super::EventLoop

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::event_loop::{EventSource, LoopHandle};
use crate::backend::{ChangeEvent, WatchStream};
use crate::domain::schema::KeyPath;
use crate::domain::value::TypedValue;
use crate::error::ConfigError;

/// Listener callback: `(group, key, new value)`.
///
/// Identity for [`Dispatcher::remove`] is the `Arc` allocation, so keep a
/// clone of the `Arc` you registered.
pub type NotifyFn = Arc<dyn Fn(&str, &str, &TypedValue) + Send + Sync>;

/// Wraps a closure as a [`NotifyFn`].
pub fn notify_fn(f: impl Fn(&str, &str, &TypedValue) + Send + Sync + 'static) -> NotifyFn {
    Arc::new(f)
}

/// Opaque token returned by registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// Whether listeners hear about writes that leave the value unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyPolicy {
    /// Every completed write is delivered.
    #[default]
    Always,
    /// Writes equal to the last value seen by the key's listeners are dropped.
    OnChange,
}

impl std::str::FromStr for NotifyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(NotifyPolicy::Always),
            "on-change" | "on_change" | "onchange" => Ok(NotifyPolicy::OnChange),
            other => Err(format!("unknown notify policy {other:?}")),
        }
    }
}

/// Delivery state of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Pending,
    Delivering,
}

/// Storage layer a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Shared,
    Instance,
}

/// What the dispatcher needs from the client: change streams and the
/// effective typed value after a change.
pub trait ChangeFeed: Send + Sync {
    /// Opens change streams for a declared key, one per storage layer.
    fn watch(&self, path: &KeyPath) -> Result<Vec<(Layer, WatchStream)>, ConfigError>;

    /// The value readers observe right after `event` was applied to `layer`.
    fn resolve(&self, layer: Layer, event: &ChangeEvent) -> Result<TypedValue, ConfigError>;

    /// The value readers observe now.
    fn current(&self, path: &KeyPath) -> Result<TypedValue, ConfigError>;
}

// ── Registry ──────────────────────────────────────────────────────────────────

struct Registration {
    handle: ListenerHandle,
    callback: NotifyFn,
}

struct WatchedKey {
    listeners: Vec<Registration>,
    streams: Vec<(Layer, WatchStream)>,
    pending: VecDeque<(Layer, ChangeEvent)>,
    /// Last delivered value; only tracked under [`NotifyPolicy::OnChange`].
    last_value: Option<TypedValue>,
}

impl WatchedKey {
    fn pump(&mut self) {
        for (layer, stream) in &self.streams {
            while let Some(event) = stream.try_next() {
                self.pending.push_back((*layer, event));
            }
        }
    }
}

#[derive(Default)]
struct Registry {
    keys: HashMap<KeyPath, WatchedKey>,
    next_handle: u64,
    delivering: Option<KeyPath>,
}

impl Registry {
    fn pump_all(&mut self) -> bool {
        let mut any = false;
        for watched in self.keys.values_mut() {
            watched.pump();
            any |= !watched.pending.is_empty();
        }
        any
    }
}

/// Listener registry and delivery engine for one client.
pub struct Dispatcher {
    feed: Arc<dyn ChangeFeed>,
    policy: NotifyPolicy,
    loop_handle: LoopHandle,
    registry: Mutex<Registry>,
    delivery: Mutex<()>,
}

impl Dispatcher {
    pub fn new(feed: Arc<dyn ChangeFeed>, loop_handle: LoopHandle, policy: NotifyPolicy) -> Self {
        Self {
            feed,
            policy,
            loop_handle,
            registry: Mutex::new(Registry::default()),
            delivery: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> NotifyPolicy {
        self.policy
    }

    /// Registers `callback` for changes to `path`.
    ///
    /// The key's change streams are opened on the first registration.
    /// Registering the same callback twice yields two deliveries per change.
    pub fn add(&self, path: &KeyPath, callback: NotifyFn) -> Result<ListenerHandle, ConfigError> {
        let mut registry = self.lock();

        if !registry.keys.contains_key(path) {
            let streams = self.feed.watch(path)?;
            for (_, stream) in &streams {
                let handle = self.loop_handle.clone();
                stream.set_waker(move || handle.wakeup());
            }
            let last_value = match self.policy {
                NotifyPolicy::OnChange => Some(self.feed.current(path)?),
                NotifyPolicy::Always => None,
            };
            debug!("notify: watching {path} on {} layer(s)", streams.len());
            registry.keys.insert(
                path.clone(),
                WatchedKey {
                    listeners: Vec::new(),
                    streams,
                    pending: VecDeque::new(),
                    last_value,
                },
            );
        }

        let handle = ListenerHandle(registry.next_handle);
        registry.next_handle += 1;
        if let Some(watched) = registry.keys.get_mut(path) {
            watched.listeners.push(Registration { handle, callback });
        }
        Ok(handle)
    }

    /// Removes the earliest registration of `callback` for `path`.
    /// Returns `false` when nothing matched.
    pub fn remove(&self, path: &KeyPath, callback: &NotifyFn) -> bool {
        self.remove_where(|key, reg| key == path && same_callback(&reg.callback, callback))
    }

    /// Removes the registration identified by `handle`.
    pub fn remove_handle(&self, handle: ListenerHandle) -> bool {
        self.remove_where(|_, reg| reg.handle == handle)
    }

    fn remove_where(&self, matches: impl Fn(&KeyPath, &Registration) -> bool) -> bool {
        let mut registry = self.lock();
        let mut emptied = None;
        let mut removed = false;
        for (path, watched) in registry.keys.iter_mut() {
            if let Some(index) = watched.listeners.iter().position(|reg| matches(path, reg)) {
                watched.listeners.remove(index);
                removed = true;
                if watched.listeners.is_empty() {
                    emptied = Some(path.clone());
                }
                break;
            }
        }
        if let Some(path) = emptied {
            // Dropping the streams ends the backend subscriptions.
            registry.keys.remove(&path);
            debug!("notify: stopped watching {path}");
        }
        removed
    }

    /// Number of registrations for `path`.
    pub fn listener_count(&self, path: &KeyPath) -> usize {
        self.lock()
            .keys
            .get(path)
            .map_or(0, |watched| watched.listeners.len())
    }

    pub fn state(&self, path: &KeyPath) -> DeliveryState {
        let mut registry = self.lock();
        if registry.delivering.as_ref() == Some(path) {
            return DeliveryState::Delivering;
        }
        match registry.keys.get_mut(path) {
            Some(watched) => {
                watched.pump();
                if watched.pending.is_empty() {
                    DeliveryState::Idle
                } else {
                    DeliveryState::Pending
                }
            }
            None => DeliveryState::Idle,
        }
    }

    /// Delivers every event queued when the call starts.  Events produced by
    /// listeners during delivery wait for the next pass.
    fn deliver_queued(&self) -> usize {
        let _guard = match self.delivery.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return 0,
        };

        let work: Vec<KeyPath> = {
            let mut registry = self.lock();
            registry.pump_all();
            registry
                .keys
                .iter()
                .flat_map(|(path, watched)| {
                    std::iter::repeat(path.clone()).take(watched.pending.len())
                })
                .collect()
        };

        let mut delivered = 0;
        for path in work {
            let Some((layer, event, listeners)) = self.begin_delivery(&path) else {
                continue;
            };

            let value = match self.feed.resolve(layer, &event) {
                Ok(value) => value,
                Err(err) => {
                    warn!("notify: dropping change of {path}: {err}");
                    self.end_delivery();
                    continue;
                }
            };

            if self.policy == NotifyPolicy::OnChange && !self.record_if_changed(&path, &value) {
                debug!("notify: {path} unchanged, skipping delivery");
                self.end_delivery();
                continue;
            }

            for callback in listeners {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    callback(&path.group, &path.key, &value)
                }));
                if outcome.is_err() {
                    error!("notify: listener for {path} panicked; continuing with the next one");
                }
            }
            delivered += 1;
            self.end_delivery();
        }
        delivered
    }

    /// Pops the next event for `path` and snapshots its listeners.
    fn begin_delivery(&self, path: &KeyPath) -> Option<(Layer, ChangeEvent, Vec<NotifyFn>)> {
        let mut registry = self.lock();
        let watched = registry.keys.get_mut(path)?;
        let (layer, event) = watched.pending.pop_front()?;
        let listeners = watched
            .listeners
            .iter()
            .map(|reg| Arc::clone(&reg.callback))
            .collect();
        registry.delivering = Some(path.clone());
        Some((layer, event, listeners))
    }

    fn end_delivery(&self) {
        self.lock().delivering = None;
    }

    /// Stores `value` as last seen and reports whether it differs from the
    /// previous one.
    fn record_if_changed(&self, path: &KeyPath, value: &TypedValue) -> bool {
        let mut registry = self.lock();
        let Some(watched) = registry.keys.get_mut(path) else {
            return false;
        };
        if watched
            .last_value
            .as_ref()
            .is_some_and(|last| last.same_value(value))
        {
            return false;
        }
        watched.last_value = Some(value.clone());
        true
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSource for Dispatcher {
    fn prepare(&self) -> bool {
        self.lock().pump_all()
    }

    fn dispatch(&self) -> usize {
        self.deliver_queued()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock();
        f.debug_struct("Dispatcher")
            .field("policy", &self.policy)
            .field("watched_keys", &registry.keys.len())
            .finish()
    }
}

fn same_callback(a: &NotifyFn, b: &NotifyFn) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend, RawValue};
    use crate::notify::EventLoop;

    /// Feed over a single memory backend holding plain strings.
    struct StringFeed {
        backend: MemoryBackend,
    }

    impl ChangeFeed for StringFeed {
        fn watch(&self, path: &KeyPath) -> Result<Vec<(Layer, WatchStream)>, ConfigError> {
            if path.group == "missing" {
                return Err(ConfigError::UnknownKey {
                    group: path.group.clone(),
                    key: path.key.clone(),
                });
            }
            let stream = self
                .backend
                .watch(&path.group, &path.key)
                .map_err(|source| ConfigError::BackendRead {
                    path: Some(path.clone()),
                    source,
                })?;
            Ok(vec![(Layer::Shared, stream)])
        }

        fn resolve(&self, _layer: Layer, event: &ChangeEvent) -> Result<TypedValue, ConfigError> {
            Ok(TypedValue::String(
                event
                    .raw
                    .as_ref()
                    .map_or_else(|| "default".to_string(), |raw| raw.as_str().to_string()),
            ))
        }

        fn current(&self, path: &KeyPath) -> Result<TypedValue, ConfigError> {
            let raw = self.backend.get_raw(&path.group, &path.key).ok().flatten();
            self.resolve(
                Layer::Shared,
                &ChangeEvent {
                    path: path.clone(),
                    raw,
                },
            )
        }
    }

    struct Fixture {
        ev: EventLoop,
        feed: Arc<StringFeed>,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture(policy: NotifyPolicy) -> Fixture {
        let ev = EventLoop::new();
        let feed = Arc::new(StringFeed {
            backend: MemoryBackend::new(),
        });
        let dispatcher = Arc::new(Dispatcher::new(feed.clone(), ev.handle(), policy));
        ev.handle().attach(dispatcher.clone());
        Fixture {
            ev,
            feed,
            dispatcher,
        }
    }

    fn recorder() -> (NotifyFn, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback = notify_fn(move |group, key, value| {
            sink.lock()
                .unwrap()
                .push(format!("{group}/{key}={}", value.as_str().unwrap_or("?")));
        });
        (callback, seen)
    }

    fn set(fx: &Fixture, value: &str) {
        fx.feed
            .backend
            .set_raw("misc", "string", RawValue::from(value))
            .unwrap();
    }

    fn path() -> KeyPath {
        KeyPath::new("misc", "string")
    }

    #[test]
    fn test_no_delivery_until_loop_runs() {
        // Arrange
        let fx = fixture(NotifyPolicy::Always);
        let (callback, seen) = recorder();
        fx.dispatcher.add(&path(), callback).unwrap();

        // Act
        set(&fx, "a");

        // Assert
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(fx.dispatcher.state(&path()), DeliveryState::Pending);
        fx.ev.run_pending();
        assert_eq!(*seen.lock().unwrap(), vec!["misc/string=a"]);
        assert_eq!(fx.dispatcher.state(&path()), DeliveryState::Idle);
    }

    #[test]
    fn test_events_delivered_in_write_order() {
        let fx = fixture(NotifyPolicy::Always);
        let (callback, seen) = recorder();
        fx.dispatcher.add(&path(), callback).unwrap();

        set(&fx, "a");
        set(&fx, "b");
        set(&fx, "c");
        fx.ev.run_pending();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["misc/string=a", "misc/string=b", "misc/string=c"]
        );
    }

    #[test]
    fn test_listeners_called_in_registration_order() {
        // Arrange
        let fx = fixture(NotifyPolicy::Always);
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            fx.dispatcher
                .add(&path(), notify_fn(move |_, _, _| order.lock().unwrap().push(tag)))
                .unwrap();
        }

        // Act
        set(&fx, "x");
        fx.ev.run_pending();

        // Assert
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_duplicate_registration_delivers_twice_and_remove_drops_one() {
        // Arrange
        let fx = fixture(NotifyPolicy::Always);
        let (callback, seen) = recorder();
        fx.dispatcher.add(&path(), callback.clone()).unwrap();
        fx.dispatcher.add(&path(), callback.clone()).unwrap();

        // Act
        set(&fx, "a");
        fx.ev.run_pending();
        assert!(fx.dispatcher.remove(&path(), &callback));
        set(&fx, "b");
        fx.ev.run_pending();

        // Assert
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["misc/string=a", "misc/string=a", "misc/string=b"]
        );
        assert_eq!(fx.dispatcher.listener_count(&path()), 1);
    }

    #[test]
    fn test_remove_before_delivery_prevents_queued_delivery() {
        let fx = fixture(NotifyPolicy::Always);
        let (callback, seen) = recorder();
        fx.dispatcher.add(&path(), callback.clone()).unwrap();

        set(&fx, "a");
        assert!(fx.dispatcher.remove(&path(), &callback));
        fx.ev.run_pending();

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_unknown_callback_returns_false() {
        let fx = fixture(NotifyPolicy::Always);
        let (registered, _) = recorder();
        let (stranger, _) = recorder();
        fx.dispatcher.add(&path(), registered).unwrap();

        assert!(!fx.dispatcher.remove(&path(), &stranger));
        assert!(!fx
            .dispatcher
            .remove(&KeyPath::new("other", "key"), &stranger));
    }

    #[test]
    fn test_remove_by_handle_targets_single_registration() {
        let fx = fixture(NotifyPolicy::Always);
        let (callback, seen) = recorder();
        let first = fx.dispatcher.add(&path(), callback.clone()).unwrap();
        fx.dispatcher.add(&path(), callback).unwrap();

        assert!(fx.dispatcher.remove_handle(first));
        assert!(!fx.dispatcher.remove_handle(first));
        set(&fx, "a");
        fx.ev.run_pending();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_add_propagates_feed_error() {
        let fx = fixture(NotifyPolicy::Always);
        let (callback, _) = recorder();
        let err = fx
            .dispatcher
            .add(&KeyPath::new("missing", "key"), callback)
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey { .. }));
    }

    #[test]
    fn test_panicking_listener_does_not_block_later_listeners() {
        // Arrange
        let fx = fixture(NotifyPolicy::Always);
        fx.dispatcher
            .add(&path(), notify_fn(|_, _, _| panic!("listener failure")))
            .unwrap();
        let (callback, seen) = recorder();
        fx.dispatcher.add(&path(), callback).unwrap();

        // Act
        set(&fx, "a");
        fx.ev.run_pending();

        // Assert
        assert_eq!(*seen.lock().unwrap(), vec!["misc/string=a"]);
    }

    #[test]
    fn test_on_change_policy_skips_equal_writes() {
        let fx = fixture(NotifyPolicy::OnChange);
        let (callback, seen) = recorder();
        fx.dispatcher.add(&path(), callback).unwrap();

        set(&fx, "a");
        set(&fx, "a");
        set(&fx, "b");
        set(&fx, "b");
        fx.ev.run_pending();

        assert_eq!(*seen.lock().unwrap(), vec!["misc/string=a", "misc/string=b"]);
    }

    #[test]
    fn test_listener_may_register_another_listener_during_delivery() {
        // Arrange
        let fx = fixture(NotifyPolicy::Always);
        let (late, seen) = recorder();
        let dispatcher = Arc::clone(&fx.dispatcher);
        let added = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&added);
        fx.dispatcher
            .add(
                &path(),
                notify_fn(move |_, _, _| {
                    let mut done = flag.lock().unwrap();
                    if !*done {
                        dispatcher.add(&path(), late.clone()).unwrap();
                        *done = true;
                    }
                }),
            )
            .unwrap();

        // Act
        set(&fx, "a");
        fx.ev.run_pending();
        set(&fx, "b");
        fx.ev.run_pending();

        // Assert
        assert_eq!(*seen.lock().unwrap(), vec!["misc/string=b"]);
    }

    #[test]
    fn test_nested_loop_run_inside_listener_does_not_redeliver() {
        // Arrange
        let fx = fixture(NotifyPolicy::Always);
        let calls = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&calls);
        let handle = fx.ev.handle();
        let dispatcher = Arc::clone(&fx.dispatcher);
        fx.dispatcher
            .add(
                &path(),
                notify_fn(move |_, _, _| {
                    *counter.lock().unwrap() += 1;
                    // Re-entering the source while it delivers is a no-op.
                    assert_eq!(dispatcher.dispatch(), 0);
                    handle.wakeup();
                }),
            )
            .unwrap();

        // Act
        set(&fx, "a");
        fx.ev.run_pending();

        // Assert
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_last_listener_removal_closes_streams() {
        let fx = fixture(NotifyPolicy::Always);
        let (callback, _) = recorder();
        let handle = fx.dispatcher.add(&path(), callback).unwrap();

        fx.dispatcher.remove_handle(handle);
        set(&fx, "a");

        assert_eq!(fx.dispatcher.state(&path()), DeliveryState::Idle);
        assert!(!fx.ev.pending());
    }

    #[test]
    fn test_notify_policy_parses_config_spellings() {
        assert_eq!("always".parse::<NotifyPolicy>().unwrap(), NotifyPolicy::Always);
        assert_eq!("On-Change".parse::<NotifyPolicy>().unwrap(), NotifyPolicy::OnChange);
        assert!("sometimes".parse::<NotifyPolicy>().is_err());
    }
}
