//! Storage backends: where raw configuration values actually live.
//!
//! A backend knows nothing about the schema or about value types.  It stores
//! opaque [`RawValue`] text per (group, key), forgets it on `erase`, and
//! reports changes through a [`WatchStream`].
//!
//! # Change streams (for beginners)
//!
//! Backends may observe changes on any thread: the flat-file backend learns
//! about writes by other processes on a file-system watcher thread.  Rather
//! than calling listener code from that thread, the backend pushes a
//! [`ChangeEvent`] into a channel.  The other end of the channel, the
//! [`WatchStream`], is drained by the notification dispatcher during an event
//! loop pass, so listener callbacks always run on the loop's thread.
//!
//! ```text
//! backend thread                         event loop thread
//! ──────────────                         ─────────────────
//! ChangeSender::send(event) ──channel──► WatchStream::try_next()
//!        └─ wake the loop                       └─ Dispatcher delivers
//! ```
//!
//! # Variants
//!
//! - [`memory::MemoryBackend`] – process-local map; sees only changes made
//!   through the same instance.
//! - [`flat_file::FlatFileBackend`] – one TOML file per store; durable
//!   writes and cross-process change detection.

use std::fmt;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::domain::schema::KeyPath;

pub mod flat_file;
pub mod memory;

pub use flat_file::FlatFileBackend;
pub use memory::MemoryBackend;

/// Backend-level representation of a value.  Opaque to the backend itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawValue(String);

impl RawValue {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&str> for RawValue {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for RawValue {
    fn from(text: String) -> Self {
        Self(text)
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error type for backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Persisting a value failed.
    #[error("I/O error writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading the store failed for a reason other than "nothing stored yet".
    #[error("I/O error reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The store exists but its contents cannot be understood.
    #[error("store {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// A change watch could not be established.
    #[error("failed to watch {path}: {reason}")]
    Watch { path: PathBuf, reason: String },

    /// Generic failure for backends without a file path.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// A change to one (group, key) pair.  `raw` is `None` when the override was
/// erased and readers now observe the schema default.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub path: KeyPath,
    pub raw: Option<RawValue>,
}

/// Capability set every storage variant provides.
///
/// Implementations must be safe to call from any thread.
pub trait Backend: Send + Sync {
    /// Short identifier used in log lines.
    fn name(&self) -> &str;

    /// Returns the stored override, or `None` when the schema default applies.
    fn get_raw(&self, group: &str, key: &str) -> Result<Option<RawValue>, BackendError>;

    /// Stores an override.  Durable before returning for persistent variants.
    fn set_raw(&self, group: &str, key: &str, value: RawValue) -> Result<(), BackendError>;

    /// Removes any stored override.  Erasing a key without one is a no-op.
    fn erase(&self, group: &str, key: &str) -> Result<(), BackendError>;

    /// Every (group, key) pair that currently has an override.
    fn stored_keys(&self) -> Result<Vec<KeyPath>, BackendError>;

    /// Subscribes to changes of a single (group, key) pair.
    ///
    /// Dropping the returned stream ends the subscription.
    fn watch(&self, group: &str, key: &str) -> Result<WatchStream, BackendError>;

    /// Removes every stored override.  Returns how many were erased.
    fn erase_all(&self) -> Result<usize, BackendError> {
        let keys = self.stored_keys()?;
        for path in &keys {
            self.erase(&path.group, &path.key)?;
        }
        Ok(keys.len())
    }
}

// ── Watch channel ─────────────────────────────────────────────────────────────

type WakeFn = Box<dyn Fn() + Send + Sync>;
type WakeSlot = Arc<Mutex<Option<WakeFn>>>;

/// Creates the two ends of a change subscription for `path`.
pub fn watch_channel(path: KeyPath) -> (ChangeSender, WatchStream) {
    let (tx, rx) = mpsc::channel();
    let waker: WakeSlot = Arc::new(Mutex::new(None));
    let alive = Arc::new(AtomicBool::new(true));
    (
        ChangeSender {
            path: path.clone(),
            tx,
            waker: Arc::clone(&waker),
            alive: Arc::clone(&alive),
        },
        WatchStream {
            path,
            rx,
            waker,
            alive,
            on_close: None,
        },
    )
}

/// Backend-side end of a subscription.
pub struct ChangeSender {
    path: KeyPath,
    tx: Sender<ChangeEvent>,
    waker: WakeSlot,
    alive: Arc<AtomicBool>,
}

impl ChangeSender {
    pub fn path(&self) -> &KeyPath {
        &self.path
    }

    /// `true` once the matching [`WatchStream`] has been dropped.
    pub fn is_closed(&self) -> bool {
        !self.alive.load(Ordering::Acquire)
    }

    /// Queues a change and wakes whoever drains the stream.
    ///
    /// Returns `false` once the stream has been dropped, so the backend can
    /// forget this subscriber.
    pub fn send(&self, raw: Option<RawValue>) -> bool {
        let delivered = self
            .tx
            .send(ChangeEvent {
                path: self.path.clone(),
                raw,
            })
            .is_ok();
        if delivered {
            if let Some(wake) = self.waker.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                wake();
            }
        }
        delivered
    }
}

/// Consumer-side end of a subscription.
pub struct WatchStream {
    path: KeyPath,
    rx: Receiver<ChangeEvent>,
    waker: WakeSlot,
    alive: Arc<AtomicBool>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchStream {
    pub fn path(&self) -> &KeyPath {
        &self.path
    }

    /// Returns the next queued change without blocking.
    pub fn try_next(&self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Installs a callback invoked after every queued change.
    pub fn set_waker(&self, wake: impl Fn() + Send + Sync + 'static) {
        *self.waker.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(wake));
    }

    /// Runs `hook` when the stream is dropped, after it is marked closed.
    ///
    /// The hook must not be able to run while the backend's own lock is
    /// held, since it usually takes that lock to prune subscribers.
    pub(crate) fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl fmt::Debug for WatchStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchStream").field("path", &self.path).finish()
    }
}

/// Subscriber list shared by the backend implementations.
#[derive(Default)]
pub(crate) struct Subscribers {
    senders: Vec<ChangeSender>,
}

impl Subscribers {
    pub(crate) fn subscribe(&mut self, path: KeyPath) -> WatchStream {
        self.prune();
        let (sender, stream) = watch_channel(path);
        self.senders.push(sender);
        stream
    }

    /// Sends `raw` to every live subscriber of `path`, pruning dead ones.
    pub(crate) fn publish(&mut self, path: &KeyPath, raw: Option<RawValue>) {
        self.senders
            .retain(|sender| sender.path() != path || sender.send(raw.clone()));
    }

    /// Forgets subscribers whose stream has been dropped.
    pub(crate) fn prune(&mut self) {
        self.senders.retain(|sender| !sender.is_closed());
    }

    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn path() -> KeyPath {
        KeyPath::new("misc", "string")
    }

    #[test]
    fn test_sender_delivers_event_to_stream() {
        // Arrange
        let (sender, stream) = watch_channel(path());

        // Act
        assert!(sender.send(Some(RawValue::from("Bar foo"))));

        // Assert
        let event = stream.try_next().expect("event must be queued");
        assert_eq!(event.path, path());
        assert_eq!(event.raw, Some(RawValue::from("Bar foo")));
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn test_sender_reports_dropped_stream() {
        let (sender, stream) = watch_channel(path());
        drop(stream);
        assert!(!sender.send(None));
    }

    #[test]
    fn test_waker_runs_once_per_send() {
        // Arrange
        let (sender, stream) = watch_channel(path());
        let wakes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&wakes);
        stream.set_waker(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Act
        sender.send(None);
        sender.send(Some(RawValue::from("x")));

        // Assert
        assert_eq!(wakes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscribers_publish_only_to_matching_path_and_prune_dead() {
        // Arrange
        let mut subs = Subscribers::default();
        let wanted = subs.subscribe(path());
        let other = subs.subscribe(KeyPath::new("numeric", "integer"));
        let dropped = subs.subscribe(path());
        drop(dropped);

        // Act
        subs.publish(&path(), Some(RawValue::from("v")));

        // Assert
        assert!(wanted.try_next().is_some());
        assert!(other.try_next().is_none());
        assert_eq!(subs.senders.len(), 2, "dead subscriber must be pruned");
    }

    #[test]
    fn test_subscribe_forgets_streams_dropped_without_any_publish() {
        // Arrange
        let mut subs = Subscribers::default();

        // Act
        for _ in 0..1000 {
            drop(subs.subscribe(path()));
        }
        let live = subs.subscribe(path());

        // Assert
        assert_eq!(subs.len(), 1);
        subs.publish(&path(), None);
        assert!(live.try_next().is_some());
    }

    #[test]
    fn test_dropping_stream_closes_sender_then_runs_hook() {
        // Arrange
        let (sender, stream) = watch_channel(path());
        let sender = Arc::new(sender);
        let seen_closed = Arc::new(AtomicBool::new(false));
        let (hook_sender, flag) = (Arc::clone(&sender), Arc::clone(&seen_closed));
        let stream =
            stream.on_close(move || flag.store(hook_sender.is_closed(), Ordering::SeqCst));
        assert!(!sender.is_closed());

        // Act
        drop(stream);

        // Assert
        assert!(sender.is_closed());
        assert!(seen_closed.load(Ordering::SeqCst));
    }
}
