//! Flat-file backend: one TOML document per store.
//!
//! Layout on disk (raw values are always TOML strings):
//!
//! ```toml
//! [misc]
//! string = "Quux baz"
//!
//! [list]
//! integer = "10;20;30;"
//! ```
//!
//! # Durability
//!
//! Every write re-reads the file, changes one entry, writes the whole
//! document to a sibling temporary file, `fsync`s it, renames it over the
//! store, and on Unix `fsync`s the directory so the rename itself survives a
//! crash.  The rename is atomic, so a crash leaves either the old or the new
//! document, never a torn one.  Re-reading first means entries written by
//! other processes since our last look are preserved.
//!
//! # Cross-process change detection
//!
//! [`Backend::watch`] starts a `notify` watcher on the store's *directory*
//! (watching the file itself would lose track of it after the first atomic
//! rename).  On every file-system event for the store, the document is
//! reloaded and diffed against the last snapshot; each differing entry is
//! published to its subscribers.  Our own writes update the snapshot before
//! they hit the disk and publish directly, so they are reported exactly once.
//!
//! A write by another process that stores a value identical to the current
//! one produces no diff and therefore no event.
//!
//! The watcher lives only while at least one [`WatchStream`] is open; dropping
//! the last stream stops it.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Backend, BackendError, RawValue, Subscribers, WatchStream};
use crate::domain::schema::KeyPath;

type Snapshot = BTreeMap<KeyPath, RawValue>;

struct FileState {
    /// Store contents as of our last read or write.
    snapshot: Snapshot,
    subscribers: Subscribers,
    watcher: Option<RecommendedWatcher>,
}

struct Inner {
    path: PathBuf,
    state: Mutex<FileState>,
}

/// Backend persisting overrides to a single TOML file.
pub struct FlatFileBackend {
    inner: Arc<Inner>,
}

impl FlatFileBackend {
    /// Opens the store at `path`.  The file need not exist yet.
    ///
    /// # Errors
    ///
    /// [`BackendError::Read`] or [`BackendError::Corrupt`] if an existing
    /// store cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let path = path.into();
        let snapshot = read_store(&path)?;
        info!("flat-file store {} opened ({} overrides)", path.display(), snapshot.len());
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                state: Mutex::new(FileState {
                    snapshot,
                    subscribers: Subscribers::default(),
                    watcher: None,
                }),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Applies `change` to the freshly re-read document and persists it.
    ///
    /// Returns `false` without writing when `change` reports nothing to do.
    fn update<F>(&self, change: F) -> Result<bool, BackendError>
    where
        F: FnOnce(&mut Snapshot) -> Vec<(KeyPath, Option<RawValue>)>,
    {
        let mut state = self.inner.lock();
        let mut current = read_store(&self.inner.path)?;

        // Surface changes other processes made since we last looked before
        // they get folded into our snapshot.
        for (path, raw) in diff(&state.snapshot, &current) {
            state.subscribers.publish(&path, raw);
        }
        state.snapshot = current.clone();

        let events = change(&mut current);
        if events.is_empty() {
            return Ok(false);
        }
        write_store(&self.inner.path, &current)?;
        state.snapshot = current;
        for (path, raw) in events {
            state.subscribers.publish(&path, raw);
        }
        Ok(true)
    }

    fn ensure_watcher(&self, state: &mut FileState) -> Result<(), BackendError> {
        if state.watcher.is_some() {
            return Ok(());
        }

        let path = &self.inner.path;
        let watch_err = |reason: String| BackendError::Watch {
            path: path.clone(),
            reason,
        };

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| watch_err(e.to_string()))?;
        // Nobody was listening while unwatched; start diffing from now.
        state.snapshot = read_store(path)?;

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_fs_event(&event);
                    }
                }
                Err(e) => warn!("flat-file watcher error: {e}"),
            }
        })
        .map_err(|e| watch_err(e.to_string()))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| watch_err(e.to_string()))?;

        info!("watching {} for external changes", path.display());
        state.watcher = Some(watcher);
        Ok(())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prunes closed subscriptions and stops the watcher once none remain.
    fn release_idle_watcher(&self) {
        let idle = {
            let mut state = self.lock();
            state.subscribers.prune();
            if state.subscribers.is_empty() {
                state.watcher.take()
            } else {
                None
            }
        };
        // Dropped outside the lock: the watcher thread may be waiting on it.
        if let Some(watcher) = idle {
            drop(watcher);
            info!("stopped watching {}", self.path.display());
        }
    }

    fn on_fs_event(&self, event: &notify::Event) {
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }
        let ours = event
            .paths
            .iter()
            .any(|p| p.file_name().is_some() && p.file_name() == self.path.file_name());
        if !ours {
            return;
        }

        let mut state = self.lock();
        match read_store(&self.path) {
            Ok(current) => {
                let changes = diff(&state.snapshot, &current);
                if !changes.is_empty() {
                    debug!("{} external change(s) in {}", changes.len(), self.path.display());
                }
                for (path, raw) in changes {
                    state.subscribers.publish(&path, raw);
                }
                state.snapshot = current;
            }
            Err(e) => warn!("ignoring unreadable store after change: {e}"),
        }
    }
}

impl Backend for FlatFileBackend {
    fn name(&self) -> &str {
        "flat-file"
    }

    fn get_raw(&self, group: &str, key: &str) -> Result<Option<RawValue>, BackendError> {
        let mut store = read_store(&self.inner.path)?;
        Ok(store.remove(&KeyPath::new(group, key)))
    }

    fn set_raw(&self, group: &str, key: &str, value: RawValue) -> Result<(), BackendError> {
        let path = KeyPath::new(group, key);
        debug!("flat-file: set {path} = {value:?}");
        self.update(move |doc| {
            doc.insert(path.clone(), value.clone());
            vec![(path, Some(value))]
        })?;
        Ok(())
    }

    fn erase(&self, group: &str, key: &str) -> Result<(), BackendError> {
        let path = KeyPath::new(group, key);
        let erased = self.update(move |doc| match doc.remove(&path) {
            Some(_) => vec![(path, None)],
            None => Vec::new(),
        })?;
        if erased {
            debug!("flat-file: erased {group}/{key}");
        }
        Ok(())
    }

    fn stored_keys(&self) -> Result<Vec<KeyPath>, BackendError> {
        Ok(read_store(&self.inner.path)?.into_keys().collect())
    }

    fn watch(&self, group: &str, key: &str) -> Result<WatchStream, BackendError> {
        let stream = {
            let mut state = self.inner.lock();
            self.ensure_watcher(&mut state)?;
            let stream = state.subscribers.subscribe(KeyPath::new(group, key));
            debug!("flat-file: {} open subscription(s)", state.subscribers.len());
            stream
        };
        let inner = Arc::downgrade(&self.inner);
        Ok(stream.on_close(move || {
            if let Some(inner) = inner.upgrade() {
                inner.release_idle_watcher();
            }
        }))
    }

    fn erase_all(&self) -> Result<usize, BackendError> {
        let mut erased = 0;
        self.update(|doc| {
            let events: Vec<_> = std::mem::take(doc)
                .into_keys()
                .map(|path| (path, None))
                .collect();
            erased = events.len();
            events
        })?;
        Ok(erased)
    }
}

// ── Store I/O ─────────────────────────────────────────────────────────────────

/// Reads the store.  A missing file is an empty store.
fn read_store(path: &Path) -> Result<Snapshot, BackendError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Snapshot::new()),
        Err(source) => {
            return Err(BackendError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let corrupt = |reason: String| BackendError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let document: toml::Table = toml::from_str(&text).map_err(|e| corrupt(e.to_string()))?;

    let mut snapshot = Snapshot::new();
    for (group, keys) in document {
        let toml::Value::Table(keys) = keys else {
            return Err(corrupt(format!("group `{group}` is not a table")));
        };
        for (key, raw) in keys {
            let toml::Value::String(raw) = raw else {
                return Err(corrupt(format!("{group}/{key} is not a string")));
            };
            snapshot.insert(KeyPath::new(group.clone(), key), RawValue::from(raw));
        }
    }
    Ok(snapshot)
}

/// Atomically replaces the store with `snapshot`.
fn write_store(path: &Path, snapshot: &Snapshot) -> Result<(), BackendError> {
    let write_err = |source: std::io::Error| BackendError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut document = toml::Table::new();
    for (key_path, raw) in snapshot {
        let group = document
            .entry(key_path.group.clone())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if let toml::Value::Table(keys) = group {
            keys.insert(key_path.key.clone(), toml::Value::String(raw.as_str().to_string()));
        }
    }
    let text = toml::to_string(&document)
        .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(write_err)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)?;
        sync_dir(&dir)
    })();
    if let Err(source) = result {
        std::fs::remove_file(&tmp).ok();
        return Err(write_err(source));
    }
    Ok(())
}

/// Flushes the directory entry so a completed rename is durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

/// Directories cannot be opened for syncing on this platform; the rename is
/// as durable as the file system makes it.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Entries that differ between `old` and `new`, as change events.
fn diff(old: &Snapshot, new: &Snapshot) -> Vec<(KeyPath, Option<RawValue>)> {
    let mut changes: Vec<(KeyPath, Option<RawValue>)> = new
        .iter()
        .filter(|(path, raw)| old.get(*path) != Some(*raw))
        .map(|(path, raw)| (path.clone(), Some(raw.clone())))
        .collect();
    changes.extend(
        old.keys()
            .filter(|path| !new.contains_key(*path))
            .map(|path| (path.clone(), None)),
    );
    changes
}
