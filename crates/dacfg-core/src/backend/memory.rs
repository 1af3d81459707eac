//! In-memory backend.
//!
//! Values live in a `HashMap` for the lifetime of the instance.  Used as the
//! default store when no persistent location is configured, as the
//! per-instance override layer, and throughout the tests.
//!
//! Only changes made through *this* instance are observable via
//! [`Backend::watch`]; share the instance behind an `Arc` to share state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::{Backend, BackendError, RawValue, Subscribers, WatchStream};
use crate::domain::schema::KeyPath;

#[derive(Default)]
struct MemoryState {
    values: HashMap<KeyPath, RawValue>,
    subscribers: Subscribers,
}

/// Process-local backend.
#[derive(Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored overrides.
    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().values.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn get_raw(&self, group: &str, key: &str) -> Result<Option<RawValue>, BackendError> {
        Ok(self.lock().values.get(&KeyPath::new(group, key)).cloned())
    }

    fn set_raw(&self, group: &str, key: &str, value: RawValue) -> Result<(), BackendError> {
        let path = KeyPath::new(group, key);
        debug!("memory: set {path} = {value:?}");
        let mut state = self.lock();
        state.values.insert(path.clone(), value.clone());
        state.subscribers.publish(&path, Some(value));
        Ok(())
    }

    fn erase(&self, group: &str, key: &str) -> Result<(), BackendError> {
        let path = KeyPath::new(group, key);
        let mut state = self.lock();
        if state.values.remove(&path).is_some() {
            debug!("memory: erased {path}");
            state.subscribers.publish(&path, None);
        }
        Ok(())
    }

    fn stored_keys(&self) -> Result<Vec<KeyPath>, BackendError> {
        let mut keys: Vec<KeyPath> = self.lock().values.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn watch(&self, group: &str, key: &str) -> Result<WatchStream, BackendError> {
        let stream = self.lock().subscribers.subscribe(KeyPath::new(group, key));
        let state = Arc::downgrade(&self.state);
        Ok(stream.on_close(move || {
            if let Some(state) = state.upgrade() {
                lock_state(&state).subscribers.prune();
            }
        }))
    }
}
