//! A minimal, explicitly driven event loop.
//!
//! Nothing here spawns a thread.  Work reaches the loop in two ways:
//!
//! - **Tasks** posted through a [`LoopHandle`] from any thread.
//! - **Sources** ([`EventSource`]) attached to the loop.  A source is asked
//!   whether it has work (`prepare`) and then told to do it (`dispatch`).
//!   The change-notification dispatcher is the main source.
//!
//! Work only runs when the owner of the [`EventLoop`] drives it, via
//! [`EventLoop::iteration`], [`EventLoop::run_pending`] or after
//! [`EventLoop::wait_pending`] reports that something arrived.  Listener
//! code therefore always runs on the thread that drives the loop.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

/// Upper bound on passes made by a single [`EventLoop::run_pending`] call.
/// Sources whose dispatch produces new work for themselves would otherwise
/// keep the call from ever returning.
pub const MAX_PASSES_PER_RUN: usize = 64;

type Task = Box<dyn FnOnce() + Send>;

/// Something the loop polls for work.
pub trait EventSource: Send + Sync {
    /// Collects newly arrived work and reports whether `dispatch` has anything
    /// to do.  Must not run user code.
    fn prepare(&self) -> bool;

    /// Performs the queued work.  Returns the number of units handled.
    fn dispatch(&self) -> usize;
}

/// Identifies an attached source for a later [`LoopHandle::detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

#[derive(Default)]
struct LoopState {
    tasks: VecDeque<Task>,
    sources: Vec<(SourceId, Arc<dyn EventSource>)>,
    next_source: u64,
    woken: bool,
}

#[derive(Default)]
struct LoopShared {
    state: Mutex<LoopState>,
    wakeup: Condvar,
}

impl LoopShared {
    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable, thread-safe handle used to feed work into an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Queues `task` to run during the next loop pass.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.lock();
        state.tasks.push_back(Box::new(task));
        state.woken = true;
        drop(state);
        self.shared.wakeup.notify_all();
    }

    /// Interrupts a pending [`EventLoop::wait_pending`].
    pub fn wakeup(&self) {
        self.shared.lock().woken = true;
        self.shared.wakeup.notify_all();
    }

    pub fn attach(&self, source: Arc<dyn EventSource>) -> SourceId {
        let mut state = self.shared.lock();
        let id = SourceId(state.next_source);
        state.next_source += 1;
        state.sources.push((id, source));
        trace!("event loop: attached source {id:?}");
        id
    }

    /// Removes a source.  Returns `false` if it was not attached.
    pub fn detach(&self, id: SourceId) -> bool {
        let mut state = self.shared.lock();
        let before = state.sources.len();
        state.sources.retain(|(sid, _)| *sid != id);
        before != state.sources.len()
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle").finish_non_exhaustive()
    }
}

/// The loop itself.  Owned by the thread that drives it.
#[derive(Default)]
pub struct EventLoop {
    handle: LoopHandle,
}

impl Default for LoopHandle {
    fn default() -> Self {
        Self {
            shared: Arc::new(LoopShared::default()),
        }
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// `true` if a pass would run at least one task or dispatch a source.
    pub fn pending(&self) -> bool {
        let sources = {
            let state = self.handle.shared.lock();
            if !state.tasks.is_empty() {
                return true;
            }
            snapshot_sources(&state)
        };
        // Evaluate every source so each one pulls in its queued work.
        sources
            .iter()
            .fold(false, |any, source| source.prepare() || any)
    }

    /// Runs one pass: every task queued at the start of the pass, then every
    /// source that reports work.  Returns `true` if anything ran.
    pub fn iteration(&self) -> bool {
        let (tasks, sources) = {
            let mut state = self.handle.shared.lock();
            state.woken = false;
            (std::mem::take(&mut state.tasks), snapshot_sources(&state))
        };

        let mut ran = !tasks.is_empty();
        for task in tasks {
            task();
        }
        for source in sources {
            if source.prepare() {
                ran |= source.dispatch() > 0;
            }
        }
        ran
    }

    /// Drives passes until nothing is pending, bounded by
    /// [`MAX_PASSES_PER_RUN`].  Returns the number of passes that did work.
    pub fn run_pending(&self) -> usize {
        let mut passes = 0;
        while passes < MAX_PASSES_PER_RUN && self.pending() {
            if !self.iteration() {
                break;
            }
            passes += 1;
        }
        passes
    }

    /// Blocks until work is pending or `timeout` elapses.  Returns `true` if
    /// work is pending.  Does not run it.
    pub fn wait_pending(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pending() {
                return true;
            }
            let mut state = self.handle.shared.lock();
            while !state.woken {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                state = self
                    .handle
                    .shared
                    .wakeup
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            state.woken = false;
        }
    }
}

fn snapshot_sources(state: &LoopState) -> Vec<Arc<dyn EventSource>> {
    state
        .sources
        .iter()
        .map(|(_, source)| Arc::clone(source))
        .collect()
}
