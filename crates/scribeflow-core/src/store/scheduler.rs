//! Delay Scheduler
//!
//! Central home for every deliberate delay in the engine. Each pending
//! task is keyed; scheduling under an existing key replaces the pending
//! task, which is what gives debounce semantics. All delays are named
//! constants here and overridable through `EngineConfig`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;

use crate::{FileId, JobId};

// =============================================================================
// Named Delays
// =============================================================================

/// Debounce window for auto-selecting the current batch chunk
pub const CHUNK_SELECT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Settling delay before the file list is re-fetched after a mutation
pub const FILE_LIST_SETTLE: Duration = Duration::from_millis(500);

/// Delay before derived views are invalidated after a job completes,
/// absorbing the backend's post-completion write-settling window
pub const VIEW_INVALIDATE_DELAY: Duration = Duration::from_millis(1000);

/// How long a completion banner stays visible
pub const BANNER_CLEAR_DELAY: Duration = Duration::from_millis(5000);

/// Grace window a finished batch is retained for before being dropped
pub const BATCH_TEARDOWN_GRACE: Duration = Duration::from_millis(5000);

// =============================================================================
// Task Keys
// =============================================================================

/// Identity of a pending delayed task. Scheduling the same key again
/// cancels the pending occurrence.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TaskKey {
    /// Debounced current-chunk selection for a batch
    ChunkSelect(FileId),
    /// Delayed derived-view invalidation for a job
    ViewInvalidate(JobId),
    /// Completion banner clear for a batch
    BannerClear(FileId),
    /// Batch teardown after the grace window
    BatchTeardown(FileId),
    /// File list refresh after a mutation settles
    FileListRefresh,
}

// =============================================================================
// Scheduler
// =============================================================================

/// Cancellable delayed-task scheduler.
///
/// Owned by the reconciliation layer; everything else requests delays
/// through it instead of spawning ad hoc timers.
#[derive(Clone, Default)]
pub struct DelayScheduler {
    tasks: Arc<Mutex<HashMap<TaskKey, AbortHandle>>>,
}

impl DelayScheduler {
    /// Creates an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` after `delay`, replacing any pending task under `key`.
    pub fn schedule<F>(&self, key: TaskKey, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Holding the map lock until the new handle is registered keeps
        // the spawned task from de-registering itself first.
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(prev) = tasks.remove(&key) {
            prev.abort();
        }

        let tasks_ref = Arc::clone(&self.tasks);
        let fire_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tasks_ref.lock().unwrap().remove(&fire_key);
            f();
        });
        tasks.insert(key, handle.abort_handle());
    }

    /// Cancels the pending task under `key`, if any. Returns true if one
    /// was pending.
    pub fn cancel(&self, key: &TaskKey) -> bool {
        match self.tasks.lock().unwrap().remove(key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Returns true if a task is pending under `key`.
    pub fn is_pending(&self, key: &TaskKey) -> bool {
        self.tasks.lock().unwrap().contains_key(key)
    }

    /// Cancels everything. Used on engine shutdown.
    pub fn cancel_all(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}
