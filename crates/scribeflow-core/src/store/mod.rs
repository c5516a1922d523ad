//! Cache Reconciliation Layer
//!
//! Single authority for job state held by the client. The poller and the
//! mutation controller never touch cache entries directly; they submit
//! proposed writes here, and this layer enforces write ordering
//! (timestamp and generation guards), tracks derived-view staleness, and
//! owns every deliberate delay through the [`DelayScheduler`].

mod scheduler;

pub use scheduler::*;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::events::{EngineEvent, EventSender, ViewKind};
use crate::jobs::{Job, JobStatus};
use crate::stuck::StallTracker;
use crate::JobId;

// =============================================================================
// Derived Views
// =============================================================================

/// Cached derived view (segment list, speaker list) for one job.
///
/// The engine manages validity and staleness only; the payload shape is
/// the consumer's business.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DerivedView {
    value: Option<serde_json::Value>,
    stale: bool,
}

impl DerivedView {
    /// Stores a freshly fetched value
    pub fn put(&mut self, value: serde_json::Value) {
        self.value = Some(value);
        self.stale = false;
    }

    /// Marks the cached value as stale; the value itself is retained as
    /// the last-known-good fallback until replaced.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Resets to a known-empty list, used after a job is cleared.
    pub fn clear(&mut self) {
        self.value = Some(serde_json::Value::Array(Vec::new()));
        self.stale = false;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn value(&self) -> Option<&serde_json::Value> {
        self.value.as_ref()
    }
}

// =============================================================================
// Cache Entries
// =============================================================================

/// Per-job cache entry. Owned exclusively by [`JobStore`].
#[derive(Clone, Debug)]
pub struct CacheEntry {
    job: Job,
    display_name: Option<String>,
    /// Stamp of the poll request (or mutation) that produced this state
    observed_at: DateTime<Utc>,
    /// Bumped on every mutation; polls issued under an older generation
    /// are discarded
    generation: u64,
    segments: DerivedView,
    speakers: DerivedView,
    stall: StallTracker,
    stuck_flagged: bool,
}

impl CacheEntry {
    fn new(job: Job, observed_at: DateTime<Utc>) -> Self {
        let stall = StallTracker::new(&job, observed_at);
        Self {
            job,
            display_name: None,
            observed_at,
            generation: 0,
            segments: DerivedView::default(),
            speakers: DerivedView::default(),
            stall,
            stuck_flagged: false,
        }
    }

    fn view_mut(&mut self, kind: ViewKind) -> &mut DerivedView {
        match kind {
            ViewKind::Segments => &mut self.segments,
            ViewKind::Speakers => &mut self.speakers,
        }
    }

    fn view(&self, kind: ViewKind) -> &DerivedView {
        match kind {
            ViewKind::Segments => &self.segments,
            ViewKind::Speakers => &self.speakers,
        }
    }
}

/// Opaque copy of a cache entry taken before a speculative write.
///
/// Restoring it puts the entry back exactly as snapshotted, except for the
/// generation counter, which stays monotonic so in-flight polls from
/// before the mutation remain discarded.
#[derive(Clone, Debug)]
pub struct EntrySnapshot(CacheEntry);

// =============================================================================
// Job Store
// =============================================================================

type WriteObserver = Box<dyn Fn(JobId) + Send + Sync>;

/// Shared job-state cache with ordered writes.
pub struct JobStore {
    entries: RwLock<HashMap<JobId, CacheEntry>>,
    file_list_stale: AtomicBool,
    events: EventSender,
    scheduler: DelayScheduler,
    view_invalidate_delay: Duration,
    stall_window: Duration,
    /// Invoked after every applied write, outside the entry lock
    observer: RwLock<Option<WriteObserver>>,
    self_ref: OnceLock<Weak<JobStore>>,
}

impl JobStore {
    /// Creates a store wired to the given event channel and scheduler.
    pub fn new(
        events: EventSender,
        scheduler: DelayScheduler,
        view_invalidate_delay: Duration,
        stall_window: Duration,
    ) -> Arc<Self> {
        let store = Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            file_list_stale: AtomicBool::new(false),
            events,
            scheduler,
            view_invalidate_delay,
            stall_window,
            observer: RwLock::new(None),
            self_ref: OnceLock::new(),
        });
        let _ = store.self_ref.set(Arc::downgrade(&store));
        store
    }

    /// Registers the write observer. Called once by the engine.
    pub fn set_observer(&self, observer: impl Fn(JobId) + Send + Sync + 'static) {
        *self.observer.write().unwrap() = Some(Box::new(observer));
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Last-known job state
    pub fn job(&self, job_id: JobId) -> Option<Job> {
        self.entries
            .read()
            .unwrap()
            .get(&job_id)
            .map(|e| e.job.clone())
    }

    /// All last-known job states
    pub fn jobs(&self) -> Vec<Job> {
        self.entries
            .read()
            .unwrap()
            .values()
            .map(|e| e.job.clone())
            .collect()
    }

    /// Display filename for a job, if one was registered
    pub fn display_name(&self, job_id: JobId) -> Option<String> {
        self.entries
            .read()
            .unwrap()
            .get(&job_id)
            .and_then(|e| e.display_name.clone())
    }

    /// Current mutation generation for a job (0 before any mutation)
    pub fn generation(&self, job_id: JobId) -> u64 {
        self.entries
            .read()
            .unwrap()
            .get(&job_id)
            .map(|e| e.generation)
            .unwrap_or(0)
    }

    /// Derived view for a job
    pub fn view(&self, job_id: JobId, kind: ViewKind) -> Option<DerivedView> {
        self.entries
            .read()
            .unwrap()
            .get(&job_id)
            .map(|e| e.view(kind).clone())
    }

    /// Whether the processing job has stopped advancing within the stall
    /// window
    pub fn is_stuck(&self, job_id: JobId) -> bool {
        let entries = self.entries.read().unwrap();
        match entries.get(&job_id) {
            Some(e) => e.stall.is_stuck(&e.job, Utc::now(), self.stall_window),
            None => false,
        }
    }

    /// Whether the file list needs a re-fetch
    pub fn is_file_list_stale(&self) -> bool {
        self.file_list_stale.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Registers the display filename used for batch chunk labels.
    pub fn set_display_name(&self, job_id: JobId, name: impl Into<String>) {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .entry(job_id)
            .or_insert_with(|| CacheEntry::new(Job::idle(job_id), Utc::now()));
        entry.display_name = Some(name.into());
    }

    /// Applies a poll result.
    ///
    /// `stamped_at` is the time the poll request was issued and
    /// `generation` the job's generation read at that moment. The write is
    /// dropped when a newer observation or a newer generation is already
    /// stored. Returns whether the write was applied.
    pub fn apply_poll(
        &self,
        stamped_at: DateTime<Utc>,
        generation: u64,
        job: Job,
    ) -> bool {
        let job_id = job.id;
        let (event, stuck_event) = {
            let mut entries = self.entries.write().unwrap();

            let current_gen = entries.get(&job_id).map(|e| e.generation).unwrap_or(0);
            if generation != current_gen {
                warn!(
                    "Dropping poll for job {}: generation {} superseded by {}",
                    job_id, generation, current_gen
                );
                return false;
            }

            match entries.get_mut(&job_id) {
                Some(entry) => {
                    if stamped_at < entry.observed_at {
                        warn!("Dropping out-of-order poll for job {}", job_id);
                        return false;
                    }

                    if !entry.job.status.can_transition_to(job.status) {
                        warn!(
                            "Job {} made unexpected transition {} -> {}",
                            job_id, entry.job.status, job.status
                        );
                    }

                    let now = Utc::now();
                    let was_completed = entry.job.status == JobStatus::Completed;
                    let advanced = entry.stall.observe(&job, now);
                    if advanced {
                        entry.stuck_flagged = false;
                    }

                    entry.job = job.clone();
                    entry.observed_at = stamped_at;

                    if !was_completed && entry.job.status == JobStatus::Completed {
                        self.schedule_view_invalidation(job_id);
                    }

                    let newly_stuck = !entry.stuck_flagged
                        && entry.stall.is_stuck(&entry.job, now, self.stall_window);
                    if newly_stuck {
                        entry.stuck_flagged = true;
                    }

                    (
                        EngineEvent::JobUpdated { job_id, job },
                        newly_stuck.then_some(EngineEvent::JobStuck { job_id }),
                    )
                }
                None => {
                    if job.status == JobStatus::Completed {
                        self.schedule_view_invalidation(job_id);
                    }
                    entries.insert(job_id, CacheEntry::new(job.clone(), stamped_at));
                    (EngineEvent::JobUpdated { job_id, job }, None)
                }
            }
        };

        let _ = self.events.send(event);
        if let Some(stuck) = stuck_event {
            let _ = self.events.send(stuck);
        }
        self.notify_observer(job_id);
        true
    }

    /// Bumps the mutation generation, creating the entry if needed.
    /// Returns the new generation.
    pub fn bump_generation(&self, job_id: JobId) -> u64 {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .entry(job_id)
            .or_insert_with(|| CacheEntry::new(Job::idle(job_id), Utc::now()));
        entry.generation += 1;
        entry.generation
    }

    /// Writes a speculative job state ahead of server confirmation.
    ///
    /// Callers bump the generation first so overlapping polls issued
    /// before the mutation cannot clobber this write.
    pub fn apply_speculative(&self, job: Job) {
        let job_id = job.id;
        {
            let mut entries = self.entries.write().unwrap();
            let now = Utc::now();
            let entry = entries
                .entry(job_id)
                .or_insert_with(|| CacheEntry::new(Job::idle(job_id), now));
            entry.stall.observe(&job, now);
            entry.stuck_flagged = false;
            entry.job = job.clone();
            entry.observed_at = now;
        }

        let _ = self.events.send(EngineEvent::JobUpdated { job_id, job });
        self.notify_observer(job_id);
    }

    /// Takes a copy of the entry for rollback.
    pub fn snapshot(&self, job_id: JobId) -> Option<EntrySnapshot> {
        self.entries
            .read()
            .unwrap()
            .get(&job_id)
            .map(|e| EntrySnapshot(e.clone()))
    }

    /// Restores a pre-mutation snapshot after a failed action.
    ///
    /// `None` means the job had no entry before the mutation; the entry
    /// created by the speculative write is removed.
    pub fn restore(&self, job_id: JobId, snapshot: Option<EntrySnapshot>) {
        let event = {
            let mut entries = self.entries.write().unwrap();
            match snapshot {
                Some(EntrySnapshot(saved)) => {
                    let generation = entries
                        .get(&job_id)
                        .map(|e| e.generation)
                        .unwrap_or(saved.generation);
                    let job = saved.job.clone();
                    entries.insert(
                        job_id,
                        CacheEntry {
                            generation,
                            ..saved
                        },
                    );
                    Some(EngineEvent::JobUpdated { job_id, job })
                }
                None => {
                    entries.remove(&job_id);
                    None
                }
            }
        };

        debug!("Rolled back speculative state for job {}", job_id);
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        self.notify_observer(job_id);
    }

    // =========================================================================
    // Derived-View Invalidation
    // =========================================================================

    /// Stores a freshly fetched derived view value.
    pub fn put_view(&self, job_id: JobId, kind: ViewKind, value: serde_json::Value) {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get_mut(&job_id) {
            entry.view_mut(kind).put(value);
        }
    }

    /// Marks both derived views stale immediately.
    pub fn invalidate_views(&self, job_id: JobId) {
        {
            let mut entries = self.entries.write().unwrap();
            if let Some(entry) = entries.get_mut(&job_id) {
                entry.segments.mark_stale();
                entry.speakers.mark_stale();
            }
        }
        for view in [ViewKind::Segments, ViewKind::Speakers] {
            let _ = self.events.send(EngineEvent::ViewInvalidated { job_id, view });
        }
    }

    /// Schedules view invalidation after the post-completion settling
    /// delay, replacing any pending invalidation for the job.
    pub fn schedule_view_invalidation(&self, job_id: JobId) {
        let weak = self.self_ref.get().cloned().unwrap_or_default();
        self.scheduler.schedule(
            TaskKey::ViewInvalidate(job_id),
            self.view_invalidate_delay,
            move || {
                if let Some(store) = weak.upgrade() {
                    store.invalidate_views(job_id);
                }
            },
        );
    }

    /// Synchronously resets both derived views to known-empty. Used by
    /// the clear action, which empties these lists server-side.
    pub fn clear_views(&self, job_id: JobId) {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get_mut(&job_id) {
            entry.segments.clear();
            entry.speakers.clear();
        }
    }

    /// Flags the file list for re-fetch and notifies the consumer.
    pub fn invalidate_file_list(&self) {
        self.file_list_stale.store(true, Ordering::SeqCst);
        let _ = self.events.send(EngineEvent::FileListInvalidated);
    }

    /// Clears the file-list staleness flag after a re-fetch.
    pub fn mark_file_list_fresh(&self) {
        self.file_list_stale.store(false, Ordering::SeqCst);
    }

    fn notify_observer(&self, job_id: JobId) {
        if let Some(observer) = self.observer.read().unwrap().as_ref() {
            observer(job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use chrono::TimeDelta;

    fn store() -> (Arc<JobStore>, crate::events::EventReceiver) {
        let (tx, rx) = events::channel();
        let store = JobStore::new(
            tx,
            DelayScheduler::new(),
            Duration::from_millis(30),
            crate::stuck::DEFAULT_STALL_WINDOW,
        );
        (store, rx)
    }

    fn processing(id: JobId, progress: f64) -> Job {
        Job {
            status: JobStatus::Processing,
            progress,
            ..Job::idle(id)
        }
    }

    #[tokio::test]
    async fn test_apply_poll_writes_and_reads_back() {
        let (store, _rx) = store();
        assert!(store.apply_poll(Utc::now(), 0, processing(1, 0.4)));

        let job = store.job(1).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 0.4);
    }

    #[tokio::test]
    async fn test_older_timestamp_never_overwrites() {
        let (store, _rx) = store();
        let newer = Utc::now();
        let older = newer - TimeDelta::seconds(2);

        assert!(store.apply_poll(newer, 0, processing(1, 0.8)));
        // An overlapping poll issued earlier resolves late
        assert!(!store.apply_poll(older, 0, processing(1, 0.3)));

        assert_eq!(store.job(1).unwrap().progress, 0.8);
    }

    #[tokio::test]
    async fn test_stale_generation_is_discarded() {
        let (store, _rx) = store();
        let issued = Utc::now();
        assert!(store.apply_poll(issued, 0, processing(1, 0.5)));

        // A mutation supersedes the in-flight poll
        store.bump_generation(1);
        store.apply_speculative(Job::idle(1));

        let late = issued + TimeDelta::seconds(5);
        assert!(!store.apply_poll(late, 0, processing(1, 0.9)));
        assert_eq!(store.job(1).unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_restore_is_exact() {
        let (store, _rx) = store();
        store.apply_poll(Utc::now(), 0, processing(1, 0.6));
        store.put_view(1, ViewKind::Segments, serde_json::json!([{"text": "hi"}]));

        let before_job = store.job(1).unwrap();
        let before_view = store.view(1, ViewKind::Segments).unwrap();
        let snapshot = store.snapshot(1);

        store.bump_generation(1);
        store.apply_speculative(Job::idle(1));
        store.clear_views(1);

        store.restore(1, snapshot);
        assert_eq!(store.job(1).unwrap(), before_job);
        assert_eq!(store.view(1, ViewKind::Segments).unwrap(), before_view);
    }

    #[tokio::test]
    async fn test_restore_none_removes_entry() {
        let (store, _rx) = store();
        store.bump_generation(7);
        store.apply_speculative(processing(7, 0.0));
        assert!(store.job(7).is_some());

        store.restore(7, None);
        assert!(store.job(7).is_none());
    }

    #[tokio::test]
    async fn test_completion_invalidates_views_after_delay() {
        let (store, _rx) = store();
        store.apply_poll(Utc::now(), 0, processing(1, 0.9));
        store.put_view(1, ViewKind::Segments, serde_json::json!([]));

        let completed = Job {
            status: JobStatus::Completed,
            progress: 1.0,
            ..Job::idle(1)
        };
        store.apply_poll(Utc::now(), 0, completed);

        // Not invalidated immediately
        assert!(!store.view(1, ViewKind::Segments).unwrap().is_stale());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.view(1, ViewKind::Segments).unwrap().is_stale());
    }

    #[tokio::test]
    async fn test_clear_views_is_synchronous_and_known_empty() {
        let (store, _rx) = store();
        store.apply_poll(Utc::now(), 0, processing(1, 0.5));
        store.put_view(1, ViewKind::Speakers, serde_json::json!(["alice"]));

        store.clear_views(1);
        let view = store.view(1, ViewKind::Speakers).unwrap();
        assert!(!view.is_stale());
        assert_eq!(view.value(), Some(&serde_json::json!([])));
    }

    #[tokio::test]
    async fn test_observer_fires_after_writes() {
        let (store, _rx) = store();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.set_observer(move |job_id| sink.lock().unwrap().push(job_id));

        store.apply_poll(Utc::now(), 0, processing(3, 0.1));
        store.bump_generation(3);
        store.apply_speculative(Job::idle(3));

        assert_eq!(seen.lock().unwrap().as_slice(), &[3, 3]);
    }

    #[tokio::test]
    async fn test_stalled_job_emits_stuck_event_once() {
        let (tx, mut rx) = events::channel();
        let store = JobStore::new(
            tx,
            DelayScheduler::new(),
            Duration::from_millis(30),
            Duration::from_millis(20),
        );

        store.apply_poll(Utc::now(), 0, processing(1, 0.5));
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Two more polls with no advance: flagged once, not twice
        store.apply_poll(Utc::now(), 0, processing(1, 0.5));
        store.apply_poll(Utc::now(), 0, processing(1, 0.5));
        assert!(store.is_stuck(1));

        let mut stuck_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::JobStuck { job_id: 1 }) {
                stuck_events += 1;
            }
        }
        assert_eq!(stuck_events, 1);

        // Progress resumes: the flag derives back to false
        store.apply_poll(Utc::now(), 0, processing(1, 0.7));
        assert!(!store.is_stuck(1));
    }

    #[tokio::test]
    async fn test_file_list_staleness_round_trip() {
        let (store, mut rx) = store();
        assert!(!store.is_file_list_stale());

        store.invalidate_file_list();
        assert!(store.is_file_list_stale());
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::FileListInvalidated
        ));

        store.mark_file_list_fresh();
        assert!(!store.is_file_list_stale());
    }
}
