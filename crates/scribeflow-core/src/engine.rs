//! Sync Engine
//!
//! Facade wiring the poller, store, batch logic and mutation controller
//! into one session-scoped object. Constructed once per session and torn
//! down on logout/navigation; nothing in the engine is ambient global
//! state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::actions::{MutationController, MutationReceipt};
use crate::api::{JobAction, SplitBatchResponse, TranscriptionBackend};
use crate::batch::{
    aggregate, detect_batch, Batch, BatchCandidate, BatchProgress, CompletionLedger,
};
use crate::events::{self, EngineEvent, EventReceiver, EventSender};
use crate::jobs::{normalize, RawJobRecord};
use crate::poller::{BatchLoadFn, PollHandle, StatusPoller, DEFAULT_POLL_PERIOD};
use crate::settings::TranscribeSettings;
use crate::store::{
    DelayScheduler, JobStore, TaskKey, BANNER_CLEAR_DELAY, BATCH_TEARDOWN_GRACE,
    CHUNK_SELECT_DEBOUNCE, FILE_LIST_SETTLE, VIEW_INVALIDATE_DELAY,
};
use crate::stuck::DEFAULT_STALL_WINDOW;
use crate::{EngineResult, FileId, JobId};

// =============================================================================
// Configuration
// =============================================================================

/// Engine configuration.
///
/// The delay defaults are the named constants in the scheduler module;
/// tests shrink them to keep timer-dependent paths fast.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Polling period for a lone processing job
    pub base_poll_period: Duration,
    /// Window without progress before a processing job reads as stuck
    pub stall_window: Duration,
    /// Debounce for current-chunk auto-selection
    pub chunk_select_debounce: Duration,
    /// Settling delay before the file list re-fetches after a mutation
    pub file_list_settle: Duration,
    /// Delay before derived views invalidate after completion
    pub view_invalidate_delay: Duration,
    /// How long completion banners stay visible
    pub banner_clear_delay: Duration,
    /// Grace window before a finished batch is dropped
    pub batch_teardown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_poll_period: DEFAULT_POLL_PERIOD,
            stall_window: DEFAULT_STALL_WINDOW,
            chunk_select_debounce: CHUNK_SELECT_DEBOUNCE,
            file_list_settle: FILE_LIST_SETTLE,
            view_invalidate_delay: VIEW_INVALIDATE_DELAY,
            banner_clear_delay: BANNER_CLEAR_DELAY,
            batch_teardown_grace: BATCH_TEARDOWN_GRACE,
        }
    }
}

impl EngineConfig {
    /// Sets the base polling period
    pub fn with_base_poll_period(mut self, period: Duration) -> Self {
        self.base_poll_period = period;
        self
    }

    /// Sets the stuck-detection stall window
    pub fn with_stall_window(mut self, window: Duration) -> Self {
        self.stall_window = window;
        self
    }

    /// Scales every delay by dividing it by `factor`. Test helper for
    /// exercising debounce/teardown behavior quickly.
    pub fn with_delays_divided_by(mut self, factor: u32) -> Self {
        self.chunk_select_debounce /= factor;
        self.file_list_settle /= factor;
        self.view_invalidate_delay /= factor;
        self.banner_clear_delay /= factor;
        self.batch_teardown_grace /= factor;
        self
    }
}

// =============================================================================
// Shared Internals
// =============================================================================

struct BatchState {
    active: Option<Batch>,
    /// The chunk currently surfaced as "in progress" (debounced)
    selected_chunk: Option<JobId>,
}

struct EngineShared {
    config: EngineConfig,
    store: Arc<JobStore>,
    scheduler: DelayScheduler,
    batches: Mutex<BatchState>,
    ledger: CompletionLedger,
    events: EventSender,
    self_ref: OnceLock<Weak<EngineShared>>,
}

impl EngineShared {
    /// Live-member count of the active batch, if the job belongs to it.
    /// Members the store has not seen yet count as live.
    fn active_batch_load(&self, job_id: JobId) -> Option<usize> {
        let batches = self.batches.lock().unwrap();
        let batch = batches.active.as_ref()?;
        if !batch.is_member(job_id) {
            return None;
        }

        let live = batch
            .chunks
            .iter()
            .filter(|c| {
                self.store
                    .job(c.job_id)
                    .map(|j| j.status.is_active())
                    .unwrap_or(true)
            })
            .count();
        Some(live)
    }

    fn weak_self(&self) -> Weak<EngineShared> {
        self.self_ref.get().cloned().unwrap_or_default()
    }

    /// Driven by the store after every applied write: runs batch
    /// detection, debounced current-chunk selection, and completion
    /// handling.
    fn reconcile(&self, job_id: JobId) {
        let mut batches = self.batches.lock().unwrap();
        let state = &mut *batches;

        if state.active.is_none() {
            if let Some(batch) = self.detect() {
                info!(
                    "Detected batch for parent {} with {} chunks",
                    batch.parent_id,
                    batch.len()
                );
                let _ = self.events.send(EngineEvent::BatchDetected {
                    parent_id: batch.parent_id,
                    size: batch.len(),
                });
                state.active = Some(batch);
            }
        }

        let Some(batch) = state.active.as_mut() else {
            return;
        };
        if !batch.is_member(job_id) {
            return;
        }

        let progress = aggregate(batch, |id| self.store.job(id));

        if state.selected_chunk != Some(progress.current_job_id) {
            self.schedule_chunk_select(batch.parent_id);
        }

        if progress.is_complete && batch.completed_at.is_none() {
            batch.mark_completed(Utc::now());
            if self.ledger.first_completion(progress.parent_id) {
                info!(
                    "Batch for parent {} complete ({} ok, {} failed)",
                    progress.parent_id, progress.completed_count, progress.failed_count
                );
                let _ = self.events.send(EngineEvent::BatchCompleted {
                    parent_id: progress.parent_id,
                    completed: progress.completed_count,
                    failed: progress.failed_count,
                });
            }
            self.schedule_banner_clear(progress.parent_id);
            self.schedule_teardown(progress.parent_id);
        }
    }

    /// Detection pass over everything the store has seen. Only runs when
    /// no batch is active, which also keeps a just-completed batch from
    /// being re-created during its grace window.
    fn detect(&self) -> Option<Batch> {
        let candidates: Vec<BatchCandidate> = self
            .store
            .jobs()
            .into_iter()
            .map(|job| BatchCandidate {
                job_id: job.id,
                parent_id: job.parent_id,
                status: job.status,
                filename: self
                    .store
                    .display_name(job.id)
                    .unwrap_or_else(|| format!("chunk {}", job.id)),
            })
            .collect();
        detect_batch(&candidates)
    }

    fn schedule_chunk_select(&self, parent_id: FileId) {
        let weak = self.weak_self();
        self.scheduler.schedule(
            TaskKey::ChunkSelect(parent_id),
            self.config.chunk_select_debounce,
            move || {
                if let Some(shared) = weak.upgrade() {
                    shared.commit_chunk_select(parent_id);
                }
            },
        );
    }

    /// Re-computes the current chunk once the debounce window settles and
    /// publishes it if it actually changed.
    fn commit_chunk_select(&self, parent_id: FileId) {
        let mut batches = self.batches.lock().unwrap();
        let state = &mut *batches;
        let Some(batch) = state.active.as_ref() else {
            return;
        };
        if batch.parent_id != parent_id {
            return;
        }

        let progress = aggregate(batch, |id| self.store.job(id));
        if state.selected_chunk != Some(progress.current_job_id) {
            state.selected_chunk = Some(progress.current_job_id);
            let _ = self.events.send(EngineEvent::CurrentChunkChanged {
                parent_id,
                job_id: progress.current_job_id,
            });
        }
    }

    fn schedule_banner_clear(&self, parent_id: FileId) {
        let events = self.events.clone();
        self.scheduler.schedule(
            TaskKey::BannerClear(parent_id),
            self.config.banner_clear_delay,
            move || {
                let _ = events.send(EngineEvent::BatchBannerCleared { parent_id });
            },
        );
    }

    fn schedule_teardown(&self, parent_id: FileId) {
        let weak = self.weak_self();
        self.scheduler.schedule(
            TaskKey::BatchTeardown(parent_id),
            self.config.batch_teardown_grace,
            move || {
                if let Some(shared) = weak.upgrade() {
                    shared.drop_batch(parent_id);
                }
            },
        );
    }

    fn drop_batch(&self, parent_id: FileId) {
        let mut batches = self.batches.lock().unwrap();
        let matches = batches
            .active
            .as_ref()
            .map(|b| b.parent_id == parent_id)
            .unwrap_or(false);
        if matches {
            batches.active = None;
            batches.selected_chunk = None;
            // A future split of the same file may notify again
            self.ledger.forget(parent_id);
            debug!("Dropped batch for parent {}", parent_id);
            let _ = self.events.send(EngineEvent::BatchDropped { parent_id });
        }
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Session-scoped job synchronization engine.
pub struct SyncEngine {
    shared: Arc<EngineShared>,
    backend: Arc<dyn TranscriptionBackend>,
    controller: MutationController,
    poller: StatusPoller,
    watches: Mutex<HashMap<JobId, PollHandle>>,
    events_rx: Option<EventReceiver>,
}

impl SyncEngine {
    /// Creates an engine over the given backend.
    pub fn new(backend: Arc<dyn TranscriptionBackend>, config: EngineConfig) -> Self {
        let (events_tx, events_rx) = events::channel();
        let scheduler = DelayScheduler::new();
        let store = JobStore::new(
            events_tx.clone(),
            scheduler.clone(),
            config.view_invalidate_delay,
            config.stall_window,
        );

        let controller = MutationController::new(
            Arc::clone(&backend),
            Arc::clone(&store),
            scheduler.clone(),
            config.file_list_settle,
        );

        let shared = Arc::new(EngineShared {
            config: config.clone(),
            store: Arc::clone(&store),
            scheduler,
            batches: Mutex::new(BatchState {
                active: None,
                selected_chunk: None,
            }),
            ledger: CompletionLedger::new(),
            events: events_tx,
            self_ref: OnceLock::new(),
        });
        let _ = shared.self_ref.set(Arc::downgrade(&shared));

        let observer_ref = Arc::downgrade(&shared);
        store.set_observer(move |job_id| {
            if let Some(shared) = observer_ref.upgrade() {
                shared.reconcile(job_id);
            }
        });

        let load_ref: Weak<EngineShared> = Arc::downgrade(&shared);
        let batch_load: BatchLoadFn = Arc::new(move |job_id| {
            load_ref
                .upgrade()
                .and_then(|shared| shared.active_batch_load(job_id))
        });

        let poller = StatusPoller::new(
            Arc::clone(&backend),
            Arc::clone(&store),
            config.base_poll_period,
            batch_load,
        );

        Self {
            shared,
            backend,
            controller,
            poller,
            watches: Mutex::new(HashMap::new()),
            events_rx: Some(events_rx),
        }
    }

    /// Takes the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<EventReceiver> {
        self.events_rx.take()
    }

    /// The underlying store, for reads and derived-view access
    pub fn store(&self) -> &Arc<JobStore> {
        &self.shared.store
    }

    // =========================================================================
    // Watching
    // =========================================================================

    /// Starts polling `job_id`. A second watch for the same job is a
    /// no-op; the existing loop keeps running.
    pub fn watch(&self, job_id: JobId) {
        let mut watches = self.watches.lock().unwrap();
        if watches.contains_key(&job_id) {
            return;
        }
        watches.insert(job_id, self.poller.spawn(job_id));
    }

    /// Stops polling `job_id` (detail view unmounted, navigation away).
    pub fn unwatch(&self, job_id: JobId) {
        if let Some(handle) = self.watches.lock().unwrap().remove(&job_id) {
            handle.cancel();
        }
    }

    /// Registers the display filename used for batch chunk labels.
    pub fn set_display_name(&self, job_id: JobId, name: impl Into<String>) {
        self.shared.store.set_display_name(job_id, name);
    }

    /// Feeds a page of job records (e.g. a file-list response) through
    /// normalization into the store, driving batch detection.
    pub fn ingest(&self, records: Vec<RawJobRecord>) {
        let stamped_at = Utc::now();
        for raw in records {
            let job = normalize(raw);
            let generation = self.shared.store.generation(job.id);
            self.shared.store.apply_poll(stamped_at, generation, job);
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Applies a user action optimistically. See [`MutationController`].
    pub async fn apply(
        &self,
        action: JobAction,
        job_id: JobId,
        settings: Option<&TranscribeSettings>,
    ) -> EngineResult<MutationReceipt> {
        self.controller.apply(action, job_id, settings).await
    }

    /// Splits a source file into chunks and seeds the batch directly from
    /// the authoritative response, bypassing detection. Every created
    /// chunk is watched.
    pub async fn split(&self, job_id: JobId) -> EngineResult<BatchProgress> {
        let resp: SplitBatchResponse = self.backend.split_batch(job_id).await?;
        let batch = Batch::from_split(&resp);

        for chunk in &batch.chunks {
            self.shared
                .store
                .set_display_name(chunk.job_id, chunk.original_filename.clone());
        }

        {
            let mut batches = self.shared.batches.lock().unwrap();
            let _ = self.shared.events.send(EngineEvent::BatchDetected {
                parent_id: batch.parent_id,
                size: batch.len(),
            });
            batches.active = Some(batch.clone());
            batches.selected_chunk = None;
        }

        for chunk in &batch.chunks {
            self.watch(chunk.job_id);
        }

        let progress = self
            .batch_progress()
            .unwrap_or_else(|| aggregate(&batch, |id| self.shared.store.job(id)));
        Ok(progress)
    }

    // =========================================================================
    // Batch Views
    // =========================================================================

    /// Current batch summary, if a batch is active
    pub fn batch_progress(&self) -> Option<BatchProgress> {
        let batches = self.shared.batches.lock().unwrap();
        let batch = batches.active.as_ref()?;
        Some(aggregate(batch, |id| self.shared.store.job(id)))
    }

    /// The active batch, if any
    pub fn active_batch(&self) -> Option<Batch> {
        self.shared.batches.lock().unwrap().active.clone()
    }

    /// The debounced current chunk selection
    pub fn selected_chunk(&self) -> Option<JobId> {
        self.shared.batches.lock().unwrap().selected_chunk
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Cancels all polling and pending delayed work.
    pub fn shutdown(&self) {
        let mut watches = self.watches.lock().unwrap();
        for (_, handle) in watches.drain() {
            handle.cancel();
        }
        self.shared.scheduler.cancel_all();
        info!("Sync engine shut down");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CreatedFile, MockBackend};

    fn engine_with_mock(config: EngineConfig) -> (Arc<MockBackend>, SyncEngine) {
        let backend = Arc::new(MockBackend::new());
        let engine = SyncEngine::new(
            Arc::clone(&backend) as Arc<dyn TranscriptionBackend>,
            config,
        );
        (backend, engine)
    }

    fn chunk_record(id: JobId, parent: FileId, status: &str, progress: f64) -> RawJobRecord {
        RawJobRecord {
            parent_id: Some(parent),
            ..RawJobRecord::new(id, status, progress)
        }
    }

    #[tokio::test]
    async fn test_ingest_drives_batch_detection() {
        let (_backend, engine) = engine_with_mock(EngineConfig::default());

        engine.ingest(vec![chunk_record(1, 10, "processing", 0.2)]);
        assert!(engine.active_batch().is_none());

        engine.ingest(vec![chunk_record(2, 10, "processing", 0.1)]);
        let batch = engine.active_batch().unwrap();
        assert_eq!(batch.parent_id, 10);
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_split_seeds_batch_without_detection() {
        let (backend, engine) = engine_with_mock(EngineConfig::default());
        backend.set_split_response(SplitBatchResponse {
            parent_file_id: 10,
            created_files: vec![
                CreatedFile {
                    file_id: 11,
                    original_filename: "part1.mp3".to_string(),
                    order_index: 0,
                    split_start_seconds: None,
                    split_end_seconds: None,
                },
                CreatedFile {
                    file_id: 12,
                    original_filename: "part2.mp3".to_string(),
                    order_index: 1,
                    split_start_seconds: None,
                    split_end_seconds: None,
                },
            ],
        });
        backend.push_status(11, RawJobRecord::new(11, "processing", 0.0));
        backend.push_status(12, RawJobRecord::new(12, "pending", 0.0));

        let progress = engine.split(9).await.unwrap();
        assert_eq!(progress.parent_id, 10);
        assert_eq!(progress.total, 2);

        let batch = engine.active_batch().unwrap();
        assert_eq!(batch.chunks[0].original_filename, "part1.mp3");
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_batch_completion_notifies_once_and_tears_down() {
        let config = EngineConfig::default().with_delays_divided_by(100);
        let (_backend, mut engine) = engine_with_mock(config);
        let mut rx = engine.take_event_receiver().unwrap();

        engine.ingest(vec![
            chunk_record(1, 10, "processing", 0.5),
            chunk_record(2, 10, "processing", 0.5),
        ]);

        engine.ingest(vec![
            chunk_record(1, 10, "completed", 1.0),
            chunk_record(2, 10, "failed", 0.7),
        ]);

        // Repeated terminal updates must not re-notify
        engine.ingest(vec![chunk_record(1, 10, "completed", 1.0)]);

        let mut completions = 0;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::BatchCompleted {
                parent_id,
                completed,
                failed,
            } = event
            {
                completions += 1;
                assert_eq!(parent_id, 10);
                assert_eq!(completed, 1);
                assert_eq!(failed, 1);
            }
        }
        assert_eq!(completions, 1);

        // Batch survives the grace window, then drops
        assert!(engine.active_batch().is_some());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(engine.active_batch().is_none());
    }

    #[tokio::test]
    async fn test_no_redetection_during_grace_window() {
        let config = EngineConfig::default().with_delays_divided_by(10);
        let (_backend, engine) = engine_with_mock(config);

        engine.ingest(vec![
            chunk_record(1, 10, "processing", 0.5),
            chunk_record(2, 10, "processing", 0.5),
        ]);
        engine.ingest(vec![
            chunk_record(1, 10, "completed", 1.0),
            chunk_record(2, 10, "completed", 1.0),
        ]);

        let completed_batch = engine.active_batch().unwrap();
        assert!(completed_batch.completed_at.is_some());

        // New live siblings for the same parent arrive inside the window:
        // the finished batch must not be replaced
        engine.ingest(vec![
            chunk_record(3, 10, "processing", 0.1),
            chunk_record(4, 10, "processing", 0.1),
        ]);
        assert_eq!(engine.active_batch().unwrap().completed_at, completed_batch.completed_at);
    }

    #[tokio::test]
    async fn test_current_chunk_selection_is_debounced() {
        let config = EngineConfig::default().with_delays_divided_by(10);
        let (_backend, engine) = engine_with_mock(config);

        engine.ingest(vec![
            chunk_record(1, 10, "processing", 0.5),
            chunk_record(2, 10, "pending", 0.0),
        ]);

        // Selection settles only after the debounce window
        assert!(engine.selected_chunk().is_none());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(engine.selected_chunk().is_some());
    }

    #[tokio::test]
    async fn test_watch_twice_is_idempotent() {
        let (backend, engine) = engine_with_mock(EngineConfig::default());
        backend.push_status(1, RawJobRecord::new(1, "completed", 1.0));

        engine.watch(1);
        engine.watch(1);
        assert_eq!(engine.watches.lock().unwrap().len(), 1);
        engine.shutdown();
    }
}
