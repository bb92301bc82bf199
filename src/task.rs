//! The task record and its state machine.
//!
//! A `Task` is the one shared record for a submission. The immutable identity
//! (`id`, `url`, `created_at`) lives on the struct; everything a stage or the
//! progress stream mutates sits behind one mutex in `TaskState`. All mutation
//! goes through [`Task::update`], which bumps `updated_at` atomically with the
//! change, so observers never see a state/timestamp tear.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Lifecycle states of a task.
///
/// The four stage states (`Downloading` → `Merging`) run in order; the rest are
/// entry, terminal, and hold states. Legal moves are encoded in
/// [`TaskStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Splitting,
    Transcribing,
    Merging,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Splitting => "splitting",
            Self::Transcribing => "transcribing",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }

    /// Whether `self → next` is a legal move.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Pending => matches!(next, Downloading | Failed | Cancelled),
            Downloading => matches!(next, Splitting | Failed | Paused | Cancelled),
            Splitting => matches!(next, Transcribing | Failed | Paused | Cancelled),
            Transcribing => matches!(next, Merging | Failed | Paused | Cancelled),
            Merging => matches!(next, Completed | Failed | Paused | Cancelled),
            Completed => matches!(next, Failed),
            Failed => matches!(next, Pending),
            Cancelled => matches!(next, Pending),
            Paused => matches!(next, Pending | Failed | Cancelled),
        }
    }

    /// Completed, Failed and Cancelled end a task's lifecycle (until resumed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether this status names one of the four pipeline stages.
    pub fn is_stage(self) -> bool {
        matches!(
            self,
            Self::Downloading | Self::Splitting | Self::Transcribing | Self::Merging
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Download / processing counters surfaced to stream subscribers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    /// In-stage progress, percent. Monotone within a stage, capped at 99.9
    /// until the task completes.
    pub progress: f64,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    /// Bytes per second.
    pub speed: f64,
    /// Estimated seconds remaining, when the source reports one.
    pub eta: f64,
}

/// The subset of source metadata lifted onto the task after the probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub duration: Option<f64>,
    pub upload_date: Option<String>,
    pub uploader: Option<String>,
    pub channel_id: Option<String>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub comment_count: Option<u64>,
    pub tags: Vec<String>,
    pub categories: Vec<String>,
    pub language: Option<String>,
    pub automatic_captions: bool,
    pub subtitles: bool,
    pub video_url: Option<String>,
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub audio_channels: Option<u32>,
    pub filesize_approx: Option<u64>,
    pub duration_string: Option<String>,
    /// Sanitized, storage-safe rendition of the title.
    pub processed_title: String,
}

/// Transcription aggregates accumulated chunk by chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionMetadata {
    pub word_count: u64,
    pub detected_language: Option<String>,
    pub chunk_count: usize,
    pub confidence_scores: Vec<f64>,
    pub average_confidence: Option<f64>,
    pub total_duration: Option<f64>,
    pub merged_transcript_path: Option<String>,
}

/// Result of one chunk's transcription attempt, in submission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkOutcome {
    pub relative_path: String,
    pub success: bool,
}

/// Metadata describing one chunk artifact, as written to the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub chunk_index: usize,
    pub filename: String,
    pub relative_path: String,
    /// `HH:MM:SS.mmm` display form.
    pub start_time: String,
    pub end_time: String,
    pub duration_ms: f64,
    pub start_ms: f64,
    pub end_ms: f64,
    pub audio_format: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub created_at: DateTime<Utc>,
}

/// The chunk manifest written to `{task}/chunks/chunks_manifest.json` and
/// mirrored into `metadata.processing.chunks_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub total_chunks: usize,
    pub total_duration_ms: f64,
    pub chunk_duration: f64,
    pub audio_format: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub chunks: Vec<ChunkMeta>,
    pub created_at: DateTime<Utc>,
}

/// Per-stage facts that aren't part of the typed aggregates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub chunks_info: Option<ChunkManifest>,
    pub failed_chunks: Vec<String>,
    pub ordered_results: Vec<ChunkOutcome>,
    /// Per-task chunk-duration override, seconds.
    pub chunk_duration: Option<f64>,
    pub total_duration: Option<f64>,
    pub total_size_bytes: Option<u64>,
    pub download_speed: Option<String>,
    pub downloaded_size: Option<String>,
    pub total_size: Option<String>,
    pub time_remaining: Option<String>,
    pub download_completed_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub video: VideoMetadata,
    pub transcription: TranscriptionMetadata,
    pub processing: ProcessingMetadata,
}

/// One recorded failure, stamped with the stage it happened in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub stage: TaskStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// The mutable half of a task, guarded by the task's mutex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub updated_at: DateTime<Utc>,
    pub stats: TaskStats,
    pub metadata: TaskMetadata,
    pub errors: Vec<TaskError>,
    /// Object-store path of the canonical audio artifact, set by the downloader.
    pub audio_path: Option<String>,
}

/// One end-to-end unit of transcription work.
#[derive(Debug)]
pub struct Task {
    pub id: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    state: Mutex<TaskState>,
}

impl Task {
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            created_at: now,
            state: Mutex::new(TaskState {
                status: TaskStatus::Pending,
                updated_at: now,
                stats: TaskStats::default(),
                metadata: TaskMetadata::default(),
                errors: Vec::new(),
                audio_path: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        // A panic while holding the lock poisons it; the state itself is still
        // coherent (every mutation is a single guarded closure), so recover.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run `f` under the task lock, bumping `updated_at` with the mutation.
    pub fn update<T>(&self, f: impl FnOnce(&mut TaskState) -> T) -> T {
        let mut state = self.lock();
        let out = f(&mut state);
        state.updated_at = Utc::now();
        out
    }

    /// Validated status change. Returns `false` without mutating on an
    /// illegal move.
    pub fn try_transition(&self, next: TaskStatus) -> bool {
        let mut state = self.lock();
        if !state.status.can_transition_to(next) {
            return false;
        }
        state.status = next;
        state.updated_at = Utc::now();
        true
    }

    /// Like [`Task::try_transition`], but an illegal move is an error carrying
    /// both endpoints.
    pub fn transition(&self, next: TaskStatus) -> Result<()> {
        let mut state = self.lock();
        if !state.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: state.status,
                to: next,
            });
        }
        state.status = next;
        state.updated_at = Utc::now();
        Ok(())
    }

    /// Append an error stamped with the current stage.
    pub fn add_error(&self, message: impl Into<String>, details: Option<serde_json::Value>) {
        self.update(|state| {
            let error = TaskError {
                stage: state.status,
                message: message.into(),
                timestamp: Utc::now(),
                details,
            };
            state.errors.push(error);
        });
    }

    /// Set in-stage progress, clamped to [0, 100].
    pub fn set_progress(&self, progress: f64) {
        self.update(|state| {
            state.stats.progress = progress.clamp(0.0, 100.0);
        });
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    pub fn can_resume(&self) -> bool {
        matches!(
            self.status(),
            TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Paused
        )
    }

    pub fn latest_error(&self) -> Option<TaskError> {
        self.lock().errors.last().cloned()
    }

    /// Owned copy of the mutable state for observers, so no lock is held
    /// across an await point.
    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.lock().clone();
        TaskSnapshot {
            id: self.id.clone(),
            url: self.url.clone(),
            created_at: self.created_at,
            status: state.status,
            updated_at: state.updated_at,
            stats: state.stats,
            metadata: state.metadata,
            errors: state.errors,
            audio_path: state.audio_path,
        }
    }
}

/// A point-in-time copy of a task, safe to serialize and to hold across awaits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub url: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stats: TaskStats,
    pub metadata: TaskMetadata,
    pub errors: Vec<TaskError>,
    pub audio_path: Option<String>,
}

impl TaskSnapshot {
    pub fn latest_error(&self) -> Option<&TaskError> {
        self.errors.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        let task = Task::new("https://example/media/clip.mp4");
        for next in [
            TaskStatus::Downloading,
            TaskStatus::Splitting,
            TaskStatus::Transcribing,
            TaskStatus::Merging,
            TaskStatus::Completed,
        ] {
            assert!(task.try_transition(next), "expected legal move to {next}");
        }
        assert_eq!(task.status(), TaskStatus::Completed);
    }

    #[test]
    fn illegal_transitions_do_not_mutate() {
        let task = Task::new("https://example/media/clip.mp4");
        let before = task.snapshot();

        assert!(!task.try_transition(TaskStatus::Merging));
        assert!(!task.try_transition(TaskStatus::Completed));
        assert!(!task.try_transition(TaskStatus::Paused));

        let after = task.snapshot();
        assert_eq!(after.status, TaskStatus::Pending);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[test]
    fn transition_reports_both_endpoints() {
        let task = Task::new("https://example/media/clip.mp4");
        let err = task.transition(TaskStatus::Merging).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Merging
            }
        ));
    }

    #[test]
    fn terminal_states_and_resume() {
        let task = Task::new("https://example/media/clip.mp4");
        assert!(task.try_transition(TaskStatus::Downloading));
        assert!(task.try_transition(TaskStatus::Failed));
        assert!(task.status().is_terminal());
        assert!(task.can_resume());

        // Failed → Pending re-arms the pipeline.
        assert!(task.try_transition(TaskStatus::Pending));
        assert!(!task.can_resume());
    }

    #[test]
    fn completed_can_only_fail() {
        assert!(TaskStatus::Completed.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Downloading));
    }

    #[test]
    fn update_bumps_updated_at() {
        let task = Task::new("https://example/media/clip.mp4");
        let before = task.snapshot().updated_at;
        task.update(|state| state.stats.total_bytes = 1024);
        let after = task.snapshot();
        assert!(after.updated_at >= before);
        assert_eq!(after.stats.total_bytes, 1024);
    }

    #[test]
    fn errors_are_stamped_with_current_stage() {
        let task = Task::new("https://example/media/clip.mp4");
        assert!(task.try_transition(TaskStatus::Downloading));
        task.add_error("network unreachable", None);

        let err = task.latest_error().expect("error recorded");
        assert_eq!(err.stage, TaskStatus::Downloading);
        assert_eq!(err.message, "network unreachable");
    }

    #[test]
    fn progress_is_clamped() {
        let task = Task::new("https://example/media/clip.mp4");
        task.set_progress(150.0);
        assert_eq!(task.snapshot().stats.progress, 100.0);
        task.set_progress(-3.0);
        assert_eq!(task.snapshot().stats.progress, 0.0);
    }

    #[test]
    fn concurrent_updates_are_serialized() {
        let task = Task::new("https://example/media/clip.mp4");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let task = task.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    task.update(|state| {
                        state.metadata.transcription.word_count += 1;
                    });
                }
            }));
        }
        for handle in handles {
            handle.join().expect("updater thread panicked");
        }
        assert_eq!(task.snapshot().metadata.transcription.word_count, 800);
    }
}
