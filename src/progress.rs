//! Per-task progress stream.
//!
//! Subscribers poll the task record at a fixed interval and receive coalesced
//! status events: one on every status change, one whenever overall progress
//! advances by at least a tenth of a percent, and a final one at a terminal
//! status. Overall progress is a weighted combination of the stage progress,
//! capped below 100 until the task actually completes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::task::{Task, TaskSnapshot, TaskStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const MIN_PROGRESS_DELTA: f64 = 0.1;

/// Fixed share of overall progress each stage contributes.
pub fn stage_weight(status: TaskStatus) -> f64 {
    match status {
        TaskStatus::Downloading => 0.20,
        TaskStatus::Splitting => 0.10,
        TaskStatus::Transcribing => 0.60,
        TaskStatus::Merging => 0.10,
        _ => 0.0,
    }
}

fn completed_weight(status: TaskStatus) -> f64 {
    match status {
        TaskStatus::Downloading => 0.0,
        TaskStatus::Splitting => 0.20,
        TaskStatus::Transcribing => 0.30,
        TaskStatus::Merging => 0.90,
        _ => 0.0,
    }
}

/// Weighted overall progress for a snapshot.
///
/// Completed stages count fully, the current stage contributes
/// proportionally, and the result stays below 100 until the task reaches
/// `Completed`. A failed task reports the raw in-stage progress it died at.
pub fn overall_progress(snapshot: &TaskSnapshot) -> f64 {
    match snapshot.status {
        TaskStatus::Completed => 100.0,
        TaskStatus::Failed => snapshot.stats.progress,
        status => {
            let weight = stage_weight(status);
            if weight == 0.0 {
                return 0.0;
            }
            let done = completed_weight(status);
            let current = snapshot.stats.progress / 100.0 * weight;
            ((done + current) * 100.0).min(99.9)
        }
    }
}

/// One status update delivered to a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub id: String,
    pub status: TaskStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
}

impl StatusEvent {
    fn from_snapshot(snapshot: &TaskSnapshot, progress: f64) -> Self {
        Self {
            id: snapshot.id.clone(),
            status: snapshot.status,
            progress,
            error: snapshot.latest_error().map(|e| e.message.clone()),
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            current_stage: snapshot
                .status
                .is_stage()
                .then(|| snapshot.status.as_str().to_owned()),
        }
    }
}

/// Render an event as one server-sent-events record.
pub fn sse_frame(event: &StatusEvent) -> Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(event)?))
}

struct StreamState {
    task: Arc<Task>,
    prev_status: Option<TaskStatus>,
    prev_progress: f64,
    first_poll: bool,
    done: bool,
}

/// Observe `task` until it terminates.
///
/// Emits immediately on subscribe, then at most once per poll interval, and
/// ends after delivering a `Completed` or `Failed` event.
pub fn stream(task: Arc<Task>) -> impl Stream<Item = StatusEvent> {
    let state = StreamState {
        task,
        prev_status: None,
        prev_progress: 0.0,
        first_poll: true,
        done: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        loop {
            if !state.first_poll {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            state.first_poll = false;

            let snapshot = state.task.snapshot();
            let progress = overall_progress(&snapshot);
            let status_changed = state.prev_status != Some(snapshot.status);
            let terminal = matches!(snapshot.status, TaskStatus::Completed | TaskStatus::Failed);

            if status_changed || progress - state.prev_progress >= MIN_PROGRESS_DELTA || terminal {
                let event = StatusEvent::from_snapshot(&snapshot, progress);
                state.prev_status = Some(snapshot.status);
                state.prev_progress = progress;
                state.done = terminal;
                return Some((event, state));
            }
        }
    })
}
