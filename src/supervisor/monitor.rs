//! Worker status classification and completion events.
//!
//! Status is derived from two independent signals: whether the session is
//! still alive on the host, and whether the completion marker file exists.
//! The marker is only written on a clean agent exit, so a dead session
//! without one is a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Observed state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Completed,
    Crashed,
    NotFound,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerStatus::Completed | WorkerStatus::Crashed)
    }
}

/// Status plus recent output for a live session.
#[derive(Debug, Clone)]
pub struct WorkerCheck {
    pub status: WorkerStatus,
    pub recent_output: Option<String>,
}

/// Fired once per running-to-terminal edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub feature_id: String,
    pub session_name: String,
    pub status: WorkerStatus,
    pub observed_at: DateTime<Utc>,
}

pub type CompletionCallback = Arc<dyn Fn(&CompletionEvent) + Send + Sync>;

/// Result of the blocking wait helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    Crashed,
    /// Deadline hit while the worker was still in the given state.
    TimedOut(WorkerStatus),
}

/// Map the two signals to a status.
///
/// The marker wins over session liveness only when the session is gone: a
/// still-running session is Running even if a stale marker exists (the
/// marker from a previous attempt should have been cleared, but polling
/// must not flap on that race).
pub fn classify_status(session_exists: bool, marker_exists: bool, log_exists: bool) -> WorkerStatus {
    if session_exists {
        WorkerStatus::Running
    } else if marker_exists {
        WorkerStatus::Completed
    } else if log_exists {
        WorkerStatus::Crashed
    } else {
        WorkerStatus::NotFound
    }
}
