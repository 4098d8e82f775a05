//! Heartbeat extraction from worker logs.
//!
//! A heartbeat is a cheap liveness summary built from the tail of the
//! worker log plus the spawn status record. Log formats drift between
//! agent versions, so every field degrades to `None` rather than erroring
//! when the expected shapes are missing.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::artifacts::StatusRecord;
use crate::enforcement::{AgentAction, parse_actions};
use crate::health::ConfidenceSnapshot;

/// How many trailing log lines the heartbeat looks at.
const HEARTBEAT_WINDOW_LINES: usize = 100;
/// How many distinct recently-touched files to report.
const MAX_RECENT_FILES: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatInfo {
    pub feature_id: String,
    pub session_name: Option<String>,
    /// Most recent tool the worker invoked, if any was recognized.
    pub last_tool: Option<String>,
    /// Most recently touched file paths, newest last.
    pub recent_files: Vec<String>,
    pub elapsed_seconds: Option<u64>,
    pub confidence: Option<ConfidenceSnapshot>,
}

/// Build a heartbeat from raw log text and the spawn record. The last
/// recognized match wins for the tool field.
pub fn heartbeat_from_log(
    feature_id: &str,
    log_text: &str,
    status: Option<&StatusRecord>,
) -> HeartbeatInfo {
    let tail = tail_text(log_text, HEARTBEAT_WINDOW_LINES);
    let actions = parse_actions(&tail);

    let last_tool = actions.iter().rev().find_map(|action| match action {
        AgentAction::ToolCall { name } => Some(name.clone()),
        AgentAction::FileOperation { tool, .. } => Some(tool.clone()),
        AgentAction::ShellCommand { .. } | AgentAction::GitOperation { .. } => {
            Some("Bash".to_string())
        }
    });

    let mut recent_files = Vec::new();
    for action in &actions {
        if let AgentAction::FileOperation { path, .. } = action {
            recent_files.retain(|p| p != path);
            recent_files.push(path.clone());
        }
    }
    if recent_files.len() > MAX_RECENT_FILES {
        recent_files.drain(..recent_files.len() - MAX_RECENT_FILES);
    }

    let elapsed_seconds = status.and_then(|record| {
        let elapsed = Utc::now().signed_duration_since(record.started_at);
        u64::try_from(elapsed.num_seconds()).ok()
    });

    HeartbeatInfo {
        feature_id: feature_id.to_string(),
        session_name: status.map(|record| record.session_name.clone()),
        last_tool,
        recent_files,
        elapsed_seconds,
        confidence: None,
    }
}

fn tail_text(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
