//! Multi-signal confidence scoring for running workers.
//!
//! A worker cannot be trusted to report its own state, so confidence is
//! synthesized from three independent 0-100 signals, each starting from a
//! neutral baseline of 70:
//! - tool activity: healthy read→edit→verify cycles score up, repeated-read
//!   stuck loops and log silence score down
//! - self-reported: an optional integer the worker writes to
//!   `{id}.confidence`; used verbatim, dropped from the weighting if absent
//! - output analysis: keyword scanning over the last 100 log lines
//!
//! Only the latest snapshot is retained; the previous aggregate is kept
//! per feature purely for trend detection. Alerts are recomputed fresh on
//! every call and are not deduplicated here — that is the caller's concern.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::debug;

use crate::enforcement::engine::{AgentAction, parse_actions};

/// How many log lines the scorers look at.
const LOG_WINDOW_LINES: usize = 100;
/// Neutral starting point for every signal.
const BASELINE: i32 = 70;

/// Severity of a health alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A health alert with a human-readable reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthAlert {
    pub severity: AlertSeverity,
    pub message: String,
}

/// Confidence bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    Critical,
}

impl ConfidenceLevel {
    fn from_score(score: u8) -> Self {
        match score {
            80.. => ConfidenceLevel::High,
            50..=79 => ConfidenceLevel::Medium,
            25..=49 => ConfidenceLevel::Low,
            _ => ConfidenceLevel::Critical,
        }
    }
}

/// Direction of change relative to the previous aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

/// The three signal sub-scores.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SignalScores {
    pub tool_activity: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_reported: Option<u8>,
    pub output_analysis: u8,
}

/// One confidence reading. Recomputed on every heartbeat poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceSnapshot {
    pub score: u8,
    pub level: ConfidenceLevel,
    pub trend: Trend,
    pub signals: SignalScores,
    pub alerts: Vec<HealthAlert>,
}

/// Intermediate evidence the scorers extract, kept for alert thresholds.
#[derive(Debug, Default)]
struct Evidence {
    stuck_patterns: usize,
    error_count: usize,
}

/// Confidence scoring over per-feature log and confidence files.
pub struct HealthMonitor {
    workspace_dir: PathBuf,
    previous_scores: Mutex<HashMap<String, u8>>,
}

impl HealthMonitor {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            workspace_dir: workspace_dir.to_path_buf(),
            previous_scores: Mutex::new(HashMap::new()),
        }
    }

    /// Compute a fresh confidence snapshot for a feature.
    ///
    /// File-read failures degrade: a missing log means no lines and a large
    /// idle time, a missing confidence file simply drops that signal.
    pub fn check(&self, feature_id: &str) -> ConfidenceSnapshot {
        let log_path = self.workspace_dir.join(format!("{}.log", feature_id));
        let lines = tail_lines(&log_path, LOG_WINDOW_LINES);
        let idle_seconds = idle_seconds(&log_path);
        let self_reported = self.read_self_reported(feature_id);
        let previous = self
            .previous_scores
            .lock()
            .expect("previous score lock poisoned")
            .get(feature_id)
            .copied();

        let snapshot = compute_snapshot(&lines, idle_seconds, self_reported, previous);

        self.previous_scores
            .lock()
            .expect("previous score lock poisoned")
            .insert(feature_id.to_string(), snapshot.score);
        debug!(
            feature = feature_id,
            score = snapshot.score,
            trend = ?snapshot.trend,
            "confidence recomputed"
        );
        snapshot
    }

    /// Forget the trend baseline for a feature (e.g. on retry).
    pub fn reset(&self, feature_id: &str) {
        self.previous_scores
            .lock()
            .expect("previous score lock poisoned")
            .remove(feature_id);
    }

    fn read_self_reported(&self, feature_id: &str) -> Option<u8> {
        let path = self.workspace_dir.join(format!("{}.confidence", feature_id));
        let content = std::fs::read_to_string(path).ok()?;
        let value: i64 = content.trim().parse().ok()?;
        Some(value.clamp(0, 100) as u8)
    }
}

/// Pure scoring core, driven directly by tests.
fn compute_snapshot(
    lines: &[String],
    idle_seconds: u64,
    self_reported: Option<u8>,
    previous: Option<u8>,
) -> ConfidenceSnapshot {
    let joined = lines.join("\n");
    let mut evidence = Evidence::default();

    let tool_activity = score_tool_activity(&joined, idle_seconds, &mut evidence);
    let output_analysis = score_output(lines, &mut evidence);

    let aggregate = match self_reported {
        Some(self_score) => {
            0.35 * tool_activity as f64 + 0.35 * self_score as f64 + 0.30 * output_analysis as f64
        }
        None => 0.5 * tool_activity as f64 + 0.5 * output_analysis as f64,
    };

    let (trend, nudged) = match previous {
        Some(prev) => {
            let diff = aggregate - prev as f64;
            if diff > 5.0 {
                (Trend::Improving, aggregate + 5.0)
            } else if diff < -5.0 {
                (Trend::Declining, aggregate - 5.0)
            } else {
                (Trend::Stable, aggregate)
            }
        }
        None => (Trend::Stable, aggregate),
    };

    let score = nudged.clamp(0.0, 100.0).round() as u8;
    let alerts = collect_alerts(score, trend, idle_seconds, self_reported, &evidence);

    ConfidenceSnapshot {
        score,
        level: ConfidenceLevel::from_score(score),
        trend,
        signals: SignalScores {
            tool_activity,
            self_reported,
            output_analysis,
        },
        alerts,
    }
}

/// Tool-activity signal: cycles up, stuck loops and silence down.
fn score_tool_activity(raw: &str, idle_seconds: u64, evidence: &mut Evidence) -> u8 {
    let actions = parse_actions(raw);
    let mut score = BASELINE;

    // Categorize into read / edit / verify steps
    #[derive(PartialEq, Clone, Copy)]
    enum Step {
        Read,
        Edit,
        Verify,
        Other,
    }
    let steps: Vec<(Step, Option<&str>)> = actions
        .iter()
        .map(|a| match a {
            AgentAction::FileOperation { tool, path } => match tool.as_str() {
                "Read" => (Step::Read, Some(path.as_str())),
                "Edit" | "MultiEdit" | "Write" | "NotebookEdit" => {
                    (Step::Edit, Some(path.as_str()))
                }
                _ => (Step::Other, None),
            },
            AgentAction::ShellCommand { command } | AgentAction::GitOperation { command } => {
                if command.contains("test") || command.contains("check") || command.contains("build")
                {
                    (Step::Verify, None)
                } else {
                    (Step::Other, None)
                }
            }
            AgentAction::ToolCall { name } => match name.as_str() {
                "Grep" | "Glob" => (Step::Read, None),
                _ => (Step::Other, None),
            },
        })
        .collect();

    // Reward read→edit→verify cycles, up to +20
    let mut cycles = 0;
    let mut phase = Step::Read;
    for (step, _) in &steps {
        match (phase, step) {
            (Step::Read, Step::Edit) => phase = Step::Edit,
            (Step::Edit, Step::Verify) => {
                cycles += 1;
                phase = Step::Read;
            }
            _ => {}
        }
    }
    score += (cycles * 5).min(20) as i32;

    // Penalize repeated reads of the same file with nothing in between
    let mut run = 1;
    for window in steps.windows(2) {
        if let [(Step::Read, Some(a)), (Step::Read, Some(b))] = window {
            if a == b {
                run += 1;
                if run == 3 {
                    evidence.stuck_patterns += 1;
                }
            } else {
                run = 1;
            }
        } else {
            run = 1;
        }
    }
    score -= (evidence.stuck_patterns as i32 * 10).min(30);

    // Idle penalty grows with minutes of log silence, capped
    let idle_minutes = idle_seconds / 60;
    if idle_minutes >= 2 {
        score -= idle_minutes.saturating_mul(2).min(30) as i32;
    }

    score.clamp(0, 100) as u8
}

const ERROR_KEYWORDS: &[&str] = &["error", "failed", "failure", "exception", "cannot", "unable to"];
const RETRY_KEYWORDS: &[&str] = &["retry", "retrying", "trying again", "attempt again"];
const FRUSTRATION_KEYWORDS: &[&str] = &["stuck", "confused", "not sure why", "giving up"];
const SUCCESS_KEYWORDS: &[&str] = &["success", "passing", "implemented", "works as expected"];
const COMPLETION_KEYWORDS: &[&str] = &[
    "all tests pass",
    "feature complete",
    "implementation complete",
    "finished implementing",
];

/// Output-analysis signal: keyword evidence over the log window.
fn score_output(lines: &[String], evidence: &mut Evidence) -> u8 {
    let mut score = BASELINE;
    let mut penalties = 0i32;
    let mut bonuses = 0i32;

    for line in lines {
        let lower = line.to_lowercase();
        if ERROR_KEYWORDS.iter().any(|k| lower.contains(k)) {
            evidence.error_count += 1;
            penalties += 3;
        }
        if RETRY_KEYWORDS.iter().any(|k| lower.contains(k)) {
            penalties += 2;
        }
        if FRUSTRATION_KEYWORDS.iter().any(|k| lower.contains(k)) {
            penalties += 5;
        }
        if SUCCESS_KEYWORDS.iter().any(|k| lower.contains(k)) {
            bonuses += 3;
        }
        // Completion phrases weighted heaviest
        if COMPLETION_KEYWORDS.iter().any(|k| lower.contains(k)) {
            bonuses += 10;
        }
    }

    score -= penalties.min(50);
    score += bonuses.min(30);
    score.clamp(0, 100) as u8
}

fn collect_alerts(
    score: u8,
    trend: Trend,
    idle_seconds: u64,
    self_reported: Option<u8>,
    evidence: &Evidence,
) -> Vec<HealthAlert> {
    let mut alerts = Vec::new();
    let mut push = |severity, message: String| alerts.push(HealthAlert { severity, message });

    if idle_seconds > 300 {
        push(
            AlertSeverity::Critical,
            format!("no log output for {}s", idle_seconds),
        );
    } else if idle_seconds > 180 {
        push(
            AlertSeverity::Warning,
            format!("no log output for {}s", idle_seconds),
        );
    }

    if evidence.stuck_patterns > 2 {
        push(
            AlertSeverity::Critical,
            format!("{} stuck-loop patterns detected", evidence.stuck_patterns),
        );
    } else if evidence.stuck_patterns > 0 {
        push(
            AlertSeverity::Warning,
            format!("{} stuck-loop pattern(s) detected", evidence.stuck_patterns),
        );
    }

    if evidence.error_count > 5 {
        push(
            AlertSeverity::Critical,
            format!("{} error lines in the log window", evidence.error_count),
        );
    } else if evidence.error_count > 3 {
        push(
            AlertSeverity::Warning,
            format!("{} error lines in the log window", evidence.error_count),
        );
    }

    if let Some(self_score) = self_reported {
        if self_score < 15 {
            push(
                AlertSeverity::Critical,
                format!("worker self-reports confidence {}", self_score),
            );
        } else if self_score < 30 {
            push(
                AlertSeverity::Warning,
                format!("worker self-reports confidence {}", self_score),
            );
        }
    }

    if trend == Trend::Declining {
        if score < 40 {
            push(
                AlertSeverity::Critical,
                format!("confidence declining, now {}", score),
            );
        } else {
            push(
                AlertSeverity::Warning,
                format!("confidence declining, now {}", score),
            );
        }
    }

    alerts
}

/// Last `limit` lines of a file; empty if unreadable.
fn tail_lines(path: &Path, limit: usize) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let mut lines: Vec<String> = content
                .lines()
                .rev()
                .take(limit)
                .map(|l| l.to_string())
                .collect();
            lines.reverse();
            lines
        }
        Err(_) => Vec::new(),
    }
}

/// Seconds since the file was last written; saturates high when unknown.
fn idle_seconds(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .map(|d| d.as_secs())
        .unwrap_or(u64::MAX / 2)
}
