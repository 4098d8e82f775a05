//! Per-worker workspace artifacts.
//!
//! Every worker leaves a small trail of flat files in the workspace
//! directory, keyed by [`WorkerRole::artifact_key`]. Implementer
//! artifacts use the bare feature id; planner and review artifacts
//! take a role suffix so a review running alongside an implementer
//! never shares its files:
//!
//! - `{key}.prompt`     the task prompt, owner-readable only
//! - `{key}.log`        appended agent output
//! - `{key}.status`     spawn metadata as JSON
//! - `{key}.done`       completion marker, written on clean agent exit
//! - `{id}.confidence`  optional self-reported score (0-100)
//! - `{id}.plan.json`   planner output, when a planner worker ran

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

/// Worker role, reflected in session names and prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Implementer,
    Planner,
    Reviewer,
}

impl WorkerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Implementer => "worker",
            WorkerRole::Planner => "planner",
            WorkerRole::Reviewer => "review",
        }
    }

    /// Workspace file stem for this role's artifacts. Implementers keep
    /// the bare feature id so completion markers and heartbeats keep
    /// their feature-keyed paths; other roles get a suffixed stem.
    pub fn artifact_key(&self, feature_id: &str) -> String {
        match self {
            WorkerRole::Implementer => feature_id.to_string(),
            WorkerRole::Planner => format!("{}.planner", feature_id),
            WorkerRole::Reviewer => format!("{}.review", feature_id),
        }
    }
}

/// Spawn metadata persisted alongside the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub feature_id: String,
    pub session_name: String,
    pub role: WorkerRole,
    pub started_at: DateTime<Utc>,
    pub prompt_file: PathBuf,
    pub log_file: PathBuf,
}

/// Resolves artifact paths for a workspace directory.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    dir: PathBuf,
}

impl WorkspacePaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prompt_path(&self, feature_id: &str) -> PathBuf {
        self.dir.join(format!("{}.prompt", feature_id))
    }

    pub fn log_path(&self, feature_id: &str) -> PathBuf {
        self.dir.join(format!("{}.log", feature_id))
    }

    pub fn status_path(&self, feature_id: &str) -> PathBuf {
        self.dir.join(format!("{}.status", feature_id))
    }

    pub fn done_path(&self, feature_id: &str) -> PathBuf {
        self.dir.join(format!("{}.done", feature_id))
    }

    pub fn confidence_path(&self, feature_id: &str) -> PathBuf {
        self.dir.join(format!("{}.confidence", feature_id))
    }

    pub fn plan_path(&self, feature_id: &str) -> PathBuf {
        self.dir.join(format!("{}.plan.json", feature_id))
    }

    /// Write the prompt file with owner-only permissions. Prompts can
    /// carry repository internals, so they never get group/world bits.
    pub fn write_prompt(&self, feature_id: &str, prompt: &str) -> io::Result<PathBuf> {
        let path = self.prompt_path(feature_id);
        std::fs::write(&path, prompt)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(path)
    }

    /// Create (or truncate) the log file so tail-based polling always has
    /// a file to stat.
    pub fn init_log(&self, feature_id: &str) -> io::Result<PathBuf> {
        let path = self.log_path(feature_id);
        std::fs::write(&path, "")?;
        Ok(path)
    }

    pub fn write_status(&self, key: &str, record: &StatusRecord) -> io::Result<PathBuf> {
        let path = self.status_path(key);
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    pub fn read_status(&self, feature_id: &str) -> Option<StatusRecord> {
        let content = std::fs::read_to_string(self.status_path(feature_id)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn done_exists(&self, feature_id: &str) -> bool {
        self.done_path(feature_id).exists()
    }

    pub fn log_exists(&self, feature_id: &str) -> bool {
        self.log_path(feature_id).exists()
    }

    pub fn plan_exists(&self, feature_id: &str) -> bool {
        self.plan_path(feature_id).exists()
    }

    /// Remove the completion marker, for retries.
    pub fn clear_done(&self, feature_id: &str) -> io::Result<()> {
        match std::fs::remove_file(self.done_path(feature_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
