//! Snapshot branches and rollback.
//!
//! Before a feature's worker starts, the supervisor records a snapshot
//! branch `swarm/{featureId}` at the current HEAD. The branch is the unit
//! of reversibility: it backs diffing ("what did this worker touch"),
//! rollback, and cross-feature conflict checks.
//!
//! Rollback restores the working tree, not history: files differing from
//! the snapshot are restored from it, files created since the snapshot are
//! removed. It is documented-unsafe under concurrent modification — any
//! file another running or completed feature also touched comes along for
//! the ride. `check_rollback_conflicts` exists so callers can look before
//! they leap.

pub mod git;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Component, Path};
use tracing::{debug, warn};

use crate::error::RollbackError;
use crate::registry::{Feature, FeatureStatus};

pub use git::GitBackend;

/// Namespace prefix for snapshot branches.
pub const SNAPSHOT_PREFIX: &str = "swarm/";

/// How a path differs from the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    /// Created since the snapshot.
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: String,
    pub status: DiffStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffStat {
    pub path: String,
    pub lines_added: u32,
    pub lines_removed: u32,
}

/// Version-control port. Diffs compare a snapshot ref against the current
/// working tree.
pub trait VersionControl: Send + Sync {
    fn rev_parse_head(&self) -> Result<String>;
    /// Create (or force-move) a local branch at HEAD.
    fn branch_create(&self, name: &str) -> Result<()>;
    /// Delete a local branch; Ok(false) when it did not exist.
    fn branch_delete(&self, name: &str) -> Result<bool>;
    fn branch_list(&self, prefix: &str) -> Result<Vec<String>>;
    fn diff_name_only(&self, ref_name: &str) -> Result<Vec<DiffEntry>>;
    fn diff_numstat(&self, ref_name: &str) -> Result<Vec<DiffStat>>;
    /// Restore one path's content from a ref into the working tree.
    fn checkout_path_from_ref(&self, ref_name: &str, path: &str) -> Result<()>;
    /// Remove one path from the working tree; missing files are fine.
    fn remove_path(&self, path: &str) -> Result<()>;
}

/// A path excluded from rollback, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPath {
    pub path: String,
    pub reason: String,
}

/// What a rollback actually did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackReport {
    pub feature_id: String,
    /// Files restored to their snapshot content.
    pub restored: Vec<String>,
    /// Files created since the snapshot, now removed.
    pub removed: Vec<String>,
    /// Rejected or failed paths; the rest of the rollback still ran.
    pub skipped: Vec<SkippedPath>,
}

/// One other feature whose files overlap a prospective rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictingFeature {
    pub feature_id: String,
    pub status: FeatureStatus,
    pub shared_files: Vec<String>,
}

/// Result of a rollback conflict check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConflicts {
    pub feature_id: String,
    pub has_conflicts: bool,
    pub conflicts: Vec<ConflictingFeature>,
}

/// Checkpoint and rollback over a [`VersionControl`] backend.
///
/// Construction is best-effort: a directory that is not a repository
/// yields a manager whose operations no-op (snapshots must never block a
/// worker from starting).
pub struct SnapshotManager {
    vcs: Option<Box<dyn VersionControl>>,
}

impl SnapshotManager {
    /// Open against a project directory, degrading to a no-op manager when
    /// the directory is not a git repository.
    pub fn open(project_dir: &Path) -> Self {
        match GitBackend::open(project_dir) {
            Ok(backend) => Self {
                vcs: Some(Box::new(backend)),
            },
            Err(e) => {
                warn!(error = %e, "no repository found, snapshots disabled");
                Self { vcs: None }
            }
        }
    }

    /// Use an explicit backend (tests, alternative VCS).
    pub fn with_backend(vcs: Box<dyn VersionControl>) -> Self {
        Self { vcs: Some(vcs) }
    }

    pub fn is_enabled(&self) -> bool {
        self.vcs.is_some()
    }

    pub fn branch_name(feature_id: &str) -> String {
        format!("{}{}", SNAPSHOT_PREFIX, feature_id)
    }

    /// Force-create `swarm/{featureId}` at the current HEAD, replacing any
    /// stale branch of the same name. Returns the branch name, or `None`
    /// when snapshots are disabled.
    pub fn create_snapshot_branch(&self, feature_id: &str) -> Result<Option<String>> {
        let Some(vcs) = &self.vcs else {
            return Ok(None);
        };
        let branch = Self::branch_name(feature_id);
        // Delete-then-create keeps the ref pointing at today's HEAD even
        // if a previous attempt left one behind.
        vcs.branch_delete(&branch)?;
        vcs.branch_create(&branch)?;
        debug!(branch = %branch, head = %vcs.rev_parse_head()?, "snapshot branch created");
        Ok(Some(branch))
    }

    /// Files differing between a feature's snapshot and the working tree.
    pub fn modified_files(&self, feature_id: &str) -> Result<Vec<String>> {
        let Some(vcs) = &self.vcs else {
            return Ok(Vec::new());
        };
        let entries = vcs.diff_name_only(&Self::branch_name(feature_id))?;
        Ok(entries.into_iter().map(|e| e.path).collect())
    }

    /// Per-file added/removed line counts since a feature's snapshot, for
    /// change-size reporting.
    pub fn change_stats(&self, feature_id: &str) -> Result<Vec<DiffStat>> {
        let Some(vcs) = &self.vcs else {
            return Ok(Vec::new());
        };
        vcs.diff_numstat(&Self::branch_name(feature_id))
    }

    /// Restore a feature's files to snapshot state.
    ///
    /// With `files`, only that subset is considered; otherwise every file
    /// differing from the snapshot. Absolute paths and `..` traversal are
    /// rejected per entry: the entry lands in `skipped` and the rest of
    /// the rollback proceeds.
    pub fn rollback_feature(
        &self,
        feature_id: &str,
        files: Option<&[String]>,
    ) -> Result<RollbackReport, RollbackError> {
        let Some(vcs) = &self.vcs else {
            return Err(RollbackError::Vcs("snapshots are disabled".to_string()));
        };
        let branch = Self::branch_name(feature_id);
        if !vcs
            .branch_list(SNAPSHOT_PREFIX)
            .map_err(|e| RollbackError::Vcs(e.to_string()))?
            .contains(&branch)
        {
            return Err(RollbackError::SnapshotMissing {
                feature_id: feature_id.to_string(),
                branch,
            });
        }

        let diff = vcs
            .diff_name_only(&branch)
            .map_err(|e| RollbackError::Vcs(e.to_string()))?;

        let mut report = RollbackReport {
            feature_id: feature_id.to_string(),
            ..Default::default()
        };

        let targets: Vec<&DiffEntry> = match files {
            Some(requested) => {
                let mut targets = Vec::new();
                for path in requested {
                    if let Err(reason) = validate_rollback_path(path) {
                        warn!(path = %path, %reason, "rollback path rejected");
                        report.skipped.push(SkippedPath {
                            path: path.clone(),
                            reason,
                        });
                        continue;
                    }
                    // Requested but unchanged files are a no-op
                    if let Some(entry) = diff.iter().find(|e| &e.path == path) {
                        targets.push(entry);
                    }
                }
                targets
            }
            None => diff.iter().collect(),
        };

        for entry in targets {
            let outcome = match entry.status {
                DiffStatus::Added => vcs
                    .remove_path(&entry.path)
                    .map(|_| report.removed.push(entry.path.clone())),
                DiffStatus::Modified | DiffStatus::Deleted => vcs
                    .checkout_path_from_ref(&branch, &entry.path)
                    .map(|_| report.restored.push(entry.path.clone())),
            };
            if let Err(e) = outcome {
                report.skipped.push(SkippedPath {
                    path: entry.path.clone(),
                    reason: e.to_string(),
                });
            }
        }

        Ok(report)
    }

    /// Intersect the target's snapshot diff with every other non-pending
    /// feature's modified-file set.
    pub fn check_rollback_conflicts(
        &self,
        target_feature_id: &str,
        all_features: &[Feature],
    ) -> Result<RollbackConflicts> {
        let target_files: BTreeSet<String> =
            self.modified_files(target_feature_id)?.into_iter().collect();

        let mut conflicts = Vec::new();
        for feature in all_features {
            if feature.id == target_feature_id || feature.status == FeatureStatus::Pending {
                continue;
            }
            // Prefer the cached set; re-derive from the snapshot when the
            // cache is empty and a snapshot still exists.
            let other_files: BTreeSet<String> = if feature.modified_files.is_empty() {
                self.modified_files(&feature.id).unwrap_or_default().into_iter().collect()
            } else {
                feature.modified_files.iter().cloned().collect()
            };

            let shared: Vec<String> = target_files.intersection(&other_files).cloned().collect();
            if !shared.is_empty() {
                conflicts.push(ConflictingFeature {
                    feature_id: feature.id.clone(),
                    status: feature.status,
                    shared_files: shared,
                });
            }
        }

        Ok(RollbackConflicts {
            feature_id: target_feature_id.to_string(),
            has_conflicts: !conflicts.is_empty(),
            conflicts,
        })
    }

    /// Delete a feature's snapshot branch. Idempotent.
    pub fn delete_snapshot_branch(&self, feature_id: &str) -> Result<bool> {
        match &self.vcs {
            Some(vcs) => vcs.branch_delete(&Self::branch_name(feature_id)),
            None => Ok(false),
        }
    }

    /// Delete every `swarm/*` branch. Returns how many were removed.
    pub fn cleanup_all_snapshot_branches(&self) -> Result<usize> {
        let Some(vcs) = &self.vcs else {
            return Ok(0);
        };
        let mut deleted = 0;
        for branch in vcs.branch_list(SNAPSHOT_PREFIX)? {
            if vcs.branch_delete(&branch)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// Reject paths that could escape the working tree.
fn validate_rollback_path(path: &str) -> Result<(), String> {
    let p = Path::new(path);
    if p.is_absolute() {
        return Err("absolute paths are not allowed".to_string());
    }
    for component in p.components() {
        match component {
            Component::ParentDir => {
                return Err("parent-directory traversal is not allowed".to_string());
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err("absolute paths are not allowed".to_string());
            }
            _ => {}
        }
    }
    Ok(())
}
