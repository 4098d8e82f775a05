//! Typed error hierarchy for the Shepherd supervisor.
//!
//! Two top-level enums cover the two failure domains:
//! - `SpawnError` — everything that can refuse or abort a worker spawn
//! - `RollbackError` — snapshot restore failures
//!
//! Spawn errors are always folded into a structured `SpawnResult` at the
//! public API boundary; they never escape `start_worker` as a panic or a
//! bare `Err`. Polling and monitoring paths do not use these types at all —
//! they degrade to conservative statuses instead of propagating.

use thiserror::Error;

use crate::enforcement::Violation;

/// Errors raised while starting a worker session.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The feature id failed the allow-list check. Rejected before any
    /// side effect.
    #[error("Invalid feature ID '{id}': must match [a-zA-Z0-9_-] and be at most 64 characters")]
    InvalidFeatureId { id: String },

    /// The session host is unreachable or refused the session. Nothing
    /// was created.
    #[error("Session host unavailable: {0}")]
    SessionHostUnavailable(String),

    /// Pre-spawn policy evaluation blocked the spawn. No state mutated.
    #[error("Enforcement blocked spawn: {} violation(s)", violations.len())]
    EnforcementBlocked { violations: Vec<Violation> },

    #[error("Failed to write {kind} file at {path}: {source}")]
    ArtifactWriteFailed {
        kind: &'static str,
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from snapshot rollback.
///
/// A rejected path is NOT an error: it is skipped and surfaced in the
/// `RollbackReport`. These variants cover failures that stop the whole
/// operation.
#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("No snapshot branch {branch} for feature {feature_id}")]
    SnapshotMissing { feature_id: String, branch: String },

    #[error("Version control error: {0}")]
    Vcs(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_feature_id_message_is_greppable() {
        let err = SpawnError::InvalidFeatureId {
            id: "bad id".to_string(),
        };
        assert!(err.to_string().contains("Invalid feature ID"));
        assert!(err.to_string().contains("bad id"));
    }

    #[test]
    fn enforcement_blocked_counts_violations() {
        let err = SpawnError::EnforcementBlocked {
            violations: Vec::new(),
        };
        assert!(err.to_string().contains("0 violation(s)"));
    }

    #[test]
    fn rollback_snapshot_missing_carries_branch() {
        let err = RollbackError::SnapshotMissing {
            feature_id: "f1".to_string(),
            branch: "swarm/f1".to_string(),
        };
        assert!(err.to_string().contains("swarm/f1"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&SpawnError::SessionHostUnavailable("x".into()));
        assert_std_error(&RollbackError::Vcs("x".into()));
    }
}
