//! Feature data model and in-memory registry.
//!
//! A `Feature` is one decomposed unit of work with its own lifecycle,
//! assigned to at most one active worker at a time. The registry owns the
//! lifecycle invariants so callers cannot produce an illegal state:
//! - `worker_id` is `Some` only while the feature is `InProgress`
//! - `attempts` increments on every spawn
//! - a retry transitions `Failed` → `Pending`, never skipping `InProgress`
//!
//! Durable persistence is an external collaborator behind the `StateStore`
//! trait; the registry itself is plain in-memory state scoped to one
//! supervisor instance, never a global singleton.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl FeatureStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FeatureStatus::Completed | FeatureStatus::Failed)
    }
}

/// Validation settings for a feature (commands run by external tooling).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Shell command expected to succeed once the feature is complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Whether a failing validation marks the feature failed.
    #[serde(default)]
    pub required: bool,
}

/// One decomposed unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub description: String,
    pub status: FeatureStatus,
    /// Number of spawns so far. Incremented on every spawn.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Session name of the active worker; set only while InProgress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub validation: ValidationConfig,
    /// Whether the finished work was verified against the snapshot diff.
    #[serde(default)]
    pub git_verification: bool,
    /// Files this feature's worker touched, derived from the snapshot diff.
    #[serde(default)]
    pub modified_files: Vec<String>,
    /// Protocol ids that apply to this feature beyond the globally active set.
    #[serde(default)]
    pub protocol_bindings: Vec<String>,
}

fn default_max_retries() -> u32 {
    3
}

impl Feature {
    pub fn new(id: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            status: FeatureStatus::Pending,
            attempts: 0,
            max_retries: default_max_retries(),
            depends_on: Vec::new(),
            worker_id: None,
            started_at: None,
            completed_at: None,
            last_error: None,
            validation: ValidationConfig::default(),
            git_verification: false,
            modified_files: Vec::new(),
            protocol_bindings: Vec::new(),
        }
    }

    pub fn can_retry(&self) -> bool {
        self.status == FeatureStatus::Failed && self.attempts < self.max_retries
    }
}

/// Durable persistence port. The on-disk format, atomic-write and rotation
/// mechanics live outside this crate.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<Vec<Feature>>;
    fn save(&self, features: &[Feature]) -> Result<()>;
}

/// In-memory feature registry scoped to one supervisor instance.
#[derive(Debug, Default)]
pub struct FeatureRegistry {
    features: BTreeMap<String, Feature>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_features(features: Vec<Feature>) -> Self {
        let mut registry = Self::new();
        for feature in features {
            registry.insert(feature);
        }
        registry
    }

    pub fn insert(&mut self, feature: Feature) {
        self.features.insert(feature.id.clone(), feature);
    }

    pub fn remove(&mut self, id: &str) -> Option<Feature> {
        self.features.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Feature> {
        self.features.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.features.contains_key(id)
    }

    pub fn all(&self) -> Vec<Feature> {
        self.features.values().cloned().collect()
    }

    pub fn in_progress(&self) -> Vec<Feature> {
        self.features
            .values()
            .filter(|f| f.status == FeatureStatus::InProgress)
            .cloned()
            .collect()
    }

    /// Record a spawn: Pending/Failed → InProgress, assign the worker and
    /// bump the attempt counter.
    pub fn mark_started(&mut self, id: &str, worker_id: &str) -> Result<()> {
        let feature = self.get_mut(id)?;
        if feature.status == FeatureStatus::InProgress {
            bail!("Feature {} already has an active worker", id);
        }
        feature.status = FeatureStatus::InProgress;
        feature.worker_id = Some(worker_id.to_string());
        feature.attempts += 1;
        feature.started_at = Some(Utc::now());
        feature.completed_at = None;
        Ok(())
    }

    pub fn mark_completed(&mut self, id: &str) -> Result<()> {
        let feature = self.get_mut(id)?;
        feature.status = FeatureStatus::Completed;
        feature.worker_id = None;
        feature.completed_at = Some(Utc::now());
        feature.last_error = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, id: &str, error: &str) -> Result<()> {
        let feature = self.get_mut(id)?;
        feature.status = FeatureStatus::Failed;
        feature.worker_id = None;
        feature.completed_at = Some(Utc::now());
        feature.last_error = Some(error.to_string());
        Ok(())
    }

    /// Queue a failed feature for another attempt. Only Failed → Pending is
    /// legal; a retry never skips the InProgress transition.
    pub fn retry(&mut self, id: &str) -> Result<()> {
        let feature = self.get_mut(id)?;
        if feature.status != FeatureStatus::Failed {
            bail!(
                "Feature {} is {:?}, only failed features can be retried",
                id,
                feature.status
            );
        }
        if feature.attempts >= feature.max_retries {
            bail!(
                "Feature {} exhausted its retries ({}/{})",
                id,
                feature.attempts,
                feature.max_retries
            );
        }
        feature.status = FeatureStatus::Pending;
        feature.worker_id = None;
        feature.started_at = None;
        feature.completed_at = None;
        Ok(())
    }

    /// Record the modified-file set derived from the feature's snapshot diff.
    pub fn set_modified_files(&mut self, id: &str, files: Vec<String>) -> Result<()> {
        let feature = self.get_mut(id)?;
        feature.modified_files = files;
        Ok(())
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Feature> {
        self.features
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("Unknown feature: {}", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(id: &str) -> FeatureRegistry {
        let mut registry = FeatureRegistry::new();
        registry.insert(Feature::new(id, "test feature"));
        registry
    }

    #[test]
    fn new_feature_is_pending_with_no_worker() {
        let feature = Feature::new("f1", "do something");
        assert_eq!(feature.status, FeatureStatus::Pending);
        assert!(feature.worker_id.is_none());
        assert_eq!(feature.attempts, 0);
    }

    #[test]
    fn mark_started_assigns_worker_and_increments_attempts() {
        let mut registry = registry_with("f1");
        registry.mark_started("f1", "worker-f1-abc").unwrap();
        let feature = registry.get("f1").unwrap();
        assert_eq!(feature.status, FeatureStatus::InProgress);
        assert_eq!(feature.worker_id.as_deref(), Some("worker-f1-abc"));
        assert_eq!(feature.attempts, 1);
        assert!(feature.started_at.is_some());
    }

    #[test]
    fn mark_started_rejects_double_spawn() {
        let mut registry = registry_with("f1");
        registry.mark_started("f1", "w1").unwrap();
        assert!(registry.mark_started("f1", "w2").is_err());
    }

    #[test]
    fn worker_id_cleared_on_terminal_states() {
        let mut registry = registry_with("f1");
        registry.mark_started("f1", "w1").unwrap();
        registry.mark_completed("f1").unwrap();
        assert!(registry.get("f1").unwrap().worker_id.is_none());

        let mut registry = registry_with("f2");
        registry.mark_started("f2", "w1").unwrap();
        registry.mark_failed("f2", "timed out").unwrap();
        let feature = registry.get("f2").unwrap();
        assert!(feature.worker_id.is_none());
        assert_eq!(feature.last_error.as_deref(), Some("timed out"));
    }

    #[test]
    fn retry_only_from_failed() {
        let mut registry = registry_with("f1");
        assert!(registry.retry("f1").is_err()); // pending

        registry.mark_started("f1", "w1").unwrap();
        assert!(registry.retry("f1").is_err()); // in progress

        registry.mark_failed("f1", "oops").unwrap();
        registry.retry("f1").unwrap();
        let feature = registry.get("f1").unwrap();
        assert_eq!(feature.status, FeatureStatus::Pending);
        assert!(feature.worker_id.is_none());
        // attempts survive the retry; they count spawns, not completions
        assert_eq!(feature.attempts, 1);
    }

    #[test]
    fn retry_exhaustion_is_rejected() {
        let mut registry = registry_with("f1");
        for _ in 0..3 {
            registry.mark_started("f1", "w").unwrap();
            registry.mark_failed("f1", "boom").unwrap();
            let _ = registry.retry("f1");
        }
        let feature = registry.get("f1").unwrap();
        assert_eq!(feature.attempts, 3);
        assert!(registry.retry("f1").is_err());
    }

    #[test]
    fn feature_serialization_round_trips() {
        let mut feature = Feature::new("f1", "desc");
        feature.modified_files = vec!["src/a.rs".to_string()];
        let json = serde_json::to_string(&feature).unwrap();
        let parsed: Feature = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "f1");
        assert_eq!(parsed.status, FeatureStatus::Pending);
        assert_eq!(parsed.modified_files, vec!["src/a.rs"]);
    }
}
