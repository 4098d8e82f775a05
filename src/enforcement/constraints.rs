//! Constraint rules and the immutable base-constraint floor.
//!
//! `ConstraintRule` is a closed sum type dispatched exhaustively wherever
//! rules are evaluated; adding a variant breaks every dispatch site at
//! compile time, which is intentional.
//!
//! `BaseConstraints` is the permission floor no protocol may loosen.
//! `merge_with_defaults` composes an override restrictively: prohibited sets
//! only grow, allow-sets only shrink, boolean requirements OR together and
//! numeric retention takes the max.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Severity attached to a constraint or raised violation. Ordered, so a
/// blocking threshold can be compared with `>=`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// The rule half of a constraint, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstraintRule {
    /// Restricts which tools a worker may invoke.
    ToolRestriction {
        #[serde(default)]
        prohibited_tools: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowed_tools: Option<Vec<String>>,
    },
    /// Restricts which paths a worker may read or write.
    FileAccess {
        #[serde(default)]
        prohibited_paths: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowed_paths: Option<Vec<String>>,
    },
    /// Prohibits operations by command substring, optionally allow-listing
    /// full commands.
    SideEffect {
        #[serde(default)]
        prohibited_operations: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowed_commands: Option<Vec<String>>,
    },
    /// Behavioral limits and mandatory process steps.
    Behavioral {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_attempts: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        require_pre_validation: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        require_post_validation: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        require_audit_log: Option<bool>,
    },
}

impl ConstraintRule {
    /// Short kind name used in validation messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ConstraintRule::ToolRestriction { .. } => "tool_restriction",
            ConstraintRule::FileAccess { .. } => "file_access",
            ConstraintRule::SideEffect { .. } => "side_effect",
            ConstraintRule::Behavioral { .. } => "behavioral",
        }
    }
}

/// A single enforceable constraint inside a protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: String,
    pub rule: ConstraintRule,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

/// The immutable permission floor.
///
/// Fields are private; the only way to produce a non-default instance is
/// `merge_with_defaults`, which cannot weaken anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseConstraints {
    prohibited_tools: BTreeSet<String>,
    prohibited_paths: BTreeSet<String>,
    prohibited_operations: BTreeSet<String>,
    max_allowed_tools: BTreeSet<String>,
    max_allowed_paths: BTreeSet<String>,
    require_pre_validation: bool,
    require_post_validation: bool,
    require_audit_log: bool,
    audit_retention_days: u32,
}

fn set_of(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for BaseConstraints {
    fn default() -> Self {
        Self {
            prohibited_tools: set_of(&[
                "sudo",
                "su",
                "rm -rf",
                "dd",
                "mkfs",
                "shutdown",
                "reboot",
                "kill -9",
            ]),
            prohibited_paths: set_of(&[
                "/etc/**",
                "/usr/**",
                "/bin/**",
                "~/.ssh/**",
                ".env",
                ".git/config",
                "**/id_rsa",
            ]),
            prohibited_operations: set_of(&[
                "force push",
                "push --force",
                "rm -rf /",
                "chmod 777",
                "curl | sh",
                "drop table",
                "git reset --hard origin",
            ]),
            max_allowed_tools: set_of(&[
                "Read", "Edit", "Write", "Bash", "Grep", "Glob", "Task", "WebFetch",
            ]),
            max_allowed_paths: set_of(&["src/**", "tests/**", "docs/**", "*.md", "Cargo.toml"]),
            require_pre_validation: true,
            require_post_validation: true,
            require_audit_log: true,
            audit_retention_days: 30,
        }
    }
}

impl BaseConstraints {
    pub fn prohibited_tools(&self) -> &BTreeSet<String> {
        &self.prohibited_tools
    }

    pub fn prohibited_paths(&self) -> &BTreeSet<String> {
        &self.prohibited_paths
    }

    pub fn prohibited_operations(&self) -> &BTreeSet<String> {
        &self.prohibited_operations
    }

    pub fn max_allowed_tools(&self) -> &BTreeSet<String> {
        &self.max_allowed_tools
    }

    pub fn max_allowed_paths(&self) -> &BTreeSet<String> {
        &self.max_allowed_paths
    }

    pub fn require_pre_validation(&self) -> bool {
        self.require_pre_validation
    }

    pub fn require_post_validation(&self) -> bool {
        self.require_post_validation
    }

    pub fn require_audit_log(&self) -> bool {
        self.require_audit_log
    }

    pub fn audit_retention_days(&self) -> u32 {
        self.audit_retention_days
    }

    /// Combine an override with the floor, restrictively.
    ///
    /// - prohibited sets: union (grow only)
    /// - allow-sets: intersection (shrink only); an absent override keeps
    ///   the default
    /// - boolean requirements: OR (can only turn on)
    /// - audit retention: max
    pub fn merge_with_defaults(custom: &ConstraintOverride) -> Self {
        let defaults = Self::default();

        let mut prohibited_tools = defaults.prohibited_tools;
        prohibited_tools.extend(custom.prohibited_tools.iter().cloned());
        let mut prohibited_paths = defaults.prohibited_paths;
        prohibited_paths.extend(custom.prohibited_paths.iter().cloned());
        let mut prohibited_operations = defaults.prohibited_operations;
        prohibited_operations.extend(custom.prohibited_operations.iter().cloned());

        let max_allowed_tools = match &custom.max_allowed_tools {
            Some(set) => defaults
                .max_allowed_tools
                .intersection(set)
                .cloned()
                .collect(),
            None => defaults.max_allowed_tools,
        };
        let max_allowed_paths = match &custom.max_allowed_paths {
            Some(set) => defaults
                .max_allowed_paths
                .intersection(set)
                .cloned()
                .collect(),
            None => defaults.max_allowed_paths,
        };

        Self {
            prohibited_tools,
            prohibited_paths,
            prohibited_operations,
            max_allowed_tools,
            max_allowed_paths,
            require_pre_validation: defaults.require_pre_validation
                || custom.require_pre_validation.unwrap_or(false),
            require_post_validation: defaults.require_post_validation
                || custom.require_post_validation.unwrap_or(false),
            require_audit_log: defaults.require_audit_log
                || custom.require_audit_log.unwrap_or(false),
            audit_retention_days: defaults
                .audit_retention_days
                .max(custom.audit_retention_days.unwrap_or(0)),
        }
    }
}

/// Partial override merged over the default floor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstraintOverride {
    #[serde(default)]
    pub prohibited_tools: BTreeSet<String>,
    #[serde(default)]
    pub prohibited_paths: BTreeSet<String>,
    #[serde(default)]
    pub prohibited_operations: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_allowed_tools: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_allowed_paths: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_pre_validation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_post_validation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_audit_log: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_retention_days: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_supports_blocking_threshold() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert!(Severity::Error >= Severity::Error);
    }

    #[test]
    fn defaults_prohibit_sudo() {
        let base = BaseConstraints::default();
        assert!(base.prohibited_tools().contains("sudo"));
        assert!(base.require_audit_log());
    }

    #[test]
    fn merge_grows_prohibited_sets() {
        let custom = ConstraintOverride {
            prohibited_tools: set_of(&["docker"]),
            ..Default::default()
        };
        let merged = BaseConstraints::merge_with_defaults(&custom);
        let defaults = BaseConstraints::default();
        assert!(merged.prohibited_tools().is_superset(defaults.prohibited_tools()));
        assert!(merged.prohibited_tools().contains("docker"));
        assert!(merged.prohibited_tools().contains("sudo"));
    }

    #[test]
    fn merge_shrinks_allow_sets() {
        let custom = ConstraintOverride {
            // Attempt to widen: "sudo" is not in the default max set and
            // must not appear in the merge.
            max_allowed_tools: Some(set_of(&["Read", "Edit", "sudo"])),
            ..Default::default()
        };
        let merged = BaseConstraints::merge_with_defaults(&custom);
        let defaults = BaseConstraints::default();
        assert!(merged.max_allowed_tools().is_subset(defaults.max_allowed_tools()));
        assert!(merged.max_allowed_tools().contains("Read"));
        assert!(!merged.max_allowed_tools().contains("sudo"));
        assert!(!merged.max_allowed_tools().contains("Bash"));
    }

    #[test]
    fn merge_cannot_disable_requirements() {
        let custom = ConstraintOverride {
            require_audit_log: Some(false),
            require_pre_validation: Some(false),
            ..Default::default()
        };
        let merged = BaseConstraints::merge_with_defaults(&custom);
        assert!(merged.require_audit_log());
        assert!(merged.require_pre_validation());
    }

    #[test]
    fn merge_takes_max_retention() {
        let longer = ConstraintOverride {
            audit_retention_days: Some(90),
            ..Default::default()
        };
        assert_eq!(BaseConstraints::merge_with_defaults(&longer).audit_retention_days(), 90);

        let shorter = ConstraintOverride {
            audit_retention_days: Some(7),
            ..Default::default()
        };
        assert_eq!(BaseConstraints::merge_with_defaults(&shorter).audit_retention_days(), 30);
    }

    #[test]
    fn empty_override_reproduces_defaults() {
        let merged = BaseConstraints::merge_with_defaults(&ConstraintOverride::default());
        assert_eq!(merged, BaseConstraints::default());
    }

    #[test]
    fn constraint_rule_round_trips_with_type_tag() {
        let constraint = Constraint {
            id: "no-sudo".to_string(),
            rule: ConstraintRule::ToolRestriction {
                prohibited_tools: vec!["sudo".to_string()],
                allowed_tools: None,
            },
            severity: Severity::Critical,
            message: "sudo is never allowed".to_string(),
            remediation: None,
        };
        let json = serde_json::to_string(&constraint).unwrap();
        assert!(json.contains("\"type\":\"tool_restriction\""));
        let parsed: Constraint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, constraint);
    }
}
