//! Protocols: named, prioritized bundles of constraints.
//!
//! A protocol can only narrow the base-constraint floor. Validation against
//! the floor happens when a protocol is registered and again on demand;
//! the store keeps a resolver cache of active protocols per context that is
//! invalidated on every mutation, since a mutation mid-evaluation is not
//! assumed atomic.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use super::constraints::{BaseConstraints, Constraint, ConstraintRule, Severity};
use super::matcher;

/// How a protocol's violations are acted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementPolicy {
    /// Inactive protocols are stored but never evaluated.
    pub active: bool,
    /// Violations at or above this severity block a spawn.
    pub blocking_severity: Severity,
}

impl Default for EnforcementPolicy {
    fn default() -> Self {
        Self {
            active: true,
            blocking_severity: Severity::Error,
        }
    }
}

/// A named, versioned, prioritized bundle of constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub enforcement: EnforcementPolicy,
    /// Higher priority protocols are evaluated first.
    #[serde(default)]
    pub priority: u32,
    /// Contexts (actions or feature ids) this protocol applies to.
    /// Empty means all contexts.
    #[serde(default)]
    pub applicable_contexts: Vec<String>,
}

impl Protocol {
    pub fn applies_to(&self, context: &str) -> bool {
        self.applicable_contexts.is_empty()
            || self.applicable_contexts.iter().any(|c| c == context)
    }
}

/// Why a protocol fails validation against the floor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseViolationKind {
    ProhibitedTool,
    ExceedsMaxAllowedTools,
    ProhibitedPath,
    ExceedsMaxAllowedPaths,
    ProhibitedOperation,
    DisablesRequiredValidation,
    DisablesAuditLog,
}

/// One way a protocol tried to widen the floor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseViolation {
    pub kind: BaseViolationKind,
    pub constraint_id: String,
    pub detail: String,
}

/// Result of validating a protocol against the base constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolValidation {
    pub is_valid: bool,
    pub violations: Vec<BaseViolation>,
    /// Non-blocking advisories about protocol hygiene.
    pub warnings: Vec<String>,
}

/// Check that a protocol only narrows the floor.
pub fn validate_protocol_against_base(
    protocol: &Protocol,
    base: &BaseConstraints,
) -> ProtocolValidation {
    let mut violations = Vec::new();
    let mut warnings = Vec::new();

    for constraint in &protocol.constraints {
        match &constraint.rule {
            ConstraintRule::ToolRestriction { allowed_tools, .. } => {
                if let Some(allowed) = allowed_tools {
                    for tool in allowed {
                        if base
                            .prohibited_tools()
                            .iter()
                            .any(|p| matcher::tool_matches(p, tool))
                        {
                            violations.push(BaseViolation {
                                kind: BaseViolationKind::ProhibitedTool,
                                constraint_id: constraint.id.clone(),
                                detail: format!("allows base-prohibited tool '{}'", tool),
                            });
                        } else if !base.max_allowed_tools().contains(tool) {
                            violations.push(BaseViolation {
                                kind: BaseViolationKind::ExceedsMaxAllowedTools,
                                constraint_id: constraint.id.clone(),
                                detail: format!(
                                    "allows tool '{}' outside the base maximum set",
                                    tool
                                ),
                            });
                        }
                    }
                    if allowed.len() > 5 {
                        warnings.push(format!(
                            "constraint '{}' allows {} tools; consider tightening",
                            constraint.id,
                            allowed.len()
                        ));
                    }
                }
            }
            ConstraintRule::FileAccess {
                allowed_paths,
                prohibited_paths,
            } => {
                if let Some(allowed) = allowed_paths {
                    for path in allowed {
                        if base
                            .prohibited_paths()
                            .iter()
                            .any(|p| matcher::path_matches(p, path) || p == path)
                        {
                            violations.push(BaseViolation {
                                kind: BaseViolationKind::ProhibitedPath,
                                constraint_id: constraint.id.clone(),
                                detail: format!("allows base-prohibited path '{}'", path),
                            });
                        } else if !base
                            .max_allowed_paths()
                            .iter()
                            .any(|p| matcher::path_matches(p, path) || p == path)
                        {
                            violations.push(BaseViolation {
                                kind: BaseViolationKind::ExceedsMaxAllowedPaths,
                                constraint_id: constraint.id.clone(),
                                detail: format!(
                                    "allows path '{}' outside the base maximum set",
                                    path
                                ),
                            });
                        }
                    }
                }
                for pattern in prohibited_paths
                    .iter()
                    .chain(allowed_paths.iter().flatten())
                {
                    if pattern == "*" || pattern.contains("**") {
                        warnings.push(format!(
                            "constraint '{}' uses wildcard pattern '{}'",
                            constraint.id, pattern
                        ));
                    }
                }
            }
            ConstraintRule::SideEffect {
                allowed_commands, ..
            } => {
                if let Some(commands) = allowed_commands {
                    for command in commands {
                        if let Some(op) = base
                            .prohibited_operations()
                            .iter()
                            .find(|op| matcher::operation_matches(op, command))
                        {
                            violations.push(BaseViolation {
                                kind: BaseViolationKind::ProhibitedOperation,
                                constraint_id: constraint.id.clone(),
                                detail: format!(
                                    "allows command containing prohibited operation '{}'",
                                    op
                                ),
                            });
                        }
                    }
                }
            }
            ConstraintRule::Behavioral {
                require_pre_validation,
                require_post_validation,
                require_audit_log,
                ..
            } => {
                if base.require_pre_validation() && *require_pre_validation == Some(false) {
                    violations.push(BaseViolation {
                        kind: BaseViolationKind::DisablesRequiredValidation,
                        constraint_id: constraint.id.clone(),
                        detail: "disables mandatory pre-validation".to_string(),
                    });
                }
                if base.require_post_validation() && *require_post_validation == Some(false) {
                    violations.push(BaseViolation {
                        kind: BaseViolationKind::DisablesRequiredValidation,
                        constraint_id: constraint.id.clone(),
                        detail: "disables mandatory post-validation".to_string(),
                    });
                }
                if base.require_audit_log() && *require_audit_log == Some(false) {
                    violations.push(BaseViolation {
                        kind: BaseViolationKind::DisablesAuditLog,
                        constraint_id: constraint.id.clone(),
                        detail: "disables mandatory audit logging".to_string(),
                    });
                }
            }
        }

        // Info severity on anything but behavioral limits is usually a
        // misconfiguration: the violation would never surface.
        if constraint.severity == Severity::Info
            && !matches!(constraint.rule, ConstraintRule::Behavioral { .. })
        {
            warnings.push(format!(
                "constraint '{}' is {} but only info severity",
                constraint.id,
                constraint.rule.kind()
            ));
        }
    }

    ProtocolValidation {
        is_valid: violations.is_empty(),
        violations,
        warnings,
    }
}

/// In-memory protocol store with a per-context resolver cache.
#[derive(Debug, Default)]
pub struct ProtocolStore {
    protocols: RwLock<HashMap<String, Protocol>>,
    /// context → active protocols sorted by priority, rebuilt lazily.
    resolver_cache: RwLock<HashMap<String, Vec<Protocol>>>,
}

impl ProtocolStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a protocol. Invalidates the resolver cache.
    pub fn upsert(&self, protocol: Protocol) {
        self.protocols
            .write()
            .expect("protocol store lock poisoned")
            .insert(protocol.id.clone(), protocol);
        self.invalidate_cache();
    }

    /// Remove a protocol. Idempotent; invalidates the resolver cache.
    pub fn remove(&self, id: &str) -> Option<Protocol> {
        let removed = self
            .protocols
            .write()
            .expect("protocol store lock poisoned")
            .remove(id);
        self.invalidate_cache();
        removed
    }

    pub fn get(&self, id: &str) -> Option<Protocol> {
        self.protocols
            .read()
            .expect("protocol store lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.protocols
            .read()
            .expect("protocol store lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Active protocols applicable to `context`, highest priority first.
    pub fn resolve(&self, context: &str) -> Vec<Protocol> {
        if let Some(cached) = self
            .resolver_cache
            .read()
            .expect("resolver cache lock poisoned")
            .get(context)
        {
            return cached.clone();
        }

        let mut applicable: Vec<Protocol> = self
            .protocols
            .read()
            .expect("protocol store lock poisoned")
            .values()
            .filter(|p| p.enforcement.active && p.applies_to(context))
            .cloned()
            .collect();
        applicable.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        self.resolver_cache
            .write()
            .expect("resolver cache lock poisoned")
            .insert(context.to_string(), applicable.clone());
        applicable
    }

    fn invalidate_cache(&self) {
        self.resolver_cache
            .write()
            .expect("resolver cache lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_allow_protocol(id: &str, allowed: &[&str]) -> Protocol {
        Protocol {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            constraints: vec![Constraint {
                id: format!("{}-tools", id),
                rule: ConstraintRule::ToolRestriction {
                    prohibited_tools: Vec::new(),
                    allowed_tools: Some(allowed.iter().map(|s| s.to_string()).collect()),
                },
                severity: Severity::Error,
                message: "tool allow-list".to_string(),
                remediation: None,
            }],
            enforcement: EnforcementPolicy::default(),
            priority: 0,
            applicable_contexts: Vec::new(),
        }
    }

    #[test]
    fn allowing_prohibited_tool_is_invalid() {
        let protocol = tool_allow_protocol("p1", &["sudo"]);
        let result = validate_protocol_against_base(&protocol, &BaseConstraints::default());
        assert!(!result.is_valid);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].kind, BaseViolationKind::ProhibitedTool);
    }

    #[test]
    fn allowing_tool_outside_max_set_is_invalid() {
        let protocol = tool_allow_protocol("p1", &["Read", "TurboDeploy"]);
        let result = validate_protocol_against_base(&protocol, &BaseConstraints::default());
        assert!(!result.is_valid);
        assert_eq!(
            result.violations[0].kind,
            BaseViolationKind::ExceedsMaxAllowedTools
        );
    }

    #[test]
    fn narrow_protocol_is_valid() {
        let protocol = tool_allow_protocol("p1", &["Read", "Grep"]);
        let result = validate_protocol_against_base(&protocol, &BaseConstraints::default());
        assert!(result.is_valid);
        assert!(result.violations.is_empty());
    }

    #[test]
    fn oversized_allow_list_warns_without_blocking() {
        let protocol =
            tool_allow_protocol("p1", &["Read", "Edit", "Write", "Bash", "Grep", "Glob"]);
        let result = validate_protocol_against_base(&protocol, &BaseConstraints::default());
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("6 tools")));
    }

    #[test]
    fn disabling_audit_log_is_invalid() {
        let protocol = Protocol {
            id: "p1".to_string(),
            name: "p1".to_string(),
            description: String::new(),
            constraints: vec![Constraint {
                id: "no-audit".to_string(),
                rule: ConstraintRule::Behavioral {
                    max_attempts: None,
                    require_pre_validation: None,
                    require_post_validation: None,
                    require_audit_log: Some(false),
                },
                severity: Severity::Warning,
                message: String::new(),
                remediation: None,
            }],
            enforcement: EnforcementPolicy::default(),
            priority: 0,
            applicable_contexts: Vec::new(),
        };
        let result = validate_protocol_against_base(&protocol, &BaseConstraints::default());
        assert!(!result.is_valid);
        assert_eq!(result.violations[0].kind, BaseViolationKind::DisablesAuditLog);
    }

    #[test]
    fn wildcard_paths_warn() {
        let protocol = Protocol {
            id: "p1".to_string(),
            name: "p1".to_string(),
            description: String::new(),
            constraints: vec![Constraint {
                id: "all-paths".to_string(),
                rule: ConstraintRule::FileAccess {
                    prohibited_paths: vec!["**".to_string()],
                    allowed_paths: None,
                },
                severity: Severity::Error,
                message: String::new(),
                remediation: None,
            }],
            enforcement: EnforcementPolicy::default(),
            priority: 0,
            applicable_contexts: Vec::new(),
        };
        let result = validate_protocol_against_base(&protocol, &BaseConstraints::default());
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("wildcard")));
    }

    #[test]
    fn info_severity_on_tool_rule_warns() {
        let mut protocol = tool_allow_protocol("p1", &["Read"]);
        protocol.constraints[0].severity = Severity::Info;
        let result = validate_protocol_against_base(&protocol, &BaseConstraints::default());
        assert!(result.warnings.iter().any(|w| w.contains("info severity")));
    }

    #[test]
    fn store_resolves_by_priority_and_activity() {
        let store = ProtocolStore::new();
        let mut low = tool_allow_protocol("low", &["Read"]);
        low.priority = 1;
        let mut high = tool_allow_protocol("high", &["Read"]);
        high.priority = 10;
        let mut inactive = tool_allow_protocol("off", &["Read"]);
        inactive.enforcement.active = false;

        store.upsert(low);
        store.upsert(high);
        store.upsert(inactive);

        let resolved = store.resolve("spawn_worker");
        let ids: Vec<&str> = resolved.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low"]);
    }

    #[test]
    fn store_mutation_invalidates_cache() {
        let store = ProtocolStore::new();
        store.upsert(tool_allow_protocol("p1", &["Read"]));
        assert_eq!(store.resolve("spawn_worker").len(), 1);

        store.remove("p1");
        assert!(store.resolve("spawn_worker").is_empty());

        store.upsert(tool_allow_protocol("p2", &["Grep"]));
        assert_eq!(store.resolve("spawn_worker").len(), 1);
    }

    #[test]
    fn context_scoping() {
        let store = ProtocolStore::new();
        let mut scoped = tool_allow_protocol("scoped", &["Read"]);
        scoped.applicable_contexts = vec!["review".to_string()];
        store.upsert(scoped);

        assert!(store.resolve("spawn_worker").is_empty());
        assert_eq!(store.resolve("review").len(), 1);
    }
}
