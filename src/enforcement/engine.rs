//! Pre-spawn admission control and continuous session monitoring.
//!
//! The engine owns the base-constraint floor, reads protocols from the
//! shared store, and keeps per-session monitoring state in a registry
//! scoped to this instance. Admission control fails closed: if evaluation
//! itself errors, the verdict is a block carrying a critical violation, not
//! a propagated exception.
//!
//! Activity parsing is a best-effort signal-extraction layer over agent
//! output whose format we do not control. Lines that match nothing are
//! ignored; a parse miss never raises an error.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::constraints::{BaseConstraints, ConstraintRule, Severity};
use super::matcher;
use super::protocol::{Protocol, ProtocolStore};
use crate::registry::Feature;

// Claude-style tool invocations: `Read(src/main.rs)`, `Bash(cargo test)`
static TOOL_INVOCATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*[⏺•>*-]?\s*(Read|Edit|MultiEdit|Write|Bash|Grep|Glob|Task|WebFetch|NotebookEdit)\(([^)]*)\)",
    )
    .unwrap()
});

// Fallback for agents that log `Using tool: X` / `Tool: X`
static TOOL_MENTION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^\s*(?:using tool|tool|invoking)[:\s]+(\w+)").unwrap());

static SHELL_LINE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\$\s+(.+)$").unwrap());

/// One typed action extracted from raw session output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentAction {
    ToolCall { name: String },
    FileOperation { tool: String, path: String },
    ShellCommand { command: String },
    GitOperation { command: String },
}

/// A violated constraint, with enough context for remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub protocol_id: String,
    pub constraint_id: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

/// Outcome of pre-spawn admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreSpawnVerdict {
    pub allowed: bool,
    pub violations: Vec<Violation>,
    /// Violations below the blocking threshold, reported but not blocking.
    pub warnings: Vec<Violation>,
}

impl PreSpawnVerdict {
    fn allowed() -> Self {
        Self {
            allowed: true,
            violations: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// The situation a policy decision is evaluated in.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub feature_id: String,
    pub action: String,
    pub attempt: u32,
    /// Tool allow-list the session would be granted.
    pub requested_tools: Vec<String>,
    /// Command line the session would run.
    pub command: String,
}

impl ExecutionContext {
    /// Context for spawning a worker for `feature`. The attempt count is
    /// the one the spawn would record, i.e. attempts so far plus one.
    pub fn spawn_worker(feature: &Feature, requested_tools: &[String], command: &str) -> Self {
        Self {
            feature_id: feature.id.clone(),
            action: "spawn_worker".to_string(),
            attempt: feature.attempts + 1,
            requested_tools: requested_tools.to_vec(),
            command: command.to_string(),
        }
    }
}

/// An alert raised by runtime monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementAlert {
    pub id: Uuid,
    pub session_id: String,
    pub severity: Severity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub acknowledged: bool,
}

/// Per-session monitoring state. Created by `start_monitoring`, discarded
/// by `stop_monitoring`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringState {
    pub feature_id: String,
    pub session_id: String,
    pub iteration_count: u64,
    pub warning_count: u64,
    pub tool_sequence: Vec<String>,
    pub file_sequence: Vec<String>,
    /// Detected behavioral patterns, e.g. `repeated_tool:Read`.
    pub patterns: Vec<String>,
    pub alerts: Vec<EnforcementAlert>,
}

/// Consecutive identical tool calls before a stuck-pattern is flagged.
const REPEATED_TOOL_THRESHOLD: usize = 5;
/// Operations on the same file before a thrash pattern is flagged.
const FILE_THRASH_THRESHOLD: usize = 4;

/// Constraint resolution, admission control and runtime monitoring.
pub struct EnforcementEngine {
    base: BaseConstraints,
    store: Arc<ProtocolStore>,
    monitoring: Mutex<HashMap<String, MonitoringState>>,
}

impl EnforcementEngine {
    pub fn new(base: BaseConstraints, store: Arc<ProtocolStore>) -> Self {
        Self {
            base,
            store,
            monitoring: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BaseConstraints::default(), Arc::new(ProtocolStore::new()))
    }

    pub fn base(&self) -> &BaseConstraints {
        &self.base
    }

    pub fn store(&self) -> &Arc<ProtocolStore> {
        &self.store
    }

    // -----------------------------------------------------------------
    // Admission control
    // -----------------------------------------------------------------

    /// Evaluate all active applicable protocols against a spawn context.
    ///
    /// Blocks when any violated constraint meets or exceeds its protocol's
    /// blocking severity. Any evaluation error fails closed: the verdict is
    /// a block with a critical violation describing the engine failure.
    pub fn validate_pre_spawn(&self, context: &ExecutionContext) -> PreSpawnVerdict {
        let mut verdict = PreSpawnVerdict::allowed();

        for protocol in self.applicable_protocols(context) {
            for constraint in &protocol.constraints {
                match self.evaluate_constraint(&protocol, constraint, context) {
                    Ok(Some(violation)) => {
                        if violation.severity >= protocol.enforcement.blocking_severity {
                            verdict.allowed = false;
                            verdict.violations.push(violation);
                        } else {
                            verdict.warnings.push(violation);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // Fail closed: an engine error is indistinguishable
                        // from an unsafe state.
                        warn!(
                            protocol = %protocol.id,
                            constraint = %constraint.id,
                            error = %e,
                            "constraint evaluation failed, blocking spawn"
                        );
                        verdict.allowed = false;
                        verdict.violations.push(Violation {
                            protocol_id: protocol.id.clone(),
                            constraint_id: constraint.id.clone(),
                            severity: Severity::Critical,
                            message: format!("constraint evaluation failed: {}", e),
                            remediation: Some(
                                "fix the protocol definition before retrying".to_string(),
                            ),
                        });
                    }
                }
            }
        }

        verdict
    }

    fn applicable_protocols(&self, context: &ExecutionContext) -> Vec<Protocol> {
        let mut protocols = self.store.resolve(&context.action);
        for protocol in self.store.resolve(&context.feature_id) {
            if !protocols.iter().any(|p| p.id == protocol.id) {
                protocols.push(protocol);
            }
        }
        protocols
    }

    fn evaluate_constraint(
        &self,
        protocol: &Protocol,
        constraint: &super::constraints::Constraint,
        context: &ExecutionContext,
    ) -> anyhow::Result<Option<Violation>> {
        let violation = |message: String| {
            Some(Violation {
                protocol_id: protocol.id.clone(),
                constraint_id: constraint.id.clone(),
                severity: constraint.severity,
                message,
                remediation: constraint.remediation.clone(),
            })
        };

        let result = match &constraint.rule {
            ConstraintRule::ToolRestriction {
                prohibited_tools,
                allowed_tools,
            } => {
                let mut hit = None;
                for tool in &context.requested_tools {
                    if prohibited_tools
                        .iter()
                        .chain(self.base.prohibited_tools().iter())
                        .any(|p| matcher::tool_matches(p, tool))
                    {
                        hit = violation(format!("requested tool '{}' is prohibited", tool));
                        break;
                    }
                    if let Some(allowed) = allowed_tools {
                        if !allowed.iter().any(|a| matcher::tool_matches(a, tool)) {
                            hit = violation(format!(
                                "requested tool '{}' is outside the allow-list",
                                tool
                            ));
                            break;
                        }
                    }
                }
                hit
            }
            // File access cannot be judged before the worker touches
            // anything; it is enforced by runtime monitoring instead.
            ConstraintRule::FileAccess { .. } => None,
            ConstraintRule::SideEffect {
                prohibited_operations,
                ..
            } => prohibited_operations
                .iter()
                .chain(self.base.prohibited_operations().iter())
                .find(|op| matcher::operation_matches(op, &context.command))
                .and_then(|op| {
                    violation(format!("spawn command contains prohibited operation '{}'", op))
                }),
            ConstraintRule::Behavioral { max_attempts, .. } => match max_attempts {
                Some(max) if context.attempt > *max => violation(format!(
                    "attempt {} exceeds the protocol limit of {}",
                    context.attempt, max
                )),
                _ => None,
            },
        };

        Ok(result)
    }

    // -----------------------------------------------------------------
    // Runtime monitoring
    // -----------------------------------------------------------------

    /// Open monitoring state for a session. Replaces any previous state
    /// under the same session id.
    pub fn start_monitoring(&self, feature_id: &str, session_id: &str) {
        let state = MonitoringState {
            feature_id: feature_id.to_string(),
            session_id: session_id.to_string(),
            ..Default::default()
        };
        self.monitoring
            .lock()
            .expect("monitoring lock poisoned")
            .insert(session_id.to_string(), state);
        debug!(session = session_id, feature = feature_id, "monitoring started");
    }

    /// Parse raw session output into typed actions and feed each through
    /// the engine. Unknown sessions are ignored.
    pub fn record_activity(&self, session_id: &str, raw_output: &str) {
        let actions = parse_actions(raw_output);
        if actions.is_empty() {
            return;
        }

        let mut monitoring = self.monitoring.lock().expect("monitoring lock poisoned");
        let Some(state) = monitoring.get_mut(session_id) else {
            return;
        };

        for action in actions {
            state.iteration_count += 1;
            Self::apply_action(&self.base, &self.store, state, &action);
        }
    }

    fn apply_action(
        base: &BaseConstraints,
        store: &ProtocolStore,
        state: &mut MonitoringState,
        action: &AgentAction,
    ) {
        match action {
            AgentAction::ToolCall { name } => {
                state.tool_sequence.push(name.clone());
                if base
                    .prohibited_tools()
                    .iter()
                    .any(|p| matcher::tool_matches(p, name))
                {
                    Self::raise(state, Severity::Critical, format!(
                        "prohibited tool '{}' invoked",
                        name
                    ));
                } else if !base.max_allowed_tools().contains(name) {
                    Self::raise(state, Severity::Warning, format!(
                        "tool '{}' outside the maximum allowed set",
                        name
                    ));
                }
                Self::detect_repeated_tool(state);
            }
            AgentAction::FileOperation { tool, path } => {
                state.tool_sequence.push(tool.clone());
                state.file_sequence.push(path.clone());
                let prohibited = base
                    .prohibited_paths()
                    .iter()
                    .chain(Self::protocol_prohibited_paths(store, &state.feature_id).iter())
                    .any(|p| matcher::path_matches(p, path));
                if prohibited {
                    Self::raise(state, Severity::Critical, format!(
                        "prohibited path '{}' touched via {}",
                        path, tool
                    ));
                }
                Self::detect_file_thrash(state);
                Self::detect_repeated_tool(state);
            }
            AgentAction::ShellCommand { command } | AgentAction::GitOperation { command } => {
                state.tool_sequence.push("Bash".to_string());
                if let Some(op) = base
                    .prohibited_operations()
                    .iter()
                    .find(|op| matcher::operation_matches(op, command))
                {
                    Self::raise(state, Severity::Critical, format!(
                        "shell command contains prohibited operation '{}'",
                        op
                    ));
                }
                if base
                    .prohibited_tools()
                    .iter()
                    .any(|p| matcher::tool_matches(p, command))
                {
                    Self::raise(state, Severity::Critical, format!(
                        "shell command invokes a prohibited tool: {}",
                        command
                    ));
                }
            }
        }
    }

    fn protocol_prohibited_paths(store: &ProtocolStore, feature_id: &str) -> Vec<String> {
        store
            .resolve(feature_id)
            .iter()
            .flat_map(|p| p.constraints.iter())
            .filter_map(|c| match &c.rule {
                ConstraintRule::FileAccess {
                    prohibited_paths, ..
                } => Some(prohibited_paths.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn detect_repeated_tool(state: &mut MonitoringState) {
        let run_length = state
            .tool_sequence
            .iter()
            .rev()
            .take_while(|t| Some(*t) == state.tool_sequence.last())
            .count();
        if run_length == REPEATED_TOOL_THRESHOLD {
            let tool = state.tool_sequence.last().cloned().unwrap_or_default();
            let pattern = format!("repeated_tool:{}", tool);
            if !state.patterns.contains(&pattern) {
                state.patterns.push(pattern);
                Self::raise(state, Severity::Warning, format!(
                    "tool '{}' invoked {} times in a row",
                    tool, REPEATED_TOOL_THRESHOLD
                ));
            }
        }
    }

    fn detect_file_thrash(state: &mut MonitoringState) {
        let Some(path) = state.file_sequence.last().cloned() else {
            return;
        };
        let touches = state.file_sequence.iter().filter(|p| **p == path).count();
        if touches == FILE_THRASH_THRESHOLD {
            let pattern = format!("file_thrash:{}", path);
            if !state.patterns.contains(&pattern) {
                state.patterns.push(pattern);
                Self::raise(state, Severity::Warning, format!(
                    "file '{}' touched {} times this session",
                    path, FILE_THRASH_THRESHOLD
                ));
            }
        }
    }

    fn raise(state: &mut MonitoringState, severity: Severity, message: String) {
        if severity >= Severity::Warning {
            state.warning_count += 1;
        }
        state.alerts.push(EnforcementAlert {
            id: Uuid::new_v4(),
            session_id: state.session_id.clone(),
            severity,
            message,
            raised_at: Utc::now(),
            acknowledged: false,
        });
    }

    /// Return newly raised alerts, marking them acknowledged so a second
    /// call does not repeat them.
    pub fn check_alerts(&self, session_id: &str) -> Vec<EnforcementAlert> {
        let mut monitoring = self.monitoring.lock().expect("monitoring lock poisoned");
        let Some(state) = monitoring.get_mut(session_id) else {
            return Vec::new();
        };
        let mut fresh = Vec::new();
        for alert in state.alerts.iter_mut().filter(|a| !a.acknowledged) {
            alert.acknowledged = true;
            fresh.push(alert.clone());
        }
        fresh
    }

    /// Finalize and discard a session's monitoring state.
    pub fn stop_monitoring(&self, session_id: &str) -> Option<MonitoringState> {
        let state = self
            .monitoring
            .lock()
            .expect("monitoring lock poisoned")
            .remove(session_id);
        if let Some(ref s) = state {
            debug!(
                session = session_id,
                iterations = s.iteration_count,
                warnings = s.warning_count,
                "monitoring stopped"
            );
        }
        state
    }

    /// Snapshot of a session's monitoring state, if any.
    pub fn monitoring_state(&self, session_id: &str) -> Option<MonitoringState> {
        self.monitoring
            .lock()
            .expect("monitoring lock poisoned")
            .get(session_id)
            .cloned()
    }
}

/// Best-effort extraction of typed actions from raw agent output.
pub fn parse_actions(raw: &str) -> Vec<AgentAction> {
    let mut actions = Vec::new();

    for cap in TOOL_INVOCATION_REGEX.captures_iter(raw) {
        let tool = cap[1].to_string();
        let arg = cap[2].trim().to_string();
        match tool.as_str() {
            "Bash" => {
                if arg.trim_start().starts_with("git ") {
                    actions.push(AgentAction::GitOperation { command: arg });
                } else {
                    actions.push(AgentAction::ShellCommand { command: arg });
                }
            }
            "Read" | "Edit" | "MultiEdit" | "Write" | "NotebookEdit" if !arg.is_empty() => {
                actions.push(AgentAction::FileOperation { tool, path: arg });
            }
            _ => actions.push(AgentAction::ToolCall { name: tool }),
        }
    }

    for cap in TOOL_MENTION_REGEX.captures_iter(raw) {
        actions.push(AgentAction::ToolCall {
            name: cap[1].to_string(),
        });
    }

    for cap in SHELL_LINE_REGEX.captures_iter(raw) {
        let command = cap[1].trim().to_string();
        if command.starts_with("git ") {
            actions.push(AgentAction::GitOperation { command });
        } else {
            actions.push(AgentAction::ShellCommand { command });
        }
    }

    actions
}
