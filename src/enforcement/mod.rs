//! Policy enforcement for worker sessions.
//!
//! Two halves share one constraint vocabulary:
//! - admission control: `EnforcementEngine::validate_pre_spawn` runs before
//!   any session is created and can refuse the spawn outright
//! - runtime monitoring: `start_monitoring` / `record_activity` /
//!   `check_alerts` watch a running session's raw output for violations
//!
//! Constraints compose restrictively on top of an immutable floor
//! ([`BaseConstraints`]): protocols may narrow what a worker can do, never
//! widen it.

pub mod constraints;
pub mod engine;
pub mod matcher;
pub mod protocol;

pub use constraints::{
    BaseConstraints, Constraint, ConstraintOverride, ConstraintRule, Severity,
};
pub use engine::{
    AgentAction, EnforcementAlert, EnforcementEngine, ExecutionContext, MonitoringState,
    PreSpawnVerdict, Violation, parse_actions,
};
pub use protocol::{
    BaseViolation, BaseViolationKind, EnforcementPolicy, Protocol, ProtocolStore,
    ProtocolValidation,
};
