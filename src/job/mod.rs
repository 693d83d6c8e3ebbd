//! Job-side model
//!
//! - `context`: job and step execution contexts, variables, pending commands
//! - `expressions`: the condition language
//! - `conditions`: simple variable predicates and `StepCondition`
//! - `target`: execution targets and job containers
//! - `settings`: agent settings and feature flags
//! - `manifest`: YAML job manifests

pub mod conditions;
pub mod context;
pub mod expressions;
pub mod manifest;
pub mod settings;
pub mod target;

pub use conditions::{are_conditions_satisfied, ConditionOperator, StepCondition, VariableCondition};
pub use context::{ExecutionContext, LogLevel, LogLine, PendingCommand, StepLog, Variables};
pub use expressions::{
    ConditionContext, ConditionExpressionManager, ConditionResult, ExpressionError,
    ExpressionManager,
};
pub use manifest::{JobManifest, LoadError, StepSpec};
pub use settings::AgentSettings;
pub use target::{ContainerInfo, ExecutionTarget, Mount, TargetOs};
