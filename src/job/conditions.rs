//! Simple variable predicates and the step condition type
//!
//! A predicate list is checked in order and stops at the first predicate
//! that does not hold.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::context::Variables;
use super::expressions::{
    ConditionContext, ConditionResult, ExpressionError, ExpressionManager, DEFAULT_CONDITION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    DoesNotContain,
}

/// `variable <operator> value`, compared case-insensitively
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableCondition {
    pub variable: String,
    pub operator: ConditionOperator,
    pub value: String,
}

impl VariableCondition {
    pub fn new(variable: &str, operator: ConditionOperator, value: &str) -> Self {
        Self {
            variable: variable.to_string(),
            operator,
            value: value.to_string(),
        }
    }

    /// A missing variable satisfies `NotEquals`/`DoesNotContain` and fails
    /// `Equals`/`Contains`.
    pub fn is_satisfied(&self, vars: &Variables) -> bool {
        let expected = self.value.to_lowercase();
        match (self.operator, vars.get(&self.variable)) {
            (ConditionOperator::Equals, Some(v)) => v.to_lowercase() == expected,
            (ConditionOperator::Equals, None) => false,
            (ConditionOperator::NotEquals, Some(v)) => v.to_lowercase() != expected,
            (ConditionOperator::NotEquals, None) => true,
            (ConditionOperator::Contains, Some(v)) => v.to_lowercase().contains(&expected),
            (ConditionOperator::Contains, None) => false,
            (ConditionOperator::DoesNotContain, Some(v)) => !v.to_lowercase().contains(&expected),
            (ConditionOperator::DoesNotContain, None) => true,
        }
    }

    fn describe(&self, vars: &Variables) -> String {
        match vars.get(&self.variable) {
            Some(actual) => format!(
                "'{}' {:?} '{}' is not satisfied (actual value: '{}')",
                self.variable, self.operator, self.value, actual
            ),
            None => format!(
                "'{}' {:?} '{}' is not satisfied (variable is not set)",
                self.variable, self.operator, self.value
            ),
        }
    }
}

/// Check predicates in order, returning false at the first unsatisfied one.
/// The reason is passed to `log`.
pub fn are_conditions_satisfied(
    conditions: &[VariableCondition],
    vars: &Variables,
    mut log: impl FnMut(&str),
) -> bool {
    for condition in conditions {
        if !condition.is_satisfied(vars) {
            let reason = condition.describe(vars);
            debug!(variable = %condition.variable, "{}", reason);
            log(&reason);
            return false;
        }
    }
    true
}

/// Gate that decides whether a step runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCondition {
    Expression(String),
    /// Predicates are additionally gated on `succeeded()`
    Predicates(Vec<VariableCondition>),
}

impl Default for StepCondition {
    fn default() -> Self {
        StepCondition::Expression(DEFAULT_CONDITION.to_string())
    }
}

impl StepCondition {
    pub fn always() -> Self {
        StepCondition::Expression("always()".to_string())
    }

    pub fn evaluate(
        &self,
        manager: &dyn ExpressionManager,
        ctx: &ConditionContext<'_>,
        host_tracing_only: bool,
    ) -> Result<ConditionResult, ExpressionError> {
        match self {
            StepCondition::Expression(expr) => manager.evaluate(ctx, expr, host_tracing_only),
            StepCondition::Predicates(predicates) => {
                let status = manager.evaluate(ctx, DEFAULT_CONDITION, host_tracing_only)?;
                if !status.value {
                    return Ok(status);
                }
                let mut trace = status.trace;
                let value = are_conditions_satisfied(predicates, ctx.variables, |reason| {
                    if !host_tracing_only {
                        if !trace.is_empty() {
                            trace.push('\n');
                        }
                        trace.push_str(reason);
                    }
                });
                Ok(ConditionResult { value, trace })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::result::TaskOutcome;
    use crate::job::expressions::ConditionExpressionManager;
    use ConditionOperator::*;

    fn vars() -> Variables {
        [("Build.SourceBranch", "refs/heads/Main"), ("system.debug", "true")]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_missing_variable_semantics() {
        let vars = vars();
        assert!(!VariableCondition::new("missing", Equals, "x").is_satisfied(&vars));
        assert!(VariableCondition::new("missing", NotEquals, "x").is_satisfied(&vars));
        assert!(!VariableCondition::new("missing", Contains, "x").is_satisfied(&vars));
        assert!(VariableCondition::new("missing", DoesNotContain, "x").is_satisfied(&vars));
    }

    #[test]
    fn test_case_insensitive_operators() {
        let vars = vars();
        assert!(VariableCondition::new("build.sourcebranch", Equals, "REFS/HEADS/MAIN").is_satisfied(&vars));
        assert!(!VariableCondition::new("build.sourcebranch", NotEquals, "refs/heads/main").is_satisfied(&vars));
        assert!(VariableCondition::new("build.sourcebranch", Contains, "HEADS").is_satisfied(&vars));
        assert!(!VariableCondition::new("build.sourcebranch", DoesNotContain, "main").is_satisfied(&vars));
    }

    #[test]
    fn test_short_circuits_on_first_failure() {
        let vars = vars();
        let conditions = vec![
            VariableCondition::new("system.debug", Equals, "true"),
            VariableCondition::new("missing", Equals, "x"),
            VariableCondition::new("also.missing", Equals, "y"),
        ];
        let mut reasons = Vec::new();
        let ok = are_conditions_satisfied(&conditions, &vars, |r| reasons.push(r.to_string()));
        assert!(!ok);
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("missing"));
        assert!(reasons[0].contains("not set"));
    }

    #[test]
    fn test_predicates_gated_on_job_status() {
        let vars = vars();
        let condition = StepCondition::Predicates(vec![VariableCondition::new(
            "system.debug",
            Equals,
            "true",
        )]);
        let running = ConditionContext {
            job_result: None,
            variables: &vars,
        };
        assert!(condition.evaluate(&ConditionExpressionManager, &running, false).unwrap().value);

        let canceled = ConditionContext {
            job_result: Some(TaskOutcome::Canceled),
            variables: &vars,
        };
        assert!(!condition.evaluate(&ConditionExpressionManager, &canceled, false).unwrap().value);
    }
}
