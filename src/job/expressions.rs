//! Condition expressions for steps
//!
//! Supports:
//! - job status functions: `always()`, `succeeded()`, `succeededOrFailed()`,
//!   `failed()`, `canceled()`
//! - logic: `and(...)`, `or(...)`, `not(x)`
//! - comparisons: `eq`, `ne`, `contains`, `startsWith`, `endsWith`, `in`, `notIn`
//! - variables: `variables['Build.Reason']` or `variables.MyVar`
//! - literals: `'text'` (`''` escapes a quote), numbers, `true`, `false`
//!
//! String comparisons are case-insensitive.

use std::fmt;
use tracing::debug;

use super::context::Variables;
use crate::engine::result::TaskOutcome;

/// Condition used when a step declares none
pub const DEFAULT_CONDITION: &str = "succeeded()";

/// Errors that can occur during condition evaluation
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ExpressionError {
    #[error("Unexpected character '{ch}' at position {pos}")]
    UnexpectedCharacter { ch: char, pos: usize },

    #[error("Unterminated string literal starting at position {0}")]
    UnterminatedString(usize),

    #[error("Unexpected token '{found}' at position {pos}")]
    UnexpectedToken { found: String, pos: usize },

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Function '{name}' expects {expected} argument(s), got {found}")]
    WrongArgumentCount {
        name: String,
        expected: String,
        found: usize,
    },

    #[error("Invalid variable access: {0}")]
    InvalidVariableAccess(String),
}

/// What a condition can observe
#[derive(Debug, Clone, Copy)]
pub struct ConditionContext<'a> {
    pub job_result: Option<TaskOutcome>,
    pub variables: &'a Variables,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionResult {
    pub value: bool,
    /// Evaluation trace for the step log; empty when evaluated for host
    /// tracing only
    pub trace: String,
}

/// Evaluates step conditions
pub trait ExpressionManager: Send + Sync {
    fn evaluate(
        &self,
        ctx: &ConditionContext<'_>,
        condition: &str,
        host_tracing_only: bool,
    ) -> Result<ConditionResult, ExpressionError>;
}

/// Built-in condition language
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionExpressionManager;

impl ExpressionManager for ConditionExpressionManager {
    fn evaluate(
        &self,
        ctx: &ConditionContext<'_>,
        condition: &str,
        host_tracing_only: bool,
    ) -> Result<ConditionResult, ExpressionError> {
        let condition = if condition.trim().is_empty() {
            DEFAULT_CONDITION
        } else {
            condition.trim()
        };

        let expr = parse(condition)?;
        let mut steps = Vec::new();
        let value = eval(&expr, ctx, &mut steps)?.is_truthy();

        let mut trace = format!("Evaluating: {}", condition);
        for step in &steps {
            trace.push_str("\n  ");
            trace.push_str(step);
        }
        trace.push_str(&format!("\nResult: {}", value));
        debug!(condition, value, "Condition evaluated");

        Ok(ConditionResult {
            value,
            trace: if host_tracing_only { String::new() } else { trace },
        })
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Str(String),
    Num(f64),
    Ident(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::LBracket => f.write_str("["),
            Token::RBracket => f.write_str("]"),
            Token::Comma => f.write_str(","),
            Token::Dot => f.write_str("."),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::Num(n) => write!(f, "{}", n),
            Token::Ident(s) => f.write_str(s),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((Token::LParen, i));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, i));
                i += 1;
            }
            '[' => {
                tokens.push((Token::LBracket, i));
                i += 1;
            }
            ']' => {
                tokens.push((Token::RBracket, i));
                i += 1;
            }
            ',' => {
                tokens.push((Token::Comma, i));
                i += 1;
            }
            '.' => {
                tokens.push((Token::Dot, i));
                i += 1;
            }
            '\'' => {
                let start = i;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExpressionError::UnterminatedString(start)),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((Token::Str(value), start));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::UnexpectedToken {
                        found: text.clone(),
                        pos: start,
                    })?;
                tokens.push((Token::Num(num), start));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '-') {
                    i += 1;
                }
                tokens.push((Token::Ident(chars[start..i].iter().collect()), start));
            }
            ch => return Err(ExpressionError::UnexpectedCharacter { ch, pos: i }),
        }
    }

    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Variable(String),
    Call { name: String, args: Vec<Expr> },
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

fn parse(input: &str) -> Result<Expr, ExpressionError> {
    let mut parser = Parser {
        tokens: tokenize(input)?,
        pos: 0,
    };
    let expr = parser.expression()?;
    if let Some((token, pos)) = parser.tokens.get(parser.pos) {
        return Err(ExpressionError::UnexpectedToken {
            found: token.to_string(),
            pos: *pos,
        });
    }
    Ok(expr)
}

impl Parser {
    fn next(&mut self) -> Result<(Token, usize), ExpressionError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ExpressionError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        let (token, pos) = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(ExpressionError::UnexpectedToken {
                found: token.to_string(),
                pos,
            })
        }
    }

    fn expression(&mut self) -> Result<Expr, ExpressionError> {
        let (token, pos) = self.next()?;
        match token {
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::Num(n) => Ok(Expr::Literal(Value::Num(n))),
            Token::Ident(ident) if ident.eq_ignore_ascii_case("true") => {
                Ok(Expr::Literal(Value::Bool(true)))
            }
            Token::Ident(ident) if ident.eq_ignore_ascii_case("false") => {
                Ok(Expr::Literal(Value::Bool(false)))
            }
            Token::Ident(ident) if ident.eq_ignore_ascii_case("variables") => self.variable(),
            Token::Ident(name) => {
                self.expect(Token::LParen)?;
                let mut args = Vec::new();
                if self.peek() == Some(&Token::RParen) {
                    self.pos += 1;
                    return Ok(Expr::Call { name, args });
                }
                loop {
                    args.push(self.expression()?);
                    let (token, pos) = self.next()?;
                    match token {
                        Token::Comma => continue,
                        Token::RParen => break,
                        other => {
                            return Err(ExpressionError::UnexpectedToken {
                                found: other.to_string(),
                                pos,
                            })
                        }
                    }
                }
                Ok(Expr::Call { name, args })
            }
            other => Err(ExpressionError::UnexpectedToken {
                found: other.to_string(),
                pos,
            }),
        }
    }

    fn variable(&mut self) -> Result<Expr, ExpressionError> {
        let (token, pos) = self.next()?;
        match token {
            Token::LBracket => {
                let (name, _) = self.next()?;
                let Token::Str(name) = name else {
                    return Err(ExpressionError::InvalidVariableAccess(format!(
                        "expected a quoted name after 'variables[' at position {}",
                        pos
                    )));
                };
                self.expect(Token::RBracket)?;
                Ok(Expr::Variable(name))
            }
            Token::Dot => {
                let mut segments = Vec::new();
                loop {
                    let (token, pos) = self.next()?;
                    let Token::Ident(segment) = token else {
                        return Err(ExpressionError::InvalidVariableAccess(format!(
                            "expected a name at position {}",
                            pos
                        )));
                    };
                    segments.push(segment);
                    if self.peek() == Some(&Token::Dot) {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                Ok(Expr::Variable(segments.join(".")))
            }
            other => Err(ExpressionError::InvalidVariableAccess(format!(
                "unexpected '{}' after 'variables' at position {}",
                other, pos
            ))),
        }
    }
}

// ============================================================================
// Evaluation
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl Value {
    fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
        }
    }

    fn as_string(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Num(n) if n.fract() == 0.0 => format!("{}", *n as i64),
            Value::Num(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Str(s) => s.trim().parse().ok(),
            Value::Bool(_) => None,
        }
    }

    fn loosely_equals(&self, other: &Value) -> bool {
        if let (Value::Bool(a), Value::Bool(b)) = (self, other) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a == b;
        }
        self.as_string().to_lowercase() == other.as_string().to_lowercase()
    }
}

fn arity(name: &str, args: &[Expr], min: usize, max: Option<usize>) -> Result<(), ExpressionError> {
    let ok = args.len() >= min && max.is_none_or(|m| args.len() <= m);
    if ok {
        return Ok(());
    }
    let expected = match max {
        Some(m) if m == min => m.to_string(),
        Some(m) => format!("{}..{}", min, m),
        None => format!("at least {}", min),
    };
    Err(ExpressionError::WrongArgumentCount {
        name: name.to_string(),
        expected,
        found: args.len(),
    })
}

fn eval(
    expr: &Expr,
    ctx: &ConditionContext<'_>,
    trace: &mut Vec<String>,
) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Variable(name) => Ok(Value::Str(
            ctx.variables.get(name).unwrap_or_default().to_string(),
        )),
        Expr::Call { name, args } => {
            let value = call(name, args, ctx, trace)?;
            trace.push(format!("{}(...) => {}", name, value.as_string()));
            Ok(value)
        }
    }
}

fn call(
    name: &str,
    args: &[Expr],
    ctx: &ConditionContext<'_>,
    trace: &mut Vec<String>,
) -> Result<Value, ExpressionError> {
    let lower = name.to_lowercase();
    let status = ctx.job_result;
    let value = match lower.as_str() {
        "always" => {
            arity(name, args, 0, Some(0))?;
            true
        }
        "succeeded" => {
            arity(name, args, 0, Some(0))?;
            status.is_none_or(TaskOutcome::is_success)
        }
        "succeededorfailed" => {
            arity(name, args, 0, Some(0))?;
            !matches!(status, Some(TaskOutcome::Canceled))
        }
        "failed" => {
            arity(name, args, 0, Some(0))?;
            matches!(status, Some(TaskOutcome::Failed))
        }
        "canceled" | "cancelled" => {
            arity(name, args, 0, Some(0))?;
            matches!(status, Some(TaskOutcome::Canceled))
        }
        "and" => {
            arity(name, args, 2, None)?;
            let mut result = true;
            for arg in args {
                if !eval(arg, ctx, trace)?.is_truthy() {
                    result = false;
                    break;
                }
            }
            result
        }
        "or" => {
            arity(name, args, 2, None)?;
            let mut result = false;
            for arg in args {
                if eval(arg, ctx, trace)?.is_truthy() {
                    result = true;
                    break;
                }
            }
            result
        }
        "not" => {
            arity(name, args, 1, Some(1))?;
            !eval(&args[0], ctx, trace)?.is_truthy()
        }
        "eq" | "ne" => {
            arity(name, args, 2, Some(2))?;
            let left = eval(&args[0], ctx, trace)?;
            let right = eval(&args[1], ctx, trace)?;
            left.loosely_equals(&right) == (lower == "eq")
        }
        "contains" | "startswith" | "endswith" => {
            arity(name, args, 2, Some(2))?;
            let haystack = eval(&args[0], ctx, trace)?.as_string().to_lowercase();
            let needle = eval(&args[1], ctx, trace)?.as_string().to_lowercase();
            match lower.as_str() {
                "contains" => haystack.contains(&needle),
                "startswith" => haystack.starts_with(&needle),
                _ => haystack.ends_with(&needle),
            }
        }
        "in" | "notin" => {
            arity(name, args, 2, None)?;
            let needle = eval(&args[0], ctx, trace)?;
            let mut found = false;
            for arg in &args[1..] {
                if needle.loosely_equals(&eval(arg, ctx, trace)?) {
                    found = true;
                    break;
                }
            }
            found == (lower == "in")
        }
        _ => return Err(ExpressionError::UnknownFunction(name.to_string())),
    };
    Ok(Value::Bool(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Variables {
        [("Build.Reason", "PullRequest"), ("agent.os", "Linux"), ("count", "3")]
            .into_iter()
            .collect()
    }

    fn check(condition: &str, job_result: Option<TaskOutcome>) -> Result<bool, ExpressionError> {
        let variables = vars();
        let ctx = ConditionContext {
            job_result,
            variables: &variables,
        };
        ConditionExpressionManager
            .evaluate(&ctx, condition, false)
            .map(|r| r.value)
    }

    #[test]
    fn test_status_functions() {
        assert!(check("succeeded()", None).unwrap());
        assert!(check("succeeded()", Some(TaskOutcome::SucceededWithIssues)).unwrap());
        assert!(!check("succeeded()", Some(TaskOutcome::Failed)).unwrap());
        assert!(!check("succeeded()", Some(TaskOutcome::Canceled)).unwrap());
        assert!(check("always()", Some(TaskOutcome::Canceled)).unwrap());
        assert!(check("failed()", Some(TaskOutcome::Failed)).unwrap());
        assert!(check("canceled()", Some(TaskOutcome::Canceled)).unwrap());
        assert!(check("succeededOrFailed()", Some(TaskOutcome::Failed)).unwrap());
        assert!(!check("succeededOrFailed()", Some(TaskOutcome::Canceled)).unwrap());
    }

    #[test]
    fn test_empty_condition_defaults_to_succeeded() {
        assert!(check("", None).unwrap());
        assert!(!check("  ", Some(TaskOutcome::Canceled)).unwrap());
    }

    #[test]
    fn test_variable_comparisons() {
        assert!(check("eq(variables['build.reason'], 'pullrequest')", None).unwrap());
        assert!(check("ne(variables.agent.os, 'Windows_NT')", None).unwrap());
        assert!(check("eq(variables.count, 3)", None).unwrap());
        assert!(check("contains(variables['Build.Reason'], 'request')", None).unwrap());
        assert!(check("startsWith(variables['agent.os'], 'lin')", None).unwrap());
        assert!(check("in(variables['agent.os'], 'Darwin', 'linux')", None).unwrap());
        assert!(check("notIn(variables['agent.os'], 'Darwin')", None).unwrap());
        assert!(!check("eq(variables['missing'], 'x')", None).unwrap());
    }

    #[test]
    fn test_logic() {
        assert!(check("and(succeeded(), eq(variables['agent.os'], 'Linux'))", None).unwrap());
        assert!(!check("and(succeeded(), not(true))", None).unwrap());
        assert!(check("or(failed(), eq('a', 'A'))", None).unwrap());
        assert!(check("eq('it''s', 'IT''S')", None).unwrap());
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            check("bogus()", None),
            Err(ExpressionError::UnknownFunction("bogus".into()))
        );
        assert!(matches!(
            check("eq('a')", None),
            Err(ExpressionError::WrongArgumentCount { .. })
        ));
        assert!(matches!(check("eq('a', 'b'", None), Err(ExpressionError::UnexpectedEnd)));
        assert!(matches!(
            check("'open", None),
            Err(ExpressionError::UnterminatedString(0))
        ));
        assert!(matches!(
            check("succeeded() extra", None),
            Err(ExpressionError::UnexpectedToken { .. })
        ));
    }

    #[test]
    fn test_host_tracing_only_has_no_trace() {
        let variables = vars();
        let ctx = ConditionContext {
            job_result: None,
            variables: &variables,
        };
        let traced = ConditionExpressionManager.evaluate(&ctx, "always()", false).unwrap();
        assert!(traced.trace.contains("Result: true"));
        let silent = ConditionExpressionManager.evaluate(&ctx, "always()", true).unwrap();
        assert!(silent.trace.is_empty());
    }
}
