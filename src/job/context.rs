//! Execution context for jobs and steps
//!
//! A job owns one `ExecutionContext`; every step gets a child context with
//! its own cancellation token, a copy of the job variables, a private log and
//! a link back to the job's pending-command list.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, LazyLock, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::error::StepError;
use crate::engine::result::{StepRecord, TaskOutcome};

static MACRO_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\(([A-Za-z0-9_.\-]+)\)").expect("valid macro regex"));

/// Passes over the variable table before giving up on nested references
const MAX_EXPANSION_DEPTH: usize = 10;

// ============================================================================
// Variables
// ============================================================================

#[derive(Debug, Clone)]
struct Variable {
    name: String,
    value: String,
    secret: bool,
}

/// Case-insensitive variable table
#[derive(Debug, Clone, Default)]
pub struct Variables {
    values: BTreeMap<String, Variable>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.insert(name, value.into(), false);
    }

    /// Set a variable that is never exported to step processes
    pub fn set_secret(&mut self, name: &str, value: impl Into<String>) {
        self.insert(name, value.into(), true);
    }

    fn insert(&mut self, name: &str, value: String, secret: bool) {
        self.values.insert(
            name.to_lowercase(),
            Variable {
                name: name.to_string(),
                value,
                secret,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(&name.to_lowercase())
            .map(|v| v.value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Replace every `$(name)` in `input`. Unknown names stay as written and
    /// produce a warning.
    pub fn expand(&self, input: &str) -> (String, Vec<String>) {
        let mut warnings = Vec::new();
        let expanded = MACRO_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let name = &caps[1];
                match self.get(name) {
                    Some(value) => value.to_string(),
                    None => {
                        warnings.push(format!(
                            "Variable '{}' is not defined; '$({})' was left unexpanded",
                            name, name
                        ));
                        caps[0].to_string()
                    }
                }
            })
            .into_owned();
        (expanded, warnings)
    }

    /// Expand values that reference other variables. Returns warnings for
    /// references that stay unresolved.
    pub fn expand_in_place(&mut self) -> Vec<String> {
        for _ in 0..MAX_EXPANSION_DEPTH {
            let snapshot = self.clone();
            let mut changed = false;
            for var in self.values.values_mut() {
                let (expanded, _) = snapshot.expand(&var.value);
                if expanded != var.value {
                    var.value = expanded;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut warnings = Vec::new();
        for var in self.values.values() {
            if MACRO_REGEX.is_match(&var.value) {
                let (_, unresolved) = self.expand(&var.value);
                if unresolved.is_empty() {
                    warnings.push(format!(
                        "Variable '{}' references itself and could not be fully expanded",
                        var.name
                    ));
                }
                warnings.extend(unresolved);
            }
        }
        warnings.sort();
        warnings.dedup();
        warnings
    }

    /// Non-secret variables as process environment: upper-cased, `.` → `_`
    pub fn to_environment(&self) -> BTreeMap<String, String> {
        self.values
            .values()
            .filter(|v| !v.secret)
            .map(|v| (v.name.replace('.', "_").to_uppercase(), v.value.clone()))
            .collect()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Variables {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut vars = Variables::new();
        for (k, v) in iter {
            vars.set(k.as_ref(), v);
        }
        vars
    }
}

// ============================================================================
// Log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Output,
    Debug,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// In-memory log of a job or step scope
#[derive(Debug, Default)]
pub struct StepLog {
    lines: Mutex<Vec<LogLine>>,
}

impl StepLog {
    fn push(&self, level: LogLevel, message: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.push(LogLine {
            level,
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

// ============================================================================
// Pending commands
// ============================================================================

type CommandList = Arc<Mutex<Vec<PendingCommand>>>;

/// A side task queued by a step that must finish before the step does
#[derive(Debug)]
pub struct PendingCommand {
    name: String,
    handle: JoinHandle<Result<(), StepError>>,
}

impl PendingCommand {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn wait(self) -> Result<(), StepError> {
        let result = self.handle.await;
        join_result(&self.name, result)
    }

    /// Wait for the command, aborting it if `token` fires first
    pub async fn wait_or_cancel(mut self, token: &CancellationToken) -> Result<(), StepError> {
        tokio::select! {
            result = &mut self.handle => join_result(&self.name, result),
            _ = token.cancelled() => {
                self.handle.abort();
                Err(StepError::Canceled)
            }
        }
    }
}

fn join_result(
    name: &str,
    result: Result<Result<(), StepError>, tokio::task::JoinError>,
) -> Result<(), StepError> {
    match result {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(StepError::Canceled),
        Err(e) => Err(StepError::Failed(format!(
            "async command '{}' panicked: {}",
            name, e
        ))),
    }
}

// ============================================================================
// ExecutionContext
// ============================================================================

/// Runtime scope of a job or of one of its steps
#[derive(Debug)]
pub struct ExecutionContext {
    id: Uuid,
    name: String,
    /// Terminal outcome of this scope
    pub result: Option<TaskOutcome>,
    /// Merged outcome of the scope's pending commands
    pub command_result: Option<TaskOutcome>,
    pub variables: Variables,
    token: CancellationToken,
    async_commands: CommandList,
    job_commands: CommandList,
    log: StepLog,
    timeline: Vec<StepRecord>,
    started_at: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    /// Create the root context of a job
    pub fn new_job(name: &str, variables: Variables, token: CancellationToken) -> Self {
        let commands: CommandList = Arc::default();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            result: None,
            command_result: None,
            variables,
            token,
            async_commands: commands.clone(),
            job_commands: commands,
            log: StepLog::default(),
            timeline: Vec::new(),
            started_at: None,
        }
    }

    /// Create a step scope. The child token is independent of the job token;
    /// job cancellation reaches the step only through the runner.
    pub fn create_child(&self, name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            result: None,
            command_result: None,
            variables: self.variables.clone(),
            token: CancellationToken::new(),
            async_commands: Arc::default(),
            job_commands: self.async_commands.clone(),
            log: StepLog::default(),
            timeline: Vec::new(),
            started_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Mark the scope as started and re-expand its variables. Expansion
    /// problems are logged as warnings.
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        info!(context = %self.name, id = %self.id, "Starting");
        for warning in self.variables.expand_in_place() {
            self.warning(&warning);
        }
    }

    /// Spawn a pending command owned by this scope
    pub fn queue_async_command<F>(&self, name: &str, command: F)
    where
        F: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        push_command(&self.async_commands, name, command);
    }

    /// Spawn a pending command owned by the job this scope belongs to
    pub fn queue_job_command<F>(&self, name: &str, command: F)
    where
        F: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        push_command(&self.job_commands, name, command);
    }

    /// Take every command queued on this scope so far
    pub fn take_async_commands(&self) -> Vec<PendingCommand> {
        let mut commands = self
            .async_commands
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *commands)
    }

    pub fn output(&self, line: &str) {
        debug!(context = %self.name, "{}", line);
        self.log.push(LogLevel::Output, line.to_string());
    }

    pub fn debug(&self, message: &str) {
        debug!(context = %self.name, "{}", message);
        self.log.push(LogLevel::Debug, message.to_string());
    }

    pub fn warning(&self, message: &str) {
        warn!(context = %self.name, "{}", message);
        self.log.push(LogLevel::Warning, message.to_string());
    }

    pub fn error(&self, message: &str) {
        error!(context = %self.name, "{}", message);
        self.log.push(LogLevel::Error, message.to_string());
    }

    pub fn log(&self) -> &StepLog {
        &self.log
    }

    pub fn timeline(&self) -> &[StepRecord] {
        &self.timeline
    }

    /// Finalize a step scope into a record on this (job) scope's timeline
    pub fn record_step(&mut self, step: &ExecutionContext) {
        let finished_at = Utc::now();
        self.timeline.push(StepRecord {
            name: step.name.clone(),
            result: step.result.unwrap_or(TaskOutcome::Succeeded),
            started_at: step.started_at.unwrap_or(finished_at),
            finished_at,
            log: step.log.snapshot(),
        });
    }
}

fn push_command<F>(list: &CommandList, name: &str, command: F)
where
    F: Future<Output = Result<(), StepError>> + Send + 'static,
{
    let handle = tokio::spawn(command);
    let mut commands = list.lock().unwrap_or_else(|e| e.into_inner());
    commands.push(PendingCommand {
        name: name.to_string(),
        handle,
    });
}
