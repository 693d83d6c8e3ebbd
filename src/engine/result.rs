//! Step and job outcome types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::job::context::LogLine;

/// Terminal outcome of a step, a pending command, or a whole job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskOutcome {
    Succeeded,
    SucceededWithIssues,
    Failed,
    Canceled,
    Skipped,
    Abandoned,
}

impl TaskOutcome {
    /// Position in the severity order. `Skipped` has none: it never
    /// participates in a merge.
    fn severity(self) -> Option<u8> {
        match self {
            TaskOutcome::Succeeded => Some(0),
            TaskOutcome::SucceededWithIssues => Some(1),
            TaskOutcome::Failed => Some(2),
            TaskOutcome::Canceled => Some(3),
            TaskOutcome::Abandoned => Some(4),
            TaskOutcome::Skipped => None,
        }
    }

    /// Merge an incoming outcome into the current one.
    ///
    /// The result is the worse of the two under
    /// `Succeeded < SucceededWithIssues < Failed < Canceled < Abandoned`.
    /// `Skipped` is the identity: merging it in never changes `current`.
    pub fn merge(current: Option<TaskOutcome>, incoming: TaskOutcome) -> TaskOutcome {
        let Some(current) = current else {
            return incoming;
        };
        match (current.severity(), incoming.severity()) {
            (_, None) => current,
            (None, Some(_)) => incoming,
            (Some(c), Some(i)) if i > c => incoming,
            _ => current,
        }
    }

    /// Whether a job with this outcome counts as passed
    pub fn is_success(self) -> bool {
        matches!(
            self,
            TaskOutcome::Succeeded | TaskOutcome::SucceededWithIssues
        )
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskOutcome::Succeeded => "Succeeded",
            TaskOutcome::SucceededWithIssues => "SucceededWithIssues",
            TaskOutcome::Failed => "Failed",
            TaskOutcome::Canceled => "Canceled",
            TaskOutcome::Skipped => "Skipped",
            TaskOutcome::Abandoned => "Abandoned",
        };
        f.write_str(s)
    }
}

/// Finalized record of one step, appended to the job timeline
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub name: String,
    pub result: TaskOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub log: Vec<LogLine>,
}

impl StepRecord {
    /// True if any log line of this step contains `needle`
    pub fn log_contains(&self, needle: &str) -> bool {
        self.log.iter().any(|l| l.message.contains(needle))
    }
}
