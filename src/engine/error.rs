//! Step error types

use crate::host::HostError;
use crate::job::expressions::ExpressionError;

/// Errors a step body or one of its pending commands can end with
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("The operation was canceled")]
    Canceled,

    #[error("Step failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Host(HostError),

    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),
}

impl From<HostError> for StepError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Canceled => StepError::Canceled,
            other => StepError::Host(other),
        }
    }
}

impl StepError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, StepError::Canceled)
    }
}
