//! Run step processes directly on the agent machine

use tokio_util::sync::CancellationToken;

use super::{HostError, OutputSink, ProcessInvoker, ProcessRequest};

#[derive(Debug, Clone, Default)]
pub struct DirectStepHost {
    invoker: ProcessInvoker,
}

impl DirectStepHost {
    pub fn new(invoker: ProcessInvoker) -> Self {
        Self { invoker }
    }

    /// Host paths are used as-is
    pub fn resolve_path(&self, path: &str) -> String {
        path.to_string()
    }

    pub async fn execute(
        &self,
        request: ProcessRequest,
        output: Option<&OutputSink>,
        token: &CancellationToken,
    ) -> Result<i32, HostError> {
        self.invoker.execute(&request, output, token).await
    }
}
