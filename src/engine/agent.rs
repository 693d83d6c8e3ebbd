//! Process-wide agent state shared by every job the agent runs

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::job::settings::AgentSettings;

#[derive(Debug, Clone)]
pub struct AgentContext {
    settings: Arc<AgentSettings>,
    shutdown: CancellationToken,
}

impl Default for AgentContext {
    fn default() -> Self {
        Self::new(AgentSettings::default())
    }
}

impl AgentContext {
    pub fn new(settings: AgentSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &Arc<AgentSettings> {
        &self.settings
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Mark the agent as going away. Jobs are cancelled separately.
    pub fn signal_shutdown(&self) {
        self.shutdown.cancel();
    }
}
