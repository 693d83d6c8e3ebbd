//! Agent settings
//!
//! Loaded from a YAML file; every field has a default. Feature flags can be
//! overridden from the environment:
//!
//! ```yaml
//! fail_job_when_agent_dies: true
//! overwrite_temp: true
//! sigint_timeout_ms: 7500
//! sigterm_timeout_ms: 2500
//! use_graceful_shutdown: false
//! temp_directory: /agent/_work/_temp
//! work_directory: /agent/_work
//! container_engine: docker
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::manifest::LoadError;

pub const ENV_FAIL_JOB_WHEN_AGENT_DIES: &str = "AGENT_FAIL_JOB_WHEN_AGENT_DIES";
pub const ENV_OVERWRITE_TEMP: &str = "AGENT_OVERWRITE_TEMP";
pub const ENV_USE_GRACEFUL_SHUTDOWN: &str = "AGENT_USE_GRACEFUL_SHUTDOWN";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Escalate a cancellation caused by agent shutdown to a failure
    #[serde(default)]
    pub fail_job_when_agent_dies: bool,

    /// Point TEMP/TMP/TMPDIR of step processes at the agent temp directory
    #[serde(default)]
    pub overwrite_temp: bool,

    #[serde(default = "default_sigint_timeout_ms")]
    pub sigint_timeout_ms: u64,

    #[serde(default = "default_sigterm_timeout_ms")]
    pub sigterm_timeout_ms: u64,

    /// Give the interrupt signal the terminate budget as well before escalating
    #[serde(default)]
    pub use_graceful_shutdown: bool,

    #[serde(default = "default_temp_directory")]
    pub temp_directory: PathBuf,

    #[serde(default = "default_work_directory")]
    pub work_directory: PathBuf,

    #[serde(default = "default_container_engine")]
    pub container_engine: String,
}

fn default_sigint_timeout_ms() -> u64 {
    7500
}

fn default_sigterm_timeout_ms() -> u64 {
    2500
}

fn default_temp_directory() -> PathBuf {
    std::env::temp_dir().join("pipeline-agent")
}

fn default_work_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_container_engine() -> String {
    "docker".to_string()
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            fail_job_when_agent_dies: false,
            overwrite_temp: false,
            sigint_timeout_ms: default_sigint_timeout_ms(),
            sigterm_timeout_ms: default_sigterm_timeout_ms(),
            use_graceful_shutdown: false,
            temp_directory: default_temp_directory(),
            work_directory: default_work_directory(),
            container_engine: default_container_engine(),
        }
    }
}

impl AgentSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let settings: AgentSettings =
            serde_yaml::from_str(&content).map_err(|e| LoadError::Yaml {
                file: path.display().to_string(),
                error: e,
            })?;
        Ok(settings)
    }

    /// Apply feature-flag overrides from the process environment
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply feature-flag overrides from an arbitrary lookup
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup(ENV_FAIL_JOB_WHEN_AGENT_DIES) {
            self.fail_job_when_agent_dies = is_truthy(&v);
        }
        if let Some(v) = lookup(ENV_OVERWRITE_TEMP) {
            self.overwrite_temp = is_truthy(&v);
        }
        if let Some(v) = lookup(ENV_USE_GRACEFUL_SHUTDOWN) {
            self.use_graceful_shutdown = is_truthy(&v);
        }
        self
    }

    pub fn sigint_timeout(&self) -> Duration {
        Duration::from_millis(self.sigint_timeout_ms)
    }

    pub fn sigterm_timeout(&self) -> Duration {
        Duration::from_millis(self.sigterm_timeout_ms)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}
