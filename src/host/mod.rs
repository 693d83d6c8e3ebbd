//! Step hosts: where and how a step's process runs
//!
//! This module provides:
//! - `process`: spawning a process, streaming its output lines, and the
//!   interrupt → terminate → kill shutdown protocol on cancellation
//! - `shutdown`: platform signal strategies used by the invoker
//! - `direct`: run on the agent machine
//! - `container`: run inside a job container through the engine's `exec`
//! - `engine`: container engine CLI wrapper (pull/create/start/exec/stop/rm)
//! - `exit_codes`: explanations for container exit codes

use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod container;
pub mod direct;
pub mod engine;
pub mod exit_codes;
pub mod process;
pub mod shutdown;

pub use container::{ContainerPayload, ContainerStepHost};
pub use direct::DirectStepHost;
pub use engine::ContainerEngine;
pub use process::ProcessInvoker;
pub use shutdown::{platform_strategy, ShutdownSignal, ShutdownStrategy};

use crate::job::settings::AgentSettings;
use crate::job::target::ExecutionTarget;

/// Errors raised while running a step's process
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Failed to start '{file}': {source}")]
    Spawn {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process '{file}' exited with code {code}")]
    ExitCode { file: String, code: i32 },

    #[error("Container process exited with code {code}: {guidance}")]
    ContainerExit { code: i32, guidance: String },

    #[error("The operation was canceled")]
    Canceled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Container '{0}' has not been started")]
    ContainerNotStarted(String),

    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },
}

impl HostError {
    /// Exit code carried by the error, if the process ran to completion
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            HostError::ExitCode { code, .. } | HostError::ContainerExit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Messages produced by the host itself
    Diagnostic,
}

/// One line of process output, in the order the process wrote it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputLine {
    pub fn new(stream: OutputStream, text: impl Into<String>) -> Self {
        Self {
            stream,
            text: text.into(),
        }
    }
}

/// Receiving end is owned by whoever consumes the lines
pub type OutputSink = async_channel::Sender<OutputLine>;

/// How a cancelled process is stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOptions {
    pub sigint_timeout: Duration,
    pub sigterm_timeout: Duration,
    /// Wait `sigint_timeout + sigterm_timeout` after the interrupt before terminating
    pub use_graceful_shutdown: bool,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self::from_settings(&AgentSettings::default())
    }
}

impl ShutdownOptions {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            sigint_timeout: settings.sigint_timeout(),
            sigterm_timeout: settings.sigterm_timeout(),
            use_graceful_shutdown: settings.use_graceful_shutdown,
        }
    }
}

/// Everything needed to run one process
#[derive(Debug, Clone, Default)]
pub struct ProcessRequest {
    pub working_directory: String,
    pub file_name: String,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    /// Entries put in front of PATH
    pub prepend_path: Vec<String>,
    /// Fed to the process's standard input, which is then closed
    pub stdin: Option<String>,
    pub require_zero_exit: bool,
    /// Skip the signal escalation and kill the process tree at once
    pub kill_on_cancel: bool,
    pub shutdown: ShutdownOptions,
}

impl ProcessRequest {
    pub fn new(file_name: &str, working_directory: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            working_directory: working_directory.to_string(),
            require_zero_exit: true,
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }
}

/// Where a step's process runs. Chosen once from the step's target.
#[derive(Debug, Clone)]
pub enum StepHost {
    Direct(DirectStepHost),
    Container(ContainerStepHost),
}

impl StepHost {
    pub fn for_target(target: &ExecutionTarget, settings: &AgentSettings) -> Self {
        let invoker = ProcessInvoker::new();
        match target {
            ExecutionTarget::Host => StepHost::Direct(DirectStepHost::new(invoker)),
            ExecutionTarget::Container(info) => StepHost::Container(ContainerStepHost::new(
                info.clone(),
                ContainerEngine::resolve(&settings.container_engine, invoker),
                settings.temp_directory.clone(),
            )),
        }
    }

    /// Translate a host path into the path the process will see
    pub fn resolve_path(&self, path: &str) -> String {
        match self {
            StepHost::Direct(host) => host.resolve_path(path),
            StepHost::Container(host) => host.resolve_path(path),
        }
    }

    pub async fn execute(
        &self,
        request: ProcessRequest,
        output: Option<&OutputSink>,
        token: &CancellationToken,
    ) -> Result<i32, HostError> {
        match self {
            StepHost::Direct(host) => host.execute(request, output, token).await,
            StepHost::Container(host) => host.execute(request, output, token).await,
        }
    }
}
