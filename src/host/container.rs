//! Run step processes inside a job container
//!
//! The step's command is not passed on the `exec` command line. Instead a
//! small bootstrap script is written to the agent temp directory (which is
//! mounted into the container) and the command is sent to it as JSON on
//! standard input:
//!
//! ```text
//! <engine> exec -i [-u <uid>] [-w <home>] <id> <runtime> <script>
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

use super::exit_codes;
use super::{ContainerEngine, HostError, OutputLine, OutputSink, OutputStream, ProcessRequest};
use crate::job::target::{ContainerInfo, TargetOs};

pub const INVOKER_FILE_NAME: &str = "containerHandlerInvoker.js";

const INVOKER_SCRIPT: &str = include_str!("../../extensions/container/invoker.js");

/// Command description read by the bootstrap script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPayload {
    pub handler: String,
    pub args: String,
    pub work_dir: String,
    pub environment: BTreeMap<String, String>,
    pub prepend_path: String,
}

#[derive(Debug, Clone)]
pub struct ContainerStepHost {
    container: ContainerInfo,
    engine: ContainerEngine,
    temp_directory: PathBuf,
}

impl ContainerStepHost {
    pub fn new(container: ContainerInfo, engine: ContainerEngine, temp_directory: PathBuf) -> Self {
        Self {
            container,
            engine,
            temp_directory,
        }
    }

    pub fn container(&self) -> &ContainerInfo {
        &self.container
    }

    /// Rewrite paths under a mount source to the mount target; anything
    /// else is returned unchanged.
    pub fn resolve_path(&self, path: &str) -> String {
        if self.container.is_container_path(path) {
            return path.to_string();
        }
        self.container
            .translate_to_container(Path::new(path))
            .unwrap_or_else(|| path.to_string())
    }

    pub fn payload(&self, request: &ProcessRequest) -> ContainerPayload {
        let prepend_path = request
            .prepend_path
            .iter()
            .chain(self.container.prepend_path.iter())
            .map(|p| self.resolve_path(p))
            .collect::<Vec<_>>()
            .join(path_delimiter(self.container.os));
        ContainerPayload {
            handler: self.resolve_path(&request.file_name),
            args: join_arguments(&request.arguments, self.container.os),
            work_dir: self.resolve_path(&request.working_directory),
            environment: request.environment.clone(),
            prepend_path,
        }
    }

    #[instrument(skip_all, fields(container = %self.container.name, file = %request.file_name))]
    pub async fn execute(
        &self,
        request: ProcessRequest,
        output: Option<&OutputSink>,
        token: &CancellationToken,
    ) -> Result<i32, HostError> {
        let id = self
            .container
            .id()
            .ok_or_else(|| HostError::ContainerNotStarted(self.container.name.clone()))?;

        let payload = serde_json::to_string(&self.payload(&request))?;
        let script = self.write_invoker().await?;

        let command = [self.container.runtime_path.clone(), script];
        let mut exec = ProcessRequest::new(&self.engine.path().to_string_lossy(), "")
            .args(self.engine.exec_args(&self.container, id, &command));
        exec.stdin = Some(payload);
        exec.require_zero_exit = false;
        exec.kill_on_cancel = request.kill_on_cancel;
        exec.shutdown = request.shutdown;

        let code = self.engine.invoker().execute(&exec, output, token).await?;
        if code == 0 {
            return Ok(code);
        }

        let guidance = exit_codes::describe(code);
        error!(code, guidance = %guidance, "Container process failed");
        if let Some(sink) = output {
            let line = format!("Container process exited with code {}: {}", code, guidance);
            let _ = sink.send(OutputLine::new(OutputStream::Diagnostic, line)).await;
        }
        if request.require_zero_exit {
            return Err(HostError::ContainerExit { code, guidance });
        }
        Ok(code)
    }

    /// Write the bootstrap script and return its path inside the container
    async fn write_invoker(&self) -> Result<String, HostError> {
        tokio::fs::create_dir_all(&self.temp_directory).await?;
        let path = self.temp_directory.join(INVOKER_FILE_NAME);
        tokio::fs::write(&path, INVOKER_SCRIPT).await?;

        let host_path = path.to_string_lossy().to_string();
        let container_path = self.resolve_path(&host_path);
        if container_path == host_path {
            warn!(path = %host_path, "Temp directory is not mounted into the container");
        }
        Ok(container_path)
    }
}

fn path_delimiter(os: TargetOs) -> &'static str {
    match os {
        TargetOs::Linux => ":",
        TargetOs::Windows => ";",
    }
}

/// Join arguments into one shell command line for the container's shell,
/// quoting where needed
pub fn join_arguments(args: &[String], os: TargetOs) -> String {
    args.iter()
        .map(|arg| quote(arg, os))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote(arg: &str, os: TargetOs) -> String {
    let safe = !arg.is_empty()
        && arg.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || "-_./=:,@%+".contains(c)
                || (os == TargetOs::Windows && c == '\\')
        });
    match os {
        _ if safe => arg.to_string(),
        TargetOs::Linux => format!("'{}'", arg.replace('\'', r"'\''")),
        TargetOs::Windows => format!("\"{}\"", arg.replace('"', r#"\""#)),
    }
}
