//! Container engine CLI wrapper (docker or a compatible engine)

use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{HostError, OutputLine, OutputSink, OutputStream, ProcessInvoker, ProcessRequest};
use crate::job::target::{ContainerInfo, TargetOs};

#[derive(Debug, Clone)]
pub struct ContainerEngine {
    path: PathBuf,
    invoker: ProcessInvoker,
}

impl ContainerEngine {
    pub fn new(path: impl Into<PathBuf>, invoker: ProcessInvoker) -> Self {
        Self {
            path: path.into(),
            invoker,
        }
    }

    /// Locate the engine on PATH. An unresolved name is kept as-is and
    /// fails when first spawned.
    pub fn resolve(name: &str, invoker: ProcessInvoker) -> Self {
        let path = which::which(name).unwrap_or_else(|e| {
            debug!(engine = name, error = %e, "Container engine not found on PATH");
            PathBuf::from(name)
        });
        Self::new(path, invoker)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn invoker(&self) -> &ProcessInvoker {
        &self.invoker
    }

    /// Arguments for `exec` of `command` inside a started container
    pub fn exec_args(&self, container: &ContainerInfo, id: &str, command: &[String]) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "-i".to_string()];
        if container.os != TargetOs::Windows {
            if let Some(user_id) = &container.user_id {
                args.push("-u".to_string());
                args.push(user_id.clone());
            }
            args.push("-w".to_string());
            args.push(container.home_directory());
        }
        args.push(id.to_string());
        args.extend(command.iter().cloned());
        args
    }

    #[instrument(skip(self, output, token))]
    pub async fn pull(
        &self,
        image: &str,
        output: Option<&OutputSink>,
        token: &CancellationToken,
    ) -> Result<(), HostError> {
        self.run(&["pull", image], output, token).await?;
        Ok(())
    }

    /// Create a long-running container and return its id
    #[instrument(skip_all, fields(container = %container.name, image = %container.image))]
    pub async fn create(
        &self,
        container: &ContainerInfo,
        output: Option<&OutputSink>,
        token: &CancellationToken,
    ) -> Result<String, HostError> {
        let mut args = vec!["create".to_string()];
        for mount in &container.mounts {
            args.push("-v".to_string());
            args.push(mount.volume_arg());
        }
        args.push("--entrypoint".to_string());
        args.push("tail".to_string());
        args.push(container.image.clone());
        args.push("-f".to_string());
        args.push("/dev/null".to_string());

        let stdout = self.run(&args, output, token).await?;
        let id = stdout
            .iter()
            .rev()
            .map(|line| line.trim())
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| HostError::ContainerNotStarted(container.name.clone()))?;
        info!(id = %id, "Container created");
        Ok(id)
    }

    pub async fn start(
        &self,
        id: &str,
        output: Option<&OutputSink>,
        token: &CancellationToken,
    ) -> Result<(), HostError> {
        self.run(&["start", id], output, token).await?;
        Ok(())
    }

    pub async fn stop(
        &self,
        id: &str,
        output: Option<&OutputSink>,
        token: &CancellationToken,
    ) -> Result<(), HostError> {
        self.run(&["stop", id], output, token).await?;
        Ok(())
    }

    pub async fn remove(
        &self,
        id: &str,
        output: Option<&OutputSink>,
        token: &CancellationToken,
    ) -> Result<(), HostError> {
        self.run(&["rm", "--force", id], output, token).await?;
        Ok(())
    }

    /// Run an engine command, forwarding output and returning stdout lines
    async fn run<S: AsRef<str>>(
        &self,
        args: &[S],
        output: Option<&OutputSink>,
        token: &CancellationToken,
    ) -> Result<Vec<String>, HostError> {
        let mut request = ProcessRequest::new(&self.path.to_string_lossy(), "")
            .args(args.iter().map(|a| a.as_ref().to_string()));
        request.kill_on_cancel = true;

        let (tx, rx) = async_channel::unbounded::<OutputLine>();
        let result = self.invoker.execute(&request, Some(&tx), token).await;
        drop(tx);

        let mut stdout = Vec::new();
        while let Ok(line) = rx.recv().await {
            if line.stream == OutputStream::Stdout {
                stdout.push(line.text.clone());
            }
            if let Some(sink) = output {
                let _ = sink.send(line).await;
            }
        }
        result?;
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_args_linux() {
        let engine = ContainerEngine::new("/usr/bin/docker", ProcessInvoker::new());
        let container = ContainerInfo::new("build", "node:20").with_user("1001", "vsts");
        let args = engine.exec_args(&container, "abc", &["node".to_string(), "/__t/x.js".to_string()]);
        assert_eq!(
            args,
            vec!["exec", "-i", "-u", "1001", "-w", "/home/vsts", "abc", "node", "/__t/x.js"]
        );
    }

    #[test]
    fn test_exec_args_windows_container() {
        let engine = ContainerEngine::new("docker", ProcessInvoker::new());
        let mut container = ContainerInfo::new("build", "mcr.microsoft.com/windows/servercore");
        container.os = TargetOs::Windows;
        let args = engine.exec_args(&container, "abc", &["node".to_string()]);
        assert_eq!(args, vec!["exec", "-i", "abc", "node"]);
    }
}
