//! Process invoker
//!
//! Spawns a process, streams its stdout/stderr lines to an output sink and
//! waits for it to exit. When the cancellation token fires the process is
//! stopped in stages:
//!
//! 1. interrupt, then wait `sigint_timeout` (plus `sigterm_timeout` with
//!    graceful shutdown)
//! 2. terminate, then wait `sigterm_timeout`
//! 3. kill the whole process tree
//!
//! `kill_on_cancel` goes straight to step 3.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::shutdown::{platform_strategy, ShutdownSignal, ShutdownStrategy};
use super::{HostError, OutputLine, OutputSink, OutputStream, ProcessRequest};

/// How long to keep reading output after the process has exited.
/// Detached grandchildren can hold the pipes open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    strategy: Arc<dyn ShutdownStrategy>,
}

impl Default for ProcessInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInvoker {
    pub fn new() -> Self {
        Self::with_strategy(platform_strategy())
    }

    pub fn with_strategy(strategy: Arc<dyn ShutdownStrategy>) -> Self {
        Self { strategy }
    }

    /// Run a process to completion, returning its exit code.
    ///
    /// Returns `HostError::Canceled` if the token fired, and
    /// `HostError::ExitCode` for a nonzero exit when the request requires zero.
    #[instrument(skip_all, fields(file = %request.file_name))]
    pub async fn execute(
        &self,
        request: &ProcessRequest,
        output: Option<&OutputSink>,
        token: &CancellationToken,
    ) -> Result<i32, HostError> {
        if token.is_cancelled() {
            return Err(HostError::Canceled);
        }

        let mut command = self.build_command(request)?;
        let mut child = command.spawn().map_err(|source| HostError::Spawn {
            file: request.file_name.clone(),
            source,
        })?;
        info!(pid = child.id(), args = ?request.arguments, "Process started");

        let stdin_task = match (request.stdin.clone(), child.stdin.take()) {
            (Some(input), Some(mut stdin)) => Some(tokio::spawn(async move {
                // the process may exit without reading its input
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(error = %e, "Failed to write standard input");
                }
                let _ = stdin.shutdown().await;
            })),
            _ => None,
        };

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump(stdout, OutputStream::Stdout, output.cloned()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump(stderr, OutputStream::Stderr, output.cloned()));
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = token.cancelled() => {
                self.stop(&mut child, request).await;
                child.wait().await?
            }
        };

        if let Some(task) = stdin_task {
            task.abort();
        }
        drain(pumps).await;

        let code = exit_code(status);
        info!(code, "Process exited");

        if token.is_cancelled() {
            return Err(HostError::Canceled);
        }
        if request.require_zero_exit && code != 0 {
            return Err(HostError::ExitCode {
                file: request.file_name.clone(),
                code,
            });
        }
        Ok(code)
    }

    fn build_command(&self, request: &ProcessRequest) -> Result<Command, HostError> {
        let mut command = Command::new(&request.file_name);
        command
            .args(&request.arguments)
            .envs(&request.environment)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !request.working_directory.is_empty() {
            command.current_dir(&request.working_directory);
        }

        if !request.prepend_path.is_empty() {
            let current = request
                .environment
                .get("PATH")
                .cloned()
                .or_else(|| std::env::var("PATH").ok())
                .unwrap_or_default();
            let entries = request
                .prepend_path
                .iter()
                .map(std::path::PathBuf::from)
                .chain(std::env::split_paths(&current));
            let path = std::env::join_paths(entries).map_err(|e| {
                HostError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
            })?;
            command.env("PATH", path);
        }

        self.strategy.configure(&mut command);
        Ok(command)
    }

    /// Escalate from interrupt to killing the process tree
    async fn stop(&self, child: &mut Child, request: &ProcessRequest) {
        let Some(pid) = child.id() else {
            return;
        };
        let options = request.shutdown;

        if !request.kill_on_cancel {
            // graceful shutdown folds the terminate budget into the interrupt wait
            let interrupt_wait = if options.use_graceful_shutdown {
                options.sigint_timeout.saturating_add(options.sigterm_timeout)
            } else {
                options.sigint_timeout
            };
            info!(pid, ?interrupt_wait, "Sending interrupt to process");
            if self
                .signal_and_wait(child, pid, ShutdownSignal::Interrupt, interrupt_wait)
                .await
            {
                info!(pid, "Process exited after interrupt");
                return;
            }

            info!(pid, "Sending terminate to process");
            if self
                .signal_and_wait(child, pid, ShutdownSignal::Terminate, options.sigterm_timeout)
                .await
            {
                info!(pid, "Process exited after terminate");
                return;
            }
        }

        info!(pid, "Killing process tree");
        if let Err(e) = self.strategy.kill_tree(pid).await {
            warn!(pid, error = %e, "Failed to kill process tree");
        }
        if let Err(e) = child.start_kill() {
            debug!(pid, error = %e, "Process already gone");
        }
    }

    /// True if the process exited within the timeout
    async fn signal_and_wait(
        &self,
        child: &mut Child,
        pid: u32,
        signal: ShutdownSignal,
        timeout: Duration,
    ) -> bool {
        if let Err(e) = self.strategy.signal(pid, signal).await {
            warn!(pid, ?signal, error = %e, "Failed to signal process");
            return false;
        }
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(pid, error = %e, "Failed waiting for process");
                false
            }
            Err(_) => false,
        }
    }
}

fn spawn_pump<R>(reader: R, stream: OutputStream, sink: Option<OutputSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let text = text.trim_end_matches(['\n', '\r']);
                    if let Some(sink) = &sink {
                        // receiver gone means nobody wants the output
                        let _ = sink.send(OutputLine::new(stream, text)).await;
                    }
                }
                Err(e) => {
                    debug!(?stream, error = %e, "Output stream closed");
                    break;
                }
            }
        }
    })
}

async fn drain(pumps: Vec<JoinHandle<()>>) {
    for mut pump in pumps {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut pump)
            .await
            .is_err()
        {
            warn!("Output still open after process exit, detaching");
            pump.abort();
        }
    }
}

/// Exit code, or 128 + signal number for a signal-terminated process
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
