//! Platform strategies for stopping a cancelled process
//!
//! Processes are spawned as leaders of their own process group (a new
//! console process group on Windows) so that signals reach the whole tree.

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::process::Command;

use super::HostError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Ctrl+C
    Interrupt,
    /// Polite termination request
    Terminate,
}

#[async_trait]
pub trait ShutdownStrategy: Send + Sync + Debug {
    /// Prepare a command before it is spawned
    fn configure(&self, command: &mut Command);

    /// Deliver a signal. A process that has already exited is not an error.
    async fn signal(&self, pid: u32, signal: ShutdownSignal) -> Result<(), HostError>;

    /// Forcefully kill the process and all of its descendants
    async fn kill_tree(&self, pid: u32) -> Result<(), HostError>;
}

/// Strategy for the platform the agent runs on
pub fn platform_strategy() -> Arc<dyn ShutdownStrategy> {
    #[cfg(unix)]
    {
        Arc::new(PosixSignals)
    }
    #[cfg(windows)]
    {
        Arc::new(WindowsConsole)
    }
}

#[cfg(unix)]
pub use posix::PosixSignals;

#[cfg(unix)]
mod posix {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    /// SIGINT / SIGTERM / SIGKILL sent to the process group
    #[derive(Debug, Clone, Copy, Default)]
    pub struct PosixSignals;

    fn send(pid: u32, signal: Signal) -> Result<(), HostError> {
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(HostError::Signal {
                pid,
                message: e.to_string(),
            }),
        }
    }

    #[async_trait]
    impl ShutdownStrategy for PosixSignals {
        fn configure(&self, command: &mut Command) {
            command.process_group(0);
        }

        async fn signal(&self, pid: u32, signal: ShutdownSignal) -> Result<(), HostError> {
            let signal = match signal {
                ShutdownSignal::Interrupt => Signal::SIGINT,
                ShutdownSignal::Terminate => Signal::SIGTERM,
            };
            send(pid, signal)
        }

        async fn kill_tree(&self, pid: u32) -> Result<(), HostError> {
            send(pid, Signal::SIGKILL)
        }
    }
}

#[cfg(windows)]
pub use windows::WindowsConsole;

#[cfg(windows)]
mod windows {
    use super::*;
    use std::process::Stdio;
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
    use windows_sys::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP;

    /// Ctrl+Break to the child's console process group for the polite
    /// signals, `taskkill /F /T` to kill.
    ///
    /// Ctrl+C cannot be delivered to a process group created with
    /// `CREATE_NEW_PROCESS_GROUP`, so both polite signals map to Ctrl+Break.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct WindowsConsole;

    fn ctrl_break(pid: u32) -> Result<(), HostError> {
        // SAFETY: plain Win32 call with value arguments
        let sent = unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) };
        if sent != 0 {
            Ok(())
        } else {
            Err(HostError::Signal {
                pid,
                message: std::io::Error::last_os_error().to_string(),
            })
        }
    }

    async fn force_kill(pid: u32) -> Result<(), HostError> {
        let output = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| HostError::Signal {
                pid,
                message: e.to_string(),
            })?;
        // 128: process not found
        match output.status.code() {
            Some(0) | Some(128) => Ok(()),
            _ => Err(HostError::Signal {
                pid,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    #[async_trait]
    impl ShutdownStrategy for WindowsConsole {
        fn configure(&self, command: &mut Command) {
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        async fn signal(&self, pid: u32, _signal: ShutdownSignal) -> Result<(), HostError> {
            ctrl_break(pid)
        }

        async fn kill_tree(&self, pid: u32) -> Result<(), HostError> {
            force_kill(pid).await
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::time::Duration;

        #[tokio::test]
        async fn test_ctrl_break_stops_console_child() {
            // blocks on stdin and has no console handler of its own
            let mut command = Command::new("findstr");
            command
                .arg("never")
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .kill_on_drop(true);
            WindowsConsole.configure(&mut command);
            let mut child = command.spawn().unwrap();
            let pid = child.id().unwrap();

            tokio::time::sleep(Duration::from_millis(300)).await;
            WindowsConsole
                .signal(pid, ShutdownSignal::Interrupt)
                .await
                .unwrap();

            let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
                .await
                .expect("child should exit on Ctrl+Break")
                .unwrap();
            assert!(!status.success());
        }
    }
}
