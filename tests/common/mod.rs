#![allow(dead_code)]

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

use pipeline_agent::engine::{Step, StepError, StepOptions};
use pipeline_agent::job::{ExecutionContext, StepCondition};

pub fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

pub fn write_file(dir: &Path, filename: &str, content: &str) -> PathBuf {
    let path = dir.join(filename);
    fs::write(&path, content).expect("Failed to write file");
    path
}

#[cfg(unix)]
pub fn write_script(dir: &Path, filename: &str, content: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = write_file(dir, filename, content);
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .expect("Failed to make script executable");
    path
}

/// Fake container engine: logs every invocation to `calls.log`, saves the
/// exec payload to `payload.json` and exits `exec` with `exec_exit_code`.
#[cfg(unix)]
pub fn fake_engine(dir: &Path, exec_exit_code: i32) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
echo "$@" >> "{dir}/calls.log"
case "$1" in
  create) echo fakecontainer0001 ;;
  exec) cat > "{dir}/payload.json"; echo "exec output"; exit {code} ;;
esac
exit 0
"#,
        dir = dir.display(),
        code = exec_exit_code
    );
    write_script(dir, "fake-engine", &script)
}

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail,
    /// Sleep, returning `Canceled` if the step token fires first
    Sleep(Duration),
    /// Queue a step-level pending command with the given result
    QueueCommand { fail: bool, delay: Duration },
    /// Queue a job-level pending command that bumps a counter
    QueueJobCommand(Arc<AtomicUsize>),
}

/// Scriptable step for runner tests
pub struct TestStep {
    options: StepOptions,
    behavior: Behavior,
    runs: Arc<AtomicUsize>,
    started: Arc<Notify>,
}

impl TestStep {
    pub fn new(name: &str, behavior: Behavior) -> Self {
        Self {
            options: StepOptions::new(name),
            behavior,
            runs: Arc::default(),
            started: Arc::default(),
        }
    }

    pub fn with_condition(mut self, condition: &str) -> Self {
        self.options.condition = StepCondition::Expression(condition.to_string());
        self
    }

    pub fn with_options(mut self, f: impl FnOnce(StepOptions) -> StepOptions) -> Self {
        self.options = f(self.options);
        self
    }

    /// Counter of how many times the body ran
    pub fn runs(&self) -> Arc<AtomicUsize> {
        self.runs.clone()
    }

    /// Notified when the body starts
    pub fn started(&self) -> Arc<Notify> {
        self.started.clone()
    }

    pub fn build(self) -> Arc<dyn Step> {
        Arc::new(self)
    }
}

#[async_trait]
impl Step for TestStep {
    fn options(&self) -> &StepOptions {
        &self.options
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<(), StepError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        ctx.output(&format!("running {}", self.options.display_name));

        match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(StepError::Failed("step failed on purpose".to_string())),
            Behavior::Sleep(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(*duration) => Ok(()),
                    _ = ctx.cancellation_token().cancelled() => Err(StepError::Canceled),
                }
            }
            Behavior::QueueCommand { fail, delay } => {
                let (fail, delay) = (*fail, *delay);
                ctx.queue_async_command("side-task", async move {
                    tokio::time::sleep(delay).await;
                    if fail {
                        Err(StepError::Failed("side task failed".to_string()))
                    } else {
                        Ok(())
                    }
                });
                Ok(())
            }
            Behavior::QueueJobCommand(counter) => {
                let counter = counter.clone();
                ctx.queue_job_command("upload", async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                Ok(())
            }
        }
    }
}

pub fn run_count(counter: &Arc<AtomicUsize>) -> usize {
    counter.load(Ordering::SeqCst)
}
