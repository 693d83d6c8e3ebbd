//! Steps: units of work handed to the runner

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::error::StepError;
use crate::host::{
    HostError, OutputLine, OutputSink, OutputStream, ProcessRequest, ShutdownOptions, StepHost,
};
use crate::job::conditions::StepCondition;
use crate::job::context::ExecutionContext;
use crate::job::settings::AgentSettings;
use crate::job::target::{ExecutionTarget, TargetOs};

/// Attributes every step carries
#[derive(Debug, Clone)]
pub struct StepOptions {
    pub display_name: String,
    pub condition: StepCondition,
    pub continue_on_error: bool,
    pub timeout: Option<Duration>,
    pub enabled: bool,
    pub target: ExecutionTarget,
}

impl StepOptions {
    pub fn new(display_name: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            condition: StepCondition::default(),
            continue_on_error: false,
            timeout: None,
            enabled: true,
            target: ExecutionTarget::Host,
        }
    }

    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_target(mut self, target: ExecutionTarget) -> Self {
        self.target = target;
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[async_trait]
pub trait Step: Send + Sync {
    fn options(&self) -> &StepOptions;

    /// Run the step body. The context's token is cancelled on timeout or
    /// when the job is cancelled and the step's condition no longer holds.
    async fn run(&self, ctx: &ExecutionContext) -> Result<(), StepError>;

    fn display_name(&self) -> &str {
        &self.options().display_name
    }

    fn condition(&self) -> &StepCondition {
        &self.options().condition
    }

    fn continue_on_error(&self) -> bool {
        self.options().continue_on_error
    }

    fn timeout(&self) -> Option<Duration> {
        self.options().timeout
    }

    fn enabled(&self) -> bool {
        self.options().enabled
    }

    fn target(&self) -> &ExecutionTarget {
        &self.options().target
    }
}

/// Runs one process on the step's target
#[derive(Debug, Clone)]
pub struct ProcessStep {
    options: StepOptions,
    file_name: String,
    arguments: Vec<String>,
    working_directory: String,
    environment: BTreeMap<String, String>,
    kill_on_cancel: bool,
    host: StepHost,
    settings: Arc<AgentSettings>,
}

impl ProcessStep {
    pub fn new(options: StepOptions, file_name: &str, settings: Arc<AgentSettings>) -> Self {
        let host = StepHost::for_target(&options.target, &settings);
        Self {
            working_directory: settings.work_directory.to_string_lossy().to_string(),
            options,
            file_name: file_name.to_string(),
            arguments: Vec::new(),
            environment: BTreeMap::new(),
            kill_on_cancel: false,
            host,
            settings,
        }
    }

    /// Run an inline script through the target's shell
    pub fn script(options: StepOptions, script: &str, settings: Arc<AgentSettings>) -> Self {
        let windows = match options.target.container() {
            Some(container) => container.os == TargetOs::Windows,
            None => cfg!(windows),
        };
        let (shell, flag) = if windows { ("cmd", "/C") } else { ("sh", "-c") };
        Self::new(options, shell, settings).args([flag.to_string(), script.to_string()])
    }

    pub fn args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.arguments.extend(args);
        self
    }

    pub fn working_directory(mut self, dir: &str) -> Self {
        self.working_directory = dir.to_string();
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.environment.extend(env);
        self
    }

    pub fn kill_on_cancel(mut self, kill: bool) -> Self {
        self.kill_on_cancel = kill;
        self
    }

    pub fn host(&self) -> &StepHost {
        &self.host
    }

    /// Expand `$(var)` macros in the step inputs and build the request
    fn build_request(&self, ctx: &ExecutionContext) -> ProcessRequest {
        let mut warnings = Vec::new();
        let mut expand = |input: &str| {
            let (value, unresolved) = ctx.variables.expand(input);
            warnings.extend(unresolved);
            value
        };

        let file_name = expand(&self.file_name);
        let arguments: Vec<String> = self.arguments.iter().map(|a| expand(a)).collect();
        let working_directory = expand(&self.working_directory);
        let step_env: Vec<(String, String)> = self
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), expand(v)))
            .collect();

        for warning in warnings {
            ctx.warning(&warning);
        }

        let mut environment = ctx.variables.to_environment();
        environment.extend(step_env);

        if self.settings.overwrite_temp {
            let temp = self
                .host
                .resolve_path(&self.settings.temp_directory.to_string_lossy());
            for name in ["TEMP", "TMP", "TMPDIR"] {
                environment.insert(name.to_string(), temp.clone());
            }
        }

        ProcessRequest {
            working_directory: self.host.resolve_path(&working_directory),
            file_name,
            arguments,
            environment,
            prepend_path: Vec::new(),
            stdin: None,
            require_zero_exit: true,
            kill_on_cancel: self.kill_on_cancel,
            shutdown: ShutdownOptions::from_settings(&self.settings),
        }
    }
}

#[async_trait]
impl Step for ProcessStep {
    fn options(&self) -> &StepOptions {
        &self.options
    }

    #[instrument(skip_all, fields(step = %self.options.display_name))]
    async fn run(&self, ctx: &ExecutionContext) -> Result<(), StepError> {
        let request = self.build_request(ctx);
        debug!(file = %request.file_name, cwd = %request.working_directory, "Running process step");

        if self.settings.overwrite_temp {
            tokio::fs::create_dir_all(&self.settings.temp_directory)
                .await
                .map_err(HostError::from)?;
        }

        let token = ctx.cancellation_token().clone();
        let result = forward_output(ctx, |sink| async move {
            self.host.execute(request, Some(&sink), &token).await
        })
        .await;
        let code = result?;
        debug!(code, "Process step finished");
        Ok(())
    }
}

/// Run `body` with an output sink whose lines go to the context's log.
/// The sink is dropped when `body` completes.
pub(crate) async fn forward_output<T, F>(
    ctx: &ExecutionContext,
    body: impl FnOnce(OutputSink) -> F,
) -> T
where
    F: Future<Output = T>,
{
    let (tx, rx) = async_channel::unbounded::<OutputLine>();
    let forward = async {
        while let Ok(line) = rx.recv().await {
            match line.stream {
                OutputStream::Stdout | OutputStream::Stderr => ctx.output(&line.text),
                OutputStream::Diagnostic => ctx.error(&line.text),
            }
        }
    };
    let (result, ()) = futures::future::join(body(tx), forward).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::context::Variables;
    use tokio_util::sync::CancellationToken;

    fn step_ctx() -> ExecutionContext {
        let vars: Variables = [("Build.Configuration", "release"), ("greeting", "hi")]
            .into_iter()
            .collect();
        ExecutionContext::new_job("job", vars, CancellationToken::new()).create_child("step")
    }

    #[test]
    fn test_build_request_expands_inputs() {
        let ctx = step_ctx();
        let step = ProcessStep::new(StepOptions::new("s"), "make", Arc::new(AgentSettings::default()))
            .args(["$(Build.Configuration)".to_string(), "$(missing)".to_string()])
            .env("GREETING", "$(greeting) there");

        let request = step.build_request(&ctx);
        assert_eq!(request.arguments, vec!["release", "$(missing)"]);
        assert_eq!(request.environment.get("GREETING").map(String::as_str), Some("hi there"));
        assert_eq!(
            request.environment.get("BUILD_CONFIGURATION").map(String::as_str),
            Some("release")
        );
        assert!(ctx.log().snapshot().iter().any(|l| l.message.contains("missing")));
    }

    #[test]
    fn test_overwrite_temp() {
        let settings = AgentSettings {
            overwrite_temp: true,
            temp_directory: "/agent/_temp".into(),
            ..Default::default()
        };
        let step = ProcessStep::new(StepOptions::new("s"), "true", Arc::new(settings));
        let request = step.build_request(&step_ctx());
        for name in ["TEMP", "TMP", "TMPDIR"] {
            assert_eq!(request.environment.get(name).map(String::as_str), Some("/agent/_temp"));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_forwards_output_to_step_log() {
        let ctx = step_ctx();
        let step = ProcessStep::script(
            StepOptions::new("echo"),
            "echo $GREETING from $(Build.Configuration)",
            Arc::new(AgentSettings {
                work_directory: std::env::temp_dir(),
                ..Default::default()
            }),
        );
        step.run(&ctx).await.unwrap();
        assert!(ctx.log().snapshot().iter().any(|l| l.message == "hi from release"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_nonzero_exit_fails() {
        let step = ProcessStep::script(
            StepOptions::new("fail"),
            "exit 2",
            Arc::new(AgentSettings {
                work_directory: std::env::temp_dir(),
                ..Default::default()
            }),
        );
        let err = step.run(&step_ctx()).await.unwrap_err();
        assert!(matches!(err, StepError::Host(ref e) if e.exit_code() == Some(2)));
    }
}
