//! Job manifest loader
//!
//! A manifest is a YAML description of an already-resolved job: variables,
//! job containers and the pre-job, job and post-job steps.
//!
//! ```yaml
//! name: build
//! variables:
//!   Build.Configuration: release
//! containers:
//!   builder:
//!     image: node:20
//!     mounts:
//!       - { source: /agent/_work, target: /__w }
//! steps:
//!   - name: Compile
//!     run: make $(Build.Configuration)
//!     target: builder
//!     timeout_minutes: 30
//!   - name: Publish
//!     file: ./publish.sh
//!     args: [--dry-run]
//!     conditions:
//!       - { variable: Build.SourceBranch, operator: equals, value: refs/heads/main }
//! post_job:
//!   - name: Cleanup
//!     run: rm -rf out
//!     condition: always()
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::conditions::{StepCondition, VariableCondition};
use super::context::Variables;
use super::settings::AgentSettings;
use super::target::{ContainerInfo, ExecutionTarget, Mount, TargetOs};
use crate::engine::container_steps::{StartContainerStep, StopContainerStep};
use crate::engine::step::{ProcessStep, Step, StepOptions};
use crate::engine::steps_queue::JobInitializeResult;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error in {file}: {error}")]
    Yaml {
        file: String,
        error: serde_yaml::Error,
    },

    #[error("Invalid step '{step}': {message}")]
    InvalidStep { step: String, message: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobManifest {
    pub name: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Values hidden from the process environment
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerSpec>,
    #[serde(default)]
    pub pre_job: Vec<StepSpec>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub post_job: Vec<StepSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub prepend_path: Vec<String>,
    #[serde(default)]
    pub runtime_path: Option<String>,
    #[serde(default)]
    pub os: TargetOs,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    pub name: String,
    /// Inline script, run through the target's shell
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub conditions: Vec<VariableCondition>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub timeout_minutes: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub kill_on_cancel: bool,
    /// Container alias, or `host` (the default)
    #[serde(default)]
    pub target: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl JobManifest {
    pub fn load_file(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, &path.display().to_string())
    }

    pub fn parse(content: &str, file: &str) -> Result<Self, LoadError> {
        let manifest: JobManifest = serde_yaml::from_str(content).map_err(|e| LoadError::Yaml {
            file: file.to_string(),
            error: e,
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check every step without building anything
    pub fn validate(&self) -> Result<(), LoadError> {
        for spec in self.all_specs() {
            spec.command()?;
            spec.step_condition()?;
            if let Some(alias) = spec.container_alias() {
                if !self.containers.contains_key(alias) {
                    return Err(spec.invalid(format!("unknown container '{}'", alias)));
                }
            }
        }
        Ok(())
    }

    pub fn all_specs(&self) -> impl Iterator<Item = &StepSpec> {
        self.pre_job
            .iter()
            .chain(self.steps.iter())
            .chain(self.post_job.iter())
    }

    pub fn job_variables(&self) -> Variables {
        let mut variables: Variables = self.variables.iter().collect();
        for (name, value) in &self.secrets {
            variables.set_secret(name, value.clone());
        }
        variables
    }

    /// Build the job's steps. Every declared container gets a start step at
    /// the front of pre-job and a stop step at the end of post-job.
    pub fn initialize(&self, settings: Arc<AgentSettings>) -> Result<JobInitializeResult, LoadError> {
        let containers: BTreeMap<&str, ContainerInfo> = self
            .containers
            .iter()
            .map(|(alias, spec)| (alias.as_str(), spec.to_info(alias)))
            .collect();

        let build = |specs: &[StepSpec]| -> Result<Vec<Arc<dyn Step>>, LoadError> {
            specs
                .iter()
                .map(|spec| spec.build(&containers, &settings))
                .collect()
        };

        let mut pre_job_steps: Vec<Arc<dyn Step>> = containers
            .values()
            .map(|info| Arc::new(StartContainerStep::new(info.clone(), &settings)) as Arc<dyn Step>)
            .collect();
        pre_job_steps.extend(build(&self.pre_job)?);

        let job_steps = build(&self.steps)?;

        let mut post_job_steps = build(&self.post_job)?;
        post_job_steps.extend(
            containers
                .values()
                .map(|info| Arc::new(StopContainerStep::new(info.clone(), &settings)) as Arc<dyn Step>),
        );

        Ok(JobInitializeResult {
            pre_job_steps,
            job_steps,
            post_job_steps,
        })
    }
}

impl ContainerSpec {
    fn to_info(&self, alias: &str) -> ContainerInfo {
        let mut info = ContainerInfo::new(alias, &self.image);
        info.mounts = self.mounts.clone();
        info.user_id = self.user_id.clone();
        info.user_name = self.user_name.clone();
        info.prepend_path = self.prepend_path.clone();
        if let Some(runtime) = &self.runtime_path {
            info.runtime_path = runtime.clone();
        }
        info.os = self.os;
        info
    }
}

/// What a step spec runs
enum Command<'a> {
    Script(&'a str),
    File(&'a str),
}

impl StepSpec {
    fn invalid(&self, message: impl Into<String>) -> LoadError {
        LoadError::InvalidStep {
            step: self.name.clone(),
            message: message.into(),
        }
    }

    fn command(&self) -> Result<Command<'_>, LoadError> {
        match (&self.run, &self.file) {
            (Some(script), None) => Ok(Command::Script(script)),
            (None, Some(file)) => Ok(Command::File(file)),
            (Some(_), Some(_)) => Err(self.invalid("'run' and 'file' are mutually exclusive")),
            (None, None) => Err(self.invalid("one of 'run' or 'file' is required")),
        }
    }

    fn step_condition(&self) -> Result<StepCondition, LoadError> {
        match (&self.condition, self.conditions.is_empty()) {
            (Some(_), false) => Err(self.invalid("'condition' and 'conditions' are mutually exclusive")),
            (Some(expr), true) if !expr.trim().is_empty() => Ok(StepCondition::Expression(expr.clone())),
            (_, false) => Ok(StepCondition::Predicates(self.conditions.clone())),
            _ => Ok(StepCondition::default()),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout_ms
            .map(Duration::from_millis)
            .or_else(|| self.timeout_minutes.map(|m| Duration::from_secs(m.saturating_mul(60))))
            .filter(|t| !t.is_zero())
    }

    fn container_alias(&self) -> Option<&str> {
        self.target
            .as_deref()
            .filter(|t| !t.eq_ignore_ascii_case("host"))
    }

    fn build(
        &self,
        containers: &BTreeMap<&str, ContainerInfo>,
        settings: &Arc<AgentSettings>,
    ) -> Result<Arc<dyn Step>, LoadError> {
        let target = match self.container_alias() {
            None => ExecutionTarget::Host,
            Some(alias) => containers
                .get(alias)
                .cloned()
                .map(ExecutionTarget::Container)
                .ok_or_else(|| self.invalid(format!("unknown container '{}'", alias)))?,
        };

        let mut options = StepOptions::new(&self.name)
            .with_condition(self.step_condition()?)
            .with_target(target);
        options.continue_on_error = self.continue_on_error;
        options.timeout = self.timeout();
        options.enabled = self.enabled;

        let working_directory = self.working_directory(settings);
        let step = match self.command()? {
            Command::Script(script) => ProcessStep::script(options, script, settings.clone()),
            Command::File(file) => {
                ProcessStep::new(options, file, settings.clone()).args(self.args.iter().cloned())
            }
        }
        .working_directory(&working_directory)
        .envs(self.env.clone())
        .kill_on_cancel(self.kill_on_cancel);

        Ok(Arc::new(step))
    }

    fn working_directory(&self, settings: &AgentSettings) -> String {
        let dir = match &self.working_directory {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => settings.work_directory.join(dir),
            None => settings.work_directory.clone(),
        };
        dir.to_string_lossy().to_string()
    }
}
