//! # Pipeline Agent
//!
//! Worker-side step execution engine for build/release pipeline jobs.
//!
//! ## Features
//!
//! - **Sequential step runner** - pre-job, job and post-job steps run strictly in order
//! - **Conditions** - `succeeded()`, `always()`, `eq(variables['x'], 'y')` and simple predicates
//! - **Cancellation** - job cancellation re-evaluates the running step's condition;
//!   `always()` steps finish, the rest are stopped
//! - **Graceful process shutdown** - interrupt, terminate, then kill the process tree
//! - **Container steps** - run inside job containers via `<engine> exec`
//! - **Timeouts and continue-on-error** per step
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pipeline_agent::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manifest = JobManifest::parse(
//!         r#"
//! name: build
//! steps:
//!   - name: Compile
//!     run: make
//!   - name: Cleanup
//!     run: make clean
//!     condition: always()
//! "#,
//!         "inline",
//!     )?;
//!
//!     let agent = AgentContext::default();
//!     let queue = StepsQueue::from_initialize_result(manifest.initialize(agent.settings().clone())?);
//!     let mut job = ExecutionContext::new_job(
//!         &manifest.name,
//!         manifest.job_variables(),
//!         tokio_util::sync::CancellationToken::new(),
//!     );
//!
//!     StepsRunner::new(agent).run_queue(&mut job, &queue).await;
//!     println!("Job finished: {:?}", job.result);
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod host;
pub mod job;

// Re-export main types
pub use engine::{
    AgentContext, JobInitializeResult, ProcessStep, StartContainerStep, Step, StepError,
    StepOptions, StepRecord, StepsQueue, StepsRunner, StopContainerStep, TaskOutcome,
};
pub use host::{
    ContainerEngine, ContainerPayload, ContainerStepHost, DirectStepHost, HostError, OutputLine,
    OutputStream, ProcessInvoker, ProcessRequest, ShutdownOptions, StepHost,
};
pub use job::{
    AgentSettings, ConditionExpressionManager, ContainerInfo, ExecutionContext, ExecutionTarget,
    ExpressionError, ExpressionManager, JobManifest, LoadError, Mount, StepCondition, Variables,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::engine::{
        AgentContext, ProcessStep, Step, StepError, StepOptions, StepsQueue, StepsRunner,
        TaskOutcome,
    };
    pub use crate::host::{ProcessInvoker, ProcessRequest, StepHost};
    pub use crate::job::{
        AgentSettings, ContainerInfo, ExecutionContext, ExecutionTarget, JobManifest, LoadError,
        Mount, StepCondition, Variables,
    };
}
