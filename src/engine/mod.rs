//! Step execution engine
//!
//! This module contains:
//! - `steps_runner` - The runner that sequences, times out and cancels steps
//! - `steps_queue` - Immutable pre-job / job / post-job step lists
//! - `step` - The `Step` trait and the process step
//! - `container_steps` - Job container start/stop steps
//! - `agent` - Process-wide agent settings and shutdown token
//! - `result` - Outcome lattice and step records
//! - `error` - Step error types
//! - `console` - Console code page helper for Windows hosts

pub mod agent;
pub mod console;
pub mod container_steps;
pub mod error;
pub mod result;
pub mod step;
pub mod steps_queue;
pub mod steps_runner;

pub use agent::AgentContext;
pub use container_steps::{StartContainerStep, StopContainerStep};
pub use error::StepError;
pub use result::{StepRecord, TaskOutcome};
pub use step::{ProcessStep, Step, StepOptions};
pub use steps_queue::{JobInitializeResult, StepsQueue};
pub use steps_runner::StepsRunner;
