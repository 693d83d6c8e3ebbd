//! The job's three step lists, fixed at job start

use std::sync::Arc;
use tracing::debug;

use super::step::Step;

/// Steps produced by job initialization
#[derive(Default)]
pub struct JobInitializeResult {
    pub pre_job_steps: Vec<Arc<dyn Step>>,
    pub job_steps: Vec<Arc<dyn Step>>,
    pub post_job_steps: Vec<Arc<dyn Step>>,
}

/// Immutable pre-job / job / post-job step lists. Disabled steps are
/// dropped at construction.
pub struct StepsQueue {
    pre_job: Vec<Arc<dyn Step>>,
    job: Vec<Arc<dyn Step>>,
    post_job: Vec<Arc<dyn Step>>,
}

impl StepsQueue {
    pub fn new(
        pre_job: Vec<Arc<dyn Step>>,
        job: Vec<Arc<dyn Step>>,
        post_job: Vec<Arc<dyn Step>>,
    ) -> Self {
        Self {
            pre_job: enabled_only(pre_job),
            job: enabled_only(job),
            post_job: enabled_only(post_job),
        }
    }

    pub fn from_initialize_result(result: JobInitializeResult) -> Self {
        Self::new(result.pre_job_steps, result.job_steps, result.post_job_steps)
    }

    pub fn pre_job_steps(&self) -> &[Arc<dyn Step>] {
        &self.pre_job
    }

    pub fn job_steps(&self) -> &[Arc<dyn Step>] {
        &self.job
    }

    pub fn post_job_steps(&self) -> &[Arc<dyn Step>] {
        &self.post_job
    }

    /// Pre-job, job and post-job steps in execution order
    pub fn all_steps(&self) -> Vec<Arc<dyn Step>> {
        self.pre_job
            .iter()
            .chain(self.job.iter())
            .chain(self.post_job.iter())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pre_job.len() + self.job.len() + self.post_job.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn enabled_only(steps: Vec<Arc<dyn Step>>) -> Vec<Arc<dyn Step>> {
    steps
        .into_iter()
        .filter(|step| {
            if !step.enabled() {
                debug!(step = %step.display_name(), "Dropping disabled step");
            }
            step.enabled()
        })
        .collect()
}
