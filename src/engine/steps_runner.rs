//! Steps runner
//!
//! Drives a job's steps strictly in order. For each step:
//!
//! 1. drain job-level pending commands
//! 2. start the step context
//! 3. arm the job-cancellation hook, or apply the shutdown policy if the job
//!    is already cancelled
//! 4. evaluate the condition (false → `Skipped`, error → `Failed`)
//! 5. run the body under the step timeout, then drain the step's pending
//!    commands into its command result
//! 6. apply continue-on-error, release the hook and merge into the job
//!
//! When the job is cancelled while a step runs, the step's condition is
//! re-evaluated against the cancelled job. Steps whose condition still
//! holds (`always()`) run to completion; the rest have their token cancelled.
//!
//! The runner never fails: every problem ends up in a step result.

use std::future::{pending, Future};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::agent::AgentContext;
use super::console;
use super::error::StepError;
use super::result::TaskOutcome;
use super::step::Step;
use super::steps_queue::StepsQueue;
use crate::job::context::ExecutionContext;
use crate::job::expressions::{ConditionContext, ConditionExpressionManager, ExpressionManager};

pub struct StepsRunner {
    agent: AgentContext,
    expressions: Arc<dyn ExpressionManager>,
}

/// One-shot hook on the job token, active while a step runs
struct CancelHook {
    token: Option<CancellationToken>,
}

impl CancelHook {
    fn disarmed() -> Self {
        Self { token: None }
    }

    fn armed(token: CancellationToken) -> Self {
        Self { token: Some(token) }
    }

    /// True exactly once, if the job was cancelled while armed
    fn poll_fired(&mut self) -> bool {
        if self.token.as_ref().is_some_and(|t| t.is_cancelled()) {
            self.token = None;
            return true;
        }
        false
    }

    async fn fired(&mut self) {
        match &self.token {
            Some(token) => token.cancelled().await,
            None => pending::<()>().await,
        }
        self.token = None;
    }

    fn release(&mut self) {
        self.token = None;
    }
}

/// Per-step timeout and cancellation state
struct StepWatch {
    hook: CancelHook,
    step_token: CancellationToken,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    timed_out: bool,
}

impl StepWatch {
    fn new(step_token: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            hook: CancelHook::disarmed(),
            step_token,
            timeout,
            // too far out to represent means no deadline
            deadline: timeout.and_then(|t| Instant::now().checked_add(t)),
            timed_out: false,
        }
    }
}

impl StepsRunner {
    pub fn new(agent: AgentContext) -> Self {
        Self {
            agent,
            expressions: Arc::new(ConditionExpressionManager),
        }
    }

    pub fn with_expression_manager(mut self, expressions: Arc<dyn ExpressionManager>) -> Self {
        self.expressions = expressions;
        self
    }

    pub fn agent(&self) -> &AgentContext {
        &self.agent
    }

    /// Run pre-job, job and post-job steps as one sequence
    pub async fn run_queue(&self, job: &mut ExecutionContext, queue: &StepsQueue) {
        self.run(job, &queue.all_steps()).await;
    }

    /// Run `steps` in order against `job`, recording each on the job timeline
    #[instrument(skip_all, fields(job = %job.name(), steps = steps.len()))]
    pub async fn run(&self, job: &mut ExecutionContext, steps: &[Arc<dyn Step>]) {
        for step in steps {
            self.drain_job_commands(job).await;

            let mut ctx = job.create_child(step.display_name());
            self.run_step(job, step.as_ref(), &mut ctx).await;
            job.record_step(&ctx);
        }
        self.drain_job_commands(job).await;

        info!(outcome = ?job.result, "Steps finished");
    }

    async fn drain_job_commands(&self, job: &ExecutionContext) {
        for command in job.take_async_commands() {
            let name = command.name().to_string();
            if let Err(e) = command.wait().await {
                job.warning(&format!("Job command '{}' failed: {}", name, e));
            }
        }
    }

    #[instrument(skip_all, fields(step = %step.display_name()))]
    async fn run_step(&self, job: &mut ExecutionContext, step: &dyn Step, ctx: &mut ExecutionContext) {
        ctx.start();
        let mut watch = StepWatch::new(ctx.cancellation_token().clone(), step.timeout());

        if job.cancellation_token().is_cancelled() {
            let outcome = self.force_cancellation_outcome(job);
            debug!(?outcome, "Job already cancelled when step started");
        } else {
            watch.hook = CancelHook::armed(job.cancellation_token().clone());
        }

        if watch.hook.poll_fired() {
            self.on_job_cancelled(job, step, ctx, &watch.step_token);
        }

        let condition = ConditionContext {
            job_result: job.result,
            variables: &ctx.variables,
        };
        let evaluation = step
            .condition()
            .evaluate(self.expressions.as_ref(), &condition, false);
        match evaluation {
            Ok(result) => {
                if !result.trace.is_empty() {
                    ctx.debug(&result.trace);
                }
                if !result.value {
                    ctx.output(&format!("Skipping step '{}' due to condition", step.display_name()));
                    ctx.result = Some(TaskOutcome::Skipped);
                    self.release(&mut watch, job, step, ctx);
                    info!(outcome = ?ctx.result, "Step skipped");
                    return;
                }
            }
            Err(e) => {
                ctx.error(&format!("Failed to evaluate step condition: {}", e));
                ctx.result = Some(TaskOutcome::Failed);
                self.release(&mut watch, job, step, ctx);
                job.result = Some(TaskOutcome::merge(job.result, TaskOutcome::Failed));
                return;
            }
        }

        if cfg!(windows) {
            if let Err(e) = console::switch_to_utf8(console::CODE_PAGE_TIMEOUT).await {
                ctx.warning(&format!("Failed to switch the console code page to UTF-8: {}", e));
            }
        }

        info!("Running step");
        let body = self
            .supervise(&mut watch, job, step, &*ctx, step.run(&*ctx))
            .await;
        let outcome = self.classify(&body, job, &watch, ctx);
        ctx.result = Some(outcome);

        for command in ctx.take_async_commands() {
            let name = command.name().to_string();
            let step_token = watch.step_token.clone();
            let result = self
                .supervise(&mut watch, job, step, &*ctx, command.wait_or_cancel(&step_token))
                .await;
            let outcome = self.classify(&result, job, &watch, ctx);
            if result.is_err() {
                ctx.error(&format!("Async command '{}' ended with {}", name, outcome));
            }
            ctx.command_result = Some(TaskOutcome::merge(ctx.command_result, outcome));
        }
        if let Some(command_result) = ctx.command_result {
            ctx.result = Some(TaskOutcome::merge(ctx.result, command_result));
        }

        if ctx.result == Some(TaskOutcome::Failed) && step.continue_on_error() {
            ctx.output("Step failed but is marked continue-on-error");
            ctx.result = Some(TaskOutcome::SucceededWithIssues);
        }

        self.release(&mut watch, job, step, ctx);

        if let Some(result) = ctx.result {
            job.result = Some(TaskOutcome::merge(job.result, result));
        }
        info!(outcome = ?ctx.result, job_outcome = ?job.result, "Step finished");
    }

    /// Drive `fut` while watching the step timeout and the job-cancel hook
    async fn supervise<T>(
        &self,
        watch: &mut StepWatch,
        job: &mut ExecutionContext,
        step: &dyn Step,
        ctx: &ExecutionContext,
        fut: impl Future<Output = T>,
    ) -> T {
        tokio::pin!(fut);
        loop {
            let deadline = if watch.timed_out { None } else { watch.deadline };
            let timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                output = &mut fut => return output,
                _ = timer => {
                    watch.timed_out = true;
                    let timeout = watch.timeout.unwrap_or_default();
                    ctx.error(&format!("The step timed out after {:?} and was cancelled", timeout));
                    watch.step_token.cancel();
                }
                _ = watch.hook.fired() => {
                    self.on_job_cancelled(job, step, ctx, &watch.step_token);
                }
            }
        }
    }

    /// Job cancelled while the step is active: mark the job, then let the
    /// step finish only if its condition still holds
    fn on_job_cancelled(
        &self,
        job: &mut ExecutionContext,
        step: &dyn Step,
        ctx: &ExecutionContext,
        step_token: &CancellationToken,
    ) {
        self.force_cancellation_outcome(job);

        let condition = ConditionContext {
            job_result: job.result,
            variables: &ctx.variables,
        };
        match step
            .condition()
            .evaluate(self.expressions.as_ref(), &condition, true)
        {
            Ok(result) if result.value => {
                info!("Job cancelled; step condition still holds, letting it finish");
            }
            Ok(_) => {
                info!("Job cancelled; cancelling step");
                step_token.cancel();
            }
            Err(e) => {
                warn!(error = %e, "Condition re-evaluation failed; cancelling step");
                step_token.cancel();
            }
        }
    }

    /// Overwrite the job result with the cancellation outcome. This is the
    /// one place a job result is assigned instead of merged: agent shutdown
    /// with `fail_job_when_agent_dies` turns an already `Canceled` job into
    /// `Failed`.
    fn force_cancellation_outcome(&self, job: &mut ExecutionContext) -> TaskOutcome {
        let outcome = self.cancellation_outcome(job);
        job.result = Some(outcome);
        outcome
    }

    /// Outcome a cancelled job is forced to
    fn cancellation_outcome(&self, job: &ExecutionContext) -> TaskOutcome {
        if self.agent.is_shutting_down() && self.agent.settings().fail_job_when_agent_dies {
            info!(target: "telemetry", job = %job.name(), "Job failed because the agent is shutting down");
            TaskOutcome::Failed
        } else {
            TaskOutcome::Canceled
        }
    }

    fn classify(
        &self,
        result: &Result<(), StepError>,
        job: &ExecutionContext,
        watch: &StepWatch,
        ctx: &ExecutionContext,
    ) -> TaskOutcome {
        match result {
            Ok(()) => TaskOutcome::Succeeded,
            Err(e) if e.is_canceled() && watch.step_token.is_cancelled() => {
                if !job.cancellation_token().is_cancelled() {
                    // own token fired without the job being cancelled: timeout
                    TaskOutcome::Failed
                } else {
                    self.cancellation_outcome(job)
                }
            }
            Err(e) => {
                ctx.error(&e.to_string());
                TaskOutcome::Failed
            }
        }
    }

    fn release(
        &self,
        watch: &mut StepWatch,
        job: &mut ExecutionContext,
        step: &dyn Step,
        ctx: &ExecutionContext,
    ) {
        if watch.hook.poll_fired() {
            self.on_job_cancelled(job, step, ctx, &watch.step_token);
        }
        watch.hook.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_fires_once() {
        let token = CancellationToken::new();
        let mut hook = CancelHook::armed(token.clone());
        assert!(!hook.poll_fired());
        token.cancel();
        assert!(hook.poll_fired());
        assert!(!hook.poll_fired());
    }

    #[test]
    fn test_released_hook_never_fires() {
        let token = CancellationToken::new();
        let mut hook = CancelHook::armed(token.clone());
        hook.release();
        token.cancel();
        assert!(!hook.poll_fired());
    }
}
