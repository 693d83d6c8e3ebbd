//! Job container lifecycle steps
//!
//! `StartContainerStep` runs in pre-job: pull, create and start the
//! container, then publish its id to every step targeting it.
//! `StopContainerStep` runs in post-job with `always()` so containers are
//! torn down even after failure or cancellation.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::error::StepError;
use super::step::{forward_output, Step, StepOptions};
use crate::host::{ContainerEngine, HostError, ProcessInvoker};
use crate::job::conditions::StepCondition;
use crate::job::context::ExecutionContext;
use crate::job::settings::AgentSettings;
use crate::job::target::ContainerInfo;

pub struct StartContainerStep {
    options: StepOptions,
    container: ContainerInfo,
    engine: ContainerEngine,
}

impl StartContainerStep {
    pub fn new(container: ContainerInfo, settings: &Arc<AgentSettings>) -> Self {
        Self {
            options: StepOptions::new(&format!("Start container {}", container.name)),
            engine: ContainerEngine::resolve(&settings.container_engine, ProcessInvoker::new()),
            container,
        }
    }

    pub fn with_engine(mut self, engine: ContainerEngine) -> Self {
        self.engine = engine;
        self
    }
}

#[async_trait]
impl Step for StartContainerStep {
    fn options(&self) -> &StepOptions {
        &self.options
    }

    #[instrument(skip_all, fields(container = %self.container.name))]
    async fn run(&self, ctx: &ExecutionContext) -> Result<(), StepError> {
        if let Some(id) = self.container.id() {
            ctx.output(&format!("Container {} is already running ({})", self.container.name, id));
            return Ok(());
        }

        let token = ctx.cancellation_token().clone();
        let id = forward_output(ctx, |sink| async move {
            self.engine.pull(&self.container.image, Some(&sink), &token).await?;
            let id = self.engine.create(&self.container, Some(&sink), &token).await?;
            self.engine.start(&id, Some(&sink), &token).await?;
            Ok::<_, HostError>(id)
        })
        .await?;

        if !self.container.set_id(&id) {
            warn!(id = %id, "Container id was already set");
        }
        info!(id = %id, image = %self.container.image, "Container started");
        ctx.output(&format!("Started container {} ({})", self.container.name, id));
        Ok(())
    }
}

pub struct StopContainerStep {
    options: StepOptions,
    container: ContainerInfo,
    engine: ContainerEngine,
}

impl StopContainerStep {
    pub fn new(container: ContainerInfo, settings: &Arc<AgentSettings>) -> Self {
        Self {
            options: StepOptions::new(&format!("Stop container {}", container.name))
                .with_condition(StepCondition::always()),
            engine: ContainerEngine::resolve(&settings.container_engine, ProcessInvoker::new()),
            container,
        }
    }

    pub fn with_engine(mut self, engine: ContainerEngine) -> Self {
        self.engine = engine;
        self
    }
}

#[async_trait]
impl Step for StopContainerStep {
    fn options(&self) -> &StepOptions {
        &self.options
    }

    #[instrument(skip_all, fields(container = %self.container.name))]
    async fn run(&self, ctx: &ExecutionContext) -> Result<(), StepError> {
        let Some(id) = self.container.id() else {
            ctx.output(&format!("Container {} was never started", self.container.name));
            return Ok(());
        };

        let token = ctx.cancellation_token().clone();
        forward_output(ctx, |sink| async move {
            // a failed stop still gets the forced remove
            if let Err(e) = self.engine.stop(id, Some(&sink), &token).await {
                warn!(id, error = %e, "Failed to stop container");
            }
            self.engine.remove(id, Some(&sink), &token).await
        })
        .await?;

        info!(id, "Container removed");
        Ok(())
    }
}

