use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pipeline_agent::host::exit_codes;
use pipeline_agent::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipeline-agent")]
#[command(about = "Run pipeline job steps on this machine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job manifest
    Run {
        /// Path to the job manifest YAML file
        #[arg(value_name = "FILE")]
        manifest: PathBuf,

        /// Agent settings YAML file
        #[arg(short, long, value_name = "FILE")]
        settings: Option<PathBuf>,
    },

    /// Check a job manifest without running it
    Validate {
        #[arg(value_name = "FILE")]
        manifest: PathBuf,
    },

    /// Explain a container exit code
    ExplainExit {
        #[arg(allow_negative_numbers = true)]
        code: i32,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        "pipeline_agent=debug"
    } else {
        "pipeline_agent=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(error = %e, "Agent failed");
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    match cli.command {
        Commands::Run { manifest, settings } => run_job(&manifest, settings.as_deref()).await,
        Commands::Validate { manifest } => {
            let manifest = JobManifest::load_file(&manifest)?;
            println!(
                "{}: {} pre-job, {} job, {} post-job steps, {} containers",
                manifest.name,
                manifest.pre_job.len(),
                manifest.steps.len(),
                manifest.post_job.len(),
                manifest.containers.len()
            );
            Ok(true)
        }
        Commands::ExplainExit { code } => {
            println!("{}: {}", code, exit_codes::describe(code));
            Ok(true)
        }
    }
}

async fn run_job(manifest_path: &Path, settings_path: Option<&Path>) -> anyhow::Result<bool> {
    let settings = match settings_path {
        Some(path) => AgentSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => AgentSettings::default(),
    }
    .with_env_overrides();

    let manifest = JobManifest::load_file(manifest_path)?;
    let agent = AgentContext::new(settings);
    let queue = StepsQueue::from_initialize_result(manifest.initialize(agent.settings().clone())?);

    let mut variables = manifest.job_variables();
    variables.set(
        "Agent.TempDirectory",
        agent.settings().temp_directory.to_string_lossy(),
    );
    variables.set(
        "Agent.WorkFolder",
        agent.settings().work_directory.to_string_lossy(),
    );

    let job_token = CancellationToken::new();
    let mut job = ExecutionContext::new_job(&manifest.name, variables, job_token.clone());
    job.start();

    let watcher = tokio::spawn(watch_signals(job_token, agent.clone()));

    info!(job = %manifest.name, steps = queue.len(), "Running job");
    StepsRunner::new(agent).run_queue(&mut job, &queue).await;
    watcher.abort();

    let outcome = job.result.unwrap_or(TaskOutcome::Succeeded);
    for record in job.timeline() {
        let elapsed = record.finished_at - record.started_at;
        println!(
            "{:<40} {:<20} {:>6}ms",
            record.name,
            record.result.to_string(),
            elapsed.num_milliseconds()
        );
    }
    println!("Job {}: {}", manifest.name, outcome);

    Ok(outcome.is_success())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentSignal {
    Interrupt,
    Terminate,
}

/// First Ctrl+C cancels the job; a second Ctrl+C or SIGTERM shuts the agent down
async fn watch_signals(job: CancellationToken, agent: AgentContext) {
    match next_signal().await {
        Some(AgentSignal::Interrupt) => {
            warn!("Cancelling job (press Ctrl+C again to shut the agent down)");
            job.cancel();
        }
        Some(AgentSignal::Terminate) => {
            warn!("Agent shutting down");
            agent.signal_shutdown();
            job.cancel();
            return;
        }
        None => return,
    }

    if next_signal().await.is_some() {
        warn!("Agent shutting down");
        agent.signal_shutdown();
    }
}

#[cfg(unix)]
async fn next_signal() -> Option<AgentSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            return tokio::signal::ctrl_c()
                .await
                .ok()
                .map(|_| AgentSignal::Interrupt);
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.ok().map(|_| AgentSignal::Interrupt),
        _ = terminate.recv() => Some(AgentSignal::Terminate),
    }
}

#[cfg(not(unix))]
async fn next_signal() -> Option<AgentSignal> {
    tokio::signal::ctrl_c()
        .await
        .ok()
        .map(|_| AgentSignal::Interrupt)
}
