#![cfg(unix)]

mod common;

use pipeline_agent::engine::{AgentContext, ProcessStep, Step, StepOptions, StepsQueue, StepsRunner, TaskOutcome};
use pipeline_agent::job::{
    AgentSettings, ContainerInfo, ExecutionContext, ExecutionTarget, JobManifest, Mount, Variables,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn settings(dir: &Path, engine: &Path) -> AgentSettings {
    AgentSettings {
        temp_directory: dir.join("_temp"),
        work_directory: dir.to_path_buf(),
        container_engine: engine.to_string_lossy().to_string(),
        ..Default::default()
    }
}

fn new_job() -> ExecutionContext {
    ExecutionContext::new_job("job", Variables::new(), CancellationToken::new())
}

fn calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_container_exit_137_is_explained() {
    let dir = common::create_test_dir();
    let engine = common::fake_engine(dir.path(), 137);
    let settings = Arc::new(settings(dir.path(), &engine));

    let container = ContainerInfo::new("builder", "node:20")
        .with_mount(Mount::new(dir.path(), "/__w", false))
        .with_id("fakecontainer0001");
    let step = ProcessStep::script(
        StepOptions::new("compile").with_target(ExecutionTarget::Container(container)),
        "make all",
        settings.clone(),
    )
    .working_directory(&dir.path().join("src").to_string_lossy());
    let steps: Vec<Arc<dyn Step>> = vec![Arc::new(step)];

    let mut job = new_job();
    StepsRunner::new(AgentContext::new((*settings).clone()))
        .run(&mut job, &steps)
        .await;

    let record = &job.timeline()[0];
    assert_eq!(record.result, TaskOutcome::Failed);
    assert!(record.log_contains("out of memory"));
    assert!(record.log_contains("exec output"));
    assert_eq!(job.result, Some(TaskOutcome::Failed));

    let payload: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("payload.json")).unwrap())
            .unwrap();
    assert_eq!(payload["handler"], "sh");
    assert_eq!(payload["args"], "-c 'make all'");
    assert_eq!(payload["workDir"], "/__w/src");

    let exec = calls(dir.path()).join("\n");
    assert!(exec.contains("exec -i -w /root fakecontainer0001 node /__w/_temp/containerHandlerInvoker.js"));
    assert!(dir.path().join("_temp/containerHandlerInvoker.js").exists());
}

#[tokio::test]
async fn test_manifest_container_lifecycle() {
    let dir = common::create_test_dir();
    let engine = common::fake_engine(dir.path(), 0);
    let settings = Arc::new(settings(dir.path(), &engine));

    let manifest = JobManifest::parse(
        &format!(
            r#"
name: containerized
containers:
  builder:
    image: node:20
    user_id: "1001"
    user_name: builder
    mounts:
      - {{ source: {}, target: /__w }}
steps:
  - name: Compile
    run: make
    target: builder
"#,
            dir.path().display()
        ),
        "job.yaml",
    )
    .unwrap();

    let queue = StepsQueue::from_initialize_result(manifest.initialize(settings.clone()).unwrap());
    let mut job = new_job();
    StepsRunner::new(AgentContext::new((*settings).clone()))
        .run_queue(&mut job, &queue)
        .await;

    let results: Vec<_> = job.timeline().iter().map(|r| (r.name.as_str(), r.result)).collect();
    assert_eq!(
        results,
        vec![
            ("Start container builder", TaskOutcome::Succeeded),
            ("Compile", TaskOutcome::Succeeded),
            ("Stop container builder", TaskOutcome::Succeeded),
        ]
    );

    let verbs: Vec<String> = calls(dir.path())
        .iter()
        .filter_map(|c| c.split_whitespace().next().map(str::to_string))
        .collect();
    assert_eq!(verbs, vec!["pull", "create", "start", "exec", "stop", "rm"]);

    let exec = calls(dir.path())[3].clone();
    assert!(exec.starts_with("exec -i -u 1001 -w /home/builder fakecontainer0001"));
}

#[tokio::test]
async fn test_stop_runs_after_failure() {
    let dir = common::create_test_dir();
    let engine = common::fake_engine(dir.path(), 2);
    let settings = Arc::new(settings(dir.path(), &engine));

    let manifest = JobManifest::parse(
        &format!(
            r#"
name: failing
containers:
  builder:
    image: node:20
    mounts:
      - {{ source: {}, target: /__w }}
steps:
  - name: Compile
    run: make
    target: builder
  - name: Package
    run: make package
    target: builder
"#,
            dir.path().display()
        ),
        "job.yaml",
    )
    .unwrap();

    let queue = StepsQueue::from_initialize_result(manifest.initialize(settings.clone()).unwrap());
    let mut job = new_job();
    StepsRunner::new(AgentContext::new((*settings).clone()))
        .run_queue(&mut job, &queue)
        .await;

    let results: Vec<_> = job.timeline().iter().map(|r| r.result).collect();
    assert_eq!(
        results,
        vec![
            TaskOutcome::Succeeded,
            TaskOutcome::Failed,
            TaskOutcome::Skipped,
            TaskOutcome::Succeeded,
        ]
    );
    assert!(calls(dir.path()).iter().any(|c| c.starts_with("rm")));
}
