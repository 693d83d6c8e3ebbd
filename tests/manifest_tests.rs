mod common;

use common::*;
use pipeline_agent::engine::{AgentContext, StepsQueue, StepsRunner, TaskOutcome};
use pipeline_agent::job::{AgentSettings, ExecutionContext, JobManifest, LoadError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[test]
fn test_load_file() {
    let dir = create_test_dir();
    let path = write_file(
        dir.path(),
        "job.yaml",
        r#"
name: ci
steps:
  - name: Test
    file: cargo
    args: [test, --workspace]
    timeout_ms: 60000
"#,
    );

    let manifest = JobManifest::load_file(&path).unwrap();
    assert_eq!(manifest.name, "ci");
    assert_eq!(manifest.steps[0].args, vec!["test", "--workspace"]);
}

#[test]
fn test_load_rejects_unknown_step_field() {
    let dir = create_test_dir();
    let path = write_file(
        dir.path(),
        "job.yaml",
        "name: ci\nsteps:\n  - name: Test\n    run: make\n    retries: 3\n",
    );

    let err = JobManifest::load_file(&path).unwrap_err();
    assert!(matches!(err, LoadError::Yaml { .. }));
}

#[test]
fn test_step_without_command_is_invalid() {
    let err = JobManifest::parse("name: ci\nsteps:\n  - name: Empty\n", "job.yaml").unwrap_err();
    assert!(matches!(err, LoadError::InvalidStep { ref step, .. } if step == "Empty"));
}

#[cfg(unix)]
async fn run_manifest(yaml: &str, work: &std::path::Path) -> ExecutionContext {
    let settings = AgentSettings {
        work_directory: work.to_path_buf(),
        temp_directory: work.join("_temp"),
        ..Default::default()
    };
    let manifest = JobManifest::parse(yaml, "job.yaml").unwrap();
    let agent = AgentContext::new(settings);
    let queue = StepsQueue::from_initialize_result(
        manifest.initialize(agent.settings().clone()).unwrap(),
    );
    let mut job = ExecutionContext::new_job(
        &manifest.name,
        manifest.job_variables(),
        CancellationToken::new(),
    );
    job.start();
    StepsRunner::new(agent).run_queue(&mut job, &queue).await;
    job
}

#[cfg(unix)]
#[tokio::test]
async fn test_end_to_end_on_host() {
    let dir = create_test_dir();
    let job = run_manifest(
        r#"
name: build
variables:
  Build.Configuration: release
  Output.Name: app-$(Build.Configuration)
steps:
  - name: Write
    run: echo "$(Output.Name)" > artifact.txt
  - name: Flaky
    run: exit 3
    continue_on_error: true
  - name: Read
    run: cat artifact.txt; echo "env=$BUILD_CONFIGURATION"
  - name: Only on main
    run: exit 1
    conditions:
      - { variable: Build.SourceBranch, operator: equals, value: refs/heads/main }
post_job:
  - name: Cleanup
    run: rm artifact.txt
    condition: always()
"#,
        dir.path(),
    )
    .await;

    let results: Vec<_> = job.timeline().iter().map(|r| (r.name.as_str(), r.result)).collect();
    assert_eq!(
        results,
        vec![
            ("Write", TaskOutcome::Succeeded),
            ("Flaky", TaskOutcome::SucceededWithIssues),
            ("Read", TaskOutcome::Succeeded),
            ("Only on main", TaskOutcome::Skipped),
            ("Cleanup", TaskOutcome::Succeeded),
        ]
    );
    assert!(job.timeline()[2].log_contains("app-release"));
    assert!(job.timeline()[2].log_contains("env=release"));
    assert!(!dir.path().join("artifact.txt").exists());
    assert_eq!(job.result, Some(TaskOutcome::SucceededWithIssues));
}

#[cfg(unix)]
#[tokio::test]
async fn test_overwrite_temp_and_working_directory() {
    let dir = create_test_dir();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    let settings = Arc::new(AgentSettings {
        overwrite_temp: true,
        work_directory: dir.path().to_path_buf(),
        temp_directory: dir.path().join("_temp"),
        ..Default::default()
    });
    let manifest = JobManifest::parse(
        r#"
name: temp
steps:
  - name: Show
    run: echo "tmp=$TMPDIR"; pwd
    working_directory: sub
"#,
        "job.yaml",
    )
    .unwrap();
    let queue = StepsQueue::from_initialize_result(manifest.initialize(settings.clone()).unwrap());
    let mut job = ExecutionContext::new_job("temp", manifest.job_variables(), CancellationToken::new());
    StepsRunner::new(AgentContext::new((*settings).clone()))
        .run_queue(&mut job, &queue)
        .await;

    let record = &job.timeline()[0];
    assert_eq!(record.result, TaskOutcome::Succeeded);
    assert!(record.log_contains(&format!("tmp={}", dir.path().join("_temp").display())));
    assert!(record.log_contains("sub"));
    assert!(dir.path().join("_temp").is_dir());
}
