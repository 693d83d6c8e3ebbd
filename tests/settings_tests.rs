mod common;

use common::*;
use pipeline_agent::job::{AgentSettings, LoadError};
use std::time::Duration;

#[test]
fn test_default_settings() {
    let settings = AgentSettings::default();
    assert!(!settings.fail_job_when_agent_dies);
    assert!(!settings.overwrite_temp);
    assert!(!settings.use_graceful_shutdown);
    assert_eq!(settings.sigint_timeout(), Duration::from_millis(7500));
    assert_eq!(settings.sigterm_timeout(), Duration::from_millis(2500));
}

#[test]
fn test_load_minimal_settings() {
    let dir = create_test_dir();
    let path = write_file(dir.path(), "agent.yaml", "overwrite_temp: true");

    let settings = AgentSettings::load(&path).unwrap();
    assert!(settings.overwrite_temp);
    assert!(!settings.fail_job_when_agent_dies);
    assert_eq!(settings.container_engine, "docker");
}

#[test]
fn test_load_full_settings() {
    let dir = create_test_dir();
    let path = write_file(
        dir.path(),
        "agent.yaml",
        r#"
fail_job_when_agent_dies: true
overwrite_temp: true
sigint_timeout_ms: 1000
sigterm_timeout_ms: 500
use_graceful_shutdown: true
temp_directory: /agent/_work/_temp
work_directory: /agent/_work
container_engine: podman
"#,
    );

    let settings = AgentSettings::load(&path).unwrap();
    assert!(settings.fail_job_when_agent_dies);
    assert!(settings.use_graceful_shutdown);
    assert_eq!(settings.sigint_timeout(), Duration::from_secs(1));
    assert_eq!(settings.sigterm_timeout(), Duration::from_millis(500));
    assert_eq!(settings.temp_directory, std::path::PathBuf::from("/agent/_work/_temp"));
    assert_eq!(settings.container_engine, "podman");
}

#[test]
fn test_load_invalid_settings() {
    let dir = create_test_dir();
    let path = write_file(dir.path(), "agent.yaml", "sigint_timeout_ms: soon");

    let err = AgentSettings::load(&path).unwrap_err();
    assert!(matches!(err, LoadError::Yaml { ref file, .. } if file.ends_with("agent.yaml")));
}

#[test]
fn test_load_missing_file() {
    let dir = create_test_dir();
    let err = AgentSettings::load(dir.path().join("nope.yaml")).unwrap_err();
    assert!(matches!(err, LoadError::Io(_)));
}

#[test]
fn test_env_overrides_win_over_file() {
    let settings = AgentSettings {
        fail_job_when_agent_dies: false,
        ..Default::default()
    }
    .with_overrides(|name| match name {
        "AGENT_FAIL_JOB_WHEN_AGENT_DIES" => Some("TRUE".to_string()),
        _ => None,
    });
    assert!(settings.fail_job_when_agent_dies);
    assert!(!settings.overwrite_temp);
}
