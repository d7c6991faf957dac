use std::io::Write;
use std::path::PathBuf;

use taskloom_core::config::AppConfig;
use taskloom_core::error::LoomError;
use taskloom_core::workflow::WorkflowFile;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[scheduler]
max_parallel = 8
workflow_timeout_secs = 120
task_timeout_secs = 15
max_retries = 2

[graph]
max_iterations = 12
session_ttl_secs = 600

[checkpoint]
path = "/tmp/taskloom-test/checkpoints.db"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.scheduler.max_parallel, 8);
    assert_eq!(config.scheduler.workflow_timeout_secs, 120);
    assert_eq!(config.scheduler.task_timeout_secs, 15);
    assert_eq!(config.scheduler.max_retries, 2);
    assert_eq!(config.graph.max_iterations, 12);
    assert_eq!(config.graph.session_ttl_secs, 600);
    assert_eq!(
        config.checkpoint_path(),
        Some(PathBuf::from("/tmp/taskloom-test/checkpoints.db"))
    );
}

#[test]
fn test_env_var_expansion_in_file() {
    std::env::set_var("TASKLOOM_TEST_CP_DIR", "/var/lib/loom");
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[checkpoint]\npath = \"${TASKLOOM_TEST_CP_DIR}/cp.db\"\n")
        .expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.checkpoint_path(),
        Some(PathBuf::from("/var/lib/loom/cp.db"))
    );
    std::env::remove_var("TASKLOOM_TEST_CP_DIR");
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, LoomError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_toml_is_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[scheduler\nmax_parallel = 2").expect("write toml");
    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, LoomError::Config(_)));
}

#[test]
fn test_workflow_file_uses_scheduler_defaults() {
    let config = AppConfig::parse("[scheduler]\nmax_parallel = 3\nmax_retries = 1\n").unwrap();
    let workflow = WorkflowFile::from_toml(
        r#"
name = "nightly"

[[tasks]]
id = "fetch"
agent_type = "echo"

[[tasks]]
id = "report"
agent_type = "echo"
depends_on = ["fetch"]
retries = 0
priority = "high"
"#,
    )
    .unwrap()
    .into_definition(&config.scheduler);

    assert_eq!(workflow.name, "nightly");
    assert_eq!(workflow.max_parallel, 3);
    assert_eq!(workflow.timeout_secs, 300);
    assert_eq!(workflow.tasks.len(), 2);
    assert_eq!(workflow.task("fetch").unwrap().retries, 1);
    assert_eq!(workflow.task("fetch").unwrap().name, "fetch");
    assert_eq!(workflow.task("report").unwrap().retries, 0);
    assert_eq!(workflow.task("report").unwrap().depends_on, vec!["fetch"]);
}
