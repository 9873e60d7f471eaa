use super::*;
use crate::config::{AgentsConfig, ProviderConfig};
use std::time::Duration;

fn test_config() -> Config {
    let mut config = Config::default();
    config.providers.insert(
        "test".to_string(),
        ProviderConfig {
            kind: "custom".to_string(),
            command: Some("sh -c".to_string()),
            model: None,
            default: true,
        },
    );
    config.agents = AgentsConfig {
        default_provider: "test".to_string(),
        ..Default::default()
    };
    config
}

fn setup(dir: &Path) -> AgentManager {
    crate::config::ensure_adt_home(dir).unwrap();
    let project_dir = dir.join("workdirs").join("demo");
    std::fs::create_dir_all(&project_dir).unwrap();
    std::fs::write(
        dir.join("projects.json"),
        serde_json::to_string(&vec![crate::models::Project {
            name: "demo".to_string(),
            path: project_dir.to_string_lossy().to_string(),
            description: None,
            tags: vec![],
        }])
        .unwrap(),
    )
    .unwrap();

    AgentManager::new(
        dir,
        test_config(),
        ProjectRegistry::new(dir),
        Arc::new(Scrubber::new()),
        Arc::new(EventBus::new()),
    )
}

async fn wait_for_exit(
    rx: &mut tokio::sync::broadcast::Receiver<crate::events::Event>,
) -> crate::events::Event {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("agent should exit")
            .unwrap();
        if event.event_type == EventType::AgentTaskComplete {
            return event;
        }
    }
}

#[test]
fn command_for_known_providers() {
    let provider = ProviderConfig {
        kind: "claude-cli".to_string(),
        command: None,
        model: None,
        default: true,
    };
    let (program, args) = build_agent_command(&provider, Some("do things"));
    assert_eq!(program, "claude");
    assert_eq!(args, vec!["-p", "do things"]);

    let provider = ProviderConfig {
        kind: "custom".to_string(),
        command: Some("sh -c".to_string()),
        model: None,
        default: false,
    };
    let (program, args) = build_agent_command(&provider, Some("echo hi"));
    assert_eq!(program, "sh");
    assert_eq!(args, vec!["-c", "echo hi"]);
}

#[tokio::test]
async fn spawn_runs_task_and_captures_output() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path());
    let mut rx = manager.events.subscribe();

    let session = manager
        .spawn("demo", None, None, Some("echo hello-from-agent"))
        .unwrap();
    assert_eq!(session.status, AgentStatus::Working);
    assert!(session.pid.is_some());

    let event = wait_for_exit(&mut rx).await;
    assert_eq!(event.data["exit_code"], 0);
    assert!(event.data["output"]
        .as_str()
        .unwrap()
        .contains("hello-from-agent"));

    let session = manager.get("demo").unwrap();
    assert_eq!(session.status, AgentStatus::Stopped);
    assert!(session.pid.is_none());

    let logs = manager.get_logs("demo", 50).unwrap();
    assert!(logs.contains("hello-from-agent"));
    assert!(logs.contains("=== Agent started"));
}

#[tokio::test]
async fn nonzero_exit_marks_error_with_log_context() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path());
    let mut rx = manager.events.subscribe();

    manager
        .spawn("demo", None, None, Some("echo something broke; exit 3"))
        .unwrap();
    let event = wait_for_exit(&mut rx).await;
    assert_eq!(event.data["exit_code"], 3);

    let session = manager.get("demo").unwrap();
    assert_eq!(session.status, AgentStatus::Error);
    let error = session.error.unwrap();
    assert!(error.contains("Exit code 3"), "error was: {error}");
    assert!(error.contains("something broke"));
}

#[tokio::test]
async fn second_spawn_conflicts_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path());

    manager.spawn("demo", None, None, Some("sleep 5")).unwrap();
    match manager.spawn("demo", None, None, Some("echo nope")) {
        Err(AdtError::Conflict(msg)) => assert!(msg.contains("already running")),
        other => panic!("expected conflict, got {other:?}"),
    }

    assert!(manager.stop("demo", true).unwrap());
    let session = manager.get("demo").unwrap();
    assert_eq!(session.status, AgentStatus::Stopped);
}

#[tokio::test]
async fn stop_without_session_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path());
    assert!(!manager.stop("ghost", false).unwrap());
}

#[tokio::test]
async fn retry_respawns_from_stopped_and_errored() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path());
    let mut rx = manager.events.subscribe();

    manager
        .spawn("demo", None, None, Some("echo first-run"))
        .unwrap();
    wait_for_exit(&mut rx).await;

    let retried = manager.retry("demo").unwrap();
    assert_eq!(retried.retry_count, 1);
    assert_eq!(
        retried.current_task.as_deref(),
        Some("echo first-run")
    );
    wait_for_exit(&mut rx).await;

    // A live session cannot be retried.
    manager.spawn("demo", None, None, Some("sleep 5")).unwrap();
    assert!(matches!(manager.retry("demo"), Err(AdtError::Conflict(_))));
    manager.stop("demo", true).unwrap();
}

#[tokio::test]
async fn logs_are_scrubbed_on_read_but_raw_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path());
    let mut rx = manager.events.subscribe();

    let secret = "sk-ant-REDACTED";
    manager
        .spawn("demo", None, None, Some(&format!("echo {secret}")))
        .unwrap();
    wait_for_exit(&mut rx).await;

    let logs = manager.get_logs("demo", 50).unwrap();
    assert!(!logs.contains(secret));
    assert!(logs.contains(crate::constants::REDACTED));

    // The raw file still holds the secret; scrubbing is read-side only.
    let raw = std::fs::read_to_string(manager.log_path("demo")).unwrap();
    assert!(raw.contains(secret));
}

#[tokio::test]
async fn stale_state_is_demoted_on_load() {
    let dir = tempfile::tempdir().unwrap();
    crate::config::ensure_adt_home(dir.path()).unwrap();
    let stale = AgentSession {
        project: "demo".to_string(),
        status: AgentStatus::Working,
        provider: "test".to_string(),
        pid: Some(4_194_300),
        worktree: None,
        current_task: Some("lost".to_string()),
        started_at: Some(Utc::now()),
        last_activity: Some(Utc::now()),
        error: None,
        retry_count: 0,
    };
    save_session(dir.path(), &stale).unwrap();

    let manager = setup(dir.path());
    let session = manager.get("demo").unwrap();
    assert_eq!(session.status, AgentStatus::Stopped);
    assert!(session.pid.is_none());
}

#[tokio::test]
async fn cleanup_removes_stopped_session_state() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path());
    let mut rx = manager.events.subscribe();

    manager.spawn("demo", None, None, Some("echo bye")).unwrap();
    wait_for_exit(&mut rx).await;
    assert!(dir.path().join("agents/demo.state.json").exists());

    assert_eq!(manager.cleanup_stopped(), 1);
    assert!(manager.get("demo").is_none());
    assert!(!dir.path().join("agents/demo.state.json").exists());
    assert_eq!(manager.cleanup_stopped(), 0);
}

#[tokio::test]
async fn spawn_unknown_project_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path());
    assert!(matches!(
        manager.spawn("ghost", None, None, None),
        Err(AdtError::NotFound(_))
    ));
}
