use super::*;
use serial_test::serial;

async fn test_core() -> (tempfile::TempDir, Arc<Core>) {
    let dir = tempfile::tempdir().unwrap();
    let core = Core::init(dir.path()).unwrap();
    (dir, core)
}

#[tokio::test]
#[serial]
async fn status_reports_counts() {
    let (_dir, core) = test_core().await;
    let reply = handle_command(&core, "status", "").await;
    assert!(reply.contains("Agents: 0 running"));
    assert!(reply.contains("0 pending"));
}

#[tokio::test]
#[serial]
async fn add_creates_a_task() {
    let (_dir, core) = test_core().await;
    let reply = handle_command(&core, "add", "demo write a readme").await;
    assert!(reply.starts_with("Created task "), "reply: {reply}");

    let tasks = core
        .tasks
        .list(&crate::store::TaskFilter::default())
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].project, "demo");
    assert_eq!(tasks[0].description, "write a readme");
}

#[tokio::test]
#[serial]
async fn usage_messages_for_missing_arguments() {
    let (_dir, core) = test_core().await;
    assert!(handle_command(&core, "spawn", "").await.contains("Usage:"));
    assert!(handle_command(&core, "add", "demo").await.contains("Usage:"));
    assert!(handle_command(&core, "stop", "").await.contains("Usage:"));
}

#[tokio::test]
#[serial]
async fn natural_language_routes_to_known_commands() {
    let (_dir, core) = test_core().await;
    let reply = handle_command(&core, "message", "what's the status?").await;
    assert!(reply.contains("Agents:"));

    let reply = handle_command(&core, "message", "do a backflip").await;
    assert!(reply.contains("/status"));
}

#[tokio::test]
#[serial]
async fn unknown_command_is_reported() {
    let (_dir, core) = test_core().await;
    let reply = handle_command(&core, "bogus", "").await;
    assert!(reply.contains("Unknown command"));
}
