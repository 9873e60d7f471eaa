use super::*;
use crate::events::Event;
use std::net::TcpListener;
use std::time::Duration;

fn lsof_available() -> bool {
    std::process::Command::new("lsof")
        .arg("-v")
        .output()
        .is_ok()
}

fn setup(dir: &Path) -> ProcessManager {
    crate::config::ensure_adt_home(dir).unwrap();
    ProcessManager::new(
        dir,
        Arc::new(PortRegistry::open(dir).unwrap()),
        Arc::new(Scrubber::new()),
        Arc::new(EventBus::new()),
    )
}

async fn wait_for_exit(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Event {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("process should exit")
            .unwrap();
        if event.event_type == EventType::ProcessExited {
            return event;
        }
    }
}

#[tokio::test]
async fn register_builds_composite_id_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path());

    let state = manager
        .register("demo", "Front End", "npm run dev", "/tmp", ProcessType::DevServer, Some(5173), None)
        .unwrap();
    assert_eq!(state.id, "demo-front-end");
    assert_eq!(state.status, ProcessStatus::Idle);

    let again = manager
        .register("demo", "Front End", "npm run dev", "/tmp", ProcessType::DevServer, Some(5173), None)
        .unwrap();
    assert_eq!(again.id, state.id);
    assert_eq!(manager.list(Some("demo")).len(), 1);
}

#[tokio::test]
async fn operator_stop_is_classified_as_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path());
    let mut rx = manager.events.subscribe();

    let state = manager
        .register("demo", "svc", "sleep 10", dir.path().to_str().unwrap(), ProcessType::Worker, None, None)
        .unwrap();
    let started = manager.start(&state.id).unwrap();
    assert_eq!(started.status, ProcessStatus::Running);
    assert!(started.pid.is_some());

    manager.stop(&state.id, false).unwrap();
    let event = wait_for_exit(&mut rx).await;
    assert_eq!(event.data["status"], "stopped");

    let state = manager.get(&state.id).unwrap();
    assert_eq!(state.status, ProcessStatus::Stopped);
    assert!(state.error.is_none());
}

#[tokio::test]
async fn crash_is_classified_as_failed_with_derived_error() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path());
    let mut rx = manager.events.subscribe();

    let state = manager
        .register(
            "demo",
            "svc",
            "echo startup cannot bind; exit 2",
            dir.path().to_str().unwrap(),
            ProcessType::DevServer,
            None,
            None,
        )
        .unwrap();
    manager.start(&state.id).unwrap();

    let event = wait_for_exit(&mut rx).await;
    assert_eq!(event.data["exit_code"], 2);
    assert_eq!(event.data["status"], "failed");

    let state = manager.get(&state.id).unwrap();
    assert_eq!(state.status, ProcessStatus::Failed);
    assert_eq!(state.exit_code, Some(2));
    assert!(state.error.unwrap().contains("cannot bind"));
}

#[tokio::test]
async fn start_conflicts_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path());

    let state = manager
        .register("demo", "svc", "sleep 10", dir.path().to_str().unwrap(), ProcessType::Worker, None, None)
        .unwrap();
    manager.start(&state.id).unwrap();
    assert!(matches!(
        manager.start(&state.id),
        Err(AdtError::Conflict(_))
    ));
    manager.stop(&state.id, true).unwrap();
}

#[tokio::test]
async fn start_rewrites_command_when_port_assignment_changed() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path());

    let state = manager
        .register(
            "demo",
            "svc",
            "PORT=3005 sleep 2",
            dir.path().to_str().unwrap(),
            ProcessType::DevServer,
            Some(3005),
            None,
        )
        .unwrap();
    manager.ports.set_port("demo", "svc", 3999).unwrap();

    let started = manager.start(&state.id).unwrap();
    assert_eq!(started.port, Some(3999));
    assert_eq!(started.command, "PORT=3999 sleep 2");
    manager.stop(&state.id, true).unwrap();
}

#[tokio::test]
async fn fix_task_embeds_command_error_and_log_tail() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path());
    let mut rx = manager.events.subscribe();

    let state = manager
        .register(
            "demo",
            "api",
            "echo listen error EADDRINUSE; exit 1",
            dir.path().to_str().unwrap(),
            ProcessType::DevServer,
            None,
            None,
        )
        .unwrap();
    manager.start(&state.id).unwrap();
    wait_for_exit(&mut rx).await;

    let request = manager.fix_task_request(&state.id).unwrap();
    assert_eq!(request.project, "demo");
    assert_eq!(request.priority, TaskPriority::High);
    assert!(request.description.contains("EADDRINUSE"));
    assert!(request.description.contains("echo listen error"));
}

#[tokio::test]
async fn fix_task_requires_failed_state() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path());
    let state = manager
        .register("demo", "svc", "sleep 1", dir.path().to_str().unwrap(), ProcessType::Worker, None, None)
        .unwrap();
    assert!(matches!(
        manager.fix_task_request(&state.id),
        Err(AdtError::Conflict(_))
    ));
    assert!(matches!(
        manager.fix_task_request("ghost"),
        Err(AdtError::NotFound(_))
    ));
}

#[tokio::test]
async fn running_state_is_demoted_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let manager = setup(dir.path());
        let state = manager
            .register("demo", "svc", "sleep 30", dir.path().to_str().unwrap(), ProcessType::Worker, None, None)
            .unwrap();
        manager.start(&state.id).unwrap();
        manager.stop(&state.id, true).unwrap();
    }
    // Simulate a fresh boot reading the persisted state files.
    let manager = setup(dir.path());
    let state = manager.get("demo-svc").unwrap();
    assert_ne!(state.status, ProcessStatus::Running);
    assert!(state.pid.is_none());
}

#[test]
fn port_holder_pids_finds_the_bound_listener() {
    if !lsof_available() {
        return;
    }
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let pids = port_holder_pids(port);
    assert!(
        pids.contains(&std::process::id()),
        "expected own pid in {pids:?}"
    );
    drop(listener);
    assert_eq!(kill_port_holders(port, false), 0);
}

#[tokio::test]
async fn stop_falls_back_to_port_scan_when_pid_kill_fails() {
    let dir = tempfile::tempdir().unwrap();
    let manager = setup(dir.path());

    // A free port nothing is bound to.
    let port = {
        let probe = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        probe.local_addr().unwrap().port()
    };
    let state = manager
        .register(
            "demo",
            "svc",
            "sleep 30",
            dir.path().to_str().unwrap(),
            ProcessType::Worker,
            Some(port),
            None,
        )
        .unwrap();

    // Simulate a running process whose child vanished without a trace:
    // signalling the recorded pid fails, so stop must take the port path.
    {
        let mut processes = manager.processes.lock().unwrap();
        let entry = processes.get_mut(&state.id).unwrap();
        entry.status = ProcessStatus::Running;
        entry.pid = Some(4_194_299);
    }

    let stopped = manager.stop(&state.id, false).unwrap();
    assert_eq!(stopped.status, ProcessStatus::Stopped);
    assert!(stopped.pid.is_none());
    assert!(stopped.error.is_none());
}

#[test]
fn port_rewrite_covers_the_documented_shapes() {
    assert_eq!(
        update_command_port("vite --port 5173", Some(5173), 4000),
        "vite --port 4000"
    );
    assert_eq!(
        update_command_port("next dev -p 3000", Some(3000), 4000),
        "next dev -p 4000"
    );
    assert_eq!(
        update_command_port("PORT=3000 node server.js", Some(3000), 4000),
        "PORT=4000 node server.js"
    );
    assert_eq!(
        update_command_port("python manage.py runserver 8000", Some(8000), 4000),
        "python manage.py runserver 4000"
    );
    // Unrecognized shape falls back to an env prefix.
    assert_eq!(
        update_command_port("node server.js", Some(3000), 4000),
        "PORT=4000 node server.js"
    );
}

#[test]
fn adjust_command_handles_npm_and_python_stacks() {
    assert_eq!(adjust_command_port("npm run dev", 4000), "npm run dev -- --port 4000");
    assert_eq!(adjust_command_port("npm start", 4000), "PORT=4000 npm start");
    assert_eq!(
        adjust_command_port("uvicorn main:app --reload --port 8000", 4000),
        "uvicorn main:app --reload --port 4000"
    );
    assert_eq!(
        adjust_command_port("python manage.py runserver", 4000),
        "python manage.py runserver 4000"
    );
    assert_eq!(adjust_command_port("cargo run", 4000), "PORT=4000 cargo run");
}
