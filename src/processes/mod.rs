//! Long-running dev-server supervision.
//!
//! Same lifecycle shape as the agent supervisor, with two extra concerns:
//! ports are coordinated through the registry (rewriting the command when
//! the assignment changed), and exits are classified as `stopped` only when
//! the stop was operator-initiated — everything else with a non-zero code
//! is `failed`.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::agents::kill_process_group;
use crate::constants::DEFAULT_LOG_LINES;
use crate::events::{EventBus, EventType};
use crate::models::TaskPriority;
use crate::ports::PortRegistry;
use crate::scrubber::Scrubber;
use crate::store::CreateTask;
use crate::{AdtError, Result};

pub mod discovery;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    DevServer,
    Database,
    Worker,
    Custom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Registered but never started.
    Idle,
    Starting,
    Running,
    /// Operator-initiated stop.
    Stopped,
    /// Crashed: non-zero exit that was not operator-initiated.
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessState {
    pub id: String,
    pub project: String,
    pub name: String,
    pub process_type: ProcessType,
    pub command: String,
    pub cwd: String,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub description: Option<String>,
}

type Processes = Arc<Mutex<HashMap<String, ProcessState>>>;
type Stopping = Arc<Mutex<HashSet<String>>>;

pub struct ProcessManager {
    home: PathBuf,
    ports: Arc<PortRegistry>,
    scrubber: Arc<Scrubber>,
    events: Arc<EventBus>,
    processes: Processes,
    stopping: Stopping,
}

impl ProcessManager {
    pub fn new(
        home: &Path,
        ports: Arc<PortRegistry>,
        scrubber: Arc<Scrubber>,
        events: Arc<EventBus>,
    ) -> Self {
        let manager = Self {
            home: home.to_path_buf(),
            ports,
            scrubber,
            events,
            processes: Arc::new(Mutex::new(HashMap::new())),
            stopping: Arc::new(Mutex::new(HashSet::new())),
        };
        manager.load_states();
        manager
    }

    /// Reload persisted states. Children do not survive a server restart,
    /// so anything recorded as running is demoted to stopped.
    fn load_states(&self) {
        let state_dir = self.home.join("processes");
        let Ok(entries) = std::fs::read_dir(&state_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let Ok(mut state) = serde_json::from_str::<ProcessState>(&content) else {
                continue;
            };
            if matches!(state.status, ProcessStatus::Running | ProcessStatus::Starting) {
                state.status = ProcessStatus::Stopped;
                state.pid = None;
                let _ = save_state(&self.home, &state);
            }
            self.processes.lock().unwrap().insert(state.id.clone(), state);
        }
    }

    pub fn log_path(&self, process_id: &str) -> PathBuf {
        self.home
            .join("logs")
            .join("processes")
            .join(format!("{process_id}.log"))
    }

    /// Register a process configuration under the composite id
    /// `<project>-<name>`. Re-registration refreshes the port/command.
    pub fn register(
        &self,
        project: &str,
        name: &str,
        command: &str,
        cwd: &str,
        process_type: ProcessType,
        port: Option<u16>,
        description: Option<&str>,
    ) -> Result<ProcessState> {
        let id = format!("{project}-{name}").to_lowercase().replace(' ', "-");

        let mut processes = self.processes.lock().unwrap();
        if let Some(existing) = processes.get_mut(&id) {
            if let Some(port) = port {
                if existing.port != Some(port) {
                    existing.port = Some(port);
                    existing.command = command.to_string();
                    save_state(&self.home, existing)?;
                }
            }
            return Ok(existing.clone());
        }

        let state = ProcessState {
            id: id.clone(),
            project: project.to_string(),
            name: name.to_string(),
            process_type,
            command: command.to_string(),
            cwd: cwd.to_string(),
            status: ProcessStatus::Idle,
            pid: None,
            port,
            started_at: None,
            exit_code: None,
            error: None,
            description: description.map(str::to_string),
        };
        save_state(&self.home, &state)?;
        processes.insert(id, state.clone());
        Ok(state)
    }

    /// Start a registered process, rewriting its command when the port
    /// registry holds a different assignment.
    pub fn start(&self, process_id: &str) -> Result<ProcessState> {
        let mut state = self
            .get(process_id)
            .ok_or_else(|| AdtError::NotFound(format!("Process not found: {process_id}")))?;
        if state.status == ProcessStatus::Running {
            return Err(AdtError::Conflict(format!(
                "Process already running: {process_id}"
            )));
        }

        if let Some(registered) = self.ports.get_port(&state.project, &state.name) {
            if state.port != Some(registered) {
                state.command = update_command_port(&state.command, state.port, registered);
                state.port = Some(registered);
            }
        }

        let log_path = self.log_path(process_id);
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        writeln!(
            log_file,
            "\n\n=== Process started at {} ===\nCommand: {}\nCWD: {}\n{}\n",
            Utc::now().to_rfc3339(),
            state.command,
            state.cwd,
            "=".repeat(50),
        )?;
        log_file.flush()?;

        let stdout = Stdio::from(log_file.try_clone()?);
        let stderr = Stdio::from(log_file);

        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(&state.command)
            .current_dir(&state.cwd)
            .env("FORCE_COLOR", "1")
            .env("NODE_ENV", "development")
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| AdtError::Process {
            message: format!("Failed to start {process_id}: {e}"),
        })?;
        let pid = child.id().ok_or_else(|| AdtError::Process {
            message: "Child exited before pid could be read".to_string(),
        })?;

        state.status = ProcessStatus::Running;
        state.pid = Some(pid);
        state.started_at = Some(Utc::now());
        state.exit_code = None;
        state.error = None;
        save_state(&self.home, &state)?;
        self.processes
            .lock()
            .unwrap()
            .insert(process_id.to_string(), state.clone());

        info!("Started process {process_id} (pid {pid})");
        self.events.emit(
            EventType::ProcessStarted,
            Some(&state.project),
            json!({"process_id": process_id, "pid": pid, "port": state.port}),
        );

        let monitor = MonitorContext {
            home: self.home.clone(),
            process_id: process_id.to_string(),
            log_path,
            processes: Arc::clone(&self.processes),
            stopping: Arc::clone(&self.stopping),
            scrubber: Arc::clone(&self.scrubber),
            events: Arc::clone(&self.events),
        };
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!("Failed to wait on process child: {e}");
                    -1
                }
            };
            monitor.on_exit(exit_code);
        });

        Ok(state)
    }

    /// Stop a running process: mark the stop as intentional, signal the
    /// process group, and fall back to killing whatever holds the port.
    pub fn stop(&self, process_id: &str, force: bool) -> Result<ProcessState> {
        let mut state = self
            .get(process_id)
            .ok_or_else(|| AdtError::NotFound(format!("Process not found: {process_id}")))?;
        if state.status != ProcessStatus::Running {
            return Ok(state);
        }

        self.stopping.lock().unwrap().insert(process_id.to_string());

        let killed = match state.pid {
            Some(pid) => kill_process_group(pid, force),
            None => false,
        };
        // Children that escaped the process group may still hold the port.
        if !killed {
            if let Some(port) = state.port {
                kill_port_holders(port, force);
            }
        }

        state.status = ProcessStatus::Stopped;
        state.pid = None;
        state.error = None;
        save_state(&self.home, &state)?;
        self.processes
            .lock()
            .unwrap()
            .insert(process_id.to_string(), state.clone());

        self.events.emit(
            EventType::ProcessStopped,
            Some(&state.project),
            json!({"process_id": process_id, "forced": force}),
        );
        Ok(state)
    }

    pub fn restart(&self, process_id: &str) -> Result<ProcessState> {
        self.stop(process_id, false)?;
        self.start(process_id)
    }

    pub fn get(&self, process_id: &str) -> Option<ProcessState> {
        self.processes.lock().unwrap().get(process_id).cloned()
    }

    pub fn list(&self, project: Option<&str>) -> Vec<ProcessState> {
        let mut processes: Vec<ProcessState> = self
            .processes
            .lock()
            .unwrap()
            .values()
            .filter(|p| project.map_or(true, |proj| p.project == proj))
            .cloned()
            .collect();
        processes.sort_by(|a, b| a.id.cmp(&b.id));
        processes
    }

    pub fn list_running(&self) -> Vec<ProcessState> {
        self.processes
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.status == ProcessStatus::Running)
            .cloned()
            .collect()
    }

    /// Last `lines` of the process log, scrubbed.
    pub fn get_logs(&self, process_id: &str, lines: usize) -> Result<String> {
        let lines = if lines == 0 { DEFAULT_LOG_LINES } else { lines };
        let log_path = self.log_path(process_id);
        if !log_path.exists() {
            return Ok(String::new());
        }
        let content = std::fs::read_to_string(&log_path)?;
        let all: Vec<&str> = content.lines().collect();
        let skip = all.len().saturating_sub(lines);
        Ok(self.scrubber.scrub(&all[skip..].join("\n")))
    }

    /// Build a high-priority repair task for a failed process, embedding the
    /// command, derived error, and log tail. The caller inserts it into the
    /// task store.
    pub fn fix_task_request(&self, process_id: &str) -> Result<CreateTask> {
        let state = self
            .get(process_id)
            .ok_or_else(|| AdtError::NotFound(format!("Process not found: {process_id}")))?;
        if state.status != ProcessStatus::Failed {
            return Err(AdtError::Conflict(format!(
                "Process {process_id} has not failed"
            )));
        }

        let log_tail = self.get_logs(process_id, 30)?;
        let description = format!(
            "Fix the failing `{}` process for project {}.\n\n\
             Command: {}\nExit error: {}\n\nRecent log output:\n{}",
            state.name,
            state.project,
            state.command,
            state.error.as_deref().unwrap_or("unknown"),
            log_tail,
        );
        Ok(CreateTask {
            project: state.project,
            description,
            priority: TaskPriority::High,
            metadata: Some(json!({"source": "process-fix", "process_id": process_id})),
            ..Default::default()
        })
    }

    /// Discover dev processes for a project and register them with ports
    /// assigned through the registry.
    pub async fn auto_detect(
        &self,
        project: &str,
        project_path: &str,
        llm_endpoint: Option<&str>,
    ) -> Result<Vec<ProcessState>> {
        let discovered = discovery::discover(project_path, llm_endpoint).await;
        let mut registered = Vec::new();
        for proc in discovered {
            let port = match proc.default_port {
                Some(preferred) => {
                    Some(self.ports.assign_port(project, &proc.name, Some(preferred), false)?)
                }
                None => None,
            };
            let command = match port {
                Some(port) => adjust_command_port(&proc.command, port),
                None => proc.command.clone(),
            };
            let cwd = match &proc.cwd {
                Some(sub) => Path::new(project_path).join(sub).to_string_lossy().to_string(),
                None => project_path.to_string(),
            };
            let state = self.register(
                project,
                &proc.name,
                &command,
                &cwd,
                ProcessType::DevServer,
                port,
                Some(&proc.description),
            )?;
            registered.push(state);
        }
        Ok(registered)
    }

    /// Stop every running process; used during orderly shutdown.
    pub fn stop_all(&self, force: bool) {
        for state in self.list_running() {
            if let Err(e) = self.stop(&state.id, force) {
                warn!("Failed to stop {}: {e}", state.id);
            }
        }
    }
}

struct MonitorContext {
    home: PathBuf,
    process_id: String,
    log_path: PathBuf,
    processes: Processes,
    stopping: Stopping,
    scrubber: Arc<Scrubber>,
    events: Arc<EventBus>,
}

impl MonitorContext {
    fn on_exit(&self, exit_code: i32) {
        let was_intentional = self.stopping.lock().unwrap().remove(&self.process_id);

        if let Ok(mut log_file) = std::fs::OpenOptions::new().append(true).open(&self.log_path)
        {
            let _ = writeln!(
                log_file,
                "\n\n=== Process exited with code {exit_code} at {} ===",
                Utc::now().to_rfc3339()
            );
        }

        let error = if exit_code != 0 && !was_intentional {
            Some(self.extract_error())
        } else {
            None
        };

        let snapshot = {
            let mut processes = self.processes.lock().unwrap();
            let Some(state) = processes.get_mut(&self.process_id) else {
                return;
            };
            if was_intentional {
                state.status = ProcessStatus::Stopped;
                state.error = None;
            } else if exit_code != 0 {
                state.status = ProcessStatus::Failed;
                state.error = error.clone();
            } else {
                state.status = ProcessStatus::Stopped;
            }
            state.exit_code = Some(exit_code);
            state.pid = None;
            let _ = save_state(&self.home, state);
            state.clone()
        };

        self.events.emit(
            EventType::ProcessExited,
            Some(&snapshot.project),
            json!({
                "process_id": self.process_id,
                "exit_code": exit_code,
                "status": snapshot.status,
                "error": snapshot.error,
            }),
        );
    }

    /// Scan the log tail for error-shaped lines.
    fn extract_error(&self) -> String {
        let Ok(content) = std::fs::read_to_string(&self.log_path) else {
            return "Process exited with error".to_string();
        };
        let lines: Vec<&str> = content.lines().collect();
        let tail = &lines[lines.len().saturating_sub(30)..];

        let error_lines: Vec<&str> = tail
            .iter()
            .filter(|line| {
                let lower = line.to_lowercase();
                ["error", "exception", "failed", "cannot", "unable", "traceback"]
                    .iter()
                    .any(|kw| lower.contains(kw))
            })
            .copied()
            .collect();

        let derived = if error_lines.is_empty() {
            tail[tail.len().saturating_sub(10)..].join("\n")
        } else {
            error_lines[error_lines.len().saturating_sub(10)..].join("\n")
        };
        self.scrubber.scrub(&derived)
    }
}

fn save_state(home: &Path, state: &ProcessState) -> Result<()> {
    let dir = home.join("processes");
    std::fs::create_dir_all(&dir)?;
    std::fs::write(
        dir.join(format!("{}.state.json", state.id)),
        serde_json::to_string_pretty(state)?,
    )?;
    Ok(())
}

/// Pids currently bound to `port`, per `lsof -t -i :PORT`. Empty when
/// nothing holds the port or `lsof` is unavailable.
pub fn port_holder_pids(port: u16) -> Vec<u32> {
    let Ok(output) = std::process::Command::new("lsof")
        .args(["-t", "-i", &format!(":{port}")])
        .output()
    else {
        return Vec::new();
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Kill whatever is bound to `port` (orphan cleanup fallback). Returns the
/// number of processes signalled.
pub fn kill_port_holders(port: u16, force: bool) -> usize {
    let pids = port_holder_pids(port);
    for pid in &pids {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
            let _ = kill(Pid::from_raw(*pid as i32), signal);
        }
        #[cfg(not(unix))]
        let _ = (pid, force);
    }
    pids.len()
}

/// Rewrite the port baked into a command. Covers the common flag shapes;
/// anything else falls back to a `PORT=N` env prefix.
pub fn update_command_port(cmd: &str, old_port: Option<u16>, new_port: u16) -> String {
    let Some(old_port) = old_port else {
        return adjust_command_port(cmd, new_port);
    };
    let replacements = [
        (format!(r"--port[ =]?{old_port}\b"), format!("--port {new_port}")),
        (format!(r"-p[ =]?{old_port}\b"), format!("-p {new_port}")),
        (format!(r"PORT={old_port}\b"), format!("PORT={new_port}")),
        (format!(r"runserver\s+{old_port}\b"), format!("runserver {new_port}")),
    ];
    let mut result = cmd.to_string();
    let mut changed = false;
    for (pattern, replacement) in replacements {
        let re = Regex::new(&pattern).expect("port rewrite pattern must compile");
        if re.is_match(&result) {
            result = re.replace_all(&result, replacement.as_str()).into_owned();
            changed = true;
        }
    }
    if changed {
        result
    } else {
        adjust_command_port(cmd, new_port)
    }
}

/// Bake a port into a command that may not carry one yet.
pub fn adjust_command_port(cmd: &str, port: u16) -> String {
    let trimmed = cmd.trim();

    if trimmed == "npm run dev" {
        return format!("npm run dev -- --port {port}");
    }
    if trimmed == "npm start" {
        return format!("PORT={port} npm start");
    }

    let strip_port_flags = |cmd: &str| -> String {
        let re_long = Regex::new(r"--port[ =]?\d+").unwrap();
        let re_short = Regex::new(r"-p[ =]?\d+").unwrap();
        let out = re_long.replace_all(cmd, "").into_owned();
        re_short.replace_all(&out, "").trim().to_string()
    };

    if trimmed.contains("vite") && !trimmed.contains("npm") {
        return format!("{} --port {port}", strip_port_flags(trimmed));
    }
    if trimmed.contains("next") {
        return format!("{} -p {port}", strip_port_flags(trimmed));
    }
    if trimmed.contains("uvicorn") || trimmed.contains("flask") {
        return format!("{} --port {port}", strip_port_flags(trimmed));
    }
    if trimmed.contains("runserver") {
        let re = Regex::new(r"runserver\s*\d*").unwrap();
        let out = re.replace_all(trimmed, "runserver").into_owned();
        return format!("{} {port}", out.trim());
    }

    format!("PORT={port} {trimmed}")
}
