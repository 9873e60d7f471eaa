//! Agent lifecycle supervision.
//!
//! At most one agent session exists per project. The supervisor spawns the
//! provider CLI in its own process group with stdout+stderr redirected into
//! the project log, watches for exit on a monitor task, and emits both a
//! status event and a task-complete event carrying the captured output.
//! Log files hold raw bytes; scrubbing happens on read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::config::{Config, ProjectRegistry, ProviderConfig};
use crate::constants::DEFAULT_LOG_LINES;
use crate::events::{EventBus, EventType};
use crate::scrubber::Scrubber;
use crate::{AdtError, Result};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Spawning,
    Working,
    /// Waiting for human input.
    Waiting,
    Testing,
    Error,
    Stopped,
}

impl AgentStatus {
    pub fn is_live(&self) -> bool {
        !matches!(self, AgentStatus::Stopped | AgentStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Spawning => "spawning",
            AgentStatus::Working => "working",
            AgentStatus::Waiting => "waiting",
            AgentStatus::Testing => "testing",
            AgentStatus::Error => "error",
            AgentStatus::Stopped => "stopped",
        }
    }
}

/// Persistent state for one project's agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub project: String,
    pub status: AgentStatus,
    pub provider: String,
    pub pid: Option<u32>,
    pub worktree: Option<String>,
    pub current_task: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: u32,
}

type Sessions = Arc<Mutex<HashMap<String, AgentSession>>>;

pub struct AgentManager {
    home: PathBuf,
    config: Config,
    registry: ProjectRegistry,
    scrubber: Arc<Scrubber>,
    events: Arc<EventBus>,
    sessions: Sessions,
}

impl AgentManager {
    pub fn new(
        home: &Path,
        config: Config,
        registry: ProjectRegistry,
        scrubber: Arc<Scrubber>,
        events: Arc<EventBus>,
    ) -> Self {
        let manager = Self {
            home: home.to_path_buf(),
            config,
            registry,
            scrubber,
            events,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        };
        manager.load_states();
        manager
    }

    /// Reload persisted sessions, demoting any whose child did not survive.
    fn load_states(&self) {
        let agents_dir = self.home.join("agents");
        let Ok(entries) = std::fs::read_dir(&agents_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(project) = name.strip_suffix(".state.json") else {
                continue;
            };
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let Ok(mut session) = serde_json::from_str::<AgentSession>(&content) else {
                continue;
            };
            if let Some(pid) = session.pid {
                if !is_process_alive(pid) {
                    session.status = AgentStatus::Stopped;
                    session.pid = None;
                    let _ = save_session(&self.home, &session);
                }
            }
            self.sessions
                .lock()
                .unwrap()
                .insert(project.to_string(), session);
        }
    }

    pub fn list(&self) -> Vec<AgentSession> {
        let mut sessions: Vec<AgentSession> =
            self.sessions.lock().unwrap().values().cloned().collect();
        sessions.sort_by(|a, b| a.project.cmp(&b.project));
        sessions
    }

    pub fn get(&self, project: &str) -> Option<AgentSession> {
        self.sessions.lock().unwrap().get(project).cloned()
    }

    pub fn log_path(&self, project: &str) -> PathBuf {
        self.home.join("logs").join("agents").join(format!("{project}.log"))
    }

    /// Spawn an agent for a project. Refuses while a live session with a
    /// running child exists.
    pub fn spawn(
        &self,
        project: &str,
        provider: Option<&str>,
        worktree: Option<&str>,
        task: Option<&str>,
    ) -> Result<AgentSession> {
        {
            let sessions = self.sessions.lock().unwrap();
            if let Some(existing) = sessions.get(project) {
                if existing.status.is_live()
                    && existing.pid.map(is_process_alive).unwrap_or(false)
                {
                    return Err(AdtError::Conflict(format!(
                        "Agent for {project} is already running"
                    )));
                }
            }
        }

        let project_path = match worktree {
            Some(path) => PathBuf::from(path),
            None => {
                let registered = self.registry.get(project)?.ok_or_else(|| {
                    AdtError::NotFound(format!("Project not found: {project}"))
                })?;
                PathBuf::from(registered.path)
            }
        };
        if !project_path.is_dir() {
            return Err(AdtError::Validation(format!(
                "Project path does not exist: {}",
                project_path.display()
            )));
        }

        let (provider_name, provider_config) = self
            .config
            .provider(provider)
            .unwrap_or_else(default_provider);

        let now = Utc::now();
        let mut session = AgentSession {
            project: project.to_string(),
            status: AgentStatus::Spawning,
            provider: provider_name.clone(),
            pid: None,
            worktree: worktree.map(str::to_string),
            current_task: task.map(str::to_string),
            started_at: Some(now),
            last_activity: Some(now),
            error: None,
            retry_count: 0,
        };

        match self.spawn_child(project, &project_path, &provider_name, &provider_config, task) {
            Ok(pid) => {
                session.pid = Some(pid);
                session.status = if task.is_some() {
                    AgentStatus::Working
                } else {
                    AgentStatus::Idle
                };
            }
            Err(e) => {
                session.status = AgentStatus::Error;
                session.error = Some(e.to_string());
            }
        }

        save_session(&self.home, &session)?;
        self.sessions
            .lock()
            .unwrap()
            .insert(project.to_string(), session.clone());

        self.events.emit(
            EventType::AgentSpawned,
            Some(project),
            json!({
                "provider": session.provider,
                "pid": session.pid,
                "task": task,
            }),
        );
        self.emit_status(&session);

        if session.status == AgentStatus::Error {
            return Err(AdtError::Agent {
                message: session.error.clone().unwrap_or_else(|| "spawn failed".into()),
            });
        }
        Ok(session)
    }

    fn spawn_child(
        &self,
        project: &str,
        project_path: &Path,
        provider_name: &str,
        provider: &ProviderConfig,
        task: Option<&str>,
    ) -> Result<u32> {
        let log_path = self.log_path(project);
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        writeln!(
            log_file,
            "\n\n=== Agent started at {} ===\nProject: {project}\nProvider: {provider_name}\nTask: {}\n{}\n",
            Utc::now().to_rfc3339(),
            task.unwrap_or("none"),
            "=".repeat(50),
        )?;
        log_file.flush()?;
        // Remember where this run starts so output capture cannot
        // mis-attribute earlier runs in the same file.
        let start_offset = log_file.metadata()?.len();

        let (program, args) = build_agent_command(provider, task);
        let stdout = Stdio::from(log_file.try_clone()?);
        let stderr = Stdio::from(log_file);

        let mut command = tokio::process::Command::new(&program);
        command
            .args(&args)
            .current_dir(project_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| AdtError::Agent {
            message: format!("Failed to launch {program}: {e}"),
        })?;
        let pid = child.id().ok_or_else(|| AdtError::Agent {
            message: "Child exited before pid could be read".to_string(),
        })?;

        info!("Spawned agent for {project} (provider {provider_name}, pid {pid})");

        let monitor = MonitorContext {
            home: self.home.clone(),
            project: project.to_string(),
            log_path,
            start_offset,
            sessions: Arc::clone(&self.sessions),
            scrubber: Arc::clone(&self.scrubber),
            events: Arc::clone(&self.events),
        };
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!("Failed to wait on agent child: {e}");
                    -1
                }
            };
            monitor.on_exit(exit_code);
        });

        Ok(pid)
    }

    /// Stop an agent: signal the whole process group, then record the stop.
    /// A no-op when no session exists.
    pub fn stop(&self, project: &str, force: bool) -> Result<bool> {
        let Some(mut session) = self.get(project) else {
            return Ok(false);
        };

        if let Some(pid) = session.pid {
            kill_process_group(pid, force);
        }

        session.status = AgentStatus::Stopped;
        session.pid = None;
        session.last_activity = Some(Utc::now());
        save_session(&self.home, &session)?;
        self.sessions
            .lock()
            .unwrap()
            .insert(project.to_string(), session.clone());

        self.events.emit(
            EventType::AgentStopped,
            Some(project),
            json!({"forced": force}),
        );
        self.emit_status(&session);
        Ok(true)
    }

    /// Assign a task. Without a live session this spawns one; an idle
    /// session is respawned with the task (in-process hand-off over IPC is
    /// a later refinement).
    pub fn assign_task(&self, project: &str, task: &str) -> Result<AgentSession> {
        match self.get(project) {
            None => self.spawn(project, None, None, Some(task)),
            Some(session) if !session.status.is_live() => {
                self.spawn(project, None, None, Some(task))
            }
            Some(session) if session.status == AgentStatus::Working => {
                Err(AdtError::Conflict(format!(
                    "Agent {project} is busy with another task"
                )))
            }
            Some(_) => {
                self.stop(project, false)?;
                self.spawn(project, None, None, Some(task))
            }
        }
    }

    /// Respawn a stopped or errored agent, reusing its recorded task.
    pub fn retry(&self, project: &str) -> Result<AgentSession> {
        let session = self
            .get(project)
            .ok_or_else(|| AdtError::NotFound(format!("No agent for project: {project}")))?;
        if session.status.is_live() {
            return Err(AdtError::Conflict(format!(
                "Agent {project} is {} and cannot be retried",
                session.status.as_str()
            )));
        }
        let retry_count = session.retry_count + 1;
        let task = session.current_task.clone();
        let worktree = session.worktree.clone();
        let mut respawned = self.spawn(
            project,
            Some(session.provider.as_str()),
            worktree.as_deref(),
            task.as_deref(),
        )?;
        respawned.retry_count = retry_count;
        save_session(&self.home, &respawned)?;
        self.sessions
            .lock()
            .unwrap()
            .insert(project.to_string(), respawned.clone());
        Ok(respawned)
    }

    /// Last `lines` of the project log, scrubbed.
    pub fn get_logs(&self, project: &str, lines: usize) -> Result<String> {
        let lines = if lines == 0 { DEFAULT_LOG_LINES } else { lines };
        let log_path = self.log_path(project);
        if !log_path.exists() {
            return Ok(String::new());
        }
        let content = std::fs::read_to_string(&log_path)?;
        let all: Vec<&str> = content.lines().collect();
        let skip = all.len().saturating_sub(lines);
        let tail = all[skip..].join("\n");
        Ok(self.scrubber.scrub(&tail))
    }

    /// Probe each session's recorded pid; demote dead sessions to stopped.
    /// Returns project -> alive.
    pub fn check_health(&self) -> HashMap<String, bool> {
        let mut health = HashMap::new();
        let mut sessions = self.sessions.lock().unwrap();
        for (project, session) in sessions.iter_mut() {
            let alive = match session.pid {
                Some(pid) => {
                    let alive = is_process_alive(pid);
                    if !alive {
                        session.status = AgentStatus::Stopped;
                        session.pid = None;
                        let _ = save_session(&self.home, session);
                    }
                    alive
                }
                None => session.status.is_live(),
            };
            health.insert(project.clone(), alive);
        }
        health
    }

    /// Remove state files for stopped agents. Returns the count removed.
    pub fn cleanup_stopped(&self) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        let stopped: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.status == AgentStatus::Stopped)
            .map(|(p, _)| p.clone())
            .collect();
        for project in &stopped {
            sessions.remove(project);
            let _ = std::fs::remove_file(
                self.home.join("agents").join(format!("{project}.state.json")),
            );
        }
        stopped.len()
    }

    /// Signal every live child; used during orderly shutdown.
    pub fn stop_all(&self, force: bool) {
        let projects: Vec<String> = self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| s.pid.is_some())
            .map(|(p, _)| p.clone())
            .collect();
        for project in projects {
            let _ = self.stop(&project, force);
        }
    }

    fn emit_status(&self, session: &AgentSession) {
        self.events.emit(
            EventType::AgentStatus,
            Some(&session.project),
            json!({
                "status": session.status.as_str(),
                "provider": session.provider,
                "error": session.error,
            }),
        );
    }
}

struct MonitorContext {
    home: PathBuf,
    project: String,
    log_path: PathBuf,
    start_offset: u64,
    sessions: Sessions,
    scrubber: Arc<Scrubber>,
    events: Arc<EventBus>,
}

impl MonitorContext {
    fn on_exit(&self, exit_code: i32) {
        // Footer for humans reading the raw log.
        if let Ok(mut log_file) = std::fs::OpenOptions::new().append(true).open(&self.log_path)
        {
            let _ = writeln!(
                log_file,
                "\n\n=== Agent exited with code {exit_code} at {} ===",
                Utc::now().to_rfc3339()
            );
        }

        let output = self.capture_output();
        let error = if exit_code != 0 {
            Some(self.extract_error(exit_code))
        } else {
            None
        };

        {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(session) = sessions.get_mut(&self.project) {
                // An operator stop may already have recorded the terminal
                // state; exit classification only applies to live sessions.
                if session.status.is_live() {
                    session.status = if exit_code == 0 {
                        AgentStatus::Stopped
                    } else {
                        AgentStatus::Error
                    };
                    session.error = error.clone();
                }
                session.pid = None;
                session.last_activity = Some(Utc::now());
                let _ = save_session(&self.home, session);
                let snapshot = session.clone();
                drop(sessions);
                self.events.emit(
                    EventType::AgentStatus,
                    Some(&self.project),
                    json!({
                        "status": snapshot.status.as_str(),
                        "provider": snapshot.provider,
                        "error": snapshot.error,
                    }),
                );
            }
        }

        self.events.emit(
            EventType::AgentTaskComplete,
            Some(&self.project),
            json!({"exit_code": exit_code, "output": output}),
        );
        if exit_code != 0 {
            self.events.emit(
                EventType::AgentError,
                Some(&self.project),
                json!({"exit_code": exit_code, "error": error}),
            );
        }
    }

    /// Read this run's output: everything appended after the spawn banner,
    /// minus our own exit footer, scrubbed.
    fn capture_output(&self) -> String {
        let Ok(content) = std::fs::read(&self.log_path) else {
            return String::new();
        };
        let start = (self.start_offset as usize).min(content.len());
        let run = String::from_utf8_lossy(&content[start..]);
        let run = match run.find("\n\n=== Agent exited") {
            Some(idx) => &run[..idx],
            None => &run[..],
        };
        self.scrubber.scrub(run.trim())
    }

    fn extract_error(&self, exit_code: i32) -> String {
        let output = self.capture_output();
        let last_line = output
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty() && !l.starts_with("==="));
        match last_line {
            Some(line) => {
                let line: String = line.chars().take(200).collect();
                format!("Exit code {exit_code}: {line}")
            }
            None => format!("Agent exited with code {exit_code}"),
        }
    }
}

fn save_session(home: &Path, session: &AgentSession) -> Result<()> {
    let dir = home.join("agents");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}.state.json", session.project));
    std::fs::write(path, serde_json::to_string_pretty(session)?)?;
    Ok(())
}

fn default_provider() -> (String, ProviderConfig) {
    (
        "claude".to_string(),
        ProviderConfig {
            kind: "claude-cli".to_string(),
            command: None,
            model: None,
            default: true,
        },
    )
}

/// Build the child command line for a provider. Known kinds get their CLI's
/// task-prompt flag; anything else runs the configured command with the task
/// appended.
fn build_agent_command(provider: &ProviderConfig, task: Option<&str>) -> (String, Vec<String>) {
    match provider.kind.as_str() {
        "claude-cli" => {
            let program = provider.command.clone().unwrap_or_else(|| "claude".into());
            let mut args = vec!["-p".to_string()];
            if let Some(task) = task {
                args.push(task.to_string());
            }
            (program, args)
        }
        "cursor-agent" => {
            let program = provider
                .command
                .clone()
                .unwrap_or_else(|| "cursor-agent".into());
            let mut args = vec!["-p".to_string()];
            if let Some(task) = task {
                args.push(task.to_string());
            }
            (program, args)
        }
        _ => {
            let command = provider
                .command
                .clone()
                .unwrap_or_else(|| provider.kind.clone());
            let mut parts = command.split_whitespace().map(str::to_string);
            let program = parts.next().unwrap_or_else(|| command.clone());
            let mut args: Vec<String> = parts.collect();
            if let Some(task) = task {
                args.push(task.to_string());
            }
            (program, args)
        }
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Signal the child's process group so grandchildren receive it too.
/// Returns whether any signal was delivered.
pub fn kill_process_group(pid: u32, force: bool) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, killpg, Signal};
        use nix::unistd::Pid;
        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        if killpg(Pid::from_raw(pid as i32), signal).is_ok() {
            return true;
        }
        // Group may be gone; try the single pid as a fallback.
        kill(Pid::from_raw(pid as i32), signal).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, force);
        false
    }
}
