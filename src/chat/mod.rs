//! Discord chat channel adapter.
//!
//! A thin bridge from chat commands to the in-process component handles,
//! gated by an allow-list of Discord user ids. Runs inside the core process
//! so it never re-authenticates over HTTP.

use serenity::all::{Context, EventHandler, GatewayIntents, Message, Ready};
use serenity::{async_trait, Client};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::core::Core;
use crate::models::TaskPriority;
use crate::store::CreateTask;
use crate::Result;

#[cfg(test)]
mod tests;

pub struct ChatAdapter {
    core: Arc<Core>,
}

impl ChatAdapter {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// Run the Discord client until shutdown. Returns immediately when the
    /// channel is disabled or no token resolves.
    pub async fn run(&self) -> Result<()> {
        let discord = &self.core.config.channels.discord;
        if !discord.enabled {
            return Ok(());
        }
        let token = discord
            .token
            .as_deref()
            .map(|t| self.core.vault.resolve_ref(t))
            .filter(|t| !t.is_empty());
        let Some(token) = token else {
            warn!("Discord channel enabled but no token configured");
            return Ok(());
        };

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;
        let handler = CommandHandler {
            core: Arc::clone(&self.core),
            allowed_users: discord.allowed_users.iter().copied().collect(),
        };
        let mut client = Client::builder(&token, intents)
            .event_handler(handler)
            .await
            .map_err(|e| crate::AdtError::Configuration(format!("Discord client: {e}")))?;

        info!("Discord chat adapter starting");
        client
            .start()
            .await
            .map_err(|e| crate::AdtError::Configuration(format!("Discord gateway: {e}")))?;
        Ok(())
    }
}

struct CommandHandler {
    core: Arc<Core>,
    allowed_users: HashSet<u64>,
}

impl CommandHandler {
    fn is_authorized(&self, user_id: u64) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.contains(&user_id)
    }
}

#[async_trait]
impl EventHandler for CommandHandler {
    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        if !self.is_authorized(msg.author.id.get()) {
            let _ = msg
                .channel_id
                .say(&ctx.http, "Unauthorized: your user id is not allow-listed.")
                .await;
            return;
        }

        let content = msg.content.trim();
        let (command, args) = match content.strip_prefix('/') {
            Some(rest) => match rest.split_once(char::is_whitespace) {
                Some((cmd, args)) => (cmd, args.trim()),
                None => (rest, ""),
            },
            None => ("message", content),
        };

        let reply = handle_command(&self.core, command, args).await;
        if let Err(e) = msg.channel_id.say(&ctx.http, reply).await {
            error!("Failed to send Discord reply: {e}");
        }
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("Discord bot connected as {}", ready.user.name);
    }
}

/// Map a chat command to core operations. Pure with respect to Discord so
/// the command surface can be tested directly.
pub async fn handle_command(core: &Arc<Core>, command: &str, args: &str) -> String {
    match command {
        "status" => {
            let sessions = core.agents.list();
            let running = sessions.iter().filter(|a| a.status.is_live()).count();
            let stats = core.tasks.stats().unwrap_or_default();
            format!(
                "Status\n\nAgents: {running} running / {} total\nTasks: {} pending, {} in progress\nOrchestrator: {}",
                sessions.len(),
                stats.get("pending").copied().unwrap_or(0),
                stats.get("in_progress").copied().unwrap_or(0),
                if core.orchestrator.is_running() { "running" } else { "stopped" },
            )
        }
        "agents" => {
            let sessions = core.agents.list();
            if sessions.is_empty() {
                return "No agents found.".to_string();
            }
            let mut lines = vec!["Agents:".to_string()];
            for session in sessions {
                lines.push(format!(
                    "- {} ({})",
                    session.project,
                    session.status.as_str()
                ));
                if let Some(task) = &session.current_task {
                    lines.push(format!("    {}", preview(task, 50)));
                }
            }
            lines.join("\n")
        }
        "tasks" => {
            let tasks = core
                .tasks
                .list(&crate::store::TaskFilter {
                    status: None,
                    project: None,
                    limit: 10,
                })
                .unwrap_or_default();
            let open: Vec<_> = tasks.iter().filter(|t| !t.is_terminal()).collect();
            if open.is_empty() {
                return "No open tasks.".to_string();
            }
            let mut lines = vec!["Tasks:".to_string()];
            for task in open {
                lines.push(format!(
                    "- [{}] {} ({}): {}",
                    task.id,
                    task.project,
                    task.priority,
                    preview(&task.description, 40),
                ));
            }
            lines.join("\n")
        }
        "projects" => {
            let projects = core.registry.list().unwrap_or_default();
            if projects.is_empty() {
                return "No projects registered.".to_string();
            }
            let mut lines = vec!["Projects:".to_string()];
            for project in projects {
                lines.push(format!("- {}", project.name));
            }
            lines.join("\n")
        }
        "spawn" => {
            let mut parts = args.splitn(2, char::is_whitespace);
            let project = parts.next().unwrap_or_default();
            let task = parts.next().map(str::trim).filter(|t| !t.is_empty());
            if project.is_empty() {
                return "Usage: /spawn <project> [task]".to_string();
            }
            match core.agents.spawn(project, None, None, task) {
                Ok(session) => format!(
                    "Spawned agent for {project} (pid {})",
                    session.pid.map_or("?".to_string(), |p| p.to_string())
                ),
                Err(e) => format!("Error: {e}"),
            }
        }
        "stop" => {
            if args.is_empty() {
                return "Usage: /stop <project>".to_string();
            }
            match core.agents.stop(args, false) {
                Ok(true) => format!("Stopped agent for {args}"),
                Ok(false) => format!("Agent not found: {args}"),
                Err(e) => format!("Error: {e}"),
            }
        }
        "add" => {
            let mut parts = args.splitn(2, char::is_whitespace);
            let project = parts.next().unwrap_or_default();
            let description = parts.next().map(str::trim).unwrap_or_default();
            if project.is_empty() || description.is_empty() {
                return "Usage: /add <project> <task description>".to_string();
            }
            match core.tasks.create(CreateTask {
                project: project.to_string(),
                description: description.to_string(),
                priority: TaskPriority::Normal,
                ..Default::default()
            }) {
                Ok(task) => format!("Created task {}", task.id),
                Err(e) => format!("Error: {e}"),
            }
        }
        // Natural language fallback: route keyword-shaped text.
        "message" => {
            let text = args.to_lowercase();
            if text.contains("status") {
                Box::pin(handle_command(core, "status", "")).await
            } else if text.contains("agent") {
                Box::pin(handle_command(core, "agents", "")).await
            } else if text.contains("task") || text.contains("queue") {
                Box::pin(handle_command(core, "tasks", "")).await
            } else {
                concat!(
                    "I didn't understand that. Try:\n",
                    "/status - System status\n",
                    "/agents - List agents\n",
                    "/tasks - List tasks\n",
                    "/projects - List projects\n",
                    "/spawn <project> [task] - Start agent\n",
                    "/stop <project> - Stop agent\n",
                    "/add <project> <task> - Add task",
                )
                .to_string()
            }
        }
        other => format!("Unknown command: {other}"),
    }
}

fn preview(text: &str, max: usize) -> String {
    let truncated: String = text.chars().take(max).collect();
    if truncated.len() < text.len() {
        format!("{truncated}...")
    } else {
        truncated
    }
}
