//! Command-line surface.
//!
//! `serve` boots the core in-process; every other subcommand is a thin
//! HTTP client against a running server, authenticated with `ADT_TOKEN`.
//! Secret subcommands operate on the local vault file directly so secret
//! values never travel over HTTP.

use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use crate::api::ApiServer;
use crate::chat::ChatAdapter;
use crate::config::{adt_home, Config, CONFIG_TEMPLATE};
use crate::core::Core;
use crate::vault::Vault;
use crate::{AdtError, Result};

#[derive(Parser)]
#[command(name = "adt-core", version, about = "Local command center for AI coding agents")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Server lifecycle
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
    /// API token management (admin)
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Agent control
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Task queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Configuration and secrets
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ServerAction {
    /// Boot the core in-process and serve until interrupted
    Start,
    /// Signal a detached server via its pid file
    Stop,
    /// Probe a running server's health endpoint
    Status,
}

#[derive(Subcommand)]
enum TokenAction {
    Create {
        name: String,
        #[arg(long, default_value = "operator")]
        role: String,
        #[arg(long)]
        expires_in_days: Option<i64>,
    },
    List,
    Revoke {
        token_id: String,
    },
    Delete {
        token_id: String,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    Spawn {
        project: String,
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        worktree: Option<String>,
    },
    Stop {
        project: String,
        #[arg(long)]
        force: bool,
    },
    Logs {
        project: String,
        #[arg(long, default_value_t = 100)]
        lines: usize,
    },
    Assign {
        project: String,
        task: String,
    },
    Status {
        project: String,
    },
    List,
}

#[derive(Subcommand)]
enum QueueAction {
    Add {
        project: String,
        description: String,
        #[arg(long, default_value = "normal")]
        priority: String,
    },
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        project: Option<String>,
    },
    Cancel {
        task_id: String,
    },
    Stats,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default config template (refuses to overwrite)
    Init,
    Show,
    Path,
    SetSecret { key: String, value: String },
    GetSecret { key: String },
    ListSecrets,
    DeleteSecret { key: String },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let home = adt_home();

    match cli.command {
        Command::Server { action } => match action {
            ServerAction::Start => serve(&home).await,
            ServerAction::Stop => stop_server(&home),
            ServerAction::Status => {
                let client = HttpClient::new(&home)?;
                let body = client.get("/health").await?;
                print_json(&body);
                Ok(())
            }
        },
        Command::Token { action } => {
            let client = HttpClient::new(&home)?;
            match action {
                TokenAction::Create {
                    name,
                    role,
                    expires_in_days,
                } => {
                    let body = client
                        .post(
                            "/tokens",
                            &json!({
                                "name": name,
                                "role": role,
                                "expires_in_days": expires_in_days,
                            }),
                        )
                        .await?;
                    print_json(&body);
                    Ok(())
                }
                TokenAction::List => {
                    print_json(&client.get("/tokens").await?);
                    Ok(())
                }
                TokenAction::Revoke { token_id } | TokenAction::Delete { token_id } => {
                    print_json(&client.delete(&format!("/tokens/{token_id}")).await?);
                    Ok(())
                }
            }
        }
        Command::Agent { action } => {
            let client = HttpClient::new(&home)?;
            match action {
                AgentAction::Spawn {
                    project,
                    task,
                    provider,
                    worktree,
                } => {
                    let body = client
                        .post(
                            "/agents/spawn",
                            &json!({
                                "project": project,
                                "task": task,
                                "provider": provider,
                                "worktree": worktree,
                            }),
                        )
                        .await?;
                    print_json(&body);
                    Ok(())
                }
                AgentAction::Stop { project, force } => {
                    let body = client
                        .post(&format!("/agents/{project}/stop"), &json!({"force": force}))
                        .await?;
                    print_json(&body);
                    Ok(())
                }
                AgentAction::Logs { project, lines } => {
                    let body = client
                        .get(&format!("/agents/{project}/logs?lines={lines}"))
                        .await?;
                    match body.get("logs").and_then(|l| l.as_str()) {
                        Some(logs) => println!("{logs}"),
                        None => print_json(&body),
                    }
                    Ok(())
                }
                AgentAction::Assign { project, task } => {
                    let body = client
                        .post(&format!("/agents/{project}/assign"), &json!({"task": task}))
                        .await?;
                    print_json(&body);
                    Ok(())
                }
                AgentAction::Status { project } => {
                    print_json(&client.get(&format!("/agents/{project}")).await?);
                    Ok(())
                }
                AgentAction::List => {
                    print_json(&client.get("/agents").await?);
                    Ok(())
                }
            }
        }
        Command::Queue { action } => {
            let client = HttpClient::new(&home)?;
            match action {
                QueueAction::Add {
                    project,
                    description,
                    priority,
                } => {
                    let body = client
                        .post(
                            "/tasks",
                            &json!({
                                "project": project,
                                "description": description,
                                "priority": priority,
                            }),
                        )
                        .await?;
                    print_json(&body);
                    Ok(())
                }
                QueueAction::List { status, project } => {
                    let mut query = Vec::new();
                    if let Some(status) = status {
                        query.push(format!("status={status}"));
                    }
                    if let Some(project) = project {
                        query.push(format!("project={project}"));
                    }
                    let path = if query.is_empty() {
                        "/tasks".to_string()
                    } else {
                        format!("/tasks?{}", query.join("&"))
                    };
                    print_json(&client.get(&path).await?);
                    Ok(())
                }
                QueueAction::Cancel { task_id } => {
                    print_json(&client.post(&format!("/tasks/{task_id}/cancel"), &json!({})).await?);
                    Ok(())
                }
                QueueAction::Stats => {
                    print_json(&client.get("/tasks/stats").await?);
                    Ok(())
                }
            }
        }
        Command::Config { action } => match action {
            ConfigAction::Init => {
                let path = home.join("config.yml");
                if path.exists() {
                    return Err(AdtError::Conflict(format!(
                        "Config already exists at {}",
                        path.display()
                    )));
                }
                std::fs::create_dir_all(&home)?;
                std::fs::write(&path, CONFIG_TEMPLATE)?;
                println!("Wrote {}", path.display());
                Ok(())
            }
            ConfigAction::Show => {
                let config = Config::load(&home)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigAction::Path => {
                println!("{}", home.join("config.yml").display());
                Ok(())
            }
            ConfigAction::SetSecret { key, value } => {
                let vault = Vault::open(&home)?;
                vault.set(&key, &value)?;
                println!("Stored secret {key}");
                Ok(())
            }
            ConfigAction::GetSecret { key } => {
                let vault = Vault::open(&home)?;
                match vault.get(&key) {
                    Some(value) => {
                        println!("{value}");
                        Ok(())
                    }
                    None => Err(AdtError::NotFound(format!("Secret not found: {key}"))),
                }
            }
            ConfigAction::ListSecrets => {
                let vault = Vault::open(&home)?;
                for key in vault.list_keys() {
                    println!("{key}");
                }
                Ok(())
            }
            ConfigAction::DeleteSecret { key } => {
                let vault = Vault::open(&home)?;
                if vault.delete(&key)? {
                    println!("Deleted secret {key}");
                    Ok(())
                } else {
                    Err(AdtError::NotFound(format!("Secret not found: {key}")))
                }
            }
        },
    }
}

/// Boot the core and serve until interrupted.
async fn serve(home: &PathBuf) -> Result<()> {
    let core = Core::init(home)?;
    let pid_path = home.join("server.pid");
    std::fs::write(&pid_path, std::process::id().to_string())?;

    let api = ApiServer::new(Arc::clone(&core));

    let chat_handle = if core.config.channels.discord.enabled {
        let adapter = ChatAdapter::new(Arc::clone(&core));
        Some(tokio::spawn(async move {
            if let Err(e) = adapter.run().await {
                tracing::error!("Chat adapter failed: {e}");
            }
        }))
    } else {
        None
    };

    tokio::select! {
        result = api.run() => {
            if let Err(e) = result {
                tracing::error!("API server failed: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received");
        }
    }

    if let Some(handle) = chat_handle {
        handle.abort();
    }
    core.shutdown().await;
    let _ = std::fs::remove_file(&pid_path);
    Ok(())
}

/// Signal a detached server through its pid file.
fn stop_server(home: &PathBuf) -> Result<()> {
    let pid_path = home.join("server.pid");
    let pid: u32 = std::fs::read_to_string(&pid_path)
        .map_err(|_| AdtError::NotFound("No server.pid; is the server running?".into()))?
        .trim()
        .parse()
        .map_err(|_| AdtError::Validation("Malformed server.pid".into()))?;
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .map_err(|e| AdtError::Process { message: format!("Failed to signal {pid}: {e}") })?;
    }
    println!("Sent SIGTERM to {pid}");
    Ok(())
}

struct HttpClient {
    base: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpClient {
    fn new(home: &std::path::Path) -> Result<Self> {
        let base = match std::env::var("ADT_SERVER") {
            Ok(url) => url,
            Err(_) => {
                let config = Config::load(home)?;
                format!("http://{}:{}", config.server.host, config.server.port)
            }
        };
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            token: std::env::var("ADT_TOKEN").ok(),
            client: reqwest::Client::new(),
        })
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value> {
        let response = self
            .authed(self.client.get(format!("{}{path}", self.base)))
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .authed(self.client.post(format!("{}{path}", self.base)))
            .json(body)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn delete(&self, path: &str) -> Result<serde_json::Value> {
        let response = self
            .authed(self.client.delete(format!("{}{path}", self.base)))
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn parse(response: reqwest::Response) -> Result<serde_json::Value> {
        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or_else(|_| json!({}));
        if status.is_success() {
            Ok(body)
        } else {
            let detail = body["error"].as_str().unwrap_or("request failed");
            Err(AdtError::Validation(format!("{status}: {detail}")))
        }
    }
}

fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}
