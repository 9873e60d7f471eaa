//! WebSocket sessions: command/subscribe protocol plus event fan-out.
//!
//! Authentication is optional at upgrade time; a token may be sent as an
//! `auth` command. Commands that mutate state require an authenticated
//! token with the matching permission.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Extension;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditDetails};
use crate::auth::{Permission, TokenInfo};
use crate::constants::WS_PING_INTERVAL_SECS;
use crate::core::Core;

use super::middleware::RequestContext;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(core): State<Arc<Core>>,
    Extension(ctx): Extension<RequestContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_session(socket, core, ctx))
}

struct Subscription {
    id: Uuid,
    forwarder: tokio::task::JoinHandle<()>,
}

async fn ws_session(mut socket: WebSocket, core: Arc<Core>, ctx: RequestContext) {
    core.ws_clients.fetch_add(1, Ordering::SeqCst);
    core.audit.record(
        AuditAction::WebsocketConnect,
        &ctx.actor(),
        AuditDetails::default().request(&ctx.request_id, "ws"),
    );

    let mut token: Option<TokenInfo> = ctx.token.clone();
    let mut events_rx = core.events.subscribe();
    // Output from all project subscriptions funnels through one channel,
    // tagged with the project name.
    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<(String, String)>();
    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();

    let snapshot = status_snapshot(&core);
    let hello = json!({"type": "connected", "data": snapshot});
    if socket.send(Message::Text(hello.to_string().into())).await.is_err() {
        cleanup(&core, &ctx, &mut subscriptions);
        return;
    }

    let mut last_client_message = Instant::now();
    let mut ping_interval = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            message = socket.recv() => {
                let Some(Ok(message)) = message else { break };
                last_client_message = Instant::now();
                match message {
                    Message::Text(text) => {
                        let reply = handle_command(
                            &core,
                            &mut token,
                            &mut subscriptions,
                            &output_tx,
                            &text,
                        );
                        if let Some(reply) = reply {
                            if socket
                                .send(Message::Text(reply.to_string().into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            event = events_rx.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(payload) = serde_json::to_string(&event) else { continue };
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("WebSocket client lagged {n} events");
                    }
                    Err(_) => break,
                }
            }
            output = output_rx.recv() => {
                let Some((project, content)) = output else { break };
                let payload = json!({
                    "type": "agent.output",
                    "project": project,
                    "content": content,
                });
                if socket.send(Message::Text(payload.to_string().into())).await.is_err() {
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if last_client_message.elapsed() >= Duration::from_secs(WS_PING_INTERVAL_SECS) {
                    last_client_message = Instant::now();
                    let ping = json!({"type": "ping"});
                    if socket.send(Message::Text(ping.to_string().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    cleanup(&core, &ctx, &mut subscriptions);
}

fn cleanup(core: &Arc<Core>, ctx: &RequestContext, subscriptions: &mut HashMap<String, Subscription>) {
    for (project, sub) in subscriptions.drain() {
        sub.forwarder.abort();
        core.streams.unsubscribe(&project, sub.id);
    }
    core.ws_clients.fetch_sub(1, Ordering::SeqCst);
    core.audit.record(
        AuditAction::WebsocketDisconnect,
        &ctx.actor(),
        AuditDetails::default().request(&ctx.request_id, "ws"),
    );
}

fn status_snapshot(core: &Arc<Core>) -> serde_json::Value {
    let sessions = core.agents.list();
    let running = sessions.iter().filter(|s| s.status.is_live()).count();
    json!({
        "agents": running,
        "tasks": core.tasks.stats().unwrap_or_default(),
    })
}

fn error_reply(message: &str) -> serde_json::Value {
    json!({"type": "error", "data": {"message": message}})
}

fn handle_command(
    core: &Arc<Core>,
    token: &mut Option<TokenInfo>,
    subscriptions: &mut HashMap<String, Subscription>,
    output_tx: &mpsc::UnboundedSender<(String, String)>,
    text: &str,
) -> Option<serde_json::Value> {
    let Ok(message) = serde_json::from_str::<serde_json::Value>(text) else {
        return Some(error_reply("Invalid JSON"));
    };
    let command = message["command"].as_str().unwrap_or_default();

    match command {
        "ping" => Some(json!({"type": "pong"})),
        "status" => Some(json!({"type": "status", "data": status_snapshot(core)})),
        "auth" => {
            let bearer = message["token"].as_str().unwrap_or_default();
            match core.auth.validate(bearer) {
                Ok(Some(info)) => {
                    let role = info.role;
                    *token = Some(info);
                    Some(json!({"type": "authenticated", "data": {"role": role}}))
                }
                _ => Some(error_reply("Invalid or expired token")),
            }
        }
        "subscribe" => {
            let Some(project) = message["project"].as_str() else {
                return Some(error_reply("subscribe requires a project"));
            };
            if subscriptions.contains_key(project) {
                return Some(json!({"type": "subscribed", "project": project}));
            }
            let (id, mut rx) = core.streams.subscribe(project);
            let tx = output_tx.clone();
            let name = project.to_string();
            let forwarder = tokio::spawn(async move {
                while let Some(content) = rx.recv().await {
                    if tx.send((name.clone(), content)).is_err() {
                        break;
                    }
                }
            });
            subscriptions.insert(project.to_string(), Subscription { id, forwarder });
            Some(json!({"type": "subscribed", "project": project}))
        }
        "unsubscribe" => {
            let Some(project) = message["project"].as_str() else {
                return Some(error_reply("unsubscribe requires a project"));
            };
            if let Some(sub) = subscriptions.remove(project) {
                sub.forwarder.abort();
                core.streams.unsubscribe(project, sub.id);
            }
            Some(json!({"type": "unsubscribed", "project": project}))
        }
        "spawn" => {
            let authorized = token
                .as_ref()
                .map(|t| t.role.has_permission(Permission::AgentsSpawn))
                .unwrap_or(false);
            if !authorized {
                return Some(error_reply("Permission denied: agents.spawn"));
            }
            let Some(project) = message["project"].as_str() else {
                return Some(error_reply("spawn requires a project"));
            };
            let task = message["task"].as_str();
            match core.agents.spawn(project, None, None, task) {
                Ok(session) => Some(json!({
                    "type": "agent.spawned",
                    "project": project,
                    "data": {"pid": session.pid, "status": session.status},
                })),
                Err(e) => Some(error_reply(&e.to_string())),
            }
        }
        other => Some(error_reply(&format!("Unknown command: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;

    fn test_core() -> (tempfile::TempDir, Arc<Core>) {
        let dir = tempfile::tempdir().unwrap();
        crate::config::ensure_adt_home(dir.path()).unwrap();
        let core = Core::init(dir.path()).unwrap();
        (dir, core)
    }

    fn run_command(
        core: &Arc<Core>,
        token: &mut Option<TokenInfo>,
        text: &str,
    ) -> serde_json::Value {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut subscriptions = HashMap::new();
        handle_command(core, token, &mut subscriptions, &tx, text).unwrap()
    }

    #[tokio::test]
    async fn ping_yields_pong() {
        let (_dir, core) = test_core();
        let reply = run_command(&core, &mut None, r#"{"command": "ping"}"#);
        assert_eq!(reply["type"], "pong");
    }

    #[tokio::test]
    async fn status_returns_snapshot() {
        let (_dir, core) = test_core();
        let reply = run_command(&core, &mut None, r#"{"command": "status"}"#);
        assert_eq!(reply["type"], "status");
        assert!(reply["data"]["tasks"].is_object());
    }

    #[tokio::test]
    async fn spawn_requires_authentication() {
        let (_dir, core) = test_core();
        let reply = run_command(
            &core,
            &mut None,
            r#"{"command": "spawn", "project": "demo"}"#,
        );
        assert_eq!(reply["type"], "error");
        assert!(reply["data"]["message"]
            .as_str()
            .unwrap()
            .contains("agents.spawn"));
    }

    #[tokio::test]
    async fn auth_command_upgrades_the_session() {
        let (_dir, core) = test_core();
        let (bearer, _) = core
            .auth
            .create_token("ws", Role::Operator, None, None)
            .unwrap();
        let mut token = None;
        let reply = run_command(
            &core,
            &mut token,
            &json!({"command": "auth", "token": bearer}).to_string(),
        );
        assert_eq!(reply["type"], "authenticated");
        assert!(token.is_some());

        let reply = run_command(
            &core,
            &mut token,
            r#"{"command": "auth", "token": "adt_wrong"}"#,
        );
        assert_eq!(reply["type"], "error");
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_manage_tailers() {
        let (_dir, core) = test_core();
        std::fs::write(core.streams.log_path("demo"), "").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut subscriptions = HashMap::new();
        let mut token = None;

        let reply = handle_command(
            &core,
            &mut token,
            &mut subscriptions,
            &tx,
            r#"{"command": "subscribe", "project": "demo"}"#,
        )
        .unwrap();
        assert_eq!(reply["type"], "subscribed");
        assert_eq!(core.streams.active_streams(), 1);

        let reply = handle_command(
            &core,
            &mut token,
            &mut subscriptions,
            &tx,
            r#"{"command": "unsubscribe", "project": "demo"}"#,
        )
        .unwrap();
        assert_eq!(reply["type"], "unsubscribed");
        assert_eq!(core.streams.active_streams(), 0);
    }

    #[tokio::test]
    async fn unknown_command_and_bad_json_error() {
        let (_dir, core) = test_core();
        let reply = run_command(&core, &mut None, r#"{"command": "dance"}"#);
        assert_eq!(reply["type"], "error");
        let reply = run_command(&core, &mut None, "not json");
        assert_eq!(reply["type"], "error");
    }
}
