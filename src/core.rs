//! Assembly of the process-wide services into one explicit value.
//!
//! Everything handlers touch hangs off [`Core`]; there are no lazy global
//! singletons.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::agents::AgentManager;
use crate::audit::{Actor, AuditAction, AuditDetails, AuditLogger};
use crate::auth::AuthManager;
use crate::config::{ensure_adt_home, Config, ProjectRegistry};
use crate::constants::SHUTDOWN_GRACE_SECS;
use crate::events::{EventBus, EventType};
use crate::orchestrator::Orchestrator;
use crate::ports::PortRegistry;
use crate::processes::ProcessManager;
use crate::rate_limit::RateLimiter;
use crate::scrubber::Scrubber;
use crate::store::{HistoryStore, TaskStore};
use crate::streaming::StreamManager;
use crate::vault::Vault;
use crate::Result;

pub struct Core {
    pub home: PathBuf,
    pub config: Config,
    pub registry: ProjectRegistry,
    pub vault: Arc<Vault>,
    pub scrubber: Arc<Scrubber>,
    pub audit: Arc<AuditLogger>,
    pub auth: Arc<AuthManager>,
    pub events: Arc<EventBus>,
    pub tasks: Arc<TaskStore>,
    pub history: Arc<HistoryStore>,
    pub ports: Arc<PortRegistry>,
    pub agents: Arc<AgentManager>,
    pub processes: Arc<ProcessManager>,
    pub streams: Arc<StreamManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub rate_limiter: RateLimiter,
    pub started_at: Instant,
    pub ws_clients: AtomicUsize,
}

impl Core {
    /// Build every subsystem under `home`. Must run inside the tokio
    /// runtime (the orchestrator spawns its completion listener here).
    pub fn init(home: &Path) -> Result<Arc<Self>> {
        ensure_adt_home(home)?;
        let config = Config::load(home)?;
        let registry = ProjectRegistry::new(home);

        let vault = Arc::new(Vault::open(home)?);
        let scrubber = Arc::new(Scrubber::new());
        scrubber.load_from_vault(&vault);

        let audit = Arc::new(AuditLogger::open(home)?);
        let auth = Arc::new(AuthManager::open(home)?);
        let events = Arc::new(EventBus::new());
        let tasks = Arc::new(TaskStore::open(home)?);
        let history = Arc::new(HistoryStore::open(home)?);
        let ports = Arc::new(PortRegistry::open(home)?);

        let agents = Arc::new(AgentManager::new(
            home,
            config.clone(),
            registry.clone(),
            Arc::clone(&scrubber),
            Arc::clone(&events),
        ));
        let processes = Arc::new(ProcessManager::new(
            home,
            Arc::clone(&ports),
            Arc::clone(&scrubber),
            Arc::clone(&events),
        ));
        let streams = Arc::new(StreamManager::new(home, Arc::clone(&scrubber)));
        let orchestrator = Orchestrator::new(
            &config,
            Arc::clone(&agents),
            Arc::clone(&tasks),
            Arc::clone(&history),
            Arc::clone(&events),
        );

        // First run: synthesize the admin token and print it exactly once.
        if let Some((bearer, info)) = auth.create_initial_admin_token()? {
            eprintln!();
            eprintln!("{}", "=".repeat(60));
            eprintln!("INITIAL ADMIN TOKEN CREATED");
            eprintln!("{}", "=".repeat(60));
            eprintln!("Token: {bearer}");
            eprintln!();
            eprintln!("Save this token! It will not be shown again.");
            eprintln!("Use it to authenticate API requests:");
            eprintln!("  curl -H 'Authorization: Bearer <token>' http://...");
            eprintln!("{}", "=".repeat(60));
            eprintln!();
            audit.record(
                AuditAction::AuthTokenCreated,
                &Actor::system(),
                AuditDetails::default()
                    .resource("token", &info.id)
                    .metadata(serde_json::json!({"name": info.name, "role": info.role})),
            );
        }

        let core = Arc::new(Self {
            home: home.to_path_buf(),
            config,
            registry,
            vault,
            scrubber,
            audit,
            auth,
            events,
            tasks,
            history,
            ports,
            agents,
            processes,
            streams,
            orchestrator,
            rate_limiter: RateLimiter::default(),
            started_at: Instant::now(),
            ws_clients: AtomicUsize::new(0),
        });

        if core.config.agents.auto_spawn {
            core.orchestrator.start();
        }

        core.events.emit(EventType::ServerStarted, None, serde_json::json!({}));
        core.audit.record(
            AuditAction::ServerStarted,
            &Actor::system(),
            AuditDetails::default(),
        );

        Ok(core)
    }

    /// Write a secret and register its value with the scrubber so it can
    /// never leave the process unredacted.
    pub fn set_secret(&self, key: &str, value: &str) -> Result<()> {
        self.vault.set(key, value)?;
        self.scrubber.add_known_secret(value);
        Ok(())
    }

    /// Orderly shutdown: halt the loop, signal children (TERM, then KILL
    /// after a grace period), close subscribers.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.orchestrator.stop();
        self.processes.stop_all(false);
        tokio::time::sleep(std::time::Duration::from_secs(SHUTDOWN_GRACE_SECS)).await;
        self.processes.stop_all(true);
        self.streams.stop_all();
        self.events.emit(EventType::ServerStopped, None, serde_json::json!({}));
        self.audit.record(
            AuditAction::ServerStopped,
            &Actor::system(),
            AuditDetails::default(),
        );
    }
}
