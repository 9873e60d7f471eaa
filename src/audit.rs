//! Append-only, hash-chained audit log.
//!
//! Every entry's `entry_hash` is an HMAC over (timestamp, actor, action,
//! previous hash), forming an unbroken chain from the first row. The log is
//! advisory: write failures are reported but never block the originating
//! request.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::Result;

type HmacSha256 = Hmac<Sha256>;

/// Closed set of audited actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    AuthLoginFailed,
    AuthTokenCreated,
    AuthTokenRevoked,
    AuthDenied,
    AgentSpawn,
    AgentStop,
    AgentRetry,
    TaskCreated,
    TaskCancelled,
    TaskReviewed,
    SecretRead,
    SecretWrite,
    SecretDelete,
    ProcessStart,
    ProcessStop,
    SecurityRateLimit,
    WebsocketConnect,
    WebsocketDisconnect,
    ServerStarted,
    ServerStopped,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::AuthLoginFailed => "auth.login.failed",
            AuditAction::AuthTokenCreated => "auth.token.created",
            AuditAction::AuthTokenRevoked => "auth.token.revoked",
            AuditAction::AuthDenied => "auth.denied",
            AuditAction::AgentSpawn => "agent.spawn",
            AuditAction::AgentStop => "agent.stop",
            AuditAction::AgentRetry => "agent.retry",
            AuditAction::TaskCreated => "task.created",
            AuditAction::TaskCancelled => "task.cancelled",
            AuditAction::TaskReviewed => "task.reviewed",
            AuditAction::SecretRead => "secret.read",
            AuditAction::SecretWrite => "secret.write",
            AuditAction::SecretDelete => "secret.delete",
            AuditAction::ProcessStart => "process.start",
            AuditAction::ProcessStop => "process.stop",
            AuditAction::SecurityRateLimit => "security.rate_limit",
            AuditAction::WebsocketConnect => "channel.websocket.connect",
            AuditAction::WebsocketDisconnect => "channel.websocket.disconnect",
            AuditAction::ServerStarted => "server.started",
            AuditAction::ServerStopped => "server.stopped",
        }
    }
}

/// Who performed an audited action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Actor {
    /// 'user', 'agent', 'system', 'channel' or 'client'.
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub actor_ip: Option<String>,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            actor_type: "system".to_string(),
            actor_id: None,
            actor_ip: None,
        }
    }

    pub fn user(id: &str, ip: Option<String>) -> Self {
        Self {
            actor_type: "user".to_string(),
            actor_id: Some(id.to_string()),
            actor_ip: ip,
        }
    }

    pub fn client(id: &str, ip: Option<String>) -> Self {
        Self {
            actor_type: "client".to_string(),
            actor_id: Some(id.to_string()),
            actor_ip: ip,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub actor_ip: Option<String>,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub request_id: Option<String>,
    pub channel: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub prev_hash: Option<String>,
    pub entry_hash: String,
}

/// Builder-style details for a log call; most fields are optional.
#[derive(Debug, Default, Clone)]
pub struct AuditDetails {
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub request_id: Option<String>,
    pub channel: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl AuditDetails {
    pub fn resource(mut self, rtype: &str, rid: &str) -> Self {
        self.resource_type = Some(rtype.to_string());
        self.resource_id = Some(rid.to_string());
        self
    }

    pub fn request(mut self, request_id: &str, channel: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self.channel = Some(channel.to_string());
        self
    }

    pub fn denied(mut self, error: &str) -> Self {
        self.status = Some("denied".to_string());
        self.error = Some(error.to_string());
        self
    }

    pub fn metadata(mut self, value: serde_json::Value) -> Self {
        self.metadata = Some(value);
        self
    }
}

/// Query filters for `AuditLogger::query`.
#[derive(Debug, Default, Clone)]
pub struct AuditQuery {
    pub action: Option<String>,
    pub actor_type: Option<String>,
    pub actor_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub status: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

pub struct AuditLogger {
    conn: Arc<Mutex<Connection>>,
    hmac_key: Vec<u8>,
    last_hash: Mutex<Option<String>>,
}

impl AuditLogger {
    pub fn open(home: &Path) -> Result<Self> {
        let data_dir = home.join("data");
        std::fs::create_dir_all(&data_dir)?;
        let hmac_key = get_or_create_hmac_key(&data_dir.join(".audit_key"))?;

        let conn = Connection::open(data_dir.join("audit.db"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                actor_type TEXT NOT NULL,
                actor_id TEXT,
                actor_ip TEXT,
                action TEXT NOT NULL,
                resource_type TEXT,
                resource_id TEXT,
                request_id TEXT,
                channel TEXT,
                status TEXT DEFAULT 'success',
                error TEXT,
                metadata TEXT,
                prev_hash TEXT,
                entry_hash TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_time ON audit_log(timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_log(actor_type, actor_id);
            CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action);
            CREATE INDEX IF NOT EXISTS idx_audit_resource ON audit_log(resource_type, resource_id);",
        )?;

        let last_hash: Option<String> = conn
            .query_row(
                "SELECT entry_hash FROM audit_log ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok();

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            hmac_key,
            last_hash: Mutex::new(last_hash),
        })
    }

    fn compute_hash(
        &self,
        timestamp: &DateTime<Utc>,
        actor_type: &str,
        actor_id: Option<&str>,
        action: &str,
        prev_hash: Option<&str>,
    ) -> String {
        let data = format!(
            "{}:{}:{}:{}:{}",
            timestamp.to_rfc3339(),
            actor_type,
            actor_id.unwrap_or("None"),
            action,
            prev_hash.unwrap_or("None"),
        );
        let mut mac =
            HmacSha256::new_from_slice(&self.hmac_key).expect("HMAC accepts any key length");
        mac.update(data.as_bytes());
        let digest = mac.finalize().into_bytes();
        hex_encode(&digest)[..32].to_string()
    }

    /// Append an entry, chaining it onto the previous hash. The hash update
    /// and the insert commit together under the connection lock.
    pub fn log(
        &self,
        action: AuditAction,
        actor: &Actor,
        details: AuditDetails,
    ) -> Result<AuditEntry> {
        let timestamp = Utc::now();
        let mut last_hash = self.last_hash.lock().unwrap();
        let prev_hash = last_hash.clone();
        let entry_hash = self.compute_hash(
            &timestamp,
            &actor.actor_type,
            actor.actor_id.as_deref(),
            action.as_str(),
            prev_hash.as_deref(),
        );

        let entry = AuditEntry {
            id: None,
            timestamp,
            actor_type: actor.actor_type.clone(),
            actor_id: actor.actor_id.clone(),
            actor_ip: actor.actor_ip.clone(),
            action: action.as_str().to_string(),
            resource_type: details.resource_type,
            resource_id: details.resource_id,
            request_id: details.request_id,
            channel: details.channel,
            status: details.status.unwrap_or_else(|| "success".to_string()),
            error: details.error,
            metadata: details.metadata,
            prev_hash: prev_hash.clone(),
            entry_hash: entry_hash.clone(),
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit_log (
                timestamp, actor_type, actor_id, actor_ip, action,
                resource_type, resource_id, request_id, channel,
                status, error, metadata, prev_hash, entry_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            rusqlite::params![
                entry.timestamp.to_rfc3339(),
                entry.actor_type,
                entry.actor_id,
                entry.actor_ip,
                entry.action,
                entry.resource_type,
                entry.resource_id,
                entry.request_id,
                entry.channel,
                entry.status,
                entry.error,
                entry.metadata.as_ref().map(|m| m.to_string()),
                entry.prev_hash,
                entry.entry_hash,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        *last_hash = Some(entry_hash);

        Ok(AuditEntry {
            id: Some(id),
            ..entry
        })
    }

    /// Best-effort logging: failures are surfaced as warnings only.
    pub fn record(&self, action: AuditAction, actor: &Actor, details: AuditDetails) {
        if let Err(e) = self.log(action, actor, details) {
            warn!("audit write failed for {}: {}", action.as_str(), e);
        }
    }

    pub fn query(&self, filters: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        let mut push = |cond: &str, value: String| {
            params.push(Box::new(value));
            conditions.push(format!("{cond} ?{}", params.len()));
        };

        if let Some(action) = &filters.action {
            push("action =", action.clone());
        }
        if let Some(actor_type) = &filters.actor_type {
            push("actor_type =", actor_type.clone());
        }
        if let Some(actor_id) = &filters.actor_id {
            push("actor_id =", actor_id.clone());
        }
        if let Some(rt) = &filters.resource_type {
            push("resource_type =", rt.clone());
        }
        if let Some(rid) = &filters.resource_id {
            push("resource_id =", rid.clone());
        }
        if let Some(status) = &filters.status {
            push("status =", status.clone());
        }
        if let Some(since) = &filters.since {
            push("timestamp >=", since.to_rfc3339());
        }
        if let Some(until) = &filters.until {
            push("timestamp <=", until.to_rfc3339());
        }

        let where_clause = if conditions.is_empty() {
            "1=1".to_string()
        } else {
            conditions.join(" AND ")
        };
        let limit = if filters.limit == 0 { 100 } else { filters.limit };

        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT * FROM audit_log WHERE {where_clause}
             ORDER BY id DESC LIMIT {limit} OFFSET {}",
            filters.offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), row_to_entry)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Walk all entries in insertion order, recomputing each hash.
    /// Returns Ok(()) for an unbroken chain, or the first broken link.
    pub fn verify_integrity(&self) -> Result<std::result::Result<(), String>> {
        let entries = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT * FROM audit_log ORDER BY id ASC")?;
            let rows = stmt.query_map([], row_to_entry)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut prev_hash: Option<String> = None;
        for entry in &entries {
            if entry.prev_hash != prev_hash {
                return Ok(Err(format!(
                    "Chain broken at entry {}: expected prev_hash {:?}, got {:?}",
                    entry.id.unwrap_or(-1),
                    prev_hash,
                    entry.prev_hash
                )));
            }
            let expected = self.compute_hash(
                &entry.timestamp,
                &entry.actor_type,
                entry.actor_id.as_deref(),
                &entry.action,
                entry.prev_hash.as_deref(),
            );
            if entry.entry_hash != expected {
                return Ok(Err(format!(
                    "Invalid hash at entry {}: expected {}, got {}",
                    entry.id.unwrap_or(-1),
                    expected,
                    entry.entry_hash
                )));
            }
            prev_hash = Some(entry.entry_hash.clone());
        }
        Ok(Ok(()))
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let timestamp: String = row.get("timestamp")?;
    let metadata: Option<String> = row.get("metadata")?;
    Ok(AuditEntry {
        id: row.get("id")?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        actor_type: row.get("actor_type")?,
        actor_id: row.get("actor_id")?,
        actor_ip: row.get("actor_ip")?,
        action: row.get("action")?,
        resource_type: row.get("resource_type")?,
        resource_id: row.get("resource_id")?,
        request_id: row.get("request_id")?,
        channel: row.get("channel")?,
        status: row.get("status")?,
        error: row.get("error")?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        prev_hash: row.get("prev_hash")?,
        entry_hash: row.get("entry_hash")?,
    })
}

fn get_or_create_hmac_key(path: &Path) -> Result<Vec<u8>> {
    if path.exists() {
        return Ok(std::fs::read(path)?);
    }
    use rand::RngCore;
    let mut key = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    std::fs::write(path, &key)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(key)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
