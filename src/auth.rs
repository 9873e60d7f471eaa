//! Bearer-token authentication and role-based authorization.
//!
//! Tokens are opaque high-entropy strings with a recognizable prefix; only
//! their SHA-256 digest is stored. Roles map to static permission sets.

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;

use crate::constants::TOKEN_PREFIX;
use crate::{AdtError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Viewer => "viewer",
            Role::Agent => "agent",
        }
    }
}

impl FromStr for Role {
    type Err = AdtError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(Role::Admin),
            "operator" => Ok(Role::Operator),
            "viewer" => Ok(Role::Viewer),
            "agent" => Ok(Role::Agent),
            _ => Err(AdtError::Validation(format!("Unknown role: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    // Admin only
    TokensManage,
    ConfigWrite,
    SecretsManage,
    AuditRead,
    // Operator+
    AgentsSpawn,
    AgentsStop,
    TasksCreate,
    TasksCancel,
    ProcessesManage,
    // Viewer+
    AgentsRead,
    TasksRead,
    LogsRead,
    StatusRead,
    ProjectsRead,
    // Agent-to-server
    Heartbeat,
    TaskUpdate,
    LogsWrite,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::TokensManage => "tokens.manage",
            Permission::ConfigWrite => "config.write",
            Permission::SecretsManage => "secrets.manage",
            Permission::AuditRead => "audit.read",
            Permission::AgentsSpawn => "agents.spawn",
            Permission::AgentsStop => "agents.stop",
            Permission::TasksCreate => "tasks.create",
            Permission::TasksCancel => "tasks.cancel",
            Permission::ProcessesManage => "processes.manage",
            Permission::AgentsRead => "agents.read",
            Permission::TasksRead => "tasks.read",
            Permission::LogsRead => "logs.read",
            Permission::StatusRead => "status.read",
            Permission::ProjectsRead => "projects.read",
            Permission::Heartbeat => "heartbeat",
            Permission::TaskUpdate => "task.update",
            Permission::LogsWrite => "logs.write",
        }
    }
}

const VIEWER_PERMISSIONS: &[Permission] = &[
    Permission::AgentsRead,
    Permission::TasksRead,
    Permission::LogsRead,
    Permission::StatusRead,
    Permission::ProjectsRead,
];

const OPERATOR_PERMISSIONS: &[Permission] = &[
    Permission::AgentsSpawn,
    Permission::AgentsStop,
    Permission::TasksCreate,
    Permission::TasksCancel,
    Permission::ProcessesManage,
    Permission::AgentsRead,
    Permission::TasksRead,
    Permission::LogsRead,
    Permission::StatusRead,
    Permission::ProjectsRead,
];

const AGENT_PERMISSIONS: &[Permission] = &[
    Permission::Heartbeat,
    Permission::TaskUpdate,
    Permission::LogsWrite,
    Permission::StatusRead,
];

impl Role {
    pub fn has_permission(&self, permission: Permission) -> bool {
        match self {
            Role::Admin => true,
            Role::Operator => OPERATOR_PERMISSIONS.contains(&permission),
            Role::Viewer => VIEWER_PERMISSIONS.contains(&permission),
            Role::Agent => AGENT_PERMISSIONS.contains(&permission),
        }
    }
}

/// Token metadata; the bearer string itself is known only at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

pub struct AuthManager {
    conn: Arc<Mutex<Connection>>,
}

impl AuthManager {
    pub fn open(home: &Path) -> Result<Self> {
        let data_dir = home.join("data");
        std::fs::create_dir_all(&data_dir)?;
        let conn = Connection::open(data_dir.join("auth.db"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tokens (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                token_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                last_used_at TEXT,
                revoked INTEGER DEFAULT 0,
                created_by TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tokens_hash ON tokens(token_hash);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn hash_token(token: &str) -> String {
        let digest = Sha256::digest(token.as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn generate_bearer() -> String {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        format!(
            "{}{}",
            TOKEN_PREFIX,
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
        )
    }

    /// Create a token. Returns the plain bearer string (shown exactly once)
    /// and the stored metadata.
    pub fn create_token(
        &self,
        name: &str,
        role: Role,
        expires_in_days: Option<i64>,
        created_by: Option<&str>,
    ) -> Result<(String, TokenInfo)> {
        let token_id = crate::models::short_id();
        let bearer = Self::generate_bearer();
        let token_hash = Self::hash_token(&bearer);

        let now = Utc::now();
        let expires_at = expires_in_days.map(|days| now + Duration::days(days));

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tokens (id, name, token_hash, role, created_at, expires_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                token_id,
                name,
                token_hash,
                role.as_str(),
                now.to_rfc3339(),
                expires_at.map(|t| t.to_rfc3339()),
                created_by,
            ],
        )?;

        let info = TokenInfo {
            id: token_id,
            name: name.to_string(),
            role,
            created_at: now,
            expires_at,
            last_used_at: None,
            revoked: false,
        };
        Ok((bearer, info))
    }

    /// Validate a bearer string (with or without the `Bearer ` prefix).
    /// Returns the token record if it exists, is not revoked, and is not
    /// expired; stamps `last_used_at` on success.
    pub fn validate(&self, bearer: &str) -> Result<Option<TokenInfo>> {
        let token = bearer.strip_prefix("Bearer ").unwrap_or(bearer);
        if token.is_empty() {
            return Ok(None);
        }
        let token_hash = Self::hash_token(token);

        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String, String, String, Option<String>, String, bool)> = conn
            .query_row(
                "SELECT id, name, role, created_at, expires_at, token_hash, revoked
                 FROM tokens WHERE token_hash = ?1",
                [&token_hash],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let Some((id, name, role, created_at, expires_at, stored_hash, revoked)) = row else {
            return Ok(None);
        };

        if !bool::from(stored_hash.as_bytes().ct_eq(token_hash.as_bytes())) {
            return Ok(None);
        }
        if revoked {
            return Ok(None);
        }

        let expires_at = expires_at.and_then(|t| {
            DateTime::parse_from_rfc3339(&t)
                .map(|t| t.with_timezone(&Utc))
                .ok()
        });
        if let Some(expiry) = expires_at {
            if expiry < Utc::now() {
                return Ok(None);
            }
        }

        let now = Utc::now();
        conn.execute(
            "UPDATE tokens SET last_used_at = ?1 WHERE id = ?2",
            rusqlite::params![now.to_rfc3339(), id],
        )?;

        Ok(Some(TokenInfo {
            id,
            name,
            role: role.parse()?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            expires_at,
            last_used_at: Some(now),
            revoked: false,
        }))
    }

    pub fn list_tokens(&self) -> Result<Vec<TokenInfo>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, role, created_at, expires_at, last_used_at, revoked
             FROM tokens ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, bool>(6)?,
            ))
        })?;

        let parse_ts = |t: &str| {
            DateTime::parse_from_rfc3339(t)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now())
        };

        let mut tokens = Vec::new();
        for row in rows {
            let (id, name, role, created_at, expires_at, last_used_at, revoked) = row?;
            tokens.push(TokenInfo {
                id,
                name,
                role: role.parse()?,
                created_at: parse_ts(&created_at),
                expires_at: expires_at.as_deref().map(parse_ts),
                last_used_at: last_used_at.as_deref().map(parse_ts),
                revoked,
            });
        }
        Ok(tokens)
    }

    pub fn revoke_token(&self, token_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE tokens SET revoked = 1 WHERE id = ?1",
            [token_id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_token(&self, token_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM tokens WHERE id = ?1", [token_id])?;
        Ok(changed > 0)
    }

    pub fn has_any_tokens(&self) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM tokens WHERE NOT revoked", [], |row| {
                row.get(0)
            })?;
        Ok(count > 0)
    }

    /// Create the bootstrap admin token if the table is empty.
    pub fn create_initial_admin_token(&self) -> Result<Option<(String, TokenInfo)>> {
        if self.has_any_tokens()? {
            return Ok(None);
        }
        self.create_token("Initial Admin Token", Role::Admin, None, None)
            .map(Some)
    }
}
