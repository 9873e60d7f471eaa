//! Run and event history (`data/logs.db`).
//!
//! The orchestrator records one `agent_runs` row per spawn; bus events are
//! mirrored into `events` so `GET /events` can serve more than the bounded
//! in-memory history.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::models::{AgentRun, AgentRunStatus};
use crate::Result;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EventRecord {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub project: Option<String>,
    pub task_id: Option<String>,
    pub level: String,
    pub message: Option<String>,
    pub data: Option<serde_json::Value>,
}

pub struct HistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl HistoryStore {
    pub fn open(home: &Path) -> Result<Self> {
        let data_dir = home.join("data");
        std::fs::create_dir_all(&data_dir)?;
        let conn = Connection::open(data_dir.join("logs.db"))?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agent_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT NOT NULL,
                provider TEXT,
                task TEXT,
                task_id TEXT,
                pid INTEGER,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                exit_code INTEGER,
                status TEXT NOT NULL,
                error TEXT,
                log_file TEXT
            );
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                type TEXT NOT NULL,
                project TEXT,
                task_id TEXT,
                level TEXT NOT NULL DEFAULT 'info',
                message TEXT,
                data TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_events_time ON events(timestamp);
            CREATE INDEX IF NOT EXISTS idx_runs_project ON agent_runs(project);",
        )?;
        Ok(())
    }

    pub fn create_run(&self, run: &AgentRun) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO agent_runs (project, provider, task, task_id, pid, started_at, status, log_file)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                run.project,
                run.provider,
                run.task,
                run.task_id,
                run.pid,
                run.started_at.to_rfc3339(),
                run.status.as_str(),
                run.log_file,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_run(
        &self,
        run_id: i64,
        exit_code: i32,
        status: AgentRunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE agent_runs SET ended_at = ?2, exit_code = ?3, status = ?4, error = ?5
             WHERE id = ?1",
            rusqlite::params![
                run_id,
                Utc::now().to_rfc3339(),
                exit_code,
                status.as_str(),
                error,
            ],
        )?;
        Ok(())
    }

    pub fn list_runs(&self, project: Option<&str>, limit: usize) -> Result<Vec<AgentRun>> {
        let limit = if limit == 0 { 50 } else { limit };
        let conn = self.conn.lock().unwrap();
        let (sql, params): (String, Vec<String>) = match project {
            Some(p) => (
                format!(
                    "SELECT * FROM agent_runs WHERE project = ?1
                     ORDER BY started_at DESC LIMIT {limit}"
                ),
                vec![p.to_string()],
            ),
            None => (
                format!("SELECT * FROM agent_runs ORDER BY started_at DESC LIMIT {limit}"),
                vec![],
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
        let rows = stmt.query_map(refs.as_slice(), row_to_run)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn log_event(
        &self,
        event_type: &str,
        project: Option<&str>,
        task_id: Option<&str>,
        level: &str,
        message: Option<&str>,
        data: Option<&serde_json::Value>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (timestamp, type, project, task_id, level, message, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                Utc::now().to_rfc3339(),
                event_type,
                project,
                task_id,
                level,
                message,
                data.map(|d| d.to_string()),
            ],
        )?;
        Ok(())
    }

    pub fn query_events(
        &self,
        event_type: Option<&str>,
        project: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<EventRecord>> {
        let limit = if limit == 0 { 100 } else { limit };
        let mut conditions = Vec::new();
        let mut params: Vec<String> = Vec::new();
        if let Some(t) = event_type {
            params.push(t.to_string());
            conditions.push(format!("type = ?{}", params.len()));
        }
        if let Some(p) = project {
            params.push(p.to_string());
            conditions.push(format!("project = ?{}", params.len()));
        }
        if let Some(since) = since {
            params.push(since.to_rfc3339());
            conditions.push(format!("timestamp >= ?{}", params.len()));
        }
        let where_clause = if conditions.is_empty() {
            "1=1".to_string()
        } else {
            conditions.join(" AND ")
        };

        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT * FROM events WHERE {where_clause} ORDER BY id DESC LIMIT {limit}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
        let rows = stmt.query_map(refs.as_slice(), |row| {
            let timestamp: String = row.get("timestamp")?;
            let data: Option<String> = row.get("data")?;
            Ok(EventRecord {
                id: row.get("id")?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                event_type: row.get("type")?,
                project: row.get("project")?,
                task_id: row.get("task_id")?,
                level: row.get("level")?,
                message: row.get("message")?,
                data: data.and_then(|d| serde_json::from_str(&d).ok()),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRun> {
    let parse_ts = |t: String| {
        DateTime::parse_from_rfc3339(&t)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    };
    let status: String = row.get("status")?;
    Ok(AgentRun {
        id: row.get("id")?,
        project: row.get("project")?,
        provider: row.get("provider")?,
        task: row.get("task")?,
        task_id: row.get("task_id")?,
        pid: row.get("pid")?,
        started_at: parse_ts(row.get("started_at")?),
        ended_at: row.get::<_, Option<String>>("ended_at")?.map(parse_ts),
        exit_code: row.get("exit_code")?,
        status: status.parse().unwrap_or(AgentRunStatus::Running),
        error: row.get("error")?,
        log_file: row.get("log_file")?,
    })
}
