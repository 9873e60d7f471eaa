//! Task table with atomic claim, retry gate, and dependency promotion.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::constants::{OUTPUT_CAPTURE_CAP_BYTES, OUTPUT_TRUNCATED_MARKER};
use crate::models::{new_task, Task, TaskPriority, TaskStatus};
use crate::{AdtError, Result};

/// Literal marker replaced by the upstream task's captured output.
pub const OUTPUT_MARKER: &str = "{{output}}";

/// Claim ordering shared by every eligible-task query.
const CLAIM_ORDER: &str = "CASE priority
        WHEN 'urgent' THEN 0
        WHEN 'high' THEN 1
        WHEN 'normal' THEN 2
        ELSE 3
    END, created_at, id";

#[derive(Debug, Clone, Default)]
pub struct CreateTask {
    pub project: String,
    pub description: String,
    pub priority: TaskPriority,
    pub metadata: Option<serde_json::Value>,
    pub depends_on: Vec<String>,
    pub use_output_from: Option<String>,
    pub requires_review: bool,
    pub review_prompt: Option<String>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub project: Option<String>,
    pub limit: usize,
}

pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
    pub fn open(home: &Path) -> Result<Self> {
        let data_dir = home.join("data");
        std::fs::create_dir_all(&data_dir)?;
        let conn = Connection::open(data_dir.join("tasks.db"))?;
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
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                project TEXT NOT NULL,
                description TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'normal',
                status TEXT NOT NULL DEFAULT 'pending',
                assigned_to TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                output TEXT,
                error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                metadata TEXT,
                depends_on TEXT,
                use_output_from TEXT,
                requires_review INTEGER NOT NULL DEFAULT 0,
                review_prompt TEXT,
                reviewed_by TEXT,
                reviewed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project);",
        )?;
        Ok(())
    }

    /// Create a task. Dependencies that are not all completed put it in
    /// `blocked`; a review requirement puts it in `awaiting_review`.
    pub fn create(&self, req: CreateTask) -> Result<Task> {
        if req.project.is_empty() {
            return Err(AdtError::Validation("project is required".into()));
        }
        if req.description.is_empty() {
            return Err(AdtError::Validation("description is required".into()));
        }

        let mut depends_on = req.depends_on.clone();
        if let Some(upstream) = &req.use_output_from {
            if !depends_on.contains(upstream) {
                depends_on.push(upstream.clone());
            }
        }

        let mut task = new_task(
            req.project,
            req.description,
            req.priority,
            req.metadata,
            depends_on,
            req.use_output_from,
            req.requires_review,
            req.review_prompt,
        );
        if let Some(max_retries) = req.max_retries {
            task.max_retries = max_retries;
        }

        let conn = self.conn.lock().unwrap();

        if task.requires_review {
            task.status = TaskStatus::AwaitingReview;
        } else if !deps_met(&conn, &task.depends_on)? {
            task.status = TaskStatus::Blocked;
        } else if let Some(upstream) = task.use_output_from.clone() {
            substitute_output(&conn, &mut task, &upstream)?;
        }

        insert_task(&conn, &task)?;
        Ok(task)
    }

    pub fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        get_task(&conn, task_id)
    }

    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        let mut conditions = Vec::new();
        let mut params: Vec<String> = Vec::new();
        if let Some(status) = filter.status {
            params.push(status.as_str().to_string());
            conditions.push(format!("status = ?{}", params.len()));
        }
        if let Some(project) = &filter.project {
            params.push(project.clone());
            conditions.push(format!("project = ?{}", params.len()));
        }
        let where_clause = if conditions.is_empty() {
            "1=1".to_string()
        } else {
            conditions.join(" AND ")
        };

        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT * FROM tasks WHERE {where_clause} ORDER BY {CLAIM_ORDER} LIMIT {limit}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
        let rows = stmt.query_map(refs.as_slice(), row_to_task)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn list_pending(&self, limit: usize) -> Result<Vec<Task>> {
        self.list(&TaskFilter {
            status: Some(TaskStatus::Pending),
            project: None,
            limit,
        })
    }

    pub fn pending_review(&self) -> Result<Vec<Task>> {
        self.list(&TaskFilter {
            status: Some(TaskStatus::AwaitingReview),
            project: None,
            limit: 100,
        })
    }

    /// Atomically claim the next pending task for `project`. The single
    /// UPDATE statement guarantees two concurrent claimers never receive the
    /// same row.
    pub fn claim_next(&self, project: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "UPDATE tasks
             SET status = 'in_progress', assigned_to = ?1, started_at = ?2
             WHERE id = (
                 SELECT id FROM tasks
                 WHERE status = 'pending' AND project = ?1
                 ORDER BY {CLAIM_ORDER}
                 LIMIT 1
             )
             RETURNING *"
        );
        let task = conn
            .query_row(&sql, rusqlite::params![project, now], row_to_task)
            .optional()?;
        Ok(task)
    }

    /// Claim one specific pending task (manual `run`).
    pub fn claim_by_id(&self, task_id: &str) -> Result<Task> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let task = conn
            .query_row(
                "UPDATE tasks
                 SET status = 'in_progress', assigned_to = project, started_at = ?2
                 WHERE id = ?1 AND status = 'pending'
                 RETURNING *",
                rusqlite::params![task_id, now],
                row_to_task,
            )
            .optional()?;
        match task {
            Some(task) => Ok(task),
            None => match get_task(&conn, task_id)? {
                Some(t) => Err(AdtError::Conflict(format!(
                    "Task {task_id} is {} and cannot be run",
                    t.status
                ))),
                None => Err(AdtError::NotFound(format!("Task not found: {task_id}"))),
            },
        }
    }

    /// Mark a task completed and promote any dependents whose dependencies
    /// are now all satisfied. Returns the completed task and the promoted
    /// dependents (for event emission).
    pub fn complete(&self, task_id: &str, output: Option<&str>) -> Result<(Task, Vec<Task>)> {
        let output = output.map(cap_output);
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let now = Utc::now().to_rfc3339();
        let task = tx
            .query_row(
                "UPDATE tasks
                 SET status = 'completed', completed_at = ?2, output = ?3
                 WHERE id = ?1
                 RETURNING *",
                rusqlite::params![task_id, now, output],
                row_to_task,
            )
            .optional()?
            .ok_or_else(|| AdtError::NotFound(format!("Task not found: {task_id}")))?;

        let promoted = promote_unblocked(&tx, &task)?;
        tx.commit()?;
        Ok((task, promoted))
    }

    /// The retry gate: below the retry budget the task is re-queued with its
    /// original `created_at` (no queue jumping); at the budget it fails
    /// terminally.
    pub fn fail(&self, task_id: &str, error: &str) -> Result<Task> {
        let conn = self.conn.lock().unwrap();
        let current = get_task(&conn, task_id)?
            .ok_or_else(|| AdtError::NotFound(format!("Task not found: {task_id}")))?;

        let task = if current.retry_count < current.max_retries {
            conn.query_row(
                "UPDATE tasks
                 SET status = 'pending', retry_count = retry_count + 1,
                     assigned_to = NULL, started_at = NULL, error = ?2
                 WHERE id = ?1
                 RETURNING *",
                rusqlite::params![
                    task_id,
                    format!("Retry {}: {error}", current.retry_count + 1)
                ],
                row_to_task,
            )?
        } else {
            conn.query_row(
                "UPDATE tasks
                 SET status = 'failed', completed_at = ?2, error = ?3,
                     assigned_to = NULL, started_at = NULL
                 WHERE id = ?1
                 RETURNING *",
                rusqlite::params![task_id, Utc::now().to_rfc3339(), error],
                row_to_task,
            )?
        };
        Ok(task)
    }

    /// Cancel a task that has not started running.
    pub fn cancel(&self, task_id: &str) -> Result<Task> {
        let conn = self.conn.lock().unwrap();
        let task = conn
            .query_row(
                "UPDATE tasks
                 SET status = 'cancelled', completed_at = ?2
                 WHERE id = ?1 AND status IN ('pending', 'blocked', 'awaiting_review')
                 RETURNING *",
                rusqlite::params![task_id, Utc::now().to_rfc3339()],
                row_to_task,
            )
            .optional()?;
        match task {
            Some(task) => Ok(task),
            None => match get_task(&conn, task_id)? {
                Some(t) => Err(AdtError::Conflict(format!(
                    "Task {task_id} is {} and cannot be cancelled",
                    t.status
                ))),
                None => Err(AdtError::NotFound(format!("Task not found: {task_id}"))),
            },
        }
    }

    /// Re-queue a terminally failed or cancelled task. The retry counter is
    /// kept; only the scheduling state resets.
    pub fn retry(&self, task_id: &str) -> Result<Task> {
        let conn = self.conn.lock().unwrap();
        let task = conn
            .query_row(
                "UPDATE tasks
                 SET status = 'pending', assigned_to = NULL, started_at = NULL,
                     completed_at = NULL, error = NULL
                 WHERE id = ?1 AND status IN ('failed', 'cancelled')
                 RETURNING *",
                [task_id],
                row_to_task,
            )
            .optional()?;
        match task {
            Some(task) => Ok(task),
            None => match get_task(&conn, task_id)? {
                Some(t) => Err(AdtError::Conflict(format!(
                    "Task {task_id} is {} and cannot be retried",
                    t.status
                ))),
                None => Err(AdtError::NotFound(format!("Task not found: {task_id}"))),
            },
        }
    }

    /// Approve or reject a task awaiting review.
    pub fn review(
        &self,
        task_id: &str,
        approved: bool,
        reviewer: &str,
        edited_description: Option<&str>,
    ) -> Result<Task> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let current = get_task(&tx, task_id)?
            .ok_or_else(|| AdtError::NotFound(format!("Task not found: {task_id}")))?;
        if current.status != TaskStatus::AwaitingReview {
            return Err(AdtError::Conflict(format!(
                "Task {task_id} is {} and cannot be reviewed",
                current.status
            )));
        }

        let new_status = if approved {
            if deps_met(&tx, &current.depends_on)? {
                TaskStatus::Pending
            } else {
                TaskStatus::Blocked
            }
        } else {
            TaskStatus::Cancelled
        };

        let task = tx.query_row(
            "UPDATE tasks
             SET status = ?2, description = COALESCE(?3, description),
                 reviewed_by = ?4, reviewed_at = ?5,
                 completed_at = CASE WHEN ?2 = 'cancelled' THEN ?5 ELSE completed_at END
             WHERE id = ?1
             RETURNING *",
            rusqlite::params![
                task_id,
                new_status.as_str(),
                edited_description,
                reviewer,
                Utc::now().to_rfc3339(),
            ],
            row_to_task,
        )?;
        tx.commit()?;
        Ok(task)
    }

    pub fn stats(&self) -> Result<HashMap<String, i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stats: HashMap<String, i64> = [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Blocked,
            TaskStatus::AwaitingReview,
        ]
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut total = 0;
        for row in rows {
            let (status, count) = row?;
            total += count;
            stats.insert(status, count);
        }
        stats.insert("total".to_string(), total);
        Ok(stats)
    }

    /// Prune terminal tasks older than `older_than_days`.
    pub fn clear_completed(&self, older_than_days: i64) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(older_than_days)).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM tasks
             WHERE status IN ('completed', 'failed', 'cancelled')
               AND completed_at IS NOT NULL AND completed_at < ?1",
            [cutoff],
        )?;
        Ok(removed)
    }
}

/// All dependency ids must refer to completed tasks. An empty list is met.
fn deps_met(conn: &Connection, depends_on: &[String]) -> Result<bool> {
    for dep in depends_on {
        let status: Option<String> = conn
            .query_row("SELECT status FROM tasks WHERE id = ?1", [dep], |row| {
                row.get(0)
            })
            .optional()?;
        if status.as_deref() != Some("completed") {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Replace `{{output}}` in the task's description with the upstream task's
/// captured output, when the upstream has completed.
fn substitute_output(conn: &Connection, task: &mut Task, upstream_id: &str) -> Result<()> {
    let output: Option<Option<String>> = conn
        .query_row(
            "SELECT output FROM tasks WHERE id = ?1 AND status = 'completed'",
            [upstream_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(output) = output {
        let output = output.unwrap_or_default();
        task.description = task.description.replace(OUTPUT_MARKER, &output);
    }
    Ok(())
}

/// After `completed` commits for `completed_task`, move every blocked task
/// whose dependencies are now all satisfied to pending, substituting
/// `{{output}}` where the dependent chains on this task's output.
fn promote_unblocked(conn: &Connection, completed_task: &Task) -> Result<Vec<Task>> {
    let blocked: Vec<Task> = {
        let mut stmt = conn.prepare("SELECT * FROM tasks WHERE status = 'blocked'")?;
        let rows = stmt.query_map([], row_to_task)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
    };

    let mut promoted = Vec::new();
    for mut task in blocked {
        if !task.depends_on.iter().any(|d| d == &completed_task.id) {
            continue;
        }
        if !deps_met(conn, &task.depends_on)? {
            continue;
        }
        if task.use_output_from.as_deref() == Some(completed_task.id.as_str()) {
            let output = completed_task.output.clone().unwrap_or_default();
            task.description = task.description.replace(OUTPUT_MARKER, &output);
        }
        task.status = TaskStatus::Pending;
        conn.execute(
            "UPDATE tasks SET status = 'pending', description = ?2 WHERE id = ?1",
            rusqlite::params![task.id, task.description],
        )?;
        promoted.push(task);
    }
    Ok(promoted)
}

fn cap_output(output: &str) -> String {
    if output.len() <= OUTPUT_CAPTURE_CAP_BYTES {
        return output.to_string();
    }
    let mut end = OUTPUT_CAPTURE_CAP_BYTES;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &output[..end], OUTPUT_TRUNCATED_MARKER)
}

fn insert_task(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        "INSERT INTO tasks (
            id, project, description, priority, status, assigned_to,
            created_at, started_at, completed_at, output, error,
            retry_count, max_retries, metadata, depends_on, use_output_from,
            requires_review, review_prompt, reviewed_by, reviewed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
        rusqlite::params![
            task.id,
            task.project,
            task.description,
            task.priority.as_str(),
            task.status.as_str(),
            task.assigned_to,
            task.created_at.to_rfc3339(),
            task.started_at.map(|t| t.to_rfc3339()),
            task.completed_at.map(|t| t.to_rfc3339()),
            task.output,
            task.error,
            task.retry_count,
            task.max_retries,
            task.metadata.as_ref().map(|m| m.to_string()),
            serde_json::to_string(&task.depends_on)?,
            task.use_output_from,
            task.requires_review,
            task.review_prompt,
            task.reviewed_by,
            task.reviewed_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn get_task(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    Ok(conn
        .query_row("SELECT * FROM tasks WHERE id = ?1", [task_id], row_to_task)
        .optional()?)
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let parse_ts = |t: String| {
        DateTime::parse_from_rfc3339(&t)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    };
    let priority: String = row.get("priority")?;
    let status: String = row.get("status")?;
    let metadata: Option<String> = row.get("metadata")?;
    let depends_on: Option<String> = row.get("depends_on")?;

    Ok(Task {
        id: row.get("id")?,
        project: row.get("project")?,
        description: row.get("description")?,
        priority: priority.parse().unwrap_or(TaskPriority::Normal),
        status: status.parse().unwrap_or(TaskStatus::Pending),
        assigned_to: row.get("assigned_to")?,
        created_at: parse_ts(row.get("created_at")?),
        started_at: row.get::<_, Option<String>>("started_at")?.map(parse_ts),
        completed_at: row.get::<_, Option<String>>("completed_at")?.map(parse_ts),
        output: row.get("output")?,
        error: row.get("error")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        depends_on: depends_on
            .and_then(|d| serde_json::from_str(&d).ok())
            .unwrap_or_default(),
        use_output_from: row.get("use_output_from")?,
        requires_review: row.get("requires_review")?,
        review_prompt: row.get("review_prompt")?,
        reviewed_by: row.get("reviewed_by")?,
        reviewed_at: row.get::<_, Option<String>>("reviewed_at")?.map(parse_ts),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::open_in_memory().unwrap()
    }

    fn simple(project: &str, description: &str, priority: TaskPriority) -> CreateTask {
        CreateTask {
            project: project.to_string(),
            description: description.to_string(),
            priority,
            ..Default::default()
        }
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = store();
        let task = store
            .create(simple("demo", "write hello.txt", TaskPriority::Normal))
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let fetched = store.get(&task.id).unwrap().unwrap();
        assert_eq!(fetched.description, "write hello.txt");
        assert_eq!(fetched.priority, TaskPriority::Normal);
    }

    #[test]
    fn claim_respects_priority_then_age() {
        let store = store();
        let low = store.create(simple("demo", "low", TaskPriority::Low)).unwrap();
        let urgent = store
            .create(simple("demo", "urgent", TaskPriority::Urgent))
            .unwrap();
        let normal = store
            .create(simple("demo", "normal", TaskPriority::Normal))
            .unwrap();

        assert_eq!(store.claim_next("demo").unwrap().unwrap().id, urgent.id);
        assert_eq!(store.claim_next("demo").unwrap().unwrap().id, normal.id);
        assert_eq!(store.claim_next("demo").unwrap().unwrap().id, low.id);
        assert!(store.claim_next("demo").unwrap().is_none());
    }

    #[test]
    fn claim_is_scoped_to_project() {
        let store = store();
        store.create(simple("other", "task", TaskPriority::Urgent)).unwrap();
        assert!(store.claim_next("demo").unwrap().is_none());
    }

    #[test]
    fn claim_stamps_assignment() {
        let store = store();
        store.create(simple("demo", "t", TaskPriority::Normal)).unwrap();
        let claimed = store.claim_next("demo").unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert_eq!(claimed.assigned_to.as_deref(), Some("demo"));
        assert!(claimed.started_at.is_some());
    }

    #[test]
    fn retry_gate_reaches_terminal_failure() {
        let store = store();
        let created = store
            .create(CreateTask {
                project: "demo".to_string(),
                description: "flaky".to_string(),
                max_retries: Some(2),
                ..Default::default()
            })
            .unwrap();

        for expected_retry in 1..=2u32 {
            let claimed = store.claim_next("demo").unwrap().unwrap();
            assert_eq!(claimed.id, created.id);
            let failed = store.fail(&claimed.id, "exit 1").unwrap();
            assert_eq!(failed.status, TaskStatus::Pending);
            assert_eq!(failed.retry_count, expected_retry);
            assert!(failed.assigned_to.is_none());
            assert!(failed.started_at.is_none());
        }

        let claimed = store.claim_next("demo").unwrap().unwrap();
        let task = store.fail(&claimed.id, "Agent exited with code 1").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);
        assert!(task.error.as_deref().unwrap().contains("code 1"));

        // Terminal: no further claims.
        assert!(store.claim_next("demo").unwrap().is_none());
    }

    #[test]
    fn dependency_blocks_until_completion() {
        let store = store();
        let first = store.create(simple("demo", "first", TaskPriority::Normal)).unwrap();
        let second = store
            .create(CreateTask {
                project: "demo".to_string(),
                description: "second".to_string(),
                priority: TaskPriority::Normal,
                depends_on: vec![first.id.clone()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(second.status, TaskStatus::Blocked);

        // The blocked task is not claimable.
        let claimed = store.claim_next("demo").unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert!(store.claim_next("demo").unwrap().is_none());

        let (_, promoted) = store.complete(&first.id, Some("done")).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, second.id);
        assert_eq!(
            store.get(&second.id).unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[test]
    fn output_chain_substitutes_marker() {
        let store = store();
        let first = store.create(simple("demo", "produce", TaskPriority::Normal)).unwrap();
        let chained = store
            .create(CreateTask {
                project: "demo".to_string(),
                description: "use {{output}}".to_string(),
                priority: TaskPriority::Normal,
                use_output_from: Some(first.id.clone()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(chained.status, TaskStatus::Blocked);

        store.claim_next("demo").unwrap();
        store.complete(&first.id, Some("42")).unwrap();

        let chained = store.get(&chained.id).unwrap().unwrap();
        assert_eq!(chained.status, TaskStatus::Pending);
        assert_eq!(chained.description, "use 42");
    }

    #[test]
    fn chain_created_after_completion_substitutes_immediately() {
        let store = store();
        let first = store.create(simple("demo", "produce", TaskPriority::Normal)).unwrap();
        store.claim_next("demo").unwrap();
        store.complete(&first.id, Some("42")).unwrap();

        let chained = store
            .create(CreateTask {
                project: "demo".to_string(),
                description: "use {{output}}".to_string(),
                priority: TaskPriority::Normal,
                use_output_from: Some(first.id.clone()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(chained.status, TaskStatus::Pending);
        assert_eq!(chained.description, "use 42");
    }

    #[test]
    fn cancel_is_rejected_for_terminal_tasks() {
        let store = store();
        let task = store.create(simple("demo", "t", TaskPriority::Normal)).unwrap();
        store.claim_next("demo").unwrap();
        store.complete(&task.id, None).unwrap();

        match store.cancel(&task.id) {
            Err(AdtError::Conflict(_)) => {}
            other => panic!("expected conflict, got {other:?}"),
        }
        match store.cancel("missing") {
            Err(AdtError::NotFound(_)) => {}
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[test]
    fn review_approval_moves_to_pending() {
        let store = store();
        let task = store
            .create(CreateTask {
                project: "demo".to_string(),
                description: "dangerous".to_string(),
                priority: TaskPriority::High,
                requires_review: true,
                review_prompt: Some("check this".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(task.status, TaskStatus::AwaitingReview);
        assert_eq!(store.pending_review().unwrap().len(), 1);

        let reviewed = store
            .review(&task.id, true, "tok1", Some("safer wording"))
            .unwrap();
        assert_eq!(reviewed.status, TaskStatus::Pending);
        assert_eq!(reviewed.description, "safer wording");
        assert_eq!(reviewed.reviewed_by.as_deref(), Some("tok1"));
        assert!(reviewed.reviewed_at.is_some());

        // A second review of the same task conflicts.
        assert!(matches!(
            store.review(&task.id, false, "tok1", None),
            Err(AdtError::Conflict(_))
        ));
    }

    #[test]
    fn review_rejection_cancels() {
        let store = store();
        let task = store
            .create(CreateTask {
                project: "demo".to_string(),
                description: "nope".to_string(),
                requires_review: true,
                ..Default::default()
            })
            .unwrap();
        let reviewed = store.review(&task.id, false, "tok1", None).unwrap();
        assert_eq!(reviewed.status, TaskStatus::Cancelled);
    }

    #[test]
    fn retry_requeues_failed_task() {
        let store = store();
        let task = store
            .create(CreateTask {
                project: "demo".to_string(),
                description: "t".to_string(),
                max_retries: Some(0),
                ..Default::default()
            })
            .unwrap();
        store.claim_next("demo").unwrap();
        let failed = store.fail(&task.id, "boom").unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);

        let retried = store.retry(&task.id).unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert!(retried.error.is_none());

        // In-progress tasks cannot be "retried".
        let running = store.create(simple("demo", "r", TaskPriority::Normal)).unwrap();
        store.claim_next("demo").unwrap();
        assert!(matches!(
            store.retry(&running.id),
            Err(AdtError::Conflict(_))
        ));
    }

    #[test]
    fn stats_count_by_status() {
        let store = store();
        store.create(simple("demo", "a", TaskPriority::Normal)).unwrap();
        store.create(simple("demo", "b", TaskPriority::Normal)).unwrap();
        store.claim_next("demo").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats["pending"], 1);
        assert_eq!(stats["in_progress"], 1);
        assert_eq!(stats["total"], 2);
    }

    #[test]
    fn clear_completed_prunes_old_terminal_tasks() {
        let store = store();
        let old = store.create(simple("demo", "old", TaskPriority::Normal)).unwrap();
        store.claim_next("demo").unwrap();
        store.complete(&old.id, None).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            let last_month = (Utc::now() - chrono::Duration::days(30)).to_rfc3339();
            conn.execute(
                "UPDATE tasks SET completed_at = ?1 WHERE id = ?2",
                rusqlite::params![last_month, old.id],
            )
            .unwrap();
        }
        let fresh = store.create(simple("demo", "fresh", TaskPriority::Normal)).unwrap();

        assert_eq!(store.clear_completed(7).unwrap(), 1);
        assert!(store.get(&old.id).unwrap().is_none());
        assert!(store.get(&fresh.id).unwrap().is_some());
    }

    #[test]
    fn output_is_capped_with_marker() {
        let store = store();
        let task = store.create(simple("demo", "big", TaskPriority::Normal)).unwrap();
        store.claim_next("demo").unwrap();
        let big = "x".repeat(OUTPUT_CAPTURE_CAP_BYTES + 100);
        let (completed, _) = store.complete(&task.id, Some(&big)).unwrap();
        let output = completed.output.unwrap();
        assert!(output.len() < big.len());
        assert!(output.ends_with(OUTPUT_TRUNCATED_MARKER));
    }
}
