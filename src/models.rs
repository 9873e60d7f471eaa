use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::DEFAULT_MAX_RETRIES;

/// A unit of work: one task yields one agent invocation on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project: String,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub assigned_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Agent stdout+stderr, scrubbed and capped.
    pub output: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub metadata: Option<serde_json::Value>,
    /// Task ids that must be completed before this one becomes claimable.
    pub depends_on: Vec<String>,
    /// Completed task whose output replaces `{{output}}` in the description.
    pub use_output_from: Option<String>,
    pub requires_review: bool,
    pub review_prompt: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Closed set of task states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    /// Dependencies not yet all completed.
    Blocked,
    /// Paused for human approval before it may run.
    AwaitingReview,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Blocked => "blocked",
            TaskStatus::AwaitingReview => "awaiting_review",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "blocked" => Ok(TaskStatus::Blocked),
            "awaiting_review" => Ok(TaskStatus::AwaitingReview),
            _ => Err(format!("Unknown task status: {s}")),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority; urgent sorts first in claim order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    /// Claim-order key: lower sorts earlier.
    pub fn sort_key(&self) -> i64 {
        match self {
            TaskPriority::Urgent => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Urgent => "urgent",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
        }
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "urgent" => Ok(TaskPriority::Urgent),
            "high" => Ok(TaskPriority::High),
            "normal" => Ok(TaskPriority::Normal),
            "low" => Ok(TaskPriority::Low),
            _ => Err(format!("Unknown priority: {s}")),
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered project, read from the external registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One recorded agent invocation (history, not live state).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: Option<i64>,
    pub project: String,
    pub provider: Option<String>,
    pub task: Option<String>,
    pub task_id: Option<String>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub status: AgentRunStatus,
    pub error: Option<String>,
    pub log_file: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl AgentRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRunStatus::Running => "running",
            AgentRunStatus::Completed => "completed",
            AgentRunStatus::Failed => "failed",
            AgentRunStatus::Stopped => "stopped",
        }
    }
}

impl FromStr for AgentRunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(AgentRunStatus::Running),
            "completed" => Ok(AgentRunStatus::Completed),
            "failed" => Ok(AgentRunStatus::Failed),
            "stopped" => Ok(AgentRunStatus::Stopped),
            _ => Err(format!("Unknown run status: {s}")),
        }
    }
}

/// Generate a short, collision-resistant id for the active task set.
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Construct a new task record with defaults applied.
#[allow(clippy::too_many_arguments)]
pub fn new_task(
    project: String,
    description: String,
    priority: TaskPriority,
    metadata: Option<serde_json::Value>,
    depends_on: Vec<String>,
    use_output_from: Option<String>,
    requires_review: bool,
    review_prompt: Option<String>,
) -> Task {
    Task {
        id: short_id(),
        project,
        description,
        priority,
        status: TaskStatus::Pending,
        assigned_to: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        output: None,
        error: None,
        retry_count: 0,
        max_retries: DEFAULT_MAX_RETRIES,
        metadata,
        depends_on,
        use_output_from,
        requires_review,
        review_prompt,
        reviewed_by: None,
        reviewed_at: None,
    }
}
