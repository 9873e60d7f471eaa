//! Durable storage: the task table and the run/event history log.

mod history;
mod tasks;

pub use history::{EventRecord, HistoryStore};
pub use tasks::{CreateTask, TaskFilter, TaskStore};
