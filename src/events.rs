//! In-process event bus with bounded history.
//!
//! Components publish typed events; WebSocket sessions and the orchestrator
//! subscribe through broadcast receivers. Slow subscribers lag rather than
//! block publishers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::constants::EVENT_HISTORY_SIZE;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    #[serde(rename = "agent.spawned")]
    AgentSpawned,
    #[serde(rename = "agent.stopped")]
    AgentStopped,
    #[serde(rename = "agent.status")]
    AgentStatus,
    #[serde(rename = "agent.output")]
    AgentOutput,
    #[serde(rename = "agent.error")]
    AgentError,
    #[serde(rename = "agent.stuck")]
    AgentStuck,
    /// Internal completion signal from the supervisor to the orchestrator,
    /// carrying `exit_code` and the captured output.
    #[serde(rename = "agent.task_complete")]
    AgentTaskComplete,
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.assigned")]
    TaskAssigned,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.blocked")]
    TaskBlocked,
    #[serde(rename = "process.started")]
    ProcessStarted,
    #[serde(rename = "process.stopped")]
    ProcessStopped,
    #[serde(rename = "process.exited")]
    ProcessExited,
    #[serde(rename = "server.started")]
    ServerStarted,
    #[serde(rename = "server.stopped")]
    ServerStopped,
    #[serde(rename = "escalation")]
    Escalation,
    #[serde(rename = "notification")]
    Notification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, project: Option<String>, data: serde_json::Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            project,
            data,
        }
    }
}

pub struct EventBus {
    sender: broadcast::Sender<Event>,
    history: Mutex<VecDeque<Event>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(EVENT_HISTORY_SIZE)),
        }
    }

    /// Subscribe to the full event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event: record it in history, then fan it out.
    pub fn publish(&self, event: Event) {
        {
            let mut history = self.history.lock().unwrap();
            if history.len() >= EVENT_HISTORY_SIZE {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // Send errors only mean "no subscribers right now".
        let _ = self.sender.send(event);
    }

    /// Build and publish an event in one call.
    pub fn emit(&self, event_type: EventType, project: Option<&str>, data: serde_json::Value) {
        self.publish(Event::new(
            event_type,
            project.map(str::to_string),
            data,
        ));
    }

    /// Most recent events, optionally filtered by type.
    pub fn history(&self, limit: usize, event_type: Option<EventType>) -> Vec<Event> {
        let history = self.history.lock().unwrap();
        let filtered: Vec<Event> = history
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(EventType::TaskCreated, Some("demo"), json!({"task_id": "t1"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::TaskCreated);
        assert_eq!(event.project.as_deref(), Some("demo"));
        assert_eq!(event.data["task_id"], "t1");
    }

    #[test]
    fn history_is_bounded() {
        let bus = EventBus::new();
        for i in 0..(EVENT_HISTORY_SIZE + 20) {
            bus.emit(EventType::Notification, None, json!({"i": i}));
        }
        let history = bus.history(usize::MAX, None);
        assert_eq!(history.len(), EVENT_HISTORY_SIZE);
        // Oldest entries were evicted.
        assert_eq!(history[0].data["i"], 20);
    }

    #[test]
    fn history_filters_by_type() {
        let bus = EventBus::new();
        bus.emit(EventType::TaskCreated, None, json!({}));
        bus.emit(EventType::AgentSpawned, None, json!({}));
        bus.emit(EventType::TaskCreated, None, json!({}));

        let tasks = bus.history(10, Some(EventType::TaskCreated));
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn event_serializes_with_dotted_type() {
        let event = Event::new(EventType::AgentSpawned, Some("demo".into()), json!({}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "agent.spawned");
    }
}
