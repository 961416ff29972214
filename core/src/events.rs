//! Process-wide event bus.
//!
//! The bus is the only runtime component shared between service calls. It
//! holds a subscriber list and fans events out synchronously; a panicking
//! listener is swallowed so one bad subscriber cannot poison the rest.
//! Services buffer events during a transaction and flush them through
//! [`EventBus::emit_all`] only after the commit succeeds.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::RwLock;

use serde_json::Value;

/// Event types emitted by the services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    WorkflowStatus,
    TaskUpdated,
    AgentHeartbeat,
    AgentRegistered,
    AgentUnregistered,
    MessageNew,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::WorkflowStatus => "workflow:status",
            EventType::TaskUpdated => "task:updated",
            EventType::AgentHeartbeat => "agent:heartbeat",
            EventType::AgentRegistered => "agent:registered",
            EventType::AgentUnregistered => "agent:unregistered",
            EventType::MessageNew => "message:new",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single emitted event with its JSON payload
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub data: Value,
}

impl Event {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self { event_type, data }
    }

    /// Channels this event belongs to, derived from the payload.
    ///
    /// Every event lands on `global`; payloads carrying a `workflow_id` or
    /// `agent_id` additionally land on `workflow:<id>` / `agent:<id>`.
    pub fn channels(&self) -> Vec<String> {
        let mut channels = vec!["global".to_string()];
        if let Some(id) = self.data.get("workflow_id").and_then(Value::as_str) {
            channels.push(format!("workflow:{id}"));
        }
        if let Some(id) = self.data.get("agent_id").and_then(Value::as_str) {
            channels.push(format!("agent:{id}"));
        }
        channels
    }
}

type Subscriber = Box<dyn Fn(&Event) + Send + Sync>;

/// Subscriber registry with synchronous, best-effort fan-out
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for all events. Listeners must not block for long;
    /// the bus does not buffer.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.push(Box::new(listener));
    }

    /// Deliver one event to every subscriber, swallowing listener panics
    pub fn emit(&self, event: Event) {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for subscriber in subscribers.iter() {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&event))).is_err() {
                tracing::warn!(event_type = %event.event_type, "event subscriber panicked");
            }
        }
    }

    /// Flush a per-transaction buffer after a successful commit
    pub fn emit_all(&self, events: Vec<Event>) {
        for event in events {
            self.emit(event);
        }
    }
}
