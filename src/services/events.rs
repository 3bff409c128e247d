//! Event bus - best-effort fan-out of health, state-change and alert signals.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};

use crate::errors::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateChanged,
    HealthChanged,
    ErrorOccurred,
    AlertCreated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
    pub priority: EventPriority,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            priority: EventPriority::Normal,
            timestamp: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// `payload["event"]` when present (e.g. "initialized", "orphaned").
    pub fn name(&self) -> Option<&str> {
        self.payload.get("event").and_then(Value::as_str)
    }
}

/// Async publish interface.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn emit(&self, event: Event) -> Result<(), ServiceError>;
}

/// In-process bus based on tokio broadcast channels, with an optional bounded
/// history for inspection.
pub struct BroadcastEventBus {
    tx: broadcast::Sender<Event>,
    history: Mutex<VecDeque<Event>>,
    history_limit: usize,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            history: Mutex::new(VecDeque::new()),
            history_limit: 0,
        }
    }

    /// Keep the last `limit` events.
    pub fn with_history(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub async fn history(&self) -> Vec<Event> {
        self.history.lock().await.iter().cloned().collect()
    }

    pub async fn events_of(&self, kind: EventKind) -> Vec<Event> {
        self.history
            .lock()
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Recorded events whose payload `event` field equals `name`.
    pub async fn events_named(&self, name: &str) -> Vec<Event> {
        self.history
            .lock()
            .await
            .iter()
            .filter(|e| e.name() == Some(name))
            .cloned()
            .collect()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024).with_history(1024)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn emit(&self, event: Event) -> Result<(), ServiceError> {
        if self.history_limit > 0 {
            let mut history = self.history.lock().await;
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // No receivers is not an error.
        let _ = self.tx.send(event);
        Ok(())
    }
}
