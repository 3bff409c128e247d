//! External collaborators: state store, event bus and metrics recorder.
//!
//! The engine only talks to the traits. `Services` bundles one of each and
//! wraps every call so that a failing collaborator is logged and swallowed;
//! persistence and observability failures never change a phase outcome.

pub mod events;
pub mod metrics;
pub mod store;

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

pub use events::{BroadcastEventBus, Event, EventBus, EventKind, EventPriority};
pub use metrics::{InMemoryMetrics, MetricSample, MetricsRecorder};
pub use store::{FileStateStore, MemoryStateStore, StateKind, StateStore, StoredEntry};

#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn StateStore>,
    pub events: Arc<dyn EventBus>,
    pub metrics: Arc<dyn MetricsRecorder>,
}

impl Services {
    pub fn new(
        store: Arc<dyn StateStore>,
        events: Arc<dyn EventBus>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            store,
            events,
            metrics,
        }
    }

    /// Write `value` under `key`. Returns whether the write succeeded.
    pub async fn persist(
        &self,
        key: &str,
        value: Value,
        kind: StateKind,
        metadata: Option<Value>,
    ) -> bool {
        match self.store.set_state(key, value, kind, metadata).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "state store write failed");
                false
            }
        }
    }

    /// Read `key`, treating store errors as absence.
    pub async fn load(&self, key: &str) -> Option<Value> {
        match self.store.get_state(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "state store read failed");
                None
            }
        }
    }

    pub async fn emit(&self, kind: EventKind, payload: Value, priority: EventPriority) {
        let event = Event::new(kind, payload).with_priority(priority);
        if let Err(e) = self.events.emit(event).await {
            warn!(kind = ?kind, error = %e, "event emission failed");
        }
    }

    pub async fn metric(&self, name: &str, value: f64, metadata: Option<Value>) {
        if let Err(e) = self.metrics.record_metric(name, value, metadata).await {
            warn!(metric = %name, error = %e, "metric recording failed");
        }
    }
}

/// In-memory services with typed handles kept for inspection.
#[derive(Clone)]
pub struct InMemoryServices {
    pub store: Arc<MemoryStateStore>,
    pub events: Arc<BroadcastEventBus>,
    pub metrics: Arc<InMemoryMetrics>,
}

impl InMemoryServices {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStateStore::new()),
            events: Arc::new(BroadcastEventBus::default()),
            metrics: Arc::new(InMemoryMetrics::new()),
        }
    }

    pub fn services(&self) -> Services {
        Services::new(
            self.store.clone(),
            self.events.clone(),
            self.metrics.clone(),
        )
    }
}

impl Default for InMemoryServices {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServiceError;
    use async_trait::async_trait;
    use serde_json::json;

    struct BrokenStore;

    #[async_trait]
    impl StateStore for BrokenStore {
        async fn set_state(
            &self,
            _key: &str,
            _value: Value,
            _kind: StateKind,
            _metadata: Option<Value>,
        ) -> Result<(), ServiceError> {
            Err(ServiceError::Store("disk unavailable".into()))
        }

        async fn get_state(&self, _key: &str) -> Result<Option<Value>, ServiceError> {
            Err(ServiceError::Store("disk unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failures_are_absorbed() {
        let mem = InMemoryServices::new();
        let services = Services::new(
            Arc::new(BrokenStore),
            mem.events.clone(),
            mem.metrics.clone(),
        );

        assert!(!services.persist("k", json!(1), StateKind::State, None).await);
        assert!(services.load("k").await.is_none());
    }

    #[tokio::test]
    async fn test_in_memory_services_share_handles() {
        let mem = InMemoryServices::new();
        let services = mem.services();

        assert!(services.persist("k", json!(1), StateKind::State, None).await);
        services
            .emit(EventKind::StateChanged, json!({"event": "x"}), EventPriority::Low)
            .await;
        services.metric("m", 2.0, None).await;

        assert_eq!(services.load("k").await, Some(json!(1)));
        assert_eq!(mem.events.events_named("x").await.len(), 1);
        assert_eq!(mem.metrics.values("m").await, vec![2.0]);
    }
}
