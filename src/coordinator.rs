//! `PhaseCoordinator` - the public face of the engine.
//!
//! Owns one of each component, wired to a shared type registry and a shared
//! set of services, and adds custom type registration on top.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::breaker::{BreakerSnapshot, CircuitBreakerConfig, CircuitBreakerManager};
use crate::checkpoint::{CheckpointManager, CheckpointRecord};
use crate::config::CoordinatorConfig;
use crate::errors::CoordinatorError;
use crate::lifecycle::{LifecycleManager, PhaseBody, PhaseInfo, TransitionHandler};
use crate::monitor::{HealthReport, PhaseMonitor, SweepReport};
use crate::nested::{ExecutionSummary, NestedExecutionCoordinator, NestedRequest};
use crate::phase::{BuiltinPhase, CustomPhaseType, PhaseContext, PhaseOutcome, PhaseSpec, PhaseStatus};
use crate::registry::{Registration, TypeRegistry};
use crate::services::{EventKind, EventPriority, InMemoryServices, Services};

/// Whether a listed type is built in or registered at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TypeOrigin {
    #[serde(rename = "built-in")]
    BuiltIn,
    #[serde(rename = "custom")]
    Custom,
}

/// One entry of [`RegisteredTypes::phase_types`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseTypeInfo {
    pub key: String,
    pub origin: TypeOrigin,
    pub description: String,
    pub parent_type: Option<String>,
    /// Ancestors nearest first; empty for built-ins
    pub parent_chain: Vec<String>,
    pub registered_at: Option<DateTime<Utc>>,
    pub custom_config: Option<Value>,
    pub circuit_breaker_config: Option<CircuitBreakerConfig>,
    pub circuit_open: bool,
    /// Non-terminal phases of this type
    pub active_phases: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredTypes {
    pub phase_types: BTreeMap<String, PhaseTypeInfo>,
    /// `parent type -> custom types declaring it`, children sorted
    pub inheritance_map: BTreeMap<String, Vec<String>>,
    pub builtin_count: usize,
    pub custom_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl RegisteredTypes {
    pub fn total(&self) -> usize {
        self.builtin_count + self.custom_count
    }

    pub fn custom(&self) -> impl Iterator<Item = &PhaseTypeInfo> {
        self.phase_types
            .values()
            .filter(|info| info.origin == TypeOrigin::Custom)
    }
}

/// Registry summary plus nested execution counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorInfo {
    #[serde(flatten)]
    pub phases: PhaseInfo,
    pub nested_executions: ExecutionSummary,
}

#[derive(Clone)]
pub struct PhaseCoordinator {
    config: Arc<CoordinatorConfig>,
    services: Services,
    types: TypeRegistry,
    breakers: Arc<CircuitBreakerManager>,
    lifecycle: LifecycleManager,
    nested: NestedExecutionCoordinator,
    monitor: PhaseMonitor,
    checkpoints: CheckpointManager,
}

impl PhaseCoordinator {
    pub fn new(config: CoordinatorConfig, services: Services) -> Self {
        let types = TypeRegistry::new();
        let breakers = Arc::new(CircuitBreakerManager::new(
            &config,
            types.clone(),
            services.clone(),
        ));
        let lifecycle = LifecycleManager::new(types.clone(), breakers.clone(), services.clone());
        let nested = NestedExecutionCoordinator::new(lifecycle.clone(), config.nested.clone());
        let monitor = PhaseMonitor::new(lifecycle.clone(), nested.clone(), config.monitor.clone());
        let checkpoints = CheckpointManager::new(lifecycle.clone());

        Self {
            config: Arc::new(config),
            services,
            types,
            breakers,
            lifecycle,
            nested,
            monitor,
            checkpoints,
        }
    }

    /// Coordinator over fresh in-memory services. The typed handles are
    /// returned for inspection.
    pub fn in_memory(config: CoordinatorConfig) -> (Self, InMemoryServices) {
        let mem = InMemoryServices::new();
        (Self::new(config, mem.services()), mem)
    }

    /// Build from `<dir>/phasewright.toml` (defaults when absent).
    pub fn from_dir(dir: &Path, services: Services) -> Result<Self> {
        let config = CoordinatorConfig::load_or_default(dir)?;
        for warning in config.validate() {
            warn!(warning = %warning, "configuration warning");
        }
        Ok(Self::new(config, services))
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn nested(&self) -> &NestedExecutionCoordinator {
        &self.nested
    }

    pub fn monitor(&self) -> &PhaseMonitor {
        &self.monitor
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    // =========================================
    // Lifecycle
    // =========================================

    pub async fn register_body(&self, type_key: &str, body: Arc<dyn PhaseBody>) {
        self.lifecycle.register_body(type_key, body).await;
    }

    pub async fn register_handler(&self, phase_id: &str, handler: Arc<dyn TransitionHandler>) {
        self.lifecycle.register_handler(phase_id, handler).await;
    }

    pub async fn register_named_handler(&self, name: &str, handler: Arc<dyn TransitionHandler>) {
        self.lifecycle.register_named_handler(name, handler).await;
    }

    pub async fn initialize_phase(&self, spec: PhaseSpec) -> Result<PhaseContext, CoordinatorError> {
        self.lifecycle.initialize(spec).await
    }

    pub async fn start_phase(&self, id: &str, input: Value) -> Result<PhaseOutcome, CoordinatorError> {
        self.lifecycle.start(id, input).await
    }

    pub async fn pause_phase(&self, id: &str, reason: &str) -> Result<PhaseContext, CoordinatorError> {
        self.lifecycle.pause(id, reason).await
    }

    pub async fn resume_phase(&self, id: &str) -> Result<PhaseContext, CoordinatorError> {
        self.lifecycle.resume(id).await
    }

    pub async fn abort_phase(&self, id: &str, reason: &str) -> Result<PhaseContext, CoordinatorError> {
        self.lifecycle.abort(id, reason).await
    }

    pub async fn phase_status(&self, id: &str) -> Result<PhaseStatus, CoordinatorError> {
        self.lifecycle.status(id).await
    }

    pub async fn coordinate_nested(&self, request: NestedRequest) -> Result<Value, CoordinatorError> {
        self.nested.coordinate(request).await
    }

    // =========================================
    // Custom phase types
    // =========================================

    /// Register (or update) a custom phase type and create its breaker.
    pub async fn register_custom_type(
        &self,
        id: &str,
        description: &str,
        parent_type: Option<&str>,
        config: Value,
    ) -> Result<CustomPhaseType, CoordinatorError> {
        let registration = self
            .types
            .register(id, description, parent_type, config)
            .await
            .inspect_err(|e| warn!(phase_type = %id, error = %e, "custom phase type rejected"))?;

        if let Registration::Updated(_) = &registration {
            warn!(phase_type = %id, "phase type already registered, updating");
        }
        let custom = registration.phase_type().clone();
        self.breakers.ensure_breaker(&custom.id).await;

        info!(
            phase_type = %custom.id,
            parent_type = custom.parent_type.as_deref().unwrap_or("-"),
            "registered custom phase type"
        );
        self.services
            .emit(
                EventKind::StateChanged,
                json!({
                    "event": "registered",
                    "resource_id": format!("phase_type:{}", custom.id),
                    "state": "registered",
                    "description": custom.description,
                    "parent_type": custom.parent_type,
                    "timestamp": custom.registered_at.to_rfc3339(),
                }),
                EventPriority::Normal,
            )
            .await;
        Ok(custom)
    }

    /// Remove a custom type. Refused while any registered phase, finished
    /// or not, has this type.
    pub async fn unregister_custom_type(&self, id: &str) -> Result<CustomPhaseType, CoordinatorError> {
        let removed = self.lifecycle.unregister_type(id).await.inspect_err(|e| {
            if let CoordinatorError::TypeInUse { phase_id, .. } = e {
                warn!(phase_type = %id, phase_id = %phase_id, "cannot unregister phase type in use");
            }
        })?;
        self.breakers.remove(id).await;

        info!(phase_type = %id, "unregistered custom phase type");
        self.services
            .emit(
                EventKind::StateChanged,
                json!({
                    "event": "unregistered",
                    "resource_id": format!("phase_type:{}", id),
                    "state": "unregistered",
                    "timestamp": Utc::now().to_rfc3339(),
                }),
                EventPriority::Normal,
            )
            .await;
        Ok(removed)
    }

    /// Every built-in and custom type with its breaker and usage.
    pub async fn registered_types(&self) -> RegisteredTypes {
        let contexts = self.lifecycle.contexts().await;
        let open = self.breakers.open_breakers().await;
        let active_of = |key: &str| {
            contexts
                .iter()
                .filter(|ctx| ctx.type_key() == key && !ctx.state.is_terminal())
                .count()
        };

        let mut phase_types = BTreeMap::new();
        for kind in BuiltinPhase::ALL {
            let key = kind.as_str();
            phase_types.insert(
                key.to_string(),
                PhaseTypeInfo {
                    key: key.to_string(),
                    origin: TypeOrigin::BuiltIn,
                    description: format!("Built-in {} phase type", key),
                    parent_type: None,
                    parent_chain: Vec::new(),
                    registered_at: None,
                    custom_config: None,
                    circuit_breaker_config: self.breakers.config_for(key).await,
                    circuit_open: open.iter().any(|k| k == key),
                    active_phases: active_of(key),
                },
            );
        }

        let chains = self.types.inheritance_map().await;
        let mut inheritance_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let customs = self.types.list().await;
        let custom_count = customs.len();
        for custom in customs {
            if let Some(parent) = &custom.parent_type {
                inheritance_map
                    .entry(parent.clone())
                    .or_default()
                    .push(custom.id.clone());
            }
            phase_types.insert(
                custom.id.clone(),
                PhaseTypeInfo {
                    key: custom.id.clone(),
                    origin: TypeOrigin::Custom,
                    parent_chain: chains.get(&custom.id).cloned().unwrap_or_default(),
                    circuit_breaker_config: self.breakers.config_for(&custom.id).await,
                    circuit_open: open.iter().any(|k| *k == custom.id),
                    active_phases: active_of(&custom.id),
                    description: custom.description,
                    parent_type: custom.parent_type,
                    registered_at: Some(custom.registered_at),
                    custom_config: Some(custom.config),
                },
            );
        }
        for children in inheritance_map.values_mut() {
            children.sort();
        }

        RegisteredTypes {
            phase_types,
            inheritance_map,
            builtin_count: BuiltinPhase::ALL.len(),
            custom_count,
            timestamp: Utc::now(),
        }
    }

    // =========================================
    // Breakers, health, monitoring
    // =========================================

    pub async fn update_breaker_config(
        &self,
        key: &str,
        config: CircuitBreakerConfig,
    ) -> Result<(), CoordinatorError> {
        self.breakers.update_config(key, config).await
    }

    pub async fn breaker_snapshot(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshot().await
    }

    pub async fn health(&self) -> HealthReport {
        self.monitor.health().await
    }

    pub async fn current_phase_info(&self) -> CoordinatorInfo {
        CoordinatorInfo {
            phases: self.lifecycle.current_phase_info().await,
            nested_executions: self.nested.summary().await,
        }
    }

    /// Run one watchdog sweep now.
    pub async fn sweep(&self) -> SweepReport {
        self.monitor.sweep().await
    }

    /// Load persisted breaker configs and start the watchdog.
    pub async fn start(&self) -> bool {
        let loaded = self.breakers.load_configs().await;
        if loaded > 0 {
            info!(count = loaded, "loaded persisted circuit breaker configs");
        }
        self.monitor.start().await
    }

    /// Stop the watchdog and persist breaker configs.
    pub async fn stop(&self) -> bool {
        let stopped = self.monitor.stop().await;
        if !self.breakers.save_configs().await {
            warn!("circuit breaker configs not persisted on shutdown");
        }
        stopped
    }

    // =========================================
    // Checkpoints
    // =========================================

    pub async fn create_checkpoint(&self, phase_id: &str) -> Result<String, CoordinatorError> {
        self.checkpoints.create(phase_id).await
    }

    pub async fn checkpoint(&self, checkpoint_id: &str) -> Result<CheckpointRecord, CoordinatorError> {
        self.checkpoints.record(checkpoint_id).await
    }

    pub async fn restore_checkpoint(&self, checkpoint_id: &str) -> Result<PhaseContext, CoordinatorError> {
        self.checkpoints.restore(checkpoint_id).await
    }

    pub async fn rollback_to_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Result<PhaseContext, CoordinatorError> {
        self.checkpoints.rollback(checkpoint_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BREAKER_CONFIG_KEY;
    use crate::errors::BodyError;
    use crate::lifecycle::FnBody;
    use crate::monitor::HealthStatus;
    use crate::phase::PhaseState;
    use tempfile::TempDir;

    fn coordinator() -> (PhaseCoordinator, InMemoryServices) {
        PhaseCoordinator::in_memory(CoordinatorConfig::default())
    }

    #[tokio::test]
    async fn test_register_custom_type_emits_event() {
        let (coord, mem) = coordinator();
        let custom = coord
            .register_custom_type("phase_custom_eval", "Evaluation", Some("phase_two"), json!({"k": 1}))
            .await
            .unwrap();
        assert_eq!(custom.parent_type.as_deref(), Some("phase_two"));
        assert!(coord.breakers().config_for("phase_custom_eval").await.is_some());

        let events = mem.events.events_named("registered").await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["resource_id"], "phase_type:phase_custom_eval");
        assert_eq!(events[0].payload["parent_type"], "phase_two");
    }

    #[tokio::test]
    async fn test_register_rejects_bad_ids() {
        let (coord, _) = coordinator();
        let err = coord
            .register_custom_type("custom_eval", "", None, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidPhaseType { .. }));

        let err = coord
            .register_custom_type("phase_one", "", None, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidPhaseType { .. }));

        let err = coord
            .register_custom_type("phase_orphan", "", Some("phase_missing"), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidPhaseType { .. }));
    }

    #[tokio::test]
    async fn test_reregistering_updates_in_place() {
        let (coord, _) = coordinator();
        coord
            .register_custom_type("phase_x", "first", None, Value::Null)
            .await
            .unwrap();
        coord
            .register_custom_type("phase_x", "second", Some("phase_one"), Value::Null)
            .await
            .unwrap();
        let listed = coord.registered_types().await;
        assert_eq!(listed.custom_count, 1);
        assert_eq!(listed.phase_types["phase_x"].description, "second");
    }

    #[tokio::test]
    async fn test_unregister_refused_while_in_use() {
        let (coord, mem) = coordinator();
        coord
            .register_custom_type("phase_x", "x", None, Value::Null)
            .await
            .unwrap();
        coord
            .initialize_phase(PhaseSpec::new("p1", "phase_x"))
            .await
            .unwrap();

        let err = coord.unregister_custom_type("phase_x").await.unwrap_err();
        match err {
            CoordinatorError::TypeInUse { phase_id, .. } => assert_eq!(phase_id, "p1"),
            other => panic!("unexpected error: {other}"),
        }

        // Finished phases stay registered, so the type stays in use.
        coord.start_phase("p1", json!({})).await.unwrap();
        assert_eq!(coord.phase_status("p1").await.unwrap().state, PhaseState::Completed);
        let err = coord.unregister_custom_type("phase_x").await.unwrap_err();
        assert_eq!(err.status_token(), "type_in_use");
        assert!(coord.breakers().config_for("phase_x").await.is_some());
        assert!(mem.events.events_named("unregistered").await.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_unused_type() {
        let (coord, mem) = coordinator();
        coord
            .register_custom_type("phase_x", "x", None, Value::Null)
            .await
            .unwrap();
        let removed = coord.unregister_custom_type("phase_x").await.unwrap();
        assert_eq!(removed.id, "phase_x");
        assert!(coord.breakers().config_for("phase_x").await.is_none());
        assert_eq!(mem.events.events_named("unregistered").await.len(), 1);

        let err = coord.unregister_custom_type("phase_x").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownPhaseType { .. }));
        let err = coord
            .initialize_phase(PhaseSpec::new("p1", "phase_x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownPhaseType { .. }));
    }

    #[tokio::test]
    async fn test_registered_types_listing() {
        let (coord, _) = coordinator();
        coord
            .register_custom_type("phase_base", "base", Some("phase_two"), Value::Null)
            .await
            .unwrap();
        coord
            .register_custom_type("phase_leaf", "leaf", Some("phase_base"), Value::Null)
            .await
            .unwrap();
        coord
            .initialize_phase(PhaseSpec::new("p1", "phase_leaf"))
            .await
            .unwrap();

        let listed = coord.registered_types().await;
        assert_eq!(listed.builtin_count, 5);
        assert_eq!(listed.custom_count, 2);
        assert_eq!(listed.total(), 7);
        assert_eq!(listed.custom().count(), 2);

        let one = &listed.phase_types["phase_one"];
        assert_eq!(one.origin, TypeOrigin::BuiltIn);
        assert_eq!(one.description, "Built-in phase_one phase type");
        assert!(one.circuit_breaker_config.is_some());

        let leaf = &listed.phase_types["phase_leaf"];
        assert_eq!(leaf.origin, TypeOrigin::Custom);
        assert_eq!(leaf.parent_chain, vec!["phase_base", "phase_two"]);
        assert_eq!(leaf.active_phases, 1);
        assert!(!leaf.circuit_open);

        assert_eq!(listed.inheritance_map["phase_two"], vec!["phase_base"]);
        assert_eq!(listed.inheritance_map["phase_base"], vec!["phase_leaf"]);

        let json = serde_json::to_value(&listed).unwrap();
        assert_eq!(json["phase_types"]["phase_zero"]["origin"], "built-in");
    }

    #[tokio::test]
    async fn test_current_phase_info_includes_nested_counts() {
        let (coord, _) = coordinator();
        coord
            .initialize_phase(PhaseSpec::new("p1", "phase_one"))
            .await
            .unwrap();
        coord
            .initialize_phase(PhaseSpec::new("c1", "phase_two").with_parent("p1"))
            .await
            .unwrap();
        coord
            .coordinate_nested(NestedRequest::new("p1", "c1", json!({"x": 1})))
            .await
            .unwrap();

        let info = coord.current_phase_info().await;
        assert_eq!(info.phases.total_phases, 2);
        assert_eq!(info.nested_executions.total, 1);
        assert_eq!(info.nested_executions.completed, 1);
    }

    #[tokio::test]
    async fn test_update_breaker_config_persists() {
        let (coord, mem) = coordinator();
        coord
            .update_breaker_config("phase_one", CircuitBreakerConfig::new(1, 30, 60))
            .await
            .unwrap();
        let stored = mem.store.entry(BREAKER_CONFIG_KEY).await.unwrap();
        assert_eq!(stored.value["phase_one"]["failure_threshold"], 1);

        let err = coord
            .update_breaker_config("phase_nope", CircuitBreakerConfig::new(1, 30, 60))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownPhaseType { .. }));
    }

    #[tokio::test]
    async fn test_start_and_stop_monitoring() {
        let (coord, _) = coordinator();
        assert!(coord.start().await);
        assert!(!coord.start().await);
        assert!(coord.monitor().is_running().await);
        assert!(coord.stop().await);
        assert!(!coord.stop().await);
    }

    #[tokio::test]
    async fn test_health_reports_failed_phases() {
        let (coord, _) = coordinator();
        assert!(coord.health().await.is_healthy());

        coord
            .initialize_phase(PhaseSpec::new("p1", "phase_one"))
            .await
            .unwrap();
        coord
            .register_body(
                "phase_one",
                Arc::new(FnBody::new(|_ctx: PhaseContext, _input: Value| async {
                    Err(BodyError::new("runtime", "boom"))
                })),
            )
            .await;
        let outcome = coord.start_phase("p1", json!({})).await.unwrap();
        assert!(outcome.is_failure());
        let status = coord.phase_status("p1").await.unwrap();
        assert_eq!(status.state, PhaseState::Failed);

        let report = coord.health().await;
        assert_eq!(report.status, HealthStatus::Critical);
        assert!(report.description.contains("1 phases in FAILED state"));
    }

    #[tokio::test]
    async fn test_checkpoint_pass_through() {
        let (coord, _) = coordinator();
        coord
            .initialize_phase(PhaseSpec::new("p1", "phase_one"))
            .await
            .unwrap();
        let id = coord.create_checkpoint("p1").await.unwrap();
        coord.start_phase("p1", json!({})).await.unwrap();

        let restored = coord.restore_checkpoint(&id).await.unwrap();
        assert_eq!(restored.state, PhaseState::Ready);
        assert_eq!(coord.phase_status("p1").await.unwrap().state, PhaseState::Completed);

        coord.rollback_to_checkpoint(&id).await.unwrap();
        assert_eq!(coord.phase_status("p1").await.unwrap().state, PhaseState::Ready);
        assert_eq!(coord.checkpoint(&id).await.unwrap().phase_id, "p1");
    }

    #[test]
    fn test_from_dir_reads_config_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("phasewright.toml"),
            "[monitor]\ninterval_secs = 5\n",
        )
        .unwrap();
        let mem = InMemoryServices::new();
        let coord = PhaseCoordinator::from_dir(dir.path(), mem.services()).unwrap();
        assert_eq!(coord.config().monitor.interval_secs, 5);

        let empty = TempDir::new().unwrap();
        let coord = PhaseCoordinator::from_dir(empty.path(), mem.services()).unwrap();
        assert_eq!(coord.config(), &CoordinatorConfig::default());
    }
}
