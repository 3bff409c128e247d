//! Checkpoints: immutable snapshots of a phase context, restore and rollback.
//!
//! A rollback splices the snapshot back into the live registry under the
//! lifecycle lock, together with the hierarchy, dependency and active
//! indices.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, json};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::CoordinatorError;
use crate::lifecycle::LifecycleManager;
use crate::phase::{PhaseContext, PhaseType};
use crate::services::{EventKind, EventPriority, StateKind};

/// State store key of a checkpoint record.
pub fn checkpoint_key(checkpoint_id: &str) -> String {
    format!("phase_checkpoint:{}", checkpoint_id)
}

/// Self-describing snapshot of one context, custom type metadata included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub checkpoint_id: String,
    pub phase_id: String,
    pub created_at: DateTime<Utc>,
    pub context: PhaseContext,
}

#[derive(Clone)]
pub struct CheckpointManager {
    lifecycle: LifecycleManager,
    records: Arc<RwLock<HashMap<String, CheckpointRecord>>>,
}

impl CheckpointManager {
    pub fn new(lifecycle: LifecycleManager) -> Self {
        Self {
            lifecycle,
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Snapshot a live phase and return the checkpoint id.
    ///
    /// The id is appended to the phase's checkpoint list before the snapshot
    /// is taken, so the snapshot lists itself.
    pub async fn create(&self, phase_id: &str) -> Result<String, CoordinatorError> {
        let now = Utc::now();
        let short = Uuid::new_v4().simple().to_string();
        let checkpoint_id = format!(
            "checkpoint_{}_{}_{}",
            phase_id,
            now.timestamp(),
            &short[..8]
        );

        let snapshot = {
            let mut reg = self.lifecycle.registry_write().await;
            let Some(ctx) = reg.phases.get_mut(phase_id) else {
                error!(phase_id = %phase_id, "cannot checkpoint unknown phase");
                return Err(CoordinatorError::not_found(phase_id));
            };
            ctx.checkpoints.push(checkpoint_id.clone());
            ctx.touch();
            let snapshot = ctx.clone();
            self.lifecycle.persist_context(&snapshot, None).await;
            snapshot
        };

        let record = CheckpointRecord {
            checkpoint_id: checkpoint_id.clone(),
            phase_id: phase_id.to_string(),
            created_at: now,
            context: snapshot,
        };
        let type_key = record.context.type_key().to_string();
        let services = self.lifecycle.services();
        match serde_json::to_value(&record) {
            Ok(value) => {
                services
                    .persist(
                        &checkpoint_key(&checkpoint_id),
                        value,
                        StateKind::Checkpoint,
                        Some(json!({"phase_id": phase_id})),
                    )
                    .await;
            }
            Err(e) => warn!(checkpoint_id = %checkpoint_id, error = %e, "failed to serialize checkpoint"),
        }
        self.records
            .write()
            .await
            .insert(checkpoint_id.clone(), record);

        services
            .metric(
                &format!("phase_coordinator:checkpoint_create:{}", type_key),
                1.0,
                Some(json!({
                    "phase_id": phase_id,
                    "checkpoint_id": checkpoint_id,
                    "timestamp": now.to_rfc3339(),
                })),
            )
            .await;
        info!(phase_id = %phase_id, checkpoint_id = %checkpoint_id, "created checkpoint");
        Ok(checkpoint_id)
    }

    /// Raw record, from memory or the state store.
    pub async fn record(&self, checkpoint_id: &str) -> Result<CheckpointRecord, CoordinatorError> {
        if let Some(record) = self.records.read().await.get(checkpoint_id) {
            return Ok(record.clone());
        }
        let Some(value) = self
            .lifecycle
            .services()
            .load(&checkpoint_key(checkpoint_id))
            .await
        else {
            error!(checkpoint_id = %checkpoint_id, "checkpoint not found");
            return Err(CoordinatorError::CheckpointNotFound {
                checkpoint_id: checkpoint_id.to_string(),
            });
        };
        let record: CheckpointRecord = serde_json::from_value(value).map_err(|e| {
            CoordinatorError::Persistence(format!(
                "checkpoint {} is unreadable: {}",
                checkpoint_id, e
            ))
        })?;
        self.records
            .write()
            .await
            .insert(checkpoint_id.to_string(), record.clone());
        Ok(record)
    }

    /// Rebuild the context captured by a checkpoint without touching the
    /// live registry.
    pub async fn restore(&self, checkpoint_id: &str) -> Result<PhaseContext, CoordinatorError> {
        let record = self.record(checkpoint_id).await?;
        let context = record.context;
        let services = self.lifecycle.services();
        services
            .metric(
                &format!("phase_coordinator:checkpoint_restore:{}", context.type_key()),
                1.0,
                Some(json!({
                    "phase_id": context.id,
                    "checkpoint_id": checkpoint_id,
                    "timestamp": Utc::now().to_rfc3339(),
                })),
            )
            .await;
        services
            .emit(
                EventKind::StateChanged,
                json!({
                    "event": "restored",
                    "resource_id": format!("phase:{}", context.id),
                    "state": "restored",
                    "checkpoint_id": checkpoint_id,
                    "restored_state": context.state.as_str(),
                }),
                EventPriority::Normal,
            )
            .await;
        info!(phase_id = %context.id, checkpoint_id = %checkpoint_id, "restored phase from checkpoint");
        Ok(context)
    }

    /// Replace the live phase with the checkpointed one.
    pub async fn rollback(&self, checkpoint_id: &str) -> Result<PhaseContext, CoordinatorError> {
        match self.splice(checkpoint_id).await {
            Ok(ctx) => {
                self.rollback_metric(checkpoint_id, true).await;
                Ok(ctx)
            }
            Err(e) => {
                warn!(checkpoint_id = %checkpoint_id, error = %e, "rollback failed");
                self.rollback_metric(checkpoint_id, false).await;
                Err(e)
            }
        }
    }

    async fn splice(&self, checkpoint_id: &str) -> Result<PhaseContext, CoordinatorError> {
        let ctx = self.restore(checkpoint_id).await?;
        let id = ctx.id.clone();

        if let PhaseType::Custom(custom) = &ctx.phase_type
            && !self.lifecycle.types().contains(&custom.id).await
        {
            warn!(phase_type = %custom.id, "re-registering custom type removed since the checkpoint");
            self.lifecycle.types().restore(custom.clone()).await;
            self.lifecycle.breakers().ensure_breaker(&custom.id).await;
        }

        let mut reg = self.lifecycle.registry_write().await;
        if let Some(parent) = ctx.parent.as_deref()
            && reg.would_cycle(&id, parent)
        {
            return Err(CoordinatorError::InvalidHierarchy {
                phase_id: id,
                reason: format!("parent '{}' would create a cycle", parent),
            });
        }

        let previous = reg.phases.get(&id).cloned();
        let previous_parent = previous.as_ref().and_then(|p| p.parent.clone());
        if let Some(old) = previous_parent.as_deref()
            && ctx.parent.as_deref() != Some(old)
        {
            if let Some(children) = reg.hierarchy.get_mut(old) {
                children.remove(&id);
            }
            if let Some(old_ctx) = reg.phases.get_mut(old) {
                old_ctx.children.remove(&id);
            }
        }
        if let Some(parent) = ctx.parent.as_deref() {
            reg.hierarchy
                .entry(parent.to_string())
                .or_default()
                .insert(id.clone());
            if let Some(parent_ctx) = reg.phases.get_mut(parent) {
                parent_ctx.children.insert(id.clone());
            }
        }
        reg.hierarchy.insert(id.clone(), ctx.children.clone());
        reg.dependencies
            .insert(id.clone(), ctx.dependencies.clone());
        reg.sync_active(&id, ctx.state);
        reg.phases.insert(id.clone(), ctx.clone());

        let previous_state = previous.as_ref().map(|p| p.state);
        self.lifecycle.persist_context(&ctx, previous_state).await;
        let mut details = Map::new();
        details.insert("checkpoint_id".into(), json!(checkpoint_id));
        self.lifecycle
            .emit_state_change(&ctx, previous_state, &details)
            .await;
        drop(reg);

        self.lifecycle
            .services()
            .emit(
                EventKind::StateChanged,
                json!({
                    "event": "rolled_back",
                    "resource_id": format!("phase:{}", id),
                    "state": "rolled_back",
                    "checkpoint_id": checkpoint_id,
                    "restored_state": ctx.state.as_str(),
                    "timestamp": Utc::now().to_rfc3339(),
                }),
                EventPriority::Normal,
            )
            .await;
        info!(phase_id = %id, checkpoint_id = %checkpoint_id, state = %ctx.state, "rolled back phase");
        Ok(ctx)
    }

    async fn rollback_metric(&self, checkpoint_id: &str, success: bool) {
        self.lifecycle
            .services()
            .metric(
                "phase_coordinator:rollback",
                if success { 1.0 } else { 0.0 },
                Some(json!({
                    "checkpoint_id": checkpoint_id,
                    "success": success,
                    "timestamp": Utc::now().to_rfc3339(),
                })),
            )
            .await;
    }

    /// Checkpoint ids held in memory for a phase, oldest first.
    pub async fn checkpoints_for(&self, phase_id: &str) -> Vec<String> {
        let mut records: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.phase_id == phase_id)
            .map(|record| (record.created_at, record.checkpoint_id.clone()))
            .collect();
        records.sort();
        records.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerManager;
    use crate::config::CoordinatorConfig;
    use crate::phase::{PhaseSpec, PhaseState};
    use crate::registry::TypeRegistry;
    use crate::services::InMemoryServices;
    use serde_json::Value;

    fn setup() -> (LifecycleManager, CheckpointManager, InMemoryServices) {
        let mem = InMemoryServices::new();
        let types = TypeRegistry::new();
        let breakers = Arc::new(CircuitBreakerManager::new(
            &CoordinatorConfig::default(),
            types.clone(),
            mem.services(),
        ));
        let lifecycle = LifecycleManager::new(types, breakers, mem.services());
        let checkpoints = CheckpointManager::new(lifecycle.clone());
        (lifecycle, checkpoints, mem)
    }

    #[tokio::test]
    async fn test_create_unknown_phase() {
        let (_, checkpoints, _) = setup();
        let err = checkpoints.create("ghost").await.unwrap_err();
        assert_eq!(err.status_token(), "not_found");
    }

    #[tokio::test]
    async fn test_checkpoint_id_format_and_persistence() {
        let (lifecycle, checkpoints, mem) = setup();
        lifecycle.initialize(PhaseSpec::new("p1", "phase_one")).await.unwrap();

        let id = checkpoints.create("p1").await.unwrap();
        let parts: Vec<&str> = id.rsplitn(3, '_').collect();
        assert!(id.starts_with("checkpoint_p1_"));
        assert_eq!(parts[0].len(), 8);
        assert!(parts[1].parse::<i64>().is_ok());

        let stored = mem.store.entry(&checkpoint_key(&id)).await.unwrap();
        assert_eq!(stored.kind, StateKind::Checkpoint);
        assert_eq!(stored.value["context"]["checkpoints"], json!([id]));
        assert_eq!(
            lifecycle.status("p1").await.unwrap().checkpoints,
            vec![id.clone()]
        );
        assert_eq!(checkpoints.checkpoints_for("p1").await, vec![id]);
        assert_eq!(
            mem.metrics
                .count("phase_coordinator:checkpoint_create:phase_one")
                .await,
            1
        );
    }

    #[tokio::test]
    async fn test_rollback_restores_pre_mutation_status() {
        let (lifecycle, checkpoints, mem) = setup();
        lifecycle.initialize(PhaseSpec::new("p1", "phase_one")).await.unwrap();
        lifecycle
            .initialize(
                PhaseSpec::new("p2", "phase_two")
                    .with_parent("p1")
                    .with_dependencies(["p1"])
                    .with_config(json!({"k": "v"})),
            )
            .await
            .unwrap();
        lifecycle.start("p1", json!({})).await.unwrap();

        let id = checkpoints.create("p2").await.unwrap();
        let before = lifecycle.status("p2").await.unwrap();

        let outcome = lifecycle.start("p2", json!({"x": 1})).await.unwrap();
        assert!(outcome.is_success());

        let restored = checkpoints.rollback(&id).await.unwrap();
        assert_eq!(restored.state, PhaseState::Ready);

        let after = lifecycle.status("p2").await.unwrap();
        assert_eq!(after.state, before.state);
        assert_eq!(after.phase_type, before.phase_type);
        assert_eq!(after.parent, before.parent);
        assert_eq!(after.children, before.children);
        assert_eq!(after.dependencies, before.dependencies);
        assert_eq!(after.config, before.config);
        assert_eq!(after.metrics, before.metrics);
        assert_eq!(after.metadata, before.metadata);
        assert_eq!(after.checkpoints, before.checkpoints);
        assert_eq!(after.started_at, before.started_at);
        assert_eq!(after.completed_at, before.completed_at);
        assert_eq!(after.result, before.result);
        assert_eq!(after.error, before.error);

        let stored = mem.store.entry(&crate::lifecycle::state_key("p2")).await.unwrap();
        assert_eq!(stored.value["state"], "READY");
        assert_eq!(mem.events.events_named("rolled_back").await.len(), 1);
        assert_eq!(mem.metrics.values("phase_coordinator:rollback").await, vec![1.0]);

        // The rolled back phase runs again.
        assert!(lifecycle.start("p2", json!({})).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_rollback_unknown_checkpoint() {
        let (_, checkpoints, mem) = setup();
        let err = checkpoints.rollback("checkpoint_none").await.unwrap_err();
        assert_eq!(err.status_token(), "checkpoint_not_found");
        assert_eq!(mem.metrics.values("phase_coordinator:rollback").await, vec![0.0]);
    }

    #[tokio::test]
    async fn test_restore_falls_back_to_store() {
        let (lifecycle, checkpoints, _) = setup();
        lifecycle.initialize(PhaseSpec::new("p1", "phase_three")).await.unwrap();
        let id = checkpoints.create("p1").await.unwrap();

        let fresh = CheckpointManager::new(lifecycle.clone());
        let ctx = fresh.restore(&id).await.unwrap();
        assert_eq!(ctx.id, "p1");
        assert_eq!(ctx.type_key(), "phase_three");
    }

    #[tokio::test]
    async fn test_rollback_reregisters_custom_type() {
        let (lifecycle, checkpoints, _) = setup();
        lifecycle
            .types()
            .register("phase_custom_eval", "evaluation", Some("phase_two"), Value::Null)
            .await
            .unwrap();
        lifecycle
            .initialize(PhaseSpec::new("e1", "phase_custom_eval"))
            .await
            .unwrap();
        let id = checkpoints.create("e1").await.unwrap();

        lifecycle.types().unregister("phase_custom_eval").await;
        assert!(!lifecycle.types().contains("phase_custom_eval").await);

        checkpoints.rollback(&id).await.unwrap();
        assert!(lifecycle.types().contains("phase_custom_eval").await);
        let status = lifecycle.status("e1").await.unwrap();
        assert_eq!(status.inheritance_chain, vec!["phase_two".to_string()]);
    }
}
