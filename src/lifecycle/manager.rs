//! Phase lifecycle manager.
//!
//! The single owner of the phase registry (contexts, hierarchy index,
//! dependency index, active set). Every write goes through one exclusive
//! lock. The lock is held for the whole of a transition, including
//! persistence, events, metrics and pause/resume hooks, but it is released
//! while a phase body runs so status queries, the watchdog and nested child
//! starts can proceed in the meantime.
//!
//! Handlers and storage code invoked mid-transition must not call back into
//! `start`, `pause`, `resume` or `abort`; that would deadlock on the lock.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

use super::body::{EchoBody, PhaseBody};
use super::handler::TransitionHandler;
use crate::breaker::CircuitBreakerManager;
use crate::errors::{BodyError, CoordinatorError};
use crate::phase::{
    BuiltinPhase, ChildSummary, CustomPhaseType, DeferredOutcome, PhaseContext, PhaseOutcome,
    PhaseSpec, PhaseState, PhaseStatus, PhaseType,
};
use crate::registry::TypeRegistry;
use crate::services::{EventKind, EventPriority, Services, StateKind};

/// State store key of a phase's persisted context.
pub fn state_key(phase_id: &str) -> String {
    format!("phase:{}:state", phase_id)
}

/// Phase registry guarded by the lifecycle lock.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    pub(crate) phases: HashMap<String, PhaseContext>,
    /// parent -> children, including parents not initialized yet
    pub(crate) hierarchy: HashMap<String, BTreeSet<String>>,
    pub(crate) dependencies: HashMap<String, BTreeSet<String>>,
    pub(crate) active: BTreeSet<String>,
}

impl Registry {
    /// Dependencies of `id` that are missing or not COMPLETED, sorted.
    fn blocking_dependencies(&self, id: &str) -> Vec<String> {
        self.dependencies
            .get(id)
            .map(|deps| {
                deps.iter()
                    .filter(|dep| {
                        self.phases
                            .get(dep.as_str())
                            .is_none_or(|ctx| ctx.state != PhaseState::Completed)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether making `parent` the parent of `id` would close a loop.
    pub(crate) fn would_cycle(&self, id: &str, parent: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(parent.to_string());
        while let Some(key) = current.take() {
            if key == id {
                return true;
            }
            if !seen.insert(key.clone()) {
                return true;
            }
            current = self.phases.get(&key).and_then(|ctx| ctx.parent.clone());
        }
        false
    }

    fn child_summaries(&self, id: &str, seen: &mut HashSet<String>) -> Vec<ChildSummary> {
        if !seen.insert(id.to_string()) {
            return Vec::new();
        }
        let Some(ctx) = self.phases.get(id) else {
            return Vec::new();
        };
        ctx.children
            .iter()
            .filter_map(|child_id| {
                let child = self.phases.get(child_id)?;
                Some(ChildSummary {
                    id: child.id.clone(),
                    phase_type: child.type_key().to_string(),
                    state: child.state,
                    children: self.child_summaries(child_id, seen),
                })
            })
            .collect()
    }

    pub(crate) fn sync_active(&mut self, id: &str, state: PhaseState) {
        match state {
            PhaseState::Running | PhaseState::Paused => {
                self.active.insert(id.to_string());
            }
            _ => {
                self.active.remove(id);
            }
        }
    }
}

/// One entry of [`PhaseInfo::active_phases`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivePhaseInfo {
    pub phase_type: String,
    pub state: PhaseState,
    pub started_at: Option<DateTime<Utc>>,
    pub parent: Option<String>,
    pub children: Vec<String>,
}

/// Summary of the registry returned by `current_phase_info`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseInfo {
    pub active_phases: BTreeMap<String, ActivePhaseInfo>,
    pub total_active: usize,
    pub total_phases: usize,
    pub phase_type_counts: BTreeMap<String, usize>,
    pub timestamp: DateTime<Utc>,
}

struct Inner {
    registry: RwLock<Registry>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn TransitionHandler>>>>,
    named_handlers: RwLock<HashMap<String, Arc<dyn TransitionHandler>>>,
    bodies: RwLock<HashMap<String, Arc<dyn PhaseBody>>>,
    default_body: Arc<dyn PhaseBody>,
    types: TypeRegistry,
    breakers: Arc<CircuitBreakerManager>,
    services: Services,
}

/// Cheap-to-clone handle; clones share the same registry.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    pub fn new(
        types: TypeRegistry,
        breakers: Arc<CircuitBreakerManager>,
        services: Services,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(Registry::default()),
                handlers: RwLock::new(HashMap::new()),
                named_handlers: RwLock::new(HashMap::new()),
                bodies: RwLock::new(HashMap::new()),
                default_body: Arc::new(EchoBody),
                types,
                breakers,
                services,
            }),
        }
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.inner.types
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.inner.breakers
    }

    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    pub(crate) async fn registry_write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.inner.registry.write().await
    }

    // =========================================
    // Bodies and handlers
    // =========================================

    /// Body run by phases of `type_key`. Types without one use [`EchoBody`].
    pub async fn register_body(&self, type_key: &str, body: Arc<dyn PhaseBody>) {
        self.inner
            .bodies
            .write()
            .await
            .insert(type_key.to_string(), body);
    }

    async fn body_for(&self, type_key: &str) -> Arc<dyn PhaseBody> {
        self.inner
            .bodies
            .read()
            .await
            .get(type_key)
            .cloned()
            .unwrap_or_else(|| self.inner.default_body.clone())
    }

    /// Attach a handler to a phase. Handlers run in registration order.
    pub async fn register_handler(&self, phase_id: &str, handler: Arc<dyn TransitionHandler>) {
        debug!(phase_id = %phase_id, handler = handler.name(), "registered transition handler");
        self.inner
            .handlers
            .write()
            .await
            .entry(phase_id.to_string())
            .or_default()
            .push(handler);
    }

    /// Make a handler available to `config["handlers"]` by name.
    pub async fn register_named_handler(&self, name: &str, handler: Arc<dyn TransitionHandler>) {
        self.inner
            .named_handlers
            .write()
            .await
            .insert(name.to_string(), handler);
    }

    pub async fn handlers_for(&self, phase_id: &str) -> Vec<Arc<dyn TransitionHandler>> {
        self.inner
            .handlers
            .read()
            .await
            .get(phase_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn attach_named_handlers(&self, phase_id: &str, names: &[String]) {
        for name in names {
            let handler = self.inner.named_handlers.read().await.get(name).cloned();
            match handler {
                Some(handler) => self.register_handler(phase_id, handler).await,
                None => warn!(phase_id = %phase_id, handler = %name, "unknown transition handler"),
            }
        }
    }

    // =========================================
    // Transitions
    // =========================================

    /// Create a phase and move it to READY.
    ///
    /// A parent that does not exist yet is tolerated: the child is recorded
    /// in the hierarchy index and linked when the parent initializes.
    pub async fn initialize(&self, spec: PhaseSpec) -> Result<PhaseContext, CoordinatorError> {
        let id = spec.id.trim().to_string();
        if id.is_empty() {
            return Err(CoordinatorError::InvalidHierarchy {
                phase_id: id,
                reason: "phase id must not be empty".into(),
            });
        }
        let phase_type = self.inner.types.resolve(&spec.phase_type).await?;
        if phase_type.is_custom() {
            self.inner.breakers.ensure_breaker(phase_type.key()).await;
        }
        let dependencies = spec.all_dependencies();
        let handler_names = spec.handler_names();

        let mut reg = self.inner.registry.write().await;
        // The type may have been unregistered since it was resolved.
        if phase_type.is_custom() && !self.inner.types.contains(phase_type.key()).await {
            return Err(CoordinatorError::UnknownPhaseType {
                phase_type: phase_type.key().to_string(),
            });
        }
        if reg.phases.contains_key(&id) {
            warn!(phase_id = %id, "phase already initialized");
            return Err(CoordinatorError::DuplicatePhase { phase_id: id });
        }
        if dependencies.contains(&id) {
            return Err(CoordinatorError::InvalidHierarchy {
                phase_id: id,
                reason: "a phase cannot depend on itself".into(),
            });
        }
        if let Some(parent) = spec.parent.as_deref()
            && reg.would_cycle(&id, parent)
        {
            return Err(CoordinatorError::InvalidHierarchy {
                phase_id: id,
                reason: format!("parent '{}' would create a cycle", parent),
            });
        }

        let mut ctx = PhaseContext::new(id.clone(), phase_type);
        ctx.parent = spec.parent.clone();
        ctx.config = spec.config;
        ctx.metadata = spec.metadata;
        ctx.dependencies = dependencies.clone();
        if let Some(children) = reg.hierarchy.get(&id) {
            ctx.children = children.clone();
        }

        if let Some(parent) = spec.parent.as_deref() {
            reg.hierarchy
                .entry(parent.to_string())
                .or_default()
                .insert(id.clone());
            match reg.phases.get_mut(parent) {
                Some(parent_ctx) => {
                    parent_ctx.children.insert(id.clone());
                    parent_ctx.touch();
                }
                None => warn!(
                    phase_id = %id,
                    parent = %parent,
                    "parent phase not initialized yet, linking child in hierarchy only"
                ),
            }
        }
        reg.dependencies.insert(id.clone(), dependencies);
        reg.phases.insert(id.clone(), ctx);

        self.attach_named_handlers(&id, &handler_names).await;

        let ready = self
            .apply_transition(&mut reg, &id, PhaseState::Ready, Map::new())
            .await?;
        if let Some(parent_ctx) = ready.parent.as_deref().and_then(|p| reg.phases.get(p)) {
            self.persist_context(parent_ctx, None).await;
        }

        let type_key = ready.type_key().to_string();
        self.inner
            .services
            .emit(
                EventKind::StateChanged,
                json!({
                    "event": "initialized",
                    "resource_id": format!("phase:{}", id),
                    "phase_id": id,
                    "phase_type": type_key,
                    "is_custom_type": ready.phase_type.is_custom(),
                    "parent_phase_id": ready.parent,
                    "dependencies": ready.dependencies,
                }),
                EventPriority::Normal,
            )
            .await;
        self.inner
            .services
            .metric(
                &format!("phase_coordinator:initialize:{}", type_key),
                1.0,
                Some(json!({"phase_id": id})),
            )
            .await;

        info!(phase_id = %id, phase_type = %type_key, "initialized phase");
        Ok(ready)
    }

    /// Run a READY phase's body.
    ///
    /// Dependency and breaker refusals are errors; a body failure is a
    /// FAILED outcome.
    pub async fn start(&self, id: &str, input: Value) -> Result<PhaseOutcome, CoordinatorError> {
        let (body, snapshot, permit) = {
            let mut reg = self.inner.registry.write().await;
            let Some(ctx) = reg.phases.get(id) else {
                error!(phase_id = %id, "cannot start unknown phase");
                return Err(CoordinatorError::not_found(id));
            };
            let state = ctx.state;
            let type_key = ctx.type_key().to_string();

            let blocking = reg.blocking_dependencies(id);
            if !blocking.is_empty() {
                warn!(phase_id = %id, ?blocking, "phase has unfulfilled dependencies");
                return Err(CoordinatorError::DependencyUnmet {
                    phase_id: id.to_string(),
                    blocking,
                });
            }
            if state != PhaseState::Ready {
                return Err(CoordinatorError::InvalidTransition {
                    phase_id: id.to_string(),
                    from: state.to_string(),
                    to: PhaseState::Running.to_string(),
                });
            }

            let breaker = self.inner.breakers.breaker_for(&type_key).await;
            let permit = match breaker.acquire() {
                Ok(permit) => permit,
                Err(open) => {
                    error!(
                        phase_id = %id,
                        breaker = %open.name,
                        retry_after_secs = open.retry_after.as_secs(),
                        "circuit breaker open, refusing to start phase"
                    );
                    return Err(open.into());
                }
            };

            let snapshot = self
                .apply_transition(&mut reg, id, PhaseState::Running, Map::new())
                .await?;
            self.inner
                .services
                .metric(
                    &format!("phase_coordinator:phase_start:{}", type_key),
                    1.0,
                    Some(json!({
                        "phase_id": id,
                        "timestamp": snapshot.started_at.map(|t| t.to_rfc3339()),
                    })),
                )
                .await;
            (self.body_for(&type_key).await, snapshot, permit)
        };

        info!(phase_id = %id, phase_type = %snapshot.type_key(), "starting phase body");
        let outcome = body.run(&snapshot, input).await;
        match &outcome {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }

        let mut reg = self.inner.registry.write().await;
        self.settle(&mut reg, id, outcome).await
    }

    /// Apply a body outcome according to where the phase is now.
    async fn settle(
        &self,
        reg: &mut Registry,
        id: &str,
        outcome: Result<Value, BodyError>,
    ) -> Result<PhaseOutcome, CoordinatorError> {
        let ctx = reg
            .phases
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::not_found(id))?;

        match ctx.state {
            PhaseState::Running => self.finish(reg, id, outcome).await,
            PhaseState::Paused => {
                let (succeeded, result, error, error_kind) = split_outcome(outcome);
                ctx.deferred = Some(DeferredOutcome {
                    succeeded,
                    result,
                    error,
                    error_kind,
                    finished_at: Utc::now(),
                });
                ctx.touch();
                let snapshot = ctx.clone();
                self.persist_context(&snapshot, None).await;
                info!(phase_id = %id, "body finished while paused, outcome deferred until resume");
                Ok(PhaseOutcome::from_context(&snapshot))
            }
            PhaseState::Aborted => {
                match outcome {
                    Ok(value) => ctx.result = Some(value),
                    Err(e) => ctx.error = Some(e.to_string()),
                }
                ctx.touch();
                let snapshot = ctx.clone();
                self.persist_context(&snapshot, None).await;
                info!(phase_id = %id, "body finished after abort, state stays ABORTED");
                Ok(PhaseOutcome::from_context(&snapshot))
            }
            other => {
                warn!(phase_id = %id, state = %other, "discarding body outcome for phase no longer running");
                Ok(PhaseOutcome::from_context(ctx))
            }
        }
    }

    /// RUNNING -> COMPLETED or FAILED.
    async fn finish(
        &self,
        reg: &mut Registry,
        id: &str,
        outcome: Result<Value, BodyError>,
    ) -> Result<PhaseOutcome, CoordinatorError> {
        match outcome {
            Ok(value) => {
                if let Some(ctx) = reg.phases.get_mut(id) {
                    ctx.result = Some(value);
                    ctx.error = None;
                }
                let done = self
                    .apply_transition(reg, id, PhaseState::Completed, Map::new())
                    .await?;
                let execution_time = done
                    .elapsed(Utc::now())
                    .map(|d| d.as_secs_f64())
                    .unwrap_or_default();
                self.inner
                    .services
                    .metric(
                        &format!("phase_coordinator:phase_complete:{}", done.type_key()),
                        1.0,
                        Some(json!({"phase_id": id, "execution_time": execution_time})),
                    )
                    .await;
                info!(phase_id = %id, execution_time, "phase completed");
                Ok(PhaseOutcome::from_context(&done))
            }
            Err(e) => {
                let message = e.to_string();
                if let Some(ctx) = reg.phases.get_mut(id) {
                    ctx.error = Some(message.clone());
                }
                let mut details = Map::new();
                details.insert("error".into(), json!(message));
                details.insert("error_type".into(), json!(e.kind));
                let failed = self
                    .apply_transition(reg, id, PhaseState::Failed, details)
                    .await?;
                let execution_time = failed
                    .elapsed(Utc::now())
                    .map(|d| d.as_secs_f64())
                    .unwrap_or_default();
                self.inner
                    .services
                    .metric(
                        &format!("phase_coordinator:phase_error:{}", failed.type_key()),
                        1.0,
                        Some(json!({"phase_id": id, "error": message, "error_type": e.kind})),
                    )
                    .await;
                self.inner
                    .services
                    .emit(
                        EventKind::ErrorOccurred,
                        json!({
                            "event": "phase_failed",
                            "resource_id": format!("phase:{}", id),
                            "error": message,
                            "error_type": e.kind,
                            "execution_time": execution_time,
                        }),
                        EventPriority::High,
                    )
                    .await;
                warn!(phase_id = %id, error = %message, "phase failed");
                Ok(PhaseOutcome::from_context(&failed))
            }
        }
    }

    /// RUNNING -> PAUSED. `on_pause` hook errors are logged only.
    pub async fn pause(&self, id: &str, reason: &str) -> Result<PhaseContext, CoordinatorError> {
        let mut reg = self.inner.registry.write().await;
        let mut details = Map::new();
        details.insert("pause_reason".into(), json!(reason));
        details.insert("pause_time".into(), json!(Utc::now().to_rfc3339()));
        let paused = self
            .apply_transition(&mut reg, id, PhaseState::Paused, details)
            .await
            .inspect_err(|e| warn!(phase_id = %id, error = %e, "cannot pause phase"))?;

        for handler in self.handlers_for(id).await {
            if let Err(e) = handler.on_pause(id, reason, &paused).await {
                error!(phase_id = %id, handler = handler.name(), error = %e, "pause handler failed");
            }
        }
        self.inner
            .services
            .metric(
                &format!("phase_coordinator:phase_pause:{}", paused.type_key()),
                1.0,
                Some(json!({"phase_id": id, "reason": reason})),
            )
            .await;
        info!(phase_id = %id, reason = %reason, "phase paused");
        Ok(paused)
    }

    /// PAUSED -> RUNNING, then apply any deferred body outcome.
    pub async fn resume(&self, id: &str) -> Result<PhaseContext, CoordinatorError> {
        let mut reg = self.inner.registry.write().await;
        let mut details = Map::new();
        details.insert("resume_time".into(), json!(Utc::now().to_rfc3339()));
        let resumed = self
            .apply_transition(&mut reg, id, PhaseState::Running, details)
            .await
            .inspect_err(|e| warn!(phase_id = %id, error = %e, "cannot resume phase"))?;

        for handler in self.handlers_for(id).await {
            if let Err(e) = handler.on_resume(id, &resumed).await {
                error!(phase_id = %id, handler = handler.name(), error = %e, "resume handler failed");
            }
        }
        self.inner
            .services
            .metric(
                &format!("phase_coordinator:phase_resume:{}", resumed.type_key()),
                1.0,
                Some(json!({"phase_id": id})),
            )
            .await;
        info!(phase_id = %id, "phase resumed");

        let deferred = reg.phases.get_mut(id).and_then(|ctx| ctx.deferred.take());
        if let Some(deferred) = deferred {
            self.finish(&mut reg, id, join_outcome(deferred)).await?;
            return reg
                .phases
                .get(id)
                .cloned()
                .ok_or_else(|| CoordinatorError::not_found(id));
        }
        Ok(resumed)
    }

    /// RUNNING or PAUSED -> ABORTED. Only bookkeeping; a running body is not
    /// interrupted.
    pub async fn abort(&self, id: &str, reason: &str) -> Result<PhaseContext, CoordinatorError> {
        let mut reg = self.inner.registry.write().await;
        if let Some(ctx) = reg.phases.get_mut(id)
            && ctx.state == PhaseState::Paused
            && let Some(deferred) = ctx.deferred.take()
        {
            ctx.result = deferred.result;
            if let Some(message) = deferred.error {
                ctx.error = Some(match deferred.error_kind {
                    Some(kind) => format!("{}: {}", kind, message),
                    None => message,
                });
            }
        }

        let mut details = Map::new();
        details.insert("abort_reason".into(), json!(reason));
        details.insert("abort_time".into(), json!(Utc::now().to_rfc3339()));
        let aborted = self
            .apply_transition(&mut reg, id, PhaseState::Aborted, details)
            .await
            .inspect_err(|e| warn!(phase_id = %id, error = %e, "cannot abort phase"))?;

        self.inner
            .services
            .metric(
                &format!("phase_coordinator:phase_abort:{}", aborted.type_key()),
                1.0,
                Some(json!({"phase_id": id, "reason": reason})),
            )
            .await;
        info!(phase_id = %id, reason = %reason, "phase aborted");
        Ok(aborted)
    }

    /// Validate and apply one state change, then persist and announce it.
    pub(crate) async fn apply_transition(
        &self,
        reg: &mut Registry,
        id: &str,
        next: PhaseState,
        details: Map<String, Value>,
    ) -> Result<PhaseContext, CoordinatorError> {
        let ctx = reg
            .phases
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::not_found(id))?;
        let previous = ctx.state;
        if !previous.can_transition_to(next) {
            return Err(CoordinatorError::InvalidTransition {
                phase_id: id.to_string(),
                from: previous.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        ctx.state = next;
        for (key, value) in &details {
            ctx.metadata.insert(key.clone(), value.clone());
        }
        if next == PhaseState::Running && ctx.started_at.is_none() {
            ctx.started_at = Some(now);
        }
        if next.is_terminal() {
            ctx.completed_at = Some(now);
        }
        ctx.updated_at = now;
        let snapshot = ctx.clone();
        reg.sync_active(id, next);

        self.persist_context(&snapshot, Some(previous)).await;
        self.emit_state_change(&snapshot, Some(previous), &details)
            .await;
        debug!(phase_id = %id, from = %previous, to = %next, "phase transition");
        Ok(snapshot)
    }

    /// Write a context under `phase:<id>:state`. Failures are logged only.
    pub(crate) async fn persist_context(
        &self,
        ctx: &PhaseContext,
        previous: Option<PhaseState>,
    ) -> bool {
        let value = match serde_json::to_value(ctx) {
            Ok(value) => value,
            Err(e) => {
                warn!(phase_id = %ctx.id, error = %e, "failed to serialize phase context");
                return false;
            }
        };
        self.inner
            .services
            .persist(
                &state_key(&ctx.id),
                value,
                StateKind::State,
                Some(json!({
                    "update_type": "phase_state_change",
                    "previous_state": previous.map(|s| s.as_str()),
                })),
            )
            .await
    }

    pub(crate) async fn emit_state_change(
        &self,
        ctx: &PhaseContext,
        previous: Option<PhaseState>,
        details: &Map<String, Value>,
    ) {
        let type_key = ctx.type_key();
        let is_custom = ctx.phase_type.is_custom();
        let timestamp = Utc::now().to_rfc3339();

        let mut metadata = Map::new();
        metadata.insert("phase_id".into(), json!(ctx.id));
        metadata.insert("phase_type".into(), json!(type_key));
        metadata.insert("state".into(), json!(ctx.state.as_str()));
        metadata.insert("is_custom_type".into(), json!(is_custom));
        metadata.insert("timestamp".into(), json!(timestamp));
        if let PhaseType::Custom(custom) = &ctx.phase_type {
            metadata.insert(
                "custom_type_info".into(),
                json!({"parent_type": custom.parent_type, "description": custom.description}),
            );
        }
        for (key, value) in details {
            metadata.insert(key.clone(), value.clone());
        }

        let status = match ctx.state {
            PhaseState::Running | PhaseState::Completed => "HEALTHY",
            _ => "DEGRADED",
        };
        self.inner
            .services
            .emit(
                EventKind::HealthChanged,
                json!({
                    "component": format!("phase_{}", ctx.id),
                    "status": status,
                    "description": format!("Phase {} state changed to {}", ctx.id, ctx.state),
                    "metadata": metadata,
                }),
                EventPriority::Normal,
            )
            .await;
        self.inner
            .services
            .emit(
                EventKind::StateChanged,
                json!({
                    "event": "state_changed",
                    "resource_id": format!("phase:{}", ctx.id),
                    "old_state": previous.map(|s| s.as_str()),
                    "new_state": ctx.state.as_str(),
                    "phase_id": ctx.id,
                    "phase_type": type_key,
                    "is_custom_type": is_custom,
                    "timestamp": timestamp,
                }),
                EventPriority::Normal,
            )
            .await;
    }

    // =========================================
    // Queries
    // =========================================

    /// Deep snapshot of one phase.
    pub async fn status(&self, id: &str) -> Result<PhaseStatus, CoordinatorError> {
        let reg = self.inner.registry.read().await;
        let ctx = reg
            .phases
            .get(id)
            .ok_or_else(|| CoordinatorError::not_found(id))?;

        let (custom_type, inheritance_chain) = match &ctx.phase_type {
            PhaseType::Custom(recorded) => {
                let live = self.inner.types.get(&recorded.id).await;
                let chain = match live {
                    Some(_) => self.inner.types.inheritance_chain(&recorded.id).await,
                    None => recorded.parent_type.iter().cloned().collect(),
                };
                (Some(live.unwrap_or_else(|| recorded.clone())), chain)
            }
            PhaseType::Builtin(_) => (None, Vec::new()),
        };

        Ok(PhaseStatus {
            id: ctx.id.clone(),
            phase_type: ctx.type_key().to_string(),
            state: ctx.state,
            parent: ctx.parent.clone(),
            children: reg.child_summaries(id, &mut HashSet::new()),
            dependencies: ctx.dependencies.iter().cloned().collect(),
            custom_type,
            inheritance_chain,
            config: ctx.config.clone(),
            metrics: ctx.metrics.clone(),
            metadata: ctx.metadata.clone(),
            checkpoints: ctx.checkpoints.clone(),
            started_at: ctx.started_at,
            completed_at: ctx.completed_at,
            updated_at: ctx.updated_at,
            elapsed_seconds: ctx.elapsed(Utc::now()).map(|d| d.as_secs_f64()),
            error: ctx.error.clone(),
            result: ctx.result.clone(),
        })
    }

    pub async fn context(&self, id: &str) -> Option<PhaseContext> {
        self.inner.registry.read().await.phases.get(id).cloned()
    }

    /// Every context, sorted by id.
    pub async fn contexts(&self) -> Vec<PhaseContext> {
        let mut all: Vec<_> = self
            .inner
            .registry
            .read()
            .await
            .phases
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Children recorded for `parent_id`, or `None` if the parent is unknown.
    pub async fn children_of(&self, parent_id: &str) -> Option<BTreeSet<String>> {
        self.inner
            .registry
            .read()
            .await
            .phases
            .get(parent_id)
            .map(|ctx| ctx.children.clone())
    }

    pub async fn active_phases(&self) -> Vec<String> {
        self.inner
            .registry
            .read()
            .await
            .active
            .iter()
            .cloned()
            .collect()
    }

    /// Registered phases of `type_key` in any state, sorted.
    pub async fn phases_using_type(&self, type_key: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .registry
            .read()
            .await
            .phases
            .values()
            .filter(|ctx| ctx.type_key() == type_key)
            .map(|ctx| ctx.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Remove a custom type unless a registered phase (terminal ones
    /// included) still carries it. Check and removal share the registry lock.
    pub async fn unregister_type(&self, type_key: &str) -> Result<CustomPhaseType, CoordinatorError> {
        let reg = self.inner.registry.write().await;
        if let Some(phase_id) = reg
            .phases
            .values()
            .filter(|ctx| ctx.type_key() == type_key)
            .map(|ctx| ctx.id.as_str())
            .min()
        {
            return Err(CoordinatorError::TypeInUse {
                phase_type: type_key.to_string(),
                phase_id: phase_id.to_string(),
            });
        }
        self.inner
            .types
            .unregister(type_key)
            .await
            .ok_or_else(|| CoordinatorError::UnknownPhaseType {
                phase_type: type_key.to_string(),
            })
    }

    pub async fn current_phase_info(&self) -> PhaseInfo {
        let reg = self.inner.registry.read().await;
        let active_phases = reg
            .active
            .iter()
            .filter_map(|id| {
                let ctx = reg.phases.get(id)?;
                Some((
                    id.clone(),
                    ActivePhaseInfo {
                        phase_type: ctx.type_key().to_string(),
                        state: ctx.state,
                        started_at: ctx.started_at,
                        parent: ctx.parent.clone(),
                        children: ctx.children.iter().cloned().collect(),
                    },
                ))
            })
            .collect();

        let mut phase_type_counts: BTreeMap<String, usize> = BuiltinPhase::ALL
            .iter()
            .map(|kind| (kind.as_str().to_string(), 0))
            .collect();
        for ctx in reg.phases.values() {
            *phase_type_counts
                .entry(ctx.type_key().to_string())
                .or_default() += 1;
        }

        PhaseInfo {
            active_phases,
            total_active: reg.active.len(),
            total_phases: reg.phases.len(),
            phase_type_counts,
            timestamp: Utc::now(),
        }
    }

    /// Record a nested child's result summary in the parent's metrics map.
    pub async fn record_child_metric(
        &self,
        parent_id: &str,
        child_id: &str,
        entry: Value,
    ) -> Result<(), CoordinatorError> {
        let mut reg = self.inner.registry.write().await;
        let ctx = reg
            .phases
            .get_mut(parent_id)
            .ok_or_else(|| CoordinatorError::not_found(parent_id))?;
        ctx.metrics.insert(format!("child_phase_{}", child_id), entry);
        ctx.touch();
        let snapshot = ctx.clone();
        self.persist_context(&snapshot, None).await;
        Ok(())
    }
}

fn split_outcome(
    outcome: Result<Value, BodyError>,
) -> (bool, Option<Value>, Option<String>, Option<String>) {
    match outcome {
        Ok(value) => (true, Some(value), None, None),
        Err(e) => (false, None, Some(e.message), Some(e.kind)),
    }
}

fn join_outcome(deferred: DeferredOutcome) -> Result<Value, BodyError> {
    if deferred.succeeded {
        Ok(deferred.result.unwrap_or(Value::Null))
    } else {
        Err(BodyError::new(
            deferred.error_kind.unwrap_or_else(|| "error".to_string()),
            deferred.error.unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::config::CoordinatorConfig;
    use crate::errors::HandlerError;
    use crate::lifecycle::body::FnBody;
    use crate::services::InMemoryServices;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn manager() -> (LifecycleManager, InMemoryServices) {
        let mem = InMemoryServices::new();
        let types = TypeRegistry::new();
        let breakers = Arc::new(CircuitBreakerManager::new(
            &CoordinatorConfig::default(),
            types.clone(),
            mem.services(),
        ));
        (LifecycleManager::new(types, breakers, mem.services()), mem)
    }

    fn failing_body(counter: Arc<AtomicUsize>) -> Arc<dyn PhaseBody> {
        Arc::new(FnBody::new(move |_ctx: PhaseContext, _input: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(BodyError::new("runtime", "body exploded"))
            }
        }))
    }

    /// Body that signals `started` and then waits for `gate`.
    fn gated_body(started: Arc<Notify>, gate: Arc<Notify>) -> Arc<dyn PhaseBody> {
        Arc::new(FnBody::new(move |_ctx: PhaseContext, _input: Value| {
            let started = started.clone();
            let gate = gate.clone();
            async move {
                started.notify_one();
                gate.notified().await;
                Ok(json!({"done": true}))
            }
        }))
    }

    #[tokio::test]
    async fn test_initialize_then_status_is_ready() {
        let (manager, mem) = manager();
        for (id, ty) in [("a", "phase_zero"), ("b", "phase_four")] {
            manager.initialize(PhaseSpec::new(id, ty)).await.unwrap();
            let status = manager.status(id).await.unwrap();
            assert_eq!(status.state, PhaseState::Ready);
            assert_eq!(status.phase_type, ty);
        }
        assert!(mem.store.entry(&state_key("a")).await.is_some());
        assert_eq!(mem.events.events_named("initialized").await.len(), 2);
        assert_eq!(mem.metrics.count("phase_coordinator:initialize:phase_zero").await, 1);
    }

    #[tokio::test]
    async fn test_initialize_rejects_duplicates_and_unknown_types() {
        let (manager, _) = manager();
        manager
            .initialize(PhaseSpec::new("p1", "phase_one").with_config(json!({"v": 1})))
            .await
            .unwrap();

        let err = manager
            .initialize(PhaseSpec::new("p1", "phase_two").with_config(json!({"v": 2})))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DuplicatePhase { .. }));
        let status = manager.status("p1").await.unwrap();
        assert_eq!(status.phase_type, "phase_one");
        assert_eq!(status.config["v"], 1);

        let err = manager
            .initialize(PhaseSpec::new("p9", "phase_nine"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownPhaseType { .. }));
        assert!(manager.context("p9").await.is_none());
    }

    #[tokio::test]
    async fn test_start_unknown_phase() {
        let (manager, _) = manager();
        let err = manager.start("ghost", json!({})).await.unwrap_err();
        assert_eq!(err.status_token(), "not_found");
    }

    #[tokio::test]
    async fn test_dependency_gating() {
        let (manager, _) = manager();
        manager.initialize(PhaseSpec::new("p1", "phase_one")).await.unwrap();
        manager
            .initialize(
                PhaseSpec::new("p2", "phase_two")
                    .with_config(json!({"dependencies": ["p1", "p0"]})),
            )
            .await
            .unwrap();

        let err = manager.start("p2", json!({})).await.unwrap_err();
        match err {
            CoordinatorError::DependencyUnmet { blocking, .. } => {
                assert_eq!(blocking, vec!["p0".to_string(), "p1".to_string()])
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(manager.context("p2").await.unwrap().state, PhaseState::Ready);
    }

    #[tokio::test]
    async fn test_start_completes_with_echo_body() {
        let (manager, mem) = manager();
        manager.initialize(PhaseSpec::new("p1", "phase_one")).await.unwrap();
        let outcome = manager.start("p1", json!({"x": 1})).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.result.as_ref().unwrap()["output"]["x"], 1);
        let ctx = manager.context("p1").await.unwrap();
        assert!(ctx.started_at.is_some() && ctx.completed_at.is_some());
        assert!(manager.active_phases().await.is_empty());
        assert_eq!(mem.metrics.count("phase_coordinator:phase_complete:phase_one").await, 1);

        let stored = mem.store.entry(&state_key("p1")).await.unwrap().value;
        assert_eq!(stored["state"], "COMPLETED");

        // Terminal phases cannot be started again.
        let err = manager.start("p1", json!({})).await.unwrap_err();
        assert_eq!(err.status_token(), "invalid_state");
    }

    #[tokio::test]
    async fn test_body_failure_is_an_outcome() {
        let (manager, mem) = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        manager.register_body("phase_one", failing_body(calls.clone())).await;
        manager.initialize(PhaseSpec::new("p1", "phase_one")).await.unwrap();

        let outcome = manager.start("p1", json!({})).await.unwrap();
        assert!(outcome.is_failure());
        assert_eq!(outcome.error.as_deref(), Some("runtime: body exploded"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(mem.events.events_named("phase_failed").await.len(), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_threshold() {
        let (manager, _) = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        manager.register_body("phase_one", failing_body(calls.clone())).await;
        let threshold = CircuitBreakerConfig::default_for("phase_one").failure_threshold as usize;

        for n in 0..=threshold {
            manager
                .initialize(PhaseSpec::new(format!("p{n}"), "phase_one"))
                .await
                .unwrap();
        }
        for n in 0..threshold {
            let outcome = manager.start(&format!("p{n}"), json!({})).await.unwrap();
            assert!(outcome.is_failure());
        }

        let err = manager
            .start(&format!("p{threshold}"), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), threshold);
        assert_eq!(
            manager.context(&format!("p{threshold}")).await.unwrap().state,
            PhaseState::Ready
        );
    }

    #[tokio::test]
    async fn test_out_of_order_hierarchy_is_reconciled() {
        let (manager, _) = manager();
        manager
            .initialize(PhaseSpec::new("child", "phase_two").with_parent("parent"))
            .await
            .unwrap();
        manager.initialize(PhaseSpec::new("parent", "phase_one")).await.unwrap();

        let status = manager.status("parent").await.unwrap();
        assert_eq!(status.children.len(), 1);
        assert_eq!(status.children[0].id, "child");
        assert_eq!(
            manager.children_of("parent").await.unwrap().into_iter().collect::<Vec<_>>(),
            vec!["child".to_string()]
        );
    }

    #[tokio::test]
    async fn test_parent_cycle_rejected() {
        let (manager, _) = manager();
        manager
            .initialize(PhaseSpec::new("a", "phase_one").with_parent("b"))
            .await
            .unwrap();
        let err = manager
            .initialize(PhaseSpec::new("b", "phase_one").with_parent("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidHierarchy { .. }));

        let err = manager
            .initialize(PhaseSpec::new("c", "phase_one").with_parent("c"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidHierarchy { .. }));
    }

    #[tokio::test]
    async fn test_pause_resume_abort_rules() {
        let (manager, _) = manager();
        manager.initialize(PhaseSpec::new("p1", "phase_one")).await.unwrap();

        let err = manager.pause("p1", "too early").await.unwrap_err();
        assert_eq!(err.status_token(), "invalid_state");
        let err = manager.abort("p1", "too early").await.unwrap_err();
        assert_eq!(err.status_token(), "invalid_state");
        let err = manager.resume("ghost").await.unwrap_err();
        assert_eq!(err.status_token(), "not_found");
    }

    #[tokio::test]
    async fn test_pause_during_body_defers_outcome() {
        let (manager, mem) = manager();
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        manager
            .register_body("phase_one", gated_body(started.clone(), gate.clone()))
            .await;
        manager.initialize(PhaseSpec::new("p1", "phase_one")).await.unwrap();

        let runner = manager.clone();
        let handle = tokio::spawn(async move { runner.start("p1", json!({})).await });
        started.notified().await;

        let paused = manager.pause("p1", "operator").await.unwrap();
        assert_eq!(paused.metadata["pause_reason"], "operator");
        assert_eq!(manager.active_phases().await, vec!["p1".to_string()]);

        gate.notify_one();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.state, PhaseState::Paused);
        assert!(manager.context("p1").await.unwrap().deferred.is_some());

        let resumed = manager.resume("p1").await.unwrap();
        assert_eq!(resumed.state, PhaseState::Completed);
        assert_eq!(resumed.result.unwrap()["done"], true);
        assert!(resumed.deferred.is_none());
        assert_eq!(mem.metrics.count("phase_coordinator:phase_resume:phase_one").await, 1);
    }

    #[tokio::test]
    async fn test_abort_during_body_keeps_aborted() {
        let (manager, _) = manager();
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        manager
            .register_body("phase_three", gated_body(started.clone(), gate.clone()))
            .await;
        manager.initialize(PhaseSpec::new("p3", "phase_three")).await.unwrap();

        let runner = manager.clone();
        let handle = tokio::spawn(async move { runner.start("p3", json!({})).await });
        started.notified().await;

        manager.abort("p3", "cancelled").await.unwrap();
        gate.notify_one();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.state, PhaseState::Aborted);
        assert_eq!(outcome.result.unwrap()["done"], true);
        assert!(manager.active_phases().await.is_empty());
    }

    struct FailingPauseHook {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TransitionHandler for FailingPauseHook {
        fn name(&self) -> &str {
            "failing_pause"
        }

        async fn on_pause(
            &self,
            _phase_id: &str,
            _reason: &str,
            _context: &PhaseContext,
        ) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::new("failing_pause", "hook down"))
        }
    }

    #[tokio::test]
    async fn test_pause_hook_error_does_not_block() {
        let (manager, _) = manager();
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        manager
            .register_body("phase_one", gated_body(started.clone(), gate.clone()))
            .await;
        manager
            .register_named_handler(
                "failing_pause",
                Arc::new(FailingPauseHook {
                    calls: calls.clone(),
                }),
            )
            .await;
        manager
            .initialize(
                PhaseSpec::new("p1", "phase_one")
                    .with_config(json!({"handlers": ["failing_pause", "missing"]})),
            )
            .await
            .unwrap();
        assert_eq!(manager.handlers_for("p1").await.len(), 1);

        let runner = manager.clone();
        let handle = tokio::spawn(async move { runner.start("p1", json!({})).await });
        started.notified().await;

        let paused = manager.pause("p1", "hook test").await.unwrap();
        assert_eq!(paused.state, PhaseState::Paused);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        manager.abort("p1", "done").await.unwrap();
        gate.notify_one();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_current_phase_info_and_child_metric() {
        let (manager, mem) = manager();
        manager.initialize(PhaseSpec::new("p1", "phase_one")).await.unwrap();
        manager
            .initialize(PhaseSpec::new("c1", "phase_two").with_parent("p1"))
            .await
            .unwrap();

        let info = manager.current_phase_info().await;
        assert_eq!(info.total_phases, 2);
        assert_eq!(info.total_active, 0);
        assert_eq!(info.phase_type_counts["phase_one"], 1);
        assert_eq!(info.phase_type_counts["phase_zero"], 0);

        manager
            .record_child_metric("p1", "c1", json!({"status": "completed"}))
            .await
            .unwrap();
        let status = manager.status("p1").await.unwrap();
        assert_eq!(status.metrics["child_phase_c1"]["status"], "completed");
        let stored = mem.store.entry(&state_key("p1")).await.unwrap().value;
        assert_eq!(stored["metrics"]["child_phase_c1"]["status"], "completed");

        assert_eq!(manager.phases_using_type("phase_two").await, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_unregister_type_counts_terminal_phases() {
        let (manager, _) = manager();
        manager
            .types()
            .register("phase_audited", "audit trail", None, Value::Null)
            .await
            .unwrap();
        manager
            .initialize(PhaseSpec::new("done", "phase_audited"))
            .await
            .unwrap();
        manager.start("done", json!({})).await.unwrap();
        assert_eq!(manager.context("done").await.unwrap().state, PhaseState::Completed);

        let err = manager.unregister_type("phase_audited").await.unwrap_err();
        assert_eq!(err.status_token(), "type_in_use");
        assert_eq!(manager.phases_using_type("phase_audited").await, vec!["done".to_string()]);
        assert!(manager.types().contains("phase_audited").await);

        let err = manager.unregister_type("phase_absent").await.unwrap_err();
        assert_eq!(err.status_token(), "unknown_phase_type");
    }

    #[tokio::test]
    async fn test_initialize_rejects_unregistered_type() {
        let (manager, _) = manager();
        manager
            .types()
            .register("phase_gone", "", None, Value::Null)
            .await
            .unwrap();
        manager.unregister_type("phase_gone").await.unwrap();
        let err = manager
            .initialize(PhaseSpec::new("late", "phase_gone"))
            .await
            .unwrap_err();
        assert_eq!(err.status_token(), "unknown_phase_type");
        assert!(manager.context("late").await.is_none());
    }
}
