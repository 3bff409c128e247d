//! Parent -> child invocation protocol.
//!
//! A nested execution validates the parent/child link, resolves a timeout,
//! runs `before_start` hooks (parent's handlers, then the child's), starts
//! the child behind the shared `transition` breaker, then either runs
//! `after_completion` hooks in reverse or offers the failure to each
//! handler's `on_failure`. Every step lands in the execution's progress log.
//!
//! Records live in a map shared with the watchdog. A record leaves
//! `pending` exactly once, either here or when the watchdog orphans it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::execution::{
    AlertLevel, ExecutionStatus, ExecutionSummary, NestedPhaseExecution, Priority, ProgressEntry,
};
use super::timeouts::resolve_timeout;
use crate::breaker::BreakerPermit;
use crate::config::NestedConfig;
use crate::errors::CoordinatorError;
use crate::lifecycle::{FailureContext, LifecycleManager, TransitionHandler};
use crate::phase::PhaseContext;
use crate::services::{EventKind, EventPriority};

/// A request to run `child_id` on behalf of `parent_id`.
#[derive(Debug, Clone)]
pub struct NestedRequest {
    pub parent_id: String,
    pub child_id: String,
    pub input: Value,
    /// Overrides the per-type default
    pub timeout_secs: Option<u64>,
    pub priority: Priority,
    pub metadata: Option<Value>,
}

impl NestedRequest {
    pub fn new(parent_id: impl Into<String>, child_id: impl Into<String>, input: Value) -> Self {
        Self {
            parent_id: parent_id.into(),
            child_id: child_id.into(),
            input,
            timeout_secs: None,
            priority: Priority::Normal,
            metadata: None,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Watchdog verdict on one pending execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Assessment {
    Quiet,
    Alert { level: AlertLevel, percent: f64 },
    Expired,
}

/// Something a sweep changed or raised.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepFinding {
    Alert {
        execution: NestedPhaseExecution,
        level: AlertLevel,
        percent: f64,
    },
    Orphaned {
        execution: NestedPhaseExecution,
    },
}

struct Tracked {
    record: NestedPhaseExecution,
    orphaned: CancellationToken,
}

/// Why a child produced no result.
struct ChildFailure {
    message: String,
    error_type: String,
    /// Typed error from `start`, surfaced when nothing recovers
    cause: Option<CoordinatorError>,
    /// The hand-off itself broke rather than the child
    transition_fault: bool,
}

impl ChildFailure {
    fn settle(&self, permit: BreakerPermit) {
        if self.transition_fault {
            permit.failure();
        } else {
            permit.success();
        }
    }
}

enum Raced<T> {
    Finished(T),
    Orphaned,
}

/// Error message recorded when the watchdog gives up on an execution.
pub fn orphan_message(record: &NestedPhaseExecution) -> String {
    format!(
        "Execution orphaned - timed out after {} minutes. Health checks: {}, Progress updates: {}",
        record.timeout_secs / 60,
        record.health_checks.len(),
        record.progress.len()
    )
}

#[derive(Clone)]
pub struct NestedExecutionCoordinator {
    lifecycle: LifecycleManager,
    config: Arc<NestedConfig>,
    executions: Arc<RwLock<HashMap<String, Tracked>>>,
    sequence: Arc<AtomicU64>,
}

impl NestedExecutionCoordinator {
    pub fn new(lifecycle: LifecycleManager, config: NestedConfig) -> Self {
        Self {
            lifecycle,
            config: Arc::new(config),
            executions: Arc::new(RwLock::new(HashMap::new())),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &NestedConfig {
        &self.config
    }

    fn next_execution_id(&self, parent_id: &str, child_id: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        format!(
            "{}_to_{}_{}_{}",
            parent_id,
            child_id,
            Utc::now().timestamp(),
            seq
        )
    }

    /// Run a child phase for its parent.
    ///
    /// Returns the (possibly rewritten or recovered) child result. Fails
    /// without creating a record when the parent is unknown or the child is
    /// not one of its children.
    pub async fn coordinate(&self, request: NestedRequest) -> Result<Value, CoordinatorError> {
        let NestedRequest {
            parent_id,
            child_id,
            input,
            timeout_secs,
            priority,
            metadata,
        } = request;

        let children = self
            .lifecycle
            .children_of(&parent_id)
            .await
            .ok_or_else(|| CoordinatorError::not_found(&parent_id))?;
        if !children.contains(&child_id) {
            warn!(parent_id = %parent_id, child_id = %child_id, "nested start on a phase that is not a child");
            return Err(CoordinatorError::NotAChild {
                parent_id,
                child_id,
            });
        }
        let parent = self
            .lifecycle
            .context(&parent_id)
            .await
            .ok_or_else(|| CoordinatorError::not_found(&parent_id))?;
        let child = self
            .lifecycle
            .context(&child_id)
            .await
            .ok_or_else(|| CoordinatorError::not_found(&child_id))?;

        let timeout = match timeout_secs {
            Some(secs) => secs,
            None => self.default_timeout(&child).await,
        };
        let execution_id = self.next_execution_id(&parent_id, &child_id);
        let orphaned = CancellationToken::new();

        let mut record = NestedPhaseExecution::new(
            execution_id.clone(),
            parent_id.clone(),
            child_id.clone(),
            timeout,
            priority,
        );
        if let Some(metadata) = &metadata {
            record.metadata = Some(metadata.clone());
            record.record(ProgressEntry::new("metadata", "recorded").with("metadata", metadata.clone()));
        }
        self.executions.write().await.insert(
            execution_id.clone(),
            Tracked {
                record,
                orphaned: orphaned.clone(),
            },
        );

        let services = self.lifecycle.services();
        services
            .metric(
                "phase_transition",
                1.0,
                Some(json!({
                    "parent_phase": parent_id,
                    "child_phase": child_id,
                    "execution_id": execution_id,
                    "priority": priority.as_str(),
                    "timeout_seconds": timeout,
                })),
            )
            .await;

        let mut input = enhance_input(input, &parent, &execution_id, timeout);
        self.progress(&execution_id, ProgressEntry::new("context_prepared", "in_progress"))
            .await;
        services
            .metric(
                "phase_coordinator:nested_execution_start",
                1.0,
                Some(json!({
                    "parent_phase_id": parent_id,
                    "parent_phase_type": parent.type_key(),
                    "child_phase_id": child_id,
                    "child_phase_type": child.type_key(),
                    "execution_id": execution_id,
                    "priority": priority.as_str(),
                    "timeout_seconds": timeout,
                })),
            )
            .await;
        info!(
            execution_id = %execution_id,
            parent_id = %parent_id,
            child_id = %child_id,
            timeout_secs = timeout,
            "starting nested execution"
        );

        let mut handlers = self.lifecycle.handlers_for(&parent_id).await;
        handlers.extend(self.lifecycle.handlers_for(&child_id).await);
        self.progress(
            &execution_id,
            ProgressEntry::new("handlers", "executing").with("count", handlers.len()),
        )
        .await;

        for (i, handler) in handlers.iter().enumerate() {
            let n = i + 1;
            match handler.before_start(&child_id, &input).await {
                Ok(rewritten) => {
                    input = rewritten;
                    self.progress(
                        &execution_id,
                        ProgressEntry::new(format!("handler_{}", n), "completed")
                            .with("handler", handler.name()),
                    )
                    .await;
                }
                Err(e) => {
                    error!(
                        execution_id = %execution_id,
                        handler = handler.name(),
                        error = %e,
                        "transition handler failed before child start"
                    );
                    self.progress(
                        &execution_id,
                        ProgressEntry::new(format!("handler_{}_error", n), "failed")
                            .with("handler", handler.name())
                            .with("error", e.to_string()),
                    )
                    .await;
                }
            }
        }

        let transition = self.lifecycle.breakers().transition().await;
        let permit = match transition.acquire() {
            Ok(permit) => permit,
            Err(open) => {
                error!(
                    parent_id = %parent_id,
                    child_id = %child_id,
                    "transition circuit breaker open"
                );
                self.finalize(
                    &execution_id,
                    ExecutionStatus::Failed,
                    None,
                    Some(open.to_string()),
                    Some(ProgressEntry::new("circuit_open", "failed")),
                )
                .await;
                return Err(open.into());
            }
        };

        if orphaned.is_cancelled() {
            permit.failure();
            return Err(self.orphaned_error(&execution_id).await);
        }

        self.progress(&execution_id, ProgressEntry::new("child_phase_starting", "starting"))
            .await;
        let started = Instant::now();
        let lifecycle = self.lifecycle.clone();
        let start_child = child_id.clone();
        let child_input = input.clone();
        let mut task = tokio::spawn(async move { lifecycle.start(&start_child, child_input).await });

        let raced = tokio::select! {
            joined = &mut task => Raced::Finished(joined),
            _ = orphaned.cancelled() => Raced::Orphaned,
        };
        let joined = match raced {
            Raced::Finished(joined) => joined,
            Raced::Orphaned => {
                permit.failure();
                let err = self.orphaned_error(&execution_id).await;
                warn!(execution_id = %execution_id, "stopped waiting for orphaned child");
                return Err(err);
            }
        };
        let execution_time = started.elapsed().as_secs_f64();

        let attempt = match joined {
            Ok(Ok(outcome)) if outcome.is_success() => Ok(outcome.result.unwrap_or(Value::Null)),
            Ok(Ok(outcome)) => Err(ChildFailure {
                message: outcome.error.unwrap_or_else(|| {
                    format!("child phase {} ended in state {}", child_id, outcome.state)
                }),
                error_type: "execution_failed".to_string(),
                cause: None,
                transition_fault: false,
            }),
            Ok(Err(e)) => Err(ChildFailure {
                message: e.to_string(),
                error_type: e.status_token().to_string(),
                cause: Some(e),
                transition_fault: false,
            }),
            Err(e) => Err(ChildFailure {
                message: format!("child task failed: {}", e),
                error_type: "task_failed".to_string(),
                cause: None,
                transition_fault: true,
            }),
        };

        match attempt {
            Ok(mut result) => {
                self.progress(
                    &execution_id,
                    ProgressEntry::new("child_phase_completed", "completed")
                        .with("execution_time_seconds", execution_time),
                )
                .await;
                self.progress(
                    &execution_id,
                    ProgressEntry::new("post_handlers", "executing").with("count", handlers.len()),
                )
                .await;
                for (i, handler) in handlers.iter().rev().enumerate() {
                    let n = i + 1;
                    match handler.after_completion(&child_id, &result).await {
                        Ok(rewritten) => {
                            result = rewritten;
                            self.progress(
                                &execution_id,
                                ProgressEntry::new(format!("post_handler_{}", n), "completed")
                                    .with("handler", handler.name()),
                            )
                            .await;
                        }
                        Err(e) => {
                            error!(
                                execution_id = %execution_id,
                                handler = handler.name(),
                                error = %e,
                                "completion handler failed"
                            );
                            self.progress(
                                &execution_id,
                                ProgressEntry::new(format!("post_handler_{}_error", n), "failed")
                                    .with("handler", handler.name())
                                    .with("error", e.to_string()),
                            )
                            .await;
                        }
                    }
                }

                if let Err(e) = self
                    .lifecycle
                    .record_child_metric(
                        &parent_id,
                        &child_id,
                        json!({
                            "status": "completed",
                            "execution_id": execution_id,
                            "execution_time_seconds": execution_time,
                            "timestamp": Utc::now().to_rfc3339(),
                        }),
                    )
                    .await
                {
                    warn!(parent_id = %parent_id, error = %e, "failed to record child metric");
                }

                let Some(done) = self
                    .finalize(
                        &execution_id,
                        ExecutionStatus::Completed,
                        Some(result.clone()),
                        None,
                        Some(
                            ProgressEntry::new("completion", "success")
                                .with("execution_time_seconds", execution_time),
                        ),
                    )
                    .await
                else {
                    permit.failure();
                    return Err(self.orphaned_error(&execution_id).await);
                };
                permit.success();

                services
                    .metric(
                        "phase_coordinator:nested_execution_complete",
                        1.0,
                        Some(json!({
                            "parent_phase_id": parent_id,
                            "child_phase_id": child_id,
                            "execution_id": execution_id,
                            "execution_time": done.elapsed_secs(Utc::now()),
                            "priority": priority.as_str(),
                            "progress_steps_count": done.progress.len(),
                        })),
                    )
                    .await;
                info!(execution_id = %execution_id, execution_time, "nested execution completed");
                Ok(result)
            }
            Err(failure) => {
                let message = failure.message.clone();
                let error_type = failure.error_type.clone();
                self.progress(
                    &execution_id,
                    ProgressEntry::new("execution_error", "failed")
                        .with("error", message.clone())
                        .with("error_type", error_type.clone()),
                )
                .await;
                let history = self.progress_of(&execution_id).await;
                services
                    .metric(
                        "phase_coordinator:nested_execution_failed",
                        1.0,
                        Some(json!({
                            "parent_phase_id": parent_id,
                            "child_phase_id": child_id,
                            "execution_id": execution_id,
                            "error": message,
                            "error_type": error_type,
                            "execution_time": execution_time,
                            "priority": priority.as_str(),
                            "progress_steps_count": history.len(),
                            "last_progress_step": history.last().map(|entry| entry.step.clone()),
                        })),
                    )
                    .await;

                let failure_context = FailureContext {
                    execution_id: execution_id.clone(),
                    parent_id: parent_id.clone(),
                    child_id: child_id.clone(),
                    input,
                    error: message.clone(),
                    progress: history,
                };
                self.progress(&execution_id, ProgressEntry::new("recovery_attempt", "attempting"))
                    .await;

                if let Some(recovered) = self
                    .attempt_recovery(&execution_id, &child_id, &message, &failure_context, &handlers)
                    .await
                {
                    let strategy = recovered
                        .get("strategy")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    if self
                        .finalize(
                            &execution_id,
                            ExecutionStatus::Recovered,
                            Some(recovered.clone()),
                            None,
                            Some(
                                ProgressEntry::new("recovery_succeeded", "success")
                                    .with("strategy", strategy.clone()),
                            ),
                        )
                        .await
                        .is_none()
                    {
                        permit.failure();
                        return Err(self.orphaned_error(&execution_id).await);
                    }
                    failure.settle(permit);
                    services
                        .metric(
                            "phase_recovery",
                            1.0,
                            Some(json!({
                                "parent_phase": parent_id,
                                "child_phase": child_id,
                                "execution_id": execution_id,
                                "recovery_strategy": strategy,
                                "original_error": message,
                            })),
                        )
                        .await;
                    info!(execution_id = %execution_id, strategy = %strategy, "nested execution recovered");
                    return Ok(recovered);
                }

                let finalized = self
                    .finalize(
                        &execution_id,
                        ExecutionStatus::Failed,
                        None,
                        Some(message.clone()),
                        Some(
                            ProgressEntry::new("recovery_failed", "failed").with(
                                "message",
                                "All recovery handlers failed or no suitable handler found",
                            ),
                        ),
                    )
                    .await;
                let Some(failed) = finalized else {
                    permit.failure();
                    return Err(self.orphaned_error(&execution_id).await);
                };
                failure.settle(permit);

                services
                    .emit(
                        EventKind::ErrorOccurred,
                        json!({
                            "event": "nested_execution_failed",
                            "resource_id": format!("nested_execution:{}", execution_id),
                            "error": message,
                            "error_type": "unrecoverable_execution_failure",
                            "parent_phase": parent_id,
                            "child_phase": child_id,
                            "execution_history": failed.progress,
                            "execution_time": failed.elapsed_secs(Utc::now()),
                        }),
                        EventPriority::High,
                    )
                    .await;
                warn!(execution_id = %execution_id, error = %message, "nested execution failed");
                Err(failure.cause.unwrap_or(CoordinatorError::ExecutionFailure {
                    execution_id,
                    child_id,
                    message,
                }))
            }
        }
    }

    /// Offer the failure to each handler in order; the first value wins.
    async fn attempt_recovery(
        &self,
        execution_id: &str,
        child_id: &str,
        message: &str,
        failure: &FailureContext,
        handlers: &[Arc<dyn TransitionHandler>],
    ) -> Option<Value> {
        for (i, handler) in handlers.iter().enumerate() {
            let n = i + 1;
            match handler.on_failure(child_id, message, failure).await {
                Ok(Some(value)) => {
                    self.progress(
                        execution_id,
                        ProgressEntry::new(format!("recovery_handler_{}", n), "succeeded")
                            .with("handler", handler.name())
                            .with(
                                "strategy",
                                value.get("strategy").cloned().unwrap_or(json!("unknown")),
                            ),
                    )
                    .await;
                    return Some(value);
                }
                Ok(None) => {
                    self.progress(
                        execution_id,
                        ProgressEntry::new(format!("recovery_handler_{}", n), "no_recovery")
                            .with("handler", handler.name()),
                    )
                    .await;
                }
                Err(e) => {
                    error!(execution_id = %execution_id, handler = handler.name(), error = %e, "recovery handler failed");
                    self.progress(
                        execution_id,
                        ProgressEntry::new(format!("recovery_handler_{}_error", n), "failed")
                            .with("handler", handler.name())
                            .with("error", e.to_string()),
                    )
                    .await;
                }
            }
        }
        None
    }

    async fn default_timeout(&self, child: &PhaseContext) -> u64 {
        let key = child.type_key();
        let types = self.lifecycle.types();
        if types.resolve(key).await.is_err() {
            return resolve_timeout(&self.config, None, &[]);
        }
        let chain = types.inheritance_chain(key).await;
        resolve_timeout(&self.config, Some(key), &chain)
    }

    async fn progress(&self, execution_id: &str, entry: ProgressEntry) {
        if let Some(tracked) = self.executions.write().await.get_mut(execution_id)
            && tracked.record.is_pending()
        {
            tracked.record.record(entry);
        }
    }

    async fn progress_of(&self, execution_id: &str) -> Vec<ProgressEntry> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .map(|tracked| tracked.record.progress.clone())
            .unwrap_or_default()
    }

    /// Leave `pending` with `status`. `None` if something else got there first.
    async fn finalize(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<String>,
        entry: Option<ProgressEntry>,
    ) -> Option<NestedPhaseExecution> {
        let mut executions = self.executions.write().await;
        let tracked = executions.get_mut(execution_id)?;
        if !tracked.record.is_pending() {
            return None;
        }
        if let Some(entry) = entry {
            tracked.record.record(entry);
        }
        tracked
            .record
            .finalize(status, result, error, Utc::now())
            .then(|| tracked.record.clone())
    }

    async fn orphaned_error(&self, execution_id: &str) -> CoordinatorError {
        let message = self
            .executions
            .read()
            .await
            .get(execution_id)
            .and_then(|tracked| tracked.record.error.clone())
            .unwrap_or_else(|| "execution orphaned".to_string());
        CoordinatorError::OrphanedExecution {
            execution_id: execution_id.to_string(),
            message,
        }
    }

    /// Health-check every pending execution against `assess`.
    ///
    /// Alerts are reported once per level; expired executions are failed
    /// with an orphan message and their waiting caller is released.
    pub async fn sweep_pending<F>(&self, now: DateTime<Utc>, assess: F) -> Vec<SweepFinding>
    where
        F: Fn(&NestedPhaseExecution, DateTime<Utc>) -> Assessment,
    {
        let mut executions = self.executions.write().await;
        let mut ids: Vec<String> = executions
            .iter()
            .filter(|(_, tracked)| tracked.record.is_pending())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();

        let mut findings = Vec::new();
        for id in ids {
            let Some(tracked) = executions.get_mut(&id) else {
                continue;
            };
            tracked.record.health_checks.push(now);
            match assess(&tracked.record, now) {
                Assessment::Quiet => {}
                Assessment::Alert { level, percent } => {
                    if tracked.record.alert_level.is_none_or(|current| current < level) {
                        tracked.record.alert_level = Some(level);
                        findings.push(SweepFinding::Alert {
                            execution: tracked.record.clone(),
                            level,
                            percent,
                        });
                    }
                }
                Assessment::Expired => {
                    let message = orphan_message(&tracked.record);
                    if tracked
                        .record
                        .finalize(ExecutionStatus::Failed, None, Some(message), now)
                    {
                        tracked.orphaned.cancel();
                        findings.push(SweepFinding::Orphaned {
                            execution: tracked.record.clone(),
                        });
                    }
                }
            }
        }
        findings
    }

    pub async fn execution(&self, execution_id: &str) -> Option<NestedPhaseExecution> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .map(|tracked| tracked.record.clone())
    }

    /// All records, oldest first.
    pub async fn executions(&self) -> Vec<NestedPhaseExecution> {
        let mut all: Vec<_> = self
            .executions
            .read()
            .await
            .values()
            .map(|tracked| tracked.record.clone())
            .collect();
        all.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        all
    }

    pub async fn summary(&self) -> ExecutionSummary {
        let mut summary = ExecutionSummary::default();
        for tracked in self.executions.read().await.values() {
            summary.count(tracked.record.status);
        }
        summary
    }

    /// Drop finished records that ended before `older_than`. Pending records
    /// are kept regardless of age. Returns how many were removed.
    pub async fn prune_finished(&self, older_than: DateTime<Utc>) -> usize {
        let mut executions = self.executions.write().await;
        let before = executions.len();
        executions.retain(|_, tracked| {
            tracked.record.is_pending()
                || tracked
                    .record
                    .ended_at
                    .is_none_or(|ended| ended >= older_than)
        });
        let pruned = before - executions.len();
        if pruned > 0 {
            info!(pruned, "pruned finished nested executions");
        }
        pruned
    }
}

/// Merge the parent's context and execution details into the child input.
fn enhance_input(input: Value, parent: &PhaseContext, execution_id: &str, timeout: u64) -> Value {
    let mut object = match input {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other);
            map
        }
    };
    object.insert(
        "parent_context".to_string(),
        json!({
            "phase_id": parent.id,
            "phase_type": parent.type_key(),
            "execution_context": parent
                .config
                .get("execution_context")
                .cloned()
                .unwrap_or_else(|| json!({})),
        }),
    );
    object.insert("execution_id".to_string(), json!(execution_id));
    object.insert("timeout_seconds".to_string(), json!(timeout));
    Value::Object(object)
}
